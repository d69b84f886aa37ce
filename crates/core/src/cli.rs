use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser)]
#[command(
    name = "virtuous_server",
    version = env!("CARGO_PKG_VERSION"),
    about = "Virtuous Cycle - LLM quality monitoring and self-healing optimization engine"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the engine and HTTP API (default)
    Serve,
    /// Apply database migrations and exit
    Migrate,
    /// Print recent audit log entries
    Audit {
        /// Number of entries to show
        #[arg(long, short = 'n', default_value_t = 20)]
        limit: i64,
    },
    /// Print version information
    Version,
}

pub async fn dispatch(cmd: Commands) -> anyhow::Result<()> {
    match cmd {
        Commands::Serve => crate::run_server().await,
        Commands::Migrate => {
            let config = crate::config::AppConfig::load()?;
            crate::open_database(&config.database_url).await?;
            info!("✅ Migrations applied to {}", config.database_url);
            Ok(())
        }
        Commands::Audit { limit } => {
            let config = crate::config::AppConfig::load()?;
            let pool = crate::open_database(&config.database_url).await?;
            let entries = crate::db::query_audit_logs(&pool, limit.clamp(1, 1000)).await?;
            if entries.is_empty() {
                println!("No audit entries.");
            }
            for entry in entries {
                println!(
                    "{}  {:<18} {:<8} {:<24} {}",
                    entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    entry.event_type,
                    entry.result,
                    entry.target_id.as_deref().unwrap_or("-"),
                    entry.reason
                );
            }
            Ok(())
        }
        Commands::Version => {
            println!("Virtuous Cycle Engine v{}", env!("CARGO_PKG_VERSION"));
            println!("Shared SDK v{}", virtuous_shared::SDK_VERSION);
            Ok(())
        }
    }
}
