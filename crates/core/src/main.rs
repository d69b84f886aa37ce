use clap::Parser;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env from CWD, falling back to the executable's directory.
    if dotenvy::dotenv().is_err() {
        if let Ok(exe) = std::env::current_exe() {
            if let Some(dir) = exe.parent() {
                let _ = dotenvy::from_path(dir.join(".env"));
            }
        }
    }
    init_tracing();

    let cli = virtuous_core::cli::Cli::parse();
    match cli.command {
        None => virtuous_core::run_server().await,
        Some(cmd) => virtuous_core::cli::dispatch(cmd).await,
    }
}
