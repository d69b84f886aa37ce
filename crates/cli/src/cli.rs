use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "virtuous",
    about = "Virtuous Cycle - LLM quality monitoring and optimization CLI",
    version,
    propagate_version = true
)]
pub struct Cli {
    /// Output raw JSON (for scripting/piping)
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show monitoring state and per-component health
    Status,

    /// Show recent ledger entries and rollback availability
    Changes {
        /// Number of entries to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Force an optimization cycle for a component
    Trigger {
        /// Component ID
        component: String,
        /// Reason recorded with the cycle
        #[arg(long)]
        reason: Option<String>,
    },

    /// Revert a deployed optimization (defaults to the most recent one)
    Rollback {
        /// Cycle ID to revert
        #[arg(long)]
        cycle: Option<String>,
        /// Skip confirmation prompt
        #[arg(long, short = 'y')]
        yes: bool,
    },

    /// Empty the change ledger view (live configuration is kept)
    ClearHistory {
        /// Skip confirmation prompt
        #[arg(long, short = 'y')]
        yes: bool,
    },

    /// Show recent optimization cycles
    Cycles {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Quality alerts
    #[command(subcommand)]
    Alerts(AlertsCommand),

    /// Show learned strategy patterns
    Learning {
        /// Restrict to one component
        #[arg(long)]
        component: Option<String>,
    },

    /// Inspect or override the live model configuration
    #[command(subcommand)]
    Settings(SettingsCommand),

    /// Manage CLI configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand)]
pub enum AlertsCommand {
    /// List recent alerts
    List {
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Only unresolved alerts
        #[arg(long)]
        unresolved: bool,
    },
    /// Mark an alert resolved
    Resolve {
        /// Alert ID
        id: String,
    },
}

#[derive(Subcommand)]
pub enum SettingsCommand {
    /// Show the live configuration (or one component's effective settings)
    Show {
        #[arg(long)]
        component: Option<String>,
    },
    /// Override one setting of a component
    Set {
        /// Component ID
        component: String,
        /// Setting kind (system_prompt, temperature, model, timeout_secs)
        kind: String,
        /// New value
        value: String,
        /// Reason recorded in the ledger
        #[arg(long, default_value = "operator override")]
        reason: String,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Key name (url, api_key)
        key: String,
        /// Value to set
        value: String,
    },
}
