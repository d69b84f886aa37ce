pub mod alerts;
pub mod changes;
pub mod config_cmd;
pub mod cycles;
pub mod learning;
pub mod settings;
pub mod status;

use anyhow::Result;
use dialoguer::{theme::ColorfulTheme, Confirm};

use crate::cli::*;
use crate::client::VirtuousClient;
use crate::config::CliConfig;
use crate::output;

pub async fn dispatch(cli: Cli) -> Result<()> {
    let config = CliConfig::load()?;
    let client = VirtuousClient::new(&config);

    match cli.command {
        Commands::Status => status::run(&client, cli.json).await,
        Commands::Changes { limit } => changes::list(&client, limit, cli.json).await,
        Commands::Trigger { component, reason } => {
            cycles::trigger(&client, &component, reason.as_deref(), cli.json).await
        }
        Commands::Rollback { cycle, yes } => {
            changes::rollback(&client, cycle.as_deref(), yes, cli.json).await
        }
        Commands::ClearHistory { yes } => changes::clear(&client, yes, cli.json).await,
        Commands::Cycles { limit } => cycles::list(&client, limit, cli.json).await,
        Commands::Alerts(cmd) => alerts::run(&client, cmd, cli.json).await,
        Commands::Learning { component } => {
            learning::run(&client, component.as_deref(), cli.json).await
        }
        Commands::Settings(cmd) => settings::run(&client, cmd, cli.json).await,
        Commands::Config(cmd) => config_cmd::run(cmd, &config),
    }
}

/// Interactive yes/no, defaulting to no.
pub(crate) fn confirm(prompt: &str) -> Result<bool> {
    Ok(Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("  {prompt}"))
        .default(false)
        .interact()?)
}

/// Runs `fut` behind a spinner unless JSON output was requested.
pub(crate) async fn with_spinner<T>(
    json_mode: bool,
    msg: &str,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    let sp = if json_mode { None } else { Some(output::spinner(msg)) };
    let result = fut.await;
    if let Some(sp) = sp {
        sp.finish_and_clear();
    }
    result
}

pub(crate) fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
