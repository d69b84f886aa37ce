use anyhow::Result;
use colored::Colorize;
use virtuous_shared::Alert;

use super::{print_json, with_spinner};
use crate::cli::AlertsCommand;
use crate::client::VirtuousClient;
use crate::output;

pub async fn run(client: &VirtuousClient, cmd: AlertsCommand, json_mode: bool) -> Result<()> {
    match cmd {
        AlertsCommand::List { limit, unresolved } => {
            let body = with_spinner(
                json_mode,
                "Loading alerts...",
                client.get_alerts(limit, unresolved),
            )
            .await?;
            if json_mode {
                return print_json(&body);
            }
            let alerts: Vec<Alert> = serde_json::from_value(body["alerts"].clone()).unwrap_or_default();
            output::print_header("Quality Alerts");
            output::print_alerts_table(&alerts);
            println!();
            println!(
                "  {} {} unresolved of {}",
                "Total:".dimmed(),
                body["unresolved"],
                body["total"]
            );
            Ok(())
        }
        AlertsCommand::Resolve { id } => {
            let body = client.resolve_alert(&id).await?;
            if json_mode {
                return print_json(&body);
            }
            println!("  {} Alert {} resolved", "✓".green().bold(), id.bold());
            Ok(())
        }
    }
}
