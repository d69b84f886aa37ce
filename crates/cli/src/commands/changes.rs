use anyhow::Result;
use colored::Colorize;
use virtuous_shared::ChangeLedgerEntry;

use super::{confirm, print_json, with_spinner};
use crate::client::VirtuousClient;
use crate::output;

pub async fn list(client: &VirtuousClient, limit: usize, json_mode: bool) -> Result<()> {
    let body = with_spinner(json_mode, "Loading change ledger...", client.get_changes(limit)).await?;
    if json_mode {
        return print_json(&body);
    }

    let entries: Vec<ChangeLedgerEntry> =
        serde_json::from_value(body["changes"].clone()).unwrap_or_default();
    let summary = &body["summary"];

    output::print_header("Change Ledger");
    output::print_ledger_table(&entries);
    println!();
    println!(
        "  {} {} tracked ({} optimizations, {} rollbacks), {}% successful",
        "Summary:".dimmed(),
        summary["total_changes_tracked"],
        summary["optimizations"],
        summary["rollbacks"],
        summary["success_rate"],
    );
    print_rollback_availability(summary);
    println!();
    Ok(())
}

fn print_rollback_availability(summary: &serde_json::Value) {
    match summary["rollback_target"].as_str() {
        Some(target) if summary["rollback_available"].as_bool() == Some(true) => {
            println!("  {} next rollback reverts {}", "Rollback:".dimmed(), target.bold());
        }
        _ => println!("  {} {}", "Rollback:".dimmed(), "nothing to roll back".dimmed()),
    }
}

pub async fn rollback(
    client: &VirtuousClient,
    cycle_id: Option<&str>,
    yes: bool,
    json_mode: bool,
) -> Result<()> {
    if !yes && !json_mode {
        let what = cycle_id.map_or_else(
            || "the most recent optimization".to_string(),
            |id| format!("cycle {id}"),
        );
        println!();
        println!("  {} This pushes the inverse of {what} to production.", "⚠".yellow().bold());
        if !confirm("Roll back?")? {
            println!("  Cancelled.");
            return Ok(());
        }
    }

    let body = with_spinner(json_mode, "Rolling back...", client.rollback(cycle_id)).await?;
    if json_mode {
        return print_json(&body);
    }

    println!(
        "  {} Reverted {} (config v{})",
        "✓".green().bold(),
        body["reverted_cycle_id"].as_str().unwrap_or("-").bold(),
        body["config_version"],
    );
    if let Ok(changes) =
        serde_json::from_value::<Vec<virtuous_shared::ConfigurationChange>>(body["changes"].clone())
    {
        for c in changes {
            println!(
                "      {}.{}: {} → {}",
                c.component,
                c.key(),
                c.before,
                c.after
            );
        }
    }
    print_rollback_availability(&body["summary"]);
    Ok(())
}

pub async fn clear(client: &VirtuousClient, yes: bool, json_mode: bool) -> Result<()> {
    if !yes && !json_mode {
        println!();
        println!(
            "  {}",
            "⚠  Ledger history will be discarded; deployed settings stay live.".yellow()
        );
        println!("  Cleared entries can no longer be rolled back.");
        if !confirm("Clear history?")? {
            println!("  Cancelled.");
            return Ok(());
        }
    }

    let body = client.clear_history().await?;
    if json_mode {
        return print_json(&body);
    }
    println!(
        "  {} Cleared {} ledger entries",
        "✓".green().bold(),
        body["cleared"]
    );
    Ok(())
}
