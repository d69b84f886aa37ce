use anyhow::Result;
use colored::Colorize;
use virtuous_shared::OptimizationCycle;

use super::{print_json, with_spinner};
use crate::client::VirtuousClient;
use crate::output;

pub async fn trigger(
    client: &VirtuousClient,
    component: &str,
    reason: Option<&str>,
    json_mode: bool,
) -> Result<()> {
    let body = client.trigger(component, reason).await?;
    if json_mode {
        return print_json(&body);
    }
    println!(
        "  {} Cycle {} started for {}",
        "✓".green().bold(),
        body["cycle_id"].as_str().unwrap_or("-").bold(),
        component
    );
    println!(
        "      Follow progress with: {}",
        "virtuous cycles".dimmed()
    );
    Ok(())
}

pub async fn list(client: &VirtuousClient, limit: usize, json_mode: bool) -> Result<()> {
    let body = with_spinner(json_mode, "Loading cycles...", client.get_cycles(limit)).await?;
    if json_mode {
        return print_json(&body);
    }

    let cycles: Vec<OptimizationCycle> =
        serde_json::from_value(body["cycles"].clone()).unwrap_or_default();
    let in_flight: Vec<String> =
        serde_json::from_value(body["in_flight"].clone()).unwrap_or_default();

    output::print_header("Optimization Cycles");
    if !in_flight.is_empty() {
        println!("  {} {}", "In flight:".cyan(), in_flight.join(", "));
    }
    output::print_cycles_table(&cycles);
    println!();
    Ok(())
}
