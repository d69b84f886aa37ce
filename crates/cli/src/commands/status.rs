use anyhow::Result;
use colored::Colorize;

use super::{print_json, with_spinner};
use crate::client::VirtuousClient;
use crate::output;

pub async fn run(client: &VirtuousClient, json_mode: bool) -> Result<()> {
    let status = with_spinner(json_mode, "Fetching engine status...", client.get_status()).await?;

    if json_mode {
        return print_json(&status);
    }

    let monitoring = &status["monitoring"];
    let thresholds = &status["thresholds"];
    let u64_of = |key: &str| monitoring.get(key).and_then(|v| v.as_u64()).unwrap_or(0);
    let in_flight = monitoring
        .get("cycles_in_flight")
        .and_then(|v| v.as_array())
        .map_or(0, Vec::len);

    output::print_header("Virtuous Cycle Status");

    println!("  {}  {}", "Endpoint:".dimmed(), client.base_url());
    println!(
        "  {}    {} in flight (max {}), optimizer {}",
        "Cycles:".dimmed(),
        if in_flight > 0 {
            in_flight.to_string().cyan().to_string()
        } else {
            "0".to_string()
        },
        u64_of("max_concurrent_cycles"),
        monitoring
            .get("optimizer")
            .and_then(|v| v.as_str())
            .unwrap_or("-")
            .dimmed(),
    );
    let unresolved = u64_of("unresolved_alerts");
    println!(
        "  {}    {} unresolved",
        "Alerts:".dimmed(),
        if unresolved > 0 {
            unresolved.to_string().red().bold().to_string()
        } else {
            "0".green().to_string()
        },
    );
    println!(
        "  {}    v{}  (uptime {}m)",
        "Config:".dimmed(),
        u64_of("config_version"),
        u64_of("uptime_secs") / 60,
    );
    println!(
        "  {} critical < {} ≤ warning < {} ≤ target < {} ≤ excellent",
        "Tiers:".dimmed(),
        thresholds["critical"],
        thresholds["warning"],
        thresholds["target"],
    );
    let pending = u64_of("pending_writes");
    if pending > 0 {
        println!(
            "  {} {} writes waiting to be persisted",
            "⚠".yellow(),
            pending
        );
    }

    output::print_header("Components");
    let components = status
        .get("components")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    output::print_components_table(&components);
    println!();

    Ok(())
}
