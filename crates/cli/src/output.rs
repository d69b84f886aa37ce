use colored::Colorize;
use comfy_table::{presets::NOTHING, ContentArrangement, Table};
use virtuous_shared::{
    Alert, AlertSeverity, ChangeLedgerEntry, CycleStatus, LearningPattern, LedgerEntryType,
    OptimizationCycle,
};

/// Print a decorated section header.
pub fn print_header(title: &str) {
    let line = "─".repeat(36);
    println!();
    println!("  {}", title.bold());
    println!("  {}", line.dimmed());
}

fn plain_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(NOTHING)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

/// Health dot: ● healthy, ◐ warning, ○ critical, ↻ optimizing, ◌ cooling down.
pub fn health_dot(health: &str) -> String {
    match health {
        "healthy" => "●".green().to_string(),
        "warning" => "◐".yellow().to_string(),
        "critical" => "○".red().bold().to_string(),
        "optimizing" => "↻".cyan().to_string(),
        "in_cooldown" => "◌".blue().to_string(),
        _ => "·".dimmed().to_string(),
    }
}

fn trend_arrow(trend: &str) -> String {
    match trend {
        "up" => "↑".green().to_string(),
        "down" => "↓".red().to_string(),
        _ => "→".dimmed().to_string(),
    }
}

/// Per-component rows of `GET /status`.
pub fn print_components_table(components: &[serde_json::Value]) {
    if components.is_empty() {
        println!("  {}", "No components observed yet.".dimmed());
        return;
    }

    let mut table = plain_table();
    for c in components {
        let str_of = |key: &str| c.get(key).and_then(|v| v.as_str()).unwrap_or("-").to_string();
        let health = str_of("health");
        let score = c
            .get("latest_score")
            .and_then(|v| v.as_f64())
            .map_or_else(|| "-".to_string(), |s| format!("{s:.3}"));
        let cooldown = c
            .get("cooldown_remaining_secs")
            .and_then(|v| v.as_i64())
            .map_or_else(String::new, |s| format!("cooldown {}m", (s + 59) / 60));

        table.add_row(vec![
            format!("  {}", health_dot(&health)),
            str_of("component_id").bold().to_string(),
            score,
            format!("{} {}", str_of("tier"), trend_arrow(&str_of("trend"))),
            health.clone(),
            str_of("model_id").dimmed().to_string(),
            cooldown.dimmed().to_string(),
        ]);
    }
    println!("{table}");
}

pub fn print_ledger_table(entries: &[ChangeLedgerEntry]) {
    if entries.is_empty() {
        println!("  {}", "Ledger is empty.".dimmed());
        return;
    }

    let mut table = plain_table();
    for entry in entries {
        let outcome = if entry.success {
            "✓".green().to_string()
        } else {
            "✗".red().to_string()
        };
        let kind = match entry.entry_type {
            LedgerEntryType::Optimization => "optimization".cyan().to_string(),
            LedgerEntryType::Rollback => "rollback".magenta().to_string(),
        };
        let changes = entry
            .changes
            .iter()
            .map(|c| {
                format!(
                    "{}.{}: {} → {}",
                    c.component,
                    c.key(),
                    c.before,
                    c.after
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        table.add_row(vec![
            format!("  {outcome}"),
            entry.timestamp.format("%Y-%m-%d %H:%M").to_string().dimmed().to_string(),
            kind,
            entry.cycle_id.clone(),
            changes,
        ]);
    }
    println!("{table}");
}

pub fn print_cycles_table(cycles: &[OptimizationCycle]) {
    if cycles.is_empty() {
        println!("  {}", "No cycles recorded.".dimmed());
        return;
    }

    let mut table = plain_table();
    for cycle in cycles {
        let status = match cycle.status {
            CycleStatus::Success => "success".green().to_string(),
            CycleStatus::Failure => "failure".red().to_string(),
            CycleStatus::Discarded => "discarded".yellow().to_string(),
            CycleStatus::Pending => "pending".dimmed().to_string(),
        };
        table.add_row(vec![
            format!("  {}", cycle.started_at.format("%m-%d %H:%M")),
            cycle.component_id.clone().bold().to_string(),
            status,
            format!("+{:.1}% @ {:.0}%", cycle.improvement_pct, cycle.confidence_pct),
            cycle.strategy_tag.clone().unwrap_or_default().dimmed().to_string(),
            cycle.error.clone().unwrap_or_default().dimmed().to_string(),
        ]);
    }
    println!("{table}");
}

pub fn print_alerts_table(alerts: &[Alert]) {
    if alerts.is_empty() {
        println!("  {}", "No alerts.".dimmed());
        return;
    }

    let mut table = plain_table();
    for alert in alerts {
        let severity = match alert.severity {
            AlertSeverity::Critical => alert.severity.to_string().red().bold().to_string(),
            AlertSeverity::High => alert.severity.to_string().red().to_string(),
            AlertSeverity::Medium => alert.severity.to_string().yellow().to_string(),
            AlertSeverity::Low => alert.severity.to_string().dimmed().to_string(),
        };
        let state = if alert.resolved {
            "resolved".dimmed().to_string()
        } else {
            "open".to_string()
        };
        table.add_row(vec![
            format!("  {severity}"),
            alert.created_at.format("%m-%d %H:%M").to_string(),
            alert.message.clone(),
            state,
            alert.id.clone().dimmed().to_string(),
        ]);
    }
    println!("{table}");
}

pub fn print_patterns_table(patterns: &[LearningPattern]) {
    if patterns.is_empty() {
        println!("  {}", "Nothing learned yet.".dimmed());
        return;
    }

    let mut table = plain_table();
    for p in patterns {
        table.add_row(vec![
            format!("  {}", p.context.clone().bold()),
            p.strategy_tag.clone(),
            format!("{:.0}%", p.confidence * 100.0),
            format!(
                "{} / {}",
                p.success_count.to_string().green(),
                p.failure_count.to_string().red()
            ),
            p.last_applied_at
                .map(|t| t.format("%Y-%m-%d").to_string())
                .unwrap_or_default()
                .dimmed()
                .to_string(),
        ]);
    }
    println!("{table}");
}

/// Create a styled spinner with a message.
pub fn spinner(msg: &str) -> indicatif::ProgressBar {
    let pb = indicatif::ProgressBar::new_spinner();
    let style = indicatif::ProgressStyle::default_spinner()
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"])
        .template("  {spinner} {msg}")
        .unwrap_or_else(|_| indicatif::ProgressStyle::default_spinner());
    pb.set_style(style);
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(80));
    pb
}
