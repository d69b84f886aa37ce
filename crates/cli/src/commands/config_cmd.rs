use anyhow::Result;
use colored::Colorize;

use crate::cli::ConfigCommand;
use crate::config::{CliConfig, API_KEY_ENV, URL_ENV};

pub fn run(cmd: ConfigCommand, config: &CliConfig) -> Result<()> {
    match cmd {
        ConfigCommand::Show => show(config),
        ConfigCommand::Set { key, value } => set(&key, &value),
    }
}

fn show(config: &CliConfig) -> Result<()> {
    let path = CliConfig::path()?;

    println!();
    println!("  {}", "Configuration".bold());
    println!("  {}", "─".repeat(36).dimmed());
    println!("  {}   {}", "file:".dimmed(), path.display());
    println!("  {}    {}", "url:".dimmed(), config.url);
    println!(
        "  {}",
        format!(
            "api_key: {}",
            config
                .masked_api_key()
                .unwrap_or_else(|| "(not set)".dimmed().to_string())
        )
        .dimmed()
    );
    println!();

    for var in [URL_ENV, API_KEY_ENV] {
        if std::env::var(var).is_ok() {
            println!("  {} {var} environment variable is active", "ℹ".blue());
        }
    }

    Ok(())
}

fn set(key: &str, value: &str) -> Result<()> {
    CliConfig::set(key, value)?;

    println!(
        "  {} {key} = {}",
        "✓".green().bold(),
        if key == "api_key" {
            "***".to_string()
        } else {
            value.to_string()
        }
    );
    Ok(())
}
