use anyhow::{Context, Result};
use colored::Colorize;
use virtuous_shared::{ComponentSettings, SettingValue};

use super::{print_json, with_spinner};
use crate::cli::SettingsCommand;
use crate::client::VirtuousClient;
use crate::output;

pub async fn run(client: &VirtuousClient, cmd: SettingsCommand, json_mode: bool) -> Result<()> {
    match cmd {
        SettingsCommand::Show { component } => show(client, component.as_deref(), json_mode).await,
        SettingsCommand::Set {
            component,
            kind,
            value,
            reason,
        } => {
            let setting = parse_setting(&kind, &value)?;
            let body = client.set_live_config(&component, &setting, &reason).await?;
            if json_mode {
                return print_json(&body);
            }
            println!(
                "  {} {}.{} = {} (config v{}, cycle {})",
                "✓".green().bold(),
                component,
                setting.key(),
                setting,
                body["config_version"],
                body["cycle_id"].as_str().unwrap_or("-").dimmed(),
            );
            Ok(())
        }
    }
}

async fn show(client: &VirtuousClient, component: Option<&str>, json_mode: bool) -> Result<()> {
    let body = with_spinner(
        json_mode,
        "Loading live configuration...",
        client.get_live_config(component),
    )
    .await?;
    if json_mode {
        return print_json(&body);
    }

    output::print_header(&format!("Live Configuration v{}", body["version"]));
    match component {
        Some(id) => {
            let settings: ComponentSettings = serde_json::from_value(body["settings"].clone())
                .context("Unexpected settings payload")?;
            print_settings(id, &settings);
        }
        None => {
            let defaults: ComponentSettings = serde_json::from_value(body["defaults"].clone())
                .context("Unexpected defaults payload")?;
            print_settings("(defaults)", &defaults);
            if let Some(components) = body["components"].as_object() {
                for (id, raw) in components {
                    if let Ok(settings) = serde_json::from_value::<ComponentSettings>(raw.clone()) {
                        print_settings(id, &settings);
                    }
                }
            }
        }
    }
    println!();
    Ok(())
}

fn print_settings(label: &str, settings: &ComponentSettings) {
    println!("  {}", label.bold());
    println!("      {}        {}", "model:".dimmed(), settings.model);
    println!("      {}  {}", "temperature:".dimmed(), settings.temperature);
    println!("      {}      {}s", "timeout:".dimmed(), settings.timeout_secs);
    println!(
        "      {}       {}",
        "prompt:".dimmed(),
        SettingValue::SystemPrompt(settings.system_prompt.clone())
    );
}

/// `kind` uses the wire names of the setting tags.
pub fn parse_setting(kind: &str, value: &str) -> Result<SettingValue> {
    let setting = match kind {
        "system_prompt" | "prompt" => SettingValue::SystemPrompt(value.to_string()),
        "temperature" => SettingValue::Temperature(
            value
                .parse()
                .with_context(|| format!("temperature must be a number, got '{value}'"))?,
        ),
        "model" => SettingValue::Model(value.to_string()),
        "timeout_secs" | "timeout" => SettingValue::TimeoutSecs(
            value
                .trim_end_matches('s')
                .parse()
                .with_context(|| format!("timeout must be whole seconds, got '{value}'"))?,
        ),
        other => anyhow::bail!(
            "Unknown setting kind: {other}. Valid kinds: system_prompt, temperature, model, timeout_secs"
        ),
    };
    setting.validate()?;
    Ok(setting)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_setting_kinds() {
        assert_eq!(
            parse_setting("temperature", "0.4").unwrap(),
            SettingValue::Temperature(0.4)
        );
        assert_eq!(
            parse_setting("timeout", "45s").unwrap(),
            SettingValue::TimeoutSecs(45)
        );
        assert_eq!(
            parse_setting("model", "gpt-4o").unwrap(),
            SettingValue::Model("gpt-4o".to_string())
        );
    }

    #[test]
    fn test_parse_setting_rejects_bad_input() {
        assert!(parse_setting("temperature", "warm").is_err());
        assert!(parse_setting("temperature", "3.5").is_err());
        assert!(parse_setting("top_p", "0.9").is_err());
    }
}
