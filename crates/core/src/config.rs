use anyhow::Context;
use axum::http::HeaderValue;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use virtuous_shared::{ComponentSettings, MAX_TEMPERATURE, MAX_TIMEOUT_SECS};

use crate::cycle::{CycleConfig, TriggerPolicy};
use crate::learning::LearningConfig;
use crate::quality::{AlertConfig, ThresholdConfig};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// Returns the directory containing the running executable.
/// Falls back to CWD if the exe path cannot be determined.
#[must_use]
pub fn exe_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(std::path::Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn parse_var<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("Failed to parse {}", name)),
        Err(_) => Ok(default),
    }
}

fn optional_var(name: &str) -> Option<String> {
    env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[derive(Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub port: u16,
    pub bind_address: String,
    pub cors_origins: Vec<HeaderValue>,
    pub api_key: Option<String>,
    pub threshold: ThresholdConfig,
    pub alerts: AlertConfig,
    pub cycle: CycleConfig,
    pub learning: LearningConfig,
    pub ledger_capacity: usize,
    /// Per-IP budget for `/trigger` and `/rollback`.
    pub operator_rate_per_min: u32,
    pub optimizer_url: Option<String>,
    pub telemetry_url: Option<String>,
    pub telemetry_poll_secs: u64,
    pub config_push_url: Option<String>,
    pub default_settings: ComponentSettings,
    pub fallback_models: Vec<String>,
}

impl AppConfig {
    #[allow(clippy::too_many_lines)]
    pub fn load() -> anyhow::Result<Self> {
        let database_url = env::var("DATABASE_URL").unwrap_or_else(|_| {
            let db_path = exe_dir().join("data").join("virtuous.db");
            format!("sqlite:{}?mode=rwc", db_path.display())
        });

        let api_key = optional_var("VIRTUOUS_API_KEY");
        if let Some(ref key) = api_key {
            if key.len() < 32 {
                tracing::warn!("VIRTUOUS_API_KEY is shorter than recommended minimum (32 chars)");
            }
        }

        let port_str = env::var("PORT").unwrap_or_else(|_| "8090".to_string());
        let port = port_str.parse::<u16>().map_err(|_| {
            anyhow::anyhow!(
                "Invalid PORT value '{}': must be an integer between 1 and 65535",
                port_str
            )
        })?;
        if port == 0 {
            anyhow::bail!("Invalid PORT value '0': must be between 1 and 65535");
        }

        // Loopback unless explicitly widened.
        let bind_address = match env::var("BIND_ADDRESS") {
            Ok(addr) => {
                addr.parse::<std::net::IpAddr>().with_context(|| {
                    format!(
                        "Invalid BIND_ADDRESS '{}': must be a valid IP address (e.g., '127.0.0.1' or '::1')",
                        addr
                    )
                })?;
                addr
            }
            Err(_) => "127.0.0.1".to_string(),
        };

        let cors_origins_str = env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:5173,http://127.0.0.1:5173".to_string());
        let cors_origins: Vec<HeaderValue> = cors_origins_str
            .split(',')
            .filter_map(|s| {
                let trimmed = s.trim();
                if !trimmed.starts_with("http://") && !trimmed.starts_with("https://") {
                    tracing::warn!(
                        "Skipping CORS origin with invalid scheme '{}': must be http:// or https://",
                        trimmed
                    );
                    return None;
                }
                match trimmed.parse::<HeaderValue>() {
                    Ok(v) => Some(v),
                    Err(e) => {
                        tracing::warn!("Skipping invalid CORS origin '{}': {}", trimmed, e);
                        None
                    }
                }
            })
            .collect();

        // ── Threshold monitor ──
        let defaults = ThresholdConfig::default();
        let threshold = ThresholdConfig {
            critical: parse_var("TIER_CRITICAL", defaults.critical)?,
            warning: parse_var("TIER_WARNING", defaults.warning)?,
            target: parse_var("TIER_TARGET", defaults.target)?,
            window_size: parse_var("MONITOR_WINDOW_SIZE", defaults.window_size)?,
            min_samples: parse_var("MONITOR_MIN_SAMPLES", defaults.min_samples)?,
            slope_threshold: parse_var("TREND_SLOPE_THRESHOLD", defaults.slope_threshold)?,
            trend_unit_secs: parse_var("TREND_UNIT_SECS", defaults.trend_unit_secs)?,
            variance_ceiling: parse_var("VARIANCE_CEILING", defaults.variance_ceiling)?,
        };
        threshold.validate().context("Invalid threshold configuration")?;

        // ── Alerts ──
        let defaults = AlertConfig::default();
        let alerts = AlertConfig {
            cooldown_mins: parse_var("ALERT_COOLDOWN_MINS", defaults.cooldown_mins)?,
            history_size: parse_var("ALERT_HISTORY_SIZE", defaults.history_size)?,
            sink_timeout_secs: parse_var("ALERT_SINK_TIMEOUT_SECS", defaults.sink_timeout_secs)?,
            log_path: optional_var("ALERT_LOG_PATH"),
            webhook_url: optional_var("ALERT_WEBHOOK_URL"),
        };
        if alerts.cooldown_mins < 0 || alerts.cooldown_mins > 24 * 60 {
            anyhow::bail!(
                "ALERT_COOLDOWN_MINS must be between 0 and 1440 (got {})",
                alerts.cooldown_mins
            );
        }
        if alerts.history_size == 0 {
            anyhow::bail!("ALERT_HISTORY_SIZE must be at least 1");
        }
        if alerts.sink_timeout_secs == 0 || alerts.sink_timeout_secs > 60 {
            anyhow::bail!(
                "ALERT_SINK_TIMEOUT_SECS must be between 1 and 60 (got {})",
                alerts.sink_timeout_secs
            );
        }

        // ── Optimization cycles ──
        let defaults = CycleConfig::default();
        let cycle = CycleConfig {
            max_concurrent: parse_var("MAX_CONCURRENT_CYCLES", defaults.max_concurrent)?,
            cooldown_secs: parse_var("CYCLE_COOLDOWN_SECS", defaults.cooldown_secs)?,
            deploy_threshold_pct: parse_var("DEPLOY_THRESHOLD_PCT", defaults.deploy_threshold_pct)?,
            confidence_threshold_pct: parse_var(
                "CONFIDENCE_THRESHOLD_PCT",
                defaults.confidence_threshold_pct,
            )?,
            optimizer_timeout_secs: parse_var(
                "OPTIMIZER_TIMEOUT_SECS",
                defaults.optimizer_timeout_secs,
            )?,
            trigger_policy: match optional_var("CYCLE_TRIGGER_POLICY") {
                Some(raw) => TriggerPolicy::parse(&raw).ok_or_else(|| {
                    anyhow::anyhow!("CYCLE_TRIGGER_POLICY must be 'any' or 'degraded' (got '{}')", raw)
                })?,
                None => defaults.trigger_policy,
            },
            ..defaults
        };
        if cycle.max_concurrent == 0 || cycle.max_concurrent > 64 {
            anyhow::bail!(
                "MAX_CONCURRENT_CYCLES must be between 1 and 64 (got {})",
                cycle.max_concurrent
            );
        }
        if cycle.cooldown_secs < 0 {
            anyhow::bail!("CYCLE_COOLDOWN_SECS must not be negative (got {})", cycle.cooldown_secs);
        }
        if !(0.0..=100.0).contains(&cycle.confidence_threshold_pct) {
            anyhow::bail!(
                "CONFIDENCE_THRESHOLD_PCT must be between 0 and 100 (got {})",
                cycle.confidence_threshold_pct
            );
        }
        if !cycle.deploy_threshold_pct.is_finite() {
            anyhow::bail!("DEPLOY_THRESHOLD_PCT must be a finite number");
        }
        if cycle.optimizer_timeout_secs == 0 || cycle.optimizer_timeout_secs > 300 {
            anyhow::bail!(
                "OPTIMIZER_TIMEOUT_SECS must be between 1 and 300 (got {})",
                cycle.optimizer_timeout_secs
            );
        }

        let learning = LearningConfig {
            half_life_hours: parse_var("LEARNING_HALF_LIFE_HOURS", LearningConfig::default().half_life_hours)?,
            ..LearningConfig::default()
        };
        if !learning.half_life_hours.is_finite() || learning.half_life_hours <= 0.0 {
            anyhow::bail!(
                "LEARNING_HALF_LIFE_HOURS must be positive (got {})",
                learning.half_life_hours
            );
        }

        let ledger_capacity = parse_var("LEDGER_CAPACITY", crate::deploy::DEFAULT_LEDGER_CAPACITY)?;
        if ledger_capacity == 0 || ledger_capacity > 10_000 {
            anyhow::bail!(
                "LEDGER_CAPACITY must be between 1 and 10000 (got {})",
                ledger_capacity
            );
        }

        let operator_rate_per_min = parse_var("OPERATOR_RATE_PER_MIN", 3u32)?;
        if operator_rate_per_min == 0 {
            anyhow::bail!("OPERATOR_RATE_PER_MIN must be at least 1");
        }

        let telemetry_poll_secs = parse_var("TELEMETRY_POLL_SECS", 30u64)?;
        if telemetry_poll_secs == 0 || telemetry_poll_secs > 3600 {
            anyhow::bail!(
                "TELEMETRY_POLL_SECS must be between 1 and 3600 (got {})",
                telemetry_poll_secs
            );
        }

        // ── Served defaults ──
        let default_settings = ComponentSettings {
            system_prompt: env::var("DEFAULT_SYSTEM_PROMPT")
                .unwrap_or_else(|_| DEFAULT_SYSTEM_PROMPT.to_string()),
            model: env::var("DEFAULT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            temperature: parse_var("DEFAULT_TEMPERATURE", 0.7)?,
            timeout_secs: parse_var("DEFAULT_TIMEOUT_SECS", 30u64)?,
        };
        if !(0.0..=MAX_TEMPERATURE).contains(&default_settings.temperature) {
            anyhow::bail!(
                "DEFAULT_TEMPERATURE must be between 0 and {} (got {})",
                MAX_TEMPERATURE,
                default_settings.temperature
            );
        }
        if default_settings.timeout_secs == 0 || default_settings.timeout_secs > MAX_TIMEOUT_SECS {
            anyhow::bail!(
                "DEFAULT_TIMEOUT_SECS must be between 1 and {} (got {})",
                MAX_TIMEOUT_SECS,
                default_settings.timeout_secs
            );
        }

        let fallback_models = split_list(
            &env::var("FALLBACK_MODELS").unwrap_or_else(|_| "gpt-4o".to_string()),
        );

        Ok(Self {
            database_url,
            port,
            bind_address,
            cors_origins,
            api_key,
            threshold,
            alerts,
            cycle,
            learning,
            ledger_capacity,
            operator_rate_per_min,
            optimizer_url: optional_var("OPTIMIZER_URL"),
            telemetry_url: optional_var("TELEMETRY_URL"),
            telemetry_poll_secs,
            config_push_url: optional_var("CONFIG_PUSH_URL"),
            default_settings,
            fallback_models,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Env var tests run serially.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    struct EnvGuard(&'static str);

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            std::env::remove_var(self.0);
        }
    }

    fn set(name: &'static str, value: &str) -> EnvGuard {
        std::env::set_var(name, value);
        EnvGuard(name)
    }

    #[test]
    fn test_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        let config = AppConfig::load().unwrap();
        assert_eq!(config.threshold.critical, 0.85);
        assert_eq!(config.threshold.warning, 0.90);
        assert_eq!(config.threshold.target, 0.95);
        assert_eq!(config.cycle.max_concurrent, 3);
        assert_eq!(config.cycle.cooldown_secs, 7200);
        assert_eq!(config.alerts.cooldown_mins, 15);
        assert_eq!(config.ledger_capacity, 50);
        assert_eq!(config.operator_rate_per_min, 3);
        assert_eq!(config.fallback_models, vec!["gpt-4o"]);
        assert!(config.optimizer_url.is_none());
        assert_eq!(config.cycle.trigger_policy, TriggerPolicy::AnyEvent);
        assert_eq!(config.threshold.trend_unit_secs, 60);
    }

    #[test]
    fn test_trigger_policy_from_env() {
        let _lock = ENV_LOCK.lock().unwrap();
        {
            let _p = set("CYCLE_TRIGGER_POLICY", "degraded");
            assert_eq!(AppConfig::load().unwrap().cycle.trigger_policy, TriggerPolicy::Degraded);
        }
        let _p = set("CYCLE_TRIGGER_POLICY", "whenever");
        assert!(AppConfig::load().is_err());
    }

    #[test]
    fn test_tier_order_is_enforced() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _a = set("TIER_CRITICAL", "0.92");
        let _b = set("TIER_WARNING", "0.90");
        assert!(AppConfig::load().is_err());
    }

    #[test]
    fn test_range_checks() {
        let _lock = ENV_LOCK.lock().unwrap();
        {
            let _g = set("MAX_CONCURRENT_CYCLES", "0");
            assert!(AppConfig::load().is_err());
        }
        {
            let _g = set("CONFIDENCE_THRESHOLD_PCT", "120");
            assert!(AppConfig::load().is_err());
        }
        {
            let _g = set("LEDGER_CAPACITY", "not-a-number");
            assert!(AppConfig::load().is_err());
        }
    }

    #[test]
    fn test_fallback_models_whitespace_handling() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _g = set("FALLBACK_MODELS", " gpt-4o , claude-3-haiku ,, ");
        let config = AppConfig::load().unwrap();
        assert_eq!(config.fallback_models, vec!["gpt-4o", "claude-3-haiku"]);
    }

    #[test]
    fn test_blank_urls_are_disabled() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _g = set("OPTIMIZER_URL", "   ");
        let config = AppConfig::load().unwrap();
        assert!(config.optimizer_url.is_none());
    }
}
