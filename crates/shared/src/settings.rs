//! The serving configuration surface managed by the engine.
//!
//! Every mutable knob is a variant of [`SettingValue`], so deployment and
//! rollback only ever deal with generic before/after pairs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::VirtuousError;

pub const MAX_SYSTEM_PROMPT_LEN: usize = 32_000;
pub const MAX_TIMEOUT_SECS: u64 = 600;
pub const MAX_TEMPERATURE: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingKey {
    SystemPrompt,
    Temperature,
    Model,
    Timeout,
}

impl std::fmt::Display for SettingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SystemPrompt => write!(f, "system_prompt"),
            Self::Temperature => write!(f, "temperature"),
            Self::Model => write!(f, "model"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SettingValue {
    SystemPrompt(String),
    Temperature(f64),
    Model(String),
    TimeoutSecs(u64),
}

impl SettingValue {
    #[must_use]
    pub fn key(&self) -> SettingKey {
        match self {
            Self::SystemPrompt(_) => SettingKey::SystemPrompt,
            Self::Temperature(_) => SettingKey::Temperature,
            Self::Model(_) => SettingKey::Model,
            Self::TimeoutSecs(_) => SettingKey::Timeout,
        }
    }

    /// Syntactic well-formedness of a value, independent of any live state.
    pub fn validate(&self) -> Result<(), VirtuousError> {
        match self {
            Self::SystemPrompt(text) => {
                if text.trim().is_empty() {
                    return Err(VirtuousError::Validation("system prompt must not be empty".into()));
                }
                if text.len() > MAX_SYSTEM_PROMPT_LEN {
                    return Err(VirtuousError::Validation(format!(
                        "system prompt exceeds {} bytes (got {})",
                        MAX_SYSTEM_PROMPT_LEN,
                        text.len()
                    )));
                }
            }
            Self::Temperature(t) => {
                if !t.is_finite() || !(0.0..=MAX_TEMPERATURE).contains(t) {
                    return Err(VirtuousError::Validation(format!(
                        "temperature must be in [0.0, {}], got {}",
                        MAX_TEMPERATURE, t
                    )));
                }
            }
            Self::Model(id) => {
                if id.trim().is_empty() || id.len() > 200 || id.chars().any(char::is_whitespace) {
                    return Err(VirtuousError::Validation(format!("invalid model id '{}'", id)));
                }
            }
            Self::TimeoutSecs(secs) => {
                if *secs == 0 || *secs > MAX_TIMEOUT_SECS {
                    return Err(VirtuousError::Validation(format!(
                        "timeout must be between 1 and {} seconds, got {}",
                        MAX_TIMEOUT_SECS, secs
                    )));
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for SettingValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SystemPrompt(text) => {
                let preview: String = text.chars().take(40).collect();
                if preview.len() < text.len() {
                    write!(f, "\"{}…\"", preview)
                } else {
                    write!(f, "\"{}\"", preview)
                }
            }
            Self::Temperature(t) => write!(f, "{}", t),
            Self::Model(id) => write!(f, "{}", id),
            Self::TimeoutSecs(secs) => write!(f, "{}s", secs),
        }
    }
}

/// Serving settings of one component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentSettings {
    pub system_prompt: String,
    pub model: String,
    pub temperature: f64,
    pub timeout_secs: u64,
}

impl ComponentSettings {
    #[must_use]
    pub fn get(&self, key: SettingKey) -> SettingValue {
        match key {
            SettingKey::SystemPrompt => SettingValue::SystemPrompt(self.system_prompt.clone()),
            SettingKey::Temperature => SettingValue::Temperature(self.temperature),
            SettingKey::Model => SettingValue::Model(self.model.clone()),
            SettingKey::Timeout => SettingValue::TimeoutSecs(self.timeout_secs),
        }
    }

    pub fn set(&mut self, value: &SettingValue) -> Result<(), VirtuousError> {
        value.validate()?;
        match value {
            SettingValue::SystemPrompt(text) => self.system_prompt.clone_from(text),
            SettingValue::Temperature(t) => self.temperature = *t,
            SettingValue::Model(id) => self.model.clone_from(id),
            SettingValue::TimeoutSecs(secs) => self.timeout_secs = *secs,
        }
        Ok(())
    }
}

/// Versioned live configuration. Components without an explicit entry serve
/// the defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveConfiguration {
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    pub defaults: ComponentSettings,
    #[serde(default)]
    pub components: BTreeMap<String, ComponentSettings>,
}

impl LiveConfiguration {
    #[must_use]
    pub fn new(defaults: ComponentSettings) -> Self {
        Self {
            version: 0,
            updated_at: Utc::now(),
            defaults,
            components: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn settings_for(&self, component_id: &str) -> ComponentSettings {
        self.components
            .get(component_id)
            .cloned()
            .unwrap_or_else(|| self.defaults.clone())
    }

    /// Compare-and-set of a single change: the current value must equal
    /// `change.before`, otherwise the change is stale and rejected.
    pub fn apply(&mut self, change: &ConfigurationChange) -> Result<(), VirtuousError> {
        change.validate()?;
        let mut settings = self.settings_for(&change.component);
        let current = settings.get(change.before.key());
        if current != change.before {
            return Err(VirtuousError::DeploymentFailure(format!(
                "{} of '{}' is {}, expected {}",
                change.before.key(),
                change.component,
                current,
                change.before
            )));
        }
        settings.set(&change.after)?;
        self.components.insert(change.component.clone(), settings);
        Ok(())
    }
}

/// One before/after pair on one component. The unit of deployment and rollback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationChange {
    pub component: String,
    pub before: SettingValue,
    pub after: SettingValue,
    pub reason: String,
    #[serde(default)]
    pub impact_description: String,
}

impl ConfigurationChange {
    #[must_use]
    pub fn key(&self) -> SettingKey {
        self.after.key()
    }

    pub fn validate(&self) -> Result<(), VirtuousError> {
        if self.component.trim().is_empty() {
            return Err(VirtuousError::Validation("change has an empty component".into()));
        }
        if self.before.key() != self.after.key() {
            return Err(VirtuousError::Validation(format!(
                "change mixes setting kinds ({} -> {})",
                self.before.key(),
                self.after.key()
            )));
        }
        if self.before == self.after {
            return Err(VirtuousError::Validation(format!(
                "change to {} of '{}' is a no-op",
                self.key(),
                self.component
            )));
        }
        self.before.validate()?;
        self.after.validate()
    }

    /// The change that undoes this one.
    #[must_use]
    pub fn inverse(&self, reason: impl Into<String>) -> Self {
        Self {
            component: self.component.clone(),
            before: self.after.clone(),
            after: self.before.clone(),
            reason: reason.into(),
            impact_description: format!("reverts: {}", self.reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> ComponentSettings {
        ComponentSettings {
            system_prompt: "You are a helpful assistant.".to_string(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.7,
            timeout_secs: 30,
        }
    }

    fn temp_change(before: f64, after: f64) -> ConfigurationChange {
        ConfigurationChange {
            component: "summarizer".to_string(),
            before: SettingValue::Temperature(before),
            after: SettingValue::Temperature(after),
            reason: "reduce variance".to_string(),
            impact_description: String::new(),
        }
    }

    #[test]
    fn test_apply_is_compare_and_set() {
        let mut config = LiveConfiguration::new(defaults());
        config.apply(&temp_change(0.7, 0.5)).unwrap();
        assert_eq!(config.settings_for("summarizer").temperature, 0.5);
        // Untouched components still read the defaults
        assert_eq!(config.settings_for("router").temperature, 0.7);

        let stale = temp_change(0.7, 0.3);
        assert!(matches!(config.apply(&stale), Err(VirtuousError::DeploymentFailure(_))));
        assert_eq!(config.settings_for("summarizer").temperature, 0.5);
    }

    #[test]
    fn test_inverse_swaps_before_and_after() {
        let change = temp_change(0.7, 0.5);
        let inverse = change.inverse("rollback");
        assert_eq!(inverse.before, SettingValue::Temperature(0.5));
        assert_eq!(inverse.after, SettingValue::Temperature(0.7));

        let mut config = LiveConfiguration::new(defaults());
        config.apply(&change).unwrap();
        config.apply(&inverse).unwrap();
        assert_eq!(config.settings_for("summarizer"), defaults());
    }

    #[test]
    fn test_change_validation() {
        assert!(temp_change(0.7, 0.7).validate().is_err());
        assert!(temp_change(0.7, 3.5).validate().is_err());
        let mixed = ConfigurationChange {
            after: SettingValue::Model("gpt-4o".to_string()),
            ..temp_change(0.7, 0.5)
        };
        assert!(mixed.validate().is_err());
        assert!(SettingValue::Model("has space".to_string()).validate().is_err());
        assert!(SettingValue::TimeoutSecs(0).validate().is_err());
        assert!(SettingValue::SystemPrompt(" ".to_string()).validate().is_err());
    }

    #[test]
    fn test_setting_value_serializes_tagged() {
        let json = serde_json::to_value(SettingValue::Temperature(0.5)).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "temperature", "value": 0.5}));
    }
}
