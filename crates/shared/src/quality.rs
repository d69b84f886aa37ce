//! Quality telemetry types: measurements, tiers, events and alerts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single quality observation pulled from the tracing backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityMeasurement {
    pub component_id: String,
    pub model_id: String,
    /// Normalized response quality in [0.0, 1.0].
    pub score: f64,
    pub sample_size: u32,
    pub observed_at: DateTime<Utc>,
    #[serde(default)]
    pub latency_ms: Option<u64>,
}

impl QualityMeasurement {
    pub fn validate(&self) -> Result<(), crate::VirtuousError> {
        if self.component_id.trim().is_empty() || self.component_id.len() > 200 {
            return Err(crate::VirtuousError::Validation(
                "component_id must be 1-200 characters".to_string(),
            ));
        }
        if !self.score.is_finite() || !(0.0..=1.0).contains(&self.score) {
            return Err(crate::VirtuousError::Validation(format!(
                "score must be in [0.0, 1.0], got {}",
                self.score
            )));
        }
        Ok(())
    }
}

/// Classification bucket of a quality score.
///
/// Ordering follows quality: `Critical < Warning < Target < Excellent`, so a
/// "downward crossing" is simply `new < previous`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdTier {
    Critical,
    Warning,
    Target,
    Excellent,
}

impl ThresholdTier {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Warning => "warning",
            Self::Target => "target",
            Self::Excellent => "excellent",
        }
    }
}

impl std::fmt::Display for ThresholdTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Up,
    Down,
    Stable,
}

impl std::fmt::Display for Trend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
            Self::Stable => write!(f, "stable"),
        }
    }
}

/// Which rule produced a [`QualityEvent`].
///
/// Priority when several fire on the same observation:
///   1. TierDrop  — score crossed a tier boundary downward
///   2. Trend     — window slope is negative beyond the danger magnitude
///   3. Variance  — window dispersion exceeds the ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityCondition {
    TierDrop,
    Trend,
    Variance,
}

impl std::fmt::Display for QualityCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TierDrop => write!(f, "tier_drop"),
            Self::Trend => write!(f, "trend"),
            Self::Variance => write!(f, "variance"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityEvent {
    pub component_id: String,
    pub tier: ThresholdTier,
    pub trend: Trend,
    /// Dispersion of the score over the current window, as a population
    /// standard deviation (same unit as the score, compared against the
    /// variance ceiling).
    pub variance: f64,
    pub triggered_at: DateTime<Utc>,
    pub condition: QualityCondition,
    /// Score of the measurement that produced the event.
    pub score: f64,
    /// Least-squares slope of score over observation time, in score per
    /// trend unit (one minute by default).
    pub slope: f64,
}

impl QualityEvent {
    /// Condition kind used for rate limiting. Tier drops are split per tier so a
    /// warning alert does not mask a later critical one.
    #[must_use]
    pub fn condition_kind(&self) -> String {
        match self.condition {
            QualityCondition::TierDrop => format!("tier_{}", self.tier),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub severity: AlertSeverity,
    pub component_id: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub resolved: bool,
    pub cooldown_key: String,
}
