use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::debug;

use virtuous_shared::{
    QualityCondition, QualityEvent, QualityMeasurement, ThresholdTier, Trend, VirtuousError,
};

/// Slopes smaller than this magnitude (per trend unit) are reported as a
/// stable trend.
const TREND_EPSILON: f64 = 1e-3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdConfig {
    /// Scores below this are critical.
    pub critical: f64,
    /// Scores in [critical, warning) are warning.
    pub warning: f64,
    /// Scores in [warning, target) are target; at or above, excellent.
    pub target: f64,
    pub window_size: usize,
    /// Trend and variance rules stay silent until the window holds this many samples.
    pub min_samples: usize,
    /// Danger magnitude for the slope in score per `trend_unit_secs`
    /// (compared as `slope <= -threshold`).
    pub slope_threshold: f64,
    /// Time unit of the regression's x axis.
    pub trend_unit_secs: u64,
    /// Ceiling for the window's population standard deviation. Reported as
    /// `variance` on events and `/status`.
    pub variance_ceiling: f64,
}

impl ThresholdConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, val) in [
            ("critical", self.critical),
            ("warning", self.warning),
            ("target", self.target),
        ] {
            if !val.is_finite() || !(0.0..=1.0).contains(&val) {
                anyhow::bail!("{} threshold must be in [0.0, 1.0], got {}", name, val);
            }
        }
        if !(self.critical < self.warning && self.warning < self.target) {
            anyhow::bail!(
                "thresholds must be strictly increasing (critical {} < warning {} < target {})",
                self.critical,
                self.warning,
                self.target
            );
        }
        if self.window_size < 2 || self.window_size > 500 {
            anyhow::bail!("window_size must be between 2 and 500, got {}", self.window_size);
        }
        if self.min_samples < 2 || self.min_samples > self.window_size {
            anyhow::bail!(
                "min_samples must be between 2 and window_size ({}), got {}",
                self.window_size,
                self.min_samples
            );
        }
        if !self.slope_threshold.is_finite() || self.slope_threshold <= 0.0 {
            anyhow::bail!("slope_threshold must be > 0, got {}", self.slope_threshold);
        }
        if self.trend_unit_secs == 0 {
            anyhow::bail!("trend_unit_secs must be > 0");
        }
        if !self.variance_ceiling.is_finite() || self.variance_ceiling <= 0.0 {
            anyhow::bail!("variance_ceiling must be > 0, got {}", self.variance_ceiling);
        }
        Ok(())
    }
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            critical: 0.85,
            warning: 0.90,
            target: 0.95,
            window_size: 30,
            min_samples: 5,
            slope_threshold: 0.01,
            trend_unit_secs: 60,
            variance_ceiling: 0.05,
        }
    }
}

// ══════════════════════════════════════════════════════════════
// Pure Functions
// ══════════════════════════════════════════════════════════════

/// Tier of a score. Ranges are half-open on the lower bound, so a score equal
/// to a boundary belongs to the higher tier.
#[must_use]
pub fn classify(score: f64, config: &ThresholdConfig) -> ThresholdTier {
    if score < config.critical {
        ThresholdTier::Critical
    } else if score < config.warning {
        ThresholdTier::Warning
    } else if score < config.target {
        ThresholdTier::Target
    } else {
        ThresholdTier::Excellent
    }
}

/// Least-squares slope of `(x, y)` points. Zero when fewer than two points
/// or when every x is the same.
#[must_use]
pub fn least_squares_slope(points: &[(f64, f64)]) -> f64 {
    let n = points.len();
    if n < 2 {
        return 0.0;
    }
    let n_f = n as f64;
    let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / n_f;
    let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / n_f;
    let (mut num, mut den) = (0.0, 0.0);
    for (x, y) in points {
        let dx = x - mean_x;
        num += dx * (y - mean_y);
        den += dx * dx;
    }
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}

/// `(elapsed, score)` points with elapsed time measured from the first sample
/// in units of `unit_secs`.
#[must_use]
pub fn time_series<'a>(
    samples: impl IntoIterator<Item = &'a QualityMeasurement>,
    unit_secs: u64,
) -> Vec<(f64, f64)> {
    let unit = unit_secs.max(1) as f64;
    let mut origin = None;
    samples
        .into_iter()
        .map(|m| {
            let start = *origin.get_or_insert(m.observed_at);
            let elapsed = (m.observed_at - start).num_milliseconds() as f64 / 1000.0;
            (elapsed / unit, m.score)
        })
        .collect()
}

/// Population standard deviation.
#[must_use]
pub fn std_dev(ys: &[f64]) -> f64 {
    if ys.len() < 2 {
        return 0.0;
    }
    let n = ys.len() as f64;
    let mean = ys.iter().sum::<f64>() / n;
    (ys.iter().map(|y| (y - mean).powi(2)).sum::<f64>() / n).sqrt()
}

#[must_use]
pub fn classify_trend(slope: f64) -> Trend {
    if slope > TREND_EPSILON {
        Trend::Up
    } else if slope < -TREND_EPSILON {
        Trend::Down
    } else {
        Trend::Stable
    }
}

// ══════════════════════════════════════════════════════════════
// Threshold Monitor
// ══════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct ComponentWindow {
    samples: VecDeque<QualityMeasurement>,
    last_tier: Option<ThresholdTier>,
}

impl ComponentWindow {
    fn scores(&self) -> Vec<f64> {
        self.samples.iter().map(|m| m.score).collect()
    }
}

/// Point-in-time view of one component's window (for `/status`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentQuality {
    pub component_id: String,
    pub model_id: String,
    pub latest_score: f64,
    pub tier: ThresholdTier,
    pub trend: Trend,
    /// Score change per trend unit.
    pub slope: f64,
    /// Population standard deviation of the window's scores.
    pub variance: f64,
    pub samples: usize,
    pub last_observed_at: chrono::DateTime<chrono::Utc>,
}

/// Classifies measurements and emits [`QualityEvent`]s on degradation.
///
/// Windows are kept per component; the per-key lock of the map serializes
/// observations of one component while different components proceed in
/// parallel.
pub struct ThresholdMonitor {
    config: ThresholdConfig,
    windows: DashMap<String, ComponentWindow>,
}

impl ThresholdMonitor {
    #[must_use]
    pub fn new(config: ThresholdConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ThresholdConfig {
        &self.config
    }

    /// Adds a measurement to its component window and reports a degradation
    /// event if one of the rules fires.
    pub fn observe(&self, measurement: QualityMeasurement) -> Result<Option<QualityEvent>, VirtuousError> {
        measurement.validate()?;

        let tier = classify(measurement.score, &self.config);
        let mut window = self
            .windows
            .entry(measurement.component_id.clone())
            .or_default();

        window.samples.push_back(measurement.clone());
        while window.samples.len() > self.config.window_size {
            window.samples.pop_front();
        }
        let previous = window.last_tier.replace(tier);

        let scores = window.scores();
        let enough = scores.len() >= self.config.min_samples;
        let slope = if enough {
            least_squares_slope(&time_series(&window.samples, self.config.trend_unit_secs))
        } else {
            0.0
        };
        let variance = if enough { std_dev(&scores) } else { 0.0 };
        drop(window);

        // A component first seen below target counts as a drop from target.
        let tier_dropped = match previous {
            Some(prev) => tier < prev,
            None => tier < ThresholdTier::Target,
        };
        let trend_breach = enough && slope <= -self.config.slope_threshold;
        let variance_breach = enough && variance > self.config.variance_ceiling;

        let condition = if tier_dropped {
            QualityCondition::TierDrop
        } else if trend_breach {
            QualityCondition::Trend
        } else if variance_breach {
            QualityCondition::Variance
        } else {
            return Ok(None);
        };

        debug!(
            component_id = %measurement.component_id,
            score = measurement.score,
            tier = %tier,
            condition = %condition,
            slope = slope,
            variance = variance,
            "Quality event"
        );

        Ok(Some(QualityEvent {
            component_id: measurement.component_id,
            tier,
            trend: classify_trend(slope),
            variance,
            triggered_at: measurement.observed_at,
            condition,
            score: measurement.score,
            slope,
        }))
    }

    /// Most recent `limit` measurements of a component, oldest first.
    #[must_use]
    pub fn recent(&self, component_id: &str, limit: usize) -> Vec<QualityMeasurement> {
        self.windows
            .get(component_id)
            .map(|w| {
                let skip = w.samples.len().saturating_sub(limit);
                w.samples.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    #[must_use]
    pub fn latest_score(&self, component_id: &str) -> Option<f64> {
        self.windows
            .get(component_id)
            .and_then(|w| w.samples.back().map(|m| m.score))
    }

    #[must_use]
    pub fn component(&self, component_id: &str) -> Option<ComponentQuality> {
        let window = self.windows.get(component_id)?;
        let latest = window.samples.back()?;
        let scores = window.scores();
        let slope = least_squares_slope(&time_series(&window.samples, self.config.trend_unit_secs));
        Some(ComponentQuality {
            component_id: component_id.to_string(),
            model_id: latest.model_id.clone(),
            latest_score: latest.score,
            tier: classify(latest.score, &self.config),
            trend: classify_trend(slope),
            slope,
            variance: std_dev(&scores),
            samples: scores.len(),
            last_observed_at: latest.observed_at,
        })
    }

    /// All tracked components, sorted by id.
    #[must_use]
    pub fn components(&self) -> Vec<ComponentQuality> {
        let mut ids: Vec<String> = self.windows.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids.iter().filter_map(|id| self.component(id)).collect()
    }
}
