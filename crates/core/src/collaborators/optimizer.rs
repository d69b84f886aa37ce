use async_trait::async_trait;
use tracing::debug;

use virtuous_shared::{
    ComponentSettings, ConfigurationChange, LearningPattern, OptimizationProposal,
    OptimizationRequest, Optimizer, SettingKey, SettingValue, MAX_TIMEOUT_SECS,
};

use crate::quality::monitor::{least_squares_slope, std_dev, time_series};

/// Slope in score per minute.
const SLOPE_UNIT_SECS: u64 = 60;

const TEMPERATURE_FLOOR: f64 = 0.1;
const TEMPERATURE_STEP: f64 = 0.2;
const PROMPT_GUIDELINE: &str =
    "Answer accurately and concisely. If you are unsure, say so instead of guessing.";

/// Patterns with at least this much evidence and less confidence are avoided.
const AVOID_MIN_OUTCOMES: u64 = 3;
const AVOID_BELOW_CONFIDENCE: f64 = 0.3;

/// Summary of the measurement window handed to the optimizer.
#[derive(Debug, Clone, Copy)]
struct Signal {
    mean: f64,
    spread: f64,
    slope: f64,
    mean_latency_ms: Option<f64>,
}

impl Signal {
    fn from_request(request: &OptimizationRequest) -> Self {
        let scores: Vec<f64> = request.measurements.iter().map(|m| m.score).collect();
        let mean = if scores.is_empty() {
            1.0
        } else {
            scores.iter().sum::<f64>() / scores.len() as f64
        };
        let latencies: Vec<f64> = request
            .measurements
            .iter()
            .filter_map(|m| m.latency_ms.map(|l| l as f64))
            .collect();
        Self {
            mean,
            spread: std_dev(&scores),
            slope: least_squares_slope(&time_series(&request.measurements, SLOPE_UNIT_SECS)),
            mean_latency_ms: (!latencies.is_empty())
                .then(|| latencies.iter().sum::<f64>() / latencies.len() as f64),
        }
    }
}

struct Candidate {
    tag: SettingKey,
    after: SettingValue,
    improvement_pct: f64,
    confidence_pct: f64,
    reason: String,
}

/// Built-in strategy table used when no external optimizer is configured.
///
/// Each rule looks at the window and the current settings and may propose a
/// single setting change; learning patterns for the component reorder the
/// candidates and veto strategies with a poor track record.
pub struct RuleBasedOptimizer {
    fallback_models: Vec<String>,
}

impl RuleBasedOptimizer {
    #[must_use]
    pub fn new(fallback_models: Vec<String>) -> Self {
        Self { fallback_models }
    }

    fn candidates(&self, signal: Signal, settings: &ComponentSettings) -> Vec<Candidate> {
        let mut out = Vec::new();

        // Sampling noise shows up as spread or a falling window.
        if settings.temperature > TEMPERATURE_FLOOR && (signal.spread > 0.02 || signal.slope < 0.0 || signal.mean < 0.9) {
            let lowered = ((settings.temperature - TEMPERATURE_STEP) * 10.0).round() / 10.0;
            let lowered = lowered.max(TEMPERATURE_FLOOR);
            if lowered < settings.temperature {
                out.push(Candidate {
                    tag: SettingKey::Temperature,
                    after: SettingValue::Temperature(lowered),
                    improvement_pct: 6.0,
                    confidence_pct: 85.0,
                    reason: format!(
                        "reduce sampling temperature {} -> {} to stabilize output",
                        settings.temperature, lowered
                    ),
                });
            }
        }

        // Responses close to the timeout are likely being truncated.
        if let Some(latency) = signal.mean_latency_ms {
            let budget_ms = settings.timeout_secs as f64 * 1000.0;
            if latency > budget_ms * 0.8 && settings.timeout_secs < MAX_TIMEOUT_SECS {
                let extended = (settings.timeout_secs + settings.timeout_secs / 2).clamp(settings.timeout_secs + 1, MAX_TIMEOUT_SECS);
                out.push(Candidate {
                    tag: SettingKey::Timeout,
                    after: SettingValue::TimeoutSecs(extended),
                    improvement_pct: 3.0,
                    confidence_pct: 82.0,
                    reason: format!(
                        "mean latency {:.0}ms is within 20% of the {}s timeout",
                        latency, settings.timeout_secs
                    ),
                });
            }
        }

        // Severe degradation: try the next model in the fallback list.
        if signal.mean < 0.85 {
            if let Some(model) = self.fallback_models.iter().find(|m| **m != settings.model) {
                out.push(Candidate {
                    tag: SettingKey::Model,
                    after: SettingValue::Model(model.clone()),
                    improvement_pct: 8.0,
                    confidence_pct: 75.0,
                    reason: format!("mean quality {:.3} is critical; switch to {}", signal.mean, model),
                });
            }
        }

        if !settings.system_prompt.contains(PROMPT_GUIDELINE) {
            out.push(Candidate {
                tag: SettingKey::SystemPrompt,
                after: SettingValue::SystemPrompt(format!(
                    "{}\n\n{}",
                    settings.system_prompt.trim_end(),
                    PROMPT_GUIDELINE
                )),
                improvement_pct: 2.5,
                confidence_pct: 70.0,
                reason: "add an accuracy guideline to the system prompt".to_string(),
            });
        }

        out
    }
}

/// Historical confidence for a strategy, nudging the optimizer's own figure.
fn bias(candidate: &mut Candidate, patterns: &[LearningPattern]) -> bool {
    let tag = candidate.tag.to_string();
    let Some(pattern) = patterns.iter().find(|p| p.strategy_tag == tag) else {
        return true;
    };
    if pattern.total_outcomes() >= AVOID_MIN_OUTCOMES && pattern.confidence < AVOID_BELOW_CONFIDENCE {
        return false;
    }
    candidate.confidence_pct = (candidate.confidence_pct + (pattern.confidence - 0.5) * 20.0).clamp(0.0, 100.0);
    true
}

#[async_trait]
impl Optimizer for RuleBasedOptimizer {
    fn name(&self) -> &str {
        "rule_based"
    }

    async fn propose(&self, request: OptimizationRequest) -> anyhow::Result<OptimizationProposal> {
        let signal = Signal::from_request(&request);
        let settings = &request.current_settings;

        let mut candidates: Vec<Candidate> = self
            .candidates(signal, settings)
            .into_iter()
            .filter_map(|mut c| bias(&mut c, &request.patterns).then_some(c))
            .collect();
        candidates.sort_by(|a, b| {
            (b.improvement_pct * b.confidence_pct).total_cmp(&(a.improvement_pct * a.confidence_pct))
        });

        let Some(best) = candidates.into_iter().next() else {
            anyhow::bail!("no applicable strategy for '{}'", request.component_id);
        };
        debug!(
            component_id = %request.component_id,
            strategy = %best.tag,
            mean = signal.mean,
            slope = signal.slope,
            "Rule-based proposal"
        );

        Ok(OptimizationProposal {
            changes: vec![ConfigurationChange {
                component: request.component_id.clone(),
                before: settings.get(best.tag),
                after: best.after,
                reason: best.reason,
                impact_description: format!("expected +{:.1}% quality", best.improvement_pct),
            }],
            improvement_pct: best.improvement_pct,
            confidence_pct: best.confidence_pct,
            strategy_tag: Some(best.tag.to_string()),
            rationale: Some(format!(
                "window mean {:.3}, std dev {:.3}, slope {:.4}",
                signal.mean, signal.spread, signal.slope
            )),
        })
    }
}

/// Delegates proposals to an external optimization service.
pub struct HttpOptimizer {
    client: reqwest::Client,
    url: String,
}

impl HttpOptimizer {
    #[must_use]
    pub fn new(client: reqwest::Client, url: String) -> Self {
        Self { client, url }
    }
}

#[async_trait]
impl Optimizer for HttpOptimizer {
    fn name(&self) -> &str {
        "http"
    }

    async fn propose(&self, request: OptimizationRequest) -> anyhow::Result<OptimizationProposal> {
        let response = self.client.post(&self.url).json(&request).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("optimizer responded with HTTP {}", response.status());
        }
        Ok(response.json::<OptimizationProposal>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use virtuous_shared::QualityMeasurement;

    fn settings() -> ComponentSettings {
        ComponentSettings {
            system_prompt: "You summarize support tickets.".to_string(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.7,
            timeout_secs: 30,
        }
    }

    fn request(scores: &[f64], latency_ms: u64) -> OptimizationRequest {
        let start = Utc::now();
        OptimizationRequest {
            cycle_id: "c1".to_string(),
            component_id: "summarizer".to_string(),
            measurements: scores
                .iter()
                .enumerate()
                .map(|(i, s)| QualityMeasurement {
                    component_id: "summarizer".to_string(),
                    model_id: "gpt-4o-mini".to_string(),
                    score: *s,
                    sample_size: 10,
                    observed_at: start + Duration::seconds(i as i64),
                    latency_ms: Some(latency_ms),
                })
                .collect(),
            patterns: vec![],
            current_settings: settings(),
            budget_secs: 30,
        }
    }

    #[tokio::test]
    async fn test_degrading_window_lowers_temperature() {
        let optimizer = RuleBasedOptimizer::new(vec!["gpt-4o".to_string()]);
        let proposal = optimizer
            .propose(request(&[0.93, 0.90, 0.88, 0.86, 0.87], 900))
            .await
            .unwrap();
        assert_eq!(proposal.strategy_tag.as_deref(), Some("temperature"));
        assert_eq!(proposal.changes[0].before, SettingValue::Temperature(0.7));
        assert_eq!(proposal.changes[0].after, SettingValue::Temperature(0.5));
        assert_eq!(proposal.improvement_pct, 6.0);
        assert_eq!(proposal.confidence_pct, 85.0);
    }

    #[tokio::test]
    async fn test_poor_track_record_is_avoided() {
        let optimizer = RuleBasedOptimizer::new(vec!["gpt-4o".to_string()]);
        let mut req = request(&[0.93, 0.90, 0.88, 0.86, 0.87], 900);
        let now = Utc::now();
        req.patterns = vec![LearningPattern {
            id: "p".to_string(),
            context: "summarizer".to_string(),
            strategy_tag: "temperature".to_string(),
            confidence: 0.1,
            success_count: 0,
            failure_count: 4,
            created_at: now,
            last_applied_at: Some(now),
            weighted_success: 0.0,
            weighted_failure: 4.0,
            updated_at: now,
        }];
        let proposal = optimizer.propose(req).await.unwrap();
        assert_ne!(proposal.strategy_tag.as_deref(), Some("temperature"));
    }

    #[tokio::test]
    async fn test_slow_responses_extend_timeout() {
        let optimizer = RuleBasedOptimizer::new(vec![]);
        let mut req = request(&[0.97, 0.97, 0.97, 0.97, 0.97], 29_000);
        req.current_settings.temperature = 0.1;
        let proposal = optimizer.propose(req).await.unwrap();
        assert_eq!(proposal.changes[0].after, SettingValue::TimeoutSecs(45));
    }
}
