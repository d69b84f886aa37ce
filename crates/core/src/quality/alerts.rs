use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

use virtuous_shared::{
    Alert, AlertSeverity, AlertSink, QualityCondition, QualityEvent, ThresholdTier, VirtuousError,
    VirtuousId,
};

use crate::cooldown::{CooldownKey, CooldownRegistry};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    pub cooldown_mins: i64,
    pub history_size: usize,
    pub sink_timeout_secs: u64,
    /// JSON-lines file sink; disabled when `None`.
    pub log_path: Option<String>,
    /// Webhook / email relay sink; disabled when `None`.
    pub webhook_url: Option<String>,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            cooldown_mins: 15,
            history_size: 10_000,
            sink_timeout_secs: 5,
            log_path: None,
            webhook_url: None,
        }
    }
}

impl AlertConfig {
    #[must_use]
    pub fn cooldown(&self) -> Duration {
        Duration::minutes(self.cooldown_mins)
    }
}

#[must_use]
pub fn severity_for(event: &QualityEvent) -> AlertSeverity {
    match (event.tier, event.condition) {
        (ThresholdTier::Critical, _) => AlertSeverity::Critical,
        (ThresholdTier::Warning, _) | (_, QualityCondition::Trend) => AlertSeverity::High,
        (_, QualityCondition::Variance) => AlertSeverity::Medium,
        _ => AlertSeverity::Low,
    }
}

fn describe(event: &QualityEvent) -> String {
    match event.condition {
        QualityCondition::TierDrop => format!(
            "{} dropped to {} tier (score {:.3}, trend {})",
            event.component_id, event.tier, event.score, event.trend
        ),
        QualityCondition::Trend => format!(
            "{} quality trending down (slope {:.4} per trend unit, score {:.3})",
            event.component_id, event.slope, event.score
        ),
        QualityCondition::Variance => format!(
            "{} quality inconsistent (std dev {:.3}, score {:.3})",
            event.component_id, event.variance, event.score
        ),
    }
}

/// Turns quality events into rate-limited alerts and fans them out to sinks.
pub struct AlertDispatcher {
    config: AlertConfig,
    cooldowns: Arc<CooldownRegistry>,
    sinks: Vec<Arc<dyn AlertSink>>,
    history: RwLock<VecDeque<Alert>>,
}

impl AlertDispatcher {
    pub fn new(
        config: AlertConfig,
        cooldowns: Arc<CooldownRegistry>,
        sinks: Vec<Arc<dyn AlertSink>>,
    ) -> Self {
        Self {
            config,
            cooldowns,
            sinks,
            history: RwLock::new(VecDeque::new()),
        }
    }

    /// Creates and delivers an alert unless its cooldown key is still active.
    pub async fn dispatch(&self, event: &QualityEvent) -> Option<Alert> {
        let key = CooldownKey::new(&event.component_id, event.condition_kind());
        let cooldown_key = key.to_string();
        if !self.cooldowns.try_arm(key, self.config.cooldown()) {
            debug!(cooldown_key = %cooldown_key, "Alert suppressed by cooldown");
            return None;
        }

        let alert = Alert {
            id: VirtuousId::new().to_string(),
            severity: severity_for(event),
            component_id: event.component_id.clone(),
            message: describe(event),
            created_at: self.cooldowns.now(),
            resolved: false,
            cooldown_key,
        };

        self.remember(alert.clone());
        self.deliver(&alert).await;
        Some(alert)
    }

    fn remember(&self, alert: Alert) {
        let mut history = match self.history.write() {
            Ok(h) => h,
            Err(poisoned) => poisoned.into_inner(),
        };
        history.push_back(alert);
        while history.len() > self.config.history_size {
            history.pop_front();
        }
    }

    /// Delivers to every sink concurrently; each sink gets its own timeout and
    /// a failing sink never affects the others.
    async fn deliver(&self, alert: &Alert) {
        let budget = std::time::Duration::from_secs(self.config.sink_timeout_secs);
        let deliveries = self.sinks.iter().map(|sink| async move {
            match tokio::time::timeout(budget, sink.deliver(alert)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(sink = sink.name(), alert_id = %alert.id, "Alert delivery failed: {}", e),
                Err(_) => warn!(
                    sink = sink.name(),
                    alert_id = %alert.id,
                    "Alert delivery timed out after {}s",
                    self.config.sink_timeout_secs
                ),
            }
        });
        futures::future::join_all(deliveries).await;
    }

    /// Marks an alert resolved; the only mutation a stored alert ever sees.
    pub fn resolve(&self, id: &str) -> Result<Alert, VirtuousError> {
        let mut history = match self.history.write() {
            Ok(h) => h,
            Err(poisoned) => poisoned.into_inner(),
        };
        let alert = history
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| VirtuousError::NotFound(format!("alert '{}'", id)))?;
        alert.resolved = true;
        Ok(alert.clone())
    }

    /// Newest first.
    #[must_use]
    pub fn recent(&self, limit: usize, unresolved_only: bool) -> Vec<Alert> {
        let history = match self.history.read() {
            Ok(h) => h,
            Err(poisoned) => poisoned.into_inner(),
        };
        history
            .iter()
            .rev()
            .filter(|a| !unresolved_only || !a.resolved)
            .take(limit)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn unresolved_count(&self) -> usize {
        self.history
            .read()
            .map(|h| h.iter().filter(|a| !a.resolved).count())
            .unwrap_or(0)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.history.read().map(|h| h.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use virtuous_shared::Trend;

    struct CountingSink(AtomicUsize);

    #[async_trait]
    impl AlertSink for CountingSink {
        fn name(&self) -> &str {
            "counting"
        }
        async fn deliver(&self, _alert: &Alert) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct BrokenSink;

    #[async_trait]
    impl AlertSink for BrokenSink {
        fn name(&self) -> &str {
            "broken"
        }
        async fn deliver(&self, _alert: &Alert) -> anyhow::Result<()> {
            anyhow::bail!("smtp relay refused connection")
        }
    }

    struct StuckSink;

    #[async_trait]
    impl AlertSink for StuckSink {
        fn name(&self) -> &str {
            "stuck"
        }
        async fn deliver(&self, _alert: &Alert) -> anyhow::Result<()> {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            Ok(())
        }
    }

    fn event(tier: ThresholdTier, condition: QualityCondition) -> QualityEvent {
        QualityEvent {
            component_id: "summarizer".to_string(),
            tier,
            trend: Trend::Down,
            variance: 0.01,
            triggered_at: Utc::now(),
            condition,
            score: 0.84,
            slope: -0.02,
        }
    }

    #[test]
    fn test_severity_mapping() {
        use QualityCondition::*;
        use ThresholdTier::*;
        assert_eq!(severity_for(&event(Critical, TierDrop)), AlertSeverity::Critical);
        assert_eq!(severity_for(&event(Critical, Variance)), AlertSeverity::Critical);
        assert_eq!(severity_for(&event(Warning, TierDrop)), AlertSeverity::High);
        assert_eq!(severity_for(&event(Excellent, Trend)), AlertSeverity::High);
        assert_eq!(severity_for(&event(Target, Variance)), AlertSeverity::Medium);
        assert_eq!(severity_for(&event(Target, TierDrop)), AlertSeverity::Low);
    }

    #[tokio::test]
    async fn test_cooldown_suppresses_then_expires() {
        let clock = Arc::new(ManualClock::default());
        let counter = Arc::new(CountingSink(AtomicUsize::new(0)));
        let dispatcher = AlertDispatcher::new(
            AlertConfig::default(),
            Arc::new(CooldownRegistry::new(clock.clone())),
            vec![counter.clone()],
        );
        let e = event(ThresholdTier::Critical, QualityCondition::TierDrop);

        assert!(dispatcher.dispatch(&e).await.is_some());
        for _ in 0..5 {
            assert!(dispatcher.dispatch(&e).await.is_none());
        }
        clock.advance(Duration::minutes(15));
        let second = dispatcher.dispatch(&e).await.unwrap();
        assert_eq!(second.cooldown_key, "summarizer:tier_critical");
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
        assert_eq!(dispatcher.len(), 2);
    }

    #[tokio::test]
    async fn test_failing_and_slow_sinks_do_not_block_others() {
        let counter = Arc::new(CountingSink(AtomicUsize::new(0)));
        let dispatcher = AlertDispatcher::new(
            AlertConfig {
                sink_timeout_secs: 1,
                ..AlertConfig::default()
            },
            Arc::new(CooldownRegistry::new(Arc::new(ManualClock::default()))),
            vec![Arc::new(BrokenSink), Arc::new(StuckSink), counter.clone()],
        );
        let started = std::time::Instant::now();
        let alert = dispatcher
            .dispatch(&event(ThresholdTier::Warning, QualityCondition::TierDrop))
            .await;
        assert!(alert.is_some());
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_history_is_fifo_bounded_and_resolvable() {
        let dispatcher = AlertDispatcher::new(
            AlertConfig {
                history_size: 3,
                cooldown_mins: 0,
                ..AlertConfig::default()
            },
            Arc::new(CooldownRegistry::new(Arc::new(ManualClock::default()))),
            vec![],
        );
        let mut ids = Vec::new();
        for i in 0..5 {
            let mut e = event(ThresholdTier::Critical, QualityCondition::TierDrop);
            e.component_id = format!("c{}", i);
            ids.push(dispatcher.dispatch(&e).await.unwrap().id);
        }
        let recent = dispatcher.recent(10, false);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].component_id, "c4");
        assert_eq!(recent[2].component_id, "c2");

        assert!(matches!(dispatcher.resolve(&ids[0]), Err(VirtuousError::NotFound(_))));
        let resolved = dispatcher.resolve(&ids[4]).unwrap();
        assert!(resolved.resolved);
        assert_eq!(dispatcher.recent(10, true).len(), 2);
        assert_eq!(dispatcher.unresolved_count(), 2);
    }
}
