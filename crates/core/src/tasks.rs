//! Long-lived background loops. Each owns one responsibility and checks the
//! shutdown signal at every suspension point.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use virtuous_shared::{QualityEvent, QualityMeasurement, TelemetrySource};

use crate::cooldown::CooldownRegistry;
use crate::cycle::CycleOrchestrator;
use crate::deploy::{ChangeLedger, DeploymentGovernor};
use crate::learning::LearningStore;
use crate::middleware::RateLimiter;
use crate::quality::{AlertDispatcher, ThresholdMonitor};
use crate::shutdown::Shutdown;

type MeasurementKey = (String, String, u64, u32);

/// Ingestion high-water mark. The source is queried with `since = at`
/// inclusive, so measurements sharing the newest timestamp can arrive in a
/// later batch; the ones already forwarded at that instant are remembered.
#[derive(Default)]
struct IngestCursor {
    at: Option<DateTime<Utc>>,
    seen_at_cursor: HashSet<MeasurementKey>,
}

impl IngestCursor {
    fn since(&self) -> Option<DateTime<Utc>> {
        self.at
    }

    /// Advances past `measurement`; false if it was already forwarded.
    fn admit(&mut self, measurement: &QualityMeasurement) -> bool {
        let key = (
            measurement.component_id.clone(),
            measurement.model_id.clone(),
            measurement.score.to_bits(),
            measurement.sample_size,
        );
        match self.at {
            Some(at) if measurement.observed_at < at => true,
            Some(at) if measurement.observed_at == at => self.seen_at_cursor.insert(key),
            _ => {
                self.at = Some(measurement.observed_at);
                self.seen_at_cursor.clear();
                self.seen_at_cursor.insert(key);
                true
            }
        }
    }
}

/// Polls the telemetry source and forwards new measurements in arrival order.
pub fn spawn_ingestion_task(
    source: Arc<dyn TelemetrySource>,
    measurement_tx: mpsc::Sender<QualityMeasurement>,
    poll_interval_secs: u64,
    shutdown: Arc<Shutdown>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(poll_interval_secs.max(1)));
        let mut cursor = IngestCursor::default();
        info!(
            source = source.name(),
            "📡 Telemetry ingestion started (poll interval: {}s)",
            poll_interval_secs
        );

        loop {
            tokio::select! {
                () = shutdown.wait() => {
                    info!("Telemetry ingestion shutting down");
                    break;
                }
                _ = interval.tick() => {
                    let batch = match source.fetch(cursor.since()).await {
                        Ok(batch) => batch,
                        Err(e) => {
                            warn!(source = source.name(), "Telemetry fetch failed: {}", e);
                            continue;
                        }
                    };
                    if !batch.is_empty() {
                        debug!(count = batch.len(), "Fetched measurements");
                    }
                    for measurement in batch {
                        if !cursor.admit(&measurement) {
                            debug!(component_id = %measurement.component_id, "Skipping already forwarded measurement");
                            continue;
                        }
                        tokio::select! {
                            () = shutdown.wait() => return,
                            sent = measurement_tx.send(measurement) => {
                                if sent.is_err() {
                                    error!("Evaluation channel closed; stopping ingestion");
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        }
    })
}

/// Feeds measurements through the monitor; degradation events go to the
/// alert dispatcher and on to the optimization loop.
pub fn spawn_evaluation_task(
    monitor: Arc<ThresholdMonitor>,
    dispatcher: Arc<AlertDispatcher>,
    mut measurement_rx: mpsc::Receiver<QualityMeasurement>,
    event_tx: mpsc::Sender<QualityEvent>,
    shutdown: Arc<Shutdown>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("📈 Threshold evaluation started");
        loop {
            let measurement = tokio::select! {
                () = shutdown.wait() => {
                    info!("Threshold evaluation shutting down");
                    break;
                }
                next = measurement_rx.recv() => match next {
                    Some(m) => m,
                    None => break,
                },
            };

            let component_id = measurement.component_id.clone();
            let event = match monitor.observe(measurement) {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(e) => {
                    warn!(component_id = %component_id, "Rejected measurement: {}", e);
                    continue;
                }
            };

            // Sink delivery must not hold up the next measurement.
            let alerting = dispatcher.clone();
            let alert_event = event.clone();
            tokio::spawn(async move {
                alerting.dispatch(&alert_event).await;
            });

            // Freshest signal wins: a full queue drops rather than blocks.
            if let Err(e) = event_tx.try_send(event) {
                warn!(component_id = %component_id, "Quality event not forwarded: {}", e);
            }
        }
    })
}

/// Turns qualifying events into optimization cycles.
pub fn spawn_optimization_task(
    orchestrator: Arc<CycleOrchestrator>,
    mut event_rx: mpsc::Receiver<QualityEvent>,
    shutdown: Arc<Shutdown>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("🔧 Optimization trigger loop started");
        loop {
            tokio::select! {
                () = shutdown.wait() => {
                    info!("Optimization trigger loop shutting down");
                    break;
                }
                next = event_rx.recv() => match next {
                    Some(event) => {
                        orchestrator.handle_event(&event);
                    }
                    None => break,
                },
            }
        }
    })
}

/// Periodic persistence retries and map cleanup. Runs one final flush on
/// shutdown.
pub fn spawn_maintenance_task(
    learning: Arc<LearningStore>,
    ledger: Arc<ChangeLedger>,
    governor: Arc<DeploymentGovernor>,
    cooldowns: Arc<CooldownRegistry>,
    limiters: Vec<Arc<RateLimiter>>,
    interval_secs: u64,
    shutdown: Arc<Shutdown>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        loop {
            tokio::select! {
                () = shutdown.wait() => {
                    flush(&learning, &ledger, &governor).await;
                    info!("Maintenance task shutting down");
                    break;
                }
                _ = interval.tick() => {
                    flush(&learning, &ledger, &governor).await;
                    cooldowns.cleanup();
                    for limiter in &limiters {
                        limiter.cleanup();
                    }
                }
            }
        }
    })
}

async fn flush(learning: &LearningStore, ledger: &ChangeLedger, governor: &DeploymentGovernor) {
    match learning.flush().await {
        Ok(0) => {}
        Ok(n) => debug!(count = n, "Flushed learning patterns"),
        Err(e) => warn!(pending = learning.pending_writes(), "Learning flush failed: {}", e),
    }
    if ledger.pending_writes() > 0 {
        let written = ledger.flush_pending().await;
        if written > 0 {
            info!(count = written, "Recovered queued ledger writes");
        }
    }
    if governor.has_unsaved_config() {
        governor.flush_pending().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedSource {
        batches: Mutex<Vec<Vec<QualityMeasurement>>>,
        queried: Mutex<Vec<Option<DateTime<Utc>>>>,
    }

    #[async_trait]
    impl TelemetrySource for ScriptedSource {
        fn name(&self) -> &str {
            "scripted"
        }
        async fn fetch(&self, since: Option<DateTime<Utc>>) -> anyhow::Result<Vec<QualityMeasurement>> {
            self.queried.lock().unwrap().push(since);
            let mut batches = self.batches.lock().unwrap();
            if batches.is_empty() {
                anyhow::bail!("backend unavailable");
            }
            Ok(batches.remove(0))
        }
    }

    fn measurement(score: f64) -> QualityMeasurement {
        QualityMeasurement {
            component_id: "x".to_string(),
            model_id: "m".to_string(),
            score,
            sample_size: 1,
            observed_at: Utc::now(),
            latency_ms: None,
        }
    }

    #[tokio::test]
    async fn test_ingestion_forwards_in_order_and_stops_on_shutdown() {
        let source = Arc::new(ScriptedSource {
            batches: Mutex::new(vec![vec![measurement(0.9), measurement(0.8)]]),
            ..Default::default()
        });
        let (tx, mut rx) = mpsc::channel(16);
        let shutdown = Arc::new(Shutdown::new());
        let handle = spawn_ingestion_task(source, tx, 1, shutdown.clone());

        assert_eq!(rx.recv().await.unwrap().score, 0.9);
        assert_eq!(rx.recv().await.unwrap().score, 0.8);

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("ingestion should stop")
            .unwrap();
    }

    fn measured_at(component_id: &str, score: f64, at: DateTime<Utc>) -> QualityMeasurement {
        QualityMeasurement {
            component_id: component_id.to_string(),
            observed_at: at,
            ..measurement(score)
        }
    }

    #[test]
    fn test_cursor_keeps_late_arrivals_at_same_instant() {
        let t0 = Utc::now();
        let mut cursor = IngestCursor::default();
        assert!(cursor.admit(&measured_at("a", 0.9, t0)));
        assert_eq!(cursor.since(), Some(t0));

        // Refetched at the same instant: the duplicate is dropped, the new one kept.
        assert!(!cursor.admit(&measured_at("a", 0.9, t0)));
        assert!(cursor.admit(&measured_at("b", 0.9, t0)));
        assert!(cursor.admit(&measured_at("a", 0.8, t0)));

        // Advancing forgets the previous instant.
        let t1 = t0 + chrono::Duration::seconds(1);
        assert!(cursor.admit(&measured_at("a", 0.9, t1)));
        assert_eq!(cursor.since(), Some(t1));
        assert!(cursor.admit(&measured_at("c", 0.7, t0)));
        assert_eq!(cursor.since(), Some(t1));
    }

    #[tokio::test]
    async fn test_ingestion_forwards_same_timestamp_measurement_from_later_batch() {
        let t0 = Utc::now();
        let source = Arc::new(ScriptedSource {
            batches: Mutex::new(vec![
                vec![measured_at("a", 0.9, t0)],
                // Inclusive refetch: "a" again plus "b", which landed late at t0.
                vec![measured_at("a", 0.9, t0), measured_at("b", 0.8, t0)],
            ]),
            ..Default::default()
        });
        let (tx, mut rx) = mpsc::channel(16);
        let shutdown = Arc::new(Shutdown::new());
        let handle = spawn_ingestion_task(source.clone(), tx, 1, shutdown.clone());

        let first = rx.recv().await.unwrap();
        assert_eq!(first.component_id, "a");
        let second = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("late measurement should be forwarded")
            .unwrap();
        assert_eq!(second.component_id, "b");
        assert_eq!(second.observed_at, t0);

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert!(rx.try_recv().is_err());
        let queried = source.queried.lock().unwrap().clone();
        assert_eq!(queried[0], None);
        assert_eq!(queried[1], Some(t0));
    }

    #[tokio::test]
    async fn test_evaluation_forwards_events() {
        let monitor = Arc::new(ThresholdMonitor::new(crate::quality::ThresholdConfig::default()));
        let dispatcher = Arc::new(AlertDispatcher::new(
            crate::quality::AlertConfig::default(),
            Arc::new(CooldownRegistry::new(Arc::new(crate::clock::ManualClock::default()))),
            vec![],
        ));
        let (m_tx, m_rx) = mpsc::channel(16);
        let (e_tx, mut e_rx) = mpsc::channel(16);
        let shutdown = Arc::new(Shutdown::new());
        let handle = spawn_evaluation_task(monitor, dispatcher.clone(), m_rx, e_tx, shutdown.clone());

        m_tx.send(measurement(0.97)).await.unwrap();
        m_tx.send(measurement(0.80)).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(2), e_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.tier, virtuous_shared::ThresholdTier::Critical);

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }
}
