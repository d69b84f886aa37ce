//! Alert delivery channels.

use async_trait::async_trait;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use virtuous_shared::{Alert, AlertSeverity, AlertSink};

/// Writes alerts to the process log at a level matching their severity.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl AlertSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, alert: &Alert) -> anyhow::Result<()> {
        match alert.severity {
            AlertSeverity::Critical | AlertSeverity::High => error!(
                alert_id = %alert.id,
                component_id = %alert.component_id,
                severity = %alert.severity,
                "🚨 {}",
                alert.message
            ),
            AlertSeverity::Medium => warn!(
                alert_id = %alert.id,
                component_id = %alert.component_id,
                "⚠️ {}",
                alert.message
            ),
            AlertSeverity::Low => info!(
                alert_id = %alert.id,
                component_id = %alert.component_id,
                "{}",
                alert.message
            ),
        }
        Ok(())
    }
}

/// Appends one JSON document per alert to a durable file.
pub struct FileSink {
    path: PathBuf,
    // Serializes appends so concurrent alerts never interleave lines.
    write_lock: Mutex<()>,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl AlertSink for FileSink {
    fn name(&self) -> &str {
        "file"
    }

    async fn deliver(&self, alert: &Alert) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(alert)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to open alert log {}: {}", self.path.display(), e))?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Posts alerts to an HTTP endpoint (chat webhook or email relay).
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    #[must_use]
    pub fn new(client: reqwest::Client, url: String) -> Self {
        Self { client, url }
    }
}

#[async_trait]
impl AlertSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, alert: &Alert) -> anyhow::Result<()> {
        let body = serde_json::json!({
            "subject": format!("[{}] {}", alert.severity, alert.component_id),
            "text": alert.message,
            "alert": alert,
        });
        let response = self.client.post(&self.url).json(&body).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("webhook responded with HTTP {}", response.status());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn alert(id: &str) -> Alert {
        Alert {
            id: id.to_string(),
            severity: AlertSeverity::High,
            component_id: "summarizer".to_string(),
            message: "quality dropped".to_string(),
            created_at: Utc::now(),
            resolved: false,
            cooldown_key: "summarizer:trend".to_string(),
        }
    }

    #[tokio::test]
    async fn test_file_sink_appends_json_lines() {
        let dir = std::env::temp_dir().join(format!("virtuous-alerts-{}", uuid::Uuid::new_v4()));
        let path = dir.join("alerts.jsonl");
        let sink = FileSink::new(&path);

        sink.deliver(&alert("a1")).await.unwrap();
        sink.deliver(&alert("a2")).await.unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let ids: Vec<String> = content
            .lines()
            .map(|l| serde_json::from_str::<Alert>(l).unwrap().id)
            .collect();
        assert_eq!(ids, vec!["a1", "a2"]);

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
