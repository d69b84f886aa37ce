use async_trait::async_trait;
use tracing::debug;

use virtuous_shared::{ConfigTarget, SettingValue};

/// Used when the gateway reads the live configuration from this process
/// (`GET /config`) instead of receiving pushes.
#[derive(Debug, Default)]
pub struct InProcessTarget;

#[async_trait]
impl ConfigTarget for InProcessTarget {
    async fn apply(&self, component_id: &str, value: &SettingValue) -> anyhow::Result<()> {
        debug!(component_id = %component_id, setting = %value.key(), "Setting staged in-process");
        Ok(())
    }
}

/// Pushes each setting to the gateway's admin endpoint.
pub struct WebhookConfigTarget {
    client: reqwest::Client,
    url: String,
}

impl WebhookConfigTarget {
    #[must_use]
    pub fn new(client: reqwest::Client, url: String) -> Self {
        Self { client, url }
    }
}

#[async_trait]
impl ConfigTarget for WebhookConfigTarget {
    async fn apply(&self, component_id: &str, value: &SettingValue) -> anyhow::Result<()> {
        let body = serde_json::json!({
            "component_id": component_id,
            "setting": value,
        });
        let response = self.client.post(&self.url).json(&body).send().await?;
        if !response.status().is_success() {
            anyhow::bail!(
                "gateway rejected {} for '{}': HTTP {}",
                value.key(),
                component_id,
                response.status()
            );
        }
        Ok(())
    }
}
