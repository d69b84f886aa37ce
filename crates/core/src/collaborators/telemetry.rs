use async_trait::async_trait;
use chrono::{DateTime, Utc};

use virtuous_shared::{QualityMeasurement, TelemetrySource};

/// Pulls measurements from the tracing backend's export endpoint.
///
/// `GET {url}?since=<rfc3339>` must return a JSON array of measurements
/// observed at or after `since`, in arrival order.
pub struct HttpTelemetrySource {
    client: reqwest::Client,
    url: String,
}

impl HttpTelemetrySource {
    #[must_use]
    pub fn new(client: reqwest::Client, url: String) -> Self {
        Self { client, url }
    }
}

#[async_trait]
impl TelemetrySource for HttpTelemetrySource {
    fn name(&self) -> &str {
        "http"
    }

    async fn fetch(&self, since: Option<DateTime<Utc>>) -> anyhow::Result<Vec<QualityMeasurement>> {
        let mut request = self.client.get(&self.url);
        if let Some(since) = since {
            request = request.query(&[("since", since.to_rfc3339())]);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            anyhow::bail!("telemetry source responded with HTTP {}", response.status());
        }
        let mut batch: Vec<QualityMeasurement> = response.json().await?;
        // The backend filter is advisory. Measurements at the cursor instant
        // are kept; the ingestion loop drops the ones it already forwarded.
        if let Some(since) = since {
            batch.retain(|m| m.observed_at >= since);
        }
        Ok(batch)
    }
}
