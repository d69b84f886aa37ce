use anyhow::{Context, Result};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;

use crate::config::CliConfig;

pub struct VirtuousClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl VirtuousClient {
    pub fn new(config: &CliConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn add_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.header("X-API-Key", key),
            None => req,
        }
    }

    /// Unwraps the engine's error envelope into `"<status> <type>: <message>"`.
    async fn parse<T: DeserializeOwned>(resp: Response) -> Result<T> {
        let status = resp.status();
        if !status.is_success() {
            let body: serde_json::Value = resp.json().await.unwrap_or_default();
            let kind = body
                .get("error")
                .and_then(|e| e.get("type"))
                .and_then(|t| t.as_str())
                .unwrap_or("Error");
            let msg = body
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or("Unknown error");
            anyhow::bail!("{status} {kind}: {msg}");
        }
        resp.json::<T>().await.context("Failed to parse response")
    }

    /// GET request returning deserialized JSON.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let req = self.client.get(self.url(path));
        let resp = self
            .add_auth(req)
            .send()
            .await
            .context("Failed to connect to Virtuous engine")?;
        Self::parse(resp).await
    }

    /// POST request with JSON body, returning deserialized JSON.
    pub async fn post<B: serde::Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let req = self.client.post(self.url(path)).json(body);
        let resp = self
            .add_auth(req)
            .send()
            .await
            .context("Failed to connect to Virtuous engine")?;
        Self::parse(resp).await
    }

    pub async fn get_status(&self) -> Result<serde_json::Value> {
        self.get("/status").await
    }

    pub async fn get_changes(&self, limit: usize) -> Result<serde_json::Value> {
        self.get(&format!("/changes?limit={limit}")).await
    }

    pub async fn trigger(&self, component_id: &str, reason: Option<&str>) -> Result<serde_json::Value> {
        let body = serde_json::json!({ "component_id": component_id, "reason": reason });
        self.post("/trigger", &body).await
    }

    pub async fn rollback(&self, target_cycle_id: Option<&str>) -> Result<serde_json::Value> {
        let body = serde_json::json!({ "target_cycle_id": target_cycle_id });
        self.post("/rollback", &body).await
    }

    pub async fn clear_history(&self) -> Result<serde_json::Value> {
        self.post("/clear-history", &serde_json::json!({})).await
    }

    pub async fn get_cycles(&self, limit: usize) -> Result<serde_json::Value> {
        self.get(&format!("/cycles?limit={limit}")).await
    }

    pub async fn get_alerts(&self, limit: usize, unresolved: bool) -> Result<serde_json::Value> {
        self.get(&format!("/alerts?limit={limit}&unresolved={unresolved}"))
            .await
    }

    pub async fn resolve_alert(&self, id: &str) -> Result<serde_json::Value> {
        self.post(&format!("/alerts/{id}/resolve"), &serde_json::json!({}))
            .await
    }

    pub async fn get_learning(&self, component: Option<&str>) -> Result<serde_json::Value> {
        match component {
            Some(c) => self.get(&format!("/learning?context={c}")).await,
            None => self.get("/learning").await,
        }
    }

    pub async fn get_live_config(&self, component: Option<&str>) -> Result<serde_json::Value> {
        match component {
            Some(c) => self.get(&format!("/config?component={c}")).await,
            None => self.get("/config").await,
        }
    }

    pub async fn set_live_config(
        &self,
        component_id: &str,
        setting: &virtuous_shared::SettingValue,
        reason: &str,
    ) -> Result<serde_json::Value> {
        let body = serde_json::json!({
            "component_id": component_id,
            "setting": setting,
            "reason": reason,
        });
        self.post("/config", &body).await
    }
}
