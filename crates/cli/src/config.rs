use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const URL_ENV: &str = "VIRTUOUS_URL";
pub const API_KEY_ENV: &str = "VIRTUOUS_API_KEY";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_url() -> String {
    "http://127.0.0.1:8090".to_string()
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            api_key: None,
        }
    }
}

impl CliConfig {
    /// Config file path: ~/.config/virtuous/cli.toml
    pub fn path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Cannot determine config directory")?
            .join("virtuous");
        Ok(config_dir.join("cli.toml"))
    }

    /// File values, then `VIRTUOUS_URL` / `VIRTUOUS_API_KEY` on top.
    pub fn load() -> Result<Self> {
        let mut config = Self::read(&Self::path()?)?;
        config.apply_overrides(
            std::env::var(URL_ENV).ok(),
            std::env::var(API_KEY_ENV).ok(),
        );
        Ok(config)
    }

    fn apply_overrides(&mut self, url: Option<String>, api_key: Option<String>) {
        if let Some(url) = url.filter(|u| !u.trim().is_empty()) {
            self.url = url;
        }
        if let Some(key) = api_key.filter(|k| !k.trim().is_empty()) {
            self.api_key = Some(key);
        }
    }

    fn read(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    fn set_key(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "url" => {
                if !value.starts_with("http://") && !value.starts_with("https://") {
                    anyhow::bail!("url must start with http:// or https://");
                }
                self.url = value.to_string();
            }
            "api_key" => self.api_key = Some(value.to_string()),
            _ => anyhow::bail!("Unknown config key: {key}. Valid keys: url, api_key"),
        }
        Ok(())
    }

    /// Set a single config key and save. Reads the file only, so env
    /// credentials are never written to disk.
    pub fn set(key: &str, value: &str) -> Result<()> {
        let path = Self::path()?;
        let mut config = Self::read(&path)?;
        config.set_key(key, value)?;
        config.write(&path)
    }

    /// `abcd...wxyz` for long keys, `***` for short ones.
    pub fn masked_api_key(&self) -> Option<String> {
        self.api_key.as_ref().map(|k| {
            if k.len() > 8 {
                format!("{}...{}", &k[..4], &k[k.len() - 4..])
            } else {
                "***".to_string()
            }
        })
    }
}
