use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::info;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AutoForward {
    pub enabled: bool,
    pub keyword: String,
}

impl Default for AutoForward {
    fn default() -> Self {
        Self {
            enabled: false,
            keyword: "/ask".to_string(),
        }
    }
}

/// Everything persisted across restarts: upstream bot tokens, the
/// workflow backend endpoint, and the auto-forward settings.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct StoredConfig {
    #[serde(default)]
    pub bot_tokens: Vec<String>,
    #[serde(default)]
    pub active_token: Option<String>,
    #[serde(default)]
    pub workflow_api_url: String,
    #[serde(default)]
    pub workflow_api_key: String,
    #[serde(default)]
    pub auto_forward: AutoForward,
}

impl StoredConfig {
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            Ok(serde_json::from_str(&content)
                .with_context(|| format!("invalid config file {}", path.display()))?)
        } else {
            let default = Self::default();
            default.save(path)?;
            Ok(default)
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}

/// Shared, persisted view of [`StoredConfig`]. Every mutation is
/// written back to disk before it is observable by readers.
pub struct ConfigStore {
    path: PathBuf,
    inner: RwLock<StoredConfig>,
}

impl ConfigStore {
    pub fn load(path: PathBuf) -> Result<Self> {
        let config = StoredConfig::load(&path)?;
        Ok(Self {
            path,
            inner: RwLock::new(config),
        })
    }

    pub async fn snapshot(&self) -> StoredConfig {
        self.inner.read().await.clone()
    }

    pub async fn active_token(&self) -> Option<String> {
        self.inner.read().await.active_token.clone()
    }

    pub async fn auto_forward(&self) -> AutoForward {
        self.inner.read().await.auto_forward.clone()
    }

    /// Add a bot token. The first token ever added becomes active.
    pub async fn add_token(&self, token: &str) -> Result<()> {
        let token = token.trim();
        if token.is_empty() {
            bail!("token is empty");
        }
        let mut config = self.inner.write().await;
        if !config.bot_tokens.iter().any(|t| t == token) {
            config.bot_tokens.push(token.to_string());
        }
        if config.active_token.is_none() {
            config.active_token = Some(token.to_string());
        }
        config.save(&self.path)?;
        info!(event = "token_added", tokens = config.bot_tokens.len());
        Ok(())
    }

    /// Select the active token. Returns whether the selection actually
    /// changed; the caller uses that to hard-restart ingestion.
    pub async fn select_token(&self, token: &str) -> Result<bool> {
        let mut config = self.inner.write().await;
        if !config.bot_tokens.iter().any(|t| t == token) {
            bail!("unknown token");
        }
        if config.active_token.as_deref() == Some(token) {
            return Ok(false);
        }
        config.active_token = Some(token.to_string());
        config.save(&self.path)?;
        info!(event = "token_selected");
        Ok(true)
    }

    pub async fn set_auto_forward(&self, settings: AutoForward) -> Result<()> {
        let mut config = self.inner.write().await;
        config.auto_forward = settings;
        config.save(&self.path)?;
        info!(
            event = "autosend_updated",
            enabled = config.auto_forward.enabled,
            keyword = %config.auto_forward.keyword
        );
        Ok(())
    }
}
