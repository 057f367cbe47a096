//! Client configuration.
//!
//! Values come from an optional TOML file and are then overridden by the
//! `QINGWANG_*` environment variables. Every field has a default matching the
//! stock backend deployment, so an empty file is a valid config.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ChatError, Result};
use crate::mission::Mission;

pub const ENV_API_BASE: &str = "QINGWANG_API_BASE";
pub const ENV_CHANNEL_URL: &str = "QINGWANG_CHANNEL_URL";
pub const ENV_TOKEN: &str = "QINGWANG_TOKEN";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Base URL of the REST API.
    pub api_base: String,
    /// Base WebSocket URL of the channel server.
    pub channel_url: String,
    /// Socket.IO namespace carrying chunk events.
    pub namespace: String,
    /// Session token sent as the `Authorization` header and channel auth.
    pub token: Option<String>,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub statute_top_k: u32,
    pub case_top_k: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            api_base: "http://127.0.0.1:6006".to_string(),
            channel_url: "ws://127.0.0.1:6006".to_string(),
            namespace: "/chat".to_string(),
            token: None,
            connect_timeout_ms: 5_000,
            request_timeout_ms: 60_000,
            statute_top_k: 5,
            case_top_k: 3,
        }
    }
}

impl ClientConfig {
    /// Load from `path` (if given), apply environment overrides, validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ChatError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| ChatError::Config(e.to_string()))
    }

    /// Override fields from an environment lookup.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_API_BASE) {
            self.api_base = v;
        }
        if let Some(v) = lookup(ENV_CHANNEL_URL) {
            self.channel_url = v;
        }
        if let Some(v) = lookup(ENV_TOKEN).filter(|t| !t.trim().is_empty()) {
            self.token = Some(v);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.api_base.trim().is_empty() {
            return Err(ChatError::Config("api_base must not be empty".into()));
        }
        if self.channel_url.trim().is_empty() {
            return Err(ChatError::Config("channel_url must not be empty".into()));
        }
        if !self.namespace.starts_with('/') {
            return Err(ChatError::Config(format!(
                "namespace must start with '/', got '{}'",
                self.namespace
            )));
        }
        if self.statute_top_k == 0 || self.case_top_k == 0 {
            return Err(ChatError::Config("top_k values must be at least 1".into()));
        }
        Ok(())
    }

    /// Number of results requested for a retrieval mission.
    pub fn top_k(&self, mission: Mission) -> Option<u32> {
        match mission {
            Mission::StatuteSearch => Some(self.statute_top_k),
            Mission::CaseSearch => Some(self.case_top_k),
            Mission::Consultation | Mission::VerdictPrediction => None,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
