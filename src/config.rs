use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::delta::DeltaView;
use crate::delta_fetcher::DeltaOptions;
use crate::error::{NylasError, Result};
use crate::tunnel::{ReconnectPolicy, Region, TunnelConfig};
use crate::webhook::WebhookTrigger;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub delta: DeltaConfig,
    #[serde(default)]
    pub tunnel: TunnelSettings,
    #[serde(default)]
    pub webhook: WebhookConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_server")]
    pub server: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            server: default_api_server(),
            client_id: String::new(),
            client_secret: String::new(),
            access_token: None,
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaConfig {
    /// No limit when unset: the stream runs until the server closes it
    #[serde(default)]
    pub stream_timeout_secs: Option<u64>,
    #[serde(default = "default_longpoll_timeout_secs")]
    pub longpoll_timeout_secs: u64,
    #[serde(default = "default_longpoll_grace_secs")]
    pub longpoll_grace_secs: u64,
    #[serde(default)]
    pub view: Option<DeltaView>,
}

impl Default for DeltaConfig {
    fn default() -> Self {
        Self {
            stream_timeout_secs: None,
            longpoll_timeout_secs: default_longpoll_timeout_secs(),
            longpoll_grace_secs: default_longpoll_grace_secs(),
            view: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSettings {
    #[serde(default = "default_relay_url")]
    pub relay_url: String,
    #[serde(default = "default_callback_domain")]
    pub callback_domain: String,
    #[serde(default)]
    pub region: Region,
    /// Empty means every known trigger
    #[serde(default)]
    pub triggers: Vec<WebhookTrigger>,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_reconnect")]
    pub reconnect: bool,
    #[serde(default = "default_max_reconnect_elapsed_secs")]
    pub max_reconnect_elapsed_secs: u64,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            relay_url: default_relay_url(),
            callback_domain: default_callback_domain(),
            region: Region::default(),
            triggers: Vec::new(),
            ping_interval_secs: default_ping_interval_secs(),
            reconnect: default_reconnect(),
            max_reconnect_elapsed_secs: default_max_reconnect_elapsed_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Falls back to `api.client_secret` when unset
    #[serde(default)]
    pub signing_secret: Option<String>,
    #[serde(default = "default_webhook_path")]
    pub path: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            signing_secret: None,
            path: default_webhook_path(),
        }
    }
}

fn default_api_server() -> String {
    "https://api.nylas.com".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_longpoll_timeout_secs() -> u64 {
    120
}

fn default_longpoll_grace_secs() -> u64 {
    10
}

fn default_relay_url() -> String {
    "wss://tunnel.nylas.com".to_string()
}

fn default_callback_domain() -> String {
    "cb.nylas.com".to_string()
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_reconnect() -> bool {
    true
}

fn default_max_reconnect_elapsed_secs() -> u64 {
    300
}

fn default_webhook_path() -> String {
    "/webhook".to_string()
}

impl Config {
    pub async fn load(path: &Path) -> Result<Self> {
        // If file doesn't exist, return default config with warning
        if !path.exists() {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| NylasError::ConfigError(format!("Failed to read config file: {}", e)))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| NylasError::ConfigError(format!("Failed to parse config file: {}", e)))?;

        config.validate()?;

        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                NylasError::ConfigError(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| NylasError::ConfigError(format!("Failed to serialize config: {}", e)))?;

        tokio::fs::write(path, content)
            .await
            .map_err(|e| NylasError::ConfigError(format!("Failed to write config file: {}", e)))?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Override credentials from `NYLAS_*` environment variables
    pub fn apply_env(&mut self) {
        if let Ok(value) = std::env::var("NYLAS_CLIENT_ID") {
            self.api.client_id = value;
        }
        if let Ok(value) = std::env::var("NYLAS_CLIENT_SECRET") {
            self.api.client_secret = value;
        }
        if let Ok(value) = std::env::var("NYLAS_ACCESS_TOKEN") {
            self.api.access_token = Some(value);
        }
        if let Ok(value) = std::env::var("NYLAS_API_SERVER") {
            self.api.server = value;
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.api.server).map_err(|e| {
            NylasError::ConfigError(format!("api.server is not a valid URL: {}", e))
        })?;

        if self.api.request_timeout_secs == 0 {
            return Err(NylasError::ConfigError(
                "api.request_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.api.max_retries > 10 {
            return Err(NylasError::ConfigError(
                "api.max_retries cannot exceed 10".to_string(),
            ));
        }

        if self.delta.stream_timeout_secs == Some(0) {
            return Err(NylasError::ConfigError(
                "delta.stream_timeout_secs must be at least 1 when set".to_string(),
            ));
        }
        if self.delta.longpoll_timeout_secs == 0 {
            return Err(NylasError::ConfigError(
                "delta.longpoll_timeout_secs must be at least 1".to_string(),
            ));
        }

        let relay = url::Url::parse(&self.tunnel.relay_url).map_err(|e| {
            NylasError::ConfigError(format!("tunnel.relay_url is not a valid URL: {}", e))
        })?;
        if !matches!(relay.scheme(), "ws" | "wss") {
            return Err(NylasError::ConfigError(format!(
                "tunnel.relay_url must use ws:// or wss://, got '{}'",
                relay.scheme()
            )));
        }
        if self.tunnel.callback_domain.is_empty() || self.tunnel.callback_domain.contains('/') {
            return Err(NylasError::ConfigError(
                "tunnel.callback_domain must be a bare host name".to_string(),
            ));
        }
        if self.tunnel.ping_interval_secs == 0 {
            return Err(NylasError::ConfigError(
                "tunnel.ping_interval_secs must be at least 1".to_string(),
            ));
        }

        if !self.webhook.path.starts_with('/') {
            return Err(NylasError::ConfigError(
                "webhook.path must start with '/'".to_string(),
            ));
        }

        tracing::debug!("Configuration validation passed");
        Ok(())
    }

    /// Secret used to verify inbound webhook signatures
    pub fn webhook_secret(&self) -> &str {
        self.webhook
            .signing_secret
            .as_deref()
            .unwrap_or(&self.api.client_secret)
    }

    pub fn longpoll_timeout(&self) -> Duration {
        Duration::from_secs(self.delta.longpoll_timeout_secs)
    }

    pub fn stream_timeout(&self) -> Option<Duration> {
        self.delta.stream_timeout_secs.map(Duration::from_secs)
    }

    pub fn longpoll_grace(&self) -> Duration {
        Duration::from_secs(self.delta.longpoll_grace_secs)
    }

    /// Delta filters carrying the configured view; type filters stay per call
    pub fn delta_options(&self) -> DeltaOptions {
        match self.delta.view {
            Some(view) => DeltaOptions::new().view(view),
            None => DeltaOptions::new(),
        }
    }

    pub fn tunnel_config(&self) -> TunnelConfig {
        let triggers = if self.tunnel.triggers.is_empty() {
            WebhookTrigger::all().to_vec()
        } else {
            self.tunnel.triggers.clone()
        };

        TunnelConfig {
            relay_url: self.tunnel.relay_url.clone(),
            callback_domain: self.tunnel.callback_domain.clone(),
            region: self.tunnel.region,
            triggers,
            ping_interval: Duration::from_secs(self.tunnel.ping_interval_secs),
            reconnect: ReconnectPolicy {
                enabled: self.tunnel.reconnect,
                max_elapsed: Duration::from_secs(self.tunnel.max_reconnect_elapsed_secs),
                ..ReconnectPolicy::default()
            },
        }
    }
}
