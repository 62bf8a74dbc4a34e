use std::time::Duration;

use serde::Deserialize;

/// Top-level client configuration, loaded from `lookout.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the gateway API, e.g. `http://127.0.0.1:8000/api/v1`.
    pub gateway_url: String,
    pub auth: AuthFileConfig,
    pub roster: RosterConfig,
    pub session: SessionFileConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            gateway_url: "http://127.0.0.1:8000/api/v1".to_string(),
            auth: AuthFileConfig::default(),
            roster: RosterConfig::default(),
            session: SessionFileConfig::default(),
        }
    }
}

/// Auth section of the config file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthFileConfig {
    pub password: Option<String>,
}

/// Roster polling configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RosterConfig {
    pub poll_interval_secs: u64,
}

impl Default for RosterConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
        }
    }
}

/// Streaming session configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionFileConfig {
    /// Fixed delay between reconnect attempts after a stream failure.
    pub retry_delay_secs: u64,
    /// Timeout for unary gateway calls. Never applied to the stream itself.
    pub request_timeout_secs: u64,
    /// Transcript lines retained per session before the oldest are evicted.
    pub transcript_max_lines: usize,
}

impl Default for SessionFileConfig {
    fn default() -> Self {
        Self {
            retry_delay_secs: 5,
            request_timeout_secs: 10,
            transcript_max_lines: 2048,
        }
    }
}

impl ClientConfig {
    /// Validate configuration, logging warnings for issues.
    pub fn validate(&self) {
        if reqwest::Url::parse(&self.gateway_url).is_err() {
            tracing::error!(url = %self.gateway_url, "gateway_url is not a valid URL");
            std::process::exit(1);
        }
        if self.roster.poll_interval_secs == 0 {
            tracing::error!("roster.poll_interval_secs must be > 0");
            std::process::exit(1);
        }
        if self.session.retry_delay_secs == 0 {
            tracing::error!("session.retry_delay_secs must be > 0");
            std::process::exit(1);
        }
        if self.session.request_timeout_secs == 0 {
            tracing::error!("session.request_timeout_secs must be > 0");
            std::process::exit(1);
        }
        if self.session.transcript_max_lines == 0 {
            tracing::error!("session.transcript_max_lines must be > 0");
            std::process::exit(1);
        }
        if self.auth.password.is_some() {
            tracing::warn!(
                "password is set in config file — use the LOOKOUT_PASSWORD env var in production"
            );
        }
    }

    /// Load config from `lookout.toml` if it exists, then apply env var overrides.
    pub fn load() -> Self {
        let mut config = match std::fs::read_to_string("lookout.toml") {
            Ok(content) => match toml::from_str::<ClientConfig>(&content) {
                Ok(cfg) => {
                    tracing::info!("Loaded configuration from lookout.toml");
                    cfg
                },
                Err(e) => {
                    tracing::warn!("Failed to parse lookout.toml: {e}, using defaults");
                    ClientConfig::default()
                },
            },
            Err(_) => {
                tracing::info!("No lookout.toml found, using defaults");
                ClientConfig::default()
            },
        };

        // Environment variable overrides
        if let Ok(url) = std::env::var("LOOKOUT_GATEWAY_URL")
            && !url.is_empty()
        {
            config.gateway_url = url;
        }
        if let Ok(password) = std::env::var("LOOKOUT_PASSWORD")
            && !password.is_empty()
        {
            config.auth.password = Some(password);
        }
        if let Ok(val) = std::env::var("LOOKOUT_POLL_INTERVAL_SECS")
            && let Ok(n) = val.parse::<u64>()
        {
            config.roster.poll_interval_secs = n;
        }
        if let Ok(val) = std::env::var("LOOKOUT_RETRY_DELAY_SECS")
            && let Ok(n) = val.parse::<u64>()
        {
            config.session.retry_delay_secs = n;
        }

        config
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.roster.poll_interval_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.session.retry_delay_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.session.request_timeout_secs)
    }
}
