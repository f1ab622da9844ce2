use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};

/// Reconnect policy for a node's WebSocket session.
///
/// The delay before attempt `n` is `min(initial_delay_ms * 2^n, max_delay_ms)`;
/// after `max_tries` exhausted attempts the node is marked permanently failed.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct ReconnectPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_tries: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            max_tries: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Backoff before reconnect attempt `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .initial_delay_ms
            .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
        Duration::from_millis(exp.min(self.max_delay_ms))
    }
}

/// Connection settings for one Lavalink node.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeConfig {
    /// Unique identifier the manager keys this node by.
    pub identifier: String,
    pub host: String,
    pub port: u16,
    /// Use wss/https instead of ws/http.
    pub secure: bool,
    pub password: String,

    /// When set, the node is asked to keep our session alive across a drop
    /// so a reconnecting socket can resume it.
    pub resume_key: Option<String>,
    /// How long the server should hold a resumable session, in seconds.
    pub resume_timeout_secs: u64,

    /// REST attempts per request before surfacing a network error.
    pub retry_amount: u32,

    pub reconnect: ReconnectPolicy,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            identifier: "main".to_string(),
            host: "localhost".to_string(),
            port: 2333,
            secure: false,
            password: "youshallnotpass".to_string(),
            resume_key: None,
            resume_timeout_secs: 60,
            retry_amount: 3,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl NodeConfig {
    /// Loads node settings from the environment.
    ///
    /// Reads `LAVALINK_HOST`, `LAVALINK_PORT`, `LAVALINK_PASSWORD`,
    /// `LAVALINK_SECURE`, `LAVALINK_IDENTIFIER`, `LAVALINK_RESUME_KEY` and
    /// `LAVALINK_RESUME_TIMEOUT`, falling back to the defaults above.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            identifier: std::env::var("LAVALINK_IDENTIFIER")
                .unwrap_or_else(|_| "main".to_string()),
            host: std::env::var("LAVALINK_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: std::env::var("LAVALINK_PORT")
                .unwrap_or_else(|_| "2333".to_string())
                .parse()
                .map_err(|e| Error::config(format!("LAVALINK_PORT: {e}")))?,
            secure: std::env::var("LAVALINK_SECURE")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .map_err(|e| Error::config(format!("LAVALINK_SECURE: {e}")))?,
            password: std::env::var("LAVALINK_PASSWORD")
                .unwrap_or_else(|_| "youshallnotpass".to_string()),
            resume_key: std::env::var("LAVALINK_RESUME_KEY").ok(),
            resume_timeout_secs: std::env::var("LAVALINK_RESUME_TIMEOUT")
                .unwrap_or_else(|_| "60".to_string())
                .parse()
                .map_err(|e| Error::config(format!("LAVALINK_RESUME_TIMEOUT: {e}")))?,
            retry_amount: std::env::var("LAVALINK_RETRY_AMOUNT")
                .unwrap_or_else(|_| "3".to_string())
                .parse()
                .map_err(|e| Error::config(format!("LAVALINK_RETRY_AMOUNT: {e}")))?,
            reconnect: ReconnectPolicy::default(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Sanity-checks the configuration before a node is built from it.
    pub fn validate(&self) -> Result<()> {
        if self.identifier.trim().is_empty() {
            return Err(Error::config("node identifier must not be empty"));
        }
        if self.host.trim().is_empty() {
            return Err(Error::config("node host must not be empty"));
        }
        if self.port == 0 {
            return Err(Error::config("node port must not be 0"));
        }
        if self.password.is_empty() {
            return Err(Error::config("node password must not be empty"));
        }
        if self.retry_amount == 0 {
            return Err(Error::config("retry_amount must be at least 1"));
        }
        if self.reconnect.max_tries == 0 {
            return Err(Error::config("reconnect.max_tries must be at least 1"));
        }
        if self.reconnect.max_delay_ms < self.reconnect.initial_delay_ms {
            return Err(Error::config(
                "reconnect.max_delay_ms must be >= reconnect.initial_delay_ms",
            ));
        }
        Ok(())
    }

    /// WebSocket endpoint of this node.
    pub fn websocket_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{}://{}:{}/v4/websocket", scheme, self.host, self.port)
    }

    /// Base URL for REST calls, without a trailing slash.
    pub fn rest_base(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    /// One-line description for logging, password elided.
    pub fn summary(&self) -> String {
        format!(
            "node '{}' at {}:{} (secure={}, resume={}, retries={}, reconnect={}x from {}ms)",
            self.identifier,
            self.host,
            self.port,
            self.secure,
            self.resume_key.is_some(),
            self.retry_amount,
            self.reconnect.max_tries,
            self.reconnect.initial_delay_ms,
        )
    }
}

/// Per-player defaults applied when the manager creates a player.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct PlayerConfig {
    /// Initial volume in `[0, 1000]`, 100 = unity gain.
    pub initial_volume: u16,
    pub self_deaf: bool,
    pub self_mute: bool,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            initial_volume: 100,
            self_deaf: true,
            self_mute: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        let config = NodeConfig::default();
        assert_eq!(config.websocket_url(), "ws://localhost:2333/v4/websocket");
        assert_eq!(config.rest_base(), "http://localhost:2333");

        let secure = NodeConfig {
            secure: true,
            host: "lava.example.com".to_string(),
            port: 443,
            ..NodeConfig::default()
        };
        assert_eq!(
            secure.websocket_url(),
            "wss://lava.example.com:443/v4/websocket"
        );
        assert_eq!(secure.rest_base(), "https://lava.example.com:443");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = NodeConfig::default();
        assert!(config.validate().is_ok());

        let config = NodeConfig {
            password: String::new(),
            ..NodeConfig::default()
        };
        assert!(config.validate().is_err());

        let config = NodeConfig {
            port: 0,
            ..NodeConfig::default()
        };
        assert!(config.validate().is_err());

        let config = NodeConfig {
            retry_amount: 0,
            ..NodeConfig::default()
        };
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.reconnect.max_delay_ms = 10;
        config.reconnect.initial_delay_ms = 1_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_caps_at_max() {
        let policy = ReconnectPolicy {
            initial_delay_ms: 1_000,
            max_delay_ms: 8_000,
            max_tries: 10,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(1), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(4_000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(8_000));
        assert_eq!(policy.delay_for(20), Duration::from_millis(8_000));
        assert_eq!(policy.delay_for(64), Duration::from_millis(8_000));
    }

    #[test]
    fn test_summary_elides_password() {
        let config = NodeConfig {
            password: "hunter2".to_string(),
            ..NodeConfig::default()
        };
        assert!(!config.summary().contains("hunter2"));
    }
}
