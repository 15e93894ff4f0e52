//! Engine configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Reconnection policy settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Reconnect automatically after an unexpected close.
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Delay before the first attempt, in milliseconds.
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    /// Ceiling for the exponential backoff, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Growth factor applied per failed attempt.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Maximum attempts per outage (`None` = retry forever).
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

fn bool_true() -> bool { true }
fn default_min_delay_ms() -> u64 { 500 }
fn default_max_delay_ms() -> u64 { 60_000 }
fn default_multiplier() -> f64 { 2.0 }

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    /// No automatic reconnection.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Field names of the notification envelope, plus the optional version tag
/// stamped on outgoing requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeConfig {
    /// `"jsonrpc"` tag added to requests, e.g. `Some("2.0")`.
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default = "default_params_field")]
    pub params_field: String,
    #[serde(default = "default_subscription_field")]
    pub subscription_field: String,
    #[serde(default = "default_result_field")]
    pub result_field: String,
}

fn default_params_field() -> String { "params".into() }
fn default_subscription_field() -> String { "subscription".into() }
fn default_result_field() -> String { "result".into() }

impl Default for EnvelopeConfig {
    fn default() -> Self {
        Self {
            jsonrpc: None,
            params_field: default_params_field(),
            subscription_field: default_subscription_field(),
            result_field: default_result_field(),
        }
    }
}

/// Top-level configuration of one engine instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// WebSocket endpoint, e.g. `"ws://localhost:8545"`.
    pub url: String,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    /// Per-request timeout in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Subprotocols offered in `Sec-WebSocket-Protocol`.
    #[serde(default)]
    pub protocols: Vec<String>,
    #[serde(default)]
    pub envelope: EnvelopeConfig,
    /// Method used to cancel a subscription server-side. `None` means
    /// subscriptions are only dropped locally.
    #[serde(default)]
    pub unsubscribe_method: Option<String>,
    /// Attach identical subscribe requests to one server subscription.
    #[serde(default)]
    pub share_subscriptions: bool,
}

fn default_request_timeout_ms() -> u64 { 30_000 }

impl EngineConfig {
    /// Configuration with defaults for everything but the endpoint.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect: ReconnectConfig::default(),
            request_timeout_ms: default_request_timeout_ms(),
            protocols: vec![],
            envelope: EnvelopeConfig::default(),
            unsubscribe_method: None,
            share_subscriptions: false,
        }
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_unsubscribe_method(mut self, method: impl Into<String>) -> Self {
        self.unsubscribe_method = Some(method.into());
        self
    }

    pub fn with_shared_subscriptions(mut self, share: bool) -> Self {
        self.share_subscriptions = share;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Parse and validate a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    /// Check invariants the engine relies on.
    pub fn validate(&self) -> Result<(), EngineError> {
        let url = url::Url::parse(&self.url)
            .map_err(|e| EngineError::Config(format!("invalid url {:?}: {e}", self.url)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(EngineError::Config(format!(
                "url scheme must be ws or wss, got {:?}",
                url.scheme()
            )));
        }
        if self.request_timeout_ms == 0 {
            return Err(EngineError::Config("request_timeout_ms must be > 0".into()));
        }
        let r = &self.reconnect;
        if r.min_delay_ms > r.max_delay_ms {
            return Err(EngineError::Config(format!(
                "reconnect.min_delay_ms ({}) exceeds max_delay_ms ({})",
                r.min_delay_ms, r.max_delay_ms
            )));
        }
        if r.multiplier.is_nan() || r.multiplier < 1.0 {
            return Err(EngineError::Config(format!(
                "reconnect.multiplier must be >= 1.0, got {}",
                r.multiplier
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_json_uses_defaults() {
        let config = EngineConfig::from_json(r#"{"url": "ws://localhost:8545"}"#).unwrap();
        assert_eq!(config, EngineConfig::new("ws://localhost:8545"));
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert!(config.reconnect.enabled);
        assert_eq!(config.reconnect.max_attempts, None);
        assert_eq!(config.envelope.subscription_field, "subscription");
    }

    #[test]
    fn full_json_overrides() {
        let config = EngineConfig::from_json(
            r#"{
                "url": "wss://node.example/ws",
                "reconnect": {"enabled": true, "min_delay_ms": 10, "max_delay_ms": 100, "max_attempts": 1},
                "request_timeout_ms": 50,
                "protocols": ["jsonrpc"],
                "envelope": {"jsonrpc": "2.0"},
                "unsubscribe_method": "unsubscribe",
                "share_subscriptions": true
            }"#,
        )
        .unwrap();
        assert_eq!(config.reconnect.min_delay(), Duration::from_millis(10));
        assert_eq!(config.reconnect.max_attempts, Some(1));
        assert_eq!(config.reconnect.multiplier, 2.0);
        assert_eq!(config.envelope.jsonrpc.as_deref(), Some("2.0"));
        assert_eq!(config.envelope.params_field, "params");
        assert_eq!(config.unsubscribe_method.as_deref(), Some("unsubscribe"));
        assert!(config.share_subscriptions);
    }

    #[test]
    fn rejects_non_websocket_url() {
        let err = EngineConfig::new("https://node.example").validate().unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
        assert!(EngineConfig::new("not a url").validate().is_err());
    }

    #[test]
    fn rejects_inverted_backoff_bounds() {
        let config = EngineConfig::new("ws://localhost:8545").with_reconnect(ReconnectConfig {
            min_delay_ms: 1_000,
            max_delay_ms: 10,
            ..ReconnectConfig::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_timeout() {
        let config = EngineConfig::new("ws://localhost:8545").with_request_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }
}
