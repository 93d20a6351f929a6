//! Server configuration.
//!
//! Configuration is layered, later sources winning:
//! - Built-in defaults (`PORT` / `ROOMCAST_HOST` seed the bind address)
//! - TOML configuration file
//! - Environment variables (`ROOMCAST__SECTION__KEY`)

use anyhow::{bail, ensure, Context, Result};
use roomcast_core::SessionConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file locations, in lookup order.
pub const CONFIG_PATHS: [&str; 3] = [
    "roomcast.toml",
    "/etc/roomcast/roomcast.toml",
    "~/.config/roomcast/roomcast.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Authentication configuration.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Cross-origin configuration.
    #[serde(default)]
    pub cors: CorsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for the WebSocket endpoint. `{path}/:room_type/:room_id` joins
    /// that room on connect.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Largest accepted inbound frame in bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Per-client outbound queue capacity in frames.
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,

    /// Maximum number of concurrent connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Per-frame write deadline in milliseconds.
    #[serde(default = "default_write_wait")]
    pub write_wait_ms: u64,

    /// Read deadline in milliseconds, refreshed by each pong.
    #[serde(default = "default_pong_wait")]
    pub pong_wait_ms: u64,

    /// Ping interval in milliseconds.
    #[serde(default = "default_ping_period")]
    pub ping_period_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,

    /// Hub statistics sampling interval in milliseconds.
    #[serde(default = "default_sample_interval")]
    pub sample_interval_ms: u64,
}

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Accepted bearer tokens.
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,

    /// HMAC secret for signed tokens carrying a `user_id` claim.
    #[serde(default = "default_jwt_secret", skip_serializing_if = "Option::is_none")]
    pub jwt_secret: Option<String>,
}

/// A bearer token and the user it identifies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenEntry {
    /// Opaque token string.
    pub token: String,
    /// User the token authenticates as.
    pub user_id: u64,
}

/// Cross-origin configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Origins allowed to call the HTTP endpoints.
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
}

fn default_host() -> String {
    std::env::var("ROOMCAST_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_jwt_secret() -> Option<String> {
    std::env::var("JWT_SECRET").ok().filter(|secret| !secret.is_empty())
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_frame_size() -> usize {
    roomcast_protocol::MAX_FRAME_SIZE
}

fn default_outbound_capacity() -> usize {
    roomcast_core::client::DEFAULT_OUTBOUND_CAPACITY
}

fn default_max_connections() -> usize {
    10_000
}

fn default_write_wait() -> u64 {
    10_000
}

fn default_pong_wait() -> u64 {
    60_000
}

fn default_ping_period() -> u64 {
    54_000
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_sample_interval() -> u64 {
    5_000
}

fn default_allowed_origins() -> Vec<String> {
    vec!["http://localhost:3000".to_string()]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
            auth: AuthConfig::default(),
            cors: CorsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_frame_size: default_max_frame_size(),
            outbound_capacity: default_outbound_capacity(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            write_wait_ms: default_write_wait(),
            pong_wait_ms: default_pong_wait(),
            ping_period_ms: default_ping_period(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
            sample_interval_ms: default_sample_interval(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            tokens: Vec::new(),
            jwt_secret: default_jwt_secret(),
        }
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: default_allowed_origins(),
        }
    }
}

impl Config {
    /// Load configuration from the first config file found (or defaults),
    /// apply environment overrides and validate the result.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, an
    /// override has the wrong type, or validation fails.
    pub fn load() -> Result<Self> {
        let base = match Self::find_file() {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };

        let config = base.with_overrides(
            config::Environment::with_prefix("ROOMCAST")
                .separator("__")
                .try_parsing(true),
        )?;
        config.validate()?;
        Ok(config)
    }

    fn find_file() -> Option<PathBuf> {
        CONFIG_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Layer `overrides` on top of this configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if an override cannot be deserialized into its field.
    pub fn with_overrides(&self, overrides: config::Environment) -> Result<Self> {
        config::Config::builder()
            .add_source(config::Config::try_from(self).context("Failed to serialize config")?)
            .add_source(overrides)
            .build()
            .context("Failed to apply environment overrides")?
            .try_deserialize()
            .context("Invalid environment override")
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.limits.max_frame_size > 0, "limits.max_frame_size must be positive");
        ensure!(
            self.limits.outbound_capacity > 0,
            "limits.outbound_capacity must be positive"
        );
        ensure!(
            self.limits.max_connections > 0,
            "limits.max_connections must be positive"
        );
        ensure!(
            self.heartbeat.write_wait_ms > 0,
            "heartbeat.write_wait_ms must be positive"
        );
        ensure!(
            self.heartbeat.ping_period_ms > 0,
            "heartbeat.ping_period_ms must be positive"
        );
        if self.heartbeat.ping_period_ms >= self.heartbeat.pong_wait_ms {
            bail!(
                "heartbeat.ping_period_ms ({}) must be less than heartbeat.pong_wait_ms ({})",
                self.heartbeat.ping_period_ms,
                self.heartbeat.pong_wait_ms
            );
        }
        ensure!(
            self.transport.websocket_path.starts_with('/'),
            "transport.websocket_path must start with '/'"
        );
        ensure!(
            self.metrics.sample_interval_ms > 0,
            "metrics.sample_interval_ms must be positive"
        );
        if let Some(secret) = &self.auth.jwt_secret {
            ensure!(!secret.is_empty(), "auth.jwt_secret must not be empty");
        }
        self.bind_addr()?;
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a valid socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Per-connection session settings.
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            write_wait: Duration::from_millis(self.heartbeat.write_wait_ms),
            pong_wait: Duration::from_millis(self.heartbeat.pong_wait_ms),
            ping_period: Duration::from_millis(self.heartbeat.ping_period_ms),
            outbound_capacity: self.limits.outbound_capacity,
            max_frame_size: self.limits.max_frame_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> config::Environment {
        let source: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        config::Environment::with_prefix("ROOMCAST")
            .separator("__")
            .try_parsing(true)
            .source(Some(source))
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.transport.websocket_path, "/ws");
        assert_eq!(config.limits.max_frame_size, 512);
        assert_eq!(config.limits.outbound_capacity, 256);
        assert_eq!(config.cors.allowed_origins, vec!["http://localhost:3000"]);
        assert!(config.auth.tokens.is_empty());
    }

    #[test]
    fn test_default_session_config() {
        let session = Config::default().session_config();
        assert_eq!(session.write_wait, Duration::from_secs(10));
        assert_eq!(session.pong_wait, Duration::from_secs(60));
        assert_eq!(session.ping_period, Duration::from_secs(54));
        assert_eq!(session.outbound_capacity, 256);
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [limits]
            max_connections = 500

            [heartbeat]
            pong_wait_ms = 30000
            ping_period_ms = 27000

            [[auth.tokens]]
            token = "s3cret"
            user_id = 42

            [cors]
            allowed_origins = ["https://app.example.com"]
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.limits.max_connections, 500);
        assert_eq!(config.limits.max_frame_size, 512);
        assert_eq!(config.heartbeat.ping_period_ms, 27_000);
        assert_eq!(config.auth.tokens[0].token, "s3cret");
        assert_eq!(config.auth.tokens[0].user_id, 42);
        assert_eq!(config.cors.allowed_origins, vec!["https://app.example.com"]);
        config.validate().unwrap();
    }

    #[test]
    fn test_environment_overrides() {
        let config = Config::default()
            .with_overrides(env(&[
                ("ROOMCAST__PORT", "7000"),
                ("ROOMCAST__LIMITS__OUTBOUND_CAPACITY", "64"),
                ("ROOMCAST__METRICS__ENABLED", "false"),
            ]))
            .unwrap();

        assert_eq!(config.port, 7000);
        assert_eq!(config.limits.outbound_capacity, 64);
        assert!(!config.metrics.enabled);
        assert_eq!(config.limits.max_frame_size, 512);
    }

    #[test]
    fn test_jwt_secret_from_toml_and_env() {
        let config: Config = toml::from_str(
            r#"
            [auth]
            jwt_secret = "hmac-key"
        "#,
        )
        .unwrap();
        assert_eq!(config.auth.jwt_secret.as_deref(), Some("hmac-key"));
        config.validate().unwrap();

        let config = config
            .with_overrides(env(&[("ROOMCAST__AUTH__JWT_SECRET", "rotated")]))
            .unwrap();
        assert_eq!(config.auth.jwt_secret.as_deref(), Some("rotated"));
    }

    #[test]
    fn test_validate_rejects_empty_jwt_secret() {
        let mut config = Config::default();
        config.auth.jwt_secret = Some(String::new());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("jwt_secret"));
    }

    #[test]
    fn test_invalid_override() {
        let result = Config::default().with_overrides(env(&[("ROOMCAST__PORT", "not-a-port")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_ping_after_pong_wait() {
        let mut config = Config::default();
        config.heartbeat.ping_period_ms = config.heartbeat.pong_wait_ms;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("ping_period_ms"));
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let mut config = Config::default();
        config.limits.outbound_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.limits.max_frame_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_bind_addr() {
        let mut config = Config::default();
        config.host = "127.0.0.1".into();
        config.port = 8081;
        assert_eq!(config.bind_addr().unwrap().port(), 8081);

        config.host = "not a host".into();
        assert!(config.bind_addr().is_err());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_missing_file() {
        let err = Config::from_file("/nonexistent/roomcast.toml").unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
