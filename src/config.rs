//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `TOWERS_LISTEN`, `TOWERS_REQUEST_TIMEOUT_SECS`,
//!    `TOWERS_AGENT_URL`, `TOWERS_AGENT_ID`, `TOWERS_AGENT_UPSTREAM`
//! 2. **Config file** — path via `--config <path>`, or `towers-tunnel.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8091"
//! max_body_bytes = 10485760  # 10 MB
//!
//! [tunnel]
//! request_timeout_secs = 120
//! channel_buffer = 256
//!
//! [logging]
//! level = "info"
//!
//! # Optional — only read by `towers-tunnel agent`
//! [agent]
//! url = "ws://relay.example.com:8091/"
//! id = "dev1"
//! upstream = "http://127.0.0.1:8080"
//! reconnect_delay_secs = 5
//! reconnect_max_delay_secs = 60
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Config file looked up in the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "towers-tunnel.toml";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Device-side agent settings.
    pub agent: Option<AgentConfig>,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address serving both HTTP and device upgrades (default `0.0.0.0:8091`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Largest inbound request body relayed to a device (default 10 MB).
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

/// Correlation and device channel settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// Seconds a device has to answer a relayed request (default 120).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Outbound frames buffered per device before senders wait (default 256).
    #[serde(default = "default_channel_buffer")]
    pub channel_buffer: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Device agent: connects out to a relay and serves requests from a local upstream.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Relay WebSocket URL (e.g. `ws://relay.example.com:8091/`).
    pub url: String,
    /// Identifier to register under.
    pub id: String,
    /// Base URL of the local HTTP service requests are forwarded to.
    #[serde(default = "default_upstream")]
    pub upstream: String,
    /// Initial seconds between reconnect attempts (default 5).
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// Max seconds between reconnect attempts (default 60).
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_secs: u64,
}

fn default_listen() -> String {
    "0.0.0.0:8091".to_string()
}
fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024 // 10 MB
}
fn default_request_timeout() -> u64 {
    120
}
fn default_channel_buffer() -> usize {
    256
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_upstream() -> String {
    "http://127.0.0.1:80".to_string()
}
fn default_reconnect_delay() -> u64 {
    5
}
fn default_reconnect_max_delay() -> u64 {
    60
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            channel_buffer: default_channel_buffer(),
        }
    }
}

impl TunnelConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl AgentConfig {
    pub fn new(url: String, id: String) -> Self {
        Self {
            url,
            id,
            upstream: default_upstream(),
            reconnect_delay_secs: default_reconnect_delay(),
            reconnect_max_delay_secs: default_reconnect_max_delay(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise looks for
    /// `towers-tunnel.toml` in the current directory, falling back to
    /// compiled defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::from_file(DEFAULT_CONFIG_FILE)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(path, &content)
    }

    /// Parse TOML content; `origin` names the source in errors.
    pub fn parse(origin: &str, content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })
    }

    /// Apply env var overrides, reading through `lookup`.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(listen) = lookup("TOWERS_LISTEN") {
            self.server.listen = listen;
        }
        if let Some(secs) = lookup("TOWERS_REQUEST_TIMEOUT_SECS") {
            self.tunnel.request_timeout_secs = secs.parse().map_err(|_| {
                ConfigError::Invalid(format!("TOWERS_REQUEST_TIMEOUT_SECS={secs} is not a number"))
            })?;
        }

        let url = lookup("TOWERS_AGENT_URL");
        let id = lookup("TOWERS_AGENT_ID");
        let upstream = lookup("TOWERS_AGENT_UPSTREAM");
        if url.is_some() || id.is_some() || upstream.is_some() {
            let agent = self
                .agent
                .get_or_insert_with(|| AgentConfig::new(String::new(), String::new()));
            if let Some(url) = url {
                agent.url = url;
            }
            if let Some(id) = id {
                agent.id = id;
            }
            if let Some(upstream) = upstream {
                agent.upstream = upstream;
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.tunnel.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "tunnel.request_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.tunnel.channel_buffer == 0 {
            return Err(ConfigError::Invalid(
                "tunnel.channel_buffer must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.server.listen, "0.0.0.0:8091");
        assert_eq!(config.server.max_body_bytes, 10 * 1024 * 1024);
        assert_eq!(config.tunnel.request_timeout(), Duration::from_secs(120));
        assert_eq!(config.logging.level, "info");
        assert!(config.agent.is_none());
    }

    #[test]
    fn parses_partial_file() {
        let config = Config::parse(
            "test.toml",
            r#"
            [tunnel]
            request_timeout_secs = 30

            [agent]
            url = "ws://relay:8091/"
            id = "dev1"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:8091");
        assert_eq!(config.tunnel.request_timeout_secs, 30);
        assert_eq!(config.tunnel.channel_buffer, 256);
        let agent = config.agent.unwrap();
        assert_eq!(agent.id, "dev1");
        assert_eq!(agent.upstream, "http://127.0.0.1:80");
        assert_eq!(agent.reconnect_delay_secs, 5);
    }

    #[test]
    fn parse_error_names_origin() {
        let err = Config::parse("broken.toml", "[server\nlisten = 1").unwrap_err();
        assert!(err.to_string().contains("broken.toml"));
    }

    #[test]
    fn env_overrides_file_values() {
        let env: HashMap<&str, &str> = [
            ("TOWERS_LISTEN", "127.0.0.1:9000"),
            ("TOWERS_REQUEST_TIMEOUT_SECS", "5"),
            ("TOWERS_AGENT_ID", "edge-7"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_env(|k| env.get(k).map(ToString::to_string))
            .unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:9000");
        assert_eq!(config.tunnel.request_timeout_secs, 5);
        assert_eq!(config.agent.unwrap().id, "edge-7");
    }

    #[test]
    fn non_numeric_timeout_env_is_rejected() {
        let mut config = Config::default();
        let result = config.apply_env(|k| {
            (k == "TOWERS_REQUEST_TIMEOUT_SECS").then(|| "soon".to_string())
        });
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn zero_timeout_is_invalid() {
        let mut config = Config::default();
        config.tunnel.request_timeout_secs = 0;
        assert!(config.validate().is_err());
    }
}
