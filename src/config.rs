//! Configuration and settings management
//!
//! Loads settings from environment variables and defines the tuning
//! constants for the progress transports.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use url::Url;

/// Application settings loaded from environment variables
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Host and port of the solver server, e.g. `localhost:8000`
    #[serde(default = "default_server_host")]
    pub server_host: String,

    /// Whether to talk to the server over TLS (`https`/`wss`)
    #[serde(default)]
    pub server_tls: bool,

    /// Timeout for individual HTTP requests, in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_server_host() -> String {
    "localhost:8000".to_string()
}

const fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_host: default_server_host(),
            server_tls: false,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Settings {
    /// Create new settings by loading from environment and files
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use solvewatch::config::Settings;
    ///
    /// let settings = Settings::new().expect("Failed to load configuration");
    /// ```
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading fails.
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            // Start off by merging in the "default" configuration file
            .add_source(File::with_name("config/default").required(false))
            // Add in the current environment file
            .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
            // Add in a local configuration file
            // This file shouldn't be checked into git
            .add_source(File::with_name("config/local").required(false))
            // Add in settings from the environment (with a prefix of SOLVEWATCH)
            // E.g. `SOLVEWATCH_SERVER_HOST=host:8000 solvewatch ...`
            .add_source(Environment::with_prefix("SOLVEWATCH").separator("__"))
            // Also add settings from environment variables directly (without prefix)
            // ignore_empty treats empty env vars as unset
            .add_source(Environment::default().ignore_empty(true))
            .build()?;

        s.try_deserialize()
    }

    /// Base URL for HTTP API calls, e.g. `http://localhost:8000`
    #[must_use]
    pub fn http_base(&self) -> String {
        let scheme = if self.server_tls { "https" } else { "http" };
        format!("{scheme}://{}", self.server_host)
    }

    /// WebSocket address of the push channel for a session
    #[must_use]
    pub fn ws_progress_url(&self, session_id: &str) -> String {
        let scheme = if self.server_tls { "wss" } else { "ws" };
        format!("{scheme}://{}/ws/progress/{session_id}", self.server_host)
    }

    /// HTTP address of the pull channel for a session
    #[must_use]
    pub fn progress_url(&self, session_id: &str) -> String {
        format!("{}/api/progress/{session_id}", self.http_base())
    }

    /// Check that the configured host produces well-formed URLs
    ///
    /// # Errors
    ///
    /// Returns an error if `server_host` cannot be parsed as part of a URL.
    pub fn validate(&self) -> Result<(), url::ParseError> {
        Url::parse(&self.http_base())?;
        Url::parse(&self.ws_progress_url("probe"))?;
        Ok(())
    }
}

// Progress transport configuration
/// Interval between client keepalive pings on the push channel
pub const KEEPALIVE_INTERVAL_SECS: u64 = 25;
/// Delay between successful pull queries
pub const POLL_INTERVAL_MS: u64 = 800;
/// Backoff after a failed pull query
pub const POLL_BACKOFF_MS: u64 = 2000;
/// Consecutive pull failures tolerated before the channel gives up
pub const PULL_MAX_CONSECUTIVE_FAILURES: usize = 75;
/// Capacity of the channel-manager to reconciler event queue
pub const EVENT_CHANNEL_CAPACITY: usize = 32;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.server_host, "localhost:8000");
        assert!(!settings.server_tls);
        assert_eq!(settings.request_timeout_secs, 30);
        settings.validate().expect("default settings must validate");
    }

    #[test]
    fn test_url_derivation() {
        let settings = Settings {
            server_host: "solver.example.com:9000".to_string(),
            server_tls: false,
            request_timeout_secs: 30,
        };
        assert_eq!(
            settings.ws_progress_url("abc"),
            "ws://solver.example.com:9000/ws/progress/abc"
        );
        assert_eq!(
            settings.progress_url("abc"),
            "http://solver.example.com:9000/api/progress/abc"
        );
    }

    #[test]
    fn test_tls_switches_schemes() {
        let settings = Settings {
            server_host: "solver.example.com".to_string(),
            server_tls: true,
            request_timeout_secs: 30,
        };
        assert!(settings.http_base().starts_with("https://"));
        assert!(settings.ws_progress_url("abc").starts_with("wss://"));
    }
}
