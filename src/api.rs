//! Thin REST client for the solver server
//!
//! Simple request/response surface around the endpoints that bracket a
//! watched session: checking the server, starting a solve run from the
//! server's questions folder, and retrieving the generated reports. The
//! progress delivery itself lives in [`crate::progress`].

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use serde::Deserialize;

use crate::config::Settings;
use crate::progress::ItemOutcome;

/// Server health and configuration snapshot (`GET /api/status`).
#[derive(Debug, Clone, Deserialize)]
pub struct ServerStatus {
    /// Literal `"ok"` when the server is up
    pub status: String,
    /// Whether the solver backend is configured with an API key
    pub api_key_set: bool,
}

/// Response to starting a solve run (`POST /api/solve-folder`).
#[derive(Debug, Clone, Deserialize)]
pub struct SolveStarted {
    /// Session id to watch
    pub session_id: String,
    /// Number of question images the session will process
    pub file_count: u64,
}

/// One generated report in the outputs listing.
#[derive(Debug, Clone, Deserialize)]
pub struct ReportInfo {
    /// Report file name
    pub filename: String,
    /// Size in bytes
    pub size: u64,
    /// Last modification time (server-local, no timezone on the wire)
    pub modified: NaiveDateTime,
}

/// Listing of generated reports (`GET /api/outputs`).
#[derive(Debug, Clone, Deserialize)]
pub struct ReportList {
    /// Number of reports
    pub count: u64,
    /// The reports, newest first
    pub reports: Vec<ReportInfo>,
}

/// Final outcome of a session (`GET /api/results/{session_id}`).
///
/// Unlike the progress stream this is a plain snapshot: querying it for a
/// session that already finished recovers the outcome without watching a
/// stream that will never emit again.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionResults {
    /// Lifecycle word the server tracks, `completed` or `error` once done
    pub status: String,
    /// Per-item outcomes
    #[serde(default)]
    pub results: Vec<ItemOutcome>,
    /// Server-side path of the generated report, once written
    #[serde(default)]
    pub report_path: Option<String>,
}

/// A report with its Markdown content (`GET /api/report/{filename}`).
#[derive(Debug, Clone, Deserialize)]
pub struct ReportContent {
    /// Report file name
    pub filename: String,
    /// Markdown content
    pub content: String,
}

/// Client for the solver server's REST API.
pub struct SolverApi {
    client: reqwest::Client,
    base: String,
}

impl SolverApi {
    /// Build a client for the configured server.
    ///
    /// # Errors
    ///
    /// Returns an error when the underlying HTTP client cannot be
    /// constructed.
    pub fn new(settings: &Settings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            client,
            base: settings.http_base(),
        })
    }

    /// Check the server is reachable and configured.
    ///
    /// # Errors
    ///
    /// Returns an error on network failure or a non-success status.
    pub async fn status(&self) -> Result<ServerStatus> {
        self.get_json("/api/status").await
    }

    /// Create a session from the server's questions folder and start
    /// solving. The returned session id is what the progress watcher
    /// observes.
    ///
    /// # Errors
    ///
    /// Returns an error on network failure, or with the server's detail
    /// message when the folder is empty or the backend is unconfigured.
    pub async fn solve_folder(&self) -> Result<SolveStarted> {
        let url = format!("{}/api/solve-folder", self.base);
        let response = self
            .client
            .post(&url)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?
            .error_for_status()
            .context("solve-folder request rejected")?;
        response
            .json()
            .await
            .context("malformed solve-folder response")
    }

    /// List generated reports, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error on network failure or a non-success status.
    pub async fn outputs(&self) -> Result<ReportList> {
        self.get_json("/api/outputs").await
    }

    /// Fetch the final results of a session.
    ///
    /// # Errors
    ///
    /// Returns an error on network failure, or when the server no longer
    /// knows the session.
    pub async fn results(&self, session_id: &str) -> Result<SessionResults> {
        self.get_json(&format!("/api/results/{session_id}")).await
    }

    /// Fetch one report's Markdown content.
    ///
    /// # Errors
    ///
    /// Returns an error on network failure, or when the report does not
    /// exist.
    pub async fn report(&self, filename: &str) -> Result<ReportContent> {
        self.get_json(&format!("/api/report/{filename}")).await
    }

    /// Download one report file verbatim.
    ///
    /// # Errors
    ///
    /// Returns an error on network failure, or when the report does not
    /// exist.
    pub async fn report_raw(&self, filename: &str) -> Result<String> {
        let url = format!("{}/api/report/{filename}/raw", self.base);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .error_for_status()
            .with_context(|| format!("request rejected: {url}"))?;
        response
            .text()
            .await
            .with_context(|| format!("unreadable response from {url}"))
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T> {
        let url = format!("{}{path}", self.base);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .error_for_status()
            .with_context(|| format!("request rejected: {url}"))?;
        response
            .json()
            .await
            .with_context(|| format!("malformed response from {url}"))
    }
}
