//! Pull channel manager
//!
//! Client-initiated polling fallback for sessions the push channel cannot
//! serve. Queries are strictly sequential (request, wait, request); a
//! failed query is retried after a longer backoff and is invisible to the
//! consumer. The retry budget is bounded: once the configured number of
//! consecutive failures is exhausted the channel reports itself
//! unavailable instead of silently retrying forever.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_retry::strategy::FixedInterval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::envelope::{Envelope, EnvelopeKind};
use super::reconciler::ProgressChannel;
use super::{ChannelEvent, ProgressError};
use crate::config::{
    Settings, POLL_BACKOFF_MS, POLL_INTERVAL_MS, PULL_MAX_CONSECUTIVE_FAILURES,
};

/// One idempotent progress fetch, abstracted so tests can script responses.
///
/// Implementations return the raw response body; parsing and the terminal
/// contract live in the channel manager, shared with the push side.
#[async_trait]
pub trait ProgressQuery: Send + Sync {
    /// Fetch the current progress snapshot for a session.
    ///
    /// # Errors
    ///
    /// Returns [`ProgressError::TransientQueryFailure`] on network failure,
    /// timeout, or a non-success HTTP status.
    async fn fetch(&self, session_id: &str) -> Result<String, ProgressError>;
}

/// Production query against `GET /api/progress/{session_id}`.
pub struct HttpProgressQuery {
    client: reqwest::Client,
    settings: Settings,
}

impl HttpProgressQuery {
    /// Build a query client for the configured server.
    ///
    /// # Errors
    ///
    /// Returns [`ProgressError::ClientBuild`] when the underlying HTTP
    /// client cannot be constructed.
    pub fn new(settings: &Settings) -> Result<Self, ProgressError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .map_err(|e| ProgressError::ClientBuild(e.to_string()))?;
        Ok(Self {
            client,
            settings: settings.clone(),
        })
    }
}

#[async_trait]
impl ProgressQuery for HttpProgressQuery {
    async fn fetch(&self, session_id: &str) -> Result<String, ProgressError> {
        let url = self.settings.progress_url(session_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ProgressError::TransientQueryFailure(e.to_string()))?;
        let response = response
            .error_for_status()
            .map_err(|e| ProgressError::TransientQueryFailure(e.to_string()))?;
        response
            .text()
            .await
            .map_err(|e| ProgressError::TransientQueryFailure(e.to_string()))
    }
}

/// Timed polling delivery of progress envelopes.
pub struct PullChannel {
    query: Arc<dyn ProgressQuery>,
    poll_interval: Duration,
    backoff: Duration,
    max_consecutive_failures: usize,
}

impl PullChannel {
    /// Create a pull channel over the given query implementation.
    #[must_use]
    pub fn new(query: Arc<dyn ProgressQuery>) -> Self {
        Self {
            query,
            poll_interval: Duration::from_millis(POLL_INTERVAL_MS),
            backoff: Duration::from_millis(POLL_BACKOFF_MS),
            max_consecutive_failures: PULL_MAX_CONSECUTIVE_FAILURES,
        }
    }

    /// Override the polling timings (tests use short intervals).
    #[must_use]
    pub fn with_timings(
        mut self,
        poll_interval: Duration,
        backoff: Duration,
        max_consecutive_failures: usize,
    ) -> Self {
        self.poll_interval = poll_interval;
        self.backoff = backoff;
        self.max_consecutive_failures = max_consecutive_failures;
        self
    }

    fn retry_budget(&self) -> std::iter::Take<FixedInterval> {
        FixedInterval::new(self.backoff).take(self.max_consecutive_failures)
    }

    /// Poll for `session_id` until a terminal envelope, cancellation, or
    /// an exhausted retry budget.
    ///
    /// The first query is issued immediately; afterwards one query is in
    /// flight at most, scheduled `poll_interval` after the previous one
    /// resolved, or after one step of the backoff budget when it failed.
    pub async fn run(
        &self,
        session_id: &str,
        events: mpsc::Sender<ChannelEvent>,
        cancel: CancellationToken,
    ) {
        let mut budget = self.retry_budget();

        loop {
            let fetched = tokio::select! {
                () = cancel.cancelled() => return,
                res = self.query.fetch(session_id) => res,
            };

            let delay = match fetched {
                Ok(body) => {
                    // A reachable server refills the retry budget.
                    budget = self.retry_budget();
                    match Envelope::parse(&body) {
                        Ok(envelope) if envelope.kind == EnvelopeKind::KeepaliveAck => {
                            // Not expected over the pull channel; discard.
                            self.poll_interval
                        }
                        Ok(envelope) => {
                            let terminal = envelope.is_terminal();
                            if events.send(ChannelEvent::Update(envelope)).await.is_err() {
                                return;
                            }
                            if terminal {
                                debug!(%session_id, "pull channel observed terminal envelope");
                                return;
                            }
                            self.poll_interval
                        }
                        Err(e) => {
                            // A corrupt response must not abort the session.
                            debug!(error = %e, "dropping malformed poll response");
                            self.poll_interval
                        }
                    }
                }
                Err(e) => match budget.next() {
                    Some(backoff) => {
                        debug!(error = %e, "poll failed, backing off");
                        backoff
                    }
                    None => {
                        warn!(
                            %session_id,
                            failures = self.max_consecutive_failures,
                            "pull channel giving up after repeated failures"
                        );
                        let _ = events
                            .send(ChannelEvent::Unavailable(format!(
                                "giving up after {} consecutive failed queries: {e}",
                                self.max_consecutive_failures
                            )))
                            .await;
                        return;
                    }
                },
            };

            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[async_trait]
impl ProgressChannel for PullChannel {
    async fn run(
        self: Arc<Self>,
        session_id: String,
        events: mpsc::Sender<ChannelEvent>,
        cancel: CancellationToken,
    ) {
        Self::run(&self, &session_id, events, cancel).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Scripted query: returns each response in order, then repeats the
    /// last one (a server with no new progress answers identically).
    struct ScriptedQuery {
        responses: Mutex<Vec<Result<String, ProgressError>>>,
        last: Mutex<Option<String>>,
    }

    impl ScriptedQuery {
        fn new(responses: Vec<Result<String, ProgressError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
                last: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl ProgressQuery for ScriptedQuery {
        async fn fetch(&self, _session_id: &str) -> Result<String, ProgressError> {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                let last = self.last.lock().unwrap();
                return last.clone().ok_or_else(|| {
                    ProgressError::TransientQueryFailure("script exhausted".to_string())
                });
            }
            let next = responses.remove(0);
            if let Ok(ref body) = next {
                *self.last.lock().unwrap() = Some(body.clone());
            }
            next
        }
    }

    fn fast_channel(query: Arc<dyn ProgressQuery>) -> PullChannel {
        PullChannel::new(query).with_timings(
            Duration::from_millis(5),
            Duration::from_millis(5),
            3,
        )
    }

    async fn collect_events(channel: PullChannel) -> Vec<ChannelEvent> {
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        channel.run("abc", tx, cancel).await;
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn progress_body(completed: u64, total: u64) -> String {
        format!(r#"{{"status": "processing", "progress": {completed}, "total": {total}}}"#)
    }

    #[tokio::test]
    async fn polls_until_terminal() {
        let query = ScriptedQuery::new(vec![
            Ok(progress_body(1, 3)),
            Ok(progress_body(2, 3)),
            Ok(r#"{"status": "completed", "progress": 3, "total": 3}"#.to_string()),
        ]);
        let events = collect_events(fast_channel(query)).await;

        assert_eq!(events.len(), 3, "unexpected events: {events:?}");
        let counts: Vec<u64> = events
            .iter()
            .map(|e| match e {
                ChannelEvent::Update(env) => env.completed_count,
                ChannelEvent::Unavailable(reason) => panic!("unexpected: {reason}"),
            })
            .collect();
        assert_eq!(counts, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn malformed_response_does_not_abort() {
        let query = ScriptedQuery::new(vec![
            Ok(progress_body(1, 2)),
            Ok("<html>proxy error</html>".to_string()),
            Ok(r#"{"status": "completed", "progress": 2, "total": 2}"#.to_string()),
        ]);
        let events = collect_events(fast_channel(query)).await;

        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[1],
            ChannelEvent::Update(env) if env.is_terminal()
        ));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let query = ScriptedQuery::new(vec![
            Err(ProgressError::TransientQueryFailure("refused".to_string())),
            Err(ProgressError::TransientQueryFailure("refused".to_string())),
            Ok(r#"{"status": "completed", "progress": 1, "total": 1}"#.to_string()),
        ]);
        let events = collect_events(fast_channel(query)).await;

        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            ChannelEvent::Update(env) if env.is_terminal()
        ));
    }

    #[tokio::test]
    async fn success_resets_the_retry_budget() {
        // Two failures, a success, then two more failures: with a budget of
        // three the channel must still be polling when the terminal arrives.
        let query = ScriptedQuery::new(vec![
            Err(ProgressError::TransientQueryFailure("refused".to_string())),
            Err(ProgressError::TransientQueryFailure("refused".to_string())),
            Ok(progress_body(1, 2)),
            Err(ProgressError::TransientQueryFailure("refused".to_string())),
            Err(ProgressError::TransientQueryFailure("refused".to_string())),
            Ok(r#"{"status": "completed", "progress": 2, "total": 2}"#.to_string()),
        ]);
        let events = collect_events(fast_channel(query)).await;

        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[1],
            ChannelEvent::Update(env) if env.is_terminal()
        ));
    }

    #[tokio::test]
    async fn gives_up_after_consecutive_failures() {
        let query = ScriptedQuery::new(vec![
            Err(ProgressError::TransientQueryFailure("refused".to_string())),
            Err(ProgressError::TransientQueryFailure("refused".to_string())),
            Err(ProgressError::TransientQueryFailure("refused".to_string())),
            Err(ProgressError::TransientQueryFailure("refused".to_string())),
        ]);
        let events = collect_events(fast_channel(query)).await;

        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], ChannelEvent::Unavailable(_)));
    }

    #[test]
    fn http_query_builds_from_settings() {
        let query = HttpProgressQuery::new(&Settings::default());
        assert!(query.is_ok());
    }

    #[tokio::test]
    async fn stop_cancels_pending_schedule() {
        let query = ScriptedQuery::new(vec![Ok(progress_body(1, 10))]);
        let channel = PullChannel::new(query).with_timings(
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            3,
        );

        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        let task = tokio::spawn(async move { channel.run("abc", tx, child).await });

        // First query lands, then the channel sleeps for an hour.
        let first = rx.recv().await;
        assert!(matches!(first, Some(ChannelEvent::Update(_))));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("channel did not stop on cancellation")
            .expect("channel task panicked");
    }
}
