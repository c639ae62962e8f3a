//! Dual-transport progress delivery
//!
//! A solve session's progress can arrive over a persistent WebSocket (push)
//! or by polling the server (pull). Both transports speak the same wire
//! envelope and feed their owner through the same [`ChannelEvent`] contract;
//! the [`ProgressWatcher`] reconciles them into exactly one ordered stream
//! per session and guarantees a single terminal callback.

pub mod envelope;
pub mod pull;
pub mod push;
pub mod reconciler;

pub use envelope::{Envelope, EnvelopeKind, ItemOutcome};
pub use pull::{HttpProgressQuery, ProgressQuery, PullChannel};
pub use push::PushChannel;
pub use reconciler::{ProgressChannel, ProgressSink, ProgressWatcher};

use thiserror::Error;

/// Failures inside the progress subsystem.
///
/// Only `JobError` ever crosses the boundary to the consumer; everything
/// else is absorbed by retry or fallback.
#[derive(Debug, Error)]
pub enum ProgressError {
    /// A single frame or response failed to parse. Dropped silently; the
    /// session continues.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The transport could not be established or can no longer deliver.
    /// Internal; triggers the owner's fallback policy.
    #[error("channel unavailable: {0}")]
    ChannelUnavailable(String),

    /// A pull query failed (network/timeout). Retried with backoff.
    #[error("transient query failure: {0}")]
    TransientQueryFailure(String),

    /// The HTTP client could not be constructed (TLS backend init).
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(String),

    /// The job itself reported failure via a terminal error envelope.
    #[error("job failed: {0}")]
    JobError(String),
}

/// What a channel manager reports to its owner.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// A parsed envelope, keepalive acks already filtered out.
    Update(Envelope),
    /// The channel has stopped delivering; carries the reason. The channel
    /// never retries itself and never fabricates a terminal envelope.
    Unavailable(String),
}
