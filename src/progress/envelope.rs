//! Wire-level progress envelope
//!
//! The unit of information flowing over either transport. Parsing is
//! deliberately lenient about field names: older servers put the
//! discriminator in `status` and the counters in `progress`/`total`,
//! newer ones use `kind`/`completed_count`/`total_count`. Both spellings
//! (and payloads carrying both at once) must parse to the same envelope.

use serde::{Deserialize, Serialize};

use super::ProgressError;

/// Discriminator of a progress envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvelopeKind {
    /// Session acknowledged, no items done yet.
    Init,
    /// At least one item's outcome is known; more are pending.
    Progress,
    /// Terminal: every item is accounted for.
    Completed,
    /// Terminal: the job failed as a whole.
    Error,
    /// Transport-internal answer to a client keepalive ping. Never reaches
    /// the consumer.
    KeepaliveAck,
}

impl EnvelopeKind {
    fn from_wire(value: &str) -> Option<Self> {
        // Legacy servers report session lifecycle words in `status`;
        // "uploaded" is the pre-processing state, "processing" maps to a
        // plain progress update.
        match value {
            "init" | "uploaded" => Some(Self::Init),
            "progress" | "processing" => Some(Self::Progress),
            "completed" => Some(Self::Completed),
            "error" => Some(Self::Error),
            "keepalive-ack" | "keepalive_ack" => Some(Self::KeepaliveAck),
            _ => None,
        }
    }
}

/// Outcome of a single processed work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemOutcome {
    /// Identifier of the item (the question image's file name)
    pub filename: String,
    /// Whether the item was solved
    pub success: bool,
    /// Solution text, present on success
    #[serde(default)]
    pub solution: Option<String>,
    /// Failure text, present when the item failed
    #[serde(default)]
    pub error: Option<String>,
    /// Wall-clock seconds spent on the item
    #[serde(default)]
    pub time_taken: Option<f64>,
    /// Topic label assigned by the solver
    #[serde(default)]
    pub topic: Option<String>,
}

/// One structured progress message, regardless of transport.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    /// Message discriminator
    pub kind: EnvelopeKind,
    /// Number of items accounted for so far
    pub completed_count: u64,
    /// Total number of items in the session; `0` until the job reports its
    /// size
    pub total_count: u64,
    /// Per-item outcomes accumulated so far, append-only from the
    /// producer's perspective
    pub results: Vec<ItemOutcome>,
    /// The most recently finished item, present only on `progress`
    /// envelopes that carry new information
    pub latest_result: Option<ItemOutcome>,
    /// Failure text, present only on `kind = error`
    pub error: Option<String>,
}

/// Lenient wire shape accepted from either transport.
#[derive(Debug, Deserialize)]
struct RawEnvelope {
    kind: Option<String>,
    status: Option<String>,
    #[serde(alias = "progress")]
    completed_count: Option<u64>,
    #[serde(alias = "total")]
    total_count: Option<u64>,
    #[serde(default)]
    results: Vec<ItemOutcome>,
    #[serde(default)]
    latest_result: Option<ItemOutcome>,
    #[serde(default)]
    error: Option<String>,
}

impl Envelope {
    /// Parse and validate a raw transport payload.
    ///
    /// `kind` wins over the legacy `status` field when both are present.
    ///
    /// # Errors
    ///
    /// Returns [`ProgressError::MalformedPayload`] if the text is not JSON,
    /// carries no recognizable discriminator, or violates the counter
    /// invariant (`completed_count <= total_count` once the total is
    /// known). Callers drop such payloads without aborting the session.
    pub fn parse(text: &str) -> Result<Self, ProgressError> {
        let raw: RawEnvelope = serde_json::from_str(text)
            .map_err(|e| ProgressError::MalformedPayload(e.to_string()))?;

        let discriminator = raw
            .kind
            .as_deref()
            .or(raw.status.as_deref())
            .ok_or_else(|| {
                ProgressError::MalformedPayload("missing kind/status discriminator".to_string())
            })?;

        let kind = EnvelopeKind::from_wire(discriminator).ok_or_else(|| {
            ProgressError::MalformedPayload(format!("unknown envelope kind: {discriminator}"))
        })?;

        let envelope = Self {
            kind,
            completed_count: raw.completed_count.unwrap_or(0),
            total_count: raw.total_count.unwrap_or(0),
            results: raw.results,
            latest_result: raw.latest_result,
            error: raw.error,
        };

        if envelope.total_count > 0 && envelope.completed_count > envelope.total_count {
            return Err(ProgressError::MalformedPayload(format!(
                "completed_count {} exceeds total_count {}",
                envelope.completed_count, envelope.total_count
            )));
        }

        Ok(envelope)
    }

    /// Whether this envelope ends the session.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self.kind, EnvelopeKind::Completed | EnvelopeKind::Error)
    }

    /// Failure text of an `error` envelope, with a generic fallback when
    /// the job reported none.
    #[must_use]
    pub fn error_message(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| "job failed without a reported reason".to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_legacy_status_shape() {
        // The shape `/api/progress/{id}` has always returned.
        let text = r#"{
            "status": "processing",
            "progress": 2,
            "total": 5,
            "results": [
                {"filename": "q1.png", "success": true, "solution": "x = 4", "time_taken": 3.2},
                {"filename": "q2.png", "success": false, "error": "timeout"}
            ],
            "error": null
        }"#;
        let env = Envelope::parse(text).unwrap();
        assert_eq!(env.kind, EnvelopeKind::Progress);
        assert_eq!(env.completed_count, 2);
        assert_eq!(env.total_count, 5);
        assert_eq!(env.results.len(), 2);
        assert_eq!(env.results[0].solution.as_deref(), Some("x = 4"));
        assert!(!env.is_terminal());
    }

    #[test]
    fn test_parse_kind_shape() {
        let text = r#"{
            "kind": "progress",
            "completed_count": 1,
            "total_count": 3,
            "latest_result": {"filename": "q1.png", "success": true, "topic": "Geometri"}
        }"#;
        let env = Envelope::parse(text).unwrap();
        assert_eq!(env.kind, EnvelopeKind::Progress);
        assert_eq!(env.latest_result.as_ref().unwrap().filename, "q1.png");
        assert_eq!(
            env.latest_result.as_ref().unwrap().topic.as_deref(),
            Some("Geometri")
        );
    }

    #[test]
    fn test_kind_wins_over_status() {
        let text = r#"{"kind": "completed", "status": "processing", "progress": 3, "total": 3}"#;
        let env = Envelope::parse(text).unwrap();
        assert_eq!(env.kind, EnvelopeKind::Completed);
        assert!(env.is_terminal());
    }

    #[test]
    fn test_status_completed_equals_kind_completed() {
        let by_status = Envelope::parse(r#"{"status": "completed", "progress": 3, "total": 3}"#);
        let by_kind = Envelope::parse(r#"{"kind": "completed", "progress": 3, "total": 3}"#);
        assert_eq!(by_status.unwrap(), by_kind.unwrap());
    }

    #[test]
    fn test_keepalive_ack_recognized() {
        let env = Envelope::parse(r#"{"kind": "keepalive-ack"}"#).unwrap();
        assert_eq!(env.kind, EnvelopeKind::KeepaliveAck);
        assert!(!env.is_terminal());
    }

    #[test]
    fn test_unknown_kind_is_malformed() {
        let err = Envelope::parse(r#"{"status": "exploded"}"#).unwrap_err();
        assert!(matches!(err, ProgressError::MalformedPayload(_)));
    }

    #[test]
    fn test_missing_discriminator_is_malformed() {
        let err = Envelope::parse(r#"{"progress": 1, "total": 2}"#).unwrap_err();
        assert!(matches!(err, ProgressError::MalformedPayload(_)));
    }

    #[test]
    fn test_not_json_is_malformed() {
        assert!(Envelope::parse("definitely not json").is_err());
    }

    #[test]
    fn test_counter_invariant() {
        let err = Envelope::parse(r#"{"status": "processing", "progress": 7, "total": 3}"#);
        assert!(matches!(
            err.unwrap_err(),
            ProgressError::MalformedPayload(_)
        ));

        // Total 0 means "size not reported yet"; any completed count passes.
        let env =
            Envelope::parse(r#"{"status": "processing", "progress": 2, "total": 0}"#).unwrap();
        assert_eq!(env.completed_count, 2);
    }

    #[test]
    fn test_error_message_fallback() {
        let with_message =
            Envelope::parse(r#"{"status": "error", "error": "rate limited"}"#).unwrap();
        assert_eq!(with_message.error_message(), "rate limited");

        let without_message = Envelope::parse(r#"{"status": "error"}"#).unwrap();
        assert_eq!(
            without_message.error_message(),
            "job failed without a reported reason"
        );
    }
}
