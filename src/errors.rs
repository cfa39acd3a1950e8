//! Typed error hierarchy for the orchestrator.
//!
//! Two top-level enums cover the two failure domains:
//! - `BusError` covers broker connectivity and publish/consume failures
//! - `HandlerError` covers per-delivery handler failures, classified into
//!   requeue-vs-drop by the consume loop

use thiserror::Error;

/// Errors from the message bus layer.
#[derive(Debug, Error)]
pub enum BusError {
    /// The broker stayed unreachable through the whole retry budget.
    /// Fatal at startup.
    #[error("message bus unreachable after {attempts} attempts: {source}")]
    TransientUnavailable {
        attempts: u32,
        #[source]
        source: lapin::Error,
    },

    #[error("publish to '{routing_key}' failed: {source}")]
    Publish {
        routing_key: String,
        #[source]
        source: lapin::Error,
    },

    #[error("subscribe queue '{queue}' failed: {source}")]
    Subscribe {
        queue: String,
        #[source]
        source: lapin::Error,
    },

    #[error("encode payload for '{routing_key}': {source}")]
    Encode {
        routing_key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("delivery stream for '{queue}' closed")]
    ConsumerClosed { queue: String },

    #[error("bus channel error: {0}")]
    Channel(#[source] lapin::Error),
}

/// Errors returned by event handlers. The consume loop turns these into
/// ack/nack decisions; they never terminate the process.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Envelope or payload failed to decode. Retried once via the broker's
    /// redelivery flag, then dropped as poison.
    #[error("malformed payload: {0}")]
    Malformed(#[source] serde_json::Error),

    /// Event references a job the registry does not know. May be a race
    /// with submission: requeued once per job id, then dropped.
    #[error("unknown job {job_id}")]
    UnknownJob { job_id: String },

    /// Transient bus fault while publishing a follow-on event.
    #[error(transparent)]
    Bus(#[from] BusError),
}

impl HandlerError {
    /// Whether a nack for this error should requeue the delivery.
    /// `redelivered` is the broker's flag for this delivery; `first_unknown`
    /// is true the first time this job id produced an unknown-job error.
    pub fn requeue(&self, redelivered: bool, first_unknown: bool) -> bool {
        match self {
            HandlerError::Malformed(_) => !redelivered,
            HandlerError::UnknownJob { .. } => first_unknown,
            HandlerError::Bus(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn malformed() -> HandlerError {
        HandlerError::Malformed(serde_json::from_str::<serde_json::Value>("{").unwrap_err())
    }

    #[test]
    fn malformed_requeues_on_first_delivery_only() {
        let err = malformed();
        assert!(err.requeue(false, false));
        assert!(!err.requeue(true, false));
    }

    #[test]
    fn unknown_job_requeues_once_per_job() {
        let err = HandlerError::UnknownJob {
            job_id: "j1".into(),
        };
        assert!(err.requeue(false, true));
        assert!(!err.requeue(false, false));
        // redelivery flag is irrelevant for unknown jobs
        assert!(err.requeue(true, true));
    }

    #[test]
    fn bus_errors_always_requeue() {
        let err = HandlerError::Bus(BusError::Publish {
            routing_key: "diff.requested".into(),
            source: lapin::Error::ChannelsLimitReached,
        });
        assert!(err.requeue(false, false));
        assert!(err.requeue(true, false));
    }

    #[test]
    fn errors_implement_std_error() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&malformed());
        assert_std_error(&HandlerError::UnknownJob { job_id: "x".into() });
    }

    #[test]
    fn unknown_job_display_carries_id() {
        let err = HandlerError::UnknownJob {
            job_id: "abc-123".into(),
        };
        assert!(err.to_string().contains("abc-123"));
    }
}
