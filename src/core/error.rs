//! Error types for engine operations.

use std::fmt;

use thiserror::Error;

/// Errors produced by engine lifecycle operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration failed validation.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    /// `start` was called on a running engine.
    #[error("engine already started")]
    AlreadyStarted,
    /// The operation needs a started engine.
    #[error("engine not started")]
    NotStarted,
    /// The engine is shutting down or has shut down.
    #[error("engine is shutting down")]
    ShuttingDown,
    /// The OS refused to spawn a worker or timer thread.
    #[error("failed to spawn thread `{name}`: {source}")]
    Spawn {
        /// Thread name that failed to spawn.
        name: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },
    /// A bounded wait elapsed.
    #[error("timed out")]
    Timeout,
    /// The job was dropped without its outcome being delivered.
    #[error("result channel disconnected")]
    Disconnected,
}

/// Why a submission was refused. The payload is handed back untouched.
pub enum SubmitError<P> {
    /// The queue is at capacity (non-blocking submit).
    Rejected(P),
    /// The engine no longer accepts work.
    ShuttingDown(P),
    /// A blocking submit gave up waiting for capacity.
    TimedOut(P),
}

impl<P> SubmitError<P> {
    /// Recover the payload.
    pub fn into_payload(self) -> P {
        match self {
            Self::Rejected(p) | Self::ShuttingDown(p) | Self::TimedOut(p) => p,
        }
    }

    /// Whether the refusal was due to a full queue (rejected or timed out).
    #[must_use]
    pub const fn is_backpressure(&self) -> bool {
        matches!(self, Self::Rejected(_) | Self::TimedOut(_))
    }
}

impl<P> fmt::Debug for SubmitError<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Rejected(_) => "Rejected",
            Self::ShuttingDown(_) => "ShuttingDown",
            Self::TimedOut(_) => "TimedOut",
        };
        f.debug_tuple(name).finish_non_exhaustive()
    }
}

impl<P> fmt::Display for SubmitError<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(_) => f.write_str("queue full: job rejected"),
            Self::ShuttingDown(_) => f.write_str("engine is shutting down"),
            Self::TimedOut(_) => f.write_str("timed out waiting for queue capacity"),
        }
    }
}

impl<P> std::error::Error for SubmitError<P> {}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_error_returns_payload() {
        let err = SubmitError::Rejected(String::from("payload"));
        assert!(err.is_backpressure());
        assert_eq!(err.to_string(), "queue full: job rejected");
        assert_eq!(err.into_payload(), "payload");

        let err = SubmitError::ShuttingDown(3);
        assert!(!err.is_backpressure());
        assert_eq!(format!("{err:?}"), "ShuttingDown(..)");
    }

    #[test]
    fn test_submit_error_into_anyhow() {
        fn submit() -> AppResult<()> {
            Err(SubmitError::TimedOut(()))?;
            Ok(())
        }
        let err = submit().unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
