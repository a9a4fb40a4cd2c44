//! Error taxonomy for the dispatch core

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by selection, retry and health-checked execution
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Unknown model id on lookup or favorite
    #[error("model not found: {0}")]
    NotFound(String),

    /// Selection criteria matched no registry model
    #[error("no suitable models match the selection criteria")]
    NoCandidates,

    /// Classified transient failure
    #[error("retryable transport failure ({error_type}): {message}")]
    RetryableTransport {
        error_type: String,
        message: String,
        status_code: Option<u16>,
    },

    /// Auth, validation and other failures that are never retried
    #[error("non-retryable failure ({error_type}): {message}")]
    NonRetryable {
        error_type: String,
        message: String,
        status_code: Option<u16>,
    },

    /// The provider circuit rejected the call before any attempt was made
    #[error("circuit open for provider {provider}, retry in {retry_in:?}")]
    CircuitOpen { provider: String, retry_in: Duration },

    /// The `on_retry` observer failed and aborted the retry loop
    #[error("retry aborted by callback after attempt {attempt}: {reason}")]
    CallbackAbort { attempt: u32, reason: String },

    /// Caller-driven cancellation
    #[error("operation cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },

    /// Last underlying failure, wrapped with the total attempt count
    #[error("operation failed after {attempts} attempt(s): {source}")]
    AttemptsFailed {
        attempts: u32,
        #[source]
        source: Box<DispatchError>,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

impl DispatchError {
    /// Attempt count for errors produced by the retry engine
    pub fn attempts(&self) -> Option<u32> {
        match self {
            DispatchError::AttemptsFailed { attempts, .. } => Some(*attempts),
            DispatchError::Cancelled { attempts } => Some(*attempts),
            _ => None,
        }
    }

    /// Innermost error, unwrapping `AttemptsFailed`
    pub fn root(&self) -> &DispatchError {
        match self {
            DispatchError::AttemptsFailed { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self.root(), DispatchError::CircuitOpen { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, DispatchError::Cancelled { .. })
    }

    /// Ended on the caller's side: cancellation or a failing retry observer
    pub fn is_caller_abort(&self) -> bool {
        matches!(
            self,
            DispatchError::Cancelled { .. } | DispatchError::CallbackAbort { .. }
        )
    }

    /// Status code carried by the underlying transport failure, if any
    pub fn status_code(&self) -> Option<u16> {
        match self.root() {
            DispatchError::RetryableTransport { status_code, .. }
            | DispatchError::NonRetryable { status_code, .. } => *status_code,
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_unwraps_exhausted() {
        let err = DispatchError::AttemptsFailed {
            attempts: 3,
            source: Box::new(DispatchError::RetryableTransport {
                error_type: "server_error".to_string(),
                message: "bad gateway".to_string(),
                status_code: Some(502),
            }),
        };

        assert_eq!(err.attempts(), Some(3));
        assert_eq!(err.status_code(), Some(502));
        assert!(err.to_string().contains("3 attempt(s)"));
        assert!(err.to_string().contains("bad gateway"));
    }

    #[test]
    fn test_circuit_open_detection() {
        let err = DispatchError::CircuitOpen {
            provider: "openai".to_string(),
            retry_in: Duration::from_secs(10),
        };
        assert!(err.is_circuit_open());
        assert_eq!(err.attempts(), None);
    }

    #[test]
    fn test_caller_aborts() {
        assert!(DispatchError::Cancelled { attempts: 2 }.is_caller_abort());
        assert!(DispatchError::CallbackAbort {
            attempt: 1,
            reason: "budget".to_string(),
        }
        .is_caller_abort());
        assert!(!DispatchError::NoCandidates.is_caller_abort());
    }
}
