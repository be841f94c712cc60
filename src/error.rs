//! Error handling types for the service layer.
//!
//! Codec errors live in [`crate::protocol::ProtocolError`]; configuration
//! errors in [`crate::config::ConfigError`].

use std::io;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use thiserror::Error;

use crate::protocol::ProtocolError;

/// Errors surfaced to callers of the service.
///
/// `Clone` so that one termination error can reject every pending call.
/// I/O errors are wrapped in `Arc` for the same reason.
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    /// The worker executable could not be started
    #[error("failed to spawn worker {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: Arc<io::Error>,
    },

    /// Writing to the worker's stdin failed
    #[error("failed to write to worker: {0}")]
    Write(#[source] Arc<io::Error>),

    /// Reading from the worker's stdout failed
    #[error("failed to read from worker: {0}")]
    Read(#[source] Arc<io::Error>),

    /// The worker closed its stdout, or the channel was closed without a cause
    #[error("the service is no longer running")]
    ConnectionClosed,

    /// The worker process exited
    #[error("the service was stopped: worker exited ({0})")]
    Exited(String),

    /// The service was stopped explicitly
    #[error("the service was stopped")]
    Stopped,

    /// A frame or payload could not be decoded
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The worker answered a request id that is not pending
    #[error("response for unknown request id {0}")]
    UnknownRequestId(u32),

    /// A one-shot worker sent a request, which cannot be answered there
    #[error("unexpected request {0:?} from worker")]
    UnexpectedRequest(String),

    /// The worker reports a different protocol version than the host
    #[error("host version {host:?} does not match worker version {worker:?}")]
    VersionMismatch { host: String, worker: String },

    /// The ping handshake failed for a reason other than a version mismatch
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The worker reported an application error for this call only
    #[error("{command}: {message}")]
    Remote { command: String, message: String },

    /// A caller-level timeout expired; the request itself stays pending
    #[error("{command} timed out after {after:?}")]
    Timeout { command: String, after: Duration },
}

/// Result type for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

impl ServiceError {
    pub(crate) fn spawn(program: impl Into<String>, source: io::Error) -> Self {
        ServiceError::Spawn {
            program: program.into(),
            source: Arc::new(source),
        }
    }

    /// Whether this error ends the worker process it occurred on.
    ///
    /// `Remote` and `Timeout` affect one call only.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ServiceError::Remote { .. } | ServiceError::Timeout { .. }
        )
    }
}

/// Helper trait to recover a guard from a poisoned lock with a warning.
pub(crate) trait LockResultExt<T> {
    /// The context identifies which operation triggered recovery.
    fn recover_poison(self, context: &str) -> T;
}

impl<T> LockResultExt<T> for Result<T, PoisonError<T>> {
    fn recover_poison(self, context: &str) -> T {
        match self {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!(
                    target: "tsunagi::lock_recovery",
                    "Recovered from poisoned lock in {}",
                    context
                );
                poisoned.into_inner()
            }
        }
    }
}
