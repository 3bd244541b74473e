//! The error taxonomy surfaced to the host.

use roma_common::{ChannelError, WireError, WireErrorKind};

/// Errors produced by the runtime's load and invoke paths.
///
/// Every variant is terminal for the call that produced it; only
/// [`RomaError::QueueFull`] is meaningfully retryable by the host.
#[derive(Debug, thiserror::Error)]
pub enum RomaError {
    /// Admission refused: too many requests in flight or queued.
    #[error("execution queue is full")]
    QueueFull,

    /// The worker process died mid-call. The invocation failed; the worker
    /// is being replaced in the background.
    #[error("worker process terminated unexpectedly: {0}")]
    WorkerCrash(String),

    /// The invocation exceeded its wall-clock budget. The worker stays
    /// usable.
    #[error("execution exceeded its deadline: {0}")]
    DeadlineExceeded(String),

    /// Guest source failed to compile; carries the engine diagnostic.
    #[error("guest code failed to compile: {0}")]
    GuestCompileError(String),

    /// The guest threw; carries the stringified exception.
    #[error("guest code threw an exception: {0}")]
    GuestRuntimeError(String),

    /// The isolate reached its heap cap; the execution was aborted.
    #[error("guest code exhausted the engine heap")]
    GuestOutOfMemory,

    /// The selected `version_string` is not loaded on the target worker.
    #[error("code version '{0}' has not been loaded")]
    UnknownVersion(String),

    /// A host-callback round trip failed.
    #[error("native function callback failed: {0}")]
    CallbackError(String),

    /// A payload did not fit the shared buffer.
    #[error("payload exceeds the shared buffer")]
    PayloadTooLarge,

    /// The call was refused because the runtime is stopping.
    #[error("the runtime is shutting down")]
    Shutdown,

    /// Invalid configuration or request, detected before dispatch.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Anything else; parent-side failures that have no better home.
    #[error("{0}")]
    Internal(String),
}

/// The runtime's result type.
pub type Result<T> = std::result::Result<T, RomaError>;

/// Create an ad-hoc [`RomaError::Internal`] from format arguments.
#[macro_export]
macro_rules! new_error {
    ($($arg:tt)*) => {
        $crate::RomaError::Internal(format!($($arg)*))
    };
}

impl From<WireError> for RomaError {
    fn from(err: WireError) -> Self {
        match err.kind {
            WireErrorKind::Compile => RomaError::GuestCompileError(err.message),
            WireErrorKind::Runtime
                if err.message.contains(roma_common::BINDING_UNAVAILABLE_ERROR) =>
            {
                RomaError::CallbackError(err.message)
            }
            WireErrorKind::Runtime => RomaError::GuestRuntimeError(err.message),
            WireErrorKind::OutOfMemory => RomaError::GuestOutOfMemory,
            WireErrorKind::DeadlineExceeded => RomaError::DeadlineExceeded(err.message),
            WireErrorKind::UnknownVersion => RomaError::UnknownVersion(err.message),
            WireErrorKind::PayloadTooLarge => RomaError::PayloadTooLarge,
            // The worker said it cannot serve anymore; treat it like a
            // dead worker so the dispatcher spawns a replacement.
            WireErrorKind::Fatal => RomaError::WorkerCrash(err.message),
            WireErrorKind::Internal => RomaError::Internal(err.message),
        }
    }
}

impl From<ChannelError> for RomaError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Disconnected => {
                RomaError::WorkerCrash("channel to the worker closed".to_string())
            }
            ChannelError::TimedOut => {
                RomaError::WorkerCrash("worker stopped responding".to_string())
            }
            ChannelError::PayloadTooLarge => RomaError::PayloadTooLarge,
            other => RomaError::Internal(other.to_string()),
        }
    }
}
