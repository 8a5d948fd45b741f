//! Error taxonomy shared by the host meta-service and the guest agent.
//!
//! Execution outcomes (a command exiting non-zero) are never errors here;
//! they travel as [`ShellResult`](crate::transport::protocol::ShellResult). These
//! variants describe missing resources, protocol violations and channel
//! failures.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced by the bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The requested artifact or folder does not exist in the guest.
    #[error("resource not found")]
    ResourceNotFound,

    /// No action with the given id is known to the meta-service.
    #[error("unknown action: {0}")]
    UnknownAction(String),

    /// No shell session with the given id is known to the meta-service.
    #[error("unknown session: {0}")]
    UnknownSession(String),

    /// A stream offset outside the retained window `[start, end]`.
    #[error("offset {offset} outside stream window [{start}, {end}]")]
    OffsetOutOfRange { offset: u64, start: u64, end: u64 },

    /// Bytes were written to a stream after its EOF mark.
    #[error("stream is closed")]
    StreamClosed,

    /// A single-assignment value was assigned twice.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The request could not be understood.
    #[error("malformed request: {0}")]
    Malformed(String),

    /// The guest could not start the requested command.
    #[error("failed to spawn command: {0}")]
    Spawn(String),

    /// The guest failed to carry out an action for a reason other than a
    /// missing resource.
    #[error("guest error: {0}")]
    Remote(String),

    /// The HTTP channel between guest and host failed.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Local I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation was abandoned because the service is shutting down.
    #[error("operation cancelled")]
    Cancelled,
}

impl BridgeError {
    /// Whether retrying the same request may succeed.
    ///
    /// Only channel-level failures qualify; protocol errors and missing
    /// resources are final.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Wire code for this error.
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::ResourceNotFound => ErrorCode::ResourceNotFound,
            Self::UnknownAction(_) => ErrorCode::UnknownAction,
            Self::UnknownSession(_) => ErrorCode::UnknownSession,
            Self::OffsetOutOfRange { .. } => ErrorCode::OffsetOutOfRange,
            Self::StreamClosed => ErrorCode::StreamClosed,
            Self::Conflict(_) => ErrorCode::Conflict,
            Self::Malformed(_) => ErrorCode::Malformed,
            Self::Spawn(_) => ErrorCode::Spawn,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::Remote(_) | Self::Transport(_) | Self::Io(_) => ErrorCode::Internal,
        }
    }
}

/// Error kinds as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    ResourceNotFound,
    UnknownAction,
    UnknownSession,
    OffsetOutOfRange,
    StreamClosed,
    Conflict,
    Malformed,
    Spawn,
    Cancelled,
    Internal,
}

/// JSON body of every non-2xx response from the meta-service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    /// Populated for `offset-out-of-range` only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<(u64, u64, u64)>,
}

impl From<&BridgeError> for ErrorBody {
    fn from(err: &BridgeError) -> Self {
        let window = match *err {
            BridgeError::OffsetOutOfRange { offset, start, end } => Some((offset, start, end)),
            _ => None,
        };
        Self {
            code: err.code(),
            message: err.to_string(),
            window,
        }
    }
}

impl From<ErrorBody> for BridgeError {
    fn from(body: ErrorBody) -> Self {
        match body.code {
            ErrorCode::ResourceNotFound => Self::ResourceNotFound,
            ErrorCode::UnknownAction => Self::UnknownAction(body.message),
            ErrorCode::UnknownSession => Self::UnknownSession(body.message),
            ErrorCode::OffsetOutOfRange => {
                let (offset, start, end) = body.window.unwrap_or_default();
                Self::OffsetOutOfRange { offset, start, end }
            }
            ErrorCode::StreamClosed => Self::StreamClosed,
            ErrorCode::Conflict => Self::Conflict(body.message),
            ErrorCode::Malformed => Self::Malformed(body.message),
            ErrorCode::Spawn => Self::Spawn(body.message),
            ErrorCode::Cancelled => Self::Cancelled,
            ErrorCode::Internal => Self::Remote(body.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_window_survives_the_wire() {
        let err = BridgeError::OffsetOutOfRange {
            offset: 90,
            start: 10,
            end: 40,
        };
        let json = serde_json::to_string(&ErrorBody::from(&err)).unwrap();
        assert!(json.contains("\"code\":\"offset-out-of-range\""));

        let back: BridgeError = serde_json::from_str::<ErrorBody>(&json).unwrap().into();
        assert!(matches!(
            back,
            BridgeError::OffsetOutOfRange {
                offset: 90,
                start: 10,
                end: 40
            }
        ));
    }

    #[test]
    fn only_transport_failures_are_retryable() {
        assert!(!BridgeError::ResourceNotFound.is_retryable());
        assert!(!BridgeError::StreamClosed.is_retryable());
        assert!(!BridgeError::Conflict("result".into()).is_retryable());
    }

    #[test]
    fn internal_errors_map_to_remote() {
        let body = ErrorBody {
            code: ErrorCode::Internal,
            message: "disk on fire".into(),
            window: None,
        };
        assert!(matches!(BridgeError::from(body), BridgeError::Remote(m) if m == "disk on fire"));
    }
}
