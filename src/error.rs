//! Error taxonomy for the node.
//!
//! Two layers live here: [`ShareError`], the crate-wide error enum used by
//! every fallible operation, and [`ErrorCode`], the stable string codes that
//! cross the wire in `TRANSFER_ERROR` envelopes and end up on terminal
//! transfer states.

use thiserror::Error;

pub type ShareResult<T> = std::result::Result<T, ShareError>;

#[derive(Debug, Error)]
pub enum ShareError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("unknown message type {0:?}")]
    UnknownType(String),

    #[error("failed to decode {kind} payload: {source}")]
    PayloadDecodeFailed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("peer closed the stream")]
    PeerClosed,

    #[error("expected {expected}, received {got}")]
    UnexpectedMessage { expected: &'static str, got: String },

    #[error("discovery start failed: {0}")]
    DiscoveryStartFailed(String),

    #[error("failed to resolve service {0}")]
    ResolveFailed(String),

    #[error("unknown peer {0}")]
    PeerUnknown(String),

    #[error("peer {0} is offline")]
    PeerOffline(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("remote error {code}: {message}")]
    Remote { code: String, message: String },

    #[error("transfer cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("node is not running")]
    NotRunning,
}

impl ShareError {
    /// Whether another connection attempt is permitted under the backoff
    /// policy. Network-level failures are; everything else is terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            ShareError::ConnectionLost(_) | ShareError::PeerClosed => true,
            ShareError::Remote { code, .. } => code_is_retryable(code),
            _ => false,
        }
    }
}

/// Stable error codes carried in `TRANSFER_ERROR` payloads and on
/// `TransferState::Failed`. The wire form is the SCREAMING_SNAKE string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    FileNotFound,
    PermissionDenied,
    StorageFull,
    ConnectionLost,
    InvalidRequest,
    TransferCancelled,
    IoError,
    PeerUnknown,
    PeerOffline,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::FileNotFound => "FILE_NOT_FOUND",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::StorageFull => "STORAGE_FULL",
            ErrorCode::ConnectionLost => "CONNECTION_LOST",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::TransferCancelled => "TRANSFER_CANCELLED",
            ErrorCode::IoError => "IO_ERROR",
            ErrorCode::PeerUnknown => "PEER_UNKNOWN",
            ErrorCode::PeerOffline => "PEER_OFFLINE",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remote error codes that must not trigger another attempt. Codes this
/// node has never heard of are treated as transient.
pub fn code_is_retryable(code: &str) -> bool {
    !matches!(
        code,
        "FILE_NOT_FOUND"
            | "PERMISSION_DENIED"
            | "STORAGE_FULL"
            | "TRANSFER_CANCELLED"
            | "INVALID_REQUEST"
            | "PEER_UNKNOWN"
            | "PEER_OFFLINE"
            | "IO_ERROR"
    )
}

/// Map a local write-path I/O failure onto the closest stable code.
pub fn code_for_io(err: &std::io::Error) -> ErrorCode {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::PermissionDenied => ErrorCode::PermissionDenied,
        ErrorKind::StorageFull | ErrorKind::QuotaExceeded => ErrorCode::StorageFull,
        _ => ErrorCode::IoError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_are_stable() {
        assert_eq!(ErrorCode::FileNotFound.as_str(), "FILE_NOT_FOUND");
        assert_eq!(ErrorCode::ConnectionLost.as_str(), "CONNECTION_LOST");
        assert_eq!(ErrorCode::TransferCancelled.as_str(), "TRANSFER_CANCELLED");
        assert_eq!(ErrorCode::InvalidRequest.as_str(), "INVALID_REQUEST");
    }

    #[test]
    fn retryability_classification() {
        assert!(code_is_retryable("CONNECTION_LOST"));
        assert!(code_is_retryable("SOME_FUTURE_CODE"));

        assert!(!code_is_retryable("FILE_NOT_FOUND"));
        assert!(!code_is_retryable("PERMISSION_DENIED"));
        assert!(!code_is_retryable("STORAGE_FULL"));
        assert!(!code_is_retryable("TRANSFER_CANCELLED"));
        assert!(!code_is_retryable("INVALID_REQUEST"));
    }

    #[test]
    fn network_errors_are_retryable() {
        assert!(ShareError::ConnectionLost("reset".into()).is_retryable());
        assert!(ShareError::PeerClosed.is_retryable());
        assert!(!ShareError::InvalidRequest("bad".into()).is_retryable());
        assert!(!ShareError::Remote {
            code: "FILE_NOT_FOUND".into(),
            message: "missing".into()
        }
        .is_retryable());
    }
}
