//! cbcore-errors - client error taxonomy
//!
//! Every failure the client surfaces is a [`CoreError`]. Callers classify
//! failures through [`CoreError::kind`]; the richer variants carry the
//! operational context (opaque, collection, retry history, last dispatch)
//! that was known when the failure happened.

mod context;
mod kind;
mod reason;
mod service;
mod status;

pub use context::{KeyValueError, ServiceError, ServiceErrorDesc, TimeoutError};
pub use kind::ErrorKind;
pub use reason::RetryReason;
pub use service::ServiceType;
pub use status::{is_success_for, kind_for_response, kind_for_status};

use cbcore_memd::MemdError;
use thiserror::Error;

/// Client error.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    #[error("{0}")]
    Basic(ErrorKind),

    #[error("{kind}: {message}")]
    Message { kind: ErrorKind, message: String },

    #[error("{0}")]
    KeyValue(Box<KeyValueError>),

    #[error("{0}")]
    Timeout(Box<TimeoutError>),

    #[error("{0}")]
    Service(Box<ServiceError>),

    /// A single path of a sub-document request failed.
    #[error("subdocument operation {index} failed: {kind}")]
    SubDocument { index: usize, kind: ErrorKind },
}

impl CoreError {
    pub fn new(kind: ErrorKind) -> Self {
        Self::Basic(kind)
    }

    pub fn message(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Message {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::message(ErrorKind::InvalidArgument, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::message(ErrorKind::Protocol, message)
    }

    pub fn canceled() -> Self {
        Self::Basic(ErrorKind::RequestCanceled)
    }

    pub fn shutdown() -> Self {
        Self::Basic(ErrorKind::Shutdown)
    }

    /// The classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Basic(kind) => *kind,
            Self::Message { kind, .. } => *kind,
            Self::KeyValue(e) => e.kind(),
            Self::Timeout(e) => e.kind(),
            Self::Service(e) => e.kind(),
            Self::SubDocument { kind, .. } => *kind,
        }
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind() == kind
    }

    pub fn is_timeout(&self) -> bool {
        self.kind().is_timeout()
    }

    /// The key/value context, if this error came from a key/value response.
    pub fn as_key_value(&self) -> Option<&KeyValueError> {
        match self {
            Self::KeyValue(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_timeout(&self) -> Option<&TimeoutError> {
        match self {
            Self::Timeout(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_service(&self) -> Option<&ServiceError> {
        match self {
            Self::Service(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ErrorKind> for CoreError {
    fn from(kind: ErrorKind) -> Self {
        Self::Basic(kind)
    }
}

impl From<KeyValueError> for CoreError {
    fn from(e: KeyValueError) -> Self {
        Self::KeyValue(Box::new(e))
    }
}

impl From<TimeoutError> for CoreError {
    fn from(e: TimeoutError) -> Self {
        Self::Timeout(Box::new(e))
    }
}

impl From<ServiceError> for CoreError {
    fn from(e: ServiceError) -> Self {
        Self::Service(Box::new(e))
    }
}

impl From<MemdError> for CoreError {
    fn from(e: MemdError) -> Self {
        match e {
            MemdError::Io(io) => Self::message(ErrorKind::SocketClosed, io.to_string()),
            other => Self::message(ErrorKind::Protocol, other.to_string()),
        }
    }
}

/// Result alias used across the client.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_passthrough() {
        let err = CoreError::from(ErrorKind::DocumentNotFound);
        assert!(err.is(ErrorKind::DocumentNotFound));
        assert_eq!(err.to_string(), "document not found");
    }

    #[test]
    fn test_key_value_display_includes_context() {
        let mut kv = KeyValueError::new(ErrorKind::DocumentLocked);
        kv.status_code = 0x09;
        kv.document_key = "k1".into();
        kv.opaque = 12;
        kv.retry_reasons = vec![RetryReason::KvLocked];
        kv.retry_attempts = 2;
        let err = CoreError::from(kv);

        assert!(err.is(ErrorKind::DocumentLocked));
        let text = err.to_string();
        assert!(text.starts_with("document locked | {"), "{text}");
        assert!(text.contains("\"document_key\":\"k1\""));
        assert!(text.contains("\"retry_reasons\":[\"KV_LOCKED\"]"));
        assert!(!text.contains("scope"));
    }

    #[test]
    fn test_timeout_ambiguity() {
        let err = CoreError::from(TimeoutError::new(true));
        assert!(err.is(ErrorKind::AmbiguousTimeout));
        assert!(err.is_timeout());
        let err = CoreError::from(TimeoutError::new(false));
        assert!(err.is(ErrorKind::UnambiguousTimeout));
    }

    #[test]
    fn test_source_exposes_kind() {
        use std::error::Error;
        let kv = KeyValueError::new(ErrorKind::CasMismatch);
        let source = kv.source().map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("cas mismatch"));
    }

    #[test]
    fn test_memd_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert!(CoreError::from(MemdError::Io(io)).is(ErrorKind::SocketClosed));
        assert!(CoreError::from(MemdError::InvalidLeb128).is(ErrorKind::Protocol));
    }
}
