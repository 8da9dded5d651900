//! Error kinds: the classification every client error resolves to.

use serde::Serialize;
use thiserror::Error;

/// Classification of a client error.
///
/// Callers match on kinds rather than on concrete error records; every
/// [`crate::CoreError`] variant reports one through [`crate::CoreError::kind`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Error, Serialize)]
pub enum ErrorKind {
    // Transport
    #[error("connection failed")]
    ConnectFailed,
    #[error("tls handshake failed")]
    TlsHandshake,
    #[error("socket closed")]
    SocketClosed,
    #[error("memd client closed")]
    ClientClosed,
    #[error("memd write failure")]
    ShortWrite,
    #[error("protocol error")]
    Protocol,
    #[error("circuit breaker open")]
    CircuitBreakerOpen,
    #[error("operation queue full")]
    Overload,
    #[error("pipeline closed")]
    PipelineClosed,
    #[error("shut down")]
    Shutdown,

    // Routing
    #[error("invalid replica index")]
    InvalidReplica,
    #[error("invalid vbucket")]
    InvalidVbucket,
    #[error("invalid server index")]
    InvalidServer,
    #[error("operation not supported in gcccp mode")]
    GcccpInUse,
    #[error("collections not supported by the server")]
    CollectionsUnsupported,
    #[error("feature not available")]
    FeatureNotAvailable,
    #[error("no endpoints available for service")]
    ServiceNotAvailable,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("unsupported operation")]
    UnsupportedOperation,
    #[error("bucket not found")]
    BucketNotFound,
    #[error("no bucket selected")]
    NoBucket,
    #[error("collection not found")]
    CollectionNotFound,
    #[error("scope not found")]
    ScopeNotFound,

    // Server transient
    #[error("temporary failure")]
    TemporaryFailure,
    #[error("document locked")]
    DocumentLocked,
    #[error("durable write in progress")]
    SyncWriteInProgress,
    #[error("durable write re-commit in progress")]
    SyncWriteRecommitInProgress,
    #[error("not my vbucket")]
    NotMyVbucket,
    #[error("config only")]
    ConfigOnly,
    #[error("rate limited")]
    RateLimited,
    #[error("out of memory")]
    OutOfMemory,
    #[error("not initialized")]
    NotInitialized,

    // Server permanent
    #[error("document not found")]
    DocumentNotFound,
    #[error("document exists")]
    DocumentExists,
    #[error("cas mismatch")]
    CasMismatch,
    #[error("value too large")]
    ValueTooLarge,
    #[error("not stored")]
    NotStored,
    #[error("delta invalid")]
    DeltaInvalid,
    #[error("document not locked")]
    DocumentNotLocked,
    #[error("authentication failure")]
    AuthenticationFailure,
    #[error("authentication continue")]
    AuthContinue,
    #[error("access denied")]
    AccessDenied,
    #[error("range error")]
    RangeError,
    #[error("rollback")]
    Rollback,
    #[error("invalid dcp stream id")]
    DcpStreamIdInvalid,
    #[error("durability level not available")]
    DurabilityLevelNotAvailable,
    #[error("durability impossible")]
    DurabilityImpossible,
    #[error("durability ambiguous")]
    DurabilityAmbiguous,
    #[error("internal server failure")]
    InternalServerFailure,
    #[error("path not found")]
    PathNotFound,
    #[error("path mismatch")]
    PathMismatch,
    #[error("path invalid")]
    PathInvalid,
    #[error("path too big")]
    PathTooBig,
    #[error("document too deep")]
    PathTooDeep,
    #[error("path exists")]
    PathExists,
    #[error("value too deep")]
    ValueTooDeep,
    #[error("value invalid")]
    ValueInvalid,
    #[error("document not json")]
    DocumentNotJson,
    #[error("number too big")]
    NumberTooBig,
    #[error("invalid subdocument combination")]
    SubdocBadCombo,
    #[error("subdocument multi path failure")]
    SubdocMultiPathFailure,
    #[error("xattr invalid flag combination")]
    XattrInvalidFlagCombo,
    #[error("xattr invalid key combination")]
    XattrInvalidKeyCombo,
    #[error("xattr unknown macro")]
    XattrUnknownMacro,
    #[error("xattr unknown virtual attribute")]
    XattrUnknownVirtualAttribute,
    #[error("xattr cannot modify virtual attribute")]
    XattrCannotModifyVirtualAttribute,
    #[error("xattr invalid order")]
    XattrInvalidOrder,
    #[error("cannot revive living document")]
    CannotReviveLivingDocument,
    #[error("deleted document cannot have value")]
    DeletedDocumentCantHaveValue,

    // Timeout
    #[error("unambiguous timeout")]
    UnambiguousTimeout,
    #[error("ambiguous timeout")]
    AmbiguousTimeout,

    // Cancelled
    #[error("request canceled")]
    RequestCanceled,

    // Service
    #[error("parsing failure")]
    ParsingFailure,
    #[error("planning failure")]
    PlanningFailure,
    #[error("index failure")]
    IndexFailure,
    #[error("prepared statement failure")]
    PreparedStatementFailure,
    #[error("compilation failure")]
    CompilationFailure,
    #[error("job queue full")]
    JobQueueFull,
    #[error("dataset not found")]
    DatasetNotFound,
    #[error("dataverse not found")]
    DataverseNotFound,
    #[error("dataset exists")]
    DatasetExists,
    #[error("dataverse exists")]
    DataverseExists,
    #[error("link not found")]
    LinkNotFound,
    #[error("index not found")]
    IndexNotFound,
    #[error("index exists")]
    IndexExists,
    #[error("view not found")]
    ViewNotFound,
    #[error("design document not found")]
    DesignDocumentNotFound,
    #[error("too many requests")]
    TooManyRequests,
    #[error("http error")]
    Http,

    #[default]
    #[error("unknown error")]
    Unknown,
}

impl ErrorKind {
    /// Whether a timeout of this request may have left a mutation applied.
    pub fn is_timeout(self) -> bool {
        matches!(self, Self::UnambiguousTimeout | Self::AmbiguousTimeout)
    }

    pub fn is_cancellation(self) -> bool {
        matches!(self, Self::RequestCanceled)
    }

    /// Transport-level failures that are candidates for local recovery.
    pub fn is_transport(self) -> bool {
        matches!(
            self,
            Self::ConnectFailed
                | Self::TlsHandshake
                | Self::SocketClosed
                | Self::ClientClosed
                | Self::ShortWrite
                | Self::Protocol
                | Self::CircuitBreakerOpen
                | Self::Overload
                | Self::PipelineClosed
        )
    }
}
