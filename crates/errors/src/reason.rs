//! Retry reasons.

use std::fmt;

use serde::Serialize;

/// Why a request is being considered for retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetryReason {
    Unknown,
    SocketNotAvailable,
    ServiceNotAvailable,
    NodeNotAvailable,
    KvNotMyVbucket,
    KvCollectionOutdated,
    KvErrorMapRetryIndicated,
    KvLocked,
    KvTemporaryFailure,
    KvSyncWriteInProgress,
    KvSyncWriteReCommitInProgress,
    ServiceResponseCodeIndicated,
    SocketClosedWhileInFlight,
    PipelineOverloaded,
    CircuitBreakerOpen,
    QueryIndexNotFound,
    QueryPreparedStatementFailure,
    QueryErrorRetryable,
    AnalyticsTemporaryFailure,
    SearchTooManyRequests,
    NotReady,
    NoPipelineSnapshot,
    BucketNotReady,
    ConnectionError,
    MemdWriteFailure,
}

impl RetryReason {
    /// Whether a request that is not idempotent may be retried for this reason.
    pub fn allows_non_idempotent_retry(self) -> bool {
        !matches!(self, Self::Unknown | Self::SocketClosedWhileInFlight)
    }

    /// Reasons that bypass the installed strategy and always retry.
    pub fn always_retry(self) -> bool {
        matches!(
            self,
            Self::KvNotMyVbucket | Self::KvCollectionOutdated | Self::PipelineOverloaded
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::SocketNotAvailable => "SOCKET_NOT_AVAILABLE",
            Self::ServiceNotAvailable => "SERVICE_NOT_AVAILABLE",
            Self::NodeNotAvailable => "NODE_NOT_AVAILABLE",
            Self::KvNotMyVbucket => "KV_NOT_MY_VBUCKET",
            Self::KvCollectionOutdated => "KV_COLLECTION_OUTDATED",
            Self::KvErrorMapRetryIndicated => "KV_ERROR_MAP_RETRY_INDICATED",
            Self::KvLocked => "KV_LOCKED",
            Self::KvTemporaryFailure => "KV_TEMPORARY_FAILURE",
            Self::KvSyncWriteInProgress => "KV_SYNC_WRITE_IN_PROGRESS",
            Self::KvSyncWriteReCommitInProgress => "KV_SYNC_WRITE_RE_COMMIT_IN_PROGRESS",
            Self::ServiceResponseCodeIndicated => "SERVICE_RESPONSE_CODE_INDICATED",
            Self::SocketClosedWhileInFlight => "SOCKET_CLOSED_WHILE_IN_FLIGHT",
            Self::PipelineOverloaded => "PIPELINE_OVERLOADED",
            Self::CircuitBreakerOpen => "CIRCUIT_BREAKER_OPEN",
            Self::QueryIndexNotFound => "QUERY_INDEX_NOT_FOUND",
            Self::QueryPreparedStatementFailure => "QUERY_PREPARED_STATEMENT_FAILURE",
            Self::QueryErrorRetryable => "QUERY_ERROR_RETRYABLE",
            Self::AnalyticsTemporaryFailure => "ANALYTICS_TEMPORARY_FAILURE",
            Self::SearchTooManyRequests => "SEARCH_TOO_MANY_REQUESTS",
            Self::NotReady => "NOT_READY",
            Self::NoPipelineSnapshot => "NO_PIPELINE_SNAPSHOT",
            Self::BucketNotReady => "BUCKET_NOT_READY",
            Self::ConnectionError => "CONNECTION_ERROR",
            Self::MemdWriteFailure => "MEMD_WRITE_FAILURE",
        }
    }
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
