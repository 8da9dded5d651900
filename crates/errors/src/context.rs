//! Contextual error records.
//!
//! Each record wraps an [`ErrorKind`] with the operational context known at
//! the time of failure. `Display` renders `"<kind> | <context json>"`.

use std::fmt;

use serde::Serialize;

use crate::kind::ErrorKind;
use crate::reason::RetryReason;
use crate::service::ServiceType;

fn is_zero(v: &u32) -> bool {
    *v == 0
}

fn render<T: Serialize>(f: &mut fmt::Formatter<'_>, inner: ErrorKind, ctx: &T) -> fmt::Result {
    match serde_json::to_string(ctx) {
        Ok(json) => write!(f, "{inner} | {json}"),
        Err(_) => write!(f, "{inner}"),
    }
}

/// A key/value operation failure.
#[derive(Debug, Clone, Default, Serialize)]
pub struct KeyValueError {
    #[serde(skip)]
    pub inner: ErrorKind,
    pub status_code: u16,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub document_key: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub bucket: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub scope: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub collection: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub collection_id: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error_description: String,
    pub opaque: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub retry_reasons: Vec<RetryReason>,
    #[serde(skip_serializing_if = "is_zero")]
    pub retry_attempts: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_dispatched_to: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_dispatched_from: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_connection_id: String,
}

impl KeyValueError {
    pub fn new(inner: ErrorKind) -> Self {
        Self {
            inner,
            ..Default::default()
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.inner
    }
}

impl fmt::Display for KeyValueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        render(f, self.inner, self)
    }
}

impl std::error::Error for KeyValueError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

/// A request that ran out of time.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TimeoutError {
    #[serde(skip)]
    pub inner: ErrorKind,
    #[serde(rename = "s")]
    pub operation: String,
    #[serde(rename = "i", skip_serializing_if = "String::is_empty")]
    pub operation_id: String,
    #[serde(rename = "t")]
    pub time_observed_us: u64,
    #[serde(rename = "rr", skip_serializing_if = "Vec::is_empty")]
    pub retry_reasons: Vec<RetryReason>,
    #[serde(rename = "rc", skip_serializing_if = "is_zero")]
    pub retry_attempts: u32,
    #[serde(rename = "r", skip_serializing_if = "String::is_empty")]
    pub last_dispatched_to: String,
    #[serde(rename = "l", skip_serializing_if = "String::is_empty")]
    pub last_dispatched_from: String,
    #[serde(rename = "c", skip_serializing_if = "String::is_empty")]
    pub last_connection_id: String,
}

impl TimeoutError {
    pub fn new(ambiguous: bool) -> Self {
        let inner = if ambiguous {
            ErrorKind::AmbiguousTimeout
        } else {
            ErrorKind::UnambiguousTimeout
        };
        Self {
            inner,
            ..Default::default()
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.inner
    }
}

impl fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        render(f, self.inner, self)
    }
}

impl std::error::Error for TimeoutError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

/// One error entry reported in a service response body.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServiceErrorDesc {
    pub code: u32,
    pub message: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub retry: bool,
}

/// An HTTP service failure (query, analytics, search, views, management).
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServiceError {
    #[serde(skip)]
    pub inner: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceType>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub endpoint: String,
    #[serde(skip_serializing_if = "is_zero_u16")]
    pub http_status: u16,
    /// Statement, index name or view path, depending on the service.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub request: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub client_context_id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ServiceErrorDesc>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error_text: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub retry_reasons: Vec<RetryReason>,
    #[serde(skip_serializing_if = "is_zero")]
    pub retry_attempts: u32,
}

fn is_zero_u16(v: &u16) -> bool {
    *v == 0
}

impl ServiceError {
    pub fn new(inner: ErrorKind, service: ServiceType) -> Self {
        Self {
            inner,
            service: Some(service),
            ..Default::default()
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.inner
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        render(f, self.inner, self)
    }
}

impl std::error::Error for ServiceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}
