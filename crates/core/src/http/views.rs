//! Views service adapter.

use std::sync::Arc;
use std::time::{Duration, Instant};

use cbcore_errors::{CoreError, CoreResult, ErrorKind, RetryReason, ServiceError, ServiceType};
use reqwest::Method;
use serde::Deserialize;

use super::rows::RowReader;
use super::{HttpComponent, HttpRequest, status_kind};
use crate::retry::RetryStrategy;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DesignDocumentNamespace {
    #[default]
    Production,
    /// Design documents prefixed with `dev_`.
    Development,
}

#[derive(Debug, Clone, Default)]
pub struct ViewOptions {
    pub design_document: String,
    pub view_name: String,
    pub namespace: DesignDocumentNamespace,
    /// Queries a spatial view instead of a map/reduce one.
    pub spatial: bool,
    /// Query-string options such as `limit`, `stale` or `key`.
    pub options: Vec<(String, String)>,
    pub timeout: Option<Duration>,
    pub retry_strategy: Option<Arc<dyn RetryStrategy>>,
    pub endpoint: Option<String>,
}

impl ViewOptions {
    pub fn new(design_document: impl Into<String>, view_name: impl Into<String>) -> Self {
        Self {
            design_document: design_document.into(),
            view_name: view_name.into(),
            ..Default::default()
        }
    }

    pub fn with_namespace(mut self, namespace: DesignDocumentNamespace) -> Self {
        self.namespace = namespace;
        self
    }

    pub fn with_option(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.push((name.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn path(&self, bucket: &str) -> String {
        let ddoc = match self.namespace {
            DesignDocumentNamespace::Development if !self.design_document.starts_with("dev_") => {
                format!("dev_{}", self.design_document)
            }
            _ => self.design_document.clone(),
        };
        let kind = if self.spatial { "_spatial" } else { "_view" };
        let mut path = format!(
            "/{}/_design/{}/{kind}/{}",
            urlencoding::encode(bucket),
            urlencoding::encode(&ddoc),
            urlencoding::encode(&self.view_name)
        );
        if !self.options.is_empty() {
            let query: Vec<String> = self
                .options
                .iter()
                .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
                .collect();
            path.push('?');
            path.push_str(&query.join("&"));
        }
        path
    }
}

#[derive(Debug, Default, Deserialize)]
struct ViewErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    reason: String,
}

pub(crate) fn classify_view_error(http_status: u16, error: &str, reason: &str) -> (ErrorKind, Option<RetryReason>) {
    match http_status {
        404 | 500 if error == "not_found" && (reason == "missing" || reason == "deleted") => {
            (ErrorKind::DesignDocumentNotFound, None)
        }
        404 | 500 if reason.contains("missing_named_view") || error.contains("missing_named_view") => {
            (ErrorKind::ViewNotFound, None)
        }
        404 => (ErrorKind::ViewNotFound, None),
        503 => (ErrorKind::TemporaryFailure, Some(RetryReason::ServiceResponseCodeIndicated)),
        other => (status_kind(other), None),
    }
}

pub struct ViewsComponent {
    http: Arc<HttpComponent>,
    bucket: String,
    default_timeout: Duration,
}

impl ViewsComponent {
    pub fn new(http: Arc<HttpComponent>, bucket: impl Into<String>, default_timeout: Duration) -> Self {
        Self {
            http,
            bucket: bucket.into(),
            default_timeout,
        }
    }

    /// Queries a view and streams its `rows`.
    pub async fn view_query(&self, opts: ViewOptions) -> CoreResult<RowReader> {
        if self.bucket.is_empty() {
            return Err(CoreError::message(ErrorKind::NoBucket, "views need a bucket"));
        }
        if opts.design_document.is_empty() || opts.view_name.is_empty() {
            return Err(CoreError::invalid_argument("design document and view name are required"));
        }
        let deadline = Instant::now() + opts.timeout.unwrap_or(self.default_timeout);
        let path = opts.path(&self.bucket);

        let mut req = HttpRequest::new(ServiceType::Capi, Method::GET, path.clone())
            .with_deadline(deadline)
            .with_idempotent(true);
        req.retry_strategy = opts.retry_strategy.clone().or_else(|| Some(self.http.default_retry()));
        req.endpoint = opts.endpoint.clone();

        loop {
            let resp = self.http.do_http_request(&req).await?;
            if resp.status == 200 {
                return Ok(resp.into_rows("rows"));
            }

            let status = resp.status;
            let endpoint = resp.endpoint.clone();
            let raw = resp.into_bytes().await?;
            let body: ViewErrorBody = serde_json::from_slice(&raw).unwrap_or_default();
            let (kind, reason) = classify_view_error(status, &body.error, &body.reason);

            let mut err = ServiceError::new(kind, ServiceType::Capi);
            err.endpoint = endpoint;
            err.http_status = status;
            err.request = path.clone();
            err.error_text = if body.error.is_empty() {
                String::from_utf8_lossy(&raw).into_owned()
            } else {
                format!("{}: {}", body.error, body.reason)
            };
            let err = req.decorate(err);

            match reason {
                Some(reason) => self.http.wait_for_retry(&req, reason, deadline, err).await?,
                None => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_path() {
        let opts = ViewOptions::new("users", "by name")
            .with_namespace(DesignDocumentNamespace::Development)
            .with_option("limit", "10")
            .with_option("startkey", "\"a\"");
        assert_eq!(
            opts.path("travel"),
            "/travel/_design/dev_users/_view/by%20name?limit=10&startkey=%22a%22"
        );

        let spatial = ViewOptions {
            spatial: true,
            ..ViewOptions::new("geo", "points")
        };
        assert_eq!(spatial.path("b"), "/b/_design/geo/_spatial/points");
    }

    #[test]
    fn test_classify_view_errors() {
        assert_eq!(classify_view_error(404, "not_found", "missing").0, ErrorKind::DesignDocumentNotFound);
        assert_eq!(classify_view_error(404, "not_found", "deleted").0, ErrorKind::DesignDocumentNotFound);
        assert_eq!(
            classify_view_error(500, "error", "{not_found, missing_named_view}").0,
            ErrorKind::ViewNotFound
        );
        assert_eq!(
            classify_view_error(503, "", ""),
            (ErrorKind::TemporaryFailure, Some(RetryReason::ServiceResponseCodeIndicated))
        );
        assert_eq!(classify_view_error(400, "bad_request", "").0, ErrorKind::Http);
    }
}
