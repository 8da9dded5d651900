//! Full-text search service adapter.

use std::sync::Arc;
use std::time::{Duration, Instant};

use cbcore_errors::{CoreError, CoreResult, ErrorKind, RetryReason, ServiceError, ServiceType};
use reqwest::Method;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::rows::RowReader;
use super::{HttpComponent, HttpRequest, status_kind};
use crate::retry::RetryStrategy;

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub index_name: String,
    /// The search request body: `query`, `size`, `ctl` and so on.
    pub payload: Map<String, Value>,
    pub timeout: Option<Duration>,
    pub retry_strategy: Option<Arc<dyn RetryStrategy>>,
    pub endpoint: Option<String>,
}

impl SearchOptions {
    pub fn new(index_name: impl Into<String>, query: Value) -> Self {
        let mut payload = Map::new();
        payload.insert("query".into(), query);
        Self {
            index_name: index_name.into(),
            payload,
            ..Default::default()
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(name.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Default, Deserialize)]
struct SearchErrorBody {
    #[serde(default)]
    error: String,
}

pub(crate) fn classify_search_error(http_status: u16, error_text: &str) -> (ErrorKind, Option<RetryReason>) {
    let text = error_text.to_lowercase();
    match http_status {
        400 | 404 if text.contains("index not found") || text.contains("no such index") => (ErrorKind::IndexNotFound, None),
        400 => (ErrorKind::InvalidArgument, None),
        404 => (ErrorKind::IndexNotFound, None),
        429 => (ErrorKind::TooManyRequests, Some(RetryReason::SearchTooManyRequests)),
        500 if text.contains("num_fts_indexes") => (ErrorKind::IndexFailure, None),
        other => (status_kind(other), None),
    }
}

pub struct SearchComponent {
    http: Arc<HttpComponent>,
    default_timeout: Duration,
}

impl SearchComponent {
    pub fn new(http: Arc<HttpComponent>, default_timeout: Duration) -> Self {
        Self { http, default_timeout }
    }

    /// Runs a search and streams its `hits`.
    pub async fn search_query(&self, opts: SearchOptions) -> CoreResult<RowReader> {
        if opts.index_name.is_empty() {
            return Err(CoreError::invalid_argument("search needs an index name"));
        }
        let deadline = Instant::now() + opts.timeout.unwrap_or(self.default_timeout);
        let mut payload = opts.payload.clone();
        let path = format!("/api/index/{}/query", urlencoding::encode(&opts.index_name));

        let mut req = HttpRequest::new(ServiceType::Fts, Method::POST, path)
            .with_deadline(deadline)
            .with_idempotent(true);
        req.retry_strategy = opts.retry_strategy.clone().or_else(|| Some(self.http.default_retry()));
        req.endpoint = opts.endpoint.clone();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(req.timeout_error(req.endpoint.as_deref().unwrap_or_default()));
            }
            let ctl = payload
                .entry("ctl")
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(ctl) = ctl {
                ctl.insert("timeout".into(), Value::from(remaining.as_millis() as u64));
            }
            let body = serde_json::to_vec(&payload).map_err(|e| CoreError::invalid_argument(e.to_string()))?;
            req.body = Some(body.into());

            let resp = self.http.do_http_request(&req).await?;
            if resp.status == 200 {
                return Ok(resp.into_rows("hits"));
            }

            let status = resp.status;
            let endpoint = resp.endpoint.clone();
            let raw = resp.into_bytes().await?;
            let error_text = serde_json::from_slice::<SearchErrorBody>(&raw)
                .map(|b| b.error)
                .ok()
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| String::from_utf8_lossy(&raw).into_owned());
            let (kind, reason) = classify_search_error(status, &error_text);

            let mut err = ServiceError::new(kind, ServiceType::Fts);
            err.endpoint = endpoint;
            err.http_status = status;
            err.request = opts.index_name.clone();
            err.error_text = error_text;
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
    fn test_classify_statuses() {
        assert_eq!(
            classify_search_error(429, "rate limit"),
            (ErrorKind::TooManyRequests, Some(RetryReason::SearchTooManyRequests))
        );
        assert_eq!(classify_search_error(400, "rest_auth: index not found").0, ErrorKind::IndexNotFound);
        assert_eq!(classify_search_error(400, "bad query").0, ErrorKind::InvalidArgument);
        assert_eq!(classify_search_error(401, "").0, ErrorKind::AuthenticationFailure);
        assert_eq!(classify_search_error(500, "boom").0, ErrorKind::InternalServerFailure);
    }
}
