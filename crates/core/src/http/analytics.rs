//! Analytics service adapter.

use std::sync::Arc;
use std::time::{Duration, Instant};

use cbcore_errors::{CoreError, CoreResult, ErrorKind, RetryReason, ServiceError, ServiceErrorDesc, ServiceType};
use reqwest::Method;
use serde_json::{Map, Value};
use uuid::Uuid;

use super::rows::RowReader;
use super::{HttpComponent, HttpRequest, parse_error_descs, status_kind};
use crate::retry::RetryStrategy;

const ANALYTICS_PATH: &str = "/analytics/service";
const PRIORITY_HEADER: &str = "Analytics-Priority";

#[derive(Debug, Clone, Default)]
pub struct AnalyticsOptions {
    pub payload: Map<String, Value>,
    /// Jumps the server-side queue when set.
    pub priority: bool,
    pub timeout: Option<Duration>,
    pub retry_strategy: Option<Arc<dyn RetryStrategy>>,
    pub endpoint: Option<String>,
    pub read_only: bool,
}

impl AnalyticsOptions {
    pub fn new(statement: impl Into<String>) -> Self {
        let mut payload = Map::new();
        payload.insert("statement".into(), Value::String(statement.into()));
        Self {
            payload,
            ..Default::default()
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(name.into(), value.into());
        self
    }

    pub fn with_priority(mut self, priority: bool) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }
}

pub(crate) fn classify_analytics_error(http_status: u16, errors: &[ServiceErrorDesc]) -> (ErrorKind, Option<RetryReason>) {
    let Some(first) = errors.first() else {
        return (status_kind(http_status), None);
    };
    match first.code {
        21002 => (ErrorKind::UnambiguousTimeout, None),
        23000 | 23003 => (ErrorKind::TemporaryFailure, Some(RetryReason::AnalyticsTemporaryFailure)),
        23007 => (ErrorKind::JobQueueFull, Some(RetryReason::AnalyticsTemporaryFailure)),
        20000 => (ErrorKind::AuthenticationFailure, None),
        24000 => (ErrorKind::ParsingFailure, None),
        24006 => (ErrorKind::LinkNotFound, None),
        24025 | 24044 | 24045 => (ErrorKind::DatasetNotFound, None),
        24034 => (ErrorKind::DataverseNotFound, None),
        24039 => (ErrorKind::DataverseExists, None),
        24040 => (ErrorKind::DatasetExists, None),
        24047 => (ErrorKind::IndexNotFound, None),
        24048 => (ErrorKind::IndexExists, None),
        24001..=24999 => (ErrorKind::CompilationFailure, None),
        _ => (status_kind(http_status), None),
    }
}

pub struct AnalyticsComponent {
    http: Arc<HttpComponent>,
    default_timeout: Duration,
}

impl AnalyticsComponent {
    pub fn new(http: Arc<HttpComponent>, default_timeout: Duration) -> Self {
        Self { http, default_timeout }
    }

    /// Runs an analytics statement and streams its `results`.
    pub async fn analytics_query(&self, opts: AnalyticsOptions) -> CoreResult<RowReader> {
        let deadline = Instant::now() + opts.timeout.unwrap_or(self.default_timeout);
        let mut payload = opts.payload.clone();
        let statement = payload
            .get("statement")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let context_id = match payload.get("client_context_id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => {
                let id = Uuid::new_v4().to_string();
                payload.insert("client_context_id".into(), Value::String(id.clone()));
                id
            }
        };

        let mut req = HttpRequest::new(ServiceType::Cbas, Method::POST, ANALYTICS_PATH)
            .with_deadline(deadline)
            .with_idempotent(opts.read_only)
            .with_unique_id(context_id.clone());
        if opts.priority {
            req = req.with_header(PRIORITY_HEADER, "-1");
        }
        req.retry_strategy = opts.retry_strategy.clone().or_else(|| Some(self.http.default_retry()));
        req.endpoint = opts.endpoint.clone();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(req.timeout_error(req.endpoint.as_deref().unwrap_or_default()));
            }
            payload.insert("timeout".into(), Value::String(format!("{}ms", remaining.as_millis())));
            let body = serde_json::to_vec(&payload).map_err(|e| CoreError::invalid_argument(e.to_string()))?;
            req.body = Some(body.into());

            let resp = self.http.do_http_request(&req).await?;
            if resp.status == 200 {
                return Ok(resp.into_rows("results"));
            }

            let status = resp.status;
            let endpoint = resp.endpoint.clone();
            let raw = resp.into_bytes().await?;
            let errors = parse_error_descs(&raw);
            let (kind, reason) = classify_analytics_error(status, &errors);

            let mut err = ServiceError::new(kind, ServiceType::Cbas);
            err.endpoint = endpoint;
            err.http_status = status;
            err.request = statement.clone();
            err.client_context_id = context_id.clone();
            err.errors = errors;
            if err.errors.is_empty() {
                err.error_text = String::from_utf8_lossy(&raw).into_owned();
            }
            let err = req.decorate(err);

            match reason {
                Some(reason) => self.http.wait_for_retry(&req, reason, deadline, err).await?,
                None => return Err(err),
            }
        }
    }
}
