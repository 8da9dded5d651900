//! Query (N1QL) service adapter and the prepared-statement cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cbcore_errors::{CoreError, CoreResult, ErrorKind, RetryReason, ServiceError, ServiceErrorDesc, ServiceType};
use parking_lot::RwLock;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use super::rows::RowReader;
use super::{HttpComponent, HttpRequest, parse_error_descs, status_kind};
use crate::retry::RetryStrategy;

const QUERY_PATH: &str = "/query/service";

#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Request body fields: `statement`, `args`, `query_context` and so on.
    pub payload: Map<String, Value>,
    pub timeout: Option<Duration>,
    pub retry_strategy: Option<Arc<dyn RetryStrategy>>,
    pub endpoint: Option<String>,
    /// Allows retries after the statement may have reached the server.
    pub read_only: bool,
}

impl QueryOptions {
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

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_retry_strategy(mut self, strategy: Arc<dyn RetryStrategy>) -> Self {
        self.retry_strategy = Some(strategy);
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn statement(&self) -> Option<&str> {
        self.payload.get("statement").and_then(Value::as_str)
    }
}

/// A cached prepared statement. The plan is only kept for clusters without
/// enhanced prepared statements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedEntry {
    pub name: String,
    pub encoded_plan: Option<String>,
}

/// Prepared statements keyed by statement text.
#[derive(Debug, Default)]
pub struct PreparedCache {
    entries: RwLock<HashMap<String, PreparedEntry>>,
}

impl PreparedCache {
    pub fn get(&self, statement: &str) -> Option<PreparedEntry> {
        self.entries.read().get(statement).cloned()
    }

    pub fn insert(&self, statement: impl Into<String>, entry: PreparedEntry) {
        self.entries.write().insert(statement.into(), entry);
    }

    pub fn remove(&self, statement: &str) -> Option<PreparedEntry> {
        self.entries.write().remove(statement)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

/// Classifies a failed query response by its first error code.
pub(crate) fn classify_query_error(http_status: u16, errors: &[ServiceErrorDesc]) -> (ErrorKind, Option<RetryReason>) {
    let Some(first) = errors.first() else {
        return (status_kind(http_status), None);
    };
    let msg = first.message.to_lowercase();
    let (kind, reason) = match first.code {
        1191..=1194 => (ErrorKind::RateLimited, None),
        3000 => (ErrorKind::ParsingFailure, None),
        4040 | 4050 | 4070 => (
            ErrorKind::PreparedStatementFailure,
            Some(RetryReason::QueryPreparedStatementFailure),
        ),
        4060 | 4080 | 4090 => (ErrorKind::PreparedStatementFailure, None),
        4300 => (ErrorKind::IndexExists, None),
        4000..=4999 => (ErrorKind::PlanningFailure, None),
        5000 if msg.contains("queryport.indexnotfound") => (ErrorKind::IndexFailure, Some(RetryReason::QueryIndexNotFound)),
        5000 if msg.contains("index") && msg.contains("already exist") => (ErrorKind::IndexExists, None),
        5000 if msg.contains("index") && msg.contains("not found") => (ErrorKind::IndexNotFound, None),
        5000 => (ErrorKind::InternalServerFailure, None),
        12009 if msg.contains("cas mismatch") => (ErrorKind::CasMismatch, None),
        12009 if msg.contains("duplicate key") => (ErrorKind::DocumentExists, None),
        12009 => (ErrorKind::InternalServerFailure, None),
        12004 | 12016 => (ErrorKind::IndexNotFound, None),
        12000..=12999 | 14000..=14999 => (ErrorKind::IndexFailure, None),
        10000..=10999 | 13014 => (ErrorKind::AuthenticationFailure, None),
        _ => (status_kind(http_status), None),
    };
    let reason = reason.or_else(|| errors.iter().any(|e| e.retry).then_some(RetryReason::QueryErrorRetryable));
    (kind, reason)
}

/// True when a prepared name is no longer usable and must be re-prepared.
pub(crate) fn is_stale_prepared(err: &CoreError) -> bool {
    err.as_service().is_some_and(|e| {
        e.errors.first().is_some_and(|d| {
            matches!(d.code, 4040 | 4050 | 4070)
                || (d.code == 5000 && d.message.to_lowercase().contains("queryport.indexnotfound"))
        })
    })
}

#[derive(Debug, Deserialize)]
struct PrepareRow {
    name: String,
    #[serde(default)]
    encoded_plan: Option<String>,
}

pub struct QueryComponent {
    http: Arc<HttpComponent>,
    cache: PreparedCache,
    default_timeout: Duration,
}

impl QueryComponent {
    pub fn new(http: Arc<HttpComponent>, default_timeout: Duration) -> Self {
        Self {
            http,
            cache: PreparedCache::default(),
            default_timeout,
        }
    }

    pub fn prepared_cache(&self) -> &PreparedCache {
        &self.cache
    }

    fn enhanced_prepared(&self) -> bool {
        self.http
            .cfg_mgr()
            .current()
            .is_some_and(|c| c.has_cluster_capability("n1ql", "enhancedPreparedStatements"))
    }

    /// Runs a statement and streams its `results`.
    pub async fn n1ql_query(&self, opts: QueryOptions) -> CoreResult<RowReader> {
        let deadline = Instant::now() + opts.timeout.unwrap_or(self.default_timeout);
        self.execute(opts.payload.clone(), &opts, deadline).await
    }

    async fn execute(&self, mut payload: Map<String, Value>, opts: &QueryOptions, deadline: Instant) -> CoreResult<RowReader> {
        let statement = payload
            .get("statement")
            .or_else(|| payload.get("prepared"))
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
        let is_prepared = payload.contains_key("prepared");

        let mut req = HttpRequest::new(ServiceType::N1ql, Method::POST, QUERY_PATH)
            .with_deadline(deadline)
            .with_idempotent(opts.read_only)
            .with_unique_id(context_id.clone());
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
            let (kind, reason) = classify_query_error(status, &errors);

            let mut err = ServiceError::new(kind, ServiceType::N1ql);
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
                // A stale prepared name is handled by re-preparing, not resending.
                Some(RetryReason::QueryPreparedStatementFailure) if is_prepared => return Err(err),
                Some(reason) => self.http.wait_for_retry(&req, reason, deadline, err).await?,
                None => return Err(err),
            }
        }
    }

    /// Runs a statement through the prepared-statement cache.
    pub async fn prepared_n1ql_query(&self, opts: QueryOptions) -> CoreResult<RowReader> {
        let statement = opts
            .statement()
            .ok_or_else(|| CoreError::invalid_argument("prepared query needs a statement"))?
            .to_string();
        let deadline = Instant::now() + opts.timeout.unwrap_or(self.default_timeout);
        let enhanced = self.enhanced_prepared();

        if let Some(entry) = self.cache.get(&statement) {
            match self.execute(Self::prepared_payload(&opts, &entry, enhanced), &opts, deadline).await {
                Err(e) if is_stale_prepared(&e) => {
                    debug!(name = %entry.name, "Prepared statement is stale, preparing again");
                    self.cache.remove(&statement);
                }
                other => return other,
            }
        }

        if enhanced {
            self.prepare_and_execute(&statement, &opts, deadline).await
        } else {
            self.prepare_legacy(&statement, &opts, deadline).await
        }
    }

    fn prepared_payload(opts: &QueryOptions, entry: &PreparedEntry, enhanced: bool) -> Map<String, Value> {
        let mut payload = opts.payload.clone();
        payload.remove("statement");
        payload.insert("prepared".into(), Value::String(entry.name.clone()));
        if !enhanced && let Some(plan) = &entry.encoded_plan {
            payload.insert("encoded_plan".into(), Value::String(plan.clone()));
        }
        payload
    }

    /// Prepares and executes in one round trip; the name arrives in the
    /// metadata ahead of the results.
    async fn prepare_and_execute(&self, statement: &str, opts: &QueryOptions, deadline: Instant) -> CoreResult<RowReader> {
        let mut payload = opts.payload.clone();
        payload.insert("statement".into(), Value::String(format!("PREPARE {statement}")));
        payload.insert("auto_execute".into(), Value::Bool(true));

        let mut rows = self.execute(payload, opts, deadline).await?;
        let name = rows
            .early_metadata()
            .await?
            .get("prepared")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| CoreError::protocol("query response carries no prepared name"))?;
        self.cache.insert(
            statement,
            PreparedEntry {
                name,
                encoded_plan: None,
            },
        );
        Ok(rows)
    }

    async fn prepare_legacy(&self, statement: &str, opts: &QueryOptions, deadline: Instant) -> CoreResult<RowReader> {
        let mut payload = opts.payload.clone();
        payload.insert("statement".into(), Value::String(format!("PREPARE {statement}")));
        let prepare_opts = QueryOptions {
            read_only: true,
            ..opts.clone()
        };
        let (rows, _) = self.execute(payload, &prepare_opts, deadline).await?.collect().await?;
        let first = rows
            .first()
            .ok_or_else(|| CoreError::protocol("PREPARE returned no rows"))?;
        let prepared: PrepareRow =
            serde_json::from_slice(first).map_err(|e| CoreError::protocol(format!("invalid PREPARE row: {e}")))?;
        let entry = PreparedEntry {
            name: prepared.name,
            encoded_plan: prepared.encoded_plan,
        };
        self.cache.insert(statement, entry.clone());
        self.execute(Self::prepared_payload(opts, &entry, false), opts, deadline).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(code: u32, message: &str) -> ServiceErrorDesc {
        ServiceErrorDesc {
            code,
            message: message.into(),
            retry: false,
        }
    }

    #[test]
    fn test_classify_codes() {
        let cases = [
            (3000, "syntax error", ErrorKind::ParsingFailure, None),
            (4050, "", ErrorKind::PreparedStatementFailure, Some(RetryReason::QueryPreparedStatementFailure)),
            (4090, "", ErrorKind::PreparedStatementFailure, None),
            (4300, "", ErrorKind::IndexExists, None),
            (4100, "no index", ErrorKind::PlanningFailure, None),
            (12004, "", ErrorKind::IndexNotFound, None),
            (12003, "", ErrorKind::IndexFailure, None),
            (13014, "", ErrorKind::AuthenticationFailure, None),
            (12009, "DML Error: CAS mismatch", ErrorKind::CasMismatch, None),
        ];
        for (code, msg, kind, reason) in cases {
            assert_eq!(classify_query_error(500, &[desc(code, msg)]), (kind, reason), "code {code}");
        }
    }

    #[test]
    fn test_classify_index_not_found_retries() {
        let errors = [desc(5000, "Error: queryport.indexNotFound")];
        assert_eq!(
            classify_query_error(500, &errors),
            (ErrorKind::IndexFailure, Some(RetryReason::QueryIndexNotFound))
        );
    }

    #[test]
    fn test_classify_retry_flag_and_status_fallback() {
        let mut retryable = desc(1080, "timeout");
        retryable.retry = true;
        assert_eq!(
            classify_query_error(503, &[retryable]),
            (ErrorKind::InternalServerFailure, Some(RetryReason::QueryErrorRetryable))
        );
        assert_eq!(classify_query_error(401, &[]), (ErrorKind::AuthenticationFailure, None));
    }

    #[test]
    fn test_stale_prepared_detection() {
        let mut err = ServiceError::new(ErrorKind::PreparedStatementFailure, ServiceType::N1ql);
        err.errors = vec![desc(4040, "no such prepared statement")];
        assert!(is_stale_prepared(&err.clone().into()));
        err.errors = vec![desc(4090, "")];
        assert!(!is_stale_prepared(&err.into()));
        assert!(!is_stale_prepared(&CoreError::new(ErrorKind::Http)));
    }

    #[test]
    fn test_prepared_payload() {
        let opts = QueryOptions::new("SELECT 1").with_param("args", serde_json::json!([1]));
        let entry = PreparedEntry {
            name: "p1".into(),
            encoded_plan: Some("plan".into()),
        };
        let legacy = QueryComponent::prepared_payload(&opts, &entry, false);
        assert!(!legacy.contains_key("statement"));
        assert_eq!(legacy["prepared"], "p1");
        assert_eq!(legacy["encoded_plan"], "plan");
        let enhanced = QueryComponent::prepared_payload(&opts, &entry, true);
        assert!(!enhanced.contains_key("encoded_plan"));
        assert_eq!(enhanced["args"][0], 1);
    }

    #[test]
    fn test_cache_operations() {
        let cache = PreparedCache::default();
        assert!(cache.is_empty());
        let entry = PreparedEntry {
            name: "n".into(),
            encoded_plan: None,
        };
        cache.insert("SELECT 1", entry.clone());
        assert_eq!(cache.get("SELECT 1"), Some(entry));
        assert_eq!(cache.len(), 1);
        assert!(cache.remove("SELECT 1").is_some());
        assert!(cache.get("SELECT 1").is_none());
    }
}
