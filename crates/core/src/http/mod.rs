//! HTTP services: the shared request dispatcher, the streaming row reader
//! and the per-service adapters layered on top.

pub mod analytics;
pub mod query;
pub mod rows;
pub mod search;
pub mod views;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use cbcore_config::{Credentials, HttpConfig, SecurityConfig};
use cbcore_errors::{
    CoreError, CoreResult, ErrorKind, RetryReason, ServiceError, ServiceErrorDesc, ServiceType, TimeoutError,
};
use futures::future::join_all;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use parking_lot::Mutex;
use rand::Rng;
use reqwest::Method;
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use secrecy::ExposeSecret;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::ops::EndpointPingResult;
use crate::retry::{FailFastRetryStrategy, RetryRequest, RetryState, RetryStrategy, maybe_retry};
use crate::routing::config_manager::ConfigManager;

pub use analytics::{AnalyticsComponent, AnalyticsOptions};
pub use query::{PreparedCache, PreparedEntry, QueryComponent, QueryOptions};
pub use rows::RowReader;
pub use search::{SearchComponent, SearchOptions};
pub use views::{DesignDocumentNamespace, ViewOptions, ViewsComponent};

/// Header carrying the caller-chosen request identifier.
pub const UNIQUE_ID_HEADER: &str = "X-Request-ID";

const JSON_CONTENT_TYPE: &str = "application/json";

/// Builds the shared connection pool used by every HTTP caller.
pub fn build_http_client(http: &HttpConfig, security: &SecurityConfig) -> CoreResult<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(http.max_idle_conns_per_host)
        .pool_idle_timeout(http.idle_conn_timeout)
        .connect_timeout(http.connect_timeout);

    if security.use_tls
        && let Some(path) = &security.ca_cert_path
    {
        let pem = std::fs::read(path)
            .map_err(|e| CoreError::invalid_argument(format!("cannot read CA certificate {}: {e}", path.display())))?;
        let cert = reqwest::Certificate::from_pem(&pem)
            .map_err(|e| CoreError::invalid_argument(format!("invalid CA certificate: {e}")))?;
        builder = builder.add_root_certificate(cert);
    }

    builder
        .build()
        .map_err(|e| CoreError::message(ErrorKind::InvalidArgument, format!("cannot build http client: {e}")))
}

/// One HTTP service call.
#[derive(Debug)]
pub struct HttpRequest {
    pub service: ServiceType,
    pub method: Method,
    pub path: String,
    pub body: Option<Bytes>,
    pub content_type: String,
    pub headers: Vec<(String, String)>,
    /// Sends to this endpoint instead of picking one from the config.
    pub endpoint: Option<String>,
    pub deadline: Option<Instant>,
    pub idempotent: bool,
    pub retry_strategy: Option<Arc<dyn RetryStrategy>>,
    pub unique_id: String,
    created_at: Instant,
    retry: Mutex<RetryState>,
}

impl HttpRequest {
    pub fn new(service: ServiceType, method: Method, path: impl Into<String>) -> Self {
        Self {
            service,
            method,
            path: path.into(),
            body: None,
            content_type: JSON_CONTENT_TYPE.to_string(),
            headers: Vec::new(),
            endpoint: None,
            deadline: None,
            idempotent: false,
            retry_strategy: None,
            unique_id: Uuid::new_v4().to_string(),
            created_at: Instant::now(),
            retry: Mutex::new(RetryState::default()),
        }
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    pub fn with_retry_strategy(mut self, strategy: Arc<dyn RetryStrategy>) -> Self {
        self.retry_strategy = Some(strategy);
        self
    }

    pub fn with_unique_id(mut self, id: impl Into<String>) -> Self {
        self.unique_id = id.into();
        self
    }

    pub(crate) fn timeout_error(&self, endpoint: &str) -> CoreError {
        let retry = self.retry.lock();
        TimeoutError {
            operation: self.service.as_str().to_string(),
            operation_id: self.unique_id.clone(),
            time_observed_us: self.created_at.elapsed().as_micros() as u64,
            retry_reasons: retry.reasons.clone(),
            retry_attempts: retry.attempts,
            last_dispatched_to: endpoint.to_string(),
            ..TimeoutError::new(!self.idempotent)
        }
        .into()
    }

    /// Attaches this request's retry history to a service error.
    pub(crate) fn decorate(&self, mut err: ServiceError) -> CoreError {
        let retry = self.retry.lock();
        err.retry_reasons = retry.reasons.clone();
        err.retry_attempts = retry.attempts;
        err.into()
    }
}

impl RetryRequest for HttpRequest {
    fn retry_attempts(&self) -> u32 {
        self.retry.lock().attempts
    }

    fn identifier(&self) -> String {
        self.unique_id.clone()
    }

    fn idempotent(&self) -> bool {
        self.idempotent
    }

    fn retry_reasons(&self) -> Vec<RetryReason> {
        self.retry.lock().reasons.clone()
    }

    fn retry_strategy(&self) -> Option<Arc<dyn RetryStrategy>> {
        self.retry_strategy.clone()
    }

    fn record_retry_attempt(&self, reason: RetryReason) {
        self.retry.lock().record(reason);
    }
}

/// Falls back to the component's strategy for requests that carry none.
struct DefaultedRetry<'a> {
    req: &'a HttpRequest,
    fallback: &'a Arc<dyn RetryStrategy>,
}

impl RetryRequest for DefaultedRetry<'_> {
    fn retry_attempts(&self) -> u32 {
        self.req.retry_attempts()
    }

    fn identifier(&self) -> String {
        self.req.identifier()
    }

    fn idempotent(&self) -> bool {
        self.req.idempotent
    }

    fn retry_reasons(&self) -> Vec<RetryReason> {
        self.req.retry_reasons()
    }

    fn retry_strategy(&self) -> Option<Arc<dyn RetryStrategy>> {
        Some(self.req.retry_strategy.clone().unwrap_or_else(|| self.fallback.clone()))
    }

    fn record_retry_attempt(&self, reason: RetryReason) {
        self.req.record_retry_attempt(reason);
    }
}

/// A response whose body has not been read yet.
pub struct HttpResponse {
    pub endpoint: String,
    pub status: u16,
    pub body: BoxStream<'static, CoreResult<Bytes>>,
}

impl HttpResponse {
    fn from_reqwest(endpoint: String, resp: reqwest::Response, service: ServiceType) -> Self {
        let status = resp.status().as_u16();
        let ep = endpoint.clone();
        let body = resp
            .bytes_stream()
            .map_err(move |e| {
                let mut err = ServiceError::new(ErrorKind::Http, service);
                err.endpoint = ep.clone();
                err.error_text = e.to_string();
                CoreError::from(err)
            })
            .boxed();
        Self { endpoint, status, body }
    }

    /// Reads the whole body.
    pub async fn into_bytes(mut self) -> CoreResult<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }

    pub fn into_rows(self, rows_key: &'static str) -> RowReader {
        RowReader::new(self.body, rows_key, self.endpoint)
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEntry {
    #[serde(default)]
    code: u32,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    retriable: bool,
    #[serde(default)]
    retry: bool,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<ErrorEntry>,
}

/// Reads the `errors` array query and analytics put in failed responses.
pub(crate) fn parse_error_descs(body: &[u8]) -> Vec<ServiceErrorDesc> {
    serde_json::from_slice::<ErrorBody>(body)
        .map(|b| {
            b.errors
                .into_iter()
                .map(|e| ServiceErrorDesc {
                    code: e.code,
                    message: e.msg,
                    retry: e.retry || e.retriable,
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Classification from the HTTP status alone.
pub(crate) fn status_kind(status: u16) -> ErrorKind {
    match status {
        401 => ErrorKind::AuthenticationFailure,
        403 => ErrorKind::AccessDenied,
        429 => ErrorKind::TooManyRequests,
        500..=599 => ErrorKind::InternalServerFailure,
        _ => ErrorKind::Http,
    }
}

fn probe_path(service: ServiceType) -> Option<&'static str> {
    match service {
        ServiceType::N1ql | ServiceType::Cbas => Some("/admin/ping"),
        ServiceType::Fts => Some("/api/ping"),
        ServiceType::Capi => Some("/"),
        ServiceType::Memd | ServiceType::Mgmt => None,
    }
}

pub struct HttpComponent {
    client: reqwest::Client,
    cfg_mgr: Arc<ConfigManager>,
    seed_mgmt: Vec<String>,
    credentials: Option<Credentials>,
    user_agent: String,
    default_timeout: Duration,
    default_retry: Arc<dyn RetryStrategy>,
    shutdown: CancellationToken,
}

impl HttpComponent {
    pub fn new(
        client: reqwest::Client,
        cfg_mgr: Arc<ConfigManager>,
        seed_mgmt: Vec<String>,
        credentials: Option<Credentials>,
        user_agent: impl Into<String>,
        default_timeout: Duration,
        default_retry: Arc<dyn RetryStrategy>,
    ) -> Self {
        Self {
            client,
            cfg_mgr,
            seed_mgmt,
            credentials,
            user_agent: user_agent.into(),
            default_timeout,
            default_retry,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub(crate) fn cfg_mgr(&self) -> &Arc<ConfigManager> {
        &self.cfg_mgr
    }

    pub(crate) fn default_retry(&self) -> Arc<dyn RetryStrategy> {
        self.default_retry.clone()
    }

    /// Fails every request still waiting to retry, and every new one.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Endpoints currently serving `service`.
    pub fn endpoints(&self, service: ServiceType) -> Vec<String> {
        let Some(cfg) = self.cfg_mgr.current() else {
            return match service {
                ServiceType::Mgmt => self.seed_mgmt.clone(),
                _ => Vec::new(),
            };
        };
        match service {
            ServiceType::Mgmt => cfg.mgmt_ep_list.clone(),
            ServiceType::Capi => cfg.capi_ep_list.clone(),
            ServiceType::N1ql => cfg.n1ql_ep_list.clone(),
            ServiceType::Fts => cfg.fts_ep_list.clone(),
            ServiceType::Cbas => cfg.cbas_ep_list.clone(),
            ServiceType::Memd => Vec::new(),
        }
    }

    fn random_endpoint(&self, service: ServiceType) -> Option<String> {
        let endpoints = self.endpoints(service);
        if endpoints.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..endpoints.len());
        endpoints.into_iter().nth(idx)
    }

    /// Backs off for `reason` if the request's strategy allows it and the
    /// deadline leaves room; otherwise returns `err`.
    pub(crate) async fn wait_for_retry(
        &self,
        req: &HttpRequest,
        reason: RetryReason,
        deadline: Instant,
        err: CoreError,
    ) -> CoreResult<()> {
        let view = DefaultedRetry {
            req,
            fallback: &self.default_retry,
        };
        let Some(at) = maybe_retry(&view, reason) else {
            return Err(err);
        };
        if at >= deadline {
            return Err(req.timeout_error(req.endpoint.as_deref().unwrap_or_default()));
        }
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(CoreError::shutdown()),
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(at)) => Ok(()),
        }
    }

    /// Sends `req`, retrying while no endpoint is available or the
    /// connection cannot be made. Any HTTP status is returned as a
    /// response; classifying it is the caller's job.
    pub async fn do_http_request(&self, req: &HttpRequest) -> CoreResult<HttpResponse> {
        let deadline = req.deadline.unwrap_or_else(|| Instant::now() + self.default_timeout);
        loop {
            if self.shutdown.is_cancelled() {
                return Err(CoreError::shutdown());
            }
            let endpoint = match req.endpoint.clone().or_else(|| self.random_endpoint(req.service)) {
                Some(ep) => ep,
                None => {
                    let err = req.decorate(ServiceError::new(ErrorKind::ServiceNotAvailable, req.service));
                    self.wait_for_retry(req, RetryReason::ServiceNotAvailable, deadline, err).await?;
                    continue;
                }
            };

            let url = format!("{endpoint}{}", req.path);
            let mut builder = self
                .client
                .request(req.method.clone(), &url)
                .header(USER_AGENT, &self.user_agent)
                .header(UNIQUE_ID_HEADER, &req.unique_id);
            if let Some(creds) = &self.credentials {
                builder = builder.basic_auth(&creds.username, Some(creds.password.expose_secret()));
            }
            if let Some(body) = &req.body {
                builder = builder.header(CONTENT_TYPE, &req.content_type).body(body.clone());
            }
            for (name, value) in &req.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }

            let sent_at = Instant::now();
            let sent = tokio::select! {
                _ = self.shutdown.cancelled() => return Err(CoreError::shutdown()),
                sent = tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), builder.send()) => sent,
            };
            match sent {
                Err(_) => return Err(req.timeout_error(&endpoint)),
                Ok(Ok(resp)) => {
                    let status = resp.status().as_u16();
                    cbcore_telemetry::record_http_request(
                        req.service.as_str(),
                        status,
                        sent_at.elapsed().as_secs_f64() * 1000.0,
                    );
                    return Ok(HttpResponse::from_reqwest(endpoint, resp, req.service));
                }
                Ok(Err(e)) if e.is_connect() => {
                    debug!(endpoint = %endpoint, error = %e, "HTTP connect failed");
                    let mut err = ServiceError::new(ErrorKind::ServiceNotAvailable, req.service);
                    err.endpoint = endpoint;
                    err.error_text = e.to_string();
                    let err = req.decorate(err);
                    self.wait_for_retry(req, RetryReason::SocketNotAvailable, deadline, err).await?;
                }
                Ok(Err(e)) => {
                    let mut err = ServiceError::new(ErrorKind::Http, req.service);
                    err.endpoint = endpoint;
                    err.error_text = e.to_string();
                    return Err(req.decorate(err));
                }
            }
        }
    }

    /// Probes every endpoint of the given HTTP services.
    pub async fn ping(
        &self,
        services: &[ServiceType],
        timeout: Duration,
    ) -> HashMap<ServiceType, Vec<EndpointPingResult>> {
        let deadline = Instant::now() + timeout;
        let mut probes = Vec::new();
        for &service in services {
            let Some(path) = probe_path(service) else {
                continue;
            };
            for endpoint in self.endpoints(service) {
                let req = HttpRequest::new(service, Method::GET, path)
                    .with_endpoint(endpoint.clone())
                    .with_deadline(deadline)
                    .with_idempotent(true)
                    .with_retry_strategy(Arc::new(FailFastRetryStrategy));
                probes.push(async move {
                    let started = Instant::now();
                    let outcome = match self.do_http_request(&req).await {
                        Ok(resp) if resp.status == 200 => Ok(()),
                        Ok(resp) => {
                            let mut err = ServiceError::new(ErrorKind::Http, service);
                            err.endpoint = resp.endpoint;
                            err.http_status = resp.status;
                            Err(err.into())
                        }
                        Err(e) => Err(e),
                    };
                    (service, EndpointPingResult::from_outcome(endpoint, started, outcome, ""))
                });
            }
        }

        let mut report: HashMap<ServiceType, Vec<EndpointPingResult>> = HashMap::new();
        for (service, result) in join_all(probes).await {
            report.entry(service).or_default().push(result);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use cbcore_config::NetworkType;

    use super::*;
    use crate::routing::cfg_json::ClusterConfigJson;

    const CLUSTER_CONFIG: &str = r#"{
        "rev": 5,
        "nodesExt": [
            {"hostname": "10.0.0.1", "services": {"kv": 11210, "mgmt": 8091, "n1ql": 8093}},
            {"hostname": "10.0.0.2", "services": {"kv": 11210, "mgmt": 8091, "fts": 8094}}
        ]
    }"#;

    fn component() -> HttpComponent {
        let cfg_mgr = Arc::new(ConfigManager::new(vec!["10.0.0.1:11210".into()], false, NetworkType::Default));
        HttpComponent::new(
            reqwest::Client::new(),
            cfg_mgr,
            vec!["http://seed:8091".into()],
            None,
            "cbcore-test",
            Duration::from_secs(1),
            Arc::new(FailFastRetryStrategy),
        )
    }

    #[test]
    fn test_endpoints_follow_config() {
        let http = component();
        assert_eq!(http.endpoints(ServiceType::Mgmt), vec!["http://seed:8091".to_string()]);
        assert!(http.endpoints(ServiceType::N1ql).is_empty());

        let cfg = ClusterConfigJson::parse(CLUSTER_CONFIG.as_bytes(), "10.0.0.1").unwrap();
        assert!(http.cfg_mgr().on_new_config(&cfg));
        assert_eq!(http.endpoints(ServiceType::N1ql), vec!["http://10.0.0.1:8093".to_string()]);
        assert_eq!(http.endpoints(ServiceType::Fts), vec!["http://10.0.0.2:8094".to_string()]);
        assert_eq!(http.endpoints(ServiceType::Mgmt).len(), 2);
        assert!(http.endpoints(ServiceType::Cbas).is_empty());
    }

    #[tokio::test]
    async fn test_missing_service_fails_without_retry() {
        let http = component();
        let req = HttpRequest::new(ServiceType::Cbas, Method::POST, "/analytics/service");
        let err = http.do_http_request(&req).await.err().unwrap();
        assert!(err.is(ErrorKind::ServiceNotAvailable));
        assert_eq!(err.as_service().unwrap().service, Some(ServiceType::Cbas));
    }

    #[tokio::test]
    async fn test_closed_component_rejects_requests() {
        let http = component();
        http.close();
        let req = HttpRequest::new(ServiceType::Mgmt, Method::GET, "/pools");
        assert!(http.do_http_request(&req).await.err().unwrap().is(ErrorKind::Shutdown));
    }

    #[test]
    fn test_error_body_parsing() {
        let body = br#"{"errors":[{"code":4040,"msg":"no such name"},{"code":1,"msg":"x","retriable":true}]}"#;
        let descs = parse_error_descs(body);
        assert_eq!(descs.len(), 2);
        assert_eq!(descs[0].code, 4040);
        assert!(!descs[0].retry);
        assert!(descs[1].retry);
        assert!(parse_error_descs(b"not json").is_empty());
    }

    #[test]
    fn test_status_kind() {
        assert_eq!(status_kind(401), ErrorKind::AuthenticationFailure);
        assert_eq!(status_kind(429), ErrorKind::TooManyRequests);
        assert_eq!(status_kind(503), ErrorKind::InternalServerFailure);
        assert_eq!(status_kind(418), ErrorKind::Http);
    }

    #[test]
    fn test_probe_paths() {
        assert_eq!(probe_path(ServiceType::N1ql), Some("/admin/ping"));
        assert_eq!(probe_path(ServiceType::Fts), Some("/api/ping"));
        assert_eq!(probe_path(ServiceType::Capi), Some("/"));
        assert_eq!(probe_path(ServiceType::Memd), None);
    }
}
