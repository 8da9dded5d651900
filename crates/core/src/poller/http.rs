//! Streaming HTTP config polling.
//!
//! The management service keeps a streaming response open and writes a new
//! config every time the cluster changes, each one terminated by four
//! newlines. The connection is dropped and redialled periodically so a
//! silently stalled stream cannot pin the agent to a stale view.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use cbcore_config::Credentials;
use cbcore_errors::{CoreError, CoreResult, ErrorKind, ServiceError, ServiceType, TimeoutError};
use futures::StreamExt;
use rand::Rng;
use reqwest::StatusCode;
use secrecy::ExposeSecret;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ConfigPoller, PollerExit};
use crate::routing::cfg_json::ClusterConfigJson;
use crate::routing::config_manager::ConfigManager;

const CONFIG_DELIMITER: &[u8] = b"\n\n\n\n";

/// Largest undelimited tail a config stream may leave buffered.
pub const MAX_PENDING_CONFIG_BYTES: usize = 4 * 1024 * 1024;

/// Splits a config stream into individual config documents.
#[derive(Debug)]
pub struct ConfigStreamDecoder {
    buf: BytesMut,
    // Prefix of `buf` already searched for a delimiter.
    scanned: usize,
    max_pending: usize,
}

impl Default for ConfigStreamDecoder {
    fn default() -> Self {
        Self::with_limit(MAX_PENDING_CONFIG_BYTES)
    }
}

impl ConfigStreamDecoder {
    pub fn with_limit(max_pending: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            scanned: 0,
            max_pending,
        }
    }

    /// Feeds a chunk and returns every config it completed.
    pub fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(data);
        let mut configs = Vec::new();
        loop {
            // A delimiter may straddle the previous chunk boundary.
            let from = self.scanned.saturating_sub(CONFIG_DELIMITER.len() - 1);
            let found = self.buf[from..]
                .windows(CONFIG_DELIMITER.len())
                .position(|w| w == CONFIG_DELIMITER);
            let Some(pos) = found else {
                self.scanned = self.buf.len();
                break;
            };
            let frame = self.buf.split_to(from + pos).freeze();
            self.buf.advance(CONFIG_DELIMITER.len());
            self.scanned = 0;
            if !frame.iter().all(u8::is_ascii_whitespace) {
                configs.push(frame);
            }
        }
        configs
    }

    /// Bytes held back waiting for a delimiter.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// True once the undelimited tail has outgrown the limit.
    pub fn is_overflowing(&self) -> bool {
        self.buf.len() > self.max_pending
    }
}

/// Turns a `host:port` seed into a base URL. Full URLs pass through.
pub fn endpoint_url(addr: &str, use_tls: bool) -> String {
    if addr.starts_with("http://") || addr.starts_with("https://") {
        return addr.trim_end_matches('/').to_string();
    }
    let scheme = if use_tls { "https" } else { "http" };
    format!("{scheme}://{addr}")
}

fn endpoint_host(endpoint: &str) -> String {
    url::Url::parse(endpoint)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string()))
        .unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct HttpPollerSettings {
    pub bucket: Option<String>,
    pub credentials: Option<Credentials>,
    pub redial_period: Duration,
    pub retry_delay: Duration,
    pub max_wait: Duration,
}

pub struct HttpPoller {
    cfg_mgr: Arc<ConfigManager>,
    client: reqwest::Client,
    seed_endpoints: Vec<String>,
    settings: HttpPollerSettings,
}

impl HttpPoller {
    pub fn new(
        cfg_mgr: Arc<ConfigManager>,
        client: reqwest::Client,
        seed_endpoints: Vec<String>,
        settings: HttpPollerSettings,
    ) -> Self {
        Self {
            cfg_mgr,
            client,
            seed_endpoints,
            settings,
        }
    }

    /// Management endpoints from the current config, or the seeds before
    /// one has been accepted.
    fn endpoints(&self) -> Vec<String> {
        match self.cfg_mgr.current() {
            Some(cfg) if !cfg.mgmt_ep_list.is_empty() => cfg.mgmt_ep_list.clone(),
            _ => self.seed_endpoints.clone(),
        }
    }

    fn stream_paths(&self) -> Vec<String> {
        match &self.settings.bucket {
            Some(bucket) => {
                let bucket = urlencoding::encode(bucket);
                vec![
                    format!("/pools/default/bs/{bucket}"),
                    format!("/pools/default/bucketsStreaming/{bucket}"),
                ]
            }
            None => vec!["/pools/default/nodeServicesStreaming".to_string()],
        }
    }

    async fn open(&self, url: &str) -> CoreResult<reqwest::Response> {
        let mut req = self.client.get(url);
        if let Some(creds) = &self.settings.credentials {
            req = req.basic_auth(&creds.username, Some(creds.password.expose_secret()));
        }
        tokio::time::timeout(self.settings.max_wait, req.send())
            .await
            .map_err(|_| CoreError::from(TimeoutError::new(false)))?
            .map_err(|e| {
                let mut err = ServiceError::new(ErrorKind::Http, ServiceType::Mgmt);
                err.endpoint = url.to_string();
                err.error_text = e.to_string();
                CoreError::from(err)
            })
    }

    /// Follows one endpoint's stream. Returns whether any config arrived.
    async fn stream_from(&self, endpoint: &str, shutdown: &CancellationToken) -> CoreResult<bool> {
        let host = endpoint_host(endpoint);
        for path in self.stream_paths() {
            let url = format!("{endpoint}{path}");
            let resp = self.open(&url).await?;
            match resp.status() {
                StatusCode::NOT_FOUND => {
                    debug!(url = %url, "Config stream path not found, trying the next one");
                    continue;
                }
                StatusCode::UNAUTHORIZED => {
                    return Err(CoreError::new(ErrorKind::AuthenticationFailure));
                }
                status if !status.is_success() => {
                    let mut err = ServiceError::new(ErrorKind::Http, ServiceType::Mgmt);
                    err.endpoint = url;
                    err.http_status = status.as_u16();
                    return Err(err.into());
                }
                _ => {}
            }
            debug!(url = %url, "Config stream connected");
            return self.consume(resp, &host, shutdown).await;
        }
        Err(CoreError::message(ErrorKind::BucketNotFound, format!("no config stream at {endpoint}")))
    }

    async fn consume(&self, resp: reqwest::Response, host: &str, shutdown: &CancellationToken) -> CoreResult<bool> {
        let redial_at = tokio::time::Instant::now() + self.settings.redial_period;
        let mut stream = resp.bytes_stream();
        let mut decoder = ConfigStreamDecoder::default();
        let mut received = false;
        loop {
            let chunk = tokio::select! {
                _ = shutdown.cancelled() => return Ok(received),
                _ = tokio::time::sleep_until(redial_at) => {
                    debug!("Config stream redial period elapsed");
                    return Ok(received);
                }
                chunk = stream.next() => chunk,
            };
            let bytes = match chunk {
                None => return Ok(received),
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => {
                    let mut err = ServiceError::new(ErrorKind::Http, ServiceType::Mgmt);
                    err.error_text = e.to_string();
                    return Err(err.into());
                }
            };
            for frame in decoder.push(&bytes) {
                match ClusterConfigJson::parse(&frame, host) {
                    Ok(cfg) => {
                        received = true;
                        self.cfg_mgr.on_new_config(&cfg);
                    }
                    Err(e) => warn!(host, error = %e, "Discarding unparsable streamed config"),
                }
            }
            if decoder.is_overflowing() {
                warn!(host, pending = decoder.pending(), "Config stream sent no delimiter, redialing");
                return Err(CoreError::protocol(format!(
                    "config stream buffered {} bytes without a delimiter",
                    decoder.pending()
                )));
            }
        }
    }
}

#[async_trait]
impl ConfigPoller for HttpPoller {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn run(&self, shutdown: &CancellationToken) -> PollerExit {
        info!(bucket = ?self.settings.bucket, "HTTP config poller started");
        while !shutdown.is_cancelled() {
            let endpoints = self.endpoints();
            let mut saw_config = false;
            if !endpoints.is_empty() {
                let offset = rand::thread_rng().gen_range(0..endpoints.len());
                for i in 0..endpoints.len() {
                    if shutdown.is_cancelled() {
                        break;
                    }
                    let endpoint = &endpoints[(offset + i) % endpoints.len()];
                    match self.stream_from(endpoint, shutdown).await {
                        Ok(received) => {
                            saw_config |= received;
                            if received {
                                break;
                            }
                        }
                        Err(e) => debug!(endpoint = %endpoint, error = %e, "Config stream failed"),
                    }
                }
            }
            if !saw_config {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.settings.retry_delay) => {}
                }
            }
        }
        info!("HTTP config poller stopped");
        PollerExit::Stopped
    }
}
