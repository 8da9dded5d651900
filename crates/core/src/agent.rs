//! The top-level client handle.
//!
//! An [`Agent`] wires one config manager, one KV mux, the collections
//! component, the HTTP services and the config pollers together for a
//! single bucket (or none). Build it once and share it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use cbcore_config::{AgentConfig, BootstrapOn};
use cbcore_errors::{CoreError, CoreResult, ServiceType};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::collections::CollectionsComponent;
use crate::error_map::ErrorMapComponent;
use crate::http::{
    AnalyticsComponent, HttpComponent, QueryComponent, SearchComponent, ViewsComponent, build_http_client,
};
use crate::kv::bootstrap::{BootstrapProps, DcpBootstrap, HelloProps};
use crate::kv::client::MemdClientProps;
use crate::kv::dialer::{Dialer, DialerProps};
use crate::kv::mux::{KvMux, KvMuxProps, cluster_map_notification_handler};
use crate::kv::transport::connector_for;
use crate::ops::{KvOps, OpOptions, PingResult};
use crate::poller::http::{HttpPollerSettings, endpoint_url};
use crate::poller::{CccpPoller, ConfigPoller, HttpPoller, PollerController};
use crate::retry::{BestEffortRetryStrategy, RetryStrategy};
use crate::routing::{ConfigManager, RouteConfigWatcher};
use crate::zombie_logger::ZombieLogger;

const HTTP_SERVICES: [ServiceType; 4] = [ServiceType::N1ql, ServiceType::Fts, ServiceType::Cbas, ServiceType::Capi];

/// Which services a ping probes and how long it may take.
#[derive(Debug, Clone)]
pub struct PingOptions {
    pub services: Vec<ServiceType>,
    pub timeout: Option<Duration>,
    pub report_id: Option<String>,
}

impl Default for PingOptions {
    fn default() -> Self {
        let mut services = vec![ServiceType::Memd];
        services.extend(HTTP_SERVICES);
        Self {
            services,
            timeout: None,
            report_id: None,
        }
    }
}

impl PingOptions {
    pub fn with_services(mut self, services: Vec<ServiceType>) -> Self {
        self.services = services;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Short random identifier stamped into connection ids.
fn new_client_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

pub struct Agent {
    client_id: String,
    bucket: Option<String>,
    cfg_mgr: Arc<ConfigManager>,
    error_map: Arc<ErrorMapComponent>,
    mux: Arc<KvMux>,
    collections: Arc<CollectionsComponent>,
    kv: KvOps,
    http: Arc<HttpComponent>,
    query: QueryComponent,
    analytics: AnalyticsComponent,
    search: SearchComponent,
    views: ViewsComponent,
    pollers: Arc<PollerController>,
    zombie_logger: Option<Arc<ZombieLogger>>,
    kv_timeout: Duration,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Agent {
    /// Builds the agent and starts connecting. Must be called from within a
    /// tokio runtime.
    pub fn new(config: AgentConfig) -> CoreResult<Self> {
        Self::build(config, None)
    }

    pub(crate) fn build(config: AgentConfig, dcp: Option<DcpBootstrap>) -> CoreResult<Self> {
        if config.seed.memd_addrs.is_empty() && config.seed.http_addrs.is_empty() {
            return Err(CoreError::invalid_argument("at least one seed address is required"));
        }
        let client_id = new_client_id();
        let use_tls = config.security.use_tls;
        let bucket = config.bucket_name.clone().filter(|b| !b.is_empty());
        let connector = connector_for(use_tls, config.security.ca_cert_path.as_deref())?;
        let http_client = build_http_client(&config.http, &config.security)?;
        info!(
            client_id = %client_id,
            bucket = bucket.as_deref().unwrap_or(""),
            tls = use_tls,
            "Creating agent"
        );

        let mut seeds = config.seed.memd_addrs.clone();
        seeds.extend(config.seed.http_addrs.iter().cloned());
        let cfg_mgr = Arc::new(ConfigManager::new(seeds, use_tls, config.io.network_type.clone()));
        let error_map = Arc::new(ErrorMapComponent::new());
        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();

        let zombie_logger = config.orphan_reporter.enabled.then(|| {
            Arc::new(ZombieLogger::new(
                config.orphan_reporter.interval,
                config.orphan_reporter.sample_size,
            ))
        });
        if let Some(logger) = &zombie_logger {
            tasks.push(tokio::spawn(logger.clone().run(shutdown.child_token())));
        }

        let mut client = MemdClientProps::new(client_id.clone());
        client.compression_min_size = config.compression.min_size;
        client.compression_min_ratio = config.compression.min_ratio;
        client.disable_decompression = config.compression.disable_decompression;
        client.breaker = config.circuit_breaker.clone();
        client.server_request = Some(cluster_map_notification_handler(Arc::downgrade(&cfg_mgr)));
        client.zombie_logger = zombie_logger.clone();

        let mut hello = HelloProps::from_config(&config);
        let mut pool_size = config.kv.pool_size;
        if let Some(dcp) = &dcp {
            hello.collections = dcp.config.use_collections;
            client.dcp_queue_size = dcp.config.queue_size;
            pool_size = 1;
        }

        let dialer = Arc::new(Dialer::new(
            connector,
            DialerProps {
                connect_timeout: config.kv.connect_timeout,
                server_wait_timeout: config.kv.server_wait_timeout,
                client,
                bootstrap: BootstrapProps {
                    bucket: bucket.clone(),
                    user_agent: config.user_agent.clone(),
                    credentials: config.security.credentials.clone(),
                    auth_mechanisms: config.effective_auth_mechanisms(),
                    error_map: error_map.clone(),
                    hello: hello.clone(),
                    dcp,
                },
            },
        ));

        let mux = KvMux::new(
            KvMuxProps {
                bucket: bucket.clone(),
                collections_enabled: hello.collections,
                queue_size: config.kv.max_queue_size,
                pool_size,
            },
            config.seed.memd_addrs.clone(),
            cfg_mgr.clone(),
            error_map.clone(),
            dialer,
        );
        let watcher: Arc<dyn RouteConfigWatcher> = mux.clone();
        cfg_mgr.add_watcher(watcher);

        let default_retry: Arc<dyn RetryStrategy> = Arc::new(BestEffortRetryStrategy::default());
        let collections = CollectionsComponent::new(mux.clone());
        let kv = KvOps::new(
            mux.clone(),
            collections.clone(),
            config.timeouts.kv,
            config.timeouts.kv_durable,
            default_retry.clone(),
            config.io.use_mutation_tokens,
        );

        let seed_mgmt: Vec<String> = config
            .seed
            .http_addrs
            .iter()
            .map(|addr| endpoint_url(addr, use_tls))
            .collect();
        let http = Arc::new(HttpComponent::new(
            http_client.clone(),
            cfg_mgr.clone(),
            seed_mgmt.clone(),
            config.security.credentials.clone(),
            config.user_agent.clone(),
            config.timeouts.management,
            default_retry,
        ));
        let query = QueryComponent::new(http.clone(), config.timeouts.query);
        let analytics = AnalyticsComponent::new(http.clone(), config.timeouts.analytics);
        let search = SearchComponent::new(http.clone(), config.timeouts.search);
        let views = ViewsComponent::new(http.clone(), bucket.clone().unwrap_or_default(), config.timeouts.view);

        let polling = &config.config_poller;
        let cccp = (polling.bootstrap_on != BootstrapOn::Http).then(|| {
            Arc::new(CccpPoller::new(
                mux.clone(),
                cfg_mgr.clone(),
                polling.cccp_poll_period,
                polling.cccp_max_wait,
            )) as Arc<dyn ConfigPoller>
        });
        let http_poller = (polling.bootstrap_on != BootstrapOn::Cccp).then(|| {
            Arc::new(HttpPoller::new(
                cfg_mgr.clone(),
                http_client,
                seed_mgmt,
                HttpPollerSettings {
                    bucket: bucket.clone(),
                    credentials: config.security.credentials.clone(),
                    redial_period: polling.http_redial_period,
                    retry_delay: polling.http_retry_delay,
                    max_wait: polling.http_max_wait,
                },
            )) as Arc<dyn ConfigPoller>
        });
        let pollers = Arc::new(PollerController::new(polling.bootstrap_on, cccp, http_poller));
        tasks.push(pollers.clone().start(shutdown.child_token()));

        Ok(Self {
            client_id,
            bucket,
            cfg_mgr,
            error_map,
            mux,
            collections,
            kv,
            http,
            query,
            analytics,
            search,
            views,
            pollers,
            zombie_logger,
            kv_timeout: config.timeouts.kv,
            shutdown,
            tasks: Mutex::new(tasks),
            closed: AtomicBool::new(false),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn bucket_name(&self) -> Option<&str> {
        self.bucket.as_deref()
    }

    pub fn config_manager(&self) -> &Arc<ConfigManager> {
        &self.cfg_mgr
    }

    pub fn error_map(&self) -> &Arc<ErrorMapComponent> {
        &self.error_map
    }

    pub fn mux(&self) -> &Arc<KvMux> {
        &self.mux
    }

    pub fn collections(&self) -> &Arc<CollectionsComponent> {
        &self.collections
    }

    /// Key/value, sub-document, observe, stats and stream operations.
    pub fn kv(&self) -> &KvOps {
        &self.kv
    }

    pub fn http(&self) -> &Arc<HttpComponent> {
        &self.http
    }

    pub fn query(&self) -> &QueryComponent {
        &self.query
    }

    pub fn analytics(&self) -> &AnalyticsComponent {
        &self.analytics
    }

    pub fn search(&self) -> &SearchComponent {
        &self.search
    }

    pub fn views(&self) -> &ViewsComponent {
        &self.views
    }

    pub fn pollers(&self) -> &Arc<PollerController> {
        &self.pollers
    }

    pub fn zombie_logger(&self) -> Option<&Arc<ZombieLogger>> {
        self.zombie_logger.as_ref()
    }

    /// Revision of the config the agent is routing on, -1 before the first.
    pub fn config_rev(&self) -> i64 {
        self.mux.config_rev()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once the first cluster config has been applied.
    pub async fn wait_until_ready(&self, timeout: Duration) -> CoreResult<()> {
        if self.is_closed() {
            return Err(CoreError::shutdown());
        }
        let state = self.mux.wait_for_config(Instant::now() + timeout).await?;
        debug!(rev = state.rev_id(), "Agent ready");
        Ok(())
    }

    /// Probes the requested services once each and reports per endpoint.
    pub async fn ping(&self, opts: PingOptions) -> CoreResult<PingResult> {
        if self.is_closed() {
            return Err(CoreError::shutdown());
        }
        let timeout = opts.timeout.unwrap_or(self.kv_timeout);
        let http_services: Vec<ServiceType> = opts
            .services
            .iter()
            .copied()
            .filter(|s| HTTP_SERVICES.contains(s))
            .collect();

        let mut services = HashMap::new();
        if opts.services.contains(&ServiceType::Memd) && self.bucket.is_some() {
            let kv = self.kv.ping_kv(&OpOptions::new().with_timeout(timeout)).await?;
            services.insert(ServiceType::Memd, kv);
        }
        if !http_services.is_empty() {
            services.extend(self.http.ping(&http_services, timeout).await);
        }

        Ok(PingResult {
            id: opts.report_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            config_rev: self.cfg_mgr.current_rev(),
            services,
        })
    }

    /// Stops polling, closes every connection and fails whatever is still
    /// queued. A second call returns `Shutdown`.
    pub async fn close(&self) -> CoreResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(CoreError::shutdown());
        }
        info!(client_id = %self.client_id, "Closing agent");
        self.shutdown.cancel();
        self.http.close();
        self.mux.close().await;

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Agent background task ended abnormally");
            }
        }
        Ok(())
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use cbcore_errors::ErrorKind;

    use super::*;
    use crate::poller::ActivePoller;

    fn config() -> AgentConfig {
        AgentConfig::new()
            .with_bucket("default")
            .with_memd_addrs(vec!["127.0.0.1:1".into()])
            .with_http_addrs(vec!["127.0.0.1:2".into()])
    }

    #[test]
    fn test_client_id_shape() {
        let id = new_client_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, new_client_id());
    }

    #[test]
    fn test_requires_seeds() {
        let err = Agent::new(AgentConfig::new()).err().unwrap();
        assert!(err.is(ErrorKind::InvalidArgument));
    }

    #[tokio::test]
    async fn test_tls_without_ca_is_rejected() {
        let err = Agent::new(config().with_tls(None)).err().unwrap();
        assert!(err.is(ErrorKind::InvalidArgument));
    }

    #[tokio::test]
    async fn test_not_ready_without_cluster() {
        let agent = Agent::new(config()).unwrap();
        assert_eq!(agent.bucket_name(), Some("default"));
        assert_eq!(agent.config_rev(), -1);
        let err = agent.wait_until_ready(Duration::from_millis(20)).await.unwrap_err();
        assert!(err.is(ErrorKind::UnambiguousTimeout));
        agent.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_twice() {
        let agent = Agent::new(config().with_bootstrap_on(BootstrapOn::Http)).unwrap();
        tokio::task::yield_now().await;
        assert_ne!(agent.pollers().active(), ActivePoller::Cccp);
        agent.close().await.unwrap();
        assert!(agent.is_closed());
        assert!(agent.close().await.unwrap_err().is(ErrorKind::Shutdown));
        assert!(agent.ping(PingOptions::default()).await.unwrap_err().is(ErrorKind::Shutdown));
    }
}
