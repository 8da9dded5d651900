//! Routes KV requests to pipelines and reacts to topology changes.
//!
//! The mux owns an immutable [`MuxState`] snapshot (route config plus one
//! pipeline per data node). Readers load the snapshot lock free; config
//! application is serialised by a write lock and swaps the snapshot whole.
//! Until the first real config arrives the snapshot carries revision -1 and
//! every request parks in the dead pipeline.

use std::sync::{Arc, Weak};
use std::time::Instant;

use arc_swap::ArcSwapOption;
use cbcore_errors::{CoreError, CoreResult, ErrorKind, RetryReason};
use cbcore_memd::{CLUSTER_MAP_CHANGE_NOTIFICATION, Opcode};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use super::client::{MemdClient, PostErrorHandler, ServerRequestHandler};
use super::dialer::Dialer;
use super::pipeline::Pipeline;
use super::pipeline_client::{DialFn, GRACEFUL_CLOSE_TIMEOUT, ReconnectFn};
use super::request::{Request, Response};
use crate::error_map::ErrorMapComponent;
use crate::retry::{RetryRequest, controlled_backoff, maybe_retry, maybe_retry_with_floor};
use crate::routing::cfg_json::{ClusterConfigJson, host_from_host_port};
use crate::routing::{BucketType, ConfigManager, RouteConfig, RouteConfigWatcher};

/// Whether the cluster supports a capability. Unknown until the first config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityStatus {
    Unknown,
    Supported,
    Unsupported,
}

impl CapabilityStatus {
    fn from_bucket(cfg: &RouteConfig, cap: &str) -> Self {
        if cfg.rev_id < 0 {
            Self::Unknown
        } else if cfg.has_bucket_capability(cap) {
            Self::Supported
        } else {
            Self::Unsupported
        }
    }
}

/// One routing snapshot. Never mutated once published.
#[derive(Debug)]
pub struct MuxState {
    route_config: Arc<RouteConfig>,
    pipelines: Vec<Arc<Pipeline>>,
    dead_pipe: Arc<Pipeline>,
    pub collections: CapabilityStatus,
    pub durability: CapabilityStatus,
    pub create_as_deleted: CapabilityStatus,
}

impl MuxState {
    pub fn route_config(&self) -> &Arc<RouteConfig> {
        &self.route_config
    }

    pub fn rev_id(&self) -> i64 {
        self.route_config.rev_id
    }

    pub fn bucket_type(&self) -> BucketType {
        self.route_config.bucket_type
    }

    pub fn num_pipelines(&self) -> usize {
        self.pipelines.len()
    }

    /// The pipeline at `index`, or the dead pipeline when out of range.
    pub fn pipeline(&self, index: i32) -> &Arc<Pipeline> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.pipelines.get(i))
            .unwrap_or(&self.dead_pipe)
    }

    pub fn pipelines(&self) -> &[Arc<Pipeline>] {
        &self.pipelines
    }

    pub fn num_replicas(&self) -> usize {
        self.route_config.vb_map.as_ref().map(|m| m.num_replicas()).unwrap_or(0)
    }

    pub fn num_vbuckets(&self) -> usize {
        self.route_config.num_vbuckets().unwrap_or(0)
    }

    pub fn vbucket_by_key(&self, key: &[u8]) -> Option<u16> {
        self.route_config.vb_map.as_ref().map(|m| m.vbucket_by_key(key))
    }
}

#[derive(Debug, Clone)]
pub struct KvMuxProps {
    /// Bucket the connections select, used in error context.
    pub bucket: Option<String>,
    pub collections_enabled: bool,
    pub queue_size: usize,
    pub pool_size: usize,
}

pub struct KvMux {
    me: Weak<KvMux>,
    props: KvMuxProps,
    state: ArcSwapOption<MuxState>,
    write_lock: Mutex<()>,
    cfg_mgr: Arc<ConfigManager>,
    error_map: Arc<ErrorMapComponent>,
    dialer: Arc<Dialer>,
    has_seen_config: CancellationToken,
    shutdown: CancellationToken,
    post_complete: RwLock<Option<PostErrorHandler>>,
    closing: TaskTracker,
}

impl KvMux {
    /// Builds the mux around a bootstrap snapshot that connects to `seeds`
    /// and starts dialing them.
    pub fn new(
        props: KvMuxProps,
        seeds: Vec<String>,
        cfg_mgr: Arc<ConfigManager>,
        error_map: Arc<ErrorMapComponent>,
        dialer: Arc<Dialer>,
    ) -> Arc<Self> {
        let mux = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            props,
            state: ArcSwapOption::empty(),
            write_lock: Mutex::new(()),
            cfg_mgr,
            error_map,
            dialer,
            has_seen_config: CancellationToken::new(),
            shutdown: CancellationToken::new(),
            post_complete: RwLock::new(None),
            closing: TaskTracker::new(),
        });
        let seed_config = RouteConfig {
            rev_id: -1,
            bucket_type: BucketType::Invalid,
            kv_server_list: seeds,
            ..Default::default()
        };
        let state = Arc::new(mux.build_state(Arc::new(seed_config)));
        for pipeline in &state.pipelines {
            pipeline.start_clients();
        }
        mux.state.store(Some(state));
        mux
    }

    /// Installs the handler errors reach after the mux's own retry logic.
    pub fn set_post_complete_error_handler(&self, handler: PostErrorHandler) {
        *self.post_complete.write() = Some(handler);
    }

    pub fn bucket(&self) -> &str {
        self.props.bucket.as_deref().unwrap_or_default()
    }

    pub fn collections_enabled(&self) -> bool {
        self.props.collections_enabled
    }

    /// The current snapshot, or `Shutdown` once closed.
    pub fn state(&self) -> CoreResult<Arc<MuxState>> {
        self.state.load_full().ok_or_else(CoreError::shutdown)
    }

    pub fn config_rev(&self) -> i64 {
        self.state.load().as_ref().map(|s| s.rev_id()).unwrap_or(-1)
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// True once the cluster is known to support collections.
    pub fn supports_collections(&self) -> bool {
        self.state
            .load()
            .as_ref()
            .is_some_and(|s| s.collections == CapabilityStatus::Supported)
    }

    /// Resolves with the first real snapshot, or fails at `deadline`.
    pub async fn wait_for_config(&self, deadline: Instant) -> CoreResult<Arc<MuxState>> {
        tokio::select! {
            _ = self.has_seen_config.cancelled() => self.state(),
            _ = self.shutdown.cancelled() => Err(CoreError::shutdown()),
            _ = tokio::time::sleep_until(deadline.into()) => {
                Err(CoreError::message(ErrorKind::UnambiguousTimeout, "timed out waiting for a cluster config"))
            }
        }
    }

    /// The memd client with connection id `conn_id`, if any pipeline holds it.
    pub fn client_by_conn_id(&self, conn_id: &str) -> Option<Arc<MemdClient>> {
        let state = self.state.load_full()?;
        state
            .pipelines
            .iter()
            .flat_map(|p| p.memd_clients())
            .find(|c| c.conn_id() == conn_id)
    }

    fn build_state(&self, cfg: Arc<RouteConfig>) -> MuxState {
        let pool_size = if cfg.rev_id >= 0 && cfg.is_gcccp_config() {
            1
        } else {
            self.props.pool_size
        };
        let pipelines = cfg
            .kv_server_list
            .iter()
            .map(|addr| {
                Arc::new(
                    Pipeline::new(addr.clone(), pool_size, self.props.queue_size, self.dial_fn(addr.clone()))
                        .with_reconnect_hook(self.reconnect_hook()),
                )
            })
            .collect();
        MuxState {
            collections: CapabilityStatus::from_bucket(&cfg, "collections"),
            durability: CapabilityStatus::from_bucket(&cfg, "durableWrite"),
            create_as_deleted: CapabilityStatus::from_bucket(&cfg, "tombstonedUserXAttrs"),
            pipelines,
            dead_pipe: Arc::new(Pipeline::new_dead(self.props.queue_size)),
            route_config: cfg,
        }
    }

    fn dial_fn(&self, address: String) -> DialFn {
        let dialer = self.dialer.clone();
        let handler = self.routing_handler();
        Arc::new(move |cancel| {
            let dialer = dialer.clone();
            let address = address.clone();
            let handler = handler.clone();
            async move { dialer.slow_dial(&address, handler, &cancel).await }.boxed()
        })
    }

    /// Lets the next config at the current revision through once a
    /// connection comes back.
    fn reconnect_hook(&self) -> ReconnectFn {
        let cfg_mgr = Arc::downgrade(&self.cfg_mgr);
        Arc::new(move |address: &str| {
            if let Some(cfg_mgr) = cfg_mgr.upgrade() {
                debug!(address = %address, "Connection re-established, allowing same-revision config");
                cfg_mgr.mark_reconnected();
            }
        })
    }

    /// The post-error handler installed on every bootstrapped connection.
    fn routing_handler(&self) -> PostErrorHandler {
        let me = self.me.clone();
        Arc::new(move |resp, req, err| match me.upgrade() {
            Some(mux) => mux.handle_op_routing_resp(resp, req, err),
            None => Some(err),
        })
    }

    /// Picks the pipeline `req` belongs on, stamping its vbucket.
    pub fn route_request(&self, req: &Request) -> CoreResult<Arc<Pipeline>> {
        let state = self.state()?;
        if state.rev_id() < 0 {
            return Ok(state.dead_pipe.clone());
        }
        if req.is_pinned_to_address() {
            return Err(CoreError::message(
                ErrorKind::InvalidServer,
                "request is bound to a server and cannot be rerouted",
            ));
        }

        let replica = req.replica_idx();
        let index = if replica < 0 {
            -replica - 1
        } else {
            let cfg = &state.route_config;
            match cfg.bucket_type {
                BucketType::Vbucket => {
                    let map = cfg
                        .vb_map
                        .as_ref()
                        .ok_or_else(|| CoreError::new(ErrorKind::InvalidVbucket))?;
                    let key = req.key();
                    if !key.is_empty() {
                        req.set_vbucket(map.vbucket_by_key(&key));
                    }
                    map.node_by_vbucket(req.vbucket(), replica as u32)?
                }
                BucketType::Ketama => {
                    if replica > 0 {
                        return Err(CoreError::new(ErrorKind::InvalidReplica));
                    }
                    let key = req.key();
                    if key.is_empty() {
                        return Err(CoreError::invalid_argument("no key given for ketama routing"));
                    }
                    let map = cfg
                        .ketama_map
                        .as_ref()
                        .ok_or_else(|| CoreError::new(ErrorKind::InvalidServer))?;
                    map.node_by_key(&key)? as i32
                }
                BucketType::None => return Err(CoreError::new(ErrorKind::GcccpInUse)),
                BucketType::Invalid => {
                    return Err(CoreError::message(ErrorKind::InvalidServer, "config has an invalid bucket type"));
                }
            }
        };
        Ok(state.pipeline(index).clone())
    }

    /// Routes and queues a fresh request.
    pub fn dispatch_direct(&self, req: &Arc<Request>) -> CoreResult<()> {
        req.mark_dispatch_time();
        loop {
            let pipeline = self.route_request(req)?;
            match pipeline.send_request(req) {
                Ok(()) => return Ok(()),
                Err(e) if e.is(ErrorKind::PipelineClosed) => continue,
                Err(e) => {
                    return match self.handle_op_routing_resp(None, req, e) {
                        None => Ok(()),
                        Some(e) => Err(e),
                    };
                }
            }
        }
    }

    /// Queues `req` on the pipeline serving `address`, bypassing routing.
    /// The request is never rerouted afterwards.
    pub fn dispatch_direct_to_address(&self, req: &Arc<Request>, address: &str) -> CoreResult<()> {
        if req.replica_idx() != 0 {
            return Err(CoreError::invalid_argument("address dispatch cannot target a replica"));
        }
        req.pin_to_address();
        req.mark_dispatch_time();
        loop {
            let state = self.state()?;
            let pipeline = state
                .pipelines
                .iter()
                .find(|p| p.address() == address)
                .ok_or_else(|| CoreError::message(ErrorKind::InvalidServer, format!("no pipeline for {address}")))?;
            match pipeline.send_request(req) {
                Ok(()) => return Ok(()),
                Err(e) if e.is(ErrorKind::PipelineClosed) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Puts a request back on whichever pipeline currently owns it.
    pub(crate) fn requeue_direct(&self, req: &Arc<Request>, is_retry: bool) {
        match self.route_request(req) {
            Ok(pipeline) => self.requeue_direct_to(pipeline, req, is_retry),
            Err(e) => self.fail_requeue(req, e, is_retry),
        }
    }

    fn requeue_direct_to(&self, mut pipeline: Arc<Pipeline>, req: &Arc<Request>, is_retry: bool) {
        loop {
            match pipeline.requeue_request(req) {
                Ok(()) => return,
                Err(e) if e.is(ErrorKind::PipelineClosed) => match self.route_request(req) {
                    Ok(p) => pipeline = p,
                    Err(e) => return self.fail_requeue(req, e, is_retry),
                },
                Err(e) => return self.fail_requeue(req, e, is_retry),
            }
        }
    }

    fn fail_requeue(&self, req: &Arc<Request>, err: CoreError, is_retry: bool) {
        if !is_retry || !err.is(ErrorKind::RequestCanceled) {
            warn!(command = %req.command().name(), error = %err, "Failed to requeue request");
        }
        req.try_callback(Err(err));
    }

    /// Decides what happens to a failed request: retried (returns `None`)
    /// or completed with the returned error.
    pub(crate) fn handle_op_routing_resp(
        &self,
        resp: Option<&Response>,
        req: &Arc<Request>,
        err: CoreError,
    ) -> Option<CoreError> {
        if err.kind().is_cancellation() || err.is_timeout() {
            return Some(err);
        }

        let retried = match err.kind() {
            ErrorKind::SocketClosed if !self.is_closed() => {
                if req.command() == Opcode::GET_CLUSTER_CONFIG {
                    return Some(err);
                }
                let reason = if req.idempotent() || req.connection_info().last_dispatched_to.is_empty() {
                    RetryReason::SocketNotAvailable
                } else {
                    RetryReason::SocketClosedWhileInFlight
                };
                self.wait_and_retry(req, reason)
            }
            ErrorKind::ClientClosed if !self.is_closed() => {
                if req.command() == Opcode::GET_CLUSTER_CONFIG {
                    return Some(err);
                }
                self.wait_and_retry(req, RetryReason::SocketNotAvailable)
            }
            ErrorKind::ShortWrite => self.wait_and_retry(req, RetryReason::MemdWriteFailure),
            ErrorKind::ConfigOnly => self.handle_config_only(req),
            ErrorKind::NotMyVbucket => self.handle_not_my_vbucket(resp, req),
            ErrorKind::DocumentLocked => self.wait_and_retry(req, RetryReason::KvLocked),
            ErrorKind::TemporaryFailure => self.wait_and_retry(req, RetryReason::KvTemporaryFailure),
            ErrorKind::SyncWriteInProgress => self.wait_and_retry(req, RetryReason::KvSyncWriteInProgress),
            ErrorKind::SyncWriteRecommitInProgress => {
                self.wait_and_retry(req, RetryReason::KvSyncWriteReCommitInProgress)
            }
            _ => match resp {
                Some(resp) => self.maybe_error_map_retry(resp, req),
                None => false,
            },
        };
        if retried {
            return None;
        }

        let err = self.error_map.enhance_kv_error(err, resp, req, self.bucket());
        let handler = self.post_complete.read().clone();
        match handler {
            Some(handler) => handler(resp, req, err),
            None => Some(err),
        }
    }

    fn maybe_error_map_retry(&self, resp: &Response, req: &Arc<Request>) -> bool {
        let Some(entry) = self.error_map.entry(resp.packet.status) else {
            return false;
        };
        if !entry.should_retry() {
            return false;
        }
        let floor = entry
            .retry
            .as_ref()
            .map(|r| r.delay_for_attempt(req.retry_attempts()))
            .unwrap_or_default();
        trace!(status = %entry.name, "Error map asks for a retry");
        match maybe_retry_with_floor(req.as_ref(), RetryReason::KvErrorMapRetryIndicated, floor) {
            Some(at) => self.schedule_requeue(req, at),
            None => false,
        }
    }

    /// Schedules a retry for `reason`. Returns whether the request was taken
    /// over, either by a scheduled retry or by failing it with a timeout
    /// because the retry would land past its deadline.
    fn wait_and_retry(&self, req: &Arc<Request>, reason: RetryReason) -> bool {
        match maybe_retry(req.as_ref(), reason) {
            Some(at) => self.schedule_requeue(req, at),
            None => false,
        }
    }

    fn schedule_requeue(&self, req: &Arc<Request>, at: Instant) -> bool {
        if let Some(deadline) = req.deadline()
            && at >= deadline
        {
            req.cancel(req.timeout_error());
            return true;
        }
        let me = self.me.clone();
        let req = req.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(at.into()).await;
            if let Some(mux) = me.upgrade() {
                mux.requeue_direct(&req, true);
            }
        });
        true
    }

    fn handle_config_only(&self, req: &Arc<Request>) -> bool {
        debug!(command = %req.command().name(), "Node is config only, refreshing config");
        self.cfg_mgr.request_refresh();
        let at = Instant::now() + controlled_backoff(req.retry_attempts());
        self.schedule_requeue(req, at)
    }

    fn handle_not_my_vbucket(&self, resp: Option<&Response>, req: &Arc<Request>) -> bool {
        let Some(resp) = resp else {
            return self.wait_and_retry(req, RetryReason::KvNotMyVbucket);
        };
        if !resp.packet.value.is_empty() {
            let source_host = host_from_host_port(&resp.source_addr);
            match ClusterConfigJson::parse(&resp.packet.value, source_host) {
                Ok(cfg) => {
                    self.cfg_mgr.on_new_config(&cfg);
                    let old_vbucket = req.vbucket();
                    if let Ok(pipeline) = self.route_request(req)
                        && (pipeline.address() != resp.source_addr || req.vbucket() != old_vbucket)
                    {
                        debug!(
                            from = %resp.source_addr,
                            to = %pipeline.address(),
                            "Rerouting request after not-my-vbucket"
                        );
                        self.requeue_direct_to(pipeline, req, true);
                        return true;
                    }
                }
                Err(e) => debug!(error = %e, "Failed to parse config carried by not-my-vbucket"),
            }
        }
        self.wait_and_retry(req, RetryReason::KvNotMyVbucket)
    }

    /// Adopts connections of `old` pipelines that survive into `new`.
    fn pipeline_takeover(&self, old: &MuxState, new: &MuxState) {
        let mut unclaimed: Vec<Arc<Pipeline>> = old.pipelines.clone();
        for pipeline in &new.pipelines {
            if let Some(pos) = unclaimed.iter().position(|p| p.address() == pipeline.address()) {
                let previous = unclaimed.remove(pos);
                pipeline.takeover(&previous);
            }
            pipeline.start_clients();
        }
        for pipeline in unclaimed {
            debug!(address = %pipeline.address(), "Closing pipeline for departed node");
            for client in pipeline.graceful_close() {
                self.close_client(client, None);
            }
        }
    }

    /// Replaces every connection.
    fn reconnect_pipelines(&self, old: &MuxState, new: &MuxState) {
        for pipeline in &new.pipelines {
            pipeline.start_clients();
        }
        for pipeline in &old.pipelines {
            for client in pipeline.graceful_close() {
                self.close_client(client, Some(CoreError::message(ErrorKind::Shutdown, "forced reconnect")));
            }
        }
    }

    fn close_client(&self, client: Arc<MemdClient>, err: Option<CoreError>) {
        let shutdown = self.shutdown.clone();
        self.closing.spawn(async move {
            tokio::select! {
                _ = client.clone().graceful_close(err, GRACEFUL_CLOSE_TIMEOUT) => {}
                _ = shutdown.cancelled() => client.close(Some(CoreError::shutdown())),
            }
        });
    }

    /// Moves requests still queued on `old` onto the current pipelines in
    /// their original dispatch order.
    fn requeue_requests(&self, old: &MuxState) {
        let mut requests: Vec<Arc<Request>> = old.pipelines.iter().flat_map(|p| p.drain()).collect();
        requests.extend(old.dead_pipe.drain());
        requests.sort_by_key(|r| r.dispatch_time());
        if !requests.is_empty() {
            debug!(count = requests.len(), "Requeueing requests from previous pipelines");
        }
        for req in requests {
            if req.command() == Opcode::GET_CLUSTER_CONFIG {
                req.cancel(CoreError::canceled());
                continue;
            }
            self.requeue_direct(&req, false);
        }
    }

    /// Stops routing, closes every connection and fails everything queued
    /// with `Shutdown`.
    pub async fn close(&self) {
        if let Some(me) = self.me.upgrade() {
            let watcher: Arc<dyn RouteConfigWatcher> = me;
            self.cfg_mgr.remove_watcher(&watcher);
        }
        let state = {
            let _guard = self.write_lock.lock();
            self.state.swap(None)
        };
        self.shutdown.cancel();
        let Some(state) = state else {
            return;
        };
        info!(bucket = self.bucket(), "Closing kv mux");

        let mut requests = Vec::new();
        for pipeline in &state.pipelines {
            pipeline.close();
            requests.extend(pipeline.drain());
        }
        state.dead_pipe.close();
        requests.extend(state.dead_pipe.drain());
        for req in requests {
            req.try_callback(Err(CoreError::shutdown()));
        }

        self.closing.close();
        self.closing.wait().await;
    }
}

impl RouteConfigWatcher for KvMux {
    fn on_new_route_config(&self, cfg: Arc<RouteConfig>) {
        let _guard = self.write_lock.lock();
        let Some(old) = self.state.load_full() else {
            debug!("Ignoring config for closed mux");
            return;
        };
        let new = Arc::new(self.build_state(cfg));
        self.state.store(Some(new.clone()));
        cbcore_telemetry::set_pipeline_count(new.pipelines.len());

        if old.rev_id() < 0 && new.rev_id() >= 0 {
            if self.props.collections_enabled && new.collections == CapabilityStatus::Unsupported {
                debug!("Collections requested but the cluster does not support them");
            }
            self.has_seen_config.cancel();
        }

        let collections_changed = old.collections != new.collections;
        if !self.props.collections_enabled || old.rev_id() < 0 || !collections_changed {
            self.pipeline_takeover(&old, &new);
        } else {
            info!("Collections support changed, reconnecting all pipelines");
            self.reconnect_pipelines(&old, &new);
        }

        self.requeue_requests(&old);
    }
}

/// Handles cluster map change notifications pushed over KV connections.
pub fn cluster_map_notification_handler(cfg_mgr: Weak<ConfigManager>) -> ServerRequestHandler {
    Arc::new(move |resp: &Response| {
        if resp.packet.command != CLUSTER_MAP_CHANGE_NOTIFICATION {
            trace!(command = %resp.packet.command.name(), "Ignoring server request");
            return;
        }
        let extras = &resp.packet.extras;
        let (Some(epoch), Some(rev)) = (
            extras.get(0..8).and_then(|b| b.try_into().ok()).map(i64::from_be_bytes),
            extras.get(8..16).and_then(|b| b.try_into().ok()).map(i64::from_be_bytes),
        ) else {
            debug!(len = extras.len(), "Malformed cluster map change notification");
            return;
        };
        if let Some(cfg_mgr) = cfg_mgr.upgrade() {
            cfg_mgr.on_config_change_notification(epoch, rev);
        }
    })
}
