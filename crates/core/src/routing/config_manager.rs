//! Config manager: accepts candidate cluster configs and publishes the ones
//! that move the cluster view forward.

use std::sync::Arc;

use cbcore_config::NetworkType;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::cfg_json::ClusterConfigJson;
use super::route_config::{DEFAULT_NETWORK, EXTERNAL_NETWORK, RouteConfig, network_for_seeds};

/// Receives every accepted route config.
#[cfg_attr(test, mockall::automock)]
pub trait RouteConfigWatcher: Send + Sync {
    fn on_new_route_config(&self, cfg: Arc<RouteConfig>);
}

#[derive(Default)]
struct ManagerState {
    current: Option<Arc<RouteConfig>>,
    network: Option<String>,
    first_after_reconnect: bool,
}

pub struct ConfigManager {
    seed_addrs: Vec<String>,
    use_tls: bool,
    network_type: NetworkType,
    state: Mutex<ManagerState>,
    watchers: Mutex<Vec<Arc<dyn RouteConfigWatcher>>>,
    // Serialises accept and fan-out so watchers observe configs in order.
    publish_lock: Mutex<()>,
    refresh: Notify,
}

fn same_watcher(a: &Arc<dyn RouteConfigWatcher>, b: &Arc<dyn RouteConfigWatcher>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl ConfigManager {
    pub fn new(seed_addrs: Vec<String>, use_tls: bool, network_type: NetworkType) -> Self {
        Self {
            seed_addrs,
            use_tls,
            network_type,
            state: Mutex::new(ManagerState::default()),
            watchers: Mutex::new(Vec::new()),
            publish_lock: Mutex::new(()),
            refresh: Notify::new(),
        }
    }

    pub fn add_watcher(&self, watcher: Arc<dyn RouteConfigWatcher>) {
        let mut watchers = self.watchers.lock();
        if !watchers.iter().any(|w| same_watcher(w, &watcher)) {
            watchers.push(watcher);
        }
    }

    pub fn remove_watcher(&self, watcher: &Arc<dyn RouteConfigWatcher>) {
        self.watchers.lock().retain(|w| !same_watcher(w, watcher));
    }

    /// The last accepted config.
    pub fn current(&self) -> Option<Arc<RouteConfig>> {
        self.state.lock().current.clone()
    }

    pub fn current_rev(&self) -> i64 {
        self.current().map(|c| c.rev_id).unwrap_or(-1)
    }

    /// The network family chosen on the first accepted config.
    pub fn network(&self) -> Option<String> {
        self.state.lock().network.clone()
    }

    /// Allows the next config to replace the current one at the same revision.
    pub fn mark_reconnected(&self) {
        self.state.lock().first_after_reconnect = true;
    }

    /// Asks the active poller to fetch a config now.
    pub fn request_refresh(&self) {
        self.refresh.notify_waiters();
    }

    pub async fn refresh_requested(&self) {
        self.refresh.notified().await
    }

    /// Handles a server push announcing a new config revision.
    pub fn on_config_change_notification(&self, rev_epoch: i64, rev: i64) {
        let newer = match self.current() {
            Some(cur) => rev_epoch > cur.rev_epoch || (rev_epoch == cur.rev_epoch && rev > cur.rev_id),
            None => true,
        };
        if newer {
            debug!(rev_epoch, rev, "Cluster map change notification, refreshing config");
            self.request_refresh();
        }
    }

    fn resolve_network(&self, cfg: &ClusterConfigJson) -> String {
        match &self.network_type {
            NetworkType::Auto => network_for_seeds(cfg, &self.seed_addrs),
            NetworkType::Default => DEFAULT_NETWORK.to_string(),
            NetworkType::External => EXTERNAL_NETWORK.to_string(),
            NetworkType::Named(name) => name.clone(),
        }
    }

    /// Offers a parsed config. Returns whether it was accepted and published.
    pub fn on_new_config(&self, cfg: &ClusterConfigJson) -> bool {
        let _publish = self.publish_lock.lock();

        let accepted = {
            let mut state = self.state.lock();
            let network = match &state.network {
                Some(n) => n.clone(),
                None => {
                    let n = self.resolve_network(cfg);
                    info!(network = %n, "Selected network type");
                    n
                }
            };
            let rc = RouteConfig::build(cfg, self.use_tls, &network);
            if !self.should_accept(&state, &rc) {
                return false;
            }
            state.network = Some(network);
            state.first_after_reconnect = false;
            let rc = Arc::new(rc);
            state.current = Some(rc.clone());
            rc
        };

        info!(
            rev = accepted.rev_id,
            rev_epoch = accepted.rev_epoch,
            bucket = %accepted.name,
            nodes = accepted.kv_server_list.len(),
            "Applying new cluster config"
        );
        cbcore_telemetry::record_config_applied(accepted.rev_id);

        let watchers = self.watchers.lock().clone();
        for watcher in watchers {
            watcher.on_new_route_config(accepted.clone());
        }
        true
    }

    fn should_accept(&self, state: &ManagerState, rc: &RouteConfig) -> bool {
        if !rc.is_valid() {
            warn!(rev = rc.rev_id, "Ignoring invalid cluster config");
            return false;
        }
        let Some(old) = &state.current else {
            return true;
        };

        if let (Some(old_vbs), Some(new_vbs)) = (old.num_vbuckets(), rc.num_vbuckets())
            && old_vbs != new_vbs
        {
            warn!(old = old_vbs, new = new_vbs, "Ignoring config with a different vbucket count");
            return false;
        }

        if rc.rev_id == 0 {
            debug!("Accepting unversioned config");
            return true;
        }

        let same_rev = rc.rev_epoch == old.rev_epoch && rc.rev_id == old.rev_id;
        if rc.bucket_type != old.bucket_type {
            if rc.is_newer_than(old) || (same_rev && state.first_after_reconnect) {
                debug!(old = ?old.bucket_type, new = ?rc.bucket_type, "Bucket type changed");
                return true;
            }
            debug!(rev = rc.rev_id, "Ignoring bucket type change without a newer revision");
            return false;
        }

        if same_rev {
            if state.first_after_reconnect {
                return true;
            }
            debug!(rev = rc.rev_id, "Ignoring config with identical revision");
            return false;
        }

        if !rc.is_newer_than(old) {
            debug!(rev = rc.rev_id, current = old.rev_id, "Ignoring older config");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::routing::cfg_json::{NodeExtJson, VBucketServerMapJson};

    fn config(rev: i64, num_vbuckets: usize) -> ClusterConfigJson {
        let mut services = BTreeMap::new();
        services.insert("kv".to_string(), 11210);
        services.insert("mgmt".to_string(), 8091);
        ClusterConfigJson {
            rev,
            name: "default".into(),
            node_locator: "vbucket".into(),
            nodes_ext: vec![NodeExtJson {
                hostname: "127.0.0.1".into(),
                services,
                ..Default::default()
            }],
            vbucket_server_map: Some(VBucketServerMapJson {
                server_list: vec!["127.0.0.1:11210".into()],
                vbucket_map: vec![vec![0]; num_vbuckets],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn manager() -> ConfigManager {
        ConfigManager::new(vec!["127.0.0.1:11210".into()], false, NetworkType::Auto)
    }

    #[test]
    fn test_publishes_newer_revisions_only() {
        let mgr = manager();
        let mut watcher = MockRouteConfigWatcher::new();
        watcher.expect_on_new_route_config().times(2).return_const(());
        mgr.add_watcher(Arc::new(watcher));

        assert!(mgr.on_new_config(&config(5, 4)));
        assert!(!mgr.on_new_config(&config(5, 4)));
        assert!(!mgr.on_new_config(&config(4, 4)));
        assert!(mgr.on_new_config(&config(6, 4)));
        assert_eq!(mgr.current_rev(), 6);
        assert_eq!(mgr.network().as_deref(), Some(DEFAULT_NETWORK));
    }

    #[test]
    fn test_equal_revision_after_reconnect() {
        let mgr = manager();
        assert!(mgr.on_new_config(&config(5, 4)));
        mgr.mark_reconnected();
        assert!(mgr.on_new_config(&config(5, 4)));
        assert!(!mgr.on_new_config(&config(5, 4)));
    }

    #[test]
    fn test_unversioned_always_accepted() {
        let mgr = manager();
        assert!(mgr.on_new_config(&config(5, 4)));
        assert!(mgr.on_new_config(&config(0, 4)));
    }

    #[test]
    fn test_vbucket_count_change_rejected() {
        let mgr = manager();
        assert!(mgr.on_new_config(&config(5, 4)));
        assert!(!mgr.on_new_config(&config(9, 8)));
        assert_eq!(mgr.current_rev(), 5);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mgr = manager();
        let mut cfg = config(5, 4);
        cfg.vbucket_server_map = None;
        assert!(!mgr.on_new_config(&cfg));
        assert!(mgr.current().is_none());
    }

    #[test]
    fn test_bucket_type_change_needs_newer_revision() {
        let mgr = manager();
        let mut gcccp = config(5, 4);
        gcccp.node_locator.clear();
        gcccp.vbucket_server_map = None;
        assert!(mgr.on_new_config(&gcccp));
        assert!(!mgr.on_new_config(&config(4, 4)));
        assert!(mgr.on_new_config(&config(6, 4)));
    }

    #[test]
    fn test_watchers_idempotent() {
        let mgr = manager();
        let mut watcher = MockRouteConfigWatcher::new();
        watcher.expect_on_new_route_config().times(1).return_const(());
        let watcher: Arc<dyn RouteConfigWatcher> = Arc::new(watcher);
        mgr.add_watcher(watcher.clone());
        mgr.add_watcher(watcher.clone());
        assert!(mgr.on_new_config(&config(1, 4)));
        mgr.remove_watcher(&watcher);
        assert!(mgr.on_new_config(&config(2, 4)));
    }
}
