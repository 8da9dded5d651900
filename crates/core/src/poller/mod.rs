//! Cluster config pollers.
//!
//! CCCP asks the data nodes for their config over the binary protocol.
//! When no node supports that and HTTP bootstrap is permitted, the
//! controller hands over to the streaming HTTP poller for the rest of the
//! agent's life.

pub mod cccp;
pub mod http;

use std::sync::Arc;

use async_trait::async_trait;
use cbcore_config::BootstrapOn;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use cccp::CccpPoller;
pub use http::{ConfigStreamDecoder, HttpPoller};

/// Why a poller's run loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerExit {
    Stopped,
    /// The poller's mechanism is not available on this cluster.
    Fallback,
}

#[async_trait]
pub trait ConfigPoller: Send + Sync {
    fn name(&self) -> &'static str;

    /// Polls until `shutdown` fires or the mechanism turns out unusable.
    async fn run(&self, shutdown: &CancellationToken) -> PollerExit;
}

/// Which poller is currently feeding the config manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivePoller {
    None,
    Cccp,
    Http,
}

pub struct PollerController {
    bootstrap_on: BootstrapOn,
    cccp: Option<Arc<dyn ConfigPoller>>,
    http: Option<Arc<dyn ConfigPoller>>,
    active: Mutex<ActivePoller>,
}

impl PollerController {
    pub fn new(
        bootstrap_on: BootstrapOn,
        cccp: Option<Arc<dyn ConfigPoller>>,
        http: Option<Arc<dyn ConfigPoller>>,
    ) -> Self {
        Self {
            bootstrap_on,
            cccp,
            http,
            active: Mutex::new(ActivePoller::None),
        }
    }

    pub fn active(&self) -> ActivePoller {
        *self.active.lock()
    }

    /// Runs the configured pollers in the background until `shutdown`.
    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(bootstrap_on = ?self.bootstrap_on, "Config poller controller started");
            self.run(&shutdown).await;
            *self.active.lock() = ActivePoller::None;
            info!("Config poller controller stopped");
        })
    }

    async fn run(&self, shutdown: &CancellationToken) {
        let cccp_allowed = matches!(self.bootstrap_on, BootstrapOn::Both | BootstrapOn::Cccp);
        let http_allowed = matches!(self.bootstrap_on, BootstrapOn::Both | BootstrapOn::Http);

        if cccp_allowed && let Some(cccp) = &self.cccp {
            *self.active.lock() = ActivePoller::Cccp;
            match cccp.run(shutdown).await {
                PollerExit::Stopped => return,
                PollerExit::Fallback if !http_allowed => {
                    warn!("CCCP is unsupported by the cluster and HTTP bootstrap is disabled");
                    return;
                }
                PollerExit::Fallback => {
                    info!("CCCP is unsupported by the cluster, falling back to HTTP polling");
                }
            }
        }

        if http_allowed && let Some(http) = &self.http {
            *self.active.lock() = ActivePoller::Http;
            match http.run(shutdown).await {
                PollerExit::Stopped => {}
                PollerExit::Fallback => debug!("HTTP poller exited without a poller to fall back to"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Scripted {
        exit: PollerExit,
        runs: AtomicUsize,
    }

    impl Scripted {
        fn new(exit: PollerExit) -> Arc<Self> {
            Arc::new(Self {
                exit,
                runs: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ConfigPoller for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn run(&self, _shutdown: &CancellationToken) -> PollerExit {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.exit
        }
    }

    #[tokio::test]
    async fn test_falls_back_to_http() {
        let cccp = Scripted::new(PollerExit::Fallback);
        let http = Scripted::new(PollerExit::Stopped);
        let ctl = Arc::new(PollerController::new(
            BootstrapOn::Both,
            Some(cccp.clone()),
            Some(http.clone()),
        ));
        ctl.clone().start(CancellationToken::new()).await.unwrap();
        assert_eq!(cccp.runs.load(Ordering::SeqCst), 1);
        assert_eq!(http.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cccp_only_never_falls_back() {
        let cccp = Scripted::new(PollerExit::Fallback);
        let http = Scripted::new(PollerExit::Stopped);
        let ctl = Arc::new(PollerController::new(
            BootstrapOn::Cccp,
            Some(cccp.clone()),
            Some(http.clone()),
        ));
        ctl.start(CancellationToken::new()).await.unwrap();
        assert_eq!(http.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_http_only_skips_cccp() {
        let cccp = Scripted::new(PollerExit::Stopped);
        let http = Scripted::new(PollerExit::Stopped);
        let ctl = Arc::new(PollerController::new(
            BootstrapOn::Http,
            Some(cccp.clone()),
            Some(http.clone()),
        ));
        ctl.start(CancellationToken::new()).await.unwrap();
        assert_eq!(cccp.runs.load(Ordering::SeqCst), 0);
        assert_eq!(http.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stopped_cccp_does_not_start_http() {
        let cccp = Scripted::new(PollerExit::Stopped);
        let http = Scripted::new(PollerExit::Stopped);
        let ctl = Arc::new(PollerController::new(
            BootstrapOn::Both,
            Some(cccp.clone()),
            Some(http.clone()),
        ));
        ctl.start(CancellationToken::new()).await.unwrap();
        assert_eq!(http.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_http_fallback_exit_ends_controller() {
        let cccp = Scripted::new(PollerExit::Fallback);
        let http = Scripted::new(PollerExit::Fallback);
        let ctl = Arc::new(PollerController::new(
            BootstrapOn::Both,
            Some(cccp.clone()),
            Some(http.clone()),
        ));
        ctl.clone().start(CancellationToken::new()).await.unwrap();
        assert_eq!(cccp.runs.load(Ordering::SeqCst), 1);
        assert_eq!(http.runs.load(Ordering::SeqCst), 1);
        assert_eq!(ctl.active(), ActivePoller::None);
    }
}
