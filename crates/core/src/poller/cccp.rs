//! Binary-protocol config polling.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cbcore_errors::{CoreError, CoreResult, ErrorKind};
use cbcore_memd::{Opcode, Packet};
use rand::Rng;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ConfigPoller, PollerExit};
use crate::kv::mux::KvMux;
use crate::kv::pipeline::Pipeline;
use crate::kv::request::{Request, Response};
use crate::retry::FailFastRetryStrategy;
use crate::routing::cfg_json::{ClusterConfigJson, host_from_host_port};
use crate::routing::config_manager::ConfigManager;

/// Outcome of one sweep over the data nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SweepOutcome {
    Fetched,
    /// A node answered that it cannot serve configs this way.
    Unsupported,
    Failed,
}

/// True for errors meaning the node cannot serve configs over the binary
/// protocol at all.
pub(crate) fn is_unsupported(err: &CoreError) -> bool {
    err.is(ErrorKind::UnsupportedOperation) || err.is(ErrorKind::NoBucket) || err.is(ErrorKind::DocumentNotFound)
}

/// The error a connection slot of `pipeline` last failed with, if any.
fn socket_error(pipeline: &Pipeline) -> Option<CoreError> {
    pipeline.clients().iter().find_map(|c| c.last_error())
}

pub struct CccpPoller {
    mux: Arc<KvMux>,
    cfg_mgr: Arc<ConfigManager>,
    poll_period: Duration,
    max_wait: Duration,
}

impl CccpPoller {
    pub fn new(mux: Arc<KvMux>, cfg_mgr: Arc<ConfigManager>, poll_period: Duration, max_wait: Duration) -> Self {
        Self {
            mux,
            cfg_mgr,
            poll_period,
            max_wait,
        }
    }

    async fn fetch_from(&self, index: usize) -> CoreResult<Response> {
        let state = self.mux.state()?;
        let (tx, rx) = oneshot::channel();
        let req = Arc::new(
            Request::new(Packet::request(Opcode::GET_CLUSTER_CONFIG), move |r| {
                let _ = tx.send(r);
            })
            .with_replica_idx(-(index as i32) - 1)
            .with_idempotent(true)
            .with_retry_strategy(Arc::new(FailFastRetryStrategy))
            .with_deadline(Instant::now() + self.max_wait),
        );
        let pipeline = state.pipeline(index as i32);
        if let Err(e) = pipeline.send_request(&req) {
            req.cancel(e);
        }
        match tokio::time::timeout(self.max_wait, rx).await {
            Ok(result) => result.unwrap_or_else(|_| Err(CoreError::canceled())),
            Err(_) => {
                let err = socket_error(pipeline).unwrap_or_else(|| {
                    CoreError::message(ErrorKind::UnambiguousTimeout, "timed out fetching cluster config")
                });
                debug!(node = index, error = %err, "CCCP fetch did not complete in time");
                req.cancel(err.clone());
                Err(err)
            }
        }
    }

    /// Asks each node in turn, from a random starting point, until one
    /// answers with a config or says it cannot serve one.
    pub(crate) async fn sweep(&self) -> SweepOutcome {
        let num_nodes = match self.mux.state() {
            Ok(state) => state.num_pipelines(),
            Err(_) => return SweepOutcome::Failed,
        };
        if num_nodes == 0 {
            return SweepOutcome::Failed;
        }

        let offset = rand::thread_rng().gen_range(0..num_nodes);
        for i in 0..num_nodes {
            let index = (offset + i) % num_nodes;
            let resp = match self.fetch_from(index).await {
                Ok(resp) => resp,
                Err(e) if is_unsupported(&e) => {
                    debug!(node = index, error = %e, "Node cannot serve cluster configs");
                    return SweepOutcome::Unsupported;
                }
                Err(e) => {
                    debug!(node = index, error = %e, "CCCP fetch failed, trying next node");
                    continue;
                }
            };

            let source_host = host_from_host_port(&resp.source_addr);
            match ClusterConfigJson::parse(&resp.packet.value, source_host) {
                Ok(cfg) => {
                    self.cfg_mgr.on_new_config(&cfg);
                    return SweepOutcome::Fetched;
                }
                Err(e) => {
                    warn!(source = %resp.source_addr, error = %e, "Discarding unparsable cluster config");
                }
            }
        }

        SweepOutcome::Failed
    }
}

#[async_trait]
impl ConfigPoller for CccpPoller {
    fn name(&self) -> &'static str {
        "cccp"
    }

    async fn run(&self, shutdown: &CancellationToken) -> PollerExit {
        info!(period = ?self.poll_period, "CCCP poller started");
        let mut first = true;
        loop {
            if !first {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_period) => {}
                    _ = self.cfg_mgr.refresh_requested() => {
                        debug!("CCCP refresh requested");
                    }
                }
            }
            first = false;

            let outcome = tokio::select! {
                _ = shutdown.cancelled() => break,
                outcome = self.sweep() => outcome,
            };
            if outcome == SweepOutcome::Unsupported {
                info!("No node supports CCCP");
                return PollerExit::Fallback;
            }
        }
        info!("CCCP poller stopped");
        PollerExit::Stopped
    }
}

#[cfg(test)]
mod tests {
    use cbcore_errors::kind_for_response;
    use cbcore_memd::Status;
    use futures::FutureExt;

    use super::*;
    use crate::kv::client::MemdClient;
    use crate::kv::pipeline_client::DialFn;

    #[test]
    fn test_unsupported_classification() {
        assert!(is_unsupported(&CoreError::new(ErrorKind::UnsupportedOperation)));
        assert!(is_unsupported(&CoreError::new(ErrorKind::NoBucket)));
        assert!(is_unsupported(&CoreError::new(ErrorKind::DocumentNotFound)));
        let not_found = kind_for_response(Opcode::GET_CLUSTER_CONFIG, Status::KEY_NOT_FOUND).unwrap();
        assert!(is_unsupported(&CoreError::new(not_found)));
        assert!(!is_unsupported(&CoreError::new(ErrorKind::TemporaryFailure)));
        assert!(!is_unsupported(&CoreError::new(ErrorKind::UnambiguousTimeout)));
        assert!(!is_unsupported(&CoreError::canceled()));
    }

    #[tokio::test]
    async fn test_socket_error_comes_from_failed_dial() {
        let dial: DialFn = Arc::new(|_cancel: CancellationToken| {
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err::<Arc<MemdClient>, _>(CoreError::message(ErrorKind::SocketClosed, "connection refused"))
            }
            .boxed()
        });
        let pipeline = Pipeline::new("127.0.0.1:1", 1, 4, dial);
        assert!(socket_error(&pipeline).is_none());

        pipeline.start_clients();
        tokio::time::timeout(Duration::from_secs(1), async {
            while socket_error(&pipeline).is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(socket_error(&pipeline).unwrap().is(ErrorKind::SocketClosed));
        pipeline.close();
    }
}
