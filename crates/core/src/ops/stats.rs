//! Server statistics, gathered from every data node in parallel.
//!
//! A stats request is persistent: the node answers with one packet per
//! statistic and terminates the group with an empty key.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use cbcore_errors::{CoreError, CoreResult};
use cbcore_memd::{Opcode, Packet};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::debug;

use super::{KvOps, OpOptions};
use crate::kv::request::{Request, Response, StreamSink};

/// One node's statistics, or the reason they could not be read.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServerStats {
    pub stats: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "serialize_err")]
    pub error: Option<CoreError>,
}

fn serialize_err<S: serde::Serializer>(err: &Option<CoreError>, s: S) -> Result<S::Ok, S::Error> {
    match err {
        Some(e) => s.serialize_str(&e.to_string()),
        None => s.serialize_none(),
    }
}

/// Statistics keyed by node address.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsResult {
    pub servers: HashMap<String, ServerStats>,
}

struct StatsSink {
    stats: Mutex<HashMap<String, String>>,
    done: Mutex<Option<oneshot::Sender<ServerStats>>>,
}

impl StatsSink {
    fn new(done: oneshot::Sender<ServerStats>) -> Self {
        Self {
            stats: Mutex::new(HashMap::new()),
            done: Mutex::new(Some(done)),
        }
    }
}

impl StreamSink for StatsSink {
    fn on_response(&self, resp: Response) -> bool {
        if resp.packet.key.is_empty() {
            return true;
        }
        let key = String::from_utf8_lossy(&resp.packet.key).into_owned();
        let value = String::from_utf8_lossy(&resp.packet.value).into_owned();
        self.stats.lock().insert(key, value);
        false
    }

    fn end(&self, err: Option<CoreError>) {
        if let Some(tx) = self.done.lock().take() {
            let stats = std::mem::take(&mut *self.stats.lock());
            let _ = tx.send(ServerStats { stats, error: err });
        }
    }
}

impl KvOps {
    /// Reads the stats group `key` (empty for the default group) from every
    /// data node, or only from `address` when given. Per-node failures are
    /// reported in the result rather than failing the call.
    pub async fn stats(&self, key: &str, address: Option<&str>, opts: &OpOptions) -> CoreResult<StatsResult> {
        let state = self.mux.state()?;
        let deadline = Instant::now() + opts.timeout.unwrap_or(self.default_timeout);
        let strategy = opts.retry_strategy.clone().unwrap_or_else(|| self.default_retry.clone());

        let targets: Vec<(i32, String)> = state
            .pipelines()
            .iter()
            .enumerate()
            .map(|(i, p)| (i as i32, p.address().to_string()))
            .filter(|(_, addr)| address.is_none_or(|a| a == addr.as_str()))
            .collect();
        if targets.is_empty() {
            return Err(match address {
                Some(a) => CoreError::invalid_argument(format!("no data node at {a}")),
                None => CoreError::new(cbcore_errors::ErrorKind::ServiceNotAvailable),
            });
        }

        let mut pending = Vec::with_capacity(targets.len());
        for (index, addr) in targets {
            let (tx, rx) = oneshot::channel();
            let req = Arc::new(
                Request::new_stream(
                    Packet::request(Opcode::STAT).with_key(key.as_bytes().to_vec()),
                    Arc::new(StatsSink::new(tx)),
                )
                .with_replica_idx(-index - 1)
                .with_idempotent(true)
                .with_retry_strategy(strategy.clone())
                .with_deadline(deadline),
            );
            req.start_timer();
            if let Err(e) = self.mux.dispatch_direct(&req) {
                req.cancel(e);
            }
            pending.push(async move {
                let stats = rx.await.unwrap_or_else(|_| ServerStats {
                    error: Some(CoreError::canceled()),
                    ..Default::default()
                });
                (addr, stats)
            });
        }

        let servers: HashMap<_, _> = join_all(pending).await.into_iter().collect();
        debug!(group = key, servers = servers.len(), "Collected server stats");
        Ok(StatsResult { servers })
    }
}
