use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cbcore_errors::{CoreError, CoreResult, ErrorKind, ServiceType};
use cbcore_memd::{Opcode, Packet};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::oneshot;

use super::{KvOps, OpOptions};
use crate::kv::request::Request;
use crate::retry::FailFastRetryStrategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PingState {
    Ok,
    Timeout,
    Error,
}

/// Outcome of probing one endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointPingResult {
    pub endpoint: String,
    #[serde(with = "micros")]
    pub latency: Duration,
    pub state: PingState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Bucket scope of the probed connection, empty at cluster level.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub scope: String,
}

impl EndpointPingResult {
    pub fn from_outcome(endpoint: impl Into<String>, started: Instant, outcome: CoreResult<()>, scope: &str) -> Self {
        let latency = started.elapsed();
        let (state, error) = match outcome {
            Ok(()) => (PingState::Ok, None),
            Err(e) if e.is_timeout() => (PingState::Timeout, Some(e.to_string())),
            Err(e) => (PingState::Error, Some(e.to_string())),
        };
        Self {
            endpoint: endpoint.into(),
            latency,
            state,
            error,
            scope: scope.to_string(),
        }
    }
}

mod micros {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_micros() as u64)
    }
}

/// A ping report across services.
#[derive(Debug, Clone, Serialize)]
pub struct PingResult {
    pub id: String,
    pub config_rev: i64,
    pub services: HashMap<ServiceType, Vec<EndpointPingResult>>,
}

impl KvOps {
    /// Sends a NOOP down every data pipeline. Pings never retry.
    pub async fn ping_kv(&self, opts: &OpOptions) -> CoreResult<Vec<EndpointPingResult>> {
        let state = self.mux.state()?;
        if state.rev_id() < 0 {
            return Err(CoreError::message(ErrorKind::ServiceNotAvailable, "no cluster config yet"));
        }
        let deadline = Instant::now() + opts.timeout.unwrap_or(self.default_timeout);
        let bucket = self.mux.bucket().to_string();

        let mut pending = Vec::with_capacity(state.num_pipelines());
        for (index, pipeline) in state.pipelines().iter().enumerate() {
            let (tx, rx) = oneshot::channel();
            let req = Arc::new(
                Request::new(Packet::request(Opcode::NOOP), move |r| {
                    let _ = tx.send(r.map(|_| ()));
                })
                .with_replica_idx(-(index as i32) - 1)
                .with_idempotent(true)
                .with_retry_strategy(Arc::new(FailFastRetryStrategy))
                .with_deadline(deadline),
            );
            let started = Instant::now();
            req.start_timer();
            if let Err(e) = self.mux.dispatch_direct(&req) {
                req.cancel(e);
            }
            let endpoint = pipeline.address().to_string();
            let bucket = bucket.clone();
            pending.push(async move {
                let outcome = rx.await.unwrap_or_else(|_| Err(CoreError::canceled()));
                EndpointPingResult::from_outcome(endpoint, started, outcome, &bucket)
            });
        }
        Ok(join_all(pending).await)
    }
}
