//! Typed KV operations.
//!
//! Each operation encodes a packet, sends it through the collections
//! component (which hands it to the mux) and decodes the response. The
//! methods live on [`KvOps`], split by family across the submodules.

pub mod crud;
pub mod dcp;
pub mod diagnostics;
pub mod observe;
pub mod stats;
pub mod subdoc;

use std::sync::Arc;
use std::time::{Duration, Instant};

use cbcore_errors::{CoreError, CoreResult, ErrorKind};
use cbcore_memd::Packet;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::collections::CollectionsComponent;
use crate::kv::mux::{CapabilityStatus, KvMux};
use crate::kv::request::{Request, Response};
use crate::retry::RetryStrategy;

pub use crud::{CounterResult, GetMetaResult, GetResult, MutationResult, StoreOptions};
pub use dcp::{
    DcpEvent, FailoverEntry, SnapshotMarker, StreamEndReason, StreamFilter, StreamObserver, StreamOptions, StreamStart,
    VbSeqno,
};
pub use diagnostics::{EndpointPingResult, PingResult, PingState};
pub use observe::{KeyState, ObserveResult, ObserveVbResult};
pub use stats::{ServerStats, StatsResult};
pub use subdoc::{LookupInResult, MutateInResult, SubDocOp, SubDocResult};

/// Options shared by every KV operation.
#[derive(Debug, Clone, Default)]
pub struct OpOptions {
    pub scope: String,
    pub collection: String,
    /// Skips name resolution when set.
    pub collection_id: Option<u32>,
    pub timeout: Option<Duration>,
    pub retry_strategy: Option<Arc<dyn RetryStrategy>>,
}

impl OpOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collection(mut self, scope: impl Into<String>, collection: impl Into<String>) -> Self {
        self.scope = scope.into();
        self.collection = collection.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry_strategy(mut self, strategy: Arc<dyn RetryStrategy>) -> Self {
        self.retry_strategy = Some(strategy);
        self
    }
}

/// Position of a mutation in a vbucket's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MutationToken {
    pub vbucket: u16,
    pub vbuuid: u64,
    pub seqno: u64,
}

impl MutationToken {
    /// Reads the token a server appends to mutation responses when
    /// sequence numbers were negotiated.
    pub(crate) fn from_extras(vbucket: u16, extras: &[u8]) -> Option<Self> {
        Some(Self {
            vbucket,
            vbuuid: be_u64(extras, 0)?,
            seqno: be_u64(extras, 8)?,
        })
    }
}

pub(crate) fn be_u16(buf: &[u8], at: usize) -> Option<u16> {
    buf.get(at..at + 2).map(|b| u16::from_be_bytes([b[0], b[1]]))
}

pub(crate) fn be_u32(buf: &[u8], at: usize) -> Option<u32> {
    buf.get(at..at + 4).and_then(|b| b.try_into().ok()).map(u32::from_be_bytes)
}

pub(crate) fn be_u64(buf: &[u8], at: usize) -> Option<u64> {
    buf.get(at..at + 8).and_then(|b| b.try_into().ok()).map(u64::from_be_bytes)
}

pub(crate) fn short_body(what: &str) -> CoreError {
    CoreError::protocol(format!("{what} response body too short"))
}

/// Cancels the wrapped request if dropped before it completes, so a
/// dropped operation future never leaves work queued behind it.
#[derive(Debug)]
pub struct PendingOp {
    req: Arc<Request>,
}

impl PendingOp {
    pub(crate) fn new(req: Arc<Request>) -> Self {
        Self { req }
    }

    pub fn cancel(&self) -> bool {
        self.req.cancel(CoreError::canceled())
    }

    pub fn request(&self) -> &Arc<Request> {
        &self.req
    }
}

impl Drop for PendingOp {
    fn drop(&mut self) {
        self.req.cancel(CoreError::canceled());
    }
}

/// A completed request: the response plus the vbucket it was routed to.
pub(crate) struct Completed {
    pub resp: Response,
    pub vbucket: u16,
}

/// How a single request is dispatched.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Dispatch {
    pub idempotent: bool,
    pub replica_idx: i32,
    pub durable: bool,
}

impl Dispatch {
    pub fn read() -> Self {
        Self {
            idempotent: true,
            ..Default::default()
        }
    }

    pub fn write() -> Self {
        Self::default()
    }
}

/// Entry point for KV operations.
#[derive(Clone)]
pub struct KvOps {
    mux: Arc<KvMux>,
    collections: Arc<CollectionsComponent>,
    default_timeout: Duration,
    durable_timeout: Duration,
    default_retry: Arc<dyn RetryStrategy>,
    mutation_tokens: bool,
}

impl KvOps {
    pub fn new(
        mux: Arc<KvMux>,
        collections: Arc<CollectionsComponent>,
        default_timeout: Duration,
        durable_timeout: Duration,
        default_retry: Arc<dyn RetryStrategy>,
        mutation_tokens: bool,
    ) -> Self {
        Self {
            mux,
            collections,
            default_timeout,
            durable_timeout,
            default_retry,
            mutation_tokens,
        }
    }

    pub fn mux(&self) -> &Arc<KvMux> {
        &self.mux
    }

    pub fn collections(&self) -> &Arc<CollectionsComponent> {
        &self.collections
    }

    fn deadline(&self, opts: &OpOptions, durable: bool) -> Instant {
        let fallback = if durable { self.durable_timeout } else { self.default_timeout };
        Instant::now() + opts.timeout.unwrap_or(fallback)
    }

    fn build_request(
        &self,
        packet: Packet,
        opts: &OpOptions,
        dispatch: Dispatch,
        callback: impl FnOnce(CoreResult<Response>) + Send + 'static,
    ) -> Arc<Request> {
        let strategy = opts.retry_strategy.clone().unwrap_or_else(|| self.default_retry.clone());
        let mut req = Request::new(packet, callback)
            .with_idempotent(dispatch.idempotent)
            .with_replica_idx(dispatch.replica_idx)
            .with_retry_strategy(strategy)
            .with_deadline(self.deadline(opts, dispatch.durable))
            .with_collection(opts.scope.clone(), opts.collection.clone());
        if let Some(id) = opts.collection_id {
            req = req.with_collection_id(id);
        }
        Arc::new(req)
    }

    /// Sends `packet` and waits for its single response.
    pub(crate) async fn execute(&self, packet: Packet, opts: &OpOptions, dispatch: Dispatch) -> CoreResult<Completed> {
        let started = Instant::now();
        let (tx, rx) = oneshot::channel();
        let req = self.build_request(packet, opts, dispatch, move |r| {
            let _ = tx.send(r);
        });
        let command = req.command();
        req.start_timer();
        let pending = PendingOp::new(req.clone());
        if let Err(e) = self.collections.dispatch(&req) {
            req.internal_cancel();
            return Err(e);
        }

        let result = rx.await.unwrap_or_else(|_| Err(CoreError::canceled()));
        cbcore_telemetry::record_kv_operation(
            command.name(),
            result.is_ok(),
            started.elapsed().as_secs_f64() * 1000.0,
        );
        let vbucket = pending.request().vbucket();
        result.map(|resp| Completed { resp, vbucket })
    }

    /// Fails with `FeatureNotAvailable` when the cluster is known not to
    /// support a capability.
    pub(crate) fn require(&self, what: &str, status: impl Fn(&crate::kv::mux::MuxState) -> CapabilityStatus) -> CoreResult<()> {
        let state = self.mux.state()?;
        if status(&state) == CapabilityStatus::Unsupported {
            return Err(CoreError::message(
                ErrorKind::FeatureNotAvailable,
                format!("{what} is not supported by the cluster"),
            ));
        }
        Ok(())
    }

    pub(crate) fn mutation_token(&self, completed: &Completed) -> Option<MutationToken> {
        if !self.mutation_tokens {
            return None;
        }
        MutationToken::from_extras(completed.vbucket, &completed.resp.packet.extras)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutation_token_needs_sixteen_bytes() {
        let mut extras = 7u64.to_be_bytes().to_vec();
        extras.extend_from_slice(&42u64.to_be_bytes());
        let token = MutationToken::from_extras(3, &extras).unwrap();
        assert_eq!(token, MutationToken { vbucket: 3, vbuuid: 7, seqno: 42 });
        assert!(MutationToken::from_extras(3, &extras[..12]).is_none());
    }

    #[test]
    fn test_be_readers() {
        let buf = [0x00, 0x01, 0x00, 0x00, 0x00, 0x02];
        assert_eq!(be_u16(&buf, 0), Some(1));
        assert_eq!(be_u32(&buf, 2), Some(2));
        assert_eq!(be_u64(&buf, 0), None);
    }
}
