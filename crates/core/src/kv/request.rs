//! A pending key/value request and its completion rules.
//!
//! `completed` is a one-shot flag. Whoever flips it owns the terminal
//! delivery: the response path, cancellation or the deadline timer.
//! Persistent requests keep receiving responses until that flip.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use cbcore_errors::{CoreError, CoreResult, RetryReason, TimeoutError};
use cbcore_memd::{Opcode, Packet};
use parking_lot::{Mutex, ReentrantMutex};
use tokio::task::AbortHandle;
use uuid::Uuid;

use super::client::MemdClient;
use super::queue::OpQueue;
use crate::retry::{RetryRequest, RetryState, RetryStrategy};

const PINNED_TO_ADDRESS: i32 = i32::MIN;

/// A response paired with where it came from.
#[derive(Debug, Clone)]
pub struct Response {
    pub packet: Packet,
    pub source_addr: String,
    pub source_conn_id: String,
}

/// One-shot completion callback.
pub type ResponseCallback = Box<dyn FnOnce(CoreResult<Response>) + Send>;

/// Receiver for the responses of a persistent request.
pub trait StreamSink: Send + Sync {
    /// Handles one response. Returning `true` finishes the request.
    fn on_response(&self, resp: Response) -> bool;
    /// Called exactly once, after the last `on_response`.
    fn end(&self, err: Option<CoreError>);
}

enum Handler {
    Once(Mutex<Option<ResponseCallback>>),
    Stream {
        sink: Arc<dyn StreamSink>,
        lock: ReentrantMutex<()>,
    },
}

/// Where a request currently sits.
pub(crate) enum WaitingIn {
    Idle,
    Queue(Weak<OpQueue>),
    Client(Weak<MemdClient>),
}

/// Last dispatch details, reported in errors.
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
    pub last_dispatched_to: String,
    pub last_dispatched_from: String,
    pub last_connection_id: String,
}

pub struct Request {
    pub(crate) packet: Mutex<Packet>,
    command: Opcode,
    replica_idx: AtomicI32,
    persistent: bool,
    idempotent: bool,
    handler: Handler,
    completed: AtomicBool,
    created_at: Instant,
    dispatch_time: Mutex<Option<Instant>>,
    pub(crate) waiting_in: Mutex<WaitingIn>,
    retry: Mutex<RetryState>,
    retry_strategy: Option<Arc<dyn RetryStrategy>>,
    deadline: Option<Instant>,
    timer: Mutex<Option<AbortHandle>>,
    conn_info: Mutex<ConnectionInfo>,
    scope_name: String,
    collection_name: String,
    explicit_collection_id: bool,
    operation_id: String,
    span: tracing::Span,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("command", &self.command)
            .field("opaque", &self.opaque())
            .field("persistent", &self.persistent)
            .field("completed", &self.is_completed())
            .finish()
    }
}

impl Request {
    fn with_handler(packet: Packet, handler: Handler, persistent: bool) -> Self {
        let command = packet.command;
        Self {
            packet: Mutex::new(packet),
            command,
            replica_idx: AtomicI32::new(0),
            persistent,
            idempotent: false,
            handler,
            completed: AtomicBool::new(false),
            created_at: Instant::now(),
            dispatch_time: Mutex::new(None),
            waiting_in: Mutex::new(WaitingIn::Idle),
            retry: Mutex::new(RetryState::default()),
            retry_strategy: None,
            deadline: None,
            timer: Mutex::new(None),
            conn_info: Mutex::new(ConnectionInfo::default()),
            scope_name: String::new(),
            collection_name: String::new(),
            explicit_collection_id: false,
            operation_id: Uuid::new_v4().to_string(),
            span: tracing::debug_span!("kv_request", command = command.name()),
        }
    }

    /// A request completed by exactly one callback invocation.
    pub fn new(packet: Packet, callback: impl FnOnce(CoreResult<Response>) + Send + 'static) -> Self {
        Self::with_handler(packet, Handler::Once(Mutex::new(Some(Box::new(callback)))), false)
    }

    /// A persistent request whose responses flow into `sink`.
    pub fn new_stream(packet: Packet, sink: Arc<dyn StreamSink>) -> Self {
        Self::with_handler(
            packet,
            Handler::Stream {
                sink,
                lock: ReentrantMutex::new(()),
            },
            true,
        )
    }

    /// Negative values `-n-1` pin the request to server index `n`.
    pub fn with_replica_idx(self, idx: i32) -> Self {
        self.replica_idx.store(idx, Ordering::Relaxed);
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

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_collection(mut self, scope: impl Into<String>, collection: impl Into<String>) -> Self {
        self.scope_name = scope.into();
        self.collection_name = collection.into();
        self
    }

    /// Sends with a known collection id, skipping name resolution.
    pub fn with_collection_id(mut self, id: u32) -> Self {
        self.packet.get_mut().collection_id = id;
        self.explicit_collection_id = true;
        self
    }

    pub fn command(&self) -> Opcode {
        self.command
    }

    pub fn opaque(&self) -> u32 {
        self.packet.lock().opaque
    }

    pub fn vbucket(&self) -> u16 {
        self.packet.lock().vbucket
    }

    pub fn key(&self) -> bytes::Bytes {
        self.packet.lock().key.clone()
    }

    pub fn replica_idx(&self) -> i32 {
        self.replica_idx.load(Ordering::Relaxed)
    }

    /// Marks the request as bound to the address it is dispatched to, so
    /// it is never rerouted.
    pub(crate) fn pin_to_address(&self) {
        self.replica_idx.store(PINNED_TO_ADDRESS, Ordering::Relaxed);
    }

    pub fn is_pinned_to_address(&self) -> bool {
        self.replica_idx() == PINNED_TO_ADDRESS
    }

    pub(crate) fn set_vbucket(&self, vbucket: u16) {
        self.packet.lock().vbucket = vbucket;
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn scope_name(&self) -> &str {
        &self.scope_name
    }

    pub fn collection_name(&self) -> &str {
        &self.collection_name
    }

    pub fn has_explicit_collection_id(&self) -> bool {
        self.explicit_collection_id
    }

    /// True if the request names something other than the default collection.
    pub fn names_non_default_collection(&self) -> bool {
        let scope = if self.scope_name.is_empty() { "_default" } else { &self.scope_name };
        let collection = if self.collection_name.is_empty() {
            "_default"
        } else {
            &self.collection_name
        };
        scope != "_default" || collection != "_default"
    }

    pub fn set_collection_id(&self, id: u32) {
        self.packet.lock().collection_id = id;
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn dispatch_time(&self) -> Option<Instant> {
        *self.dispatch_time.lock()
    }

    pub(crate) fn mark_dispatch_time(&self) {
        let mut t = self.dispatch_time.lock();
        if t.is_none() {
            *t = Some(Instant::now());
        }
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        self.conn_info.lock().clone()
    }

    pub(crate) fn set_connection_info(&self, info: ConnectionInfo) {
        *self.conn_info.lock() = info;
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub(crate) fn set_timer(&self, handle: AbortHandle) {
        let mut timer = self.timer.lock();
        if self.is_completed() {
            handle.abort();
        } else {
            *timer = Some(handle);
        }
    }

    /// Flips the completion flag. Only the caller that gets `true` may deliver.
    pub(crate) fn mark_completed(&self) -> bool {
        if self
            .completed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
        true
    }

    fn finish(&self, result: CoreResult<Response>) {
        match &self.handler {
            Handler::Once(cb) => {
                if let Some(cb) = cb.lock().take() {
                    cb(result);
                }
            }
            Handler::Stream { sink, lock } => {
                let _guard = lock.lock();
                match result {
                    Ok(resp) => {
                        sink.on_response(resp);
                        sink.end(None);
                    }
                    Err(e) => sink.end(Some(e)),
                }
            }
        }
    }

    /// Hands a result to the request. Returns `false` if the request had
    /// already completed and the result was dropped.
    pub(crate) fn try_callback(&self, result: CoreResult<Response>) -> bool {
        if let Handler::Stream { sink, lock } = &self.handler
            && let Ok(resp) = &result
        {
            let _guard = lock.lock();
            if self.is_completed() {
                return false;
            }
            if !sink.on_response(resp.clone()) {
                return true;
            }
            if self.mark_completed() {
                sink.end(None);
            }
            return true;
        }

        if !self.mark_completed() {
            return false;
        }
        self.finish(result);
        true
    }

    /// Completes the request with `err` and removes it from wherever it waits.
    pub fn cancel(&self, err: CoreError) -> bool {
        if !self.mark_completed() {
            return false;
        }
        self.detach(&err);
        self.finish(Err(err));
        true
    }

    /// Like [`Request::cancel`] without delivering anything.
    pub(crate) fn internal_cancel(&self) -> bool {
        if !self.mark_completed() {
            return false;
        }
        self.detach(&CoreError::canceled());
        true
    }

    fn detach(&self, err: &CoreError) {
        let waiting = std::mem::replace(&mut *self.waiting_in.lock(), WaitingIn::Idle);
        match waiting {
            WaitingIn::Idle => {}
            WaitingIn::Queue(queue) => {
                if let Some(queue) = queue.upgrade() {
                    queue.remove(self);
                }
            }
            WaitingIn::Client(client) => {
                if let Some(client) = client.upgrade() {
                    client.cancel_request(self, err);
                }
            }
        }
    }

    /// The error reported when the deadline passes.
    pub fn timeout_error(&self) -> CoreError {
        let info = self.connection_info();
        let ambiguous = self.command.is_mutation() && !info.last_dispatched_to.is_empty();
        let retry = self.retry.lock().clone();
        let mut err = TimeoutError::new(ambiguous);
        err.operation = self.command.name().to_string();
        err.operation_id = format!("0x{:x}", self.opaque());
        err.time_observed_us = self.created_at.elapsed().as_micros() as u64;
        err.retry_reasons = retry.reasons;
        err.retry_attempts = retry.attempts;
        err.last_dispatched_to = info.last_dispatched_to;
        err.last_dispatched_from = info.last_dispatched_from;
        err.last_connection_id = info.last_connection_id;
        err.into()
    }

    /// Arms the deadline timer. Must run inside a tokio runtime.
    pub(crate) fn start_timer(self: &Arc<Self>) {
        let Some(deadline) = self.deadline else {
            return;
        };
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline.into()).await;
            if let Some(req) = weak.upgrade() {
                let err = req.timeout_error();
                req.cancel(err);
            }
        });
        self.set_timer(handle.abort_handle());
    }
}

impl RetryRequest for Request {
    fn retry_attempts(&self) -> u32 {
        self.retry.lock().attempts
    }

    fn identifier(&self) -> String {
        self.operation_id.clone()
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
