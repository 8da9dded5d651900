//! One memcached-protocol connection.
//!
//! A client owns the write half of a socket behind an async lock and runs a
//! reader task over the read half. Requests are correlated by opaque through
//! the op map; streaming events are handed to a separate task so a slow
//! consumer back-pressures the socket without blocking control traffic.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use cbcore_config::CircuitBreakerConfig;
use cbcore_errors::{CoreError, CoreResult, ErrorKind, is_success_for, kind_for_response};
use cbcore_memd::{DATATYPE_COMPRESSED, HelloFeature, Magic, MemdCodec, MemdError, Opcode, Packet};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::op_map::OpMap;
use super::request::{Request, Response, WaitingIn};
use super::transport::{BoxedStream, Connection};
use crate::circuit_breaker::{
    BreakerState, CircuitBreaker, CompletionCallback, LazyCircuitBreaker, NoopCircuitBreaker,
    default_completion_callback,
};
use crate::retry::FailFastRetryStrategy;
use crate::zombie_logger::{ZombieEntry, ZombieLogger};

/// Stream-end status reported for a stream the client closed.
const STREAM_END_CLOSED: u32 = 0x01;

/// Consulted for every failed response before the request sees it.
///
/// Returns `None` when the handler took the request over (retry, reroute),
/// otherwise the error to complete the request with.
pub type PostErrorHandler = Arc<dyn Fn(Option<&Response>, &Arc<Request>, CoreError) -> Option<CoreError> + Send + Sync>;

/// Receives server-initiated requests such as cluster map notifications.
pub type ServerRequestHandler = Arc<dyn Fn(&Response) + Send + Sync>;

/// Hands every error straight back to the request.
pub fn passthrough_error_handler() -> PostErrorHandler {
    Arc::new(|_, _, err| Some(err))
}

#[derive(Clone)]
pub struct MemdClientProps {
    pub client_id: String,
    pub dcp_queue_size: usize,
    pub compression_min_size: usize,
    pub compression_min_ratio: f64,
    pub disable_decompression: bool,
    pub breaker: CircuitBreakerConfig,
    pub completion: CompletionCallback,
    pub post_error: PostErrorHandler,
    pub server_request: Option<ServerRequestHandler>,
    pub zombie_logger: Option<Arc<ZombieLogger>>,
}

impl MemdClientProps {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            dcp_queue_size: 2048,
            compression_min_size: 32,
            compression_min_ratio: 0.83,
            disable_decompression: false,
            breaker: CircuitBreakerConfig {
                enabled: false,
                ..Default::default()
            },
            completion: default_completion_callback(),
            post_error: passthrough_error_handler(),
            server_request: None,
            zombie_logger: None,
        }
    }
}

struct ClientState {
    op_map: OpMap,
    next_opaque: u32,
    closed: bool,
    close_error: Option<CoreError>,
}

struct DcpItem {
    resp: Response,
    packet_len: usize,
    internal: bool,
}

type Writer = FramedWrite<WriteHalf<BoxedStream>, MemdCodec>;
type Reader = FramedRead<ReadHalf<BoxedStream>, MemdCodec>;

pub struct MemdClient {
    address: String,
    local_addr: String,
    conn_id: String,
    codec: MemdCodec,
    writer: tokio::sync::Mutex<Writer>,
    state: Mutex<ClientState>,
    features: RwLock<Vec<HelloFeature>>,
    post_error: RwLock<PostErrorHandler>,
    breaker: Box<dyn CircuitBreaker>,
    canary_timeout: Duration,
    props: MemdClientProps,
    last_activity: Mutex<Instant>,
    shutdown: CancellationToken,
    closed: CancellationToken,
    dcp_ack_size: AtomicUsize,
    dcp_flow_recv: AtomicUsize,
    stream_end_not_supported: AtomicBool,
}

impl fmt::Debug for MemdClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemdClient")
            .field("address", &self.address)
            .field("conn_id", &self.conn_id)
            .finish()
    }
}

impl MemdClient {
    /// Wraps a connected stream and starts its reader task.
    pub fn start(conn: Connection, props: MemdClientProps) -> Arc<Self> {
        let codec = MemdCodec::new();
        let (read_half, write_half) = tokio::io::split(conn.stream);
        let conn_id = format!("{}/{:016x}", props.client_id, rand::random::<u64>());
        let address = conn.remote_addr;

        let client = Arc::new_cyclic(|weak: &Weak<MemdClient>| {
            let breaker: Box<dyn CircuitBreaker> = if props.breaker.enabled {
                let weak = weak.clone();
                Box::new(LazyCircuitBreaker::new(
                    address.clone(),
                    props.breaker.clone(),
                    props.completion.clone(),
                    move || {
                        if let Some(client) = weak.upgrade()
                            && let Ok(handle) = tokio::runtime::Handle::try_current()
                        {
                            handle.spawn(client.send_canary());
                        }
                    },
                ))
            } else {
                Box::new(NoopCircuitBreaker)
            };

            Self {
                address: address.clone(),
                local_addr: conn.local_addr,
                conn_id,
                codec: codec.clone(),
                writer: tokio::sync::Mutex::new(FramedWrite::new(write_half, codec.clone())),
                state: Mutex::new(ClientState {
                    op_map: OpMap::new(),
                    next_opaque: 0,
                    closed: false,
                    close_error: None,
                }),
                features: RwLock::new(Vec::new()),
                post_error: RwLock::new(props.post_error.clone()),
                breaker,
                canary_timeout: props.breaker.canary_timeout,
                props,
                last_activity: Mutex::new(Instant::now()),
                shutdown: CancellationToken::new(),
                closed: CancellationToken::new(),
                dcp_ack_size: AtomicUsize::new(0),
                dcp_flow_recv: AtomicUsize::new(0),
                stream_end_not_supported: AtomicBool::new(false),
            }
        });

        let reader = FramedRead::new(read_half, codec);
        tokio::spawn(client.clone().read_loop(reader));
        debug!(address = %client.address, conn_id = %client.conn_id, "Memd client started");
        client
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn local_address(&self) -> &str {
        &self.local_addr
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    pub fn supports_feature(&self, feature: HelloFeature) -> bool {
        self.features.read().contains(&feature)
    }

    pub fn features(&self) -> Vec<HelloFeature> {
        self.features.read().clone()
    }

    /// Records the negotiated features and switches the codec accordingly.
    pub(crate) fn set_features(&self, features: Vec<HelloFeature>) {
        if features.contains(&HelloFeature::COLLECTIONS) {
            self.codec.enable_collections();
        }
        *self.features.write() = features;
    }

    /// Replaces the handler consulted for failed responses.
    pub(crate) fn set_post_error_handler(&self, handler: PostErrorHandler) {
        *self.post_error.write() = handler;
    }

    fn post_error_handler(&self) -> PostErrorHandler {
        self.post_error.read().clone()
    }

    /// Acknowledges consumed DCP bytes once `ack_size` have been received.
    pub(crate) fn enable_dcp_buffer_ack(&self, ack_size: usize) {
        self.dcp_ack_size.store(ack_size, Ordering::Release);
    }

    pub(crate) fn set_stream_end_not_supported(&self, not_supported: bool) {
        self.stream_end_not_supported.store(not_supported, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Resolves once the reader has exited and in-flight requests are drained.
    pub async fn wait_closed(&self) {
        self.closed.cancelled().await
    }

    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Closes the connection. In-flight requests complete with `err`, or EOF.
    pub fn close(&self, err: Option<CoreError>) {
        {
            let mut state = self.state.lock();
            state.closed = true;
            if state.close_error.is_none() {
                state.close_error = err;
            }
        }
        self.shutdown.cancel();
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().op_map.len()
    }

    /// Closes once the in-flight requests have completed or `timeout` passes.
    pub async fn graceful_close(self: Arc<Self>, err: Option<CoreError>, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut tick = tokio::time::interval(Duration::from_millis(10));
        while !self.is_closed() && self.in_flight() > 0 {
            tokio::select! {
                _ = self.closed.cancelled() => break,
                _ = tokio::time::sleep_until(deadline) => break,
                _ = tick.tick() => {}
            }
        }
        debug!(address = %self.address, conn_id = %self.conn_id, "Memd client closing gracefully");
        self.close(err);
    }

    /// Writes `req`, unless the breaker is open, in which case the request
    /// is cancelled with `CircuitBreakerOpen`.
    pub async fn send_request(self: &Arc<Self>, req: &Arc<Request>) -> CoreResult<()> {
        if !self.breaker.allows_request() {
            debug!(address = %self.address, command = %req.command().name(), "Circuit breaker interrupting request");
            req.cancel(CoreError::new(ErrorKind::CircuitBreakerOpen));
            return Ok(());
        }
        self.internal_send(req).await
    }

    async fn internal_send(self: &Arc<Self>, req: &Arc<Request>) -> CoreResult<()> {
        let packet = self.take_ownership(req)?;
        let packet = self.maybe_compress(packet);
        trace!(
            parent: req.span(),
            local = %self.local_addr,
            remote = %self.address,
            opaque = packet.opaque,
            "Writing request"
        );

        let result = {
            let mut writer = self.writer.lock().await;
            writer.send(packet).await
        };
        if let Err(e) = result {
            debug!(address = %self.address, error = %e, "Memd client write failure");
            if !self.state.lock().op_map.remove_request(req) {
                return Ok(());
            }
            self.release(req);
            return Err(match e {
                MemdError::Io(io) => CoreError::message(ErrorKind::ShortWrite, io.to_string()),
                other => other.into(),
            });
        }
        Ok(())
    }

    fn take_ownership(self: &Arc<Self>, req: &Arc<Request>) -> CoreResult<Packet> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(match &state.close_error {
                Some(e) => CoreError::message(ErrorKind::ClientClosed, e.to_string()),
                None => CoreError::new(ErrorKind::ClientClosed),
            });
        }
        {
            let mut waiting = req.waiting_in.lock();
            if req.is_completed() {
                return Err(CoreError::canceled());
            }
            if !matches!(*waiting, WaitingIn::Idle) {
                return Err(CoreError::message(ErrorKind::InvalidArgument, "request already dispatched"));
            }
            *waiting = WaitingIn::Client(Arc::downgrade(self));
        }

        state.next_opaque = state.next_opaque.wrapping_add(1);
        let opaque = state.next_opaque;
        let packet = {
            let mut p = req.packet.lock();
            p.opaque = opaque;
            p.clone()
        };
        req.set_connection_info(super::request::ConnectionInfo {
            last_dispatched_to: self.address.clone(),
            last_dispatched_from: self.local_addr.clone(),
            last_connection_id: self.conn_id.clone(),
        });
        state.op_map.add(opaque, req.clone());
        Ok(packet)
    }

    /// Clears the request's owner if it is still this client.
    fn release(&self, req: &Request) {
        let mut waiting = req.waiting_in.lock();
        if let WaitingIn::Client(owner) = &*waiting
            && std::ptr::eq(owner.as_ptr(), self)
        {
            *waiting = WaitingIn::Idle;
        }
    }

    fn maybe_compress(&self, mut packet: Packet) -> Packet {
        if !self.supports_feature(HelloFeature::SNAPPY)
            || packet.datatype & DATATYPE_COMPRESSED != 0
            || packet.value.len() <= self.props.compression_min_size
            || !packet.command.is_compressible()
        {
            return packet;
        }
        let original = packet.value.len();
        match snap::raw::Encoder::new().compress_vec(&packet.value) {
            Ok(compressed) if compressed.len() as f64 / original as f64 <= self.props.compression_min_ratio => {
                packet.value = compressed.into();
                packet.datatype |= DATATYPE_COMPRESSED;
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "Snappy compression failed, sending uncompressed"),
        }
        packet
    }

    /// Removes a cancelled request from the op map.
    pub(crate) fn cancel_request(&self, req: &Request, err: &CoreError) -> bool {
        let removed = {
            let mut state = self.state.lock();
            if state.closed {
                debug!("Attempted to remove op from drained op map");
                return false;
            }
            state.op_map.remove_request(req)
        };
        if self.breaker.completion_callback(Some(err)) {
            self.breaker.mark_successful();
        } else {
            self.breaker.mark_failure();
        }
        removed
    }

    /// Routes `err` through the post-error handler and completes the request
    /// unless the handler took it over.
    pub(crate) fn route_error(&self, resp: Option<&Response>, req: &Arc<Request>, err: CoreError) {
        if let Some(err) = (self.post_error_handler())(resp, req, err) {
            req.try_callback(Err(err));
        }
    }

    /// Writes a packet that expects no response.
    async fn write_raw(&self, packet: Packet) -> CoreResult<()> {
        let mut writer = self.writer.lock().await;
        writer.send(packet).await.map_err(CoreError::from)
    }

    async fn send_canary(self: Arc<Self>) {
        let (tx, rx) = oneshot::channel();
        let req = Arc::new(
            Request::new(Packet::request(Opcode::NOOP), move |r| {
                let _ = tx.send(r.map(|_| ()));
            })
            .with_retry_strategy(Arc::new(FailFastRetryStrategy)),
        );
        debug!(address = %self.address, "Sending canary NOOP");
        if self.internal_send(&req).await.is_err() {
            req.internal_cancel();
            self.breaker.mark_failure();
            return;
        }
        match tokio::time::timeout(self.canary_timeout, rx).await {
            Ok(Ok(Ok(()))) => {
                debug!(address = %self.address, "Canary NOOP succeeded");
                self.breaker.mark_successful();
            }
            Ok(_) => self.breaker.mark_failure(),
            Err(_) => {
                req.internal_cancel();
                debug!(address = %self.address, "Canary NOOP timed out");
                self.breaker.mark_failure();
            }
        }
    }

    async fn read_loop(self: Arc<Self>, mut reader: Reader) {
        let (dcp_tx, dcp_rx) = mpsc::channel(self.props.dcp_queue_size.max(1));
        let dcp_task = tokio::spawn(self.clone().dcp_loop(dcp_rx));

        let mut read_error = None;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                next = reader.next() => next,
            };
            let packet = match next {
                Some(Ok(packet)) => packet,
                Some(Err(e)) => {
                    if !self.is_closed() {
                        warn!(conn_id = %self.conn_id, error = %e, "Memd client read failure");
                    }
                    read_error = Some(CoreError::from(e));
                    break;
                }
                None => break,
            };
            *self.last_activity.lock() = Instant::now();
            if !self.handle_packet(packet, &dcp_tx).await {
                break;
            }
        }

        let close_error = {
            let mut state = self.state.lock();
            state.closed = true;
            state.close_error.clone()
        };
        dcp_task.abort();
        let _ = dcp_task.await;
        drop(dcp_tx);
        if let Err(e) = self.writer.lock().await.close().await {
            debug!(conn_id = %self.conn_id, error = %e, "Failed to shut down client connection");
        }

        let err = close_error
            .or(read_error)
            .unwrap_or_else(|| CoreError::message(ErrorKind::SocketClosed, "EOF"));
        let drained = self.state.lock().op_map.drain();
        if !drained.is_empty() {
            debug!(conn_id = %self.conn_id, count = drained.len(), "Draining in-flight requests");
        }
        for req in drained {
            self.release(&req);
            self.route_error(None, &req, err.clone());
        }

        info!(address = %self.address, conn_id = %self.conn_id, "Memd client closed");
        self.closed.cancel();
    }

    /// Returns `false` if the client is shutting down.
    async fn handle_packet(&self, packet: Packet, dcp_tx: &mpsc::Sender<DcpItem>) -> bool {
        let packet_len = packet.wire_len;
        let resp = Response {
            packet,
            source_addr: self.address.clone(),
            source_conn_id: self.conn_id.clone(),
        };

        if resp.packet.magic == Magic::ServerReq {
            match &self.props.server_request {
                Some(handler) => handler(&resp),
                None => debug!(command = %resp.packet.command.name(), "Ignoring server request"),
            }
            return true;
        }

        if resp.packet.command == Opcode::DCP_NOOP {
            let reply = Packet::response_to(&resp.packet, cbcore_memd::Status::SUCCESS);
            if let Err(e) = self.write_raw(reply).await {
                warn!(conn_id = %self.conn_id, error = %e, "Failed to dispatch DCP noop reply");
            }
            return true;
        }

        // Servers without stream-end-on-close stop the stream synchronously
        // but never say so; synthesize the end for the open stream.
        if resp.packet.is_response()
            && resp.packet.command == Opcode::DCP_CLOSE_STREAM
            && self.stream_end_not_supported.load(Ordering::Acquire)
            && let Some(end) = self.synthesize_stream_end(resp.packet.opaque)
        {
            let item = DcpItem {
                resp: end,
                packet_len,
                internal: true,
            };
            if !self.enqueue_dcp(dcp_tx, item).await {
                return false;
            }
        }

        if !resp.packet.is_response() && resp.packet.command.is_dcp_event() {
            let item = DcpItem {
                resp,
                packet_len,
                internal: false,
            };
            return self.enqueue_dcp(dcp_tx, item).await;
        }

        self.resolve(resp);
        true
    }

    fn synthesize_stream_end(&self, close_opaque: u32) -> Option<Response> {
        let state = self.state.lock();
        let vbucket = state.op_map.find(close_opaque)?.vbucket();
        let stream = state.op_map.find_open_stream(vbucket)?;
        let packet = Packet::request(Opcode::DCP_STREAM_END)
            .with_vbucket(vbucket)
            .with_opaque(stream.opaque())
            .with_extras(STREAM_END_CLOSED.to_be_bytes().to_vec());
        Some(Response {
            packet,
            source_addr: self.address.clone(),
            source_conn_id: self.conn_id.clone(),
        })
    }

    async fn enqueue_dcp(&self, tx: &mpsc::Sender<DcpItem>, item: DcpItem) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            sent = tx.send(item) => sent.is_ok(),
        }
    }

    async fn dcp_loop(self: Arc<Self>, mut rx: mpsc::Receiver<DcpItem>) {
        while let Some(item) = rx.recv().await {
            self.resolve(item.resp);
            if !item.internal && self.dcp_ack_size.load(Ordering::Acquire) > 0 {
                self.maybe_send_dcp_buffer_ack(item.packet_len).await;
            }
        }
    }

    async fn maybe_send_dcp_buffer_ack(&self, packet_len: usize) {
        let received = self.dcp_flow_recv.fetch_add(packet_len, Ordering::AcqRel) + packet_len;
        if received < self.dcp_ack_size.load(Ordering::Acquire) {
            return;
        }
        let extras = (received as u32).to_be_bytes().to_vec();
        if let Err(e) = self
            .write_raw(Packet::request(Opcode::DCP_BUFFER_ACK).with_extras(extras))
            .await
        {
            warn!(conn_id = %self.conn_id, error = %e, "Failed to dispatch DCP buffer ack");
        }
        self.dcp_flow_recv.fetch_sub(received, Ordering::AcqRel);
    }

    fn resolve(&self, mut resp: Response) {
        let opaque = resp.packet.opaque;
        let success = resp.packet.status.is_success();
        trace!(command = %resp.packet.command.name(), opaque, status = %resp.packet.status, "Handling response");

        let req = self
            .state
            .lock()
            .op_map
            .find_and_maybe_remove(opaque, |r| r.is_persistent() && success);
        let Some(req) = req else {
            debug!(conn_id = %self.conn_id, opaque, "Received response with no corresponding request");
            self.record_zombie(&resp);
            return;
        };
        if !req.is_persistent() || !success {
            self.release(&req);
        }

        let mut decode_err = None;
        if resp.packet.datatype & DATATYPE_COMPRESSED != 0 && !self.props.disable_decompression {
            match snap::raw::Decoder::new().decompress_vec(&resp.packet.value) {
                Ok(value) => {
                    resp.packet.value = value.into();
                    resp.packet.datatype &= !DATATYPE_COMPRESSED;
                }
                Err(e) => {
                    debug!(opaque, error = %e, "Failed to decompress value from the server");
                    decode_err = Some(CoreError::protocol(format!("failed to decompress value: {e}")));
                }
            }
        }

        let command = resp.packet.command;
        let status = resp.packet.status;
        let err = if decode_err.is_some() {
            decode_err
        } else if resp.packet.is_response() && !is_success_for(command, status) {
            Some(match kind_for_response(command, status) {
                Some(kind) => CoreError::new(kind),
                None => CoreError::message(ErrorKind::Unknown, format!("unknown status {status}")),
            })
        } else {
            None
        };

        if self.breaker.completion_callback(err.as_ref()) {
            self.breaker.mark_successful();
        } else {
            self.breaker.mark_failure();
        }

        let delivered = match err {
            Some(err) => match (self.post_error_handler())(Some(&resp), &req, err) {
                Some(err) => req.try_callback(Err(err)),
                None => {
                    trace!(opaque, "Routing callback intercepted response");
                    return;
                }
            },
            None => req.try_callback(Ok(resp.clone())),
        };

        if !delivered {
            self.record_zombie(&resp);
        }
        if req.is_persistent() && req.is_completed() && self.state.lock().op_map.remove_request(&req) {
            self.release(&req);
        }
    }

    fn record_zombie(&self, resp: &Response) {
        if let Some(logger) = &self.props.zombie_logger {
            logger.record(ZombieEntry {
                operation_name: resp.packet.command.name().to_string(),
                last_local_id: self.conn_id.clone(),
                operation_id: format!("0x{:x}", resp.packet.opaque),
                last_remote_socket: self.address.clone(),
                server_duration_us: resp.packet.server_duration.map(|d| d.as_micros() as u64).unwrap_or(0),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use cbcore_memd::Status;
    use tokio::net::TcpListener;

    use super::*;
    use crate::kv::transport::{Connector, TcpConnector};

    type ServerConn = (FramedRead<tokio::net::tcp::OwnedReadHalf, MemdCodec>, FramedWrite<tokio::net::tcp::OwnedWriteHalf, MemdCodec>);

    async fn connected_pair(props: MemdClientProps) -> (Arc<MemdClient>, ServerConn) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let conn = TcpConnector
            .connect(&addr, Instant::now() + Duration::from_secs(1))
            .await
            .unwrap();
        let client = MemdClient::start(conn, props);
        let (r, w) = accept.await.unwrap().into_split();
        (client, (FramedRead::new(r, MemdCodec::new()), FramedWrite::new(w, MemdCodec::new())))
    }

    fn get_request(key: &str) -> (Arc<Request>, oneshot::Receiver<CoreResult<Response>>) {
        let (tx, rx) = oneshot::channel();
        let req = Arc::new(Request::new(Packet::request(Opcode::GET).with_key(key.to_string()), move |r| {
            let _ = tx.send(r);
        }));
        (req, rx)
    }

    #[tokio::test]
    async fn test_request_response_roundtrip() {
        let (client, (mut server_rx, mut server_tx)) = connected_pair(MemdClientProps::new("test")).await;
        let (req, rx) = get_request("k1");
        client.send_request(&req).await.unwrap();

        let seen = server_rx.next().await.unwrap().unwrap();
        assert_eq!(seen.command, Opcode::GET);
        assert_eq!(&seen.key[..], b"k1");
        let reply = Packet::response_to(&seen, Status::SUCCESS).with_value(b"v".to_vec()).with_cas(7);
        server_tx.send(reply).await.unwrap();

        let resp = rx.await.unwrap().unwrap();
        assert_eq!(resp.packet.cas, 7);
        assert_eq!(&resp.packet.value[..], b"v");
        assert_eq!(req.connection_info().last_dispatched_to, client.address());
    }

    #[tokio::test]
    async fn test_opaques_increase() {
        let (client, (mut server_rx, _server_tx)) = connected_pair(MemdClientProps::new("test")).await;
        let mut last = 0;
        for i in 0..5 {
            let (req, _rx) = get_request(&format!("k{i}"));
            client.send_request(&req).await.unwrap();
            let seen = server_rx.next().await.unwrap().unwrap();
            assert!(seen.opaque > last);
            last = seen.opaque;
        }
    }

    #[tokio::test]
    async fn test_status_error_is_classified() {
        let (client, (mut server_rx, mut server_tx)) = connected_pair(MemdClientProps::new("test")).await;
        let (req, rx) = get_request("missing");
        client.send_request(&req).await.unwrap();
        let seen = server_rx.next().await.unwrap().unwrap();
        server_tx.send(Packet::response_to(&seen, Status::KEY_NOT_FOUND)).await.unwrap();
        let err = rx.await.unwrap().unwrap_err();
        assert!(err.is(ErrorKind::DocumentNotFound));
    }

    #[tokio::test]
    async fn test_close_drains_in_flight() {
        let (client, (mut server_rx, server_tx)) = connected_pair(MemdClientProps::new("test")).await;
        let (req, rx) = get_request("k1");
        client.send_request(&req).await.unwrap();
        let _ = server_rx.next().await.unwrap().unwrap();
        drop(server_tx);
        drop(server_rx);

        let err = rx.await.unwrap().unwrap_err();
        assert!(err.is(ErrorKind::SocketClosed));
        client.wait_closed().await;
        let (late, _rx) = get_request("k2");
        assert!(client.send_request(&late).await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_removes_from_op_map() {
        let logger = Arc::new(ZombieLogger::new(Duration::from_secs(10), 10));
        let mut props = MemdClientProps::new("test");
        props.zombie_logger = Some(logger.clone());
        let (client, (mut server_rx, mut server_tx)) = connected_pair(props).await;
        let (req, rx) = get_request("k1");
        client.send_request(&req).await.unwrap();
        let seen = server_rx.next().await.unwrap().unwrap();

        assert!(req.cancel(CoreError::canceled()));
        assert!(rx.await.unwrap().unwrap_err().is(ErrorKind::RequestCanceled));
        assert!(client.state.lock().op_map.is_empty());

        server_tx.send(Packet::response_to(&seen, Status::SUCCESS)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let flushed = logger.flush().unwrap();
        assert!(flushed.contains("Get"));
    }

    #[tokio::test]
    async fn test_compression_thresholds() {
        let (client, (mut server_rx, _server_tx)) = connected_pair(MemdClientProps::new("test")).await;
        client.set_features(vec![HelloFeature::SNAPPY]);

        let small = Arc::new(Request::new(Packet::request(Opcode::SET).with_key("a").with_value(vec![b'a'; 8]), |_| {}));
        client.send_request(&small).await.unwrap();
        let seen = server_rx.next().await.unwrap().unwrap();
        assert_eq!(seen.datatype & DATATYPE_COMPRESSED, 0);

        let big = Arc::new(Request::new(Packet::request(Opcode::SET).with_key("b").with_value(vec![b'a'; 4096]), |_| {}));
        client.send_request(&big).await.unwrap();
        let seen = server_rx.next().await.unwrap().unwrap();
        assert_ne!(seen.datatype & DATATYPE_COMPRESSED, 0);
        let raw = snap::raw::Decoder::new().decompress_vec(&seen.value).unwrap();
        assert_eq!(raw.len(), 4096);

        let random: Vec<u8> = (0..4096).map(|_| rand::random::<u8>()).collect();
        let noisy = Arc::new(Request::new(Packet::request(Opcode::SET).with_key("c").with_value(random), |_| {}));
        client.send_request(&noisy).await.unwrap();
        let seen = server_rx.next().await.unwrap().unwrap();
        assert_eq!(seen.datatype & DATATYPE_COMPRESSED, 0);
    }

    #[tokio::test]
    async fn test_dcp_noop_answered_inline() {
        let (_client, (mut server_rx, mut server_tx)) = connected_pair(MemdClientProps::new("test")).await;
        server_tx
            .send(Packet::request(Opcode::DCP_NOOP).with_opaque(99))
            .await
            .unwrap();
        let reply = server_rx.next().await.unwrap().unwrap();
        assert_eq!(reply.command, Opcode::DCP_NOOP);
        assert!(reply.is_response());
        assert_eq!(reply.opaque, 99);
    }

    #[tokio::test]
    async fn test_server_request_handler() {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut props = MemdClientProps::new("test");
        props.server_request = Some(Arc::new(move |resp: &Response| {
            let _ = tx.send(resp.packet.command);
        }));
        let (_client, (_server_rx, mut server_tx)) = connected_pair(props).await;
        let mut notif = Packet::request(cbcore_memd::CLUSTER_MAP_CHANGE_NOTIFICATION);
        notif.magic = Magic::ServerReq;
        server_tx.send(notif).await.unwrap();
        let cmd = tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(1)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cmd, cbcore_memd::CLUSTER_MAP_CHANGE_NOTIFICATION);
    }

    #[tokio::test]
    async fn test_undecodable_compressed_value_fails_request() {
        let (client, (mut server_rx, mut server_tx)) = connected_pair(MemdClientProps::new("test")).await;
        let (req, rx) = get_request("k1");
        client.send_request(&req).await.unwrap();

        let seen = server_rx.next().await.unwrap().unwrap();
        let reply = Packet::response_to(&seen, Status::SUCCESS)
            .with_datatype(DATATYPE_COMPRESSED)
            .with_value(vec![0xff, 0xff, 0xff, 0xff, 0x01]);
        server_tx.send(reply).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), rx).await.unwrap().unwrap();
        let err = result.unwrap_err();
        assert!(err.is(ErrorKind::Protocol));
        assert!(client.state.lock().op_map.is_empty());
    }
}
