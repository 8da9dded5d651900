//! One pooled connection slot of a pipeline.
//!
//! The client loops forever: dial, then feed requests from its pipeline's
//! queue to the connection until the connection dies (redial) or the
//! pipeline closes (exit). A takeover swaps the queue it pulls from
//! without touching the connection.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use cbcore_errors::{CoreError, CoreResult};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::client::MemdClient;
use super::queue::OpQueue;

/// Dials and bootstraps a connection for a pipeline client.
pub type DialFn = Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, CoreResult<Arc<MemdClient>>> + Send + Sync>;

/// Runs each time a client connects again after losing its connection.
pub type ReconnectFn = Arc<dyn Fn(&str) + Send + Sync>;

/// How long a gracefully closing connection waits for its in-flight requests.
pub(crate) const GRACEFUL_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

enum LoopExit {
    Reconnect,
    Shutdown,
}

pub struct PipelineClient {
    address: String,
    queue: Mutex<Arc<OpQueue>>,
    dial: DialFn,
    on_reconnect: Mutex<Option<ReconnectFn>>,
    state: Mutex<ConnState>,
    client: Mutex<Option<Arc<MemdClient>>>,
    last_error: Mutex<Option<CoreError>>,
    shutdown: CancellationToken,
    // Set when the client hands its connection to a graceful close.
    detach_connection: Mutex<bool>,
}

impl fmt::Debug for PipelineClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineClient")
            .field("address", &self.address)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl PipelineClient {
    pub fn new(address: impl Into<String>, queue: Arc<OpQueue>, dial: DialFn) -> Arc<Self> {
        Arc::new(Self {
            address: address.into(),
            queue: Mutex::new(queue),
            dial,
            on_reconnect: Mutex::new(None),
            state: Mutex::new(ConnState::Disconnected),
            client: Mutex::new(None),
            last_error: Mutex::new(None),
            shutdown: CancellationToken::new(),
            detach_connection: Mutex::new(false),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> ConnState {
        *self.state.lock()
    }

    /// The live connection, if connected.
    pub fn memd_client(&self) -> Option<Arc<MemdClient>> {
        self.client.lock().clone()
    }

    pub fn last_error(&self) -> Option<CoreError> {
        self.last_error.lock().clone()
    }

    pub fn set_reconnect_hook(&self, hook: ReconnectFn) {
        *self.on_reconnect.lock() = Some(hook);
    }

    fn set_state(&self, state: ConnState) {
        *self.state.lock() = state;
    }

    /// Starts the connect/dispatch loop.
    pub fn start(self: &Arc<Self>) {
        tokio::spawn(self.clone().run());
    }

    /// Points the client at a new queue. The switch happens once the old
    /// queue is closed.
    pub fn reassign(&self, queue: Arc<OpQueue>) {
        *self.queue.lock() = queue;
    }

    /// Stops the loop and closes the connection immediately.
    pub fn close(&self) {
        self.shutdown.cancel();
        if let Some(client) = self.client.lock().take() {
            client.close(Some(CoreError::shutdown()));
        }
    }

    /// Stops the loop and returns the live connection, leaving its closing
    /// to the caller.
    pub fn close_detached(&self) -> Option<Arc<MemdClient>> {
        *self.detach_connection.lock() = true;
        self.shutdown.cancel();
        self.client.lock().take()
    }

    async fn run(self: Arc<Self>) {
        let mut connected_before = false;
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            self.set_state(ConnState::Connecting);
            debug!(address = %self.address, "Pipeline client connecting");
            let dialed = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                dialed = (self.dial)(self.shutdown.clone()) => dialed,
            };
            let client = match dialed {
                Ok(client) => client,
                Err(e) => {
                    debug!(address = %self.address, error = %e, "Pipeline client failed to connect");
                    *self.last_error.lock() = Some(e);
                    continue;
                }
            };
            if self.shutdown.is_cancelled() {
                client.close(Some(CoreError::shutdown()));
                break;
            }

            *self.last_error.lock() = None;
            *self.client.lock() = Some(client.clone());
            self.set_state(ConnState::Connected);
            debug!(address = %self.address, conn_id = %client.conn_id(), "Pipeline client connected");
            if connected_before {
                let hook = self.on_reconnect.lock().clone();
                if let Some(hook) = hook {
                    hook(&self.address);
                }
            }
            connected_before = true;

            let exit = self.io_loop(&client).await;
            self.client.lock().take();
            match exit {
                LoopExit::Reconnect => {
                    self.set_state(ConnState::Disconnected);
                    debug!(address = %self.address, "Pipeline client connection lost, redialing");
                }
                LoopExit::Shutdown => {
                    self.set_state(ConnState::Disconnecting);
                    if !*self.detach_connection.lock() {
                        tokio::spawn(client.graceful_close(None, GRACEFUL_CLOSE_TIMEOUT));
                    }
                    break;
                }
            }
        }
        self.set_state(ConnState::Disconnected);
        debug!(address = %self.address, "Pipeline client exited");
    }

    async fn io_loop(&self, client: &Arc<MemdClient>) -> LoopExit {
        let closed = client.closed_token();
        loop {
            let queue = self.queue.lock().clone();
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return LoopExit::Shutdown,
                _ = closed.cancelled() => return LoopExit::Reconnect,
                next = queue.pop() => next,
            };
            let Some(req) = next else {
                if Arc::ptr_eq(&queue, &self.queue.lock()) {
                    return LoopExit::Shutdown;
                }
                continue;
            };

            if req.is_completed() {
                trace!(address = %self.address, "Skipping completed request");
                continue;
            }
            if let Err(e) = client.send_request(&req).await {
                debug!(address = %self.address, error = %e, "Pipeline client write failed");
                client.route_error(None, &req, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    use cbcore_config::NetworkType;
    use cbcore_errors::ErrorKind;
    use cbcore_memd::{MemdCodec, Opcode, Packet, Status};
    use futures::{FutureExt, SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio_util::codec::Framed;

    use super::*;
    use crate::kv::client::MemdClientProps;
    use crate::kv::request::{Request, Response};
    use crate::kv::transport::{Connector, TcpConnector};
    use crate::routing::cfg_json::ClusterConfigJson;
    use crate::routing::config_manager::ConfigManager;

    async fn echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((sock, _)) = listener.accept().await else { break };
                tokio::spawn(async move {
                    let mut framed = Framed::new(sock, MemdCodec::new());
                    while let Some(Ok(req)) = framed.next().await {
                        let resp = Packet::response_to(&req, Status::SUCCESS).with_value(req.key.to_vec());
                        if framed.send(resp).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    fn tcp_dial(addr: String, dials: Arc<AtomicUsize>) -> DialFn {
        Arc::new(move |_cancel| {
            let addr = addr.clone();
            let dials = dials.clone();
            async move {
                dials.fetch_add(1, Ordering::SeqCst);
                let conn = TcpConnector.connect(&addr, Instant::now() + Duration::from_secs(1)).await?;
                Ok(MemdClient::start(conn, MemdClientProps::new("pc-test")))
            }
            .boxed()
        })
    }

    /// Drops the first connection it accepts as soon as a request arrives,
    /// then echoes like `echo_server`.
    async fn flaky_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let mut first = true;
            loop {
                let Ok((sock, _)) = listener.accept().await else { break };
                let drop_it = std::mem::take(&mut first);
                tokio::spawn(async move {
                    let mut framed = Framed::new(sock, MemdCodec::new());
                    while let Some(Ok(req)) = framed.next().await {
                        if drop_it {
                            return;
                        }
                        let resp = Packet::response_to(&req, Status::SUCCESS).with_value(req.key.to_vec());
                        if framed.send(resp).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    fn rev_config(rev: i64) -> ClusterConfigJson {
        let raw = format!(r#"{{"rev":{rev},"nodesExt":[{{"hostname":"127.0.0.1","services":{{"kv":11210,"mgmt":8091}}}}]}}"#);
        ClusterConfigJson::parse(raw.as_bytes(), "127.0.0.1").unwrap()
    }

    fn get(key: &str) -> (Arc<Request>, oneshot::Receiver<CoreResult<Response>>) {
        let (tx, rx) = oneshot::channel();
        let req = Arc::new(Request::new(Packet::request(Opcode::GET).with_key(key.to_string()), move |r| {
            let _ = tx.send(r);
        }));
        (req, rx)
    }

    #[tokio::test]
    async fn test_request_roundtrip_through_queue() {
        let addr = echo_server().await;
        let queue = Arc::new(OpQueue::new(16));
        let dials = Arc::new(AtomicUsize::new(0));
        let pc = PipelineClient::new(addr.clone(), queue.clone(), tcp_dial(addr, dials.clone()));
        pc.start();

        let (req, rx) = get("k1");
        queue.push(req, true).unwrap();
        let resp = rx.await.unwrap().unwrap();
        assert_eq!(&resp.packet.value[..], b"k1");
        assert_eq!(pc.state(), ConnState::Connected);
        assert_eq!(dials.load(Ordering::SeqCst), 1);
        pc.close();
    }

    #[tokio::test]
    async fn test_reassign_switches_queue_after_close() {
        let addr = echo_server().await;
        let old = Arc::new(OpQueue::new(16));
        let new = Arc::new(OpQueue::new(16));
        let dials = Arc::new(AtomicUsize::new(0));
        let pc = PipelineClient::new(addr.clone(), old.clone(), tcp_dial(addr, dials.clone()));
        pc.start();

        let (req, rx) = get("first");
        old.push(req, true).unwrap();
        rx.await.unwrap().unwrap();

        pc.reassign(new.clone());
        assert!(old.drain().is_empty());
        let (req, rx) = get("second");
        new.push(req, true).unwrap();
        assert_eq!(&rx.await.unwrap().unwrap().packet.value[..], b"second");
        assert_eq!(dials.load(Ordering::SeqCst), 1);
        pc.close();
    }

    #[tokio::test]
    async fn test_closed_queue_stops_client() {
        let addr = echo_server().await;
        let queue = Arc::new(OpQueue::new(16));
        let dials = Arc::new(AtomicUsize::new(0));
        let pc = PipelineClient::new(addr.clone(), queue.clone(), tcp_dial(addr, dials));
        pc.start();
        let (req, rx) = get("k");
        queue.push(req, true).unwrap();
        rx.await.unwrap().unwrap();

        queue.close();
        tokio::time::timeout(Duration::from_secs(2), async {
            while pc.state() != ConnState::Disconnected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let (late, _rx) = get("late");
        assert!(queue.push(late, false).unwrap_err().is(ErrorKind::PipelineClosed));
    }

    #[tokio::test]
    async fn test_redial_runs_reconnect_hook() {
        let addr = flaky_server().await;
        let queue = Arc::new(OpQueue::new(16));
        let dials = Arc::new(AtomicUsize::new(0));
        let pc = PipelineClient::new(addr.clone(), queue.clone(), tcp_dial(addr, dials.clone()));
        let cfg_mgr = Arc::new(ConfigManager::new(Vec::new(), false, NetworkType::Default));
        assert!(cfg_mgr.on_new_config(&rev_config(5)));
        assert!(!cfg_mgr.on_new_config(&rev_config(5)));

        let hook_calls = Arc::new(AtomicUsize::new(0));
        let hook_mgr = cfg_mgr.clone();
        let calls = hook_calls.clone();
        pc.set_reconnect_hook(Arc::new(move |_addr: &str| {
            calls.fetch_add(1, Ordering::SeqCst);
            hook_mgr.mark_reconnected();
        }));
        pc.start();

        let (req, rx) = get("lost");
        queue.push(req, true).unwrap();
        assert!(rx.await.unwrap().unwrap_err().is(ErrorKind::SocketClosed));

        tokio::time::timeout(Duration::from_secs(2), async {
            while hook_calls.load(Ordering::SeqCst) == 0 || pc.state() != ConnState::Connected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(dials.load(Ordering::SeqCst), 2);
        assert_eq!(hook_calls.load(Ordering::SeqCst), 1);

        let (req, rx) = get("again");
        queue.push(req, true).unwrap();
        assert_eq!(&rx.await.unwrap().unwrap().packet.value[..], b"again");

        assert!(cfg_mgr.on_new_config(&rev_config(5)));
        assert!(!cfg_mgr.on_new_config(&rev_config(5)));
        pc.close();
    }
}
