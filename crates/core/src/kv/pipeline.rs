//! Per-node request queue and its pool of connections.

use std::fmt;
use std::sync::Arc;

use cbcore_errors::CoreResult;
use parking_lot::Mutex;
use tracing::debug;

use super::client::MemdClient;
use super::pipeline_client::{DialFn, PipelineClient, ReconnectFn};
use super::queue::OpQueue;
use super::request::Request;

pub struct Pipeline {
    address: String,
    max_clients: usize,
    queue: Arc<OpQueue>,
    clients: Mutex<Vec<Arc<PipelineClient>>>,
    dial: Option<DialFn>,
    on_reconnect: Option<ReconnectFn>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("address", &self.address)
            .field("clients", &self.clients.lock().len())
            .field("queued", &self.queue.len())
            .finish()
    }
}

impl Pipeline {
    pub fn new(address: impl Into<String>, max_clients: usize, queue_size: usize, dial: DialFn) -> Self {
        Self {
            address: address.into(),
            max_clients,
            queue: Arc::new(OpQueue::new(queue_size)),
            clients: Mutex::new(Vec::new()),
            dial: Some(dial),
            on_reconnect: None,
        }
    }

    /// A pipeline with no connections. Requests park here until the first
    /// config arrives and they are routed for real.
    pub fn new_dead(queue_size: usize) -> Self {
        Self {
            address: String::new(),
            max_clients: 0,
            queue: Arc::new(OpQueue::new(queue_size)),
            clients: Mutex::new(Vec::new()),
            dial: None,
            on_reconnect: None,
        }
    }

    /// Hook handed to every client this pipeline starts.
    pub fn with_reconnect_hook(mut self, hook: ReconnectFn) -> Self {
        self.on_reconnect = Some(hook);
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_dead(&self) -> bool {
        self.dial.is_none()
    }

    pub fn clients(&self) -> Vec<Arc<PipelineClient>> {
        self.clients.lock().clone()
    }

    /// Connected memd clients of this pipeline.
    pub fn memd_clients(&self) -> Vec<Arc<MemdClient>> {
        self.clients.lock().iter().filter_map(|c| c.memd_client()).collect()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Queues `req`, failing with `Overload` when the queue is full.
    pub fn send_request(&self, req: &Arc<Request>) -> CoreResult<()> {
        self.queue.push(req.clone(), true)
    }

    /// Queues `req` regardless of the queue bound.
    pub fn requeue_request(&self, req: &Arc<Request>) -> CoreResult<()> {
        self.queue.push(req.clone(), false)
    }

    /// Tops the pool up to its configured size.
    pub fn start_clients(&self) {
        let Some(dial) = &self.dial else {
            return;
        };
        let mut clients = self.clients.lock();
        while clients.len() < self.max_clients {
            let client = PipelineClient::new(self.address.clone(), self.queue.clone(), dial.clone());
            if let Some(hook) = &self.on_reconnect {
                client.set_reconnect_hook(hook.clone());
            }
            client.start();
            clients.push(client);
        }
    }

    /// Adopts the clients of `old`, which must serve the same address.
    /// Clients beyond the pool size are closed.
    pub fn takeover(&self, old: &Pipeline) {
        if old.address != self.address {
            debug!(old = %old.address, new = %self.address, "Refusing pipeline takeover across addresses");
            return;
        }
        let taken: Vec<_> = std::mem::take(&mut *old.clients.lock());
        let mut clients = self.clients.lock();
        for client in taken {
            if clients.len() < self.max_clients {
                client.reassign(self.queue.clone());
                clients.push(client);
            } else {
                client.close();
            }
        }
        debug!(address = %self.address, clients = clients.len(), "Pipeline takeover complete");
    }

    /// Closes the queue and stops every client, handing back their live
    /// connections for the caller to close.
    pub fn graceful_close(&self) -> Vec<Arc<MemdClient>> {
        self.queue.close();
        let clients: Vec<_> = std::mem::take(&mut *self.clients.lock());
        clients.iter().filter_map(|c| c.close_detached()).collect()
    }

    /// Closes the queue and every connection immediately.
    pub fn close(&self) {
        self.queue.close();
        for client in std::mem::take(&mut *self.clients.lock()) {
            client.close();
        }
    }

    /// Closes the queue and returns what was still waiting in it.
    pub fn drain(&self) -> Vec<Arc<Request>> {
        self.queue.drain()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use cbcore_errors::{CoreError, ErrorKind};
    use cbcore_memd::{Opcode, Packet};
    use futures::FutureExt;

    use super::*;

    fn never_dial(count: Arc<AtomicUsize>) -> DialFn {
        Arc::new(move |cancel| {
            count.fetch_add(1, Ordering::SeqCst);
            async move {
                cancel.cancelled().await;
                Err(CoreError::canceled())
            }
            .boxed()
        })
    }

    fn req() -> Arc<Request> {
        Arc::new(Request::new(Packet::request(Opcode::GET), |_| {}))
    }

    #[tokio::test]
    async fn test_start_clients_fills_pool() {
        let dials = Arc::new(AtomicUsize::new(0));
        let p = Pipeline::new("127.0.0.1:11210", 3, 8, never_dial(dials.clone()));
        p.start_clients();
        p.start_clients();
        assert_eq!(p.clients().len(), 3);
        tokio::task::yield_now().await;
        p.close();
        assert!(p.clients().is_empty());
    }

    #[tokio::test]
    async fn test_takeover_moves_clients() {
        let dials = Arc::new(AtomicUsize::new(0));
        let old = Pipeline::new("127.0.0.1:11210", 2, 8, never_dial(dials.clone()));
        old.start_clients();
        let new = Pipeline::new("127.0.0.1:11210", 1, 8, never_dial(dials.clone()));
        new.takeover(&old);
        new.start_clients();
        assert_eq!(new.clients().len(), 1);
        assert!(old.clients().is_empty());
        new.close();
    }

    #[tokio::test]
    async fn test_takeover_refuses_other_address() {
        let dials = Arc::new(AtomicUsize::new(0));
        let old = Pipeline::new("10.0.0.1:11210", 1, 8, never_dial(dials.clone()));
        old.start_clients();
        let new = Pipeline::new("10.0.0.2:11210", 1, 8, never_dial(dials));
        new.takeover(&old);
        assert!(new.clients().is_empty());
        assert_eq!(old.clients().len(), 1);
        old.close();
    }

    #[test]
    fn test_send_bounded_requeue_unbounded() {
        let p = Pipeline::new_dead(1);
        p.send_request(&req()).unwrap();
        assert!(p.send_request(&req()).unwrap_err().is(ErrorKind::Overload));
        p.requeue_request(&req()).unwrap();
        assert_eq!(p.queued(), 2);
        assert_eq!(p.drain().len(), 2);
        assert!(p.send_request(&req()).unwrap_err().is(ErrorKind::PipelineClosed));
    }

    #[test]
    fn test_dead_pipeline_has_no_clients() {
        let p = Pipeline::new_dead(4);
        p.start_clients();
        assert!(p.clients().is_empty());
        assert!(p.is_dead());
    }
}
