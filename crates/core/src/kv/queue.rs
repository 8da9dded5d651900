//! Bounded FIFO of requests waiting for a connection.

use std::collections::VecDeque;
use std::sync::Arc;

use cbcore_errors::{CoreError, CoreResult, ErrorKind};
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::request::{Request, WaitingIn};

struct QueueInner {
    items: VecDeque<Arc<Request>>,
    closed: bool,
}

pub struct OpQueue {
    inner: Mutex<QueueInner>,
    max_items: usize,
    notify: Notify,
}

impl OpQueue {
    pub fn new(max_items: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                closed: false,
            }),
            max_items,
            notify: Notify::new(),
        }
    }

    /// Appends `req`. With `bounded` set a full queue rejects it with `Overload`.
    pub fn push(self: &Arc<Self>, req: Arc<Request>, bounded: bool) -> CoreResult<()> {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(CoreError::new(ErrorKind::PipelineClosed));
            }
            if bounded && self.max_items > 0 && inner.items.len() >= self.max_items {
                return Err(CoreError::new(ErrorKind::Overload));
            }
            {
                let mut waiting = req.waiting_in.lock();
                if req.is_completed() {
                    return Err(CoreError::canceled());
                }
                if !matches!(*waiting, WaitingIn::Idle) {
                    return Err(CoreError::message(ErrorKind::InvalidArgument, "request is already queued"));
                }
                *waiting = WaitingIn::Queue(Arc::downgrade(self));
            }
            inner.items.push_back(req);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Waits for the next request. `None` once the queue is closed.
    ///
    /// Cancel safe: a request is only taken in the poll that returns it.
    pub async fn pop(&self) -> Option<Arc<Request>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock();
                if let Some(req) = inner.items.pop_front() {
                    *req.waiting_in.lock() = WaitingIn::Idle;
                    return Some(req);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Removes `req` if it is still queued.
    pub fn remove(&self, req: &Request) -> bool {
        let mut inner = self.inner.lock();
        match inner.items.iter().position(|r| std::ptr::eq(Arc::as_ptr(r), req)) {
            Some(idx) => {
                inner.items.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Closes the queue and hands back everything still in it.
    pub fn drain(&self) -> Vec<Arc<Request>> {
        let items: Vec<Arc<Request>> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            let items: Vec<_> = inner.items.drain(..).collect();
            for req in &items {
                *req.waiting_in.lock() = WaitingIn::Idle;
            }
            items
        };
        self.notify.notify_waiters();
        items
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use cbcore_memd::{Opcode, Packet};

    use super::*;

    fn req() -> Arc<Request> {
        Arc::new(Request::new(Packet::request(Opcode::GET), |_| {}))
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let q = Arc::new(OpQueue::new(8));
        let reqs: Vec<_> = (0..3).map(|_| req()).collect();
        for r in &reqs {
            q.push(r.clone(), true).unwrap();
        }
        for r in &reqs {
            let popped = q.pop().await.unwrap();
            assert!(Arc::ptr_eq(&popped, r));
        }
    }

    #[test]
    fn test_bound_and_requeue() {
        let q = Arc::new(OpQueue::new(1));
        q.push(req(), true).unwrap();
        assert!(q.push(req(), true).unwrap_err().is(ErrorKind::Overload));
        q.push(req(), false).unwrap();
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_double_queue_rejected() {
        let q = Arc::new(OpQueue::new(8));
        let r = req();
        q.push(r.clone(), true).unwrap();
        assert!(q.push(r, true).is_err());
    }

    #[test]
    fn test_cancel_removes_from_queue() {
        let q = Arc::new(OpQueue::new(8));
        let r = req();
        q.push(r.clone(), true).unwrap();
        assert!(r.cancel(CoreError::canceled()));
        assert!(q.is_empty());
        assert!(q.push(r, true).unwrap_err().is(ErrorKind::RequestCanceled));
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push_and_close() {
        let q = Arc::new(OpQueue::new(8));
        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.pop().await.is_some() });
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.push(req(), true).unwrap();
        assert!(waiter.await.unwrap());

        let q3 = q.clone();
        let waiter = tokio::spawn(async move { q3.pop().await.is_none() });
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.close();
        assert!(waiter.await.unwrap());
        assert!(q.push(req(), false).unwrap_err().is(ErrorKind::PipelineClosed));
    }

    #[test]
    fn test_drain_returns_items_and_closes() {
        let q = Arc::new(OpQueue::new(8));
        q.push(req(), true).unwrap();
        q.push(req(), true).unwrap();
        let drained = q.drain();
        assert_eq!(drained.len(), 2);
        assert!(q.is_closed());
        for r in drained {
            assert!(matches!(*r.waiting_in.lock(), WaitingIn::Idle));
        }
    }
}
