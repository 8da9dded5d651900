//! In-flight requests of one connection, keyed by opaque.

use std::collections::HashMap;
use std::sync::Arc;

use cbcore_memd::Opcode;

use super::request::Request;

#[derive(Default)]
pub struct OpMap {
    ops: HashMap<u32, Arc<Request>>,
}

impl OpMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, opaque: u32, req: Arc<Request>) {
        self.ops.insert(opaque, req);
    }

    pub fn find(&self, opaque: u32) -> Option<Arc<Request>> {
        self.ops.get(&opaque).cloned()
    }

    pub fn remove(&mut self, opaque: u32) -> Option<Arc<Request>> {
        self.ops.remove(&opaque)
    }

    /// Removes `req` only if it is the request registered under its opaque.
    pub fn remove_request(&mut self, req: &Request) -> bool {
        let opaque = req.opaque();
        match self.ops.get(&opaque) {
            Some(r) if std::ptr::eq(Arc::as_ptr(r), req) => {
                self.ops.remove(&opaque);
                true
            }
            _ => false,
        }
    }

    /// Looks the request up, removing it unless it stays registered.
    pub fn find_and_maybe_remove(&mut self, opaque: u32, keep: impl FnOnce(&Request) -> bool) -> Option<Arc<Request>> {
        let req = self.ops.get(&opaque)?.clone();
        if !keep(&req) {
            self.ops.remove(&opaque);
        }
        Some(req)
    }

    /// The open change stream for `vbucket`, if any.
    pub fn find_open_stream(&self, vbucket: u16) -> Option<Arc<Request>> {
        self.ops
            .values()
            .find(|r| r.command() == Opcode::DCP_STREAM_REQ && r.vbucket() == vbucket)
            .cloned()
    }

    pub fn drain(&mut self) -> Vec<Arc<Request>> {
        let mut ops: Vec<_> = self.ops.drain().map(|(_, r)| r).collect();
        ops.sort_by_key(|r| r.opaque());
        ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}
