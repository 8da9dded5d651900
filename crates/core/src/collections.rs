//! Collection name to id resolution.
//!
//! Requests that name a scope and collection get the numeric id stamped into
//! their packet before they reach the mux. Ids are cached per
//! `scope.collection`; while a lookup is in flight, further requests for the
//! same pair wait in the entry's queue and are released in arrival order
//! once it resolves.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;

use cbcore_errors::{CoreError, CoreResult, ErrorKind, RetryReason};
use cbcore_memd::{Opcode, Packet};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::kv::client::PostErrorHandler;
use crate::kv::mux::{CapabilityStatus, KvMux};
use crate::kv::queue::OpQueue;
use crate::kv::request::{Request, Response};
use crate::retry::{RetryRequest, maybe_retry};

const DEFAULT_NAME: &str = "_default";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CidState {
    Unknown,
    Pending,
    Known,
}

struct CacheEntry {
    id: u32,
    state: CidState,
    waiters: Option<Arc<OpQueue>>,
}

/// Result of a collection id lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionId {
    pub manifest_uid: u64,
    pub collection_id: u32,
}

impl CollectionId {
    fn parse(extras: &[u8]) -> CoreResult<Self> {
        let (Some(uid), Some(cid)) = (extras.get(0..8), extras.get(8..12)) else {
            return Err(CoreError::protocol("collection id response too short"));
        };
        Ok(Self {
            manifest_uid: u64::from_be_bytes(uid.try_into().unwrap_or_default()),
            collection_id: u32::from_be_bytes(cid.try_into().unwrap_or_default()),
        })
    }
}

pub struct CollectionsComponent {
    me: Weak<CollectionsComponent>,
    mux: Arc<KvMux>,
    cache: Mutex<HashMap<String, Arc<Mutex<CacheEntry>>>>,
}

fn cache_key(scope: &str, collection: &str) -> String {
    let scope = if scope.is_empty() { DEFAULT_NAME } else { scope };
    let collection = if collection.is_empty() { DEFAULT_NAME } else { collection };
    format!("{scope}.{collection}")
}

impl CollectionsComponent {
    /// Creates the component and hooks its error handling into `mux`.
    pub fn new(mux: Arc<KvMux>) -> Arc<Self> {
        let component = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            mux: mux.clone(),
            cache: Mutex::new(HashMap::new()),
        });
        mux.set_post_complete_error_handler(component.error_handler());
        component
    }

    fn error_handler(&self) -> PostErrorHandler {
        let me = self.me.clone();
        Arc::new(move |resp, req, err| match me.upgrade() {
            Some(cm) => cm.handle_op_routing_resp(resp, req, err),
            None => Some(err),
        })
    }

    fn entry(&self, key: &str) -> Arc<Mutex<CacheEntry>> {
        self.cache
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(CacheEntry {
                    id: 0,
                    state: CidState::Unknown,
                    waiters: None,
                }))
            })
            .clone()
    }

    /// The cached id for a pair, if known.
    pub fn cached_id(&self, scope: &str, collection: &str) -> Option<u32> {
        let entry = self.cache.lock().get(&cache_key(scope, collection)).cloned()?;
        let entry = entry.lock();
        (entry.state == CidState::Known).then_some(entry.id)
    }

    /// Stamps the collection id into `req` and hands it to the mux, looking
    /// the id up first when it is not cached.
    pub fn dispatch(&self, req: &Arc<Request>) -> CoreResult<()> {
        let supported = self.mux.collections_enabled()
            && self
                .mux
                .state()
                .map(|s| s.collections != CapabilityStatus::Unsupported)
                .unwrap_or(false);
        if !supported {
            if req.names_non_default_collection() {
                return Err(CoreError::new(ErrorKind::CollectionsUnsupported));
            }
            return self.mux.dispatch_direct(req);
        }
        if req.has_explicit_collection_id() || !req.names_non_default_collection() {
            return self.mux.dispatch_direct(req);
        }

        let key = cache_key(req.scope_name(), req.collection_name());
        let entry = self.entry(&key);
        let mut guard = entry.lock();
        match guard.state {
            CidState::Known => {
                req.set_collection_id(guard.id);
                drop(guard);
                self.mux.dispatch_direct(req)
            }
            CidState::Pending => {
                let waiters = guard.waiters.get_or_insert_with(|| Arc::new(OpQueue::new(0)));
                waiters.push(req.clone(), false)
            }
            CidState::Unknown => {
                // Waiters are unbounded; the pipelines apply the real limit.
                let waiters = Arc::new(OpQueue::new(0));
                waiters.push(req.clone(), false)?;
                guard.state = CidState::Pending;
                guard.waiters = Some(waiters);
                drop(guard);
                trace!(collection = %key, "Resolving collection id");
                self.refresh(key, req);
                Ok(())
            }
        }
    }

    /// Sends the id lookup for `key`, borrowing deadline and retry strategy
    /// from the request that triggered it.
    fn refresh(&self, key: String, trigger: &Arc<Request>) {
        let me = self.me.clone();
        let lookup_key = key.clone();
        let mut lookup = Request::new(
            Packet::request(Opcode::COLLECTIONS_GET_ID).with_value(key.clone().into_bytes()),
            move |result| {
                if let Some(cm) = me.upgrade() {
                    cm.on_lookup_result(&lookup_key, result);
                }
            },
        )
        .with_idempotent(true);
        if let Some(strategy) = trigger.retry_strategy() {
            lookup = lookup.with_retry_strategy(strategy);
        }
        if let Some(deadline) = trigger.deadline() {
            lookup = lookup.with_deadline(deadline);
        }
        let lookup = Arc::new(lookup);
        lookup.start_timer();
        if let Err(e) = self.mux.dispatch_direct(&lookup) {
            lookup.internal_cancel();
            self.on_lookup_result(&key, Err(e));
        }
    }

    fn on_lookup_result(&self, key: &str, result: CoreResult<Response>) {
        let parsed = result.and_then(|resp| CollectionId::parse(&resp.packet.extras));
        let entry = self.entry(key);
        let waiters = {
            let mut guard = entry.lock();
            match &parsed {
                Ok(cid) => {
                    guard.id = cid.collection_id;
                    guard.state = CidState::Known;
                }
                Err(_) => guard.state = CidState::Unknown,
            }
            guard.waiters.take().map(|q| q.drain()).unwrap_or_default()
        };

        match parsed {
            Ok(cid) => {
                debug!(
                    collection = key,
                    id = cid.collection_id,
                    manifest = cid.manifest_uid,
                    waiting = waiters.len(),
                    "Resolved collection id"
                );
                for req in waiters {
                    req.set_collection_id(cid.collection_id);
                    if let Err(e) = self.mux.dispatch_direct(&req) {
                        req.try_callback(Err(e));
                    }
                }
            }
            Err(err) if err.is(ErrorKind::CollectionNotFound) || err.is(ErrorKind::ScopeNotFound) => {
                debug!(collection = key, waiting = waiters.len(), "Collection unknown to the server");
                for req in waiters {
                    self.retry_outdated(&req, err.clone());
                }
            }
            Err(err) => {
                debug!(collection = key, error = %err, "Collection id lookup failed");
                for req in waiters {
                    req.try_callback(Err(err.clone()));
                }
            }
        }
    }

    /// Retries `req` through the cache after a collection-outdated backoff,
    /// or fails it with `err` if the retry would not fit its deadline.
    fn retry_outdated(&self, req: &Arc<Request>, err: CoreError) {
        let Some(at) = maybe_retry(req.as_ref(), RetryReason::KvCollectionOutdated) else {
            req.try_callback(Err(err));
            return;
        };
        if let Some(deadline) = req.deadline()
            && at >= deadline
        {
            req.cancel(req.timeout_error());
            return;
        }
        let me = self.me.clone();
        let req = req.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(at.into()).await;
            let Some(cm) = me.upgrade() else {
                req.try_callback(Err(CoreError::shutdown()));
                return;
            };
            if req.is_completed() {
                return;
            }
            if let Err(e) = cm.dispatch(&req) {
                req.try_callback(Err(e));
            }
        });
    }

    /// Invalidates the cached id when the server no longer recognises it
    /// and sends the request round again.
    fn handle_op_routing_resp(&self, _resp: Option<&Response>, req: &Arc<Request>, err: CoreError) -> Option<CoreError> {
        if !err.is(ErrorKind::CollectionNotFound) || !req.names_non_default_collection() || req.has_explicit_collection_id()
        {
            return Some(err);
        }
        let key = cache_key(req.scope_name(), req.collection_name());
        let stale_id = req.packet.lock().collection_id;
        if let Some(entry) = self.cache.lock().get(&key).cloned() {
            let mut guard = entry.lock();
            if guard.state == CidState::Known && guard.id == stale_id {
                debug!(collection = %key, id = stale_id, "Invalidating cached collection id");
                guard.state = CidState::Unknown;
            }
        }
        self.retry_outdated(req, err);
        None
    }

    /// Deadline-bounded lookup used by callers that need the id itself.
    pub async fn get_collection_id(&self, scope: &str, collection: &str, deadline: Instant) -> CoreResult<CollectionId> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let req = Arc::new(
            Request::new(
                Packet::request(Opcode::COLLECTIONS_GET_ID).with_value(cache_key(scope, collection).into_bytes()),
                move |r| {
                    let _ = tx.send(r);
                },
            )
            .with_idempotent(true)
            .with_deadline(deadline),
        );
        req.start_timer();
        if let Err(e) = self.mux.dispatch_direct(&req) {
            req.internal_cancel();
            return Err(e);
        }
        let resp = rx.await.map_err(|_| CoreError::canceled())??;
        let cid = CollectionId::parse(&resp.packet.extras)?;
        let entry = self.entry(&cache_key(scope, collection));
        let mut guard = entry.lock();
        if guard.state != CidState::Pending {
            guard.id = cid.collection_id;
            guard.state = CidState::Known;
        }
        Ok(cid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_fills_defaults() {
        assert_eq!(cache_key("", ""), "_default._default");
        assert_eq!(cache_key("inventory", "hotels"), "inventory.hotels");
        assert_eq!(cache_key("inventory", ""), "inventory._default");
    }

    #[test]
    fn test_parse_collection_id() {
        let mut extras = 0x11u64.to_be_bytes().to_vec();
        extras.extend_from_slice(&8u32.to_be_bytes());
        let cid = CollectionId::parse(&extras).unwrap();
        assert_eq!(cid.manifest_uid, 0x11);
        assert_eq!(cid.collection_id, 8);
        assert!(CollectionId::parse(&extras[..10]).is_err());
    }
}
