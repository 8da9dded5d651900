//! Server supplied error map.
//!
//! The map is fetched during connection bootstrap. Only a map with a higher
//! revision than the installed one replaces it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use cbcore_errors::{CoreError, CoreResult, KeyValueError};
use cbcore_memd::{DATATYPE_JSON, Status};
use serde::Deserialize;
use tracing::debug;

use crate::kv::request::{Request, Response};
use crate::retry::RetryRequest;

/// Retry parameters attached to an error map entry.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ErrorMapRetry {
    /// `constant`, `linear` or `exponential`.
    pub strategy: String,
    /// Base interval in milliseconds.
    #[serde(default)]
    pub interval: u64,
    /// Delay before the first retry in milliseconds.
    #[serde(default)]
    pub after: u64,
    /// Upper bound of a single delay in milliseconds.
    #[serde(default)]
    pub ceil: u64,
    /// Total time budget for retries in milliseconds.
    #[serde(default, rename = "max-duration")]
    pub max_duration: u64,
}

impl ErrorMapRetry {
    /// Delay before retry number `attempt` (zero based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 && self.after > 0 {
            return Duration::from_millis(self.after);
        }
        let base = self.interval;
        let ms = match self.strategy.as_str() {
            "linear" => base.saturating_mul(u64::from(attempt) + 1),
            "exponential" => base.saturating_mul(1u64 << attempt.min(32)),
            _ => base,
        };
        let ms = if self.ceil > 0 { ms.min(self.ceil) } else { ms };
        Duration::from_millis(ms)
    }
}

/// One status code entry.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ErrorMapEntry {
    pub name: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub attrs: Vec<String>,
    #[serde(default)]
    pub retry: Option<ErrorMapRetry>,
}

impl ErrorMapEntry {
    pub fn has_attr(&self, attr: &str) -> bool {
        self.attrs.iter().any(|a| a == attr)
    }

    /// Whether the server asks the client to retry this status.
    pub fn should_retry(&self) -> bool {
        self.has_attr("auto-retry") || self.has_attr("retry-now") || self.has_attr("retry-later")
    }
}

/// A parsed error map.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ErrorMap {
    pub version: u32,
    pub revision: u32,
    /// Entries keyed by lowercase hex status code.
    pub errors: HashMap<String, ErrorMapEntry>,
}

impl ErrorMap {
    pub fn parse(bytes: &[u8]) -> CoreResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| CoreError::protocol(format!("invalid error map: {e}")))
    }

    pub fn get(&self, status: Status) -> Option<&ErrorMapEntry> {
        self.errors.get(&format!("{:x}", status.0))
    }
}

/// Holder of the installed error map.
#[derive(Default)]
pub struct ErrorMapComponent {
    map: ArcSwapOption<ErrorMap>,
}

impl ErrorMapComponent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `map` if it is newer than the current one.
    pub fn store(&self, map: ErrorMap) -> bool {
        let new = Arc::new(map);
        loop {
            let current = self.map.load_full();
            if let Some(cur) = &current
                && cur.revision >= new.revision
            {
                return false;
            }
            let prev = self.map.compare_and_swap(&current, Some(new.clone()));
            let swapped = match (&*prev, &current) {
                (Some(p), Some(c)) => Arc::ptr_eq(p, c),
                (None, None) => true,
                _ => false,
            };
            if swapped {
                debug!(version = new.version, revision = new.revision, "Installed new error map");
                return true;
            }
        }
    }

    pub fn revision(&self) -> Option<u32> {
        self.map.load().as_ref().map(|m| m.revision)
    }

    pub fn entry(&self, status: Status) -> Option<ErrorMapEntry> {
        self.map.load().as_ref().and_then(|m| m.get(status).cloned())
    }

    pub fn should_retry(&self, status: Status) -> bool {
        self.entry(status).is_some_and(|e| e.should_retry())
    }

    /// Wraps a KV failure with everything known about the request and the
    /// response that caused it.
    pub fn enhance_kv_error(&self, err: CoreError, resp: Option<&Response>, req: &Request, bucket: &str) -> CoreError {
        if err.as_key_value().is_some() || err.is_timeout() {
            return err;
        }
        let mut kv = KeyValueError::new(err.kind());
        kv.document_key = String::from_utf8_lossy(&req.key()).into_owned();
        kv.bucket = bucket.to_string();
        kv.scope = req.scope_name().to_string();
        kv.collection = req.collection_name().to_string();
        kv.collection_id = req.packet.lock().collection_id;
        kv.opaque = req.opaque();
        kv.retry_reasons = req.retry_reasons();
        kv.retry_attempts = req.retry_attempts();
        let info = req.connection_info();
        kv.last_dispatched_to = info.last_dispatched_to;
        kv.last_dispatched_from = info.last_dispatched_from;
        kv.last_connection_id = info.last_connection_id;

        if let Some(resp) = resp {
            let status = resp.packet.status;
            kv.status_code = status.0;
            if let Some(entry) = self.entry(status) {
                kv.error_name = entry.name;
                kv.error_description = entry.desc;
            }
            if resp.packet.datatype & DATATYPE_JSON != 0
                && let Ok(body) = serde_json::from_slice::<ErrorBody>(&resp.packet.value)
            {
                kv.context = body.error.context;
                kv.reference = body.error.reference;
            }
        }
        kv.into()
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorBodyDetail,
}

#[derive(Deserialize)]
struct ErrorBodyDetail {
    context: Option<String>,
    #[serde(rename = "ref")]
    reference: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAP: &str = r#"{
        "version": 1,
        "revision": 4,
        "errors": {
            "86": {"name": "ETMPFAIL", "desc": "Temporary failure", "attrs": ["temp", "retry-now"],
                   "retry": {"strategy": "exponential", "interval": 10, "after": 5, "ceil": 100, "max-duration": 1000}},
            "7ff0": {"name": "CUSTOM", "desc": "custom", "attrs": ["auto-retry"]},
            "1": {"name": "KEY_ENOENT", "desc": "Not Found", "attrs": ["item-only"]}
        }
    }"#;

    #[test]
    fn test_parse_and_lookup() {
        let map = ErrorMap::parse(MAP.as_bytes()).unwrap();
        assert_eq!(map.revision, 4);
        assert_eq!(map.get(Status::TMP_FAIL).unwrap().name, "ETMPFAIL");
        assert!(map.get(Status::TMP_FAIL).unwrap().should_retry());
        assert!(!map.get(Status::KEY_NOT_FOUND).unwrap().should_retry());
        assert!(map.get(Status(0x7ff0)).unwrap().should_retry());
    }

    #[test]
    fn test_retry_delays() {
        let map = ErrorMap::parse(MAP.as_bytes()).unwrap();
        let retry = map.get(Status::TMP_FAIL).unwrap().retry.clone().unwrap();
        assert_eq!(retry.delay_for_attempt(0), Duration::from_millis(5));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(40));
        assert_eq!(retry.delay_for_attempt(8), Duration::from_millis(100));
    }

    #[test]
    fn test_store_is_monotonic() {
        let component = ErrorMapComponent::new();
        let map = ErrorMap::parse(MAP.as_bytes()).unwrap();
        assert!(component.store(map.clone()));
        assert_eq!(component.revision(), Some(4));

        let mut older = map.clone();
        older.revision = 3;
        assert!(!component.store(older));
        assert!(!component.store(map.clone()));
        assert_eq!(component.revision(), Some(4));

        let mut newer = map;
        newer.revision = 9;
        assert!(component.store(newer));
        assert_eq!(component.revision(), Some(9));
        assert!(component.should_retry(Status::TMP_FAIL));
        assert!(!component.should_retry(Status::LOCKED));
    }

    #[test]
    fn test_enhance_kv_error_fills_context() {
        use cbcore_errors::ErrorKind;
        use cbcore_memd::{Opcode, Packet};

        let component = ErrorMapComponent::new();
        component.store(ErrorMap::parse(MAP.as_bytes()).unwrap());
        let req = Request::new(Packet::request(Opcode::GET).with_key("doc-1"), |_| {}).with_collection("inventory", "hotels");
        let body = br#"{"error":{"context":"doc is gone","ref":"abc-123"}}"#;
        let resp = Response {
            packet: Packet::response_to(&req.packet.lock(), Status::KEY_NOT_FOUND)
                .with_datatype(DATATYPE_JSON)
                .with_value(body.to_vec()),
            source_addr: "127.0.0.1:11210".into(),
            source_conn_id: "c1".into(),
        };

        let err = component.enhance_kv_error(ErrorKind::DocumentNotFound.into(), Some(&resp), &req, "travel");
        let kv = err.as_key_value().unwrap();
        assert!(err.is(ErrorKind::DocumentNotFound));
        assert_eq!(kv.status_code, 1);
        assert_eq!(kv.document_key, "doc-1");
        assert_eq!(kv.bucket, "travel");
        assert_eq!(kv.scope, "inventory");
        assert_eq!(kv.collection, "hotels");
        assert_eq!(kv.error_name, "KEY_ENOENT");
        assert_eq!(kv.context.as_deref(), Some("doc is gone"));
        assert_eq!(kv.reference.as_deref(), Some("abc-123"));
    }
}
