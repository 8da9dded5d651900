//! In-process stand-ins for a data node and cluster config documents.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use cbcore_memd::feature::{decode_features, encode_features};
use cbcore_memd::{DATATYPE_JSON, HelloFeature, MemdCodec, Opcode, Packet, Status};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

pub const BUCKET: &str = "default";
pub const NUM_VBUCKETS: usize = 64;

const SUPPORTED_FEATURES: [HelloFeature; 5] = [
    HelloFeature::XATTR,
    HelloFeature::XERROR,
    HelloFeature::SELECT_BUCKET,
    HelloFeature::JSON,
    HelloFeature::COLLECTIONS,
];

/// A bucket config for nodes on 127.0.0.1 with every vbucket owned by
/// `owner` (an index into `kv_ports`).
pub fn bucket_config(rev: i64, kv_ports: &[u16], owner: usize) -> Vec<u8> {
    bucket_config_with_mgmt(rev, kv_ports, owner, 8091)
}

pub fn bucket_config_with_mgmt(rev: i64, kv_ports: &[u16], owner: usize, mgmt_port: u16) -> Vec<u8> {
    let nodes: Vec<_> = kv_ports
        .iter()
        .map(|port| json!({"hostname": "127.0.0.1", "services": {"kv": port, "mgmt": mgmt_port}}))
        .collect();
    let servers: Vec<String> = kv_ports.iter().map(|port| format!("127.0.0.1:{port}")).collect();
    let vbuckets: Vec<Vec<usize>> = (0..NUM_VBUCKETS).map(|_| vec![owner]).collect();
    serde_json::to_vec(&json!({
        "rev": rev,
        "name": BUCKET,
        "uuid": "8c1a3bd8a1e9a5d4b3c2",
        "nodeLocator": "vbucket",
        "nodesExt": nodes,
        "vBucketServerMap": {
            "hashAlgorithm": "CRC",
            "numReplicas": 0,
            "serverList": servers,
            "vBucketMap": vbuckets,
        },
        "bucketCapabilities": ["collections", "xattr", "cccp"],
    }))
    .unwrap_or_default()
}

/// State shared by every node of a fake cluster.
#[derive(Default)]
pub struct ClusterState {
    pub config: Mutex<Vec<u8>>,
    pub docs: Mutex<HashMap<(u32, Bytes), (Bytes, u64)>>,
    pub collections: Mutex<HashMap<String, u32>>,
    next_cas: AtomicU64,
}

impl ClusterState {
    pub fn new() -> Arc<Self> {
        let state = Self::default();
        state.next_cas.store(0x1000, Ordering::Relaxed);
        Arc::new(state)
    }

    pub fn set_config(&self, config: Vec<u8>) {
        *self.config.lock() = config;
    }

    pub fn add_collection(&self, scope: &str, collection: &str, id: u32) {
        self.collections.lock().insert(format!("{scope}.{collection}"), id);
    }

    pub fn put(&self, collection_id: u32, key: &str, value: &str) -> u64 {
        let cas = self.next_cas.fetch_add(1, Ordering::Relaxed) + 1;
        self.docs.lock().insert(
            (collection_id, Bytes::copy_from_slice(key.as_bytes())),
            (Bytes::copy_from_slice(value.as_bytes()), cas),
        );
        cas
    }
}

/// One fake data node.
pub struct MockNode {
    pub port: u16,
    cluster: Arc<ClusterState>,
    counts: Mutex<HashMap<u8, usize>>,
    /// Answers GET_CLUSTER_CONFIG with `cccp_refusal` when false.
    pub cccp: AtomicBool,
    pub cccp_refusal: Mutex<Status>,
    /// Config body returned once, with NOT_MY_VBUCKET, to the next mutation.
    pub not_my_vbucket: Mutex<Option<Vec<u8>>>,
    pub collection_lookup_delay: Mutex<Duration>,
}

impl MockNode {
    pub async fn start(cluster: Arc<ClusterState>) -> Arc<Self> {
        cbcore_telemetry::init_test_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let node = Arc::new(Self {
            port,
            cluster,
            counts: Mutex::new(HashMap::new()),
            cccp: AtomicBool::new(true),
            cccp_refusal: Mutex::new(Status::UNKNOWN_COMMAND),
            not_my_vbucket: Mutex::new(None),
            collection_lookup_delay: Mutex::new(Duration::ZERO),
        });
        let accept = node.clone();
        tokio::spawn(async move {
            while let Ok((sock, _)) = listener.accept().await {
                tokio::spawn(accept.clone().serve(sock));
            }
        });
        node
    }

    pub fn address(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    pub fn count(&self, command: Opcode) -> usize {
        self.counts.lock().get(&command.0).copied().unwrap_or(0)
    }

    async fn serve(self: Arc<Self>, sock: TcpStream) {
        let mut framed = Framed::new(sock, MemdCodec::new());
        while let Some(Ok(req)) = framed.next().await {
            *self.counts.lock().entry(req.command.0).or_insert(0) += 1;
            if req.command == Opcode::COLLECTIONS_GET_ID {
                let delay = *self.collection_lookup_delay.lock();
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
            let (resp, collections) = self.handle(&req);
            if framed.send(resp).await.is_err() {
                break;
            }
            if collections {
                framed.codec().enable_collections();
            }
        }
    }

    fn handle(&self, req: &Packet) -> (Packet, bool) {
        let ok = || Packet::response_to(req, Status::SUCCESS);
        let resp = match req.command {
            Opcode::HELLO => {
                let agreed: Vec<HelloFeature> = decode_features(&req.value)
                    .into_iter()
                    .filter(|f| SUPPORTED_FEATURES.contains(f))
                    .collect();
                let collections = agreed.contains(&HelloFeature::COLLECTIONS);
                return (ok().with_value(encode_features(&agreed)), collections);
            }
            Opcode::SASL_LIST_MECHS => ok().with_value(Bytes::from_static(b"PLAIN")),
            Opcode::SASL_AUTH | Opcode::SELECT_BUCKET | Opcode::NOOP => ok(),
            Opcode::GET_CLUSTER_CONFIG if self.cccp.load(Ordering::Relaxed) => ok()
                .with_datatype(DATATYPE_JSON)
                .with_value(self.cluster.config.lock().clone()),
            Opcode::GET_CLUSTER_CONFIG => Packet::response_to(req, *self.cccp_refusal.lock()),
            Opcode::COLLECTIONS_GET_ID => {
                let name = String::from_utf8_lossy(&req.value).into_owned();
                match self.cluster.collections.lock().get(&name) {
                    Some(id) => {
                        let mut extras = 7u64.to_be_bytes().to_vec();
                        extras.extend_from_slice(&id.to_be_bytes());
                        ok().with_extras(extras)
                    }
                    None => Packet::response_to(req, Status::COLLECTION_UNKNOWN),
                }
            }
            Opcode::GET => match self.cluster.docs.lock().get(&(req.collection_id, req.key.clone())) {
                Some((value, cas)) => ok()
                    .with_extras(0u32.to_be_bytes().to_vec())
                    .with_value(value.clone())
                    .with_cas(*cas),
                None => Packet::response_to(req, Status::KEY_NOT_FOUND),
            },
            Opcode::SET => {
                if let Some(config) = self.not_my_vbucket.lock().take() {
                    self.cluster.set_config(config.clone());
                    return (
                        Packet::response_to(req, Status::NOT_MY_VBUCKET)
                            .with_datatype(DATATYPE_JSON)
                            .with_value(config),
                        false,
                    );
                }
                let key = String::from_utf8_lossy(&req.key).into_owned();
                let value = String::from_utf8_lossy(&req.value).into_owned();
                let cas = self.cluster.put(req.collection_id, &key, &value);
                ok().with_cas(cas)
            }
            _ => Packet::response_to(req, Status::UNKNOWN_COMMAND),
        };
        (resp, false)
    }
}
