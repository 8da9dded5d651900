//! Config polling when the data nodes do not serve configs themselves.

mod common;

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::routing::get;
use bytes::Bytes;
use cbcore::poller::ActivePoller;
use cbcore::{Agent, AgentConfig, ErrorKind, OpOptions};
use cbcore_config::BootstrapOn;
use cbcore_memd::{Opcode, Status};
use common::{BUCKET, ClusterState, MockNode, bucket_config_with_mgmt};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio_test::assert_ok;

const READY: Duration = Duration::from_secs(5);

#[derive(Default)]
struct MgmtNode {
    config: Mutex<Vec<u8>>,
    streams_opened: AtomicUsize,
}

/// Sends the current config as one frame and then holds the stream open.
async fn bucket_stream(State(node): State<Arc<MgmtNode>>, Path(bucket): Path<String>) -> Body {
    assert_eq!(bucket, BUCKET);
    node.streams_opened.fetch_add(1, Ordering::SeqCst);
    let mut frame = node.config.lock().clone();
    frame.extend_from_slice(b"\n\n\n\n");
    let frames = stream::iter([Ok::<_, Infallible>(Bytes::from(frame))]).chain(stream::pending());
    Body::from_stream(frames)
}

async fn start_mgmt_node() -> (Arc<MgmtNode>, u16) {
    let node = Arc::new(MgmtNode::default());
    let app = Router::new()
        .route("/pools/default/bs/{bucket}", get(bucket_stream))
        .with_state(node.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (node, port)
}

async fn cluster_without_cccp() -> (Arc<MockNode>, Arc<MgmtNode>, u16) {
    let cluster = ClusterState::new();
    let data = MockNode::start(cluster.clone()).await;
    data.cccp.store(false, Ordering::SeqCst);
    let (mgmt, mgmt_port) = start_mgmt_node().await;

    let config = bucket_config_with_mgmt(3, &[data.port], 0, mgmt_port);
    cluster.set_config(config.clone());
    *mgmt.config.lock() = config;
    (data, mgmt, mgmt_port)
}

// ============================================================================
// Fallback
// ============================================================================

#[tokio::test]
async fn test_falls_back_to_http_streaming() {
    let (data, mgmt, mgmt_port) = cluster_without_cccp().await;
    let config = AgentConfig::new()
        .with_bucket(BUCKET)
        .with_memd_addrs(vec![data.address()])
        .with_http_addrs(vec![format!("127.0.0.1:{mgmt_port}")]);

    let agent = Agent::new(config).unwrap();
    assert_ok!(agent.wait_until_ready(READY).await);
    assert_eq!(agent.config_rev(), 3);
    assert_eq!(agent.pollers().active(), ActivePoller::Http);
    assert!(data.count(Opcode::GET_CLUSTER_CONFIG) >= 1);
    assert!(mgmt.streams_opened.load(Ordering::SeqCst) >= 1);

    // Routing works off the streamed config.
    let written = assert_ok!(
        agent
            .kv()
            .set("k", "v", &cbcore::ops::StoreOptions::new(), &OpOptions::new())
            .await
    );
    assert_ne!(written.cas, 0);
    agent.close().await.unwrap();
}

#[tokio::test]
async fn test_not_found_config_reply_falls_back() {
    let (data, mgmt, mgmt_port) = cluster_without_cccp().await;
    *data.cccp_refusal.lock() = Status::KEY_NOT_FOUND;
    let config = AgentConfig::new()
        .with_bucket(BUCKET)
        .with_memd_addrs(vec![data.address()])
        .with_http_addrs(vec![format!("127.0.0.1:{mgmt_port}")]);

    let agent = Agent::new(config).unwrap();
    assert_ok!(agent.wait_until_ready(READY).await);
    assert_eq!(agent.config_rev(), 3);
    assert_eq!(agent.pollers().active(), ActivePoller::Http);
    assert!(mgmt.streams_opened.load(Ordering::SeqCst) >= 1);
    agent.close().await.unwrap();
}

#[tokio::test]
async fn test_cccp_only_never_becomes_ready() {
    let (data, mgmt, mgmt_port) = cluster_without_cccp().await;
    let config = AgentConfig::new()
        .with_bucket(BUCKET)
        .with_memd_addrs(vec![data.address()])
        .with_http_addrs(vec![format!("127.0.0.1:{mgmt_port}")])
        .with_bootstrap_on(BootstrapOn::Cccp);

    let agent = Agent::new(config).unwrap();
    let err = agent.wait_until_ready(Duration::from_millis(500)).await.unwrap_err();
    assert!(err.is(ErrorKind::UnambiguousTimeout));
    assert_eq!(agent.config_rev(), -1);
    assert_ne!(agent.pollers().active(), ActivePoller::Http);
    assert_eq!(mgmt.streams_opened.load(Ordering::SeqCst), 0);
    agent.close().await.unwrap();
}

#[tokio::test]
async fn test_http_only_skips_cccp() {
    let (data, _mgmt, mgmt_port) = cluster_without_cccp().await;
    let config = AgentConfig::new()
        .with_bucket(BUCKET)
        .with_memd_addrs(vec![data.address()])
        .with_http_addrs(vec![format!("127.0.0.1:{mgmt_port}")])
        .with_bootstrap_on(BootstrapOn::Http);

    let agent = Agent::new(config).unwrap();
    assert_ok!(agent.wait_until_ready(READY).await);
    assert_eq!(agent.pollers().active(), ActivePoller::Http);
    agent.close().await.unwrap();
}
