//! Query service adapter against a stub query node.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use cbcore::BestEffortRetryStrategy;
use cbcore::http::HttpComponent;
use cbcore::http::query::{QueryComponent, QueryOptions};
use cbcore::routing::{ClusterConfigJson, ConfigManager};
use cbcore_config::NetworkType;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_test::assert_ok;

#[derive(Default)]
struct QueryNode {
    bodies: Mutex<Vec<Value>>,
    /// Rejects the next prepared name with 4040 when set.
    forget_prepared: AtomicBool,
}

async fn query_service(State(node): State<Arc<QueryNode>>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    node.bodies.lock().push(body.clone());

    if body.get("prepared").is_some() && node.forget_prepared.swap(false, Ordering::SeqCst) {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({
                "errors": [{"code": 4040, "msg": "No such prepared statement: p1"}],
                "status": "fatal",
            })),
        );
    }
    let statement = body.get("statement").and_then(Value::as_str).unwrap_or_default();
    if statement.starts_with("PREPARE ") {
        return (
            StatusCode::OK,
            Json(json!({
                "requestID": "r1",
                "prepared": "p1",
                "results": [{"n": 1}],
                "status": "success",
            })),
        );
    }
    (
        StatusCode::OK,
        Json(json!({"requestID": "r2", "results": [{"n": 1}], "status": "success"})),
    )
}

async fn start_query_node() -> (Arc<QueryNode>, u16) {
    let node = Arc::new(QueryNode::default());
    let app = Router::new()
        .route("/query/service", post(query_service))
        .with_state(node.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (node, port)
}

fn query_component(n1ql_port: u16) -> QueryComponent {
    let cfg_mgr = Arc::new(ConfigManager::new(
        vec!["127.0.0.1:11210".into()],
        false,
        NetworkType::Default,
    ));
    let raw = json!({
        "rev": 1,
        "nodesExt": [{"hostname": "127.0.0.1", "services": {"kv": 11210, "mgmt": 8091, "n1ql": n1ql_port}}],
        "clusterCapabilitiesVer": [1, 0],
        "clusterCapabilities": {"n1ql": ["enhancedPreparedStatements"]},
    });
    let cfg = ClusterConfigJson::parse(raw.to_string().as_bytes(), "127.0.0.1").unwrap();
    assert!(cfg_mgr.on_new_config(&cfg));

    let http = Arc::new(HttpComponent::new(
        reqwest::Client::new(),
        cfg_mgr,
        Vec::new(),
        None,
        "cbcore-test",
        Duration::from_secs(5),
        Arc::new(BestEffortRetryStrategy::default()),
    ));
    QueryComponent::new(http, Duration::from_secs(5))
}

// ============================================================================
// Prepared statements
// ============================================================================

#[tokio::test]
async fn test_enhanced_prepare_then_execute_by_name() {
    let (node, port) = start_query_node().await;
    let query = query_component(port);

    let (rows, _) = assert_ok!(assert_ok!(query.prepared_n1ql_query(QueryOptions::new("SELECT 1")).await).collect().await);
    assert_eq!(rows.len(), 1);
    assert_eq!(query.prepared_cache().get("SELECT 1").unwrap().name, "p1");

    let (rows, _) = assert_ok!(assert_ok!(query.prepared_n1ql_query(QueryOptions::new("SELECT 1")).await).collect().await);
    assert_eq!(rows.len(), 1);

    let bodies = node.bodies.lock().clone();
    assert_eq!(bodies.len(), 2);
    assert_eq!(bodies[0]["statement"], "PREPARE SELECT 1");
    assert_eq!(bodies[0]["auto_execute"], true);
    assert_eq!(bodies[1]["prepared"], "p1");
    assert!(bodies[1].get("statement").is_none());
    assert!(bodies[1].get("encoded_plan").is_none());
}

#[tokio::test]
async fn test_stale_prepared_name_is_prepared_again() {
    let (node, port) = start_query_node().await;
    let query = query_component(port);

    assert_ok!(query.prepared_n1ql_query(QueryOptions::new("SELECT 1")).await);
    node.forget_prepared.store(true, Ordering::SeqCst);

    let (rows, _) = assert_ok!(assert_ok!(query.prepared_n1ql_query(QueryOptions::new("SELECT 1")).await).collect().await);
    assert_eq!(rows.len(), 1);

    let bodies = node.bodies.lock().clone();
    assert_eq!(bodies.len(), 3);
    assert_eq!(bodies[1]["prepared"], "p1");
    assert_eq!(bodies[2]["statement"], "PREPARE SELECT 1");
    assert_eq!(query.prepared_cache().len(), 1);
}

// ============================================================================
// Plain statements
// ============================================================================

#[tokio::test]
async fn test_query_sets_context_id_and_timeout() {
    let (node, port) = start_query_node().await;
    let query = query_component(port);

    let rows = assert_ok!(query.n1ql_query(QueryOptions::new("SELECT 2")).await);
    let meta = assert_ok!(rows.metadata().await);
    assert_eq!(meta["status"], "success");

    let body = node.bodies.lock()[0].clone();
    assert_eq!(body["statement"], "SELECT 2");
    assert!(body["client_context_id"].as_str().is_some_and(|id| !id.is_empty()));
    assert!(body["timeout"].as_str().is_some_and(|t| t.ends_with("ms")));
}
