//! In-process scenario tests for mb-daemon HTTP endpoints.
//!
//! These tests spin up the Axum router **without** binding a TCP socket.
//! Each test calls `routes::build_router` over `MemStore` and `MemoryQueue`
//! and drives it via `tower::ServiceExt::oneshot`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use mb_config::Settings;
use mb_daemon::{routes, state};
use mb_db::Store;
use mb_queue::{Delivery, JobQueue, MemoryQueue, QueueError, Queues};
use mb_runtime::LeaderElection;
use mb_schemas::{Job, QueueName};
use mb_testkit::MemStore;
use tower::ServiceExt; // oneshot

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn queues_over(backend: Arc<dyn JobQueue>) -> Queues {
    let s = Settings::default();
    Queues::new(backend, s.queues.limits, s.queues.enqueue_retry)
}

fn app_state(backend: Arc<dyn JobQueue>) -> (Arc<state::AppState>, Arc<LeaderElection>) {
    let store: Arc<dyn Store> = Arc::new(MemStore::new());
    let leader = Arc::new(LeaderElection::new(
        store.clone(),
        "node-a",
        Duration::from_secs(10),
    ));
    let st = state::AppState::new("cfg-hash-1", store, queues_over(backend), leader.clone());
    (Arc::new(st), leader)
}

/// Drive the router with a single GET and return (status, json).
async fn get(router: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let req = Request::builder()
        .method("GET")
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap();
    let resp = router.oneshot(req).await.expect("oneshot failed");
    let status = resp.status();
    let body: bytes::Bytes = resp
        .into_body()
        .collect()
        .await
        .expect("body collect failed")
        .to_bytes();
    let json = serde_json::from_slice(&body).expect("body is not valid JSON");
    (status, json)
}

/// Backend whose every call fails as if Postgres were down.
struct DownQueue;

#[async_trait]
impl JobQueue for DownQueue {
    async fn enqueue(&self, _job: &Job) -> Result<i64, QueueError> {
        Err(QueueError::Unavailable(anyhow::anyhow!("connection refused")))
    }

    async fn dequeue(
        &self,
        _queue: QueueName,
        _worker_id: &str,
    ) -> Result<Option<Delivery>, QueueError> {
        Err(QueueError::Unavailable(anyhow::anyhow!("connection refused")))
    }

    async fn ack(&self, _delivery: &Delivery) -> Result<(), QueueError> {
        Ok(())
    }

    async fn nack(&self, _delivery: &Delivery, _error: &str) -> Result<(), QueueError> {
        Ok(())
    }

    async fn len(&self, _queue: QueueName) -> Result<u64, QueueError> {
        Err(QueueError::Unavailable(anyhow::anyhow!("connection refused")))
    }
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_returns_200_ok_true() {
    let (st, _) = app_state(Arc::new(MemoryQueue::new(3)));
    let (status, json) = get(routes::build_router(st), "/v1/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["ok"], true);
    assert_eq!(json["service"], "mb-daemon");
}

// ---------------------------------------------------------------------------
// GET /v1/status
// ---------------------------------------------------------------------------

#[tokio::test]
async fn status_reports_queue_depths_and_config_hash() {
    let queue = Arc::new(MemoryQueue::new(3));
    queue
        .enqueue(&Job::MatchPayment {
            payment_transaction_id: 1,
        })
        .await
        .unwrap();
    queue
        .enqueue(&Job::MatchSchemeGroup {
            match_group: "g1".into(),
        })
        .await
        .unwrap();
    queue
        .enqueue(&Job::ExportPending {
            pending_export_id: 9,
        })
        .await
        .unwrap();

    let (st, _) = app_state(queue);
    let (status, json) = get(routes::build_router(st), "/v1/status").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["config_hash"], "cfg-hash-1");
    assert_eq!(json["owner"], "node-a");
    assert_eq!(json["pending_exports"], 0);

    let depths: Vec<(String, u64)> = json["queues"]
        .as_array()
        .expect("queues array")
        .iter()
        .map(|q| {
            (
                q["queue"].as_str().unwrap().to_string(),
                q["depth"].as_u64().unwrap(),
            )
        })
        .collect();
    assert_eq!(
        depths,
        vec![
            ("import".to_string(), 0),
            ("identify".to_string(), 0),
            ("matching".to_string(), 2),
            ("export".to_string(), 1),
        ]
    );
}

#[tokio::test]
async fn status_lists_locks_this_process_leads() {
    let (st, leader) = app_state(Arc::new(MemoryQueue::new(3)));

    let (_, before) = get(routes::build_router(st.clone()), "/v1/status").await;
    assert_eq!(before["leader_locks"], serde_json::json!([]));

    assert!(leader.try_lead("export-retry").await.unwrap());
    let (_, after) = get(routes::build_router(st), "/v1/status").await;
    assert_eq!(after["leader_locks"], serde_json::json!(["export-retry"]));
}

#[tokio::test]
async fn status_is_503_when_queue_backend_is_down() {
    let (st, _) = app_state(Arc::new(DownQueue));
    let (status, json) = get(routes::build_router(st), "/v1/status").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["dependency"], "queue");
    assert!(json["error"]
        .as_str()
        .unwrap()
        .contains("connection refused"));
}

#[tokio::test]
async fn unknown_route_is_404() {
    let (st, _) = app_state(Arc::new(MemoryQueue::new(3)));
    let req = Request::builder()
        .method("GET")
        .uri("/v1/nope")
        .body(axum::body::Body::empty())
        .unwrap();
    let resp = routes::build_router(st).oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}
