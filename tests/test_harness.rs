//! Test harness for dispatch node integration tests.
//!
//! Builds the full engine stack on an in-memory store, runs the pool
//! synchronizer as a background task, and routes requests through the real
//! axum router in process.

use std::future::Future;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use uuid::Uuid;

use dispatch_lite::api::{self, ApiState};
use dispatch_lite::claim::ClaimCoordinator;
use dispatch_lite::config::NodeConfig;
use dispatch_lite::lifecycle::Lifecycle;
use dispatch_lite::matching::sync::PoolSynchronizer;
use dispatch_lite::notify::LogNotifier;
use dispatch_lite::settlement::SettlementEngine;
use dispatch_lite::store::{JobStore, MemoryStore};

/// Node configuration with a short claim timeout for faster tests.
pub fn test_node_config() -> NodeConfig {
    let mut config = NodeConfig::default();
    config.claim_timeout_ms = 500;
    config
}

/// One in-process dispatch node.
///
/// `store` stays concrete so tests can inspect the ledger and inject rows
/// directly; requests go through the same router the server binds.
pub struct TestApp {
    pub store: Arc<MemoryStore>,
    pub state: ApiState,
    shutdown: CancellationToken,
    sync_handle: JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(test_node_config()).await
    }

    pub async fn with_config(config: NodeConfig) -> Self {
        let store = Arc::new(MemoryStore::with_feed_capacity(
            config.matching.feed_capacity,
        ));
        let store_dyn: Arc<dyn JobStore> = store.clone();

        let settlement = Arc::new(SettlementEngine::new(
            store_dyn.clone(),
            config.commissions.clone(),
            config.tip_window_mins,
        ));
        let lifecycle = Arc::new(Lifecycle::new(
            store_dyn.clone(),
            settlement.clone(),
            Arc::new(LogNotifier),
            config.cancellation.clone(),
        ));
        let claims = Arc::new(ClaimCoordinator::new(
            store_dyn.clone(),
            config.claim_timeout_ms,
        ));

        let (synchronizer, sync_rx) =
            PoolSynchronizer::new(store_dyn.clone(), config.matching.clone());
        let sync = synchronizer.handle();

        let shutdown = CancellationToken::new();
        let sync_shutdown = shutdown.clone();
        let sync_handle = tokio::spawn(async move {
            synchronizer.run(sync_rx, sync_shutdown).await;
        });

        let (priority_tx, _) = watch::channel(config.priority.clone());

        let state = ApiState {
            store: store_dyn,
            claims,
            lifecycle,
            settlement,
            sync,
            priority: Arc::new(priority_tx),
            matching: config.matching.clone(),
            draining: Arc::new(AtomicBool::new(false)),
            started_at: Utc::now(),
        };

        Self {
            store,
            state,
            shutdown,
            sync_handle,
        }
    }

    /// Run one request through the router, returning status and parsed body.
    pub async fn request(
        &self,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = api::router(self.state.clone())
            .oneshot(request)
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        // Framework rejections (malformed JSON and the like) come back as
        // plain text; surface those as a string value.
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        (status, body)
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.request("GET", uri, None).await
    }

    pub async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.request("POST", uri, Some(body)).await
    }

    #[allow(dead_code)]
    pub async fn put(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.request("PUT", uri, Some(body)).await
    }

    /// Fund a requester wallet so booking holds can clear.
    pub async fn fund_requester(&self, requester_id: Uuid, amount_cents: i64) {
        let (status, body) = self
            .post(
                &format!("/api/wallets/requester/{}/deposit", requester_id),
                json!({ "amount_cents": amount_cents }),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "deposit failed: {}", body);
    }

    /// Create a job for an already funded requester, returning its id.
    pub async fn create_job(
        &self,
        requester_id: Uuid,
        service: &str,
        price_cents: i64,
        pickup: Option<(f64, f64)>,
    ) -> Uuid {
        let mut body = json!({
            "requester_id": requester_id,
            "service": service,
            "price_cents": price_cents,
        });
        if let Some((lat, lng)) = pickup {
            body["pickup"] = json!({ "lat": lat, "lng": lng });
        }
        let (status, body) = self.post("/api/jobs", body).await;
        assert_eq!(status, StatusCode::CREATED, "create failed: {}", body);
        body["id"].as_str().unwrap().parse().unwrap()
    }

    /// Register an online provider covering every category.
    pub async fn register_provider(&self, location: Option<(f64, f64)>) -> Uuid {
        let mut body = json!({
            "capabilities": ["ride", "delivery", "shopping"],
            "online": true,
        });
        if let Some((lat, lng)) = location {
            body["location"] = json!({ "lat": lat, "lng": lng });
        }
        let (status, body) = self.post("/api/providers", body).await;
        assert_eq!(status, StatusCode::CREATED, "register failed: {}", body);
        body["id"].as_str().unwrap().parse().unwrap()
    }

    pub async fn claim(&self, job_id: Uuid, provider_id: Uuid) -> (StatusCode, Value) {
        self.post(
            &format!("/api/jobs/{}/claim", job_id),
            json!({ "provider_id": provider_id }),
        )
        .await
    }

    pub async fn advance(&self, job_id: Uuid, target: &str) -> (StatusCode, Value) {
        self.post(
            &format!("/api/jobs/{}/advance", job_id),
            json!({ "target": target }),
        )
        .await
    }

    /// March a matched job through the remaining happy-path phases.
    #[allow(dead_code)]
    pub async fn run_to_completion(&self, job_id: Uuid) {
        for target in ["arriving", "picked_up", "in_progress", "completed"] {
            let (status, body) = self.advance(job_id, target).await;
            assert_eq!(
                status,
                StatusCode::OK,
                "advance to {} failed: {}",
                target,
                body
            );
        }
    }

    #[allow(dead_code)]
    pub async fn balance(&self, kind: &str, id: Uuid) -> i64 {
        let (status, body) = self.get(&format!("/api/wallets/{}/{}", kind, id)).await;
        assert_eq!(status, StatusCode::OK);
        body["balance_cents"].as_i64().unwrap()
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.sync_handle.abort();
    }
}

/// Wait for a condition to become true with timeout
#[allow(dead_code)]
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
#[allow(dead_code)]
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(50)).await;
    assert!(result, "{}", message);
}
