//! Common test utilities and helpers for wsm-api tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, Response},
    Router,
};
use serde::{de::DeserializeOwned, Serialize};
use tower::ServiceExt;
use wsm_api::{create_app, AppState};
use wsm_orchestrator::test_utils::create_test_db;
use wsm_orchestrator::{ActivityConfig, ActivityTracker, MachineOrchestrator, OrchestratorConfig};
use wsm_provider::mock::MockInfrastructure;
use wsm_provider::{MachineSpec, RetryPolicy};

pub fn spec() -> MachineSpec {
    MachineSpec::new("eclipse/ubuntu_jdk8").with_memory_limit_mb(2048)
}

/// Helper to extract JSON body from axum response
pub async fn extract_json_body<T>(response: Response<Body>) -> T
where
    T: DeserializeOwned,
{
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Failed to read response body");

    serde_json::from_slice(&body).expect("Failed to deserialize JSON")
}

/// TestClient to encapsulate API interaction logic
pub struct TestClient {
    pub app: Router,
    pub state: AppState,
    pub mock: Arc<MockInfrastructure>,
}

impl TestClient {
    /// App over the mock adapter and a fresh in-memory database
    pub async fn new() -> Self {
        let mock = Arc::new(MockInfrastructure::new());
        let config = OrchestratorConfig {
            retry: RetryPolicy {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                ..RetryPolicy::default()
            },
            ..OrchestratorConfig::default()
        };
        let orchestrator = MachineOrchestrator::new(mock.clone(), create_test_db().await, config);
        let activity = Arc::new(ActivityTracker::new(ActivityConfig::default()));
        let state = AppState::new(orchestrator, activity);

        Self {
            app: create_app(state.clone()),
            state,
            mock,
        }
    }

    /// Send a request to the API
    pub async fn send_request(&self, request: Request<Body>) -> Response<Body> {
        // Clone the app to allow reuse (Router is cheap to clone)
        self.app.clone().oneshot(request).await.unwrap()
    }

    /// Post JSON to an endpoint
    pub async fn post<T: Serialize>(&self, uri: &str, body: &T) -> Response<Body> {
        let req_body = serde_json::to_string(body).expect("Failed to serialize request body");
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(req_body))
            .unwrap();
        self.send_request(request).await
    }

    /// Post without a body
    pub async fn post_empty(&self, uri: &str) -> Response<Body> {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        self.send_request(request).await
    }

    pub async fn get(&self, uri: &str) -> Response<Body> {
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        self.send_request(request).await
    }

    pub async fn delete(&self, uri: &str) -> Response<Body> {
        let request = Request::builder()
            .method("DELETE")
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        self.send_request(request).await
    }
}
