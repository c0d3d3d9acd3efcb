//! Common test utilities and helpers for ws-api tests
//!
//! Builds the router over an in-memory cluster and wraps the request
//! plumbing shared by the test files.

#![allow(dead_code)]

use axum::{
    body::Body,
    http::{Request, Response},
    Router,
};
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;
use ws_api::{create_app, AppState};
use ws_orchestrator::cluster::fake::FakeCluster;
use ws_orchestrator::test_utils::test_controller;
use ws_orchestrator::WorkspaceController;

pub const TEST_TOKEN: &str = "s3cret-token";

/// Helper to extract JSON body from axum response
pub async fn extract_json_body<T>(response: Response<Body>) -> T
where
    T: serde::de::DeserializeOwned,
{
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Failed to read response body");

    serde_json::from_slice(&body).expect("Failed to deserialize JSON")
}

/// Create body for a workspace cloned from a single repository
pub fn repo_body(url: &str) -> Value {
    serde_json::json!({ "repositories": [url], "branches": ["main"] })
}

/// TestClient to encapsulate API interaction logic
pub struct TestClient {
    pub app: Router,
    pub cluster: Arc<FakeCluster>,
    pub controller: WorkspaceController,
    token: Option<String>,
}

impl TestClient {
    /// Client for an app without token checking
    pub async fn new() -> Self {
        Self::build(None).await
    }

    /// Client for an app requiring [`TEST_TOKEN`]; requests carry it
    pub async fn with_token() -> Self {
        Self::build(Some(TEST_TOKEN.to_string())).await
    }

    async fn build(token: Option<String>) -> Self {
        let (cluster, controller) = test_controller().await;
        let app = create_app(AppState::new(controller.clone(), token.clone()));
        Self {
            app,
            cluster,
            controller,
            token,
        }
    }

    /// Stop attaching the bearer token to requests
    pub fn anonymous(mut self) -> Self {
        self.token = None;
        self
    }

    /// Send a request to the API
    pub async fn send_request(&self, request: Request<Body>) -> Response<Body> {
        self.app.clone().oneshot(request).await.unwrap()
    }

    fn builder(&self, method: &str, uri: &str) -> axum::http::request::Builder {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = &self.token {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        builder
    }

    /// Post JSON to an endpoint
    pub async fn post(&self, uri: &str, body: &Value) -> Response<Body> {
        let request = self
            .builder("POST", uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        self.send_request(request).await
    }

    /// Post with an empty body, for the lifecycle actions
    pub async fn post_empty(&self, uri: &str) -> Response<Body> {
        let request = self.builder("POST", uri).body(Body::empty()).unwrap();
        self.send_request(request).await
    }

    /// Post a raw body with a JSON content type
    pub async fn post_raw(&self, uri: &str, body: &str) -> Response<Body> {
        let request = self
            .builder("POST", uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        self.send_request(request).await
    }

    pub async fn get(&self, uri: &str) -> Response<Body> {
        let request = self.builder("GET", uri).body(Body::empty()).unwrap();
        self.send_request(request).await
    }

    pub async fn delete(&self, uri: &str) -> Response<Body> {
        let request = self.builder("DELETE", uri).body(Body::empty()).unwrap();
        self.send_request(request).await
    }

    /// Create a workspace through the API and return its id
    pub async fn create_workspace(&self) -> String {
        let response = self
            .post("/workspaces", &repo_body("https://github.com/acme/app.git"))
            .await;
        assert!(response.status().is_success());
        let body: Value = extract_json_body(response).await;
        body["workspace"]["id"]
            .as_str()
            .expect("created workspace has an id")
            .to_string()
    }
}
