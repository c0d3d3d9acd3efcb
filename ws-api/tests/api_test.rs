//! Integration tests for REST API endpoints
//!
//! Tests workspace creation, listing, retrieval, lifecycle actions and
//! deletion over the in-memory cluster.

mod common;

use axum::http::StatusCode;
use chrono::Utc;
use common::{extract_json_body, repo_body, TestClient};
use serde_json::{json, Value};
use ws_orchestrator::test_utils::running_pod;
use k8s_openapi::api::core::v1::NamespaceStatus;
use ws_orchestrator::{ClusterApi, ClusterError};

#[tokio::test]
async fn test_health_endpoint() {
    let client = TestClient::new().await;

    let response = client.get("/health").await;
    assert_eq!(response.status(), StatusCode::OK);

    let body: Value = extract_json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "ws-api");
}

#[tokio::test]
async fn test_create_workspace_endpoint() {
    let client = TestClient::new().await;

    let response = client
        .post("/workspaces", &repo_body("https://github.com/acme/app.git"))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let body: Value = extract_json_body(response).await;
    assert_eq!(body["success"], true);

    let workspace = &body["workspace"];
    let id = workspace["id"].as_str().unwrap();
    let fqdn = workspace["fqdn"].as_str().unwrap();
    assert_eq!(id.len(), 8);
    assert!(fqdn.ends_with(".ws.example.com"));
    assert_eq!(workspace["url"], format!("https://{}", fqdn));
    assert_eq!(workspace["password"].as_str().unwrap().len(), 12);

    let namespaces = client.cluster.namespace_names().await;
    assert!(namespaces.contains(&format!("workspace-{}", id)));
}

#[tokio::test]
async fn test_create_workspace_with_image_only() {
    let client = TestClient::new().await;

    let response = client
        .post("/workspaces", &json!({ "image": "ghcr.io/acme/devbox:1.2" }))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let body: Value = extract_json_body(response).await;
    let id = body["workspace"]["id"].as_str().unwrap();

    let response = client.get(&format!("/workspaces/{}", id)).await;
    let body: Value = extract_json_body(response).await;
    assert_eq!(body["workspace"]["image"], "ghcr.io/acme/devbox:1.2");
}

#[tokio::test]
async fn test_create_without_source_is_bad_request() {
    let client = TestClient::new().await;

    let response = client.post("/workspaces", &json!({})).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body: Value = extract_json_body(response).await;
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().is_some_and(|e| !e.is_empty()));

    // Nothing was provisioned.
    assert_eq!(
        client.cluster.namespace_names().await,
        vec!["workspace-system".to_string()]
    );
}

#[tokio::test]
async fn test_malformed_json_is_bad_request() {
    let client = TestClient::new().await;

    let response = client.post_raw("/workspaces", "{not json").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body: Value = extract_json_body(response).await;
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_list_workspaces_endpoint() {
    let client = TestClient::new().await;

    let response = client.get("/workspaces").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = extract_json_body(response).await;
    assert_eq!(body["workspaces"].as_array().unwrap().len(), 0);

    let first = client.create_workspace().await;
    let second = client.create_workspace().await;

    let response = client.get("/workspaces").await;
    let body: Value = extract_json_body(response).await;
    let ids: Vec<&str> = body["workspaces"]
        .as_array()
        .unwrap()
        .iter()
        .map(|w| w["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&first.as_str()));
    assert!(ids.contains(&second.as_str()));
}

#[tokio::test]
async fn test_get_workspace_endpoint() {
    let client = TestClient::new().await;
    let id = client.create_workspace().await;

    let response = client.get(&format!("/workspaces/{}", id)).await;
    assert_eq!(response.status(), StatusCode::OK);

    let body: Value = extract_json_body(response).await;
    let workspace = &body["workspace"];
    assert_eq!(workspace["id"], id.as_str());
    assert_eq!(workspace["namespace"], format!("workspace-{}", id));
    assert_eq!(workspace["state"], "provisioning");
    assert_eq!(workspace["repositories"][0], "https://github.com/acme/app.git");
    // The password is only returned by create.
    assert!(workspace.get("password").is_none());

    client
        .cluster
        .insert_pod(
            &format!("workspace-{}", id),
            running_pod("workspace-abc", "10.0.0.9", Utc::now()),
        )
        .await;
    let response = client.get(&format!("/workspaces/{}", id)).await;
    let body: Value = extract_json_body(response).await;
    assert_eq!(body["workspace"]["state"], "running");
}

#[tokio::test]
async fn test_get_missing_workspace_is_not_found() {
    let client = TestClient::new().await;

    let response = client.get("/workspaces/deadbeef").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let body: Value = extract_json_body(response).await;
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("deadbeef"));
}

#[tokio::test]
async fn test_invalid_id_is_bad_request() {
    let client = TestClient::new().await;

    let response = client.get("/workspaces/NOT_AN_ID").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_stop_and_start_endpoints() {
    let client = TestClient::new().await;
    let id = client.create_workspace().await;

    let response = client.post_empty(&format!("/workspaces/{}/stop", id)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = extract_json_body(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["state"], "stopped");
    assert!(body["message"].as_str().unwrap().contains(&id));

    let response = client.get(&format!("/workspaces/{}", id)).await;
    let body: Value = extract_json_body(response).await;
    assert_eq!(body["workspace"]["state"], "stopped");
    assert_eq!(body["workspace"]["replicas"], 0);

    let response = client.post_empty(&format!("/workspaces/{}/start", id)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = extract_json_body(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["state"], "provisioning");
}

#[tokio::test]
async fn test_start_terminating_workspace_is_conflict() {
    let client = TestClient::new().await;
    let id = client.create_workspace().await;
    let namespace = format!("workspace-{}", id);

    let mut ns = client
        .cluster
        .get_namespace(&namespace)
        .await
        .unwrap()
        .unwrap();
    ns.status = Some(NamespaceStatus {
        phase: Some("Terminating".to_string()),
        ..Default::default()
    });
    client.cluster.insert_namespace(ns).await;

    let response = client.post_empty(&format!("/workspaces/{}/start", id)).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body: Value = extract_json_body(response).await;
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_start_missing_workspace_is_not_found() {
    let client = TestClient::new().await;

    let response = client.post_empty("/workspaces/deadbeef/start").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_restart_endpoint() {
    let client = TestClient::new().await;
    let id = client.create_workspace().await;

    let response = client.post_empty(&format!("/workspaces/{}/restart", id)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = extract_json_body(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(
        body["message"],
        format!("Workspace {} restart initiated", id)
    );

    client.post_empty(&format!("/workspaces/{}/stop", id)).await;
    let response = client.post_empty(&format!("/workspaces/{}/restart", id)).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_logs_endpoint() {
    let client = TestClient::new().await;
    let id = client.create_workspace().await;
    let namespace = format!("workspace-{}", id);

    let response = client.get(&format!("/workspaces/{}/logs", id)).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body: Value = extract_json_body(response).await;
    assert!(body["error"].as_str().unwrap().contains("no pods"));

    client
        .cluster
        .insert_pod(
            &namespace,
            running_pod("workspace-abc", "10.0.0.9", Utc::now()),
        )
        .await;
    client
        .cluster
        .set_pod_logs(&namespace, "workspace-abc", "workspace", "one\ntwo\nthree\n")
        .await;

    let response = client
        .get(&format!("/workspaces/{}/logs?lines=2", id))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = extract_json_body(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["logs"], "two\nthree\n");
    assert_eq!(body["pod"], "workspace-abc");
    assert_eq!(body["container"], "workspace");
    assert_eq!(body["namespace"], namespace);

    let response = client
        .get(&format!("/workspaces/{}/logs?lines=lots", id))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_status_endpoint() {
    let client = TestClient::new().await;
    let id = client.create_workspace().await;
    let namespace = format!("workspace-{}", id);
    client
        .cluster
        .insert_pod(
            &namespace,
            running_pod("workspace-abc", "10.0.0.9", Utc::now()),
        )
        .await;

    let response = client.get(&format!("/workspaces/{}/status", id)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = extract_json_body(response).await;
    let status = &body["status"];
    assert_eq!(status["state"], "running");
    assert_eq!(status["deployment"]["replicas"], 1);
    assert_eq!(status["pods"][0]["name"], "workspace-abc");
    assert_eq!(status["pods"][0]["podIp"], "10.0.0.9");
    assert!(status["service"]["ports"].as_array().is_some());

    let response = client.get("/workspaces/deadbeef/status").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_failed_create_then_repair() {
    let client = TestClient::new().await;
    client
        .cluster
        .fail_next_apply("Service", ClusterError::Api("connection reset".into()))
        .await;

    let response = client
        .post("/workspaces", &repo_body("https://github.com/acme/app.git"))
        .await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = extract_json_body(response).await;
    assert_eq!(body["success"], false);

    // The half-built namespace is left in place for repair.
    let namespace = client
        .cluster
        .namespace_names()
        .await
        .into_iter()
        .find(|n| n != "workspace-system")
        .expect("namespace left in place");
    let id = namespace.trim_start_matches("workspace-").to_string();

    let response = client
        .post_empty(&format!("/workspaces/{}/repair", id))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let body: Value = extract_json_body(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["workspace"]["id"], id.as_str());
    assert!(client
        .cluster
        .namespaced_objects(&namespace)
        .await
        .contains(&"Service/workspace".to_string()));
}

#[tokio::test]
async fn test_delete_workspace_endpoint() {
    let client = TestClient::new().await;
    let id = client.create_workspace().await;

    let response = client.delete(&format!("/workspaces/{}", id)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = extract_json_body(response).await;
    assert_eq!(body["success"], true);
    assert!(body["message"].as_str().unwrap().contains("deleted"));

    let response = client.get(&format!("/workspaces/{}", id)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // Deleting twice still succeeds.
    let response = client.delete(&format!("/workspaces/{}", id)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = extract_json_body(response).await;
    assert!(body["message"].as_str().unwrap().contains("already"));
}
