//! Bulk image updates against a fake aggregator with injected failures.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use fleetdeck::session::ACCESS_TOKEN_KEY;
use fleetdeck::storage::{KeyValueStore, MemoryStore};
use fleetdeck::{bulk_update, ApiClient, BulkUpdateFilter, ClientConfig};

use common::spawn_app;

#[derive(Clone, Default)]
struct FleetServer {
    list_fails: Arc<AtomicBool>,
    /// Container ids whose update call should 500.
    fail_ids: Arc<Vec<String>>,
    update_calls: Arc<Mutex<Vec<String>>>,
}

fn container(id: &str, name: &str, host: &str) -> serde_json::Value {
    json!({
        "id": id,
        "name": name,
        "image": format!("example/{name}:latest"),
        "status": "Up 2 hours",
        "state": "running",
        "hostId": host,
        "hostName": format!("host-{host}"),
    })
}

async fn list_containers(State(srv): State<FleetServer>, headers: HeaderMap) -> impl IntoResponse {
    if !headers.contains_key("authorization") {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "unauthorized" })));
    }
    if srv.list_fails.load(Ordering::SeqCst) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "docker daemon unavailable" })),
        );
    }
    (
        StatusCode::OK,
        Json(json!([
            container("1", "web-frontend", "host-a"),
            container("2", "db", "host-a"),
            container("3", "web-api", "host-b"),
        ])),
    )
}

async fn trigger_update(
    State(srv): State<FleetServer>,
    Path((_host, id)): Path<(String, String)>,
) -> impl IntoResponse {
    srv.update_calls.lock().unwrap().push(id.clone());
    if srv.fail_ids.contains(&id) {
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "pull failed" })));
    }
    (
        StatusCode::OK,
        Json(json!({ "success": true, "message": "update started" })),
    )
}

async fn spawn_fleet(srv: FleetServer) -> ApiClient {
    let app = Router::new()
        .route("/api/containers", get(list_containers))
        .route("/api/containers/:host/:id/update", post(trigger_update))
        .with_state(srv);
    let addr = spawn_app(app).await;
    let config = Arc::new(ClientConfig::new(
        format!("http://{addr}/api/").parse().unwrap(),
    ));
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    store.set(ACCESS_TOKEN_KEY, "test-token");
    ApiClient::new(config, store)
}

fn host_filter(host: &str) -> BulkUpdateFilter {
    BulkUpdateFilter {
        host_id: Some(host.to_string()),
        name: None,
    }
}

#[tokio::test]
async fn dry_run_counts_matches_without_touching_containers() {
    let srv = FleetServer::default();
    let api = spawn_fleet(srv.clone()).await;

    let report = bulk_update(&api, &host_filter("host-a"), true).await.unwrap();
    assert_eq!(report.matched, 2);
    assert_eq!(report.updated, 0);
    assert_eq!(report.failed, 0);
    assert!(report.results.is_empty());
    assert!(srv.update_calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn partial_failures_are_reported_per_container() {
    let srv = FleetServer {
        fail_ids: Arc::new(vec!["2".to_string()]),
        ..FleetServer::default()
    };
    let api = spawn_fleet(srv.clone()).await;

    let report = bulk_update(&api, &host_filter("host-a"), false).await.unwrap();
    assert_eq!(report.matched, 2);
    assert_eq!(report.updated, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.results.len(), 2);

    let ok = report.results.iter().find(|r| r.container_id == "1").unwrap();
    assert!(ok.success);
    assert!(ok.error.is_none());
    assert_eq!(ok.container_name, "web-frontend");
    assert_eq!(ok.host_id, "host-a");

    let bad = report.results.iter().find(|r| r.container_id == "2").unwrap();
    assert!(!bad.success);
    assert!(bad.error.as_deref().unwrap_or_default().contains("pull failed"));

    let mut calls = srv.update_calls.lock().unwrap().clone();
    calls.sort();
    assert_eq!(calls, vec!["1", "2"]);
}

#[tokio::test]
async fn name_filter_matches_across_hosts() {
    let srv = FleetServer::default();
    let api = spawn_fleet(srv.clone()).await;

    let filter = BulkUpdateFilter {
        host_id: None,
        // Trimmed and case-folded before matching.
        name: Some("  WEB ".to_string()),
    };
    let report = bulk_update(&api, &filter, false).await.unwrap();
    assert_eq!(report.matched, 2);
    assert_eq!(report.updated, 2);
    let mut ids: Vec<_> = report.results.iter().map(|r| r.container_id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, vec!["1", "3"]);
}

#[tokio::test]
async fn conjunctive_filter_narrows_the_match_set() {
    let api = spawn_fleet(FleetServer::default()).await;

    let filter = BulkUpdateFilter {
        host_id: Some("host-a".to_string()),
        name: Some("web".to_string()),
    };
    let report = bulk_update(&api, &filter, false).await.unwrap();
    assert_eq!(report.matched, 1);
    assert_eq!(report.results[0].container_id, "1");
}

#[tokio::test]
async fn listing_failure_aborts_the_whole_operation() {
    let srv = FleetServer {
        list_fails: Arc::new(AtomicBool::new(true)),
        ..FleetServer::default()
    };
    let api = spawn_fleet(srv.clone()).await;

    let err = bulk_update(&api, &host_filter("host-a"), false)
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(500));
    assert!(err.to_string().contains("docker daemon unavailable"));
    assert!(srv.update_calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn requests_without_a_stored_token_are_rejected() {
    let srv = FleetServer::default();
    let app = Router::new()
        .route("/api/containers", get(list_containers))
        .with_state(srv);
    let addr = spawn_app(app).await;
    let config = Arc::new(ClientConfig::new(
        format!("http://{addr}/api/").parse().unwrap(),
    ));
    // Empty store: no bearer header is attached.
    let api = ApiClient::new(config, Arc::new(MemoryStore::new()));

    let err = bulk_update(&api, &BulkUpdateFilter::default(), false)
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(401));
}
