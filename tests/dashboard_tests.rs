use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use cluster_sim::dashboard::{router, DashboardState};
use cluster_sim::{Cluster, SimConfig};

async fn create_test_app() -> (Router, Arc<Cluster>) {
    let config = SimConfig::empty()
        .with_worker("gpu-node-01", 0.05)
        .with_worker("gpu-node-02", 0.10)
        .with_auto_generate(false)
        .with_seed(1);
    let cluster = Arc::new(Cluster::new(config).unwrap());
    let state = DashboardState::new(cluster.clone()).await;
    (router(state), cluster)
}

async fn post_json(app: Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&body).unwrap())
}

async fn get(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body.to_vec())
}

#[tokio::test]
async fn test_status_returns_snapshot() {
    let (app, _cluster) = create_test_app().await;

    let (status, body) = get(app, "/api/status").await;
    assert_eq!(status, StatusCode::OK);

    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["job_rate_per_minute"], 2.0);
    assert_eq!(json["workers"].as_array().unwrap().len(), 2);
    assert_eq!(json["workers"][0]["id"], "gpu-node-01");
    assert_eq!(json["workers"][0]["health"], "healthy");
    assert_eq!(json["jobs"].as_array().unwrap().len(), 0);
    assert_eq!(json["stats"]["healthy_workers"], 2);
}

#[tokio::test]
async fn test_job_rate_boundaries_accepted() {
    let (app, cluster) = create_test_app().await;

    let (status, json) = post_json(app.clone(), "/api/job-rate", json!({ "rate": 0.1 })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["job_rate_per_minute"], 0.1);

    let (status, _) = post_json(app, "/api/job-rate", json!({ "rate": 50.0 })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cluster.job_rate(), 50.0);
}

#[tokio::test]
async fn test_job_rate_out_of_range_rejected() {
    let (app, cluster) = create_test_app().await;

    for rate in [0.0, 51.0, -1.0] {
        let (status, json) =
            post_json(app.clone(), "/api/job-rate", json!({ "rate": rate })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"]
            .as_str()
            .unwrap()
            .contains("Invalid configuration"));
    }
    assert_eq!(cluster.job_rate(), 2.0);
}

#[tokio::test]
async fn test_add_worker_with_generated_id() {
    let (app, cluster) = create_test_app().await;

    let (status, json) =
        post_json(app, "/api/workers", json!({ "failure_rate": 0.07 })).await;
    assert_eq!(status, StatusCode::CREATED);
    let worker_id = json["worker_id"].as_str().unwrap();
    assert!(worker_id.starts_with("worker-"));
    assert_eq!(worker_id.len(), "worker-".len() + 8);

    let snapshot = cluster.snapshot().await;
    assert_eq!(snapshot.workers.len(), 3);
}

#[tokio::test]
async fn test_add_worker_rejects_duplicates_and_bad_rates() {
    let (app, _cluster) = create_test_app().await;

    let (status, _) = post_json(
        app.clone(),
        "/api/workers",
        json!({ "worker_id": "gpu-node-01", "failure_rate": 0.05 }),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = post_json(
        app,
        "/api/workers",
        json!({ "worker_id": "gpu-node-09", "failure_rate": 1.5 }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_index_page_served() {
    let (app, _cluster) = create_test_app().await;

    let (status, body) = get(app, "/").await;
    assert_eq!(status, StatusCode::OK);
    assert!(String::from_utf8(body).unwrap().contains("/api/stream"));
}
