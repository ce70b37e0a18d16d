//! HTTP API integration tests
//!
//! Drives the studio router in-process through tower's `oneshot`; no
//! sockets are opened and no checkpoints are downloaded.

use std::path::Path;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use easel::cli::commands::serve::router;
use easel::device;
use easel::pipeline::CandleBackend;
use easel::Studio;

use super::fixtures::*;
use super::init_test_logging;

fn test_router(dir: &Path) -> Router {
    let (device, dtype) = device::cpu();
    let studio = Studio::with_backend(test_config(dir), device, dtype, Box::new(CandleBackend));
    router(studio, false)
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

async fn post_json(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn test_page_serves_embedded_html() {
    init_test_logging();
    let (_tmp, dir) = create_test_dir();
    let app = test_router(&dir);

    let request = Request::builder().uri("/").body(Body::empty()).unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap();
    assert!(content_type.starts_with("text/html"));

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let page = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(page.contains("Basic Stable Diffusion"));
}

#[tokio::test]
async fn test_page_defaults_to_dark_mode() {
    init_test_logging();
    let (_tmp, dir) = create_test_dir();
    let app = test_router(&dir);

    let request = Request::builder().uri("/").body(Body::empty()).unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let page = String::from_utf8(bytes.to_vec()).unwrap();

    // Dark is the initial state; the header button only toggles from there.
    assert!(page.contains("<body class=\"dark\">"));
    assert!(page.contains("classList.toggle(\"dark\")"));
}

#[tokio::test]
async fn test_health_reports_no_model_before_load() {
    init_test_logging();
    let (_tmp, dir) = create_test_dir();
    let app = test_router(&dir);

    let (status, body) = get_json(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["model_loaded"], false);
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_config_exposes_defaults_limits_and_catalog() {
    init_test_logging();
    let (_tmp, dir) = create_test_dir();
    let app = test_router(&dir);

    let (status, body) = get_json(&app, "/api/config").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["defaults"]["width"], 1024);
    assert_eq!(body["limits"]["max_steps"], 50);
    assert!(!body["catalog"]["models"].as_array().unwrap().is_empty());
    assert!(body["ratings"]
        .as_array()
        .unwrap()
        .contains(&json!("sfw")));
    assert!(body["lengths"]
        .as_array()
        .unwrap()
        .contains(&json!("very_long")));
    assert_eq!(body["ui"]["can_generate"], false);
}

#[tokio::test]
async fn test_state_reports_the_loaded_pipeline() {
    init_test_logging();
    let (_tmp, dir) = create_test_dir();
    let app = test_router(&dir);

    let (status, body) = get_json(&app, "/api/state").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["model_id"].is_null());
    assert_eq!(body["ui"]["can_generate"], false);

    let model = dir.join("anylora-studio");
    write_model_dir(&model, 8);
    let (status, _) = post_json(
        &app,
        "/api/load",
        json!({ "model_id": model.to_string_lossy() }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = get_json(&app, "/api/state").await;
    assert_eq!(body["model_id"], model.to_string_lossy().as_ref());
    assert!(body["adapter_id"].is_null());
    assert_eq!(body["family"], "base");
    assert_eq!(body["ui"]["can_generate"], true);
}

#[tokio::test]
async fn test_generate_without_model_is_rejected() {
    init_test_logging();
    let (_tmp, dir) = create_test_dir();
    let app = test_router(&dir);

    let (status, body) = post_json(&app, "/api/generate", small_generation_body()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_REQUEST");
    assert!(body["error"].as_str().unwrap().contains("no model loaded"));
    assert!(body["request_id"].as_str().unwrap().starts_with("req-"));
}

#[tokio::test]
async fn test_load_generate_and_fetch_roundtrip() {
    init_test_logging();
    let (_tmp, dir) = create_test_dir();
    let app = test_router(&dir);
    let model = dir.join("anylora-studio");
    write_model_dir(&model, 8);

    let (status, body) = post_json(
        &app,
        "/api/load",
        json!({ "model_id": model.to_string_lossy() }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["family"], "base");
    assert_eq!(body["notices"].as_array().unwrap().len(), 1);
    assert_eq!(body["ui"]["can_generate"], true);

    let (status, body) = post_json(&app, "/api/generate", small_generation_body()).await;
    assert_eq!(status, StatusCode::OK);
    let urls = body["urls"].as_array().unwrap();
    assert_eq!(urls.len(), 1);
    assert_eq!(urls[0], "/outputs/output_image_1.png");
    assert!(body["elapsed_ms"].is_u64());

    let request = Request::builder()
        .uri("/outputs/output_image_1.png")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..8], b"\x89PNG\r\n\x1a\n");

    let (_, health) = get_json(&app, "/health").await;
    assert_eq!(health["model_loaded"], true);
    assert!(health["requests_total"].as_u64().unwrap() >= 2);
}

#[tokio::test]
async fn test_invalid_dimensions_are_rejected_with_reason() {
    init_test_logging();
    let (_tmp, dir) = create_test_dir();
    let app = test_router(&dir);
    let model = dir.join("anylora-studio");
    write_model_dir(&model, 8);
    post_json(
        &app,
        "/api/load",
        json!({ "model_id": model.to_string_lossy() }),
    )
    .await;

    let mut body = small_generation_body();
    body["width"] = json!(3000);
    let (status, body) = post_json(&app, "/api/generate", body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_REQUEST");
    assert!(body["error"].as_str().unwrap().contains("width"));
}

#[tokio::test]
async fn test_incompatible_adapter_downgrades_to_notices() {
    init_test_logging();
    let (_tmp, dir) = create_test_dir();
    let app = test_router(&dir);
    let model = dir.join("anylora-studio");
    let adapter = dir.join("wrong-adapter");
    write_model_dir(&model, 8);
    write_adapter_dir(&adapter, 12, 12, 2);

    let (status, body) = post_json(
        &app,
        "/api/load",
        json!({
            "model_id": model.to_string_lossy(),
            "adapter_id": adapter.to_string_lossy()
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["notices"].as_array().unwrap().len(), 3);
    assert!(body["adapter_id"].is_null());
    assert_eq!(body["fuse"]["outcome"], "incompatible");
    assert_eq!(body["ui"]["can_generate"], true);
}

#[tokio::test]
async fn test_missing_weights_map_to_download_error() {
    init_test_logging();
    let (_tmp, dir) = create_test_dir();
    let app = test_router(&dir);
    let model = dir.join("broken-model");
    write_model_dir(&model, 8);
    std::fs::remove_file(model.join("text_encoder/model.safetensors")).unwrap();

    let (status, body) = post_json(
        &app,
        "/api/load",
        json!({ "model_id": model.to_string_lossy() }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["code"], "DOWNLOAD_FAILED");
}

#[tokio::test]
async fn test_copy_endpoint_drops_blank_payloads() {
    init_test_logging();
    let (_tmp, dir) = create_test_dir();
    let app = test_router(&dir);

    let (status, body) = post_json(&app, "/api/copy", json!({ "text": "   " })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["copied"], false);
    assert!(body.get("notice").is_none());

    let (status, body) = post_json(&app, "/api/copy", json!({ "text": " 1girl, solo " })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["copied"], true);
    assert_eq!(body["notice"], "Copied!");
}

#[tokio::test]
async fn test_copy_requests_are_counted_in_health() {
    init_test_logging();
    let (_tmp, dir) = create_test_dir();
    let app = test_router(&dir);

    let (_, before) = get_json(&app, "/health").await;
    post_json(&app, "/api/copy", json!({ "text": "1girl, solo" })).await;
    post_json(&app, "/api/copy", json!({ "text": "   " })).await;
    let (_, after) = get_json(&app, "/health").await;

    let counted = after["requests_total"].as_u64().unwrap()
        - before["requests_total"].as_u64().unwrap();
    assert_eq!(counted, 2);
    assert_eq!(after["active_requests"], 0);
}

#[tokio::test]
async fn test_tags_endpoint_completes_and_enables_copy() {
    init_test_logging();
    let (_tmp, dir) = create_test_dir();
    let app = test_router(&dir);

    let (status, body) = post_json(&app, "/api/tags", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!body["tags"].as_str().unwrap().is_empty());
    assert_eq!(body["ui"]["can_copy"], true);
    assert_eq!(body["ui"]["can_generate_from_tags"], false);
}

#[tokio::test]
async fn test_outputs_route_refuses_path_traversal() {
    init_test_logging();
    let (_tmp, dir) = create_test_dir();
    let app = test_router(&dir);

    let request = Request::builder()
        .uri("/outputs/..%2Fsecret.png")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let request = Request::builder()
        .uri("/outputs/never-rendered.png")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
