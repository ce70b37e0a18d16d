//! The web studio: one page plus the JSON API behind it.
//!
//! Every stateful route locks the session studio for its whole run, so
//! actions execute one at a time in submission order. That is deliberate:
//! the page is built around a single blocking action at a time, and the
//! pipeline is not safe to share mid-render anyway.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use clap::Args;
use serde::{Deserialize, Serialize};
use tokio::signal;
use tokio::sync::Mutex;
use tower::ServiceBuilder;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};
use tracing::{info, warn};

use crate::cli::error::{CliError, CliResult};
use crate::cli::logging;
use crate::config::{AppConfig, CatalogConfig, GenerationDefaults, GenerationLimits, TagDefaults};
use crate::error::Error;
use crate::pipeline::GenerationRequest;
use crate::studio::{LoadReport, Studio, TagReport, UiState};
use crate::tagger::{AspectRatio, Rating, TagLength, TagPromptRequest};

const PAGE: &str = include_str!("../../../assets/index.html");

/// Arguments for `easel serve`
#[derive(Args, Debug)]
pub struct ServeCommand {
    /// Configuration file (YAML or JSON)
    #[arg(long, env = "EASEL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override the configured bind host
    #[arg(long)]
    pub host: Option<String>,

    /// Override the configured port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Bind all interfaces so other machines can reach the studio
    #[arg(long)]
    pub share: bool,

    /// Bind only the configured host even if the config enables sharing
    #[arg(long, conflicts_with = "share")]
    pub no_share: bool,

    /// Load this model before accepting requests
    #[arg(short, long)]
    pub model: Option<String>,

    /// Fuse this adapter into the preloaded model
    #[arg(long, requires = "model")]
    pub adapter: Option<String>,
}

#[derive(Clone)]
struct AppState {
    studio: Arc<Mutex<Studio>>,
    tracker: Arc<RequestTracker>,
}

/// Bring the studio up and serve it until a shutdown signal arrives.
pub async fn execute(cmd: ServeCommand) -> CliResult<()> {
    let mut config = match &cmd.config {
        Some(path) => AppConfig::from_file(path)?,
        None => AppConfig::default(),
    };
    if let Some(host) = &cmd.host {
        config.server.host = host.clone();
    }
    if let Some(port) = cmd.port {
        config.server.port = port;
    }
    if cmd.share {
        config.server.share = true;
    }
    if cmd.no_share {
        config.server.share = false;
    }
    config.validate()?;

    let addr: SocketAddr = format!("{}:{}", config.server.bind_host(), config.server.port)
        .parse()
        .context("invalid host:port combination")?;
    let enable_cors = config.server.cors;
    if config.server.share {
        warn!("sharing is enabled; the studio is reachable from other machines");
    }

    let mut studio = Studio::new(config)?;
    if let Some(model) = &cmd.model {
        let report = studio.load_model(model, cmd.adapter.as_deref())?;
        for notice in &report.notices {
            logging::info(notice);
        }
    }

    let app = router(studio, enable_cors);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| CliError::Server(format!("failed to bind {}: {}", addr, e)))?;
    info!("easel listening on {}", addr);
    logging::success(&format!("Studio running at http://{}", addr));

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| CliError::Server(e.to_string()))?;

    info!("server shutdown complete");
    Ok(())
}

/// Build the studio router. Public so the server can be embedded and the
/// API exercised in tests.
pub fn router(studio: Studio, enable_cors: bool) -> Router {
    let state = AppState {
        studio: Arc::new(Mutex::new(studio)),
        tracker: Arc::new(RequestTracker::new()),
    };

    let mut app = Router::new()
        .route("/", get(page_handler))
        .route("/health", get(health_handler))
        .route("/api/config", get(config_handler))
        .route("/api/state", get(state_handler))
        .route("/api/load", post(load_handler))
        .route("/api/generate", post(generate_handler))
        .route("/api/tags", post(tags_handler))
        .route("/api/copy", post(copy_handler))
        .route("/outputs/:name", get(output_handler))
        .with_state(state);

    app = app.layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::default())),
    );
    if enable_cors {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

// Wire types

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    model_loaded: bool,
    uptime_seconds: u64,
    requests_total: u64,
    active_requests: usize,
}

/// Everything the page needs to draw itself
#[derive(Debug, Serialize)]
struct PageConfig {
    defaults: GenerationDefaults,
    limits: GenerationLimits,
    catalog: CatalogConfig,
    tag_defaults: TagDefaults,
    ratings: Vec<&'static str>,
    aspect_ratios: Vec<&'static str>,
    lengths: Vec<&'static str>,
    ui: UiState,
}

/// Current session snapshot for clients that reconnect mid-session.
#[derive(Debug, Serialize)]
struct StateResponse {
    model_id: Option<String>,
    adapter_id: Option<String>,
    family: Option<crate::pipeline::PipelineFamily>,
    ui: UiState,
}

#[derive(Debug, Deserialize)]
struct LoadInput {
    model_id: String,
    #[serde(default)]
    adapter_id: Option<String>,
}

/// Generation body; omitted fields fall back to the configured defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GenerateInput {
    prompt: Option<String>,
    negative_prompt: Option<String>,
    width: Option<usize>,
    height: Option<usize>,
    steps: Option<usize>,
    guidance_scale: Option<f64>,
    clip_skip: Option<usize>,
    num_images: Option<usize>,
    seed: Option<u64>,
}

impl GenerateInput {
    fn into_request(self, defaults: &GenerationDefaults) -> GenerationRequest {
        let mut request = GenerationRequest::from_defaults(defaults);
        if let Some(prompt) = self.prompt {
            request.prompt = prompt;
        }
        if let Some(negative) = self.negative_prompt {
            request.negative_prompt = negative;
        }
        if let Some(width) = self.width {
            request.width = width;
        }
        if let Some(height) = self.height {
            request.height = height;
        }
        if let Some(steps) = self.steps {
            request.steps = steps;
        }
        if let Some(guidance) = self.guidance_scale {
            request.guidance_scale = guidance;
        }
        if let Some(clip_skip) = self.clip_skip {
            request.clip_skip = clip_skip;
        }
        if let Some(count) = self.num_images {
            request.num_images = count;
        }
        request.seed = self.seed;
        request
    }
}

#[derive(Debug, Serialize)]
struct GenerateResponse {
    paths: Vec<PathBuf>,
    urls: Vec<String>,
    elapsed_ms: u64,
}

/// Tag body; omitted fields fall back to the configured defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TagsInput {
    copyright: Option<String>,
    character: Option<String>,
    general: Option<String>,
    rating: Option<Rating>,
    aspect_ratio: Option<AspectRatio>,
    length: Option<TagLength>,
}

impl TagsInput {
    fn into_request(self, defaults: &TagDefaults) -> TagPromptRequest {
        let mut request = TagPromptRequest::from_defaults(defaults);
        if let Some(copyright) = self.copyright {
            request.copyright = copyright;
        }
        if let Some(character) = self.character {
            request.character = character;
        }
        if let Some(general) = self.general {
            request.general = general;
        }
        if let Some(rating) = self.rating {
            request.rating = rating;
        }
        if let Some(ratio) = self.aspect_ratio {
            request.aspect_ratio = ratio;
        }
        if let Some(length) = self.length {
            request.length = length;
        }
        request
    }
}

#[derive(Debug, Deserialize)]
struct CopyInput {
    text: String,
}

#[derive(Debug, Serialize)]
struct CopyResponse {
    copied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    notice: Option<&'static str>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
    request_id: String,
}

struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

impl ApiError {
    fn new(error: Error, request_id: String) -> Self {
        let (status, code) = match &error {
            Error::InvalidInput(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
            Error::Download(_) => (StatusCode::BAD_GATEWAY, "DOWNLOAD_FAILED"),
            Error::ModelLoading(_) => (StatusCode::INTERNAL_SERVER_ERROR, "MODEL_ERROR"),
            Error::Tokenizer(_) => (StatusCode::INTERNAL_SERVER_ERROR, "TOKENIZER_ERROR"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };
        Self {
            status,
            body: ErrorResponse {
                error: error.to_string(),
                code,
                request_id,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

// Handlers

async fn page_handler() -> Html<&'static str> {
    Html(PAGE)
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let model_loaded = state.studio.lock().await.pipeline().is_some();
    let stats = state.tracker.snapshot();
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        model_loaded,
        uptime_seconds: state.tracker.uptime().as_secs(),
        requests_total: stats.total,
        active_requests: stats.active,
    })
}

async fn config_handler(State(state): State<AppState>) -> Json<PageConfig> {
    let studio = state.studio.lock().await;
    let config = studio.config();
    Json(PageConfig {
        defaults: config.generation.defaults.clone(),
        limits: config.generation.limits.clone(),
        catalog: config.catalog.clone(),
        tag_defaults: config.tagger.defaults.clone(),
        ratings: Rating::ALL.iter().map(|v| v.wire_name()).collect(),
        aspect_ratios: AspectRatio::ALL.iter().map(|v| v.wire_name()).collect(),
        lengths: TagLength::ALL.iter().map(|v| v.wire_name()).collect(),
        ui: studio.ui(),
    })
}

async fn state_handler(State(state): State<AppState>) -> Json<StateResponse> {
    let studio = state.studio.lock().await;
    let pipeline = studio.pipeline();
    Json(StateResponse {
        model_id: pipeline.map(|p| p.model_id.clone()),
        adapter_id: pipeline.and_then(|p| p.adapter_id.clone()),
        family: pipeline.map(|p| p.family),
        ui: studio.ui(),
    })
}

async fn load_handler(
    State(state): State<AppState>,
    Json(input): Json<LoadInput>,
) -> Result<Json<LoadReport>, ApiError> {
    let request_id = state.tracker.begin();
    let result = state
        .studio
        .lock()
        .await
        .load_model(&input.model_id, input.adapter_id.as_deref());
    state.tracker.finish(result.is_ok());
    result
        .map(Json)
        .map_err(|error| ApiError::new(error, request_id))
}

async fn generate_handler(
    State(state): State<AppState>,
    Json(input): Json<GenerateInput>,
) -> Result<Json<GenerateResponse>, ApiError> {
    let request_id = state.tracker.begin();
    let started = std::time::Instant::now();

    let studio = state.studio.lock().await;
    let request = input.into_request(&studio.config().generation.defaults);
    let result = studio.generate(&request);
    drop(studio);
    state.tracker.finish(result.is_ok());

    match result {
        Ok(set) => {
            let urls = set
                .paths
                .iter()
                .filter_map(|path| path.file_name())
                .map(|name| format!("/outputs/{}", name.to_string_lossy()))
                .collect();
            Ok(Json(GenerateResponse {
                paths: set.paths,
                urls,
                elapsed_ms: started.elapsed().as_millis() as u64,
            }))
        }
        Err(error) => Err(ApiError::new(error, request_id)),
    }
}

async fn tags_handler(
    State(state): State<AppState>,
    Json(input): Json<TagsInput>,
) -> Result<Json<TagReport>, ApiError> {
    let request_id = state.tracker.begin();

    let mut studio = state.studio.lock().await;
    let request = input.into_request(&studio.config().tagger.defaults);
    let result = studio.generate_tags(&request);
    drop(studio);
    state.tracker.finish(result.is_ok());

    result
        .map(Json)
        .map_err(|error| ApiError::new(error, request_id))
}

async fn copy_handler(
    State(state): State<AppState>,
    Json(input): Json<CopyInput>,
) -> Json<CopyResponse> {
    state.tracker.begin();
    let response = match crate::clipboard::copy_payload(&input.text) {
        Some(_) => CopyResponse {
            copied: true,
            notice: Some("Copied!"),
        },
        // A declined payload is still a completed request.
        None => CopyResponse {
            copied: false,
            notice: None,
        },
    };
    state.tracker.finish(true);
    Json(response)
}

/// Serve a finished image from the output directory. The name must be a
/// bare filename; anything that could walk the tree is refused.
async fn output_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    if name.contains(['/', '\\']) || name.contains("..") {
        return Err(StatusCode::NOT_FOUND);
    }
    let path = {
        let studio = state.studio.lock().await;
        studio.config().storage.output_dir.join(&name)
    };
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(([(header::CONTENT_TYPE, "image/png")], bytes)),
        Err(_) => Err(StatusCode::NOT_FOUND),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received, starting graceful shutdown");
}

/// Request accounting behind the health endpoint.
struct RequestTracker {
    started: std::time::Instant,
    next_id: AtomicU64,
    stats: parking_lot::RwLock<RequestStats>,
}

#[derive(Debug, Default, Clone, Copy)]
struct RequestStats {
    total: u64,
    succeeded: u64,
    failed: u64,
    active: usize,
}

impl RequestTracker {
    fn new() -> Self {
        Self {
            started: std::time::Instant::now(),
            next_id: AtomicU64::new(1),
            stats: parking_lot::RwLock::new(RequestStats::default()),
        }
    }

    fn begin(&self) -> String {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut stats = self.stats.write();
        stats.total += 1;
        stats.active += 1;
        format!("req-{}", id)
    }

    fn finish(&self, success: bool) {
        let mut stats = self.stats.write();
        stats.active = stats.active.saturating_sub(1);
        if success {
            stats.succeeded += 1;
        } else {
            stats.failed += 1;
        }
    }

    fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    fn snapshot(&self) -> RequestStats {
        *self.stats.read()
    }
}
