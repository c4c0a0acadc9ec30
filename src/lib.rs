pub mod auth;
pub mod config;
pub mod database;
pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod storage;
pub mod utils;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderName, Method},
    routing::{delete, get, head, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::{
    handlers::{events, health, metrics, trash, uploads, usage, AppState},
    middleware::{
        tus_resumable, TUS_EXTENSION, TUS_MAX_SIZE, TUS_RESUMABLE, TUS_VERSION_HEADER,
        UPLOAD_LENGTH, UPLOAD_METADATA, UPLOAD_OFFSET,
    },
    services::{spawn_periodic, BackgroundTasks, ChangeWatcher, NotifySource},
};

pub fn create_app(state: AppState) -> Router {
    let tus_headers: Vec<HeaderName> = vec![
        TUS_RESUMABLE,
        TUS_VERSION_HEADER,
        TUS_EXTENSION,
        TUS_MAX_SIZE,
        UPLOAD_OFFSET,
        UPLOAD_LENGTH,
        UPLOAD_METADATA,
        header::LOCATION,
    ];

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::HEAD,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any)
        .expose_headers(tus_headers);

    let upload_routes = Router::new()
        .route(
            "/api/uploads",
            get(uploads::list_uploads)
                .post(uploads::create_upload)
                .options(uploads::options_uploads),
        )
        .route(
            "/api/uploads/:id",
            head(uploads::head_upload)
                .patch(uploads::patch_upload)
                .delete(uploads::delete_upload),
        )
        .route_layer(axum::middleware::map_response(tus_resumable));

    let api_routes = Router::new()
        .route("/api/usage", get(usage::get_usage))
        .route("/api/files/*path", delete(trash::delete_file))
        .route("/api/trash", get(trash::list_trash))
        .route("/api/trash/:id/restore", post(trash::restore_entry))
        .route("/api/events", get(events::stream_events));

    Router::new()
        .route("/health", get(health::liveness))
        .route("/ready", get(health::readiness))
        .route("/metrics", get(metrics::metrics_handler))
        .merge(upload_routes)
        .merge(api_routes)
        .layer(DefaultBodyLimit::max(state.config.max_chunk_size))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Starts the upload reaper, the trash sweeper and, when enabled, the
/// filesystem watcher.
pub fn spawn_background_tasks(state: &AppState) -> BackgroundTasks {
    let mut tasks = BackgroundTasks::new();

    let uploads = state.uploads.clone();
    tasks.push(
        "upload-reaper",
        spawn_periodic(
            "upload-reaper",
            state.config.upload_reap_interval(),
            tasks.token(),
            move || {
                let uploads = uploads.clone();
                async move {
                    uploads.reap_idle().await;
                }
            },
        ),
    );

    let trash = state.trash.clone();
    tasks.push(
        "trash-sweeper",
        spawn_periodic(
            "trash-sweeper",
            state.config.trash_sweep_interval(),
            tasks.token(),
            move || {
                let trash = trash.clone();
                async move {
                    trash.sweep().await;
                }
            },
        ),
    );

    if state.config.watcher_enabled {
        match NotifySource::new(state.layout.root(), state.config.watch_queue_capacity) {
            Ok(source) => {
                let watcher = ChangeWatcher::new(
                    state.layout.clone(),
                    state.usage.clone(),
                    state.hub.clone(),
                    state.metrics.clone(),
                    state.own_writes.clone(),
                    state.config.watch_debounce(),
                );
                tasks.push("watcher", watcher.spawn(source, tasks.token()));
            }
            Err(e) => {
                warn!(error = %e, "filesystem watcher unavailable, usage relies on cache expiry");
            }
        }
    }

    info!(tasks = tasks.len(), "background tasks started");
    tasks
}
