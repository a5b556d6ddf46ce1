pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod models;
pub mod services;
pub mod storage;

use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::db::Database;
use crate::storage::StorageProvider;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub config: Arc<Config>,
    pub storage: Arc<dyn StorageProvider>,
}

pub fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let body_limit = DefaultBodyLimit::max(state.config.upload.max_body_bytes);

    let transformer_routes = Router::new()
        // Package files
        .route("/aasx", post(handlers::package::upload_aasx))
        .route("/json", post(handlers::package::upload_json))
        .route("/uploadedFileNames", get(handlers::package::list_file_names))
        .route(
            "/uploadedJsonFileNames",
            get(handlers::package::list_json_file_names),
        )
        .route("/uploaded/:file_name", delete(handlers::package::delete_package))
        .route(
            "/download/environment/:file_name",
            get(handlers::package::download_environment),
        )
        .route(
            "/attachment/fileMetas/package/:file_name",
            get(handlers::package::package_attachments),
        )
        // Attachment metadata
        .route("/file-metas", get(handlers::attachment::list_file_metas))
        .route("/file-metas/:composite_key", get(handlers::attachment::get_file_meta))
        .route("/delete/file", delete(handlers::attachment::delete_file_meta))
        // Blobs
        .route("/download/:hash_and_ext", get(handlers::blob::download))
        .route("/files", get(handlers::blob::list_blobs))
        .route("/consistency", get(handlers::blob::consistency));

    Router::new()
        .nest("/api/transformer", transformer_routes)
        .layer(body_limit)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
