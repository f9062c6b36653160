pub mod auth;
pub mod error;
pub mod form;
pub mod invite;
pub mod photos;
pub mod storage;

use std::sync::Arc;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

use bellatrix_db::Database;

use crate::error::ApiError;
use crate::storage::Storage;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub storage: Storage,
    pub jwt_secret: String,
    /// Request body cap for the multipart endpoints.
    pub max_upload_bytes: usize,
}

/// All `/api` routes. Static files and the gateway are mounted by the server.
pub fn router(state: AppState) -> Router {
    let max_upload = state.max_upload_bytes;

    Router::new()
        .route("/api/register", post(auth::register))
        .route("/api/login", post(auth::login))
        // One path pattern: GET/POST take a couple id, DELETE a photo id
        .route(
            "/api/photos/{id}",
            get(photos::list_photos)
                .post(photos::upload_photo)
                .delete(photos::delete_photo),
        )
        .route("/api/photos/{id}/like", post(photos::toggle_like))
        .layer(DefaultBodyLimit::max(max_upload))
        .with_state(state)
}

/// Run a blocking store call off the async runtime.
pub(crate) async fn run_db<F, T>(state: &AppState, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let db = state.db.clone();
    tokio::task::spawn_blocking(move || f(&db))
        .await
        .map_err(|e| anyhow::anyhow!("spawn_blocking join error: {}", e))?
        .map_err(ApiError::from)
}
