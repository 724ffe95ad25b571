//! HTTP document service.
//!
//! Serves the revisioned document store over JSON:
//! - `GET /health`
//! - `GET /api/documents` lists stored documents
//! - `GET /api/documents/:document_id` returns `{id, rev, tracks}`
//! - `PUT /api/documents/:document_id` writes `{tracks, rev}`, answering 409
//!   with the current revision when `rev` is stale

use axum::{
    extract::{Path, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::storage::{DocumentStore, StorageError};
use crate::sync::protocol::{ConflictBody, Document, PutRequest, PutResponse};

// ============================================================================
// APPLICATION STATE
// ============================================================================

/// Shared application state
pub struct AppState {
    store: DocumentStore,
    started_at: Instant,
    shutdown_tx: broadcast::Sender<()>,
}

impl AppState {
    pub fn new(store: DocumentStore) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            store,
            started_at: Instant::now(),
            shutdown_tx,
        }
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    /// Periodically flush the store to disk until shutdown
    pub fn start_background_tasks(self: Arc<Self>, flush_interval: Duration) -> JoinHandle<()> {
        let state = self.clone();
        let mut shutdown = state.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(flush_interval);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = state.store.flush() {
                            error!("Failed to flush document store: {}", e);
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("Flush task shutting down");
                        if let Err(e) = state.store.flush() {
                            error!("Final flush failed: {}", e);
                        }
                        break;
                    }
                }
            }
        })
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

// ============================================================================
// API TYPES
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    uptime_seconds: u64,
    documents: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DocumentInfo {
    document_id: String,
    name: String,
    rev: u64,
    clip_count: u64,
    created_at: i64,
    updated_at: i64,
}

#[derive(Debug, Serialize)]
struct DocumentListResponse {
    documents: Vec<DocumentInfo>,
    total: usize,
}

/// Errors returned by the HTTP handlers
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Conflict { current: u64 },
    Storage(StorageError),
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::RevisionMismatch { current, .. } => ApiError::Conflict { current },
            other => ApiError::Storage(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound(id) => {
                (StatusCode::NOT_FOUND, format!("Document {} not found", id)).into_response()
            }
            ApiError::Conflict { current } => (
                StatusCode::CONFLICT,
                Json(ConflictBody {
                    success: false,
                    error: "Revision conflict".to_string(),
                    rev: current,
                }),
            )
                .into_response(),
            ApiError::Storage(e) => {
                error!("Storage error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Storage error".to_string()).into_response()
            }
        }
    }
}

// ============================================================================
// HTTP HANDLERS
// ============================================================================

/// Health check endpoint
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        documents: state.store.stats().document_count,
    })
}

/// List all documents
async fn list_documents(
    State(state): State<Arc<AppState>>,
) -> Result<Json<DocumentListResponse>, ApiError> {
    let documents: Vec<DocumentInfo> = state
        .store
        .list_documents()?
        .into_iter()
        .map(|meta| DocumentInfo {
            document_id: meta.document_id,
            name: meta.name,
            rev: meta.rev,
            clip_count: meta.clip_count,
            created_at: meta.created_at,
            updated_at: meta.updated_at,
        })
        .collect();

    let total = documents.len();
    Ok(Json(DocumentListResponse { documents, total }))
}

/// Fetch the current revision of a document
async fn get_document(
    Path(document_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Document>, ApiError> {
    state
        .store
        .get_document(&document_id)?
        .map(Json)
        .ok_or(ApiError::NotFound(document_id))
}

/// Write a document if `rev` matches the stored revision
async fn put_document(
    Path(document_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(request): Json<PutRequest>,
) -> Result<Json<PutResponse>, ApiError> {
    debug!("PUT document {} at rev {}", document_id, request.rev);

    let document = state
        .store
        .put_document(&document_id, request.rev, request.tracks)?;

    info!("Document {} now at rev {}", document_id, document.rev);
    Ok(Json(PutResponse {
        success: true,
        rev: document.rev,
        tracks: document.tracks,
    }))
}

/// Build the service router
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::PUT, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/api/documents", get(list_documents))
        .route(
            "/api/documents/:document_id",
            get(get_document).put(put_document),
        )
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageConfig;
    use crate::sync::protocol::Track;
    use tempfile::{tempdir, TempDir};

    fn state() -> (TempDir, Arc<AppState>) {
        let dir = tempdir().unwrap();
        let store = DocumentStore::open(StorageConfig::new(
            dir.path().join("server.sled").to_string_lossy().to_string(),
        ))
        .unwrap();
        (dir, Arc::new(AppState::new(store)))
    }

    #[tokio::test]
    async fn test_put_then_get_document() {
        let (_dir, state) = state();

        let Json(response) = put_document(
            Path("doc".to_string()),
            State(state.clone()),
            Json(PutRequest {
                tracks: vec![Track::subtitle(vec![])],
                rev: 0,
            }),
        )
        .await
        .unwrap();
        assert_eq!(response.rev, 1);

        let Json(document) = get_document(Path("doc".to_string()), State(state.clone()))
            .await
            .unwrap();
        assert_eq!(document.rev, 1);
        assert!(document.subtitle_track().is_some());

        let Json(list) = list_documents(State(state)).await.unwrap();
        assert_eq!(list.total, 1);
        assert_eq!(list.documents[0].rev, 1);
    }

    #[tokio::test]
    async fn test_stale_put_maps_to_conflict_response() {
        let (_dir, state) = state();
        let request = PutRequest {
            tracks: vec![],
            rev: 0,
        };
        put_document(Path("doc".to_string()), State(state.clone()), Json(request.clone()))
            .await
            .unwrap();

        let err = put_document(Path("doc".to_string()), State(state), Json(request))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Conflict { current: 1 }));
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_missing_document_is_not_found() {
        let (_dir, state) = state();
        let err = get_document(Path("nope".to_string()), State(state))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_background_flush_stops_on_shutdown() {
        let (_dir, state) = state();
        let handle = state.clone().start_background_tasks(Duration::from_millis(10));

        state.shutdown();
        handle.await.unwrap();
    }
}
