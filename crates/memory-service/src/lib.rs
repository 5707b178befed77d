#![deny(unsafe_code)]

pub mod config;
pub mod outbox_worker;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, patch, post, put};
use axum::{Json, Router};
use chrono::Utc;
use memory_adapters::{HttpEmbedder, HttpSearchIndex, MockEmbedder, MockSearchIndex, PostgresStore};
use memory_core::connectors::{Embedder, SearchIndex};
use memory_core::error::MemoryError;
use memory_core::health::HealthAggregator;
use memory_core::store::{InMemoryStore, Store};
use memory_core::types::{
    CorrectEntryRequest, CreateEntryRequest, ListEntriesFilter, Memory, MemoryContext, MemoryEntry,
    MemoryType, SearchRequest, SearchResult, Vault,
};
use memory_core::service::{MemoryService, MemoryServiceConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{CollaboratorConfig, Config, StorageConfig};
use crate::outbox_worker::OutboxWorker;

/// Everything an HTTP handler needs. Handlers only ever reach the store,
/// search index, or embedder through `service`.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<MemoryService>,
    pub health: Arc<HealthAggregator>,
}

/// Builds the store/search-index/embedder triad from configuration and
/// wraps them in a `MemoryService`.
pub async fn bootstrap(config: &Config) -> anyhow::Result<AppState> {
    let store: Arc<dyn Store> = match &config.storage {
        StorageConfig::Memory => Arc::new(InMemoryStore::new()),
        StorageConfig::Postgres {
            database_url,
            max_connections,
        } => Arc::new(PostgresStore::connect(database_url, *max_connections).await?),
    };

    let search_index: Arc<dyn SearchIndex> = match &config.search_index {
        CollaboratorConfig::Mock => Arc::new(MockSearchIndex::new()),
        CollaboratorConfig::Http { base_url } => Arc::new(HttpSearchIndex::new(
            base_url.clone(),
            config.http_request_timeout(),
        )?),
    };

    let embedder: Arc<dyn Embedder> = match &config.embedder {
        CollaboratorConfig::Mock => Arc::new(MockEmbedder::default()),
        CollaboratorConfig::Http { base_url } => Arc::new(HttpEmbedder::new(
            base_url.clone(),
            "default",
            config.http_request_timeout(),
        )?),
    };

    let service_config = MemoryServiceConfig {
        default_context_document: config.domain.default_context_document.clone(),
        max_context_chars: config.domain.max_context_chars,
        hybrid_alpha: config.domain.hybrid_alpha,
    };
    let service = Arc::new(MemoryService::new(store, search_index, embedder, service_config));
    let health = Arc::new(HealthAggregator::new());

    Ok(AppState { service, health })
}

/// Spawns the periodic dependency prober that feeds `/health` and gates
/// startup (§4.6). Runs for the lifetime of the process.
pub fn spawn_health_prober(state: AppState, probe_interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(probe_interval);
        loop {
            ticker.tick().await;
            let store_ok = state.service.store().ping().await.is_ok();
            let index_ok = state.service.search_index().ping().await.is_ok();
            let embedder_ok = probe_embedder(&state).await;
            state.health.report_store(store_ok);
            state.health.report_search_index(index_ok);
            state.health.report_embedder(embedder_ok);
        }
    })
}

async fn probe_embedder(state: &AppState) -> bool {
    state.service.embedder().embed("healthcheck").await.is_ok()
}

/// Spawns the outbox worker as a background task (§4.3).
pub fn spawn_outbox_worker(
    state: &AppState,
    worker_config: crate::config::OutboxWorkerConfig,
) -> (Arc<OutboxWorker>, tokio::task::JoinHandle<()>) {
    let worker = Arc::new(OutboxWorker::new(
        state.service.store().clone(),
        state.service.search_index().clone(),
        state.service.embedder().clone(),
        state.health.clone(),
        worker_config,
    ));
    let handle = tokio::spawn(worker.clone().run());
    (worker, handle)
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/actors/:actor_id/vaults", post(create_vault).get(list_vaults))
        .route(
            "/v1/actors/:actor_id/vaults/:vault_id",
            get(get_vault).delete(delete_vault),
        )
        .route(
            "/v1/actors/:actor_id/vaults/:vault_id/memories",
            post(create_memory).get(list_memories),
        )
        .route(
            "/v1/actors/:actor_id/vaults/:vault_id/memories/:memory_id",
            get(get_memory).delete(delete_memory),
        )
        .route(
            "/v1/actors/:actor_id/vaults/:vault_id/memories/:memory_id/entries",
            post(create_entry).get(list_entries),
        )
        .route(
            "/v1/actors/:actor_id/vaults/:vault_id/memories/:memory_id/entries/:entry_id",
            get(get_entry).delete(delete_entry),
        )
        .route(
            "/v1/actors/:actor_id/vaults/:vault_id/memories/:memory_id/entries/:entry_id/tags",
            patch(update_entry_tags),
        )
        .route(
            "/v1/actors/:actor_id/vaults/:vault_id/memories/:memory_id/entries/:entry_id/summary",
            patch(update_entry_summary),
        )
        .route(
            "/v1/actors/:actor_id/vaults/:vault_id/memories/:memory_id/entries/:entry_id/correct",
            post(correct_entry),
        )
        .route(
            "/v1/actors/:actor_id/vaults/:vault_id/memories/:memory_id/context",
            put(put_context),
        )
        .route(
            "/v1/actors/:actor_id/vaults/:vault_id/memories/:memory_id/context/latest",
            get(get_latest_context),
        )
        .route(
            "/v1/actors/:actor_id/vaults/:vault_id/memories/:memory_id/context/:context_id",
            delete(delete_context),
        )
        .route(
            "/v1/actors/:actor_id/memories/:memory_id/search",
            post(search),
        )
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Domain(#[from] MemoryError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let ApiError::Domain(err) = self;
        let (status, code) = match &err {
            MemoryError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            MemoryError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            // I9's code-point cap is reported as 413 (S6); every other
            // validation failure is 400.
            MemoryError::Validation(message) if message.contains("exceeds maximum") => {
                (StatusCode::PAYLOAD_TOO_LARGE, "VALIDATION_FAILED")
            }
            MemoryError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_FAILED"),
            MemoryError::ImmutabilityViolation(_) => (StatusCode::BAD_REQUEST, "IMMUTABILITY_VIOLATION"),
            MemoryError::DependencyUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "DEPENDENCY_UNAVAILABLE")
            }
            MemoryError::Store(_) | MemoryError::SearchIndex(_) | MemoryError::Embedder(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL")
            }
            MemoryError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
        };
        (
            status,
            Json(serde_json::json!({ "code": code, "message": err.to_string() })),
        )
            .into_response()
    }
}

/// Response body for `GET /health` (§6). Always 200; callers poll
/// `status` rather than treating a non-2xx as the unhealthy signal.
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: chrono::DateTime<Utc>,
    store_healthy: bool,
    search_index_healthy: bool,
    embedder_healthy: bool,
    oldest_pending_outbox_age_seconds: Option<i64>,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let snapshot = state.health.snapshot();
    let oldest_pending_outbox_age_seconds = state
        .service
        .store()
        .oldest_pending_outbox_age()
        .await
        .ok()
        .flatten()
        .map(|age| age.num_seconds());

    Json(HealthResponse {
        status: if snapshot.healthy { "healthy" } else { "unhealthy" },
        timestamp: Utc::now(),
        store_healthy: snapshot.store_healthy,
        search_index_healthy: snapshot.search_index_healthy,
        embedder_healthy: snapshot.embedder_healthy,
        oldest_pending_outbox_age_seconds,
    })
}

#[derive(Debug, Deserialize)]
struct CreateVaultRequest {
    title: String,
}

async fn create_vault(
    State(state): State<AppState>,
    Path(actor_id): Path<String>,
    Json(request): Json<CreateVaultRequest>,
) -> Result<Json<Vault>, ApiError> {
    Ok(Json(state.service.create_vault(&actor_id, request.title).await?))
}

async fn list_vaults(
    State(state): State<AppState>,
    Path(actor_id): Path<String>,
) -> Result<Json<Vec<Vault>>, ApiError> {
    Ok(Json(state.service.list_vaults(&actor_id).await?))
}

async fn get_vault(
    State(state): State<AppState>,
    Path((actor_id, vault_id)): Path<(String, String)>,
) -> Result<Json<Vault>, ApiError> {
    Ok(Json(state.service.get_vault(&actor_id, &vault_id).await?))
}

async fn delete_vault(
    State(state): State<AppState>,
    Path((actor_id, vault_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    state.service.delete_vault(&actor_id, &vault_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct CreateMemoryRequest {
    title: String,
    #[serde(default = "default_memory_type")]
    memory_type: MemoryType,
}

fn default_memory_type() -> MemoryType {
    MemoryType::Other
}

#[derive(Debug, Serialize)]
struct CreateMemoryResponse {
    memory: Memory,
    context: MemoryContext,
}

async fn create_memory(
    State(state): State<AppState>,
    Path((actor_id, vault_id)): Path<(String, String)>,
    Json(request): Json<CreateMemoryRequest>,
) -> Result<Json<CreateMemoryResponse>, ApiError> {
    let (memory, context) = state
        .service
        .create_memory(&actor_id, &vault_id, request.title, request.memory_type)
        .await?;
    Ok(Json(CreateMemoryResponse { memory, context }))
}

async fn list_memories(
    State(state): State<AppState>,
    Path((actor_id, vault_id)): Path<(String, String)>,
) -> Result<Json<Vec<Memory>>, ApiError> {
    Ok(Json(state.service.list_memories(&actor_id, &vault_id).await?))
}

async fn get_memory(
    State(state): State<AppState>,
    Path((actor_id, vault_id, memory_id)): Path<(String, String, String)>,
) -> Result<Json<Memory>, ApiError> {
    Ok(Json(state.service.get_memory(&actor_id, &vault_id, &memory_id).await?))
}

async fn delete_memory(
    State(state): State<AppState>,
    Path((actor_id, vault_id, memory_id)): Path<(String, String, String)>,
) -> Result<StatusCode, ApiError> {
    state.service.delete_memory(&actor_id, &vault_id, &memory_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_entry(
    State(state): State<AppState>,
    Path((actor_id, vault_id, memory_id)): Path<(String, String, String)>,
    Json(request): Json<CreateEntryRequest>,
) -> Result<Json<MemoryEntry>, ApiError> {
    Ok(Json(
        state
            .service
            .create_entry(&actor_id, &vault_id, &memory_id, request)
            .await?,
    ))
}

async fn list_entries(
    State(state): State<AppState>,
    Path((actor_id, vault_id, memory_id)): Path<(String, String, String)>,
    Query(filter): Query<ListEntriesFilter>,
) -> Result<Json<Vec<MemoryEntry>>, ApiError> {
    Ok(Json(
        state
            .service
            .list_entries(&actor_id, &vault_id, &memory_id, filter)
            .await?,
    ))
}

async fn get_entry(
    State(state): State<AppState>,
    Path((actor_id, vault_id, memory_id, entry_id)): Path<(String, String, String, String)>,
) -> Result<Json<MemoryEntry>, ApiError> {
    Ok(Json(
        state
            .service
            .get_entry(&actor_id, &vault_id, &memory_id, &entry_id)
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
struct UpdateTagsRequest {
    tags: serde_json::Value,
}

async fn update_entry_tags(
    State(state): State<AppState>,
    Path((actor_id, vault_id, memory_id, entry_id)): Path<(String, String, String, String)>,
    Json(request): Json<UpdateTagsRequest>,
) -> Result<Json<MemoryEntry>, ApiError> {
    Ok(Json(
        state
            .service
            .update_entry_tags(&actor_id, &vault_id, &memory_id, &entry_id, request.tags)
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
struct UpdateSummaryRequest {
    summary: String,
}

async fn update_entry_summary(
    State(state): State<AppState>,
    Path((actor_id, vault_id, memory_id, entry_id)): Path<(String, String, String, String)>,
    Json(request): Json<UpdateSummaryRequest>,
) -> Result<Json<MemoryEntry>, ApiError> {
    Ok(Json(
        state
            .service
            .update_entry_summary(&actor_id, &vault_id, &memory_id, &entry_id, request.summary)
            .await?,
    ))
}

#[derive(Debug, Serialize)]
struct CorrectEntryResponse {
    original: MemoryEntry,
    corrected: MemoryEntry,
}

async fn correct_entry(
    State(state): State<AppState>,
    Path((actor_id, vault_id, memory_id, entry_id)): Path<(String, String, String, String)>,
    Json(request): Json<CorrectEntryRequest>,
) -> Result<Json<CorrectEntryResponse>, ApiError> {
    let (original, corrected) = state
        .service
        .correct_entry(&actor_id, &vault_id, &memory_id, &entry_id, request)
        .await?;
    Ok(Json(CorrectEntryResponse { original, corrected }))
}

async fn delete_entry(
    State(state): State<AppState>,
    Path((actor_id, vault_id, memory_id, entry_id)): Path<(String, String, String, String)>,
) -> Result<StatusCode, ApiError> {
    state
        .service
        .delete_entry(&actor_id, &vault_id, &memory_id, &entry_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Body is the raw document (`text/plain; charset=utf-8`), not a JSON
/// envelope, per §6.
async fn put_context(
    State(state): State<AppState>,
    Path((actor_id, vault_id, memory_id)): Path<(String, String, String)>,
    document: String,
) -> Result<Response, ApiError> {
    let context = state
        .service
        .put_context(&actor_id, &vault_id, &memory_id, document)
        .await?;
    Ok((StatusCode::CREATED, Json(context)).into_response())
}

/// Returns the document as a plain-text body, per §6.
async fn get_latest_context(
    State(state): State<AppState>,
    Path((actor_id, vault_id, memory_id)): Path<(String, String, String)>,
) -> Result<Response, ApiError> {
    let context = state
        .service
        .get_latest_context(&actor_id, &vault_id, &memory_id)
        .await?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        context.document,
    )
        .into_response())
}

async fn delete_context(
    State(state): State<AppState>,
    Path((actor_id, vault_id, memory_id, context_id)): Path<(String, String, String, String)>,
) -> Result<StatusCode, ApiError> {
    state
        .service
        .delete_context(&actor_id, &vault_id, &memory_id, &context_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn search(
    State(state): State<AppState>,
    Path((actor_id, memory_id)): Path<(String, String)>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchResult>, ApiError> {
    Ok(Json(state.service.search(&actor_id, &memory_id, request).await?))
}

/// Blocks until every dependency has reported healthy at least once, or the
/// deadline elapses, logging the outcome either way (§4.6). Intended to run
/// before `axum::serve` begins accepting connections. Returns whether the
/// service reached a healthy state in time; the caller is expected to treat
/// `false` as a fatal startup failure.
pub async fn wait_for_startup_health(state: &AppState, probe_interval: Duration, deadline: Duration) -> bool {
    if state.health.wait_until_healthy(probe_interval, deadline).await {
        info!("all dependencies healthy, accepting traffic");
        true
    } else {
        warn!("startup deadline elapsed before all dependencies reported healthy");
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn test_state() -> AppState {
        bootstrap(&Config::default()).await.unwrap()
    }

    #[tokio::test]
    async fn create_vault_then_list_returns_it() {
        let state = test_state().await;
        let app = build_router(state);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/actors/actor-1/vaults")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::json!({ "title": "personal" }).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let vault: Vault = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(vault.title, "personal");

        let response = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/v1/actors/actor-1/vaults")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let vaults: Vec<Vault> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(vaults.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_vault_title_returns_conflict() {
        let state = test_state().await;
        let app = build_router(state);

        let make_request = || {
            Request::builder()
                .method("POST")
                .uri("/v1/actors/actor-1/vaults")
                .header("content-type", "application/json")
                .body(Body::from(serde_json::json!({ "title": "personal" }).to_string()))
                .unwrap()
        };

        let response = app.clone().oneshot(make_request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.oneshot(make_request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn unknown_vault_returns_not_found() {
        let state = test_state().await;
        let app = build_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/v1/actors/actor-1/vaults/does-not-exist")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn health_reports_unhealthy_status_with_200_before_probes_run() {
        let state = test_state().await;
        let app = build_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "unhealthy");
    }

    #[tokio::test]
    async fn correcting_an_entry_twice_returns_immutability_violation() {
        let state = test_state().await;
        let service = state.service.clone();
        let vault = service.create_vault("actor-1", "v".to_string()).await.unwrap();
        let (memory, _) = service
            .create_memory("actor-1", &vault.vault_id, "m".to_string(), MemoryType::Other)
            .await
            .unwrap();
        let entry = service
            .create_entry(
                "actor-1",
                &vault.vault_id,
                &memory.memory_id,
                CreateEntryRequest {
                    raw_entry: "original".to_string(),
                    summary: None,
                    metadata: serde_json::json!({}),
                    tags: serde_json::json!({}),
                    expiration_time: None,
                },
            )
            .await
            .unwrap();

        let app = build_router(state);
        let correction_body =
            serde_json::json!({ "raw_entry": "fixed", "summary": null, "reason": "typo" }).to_string();
        let uri = format!(
            "/v1/actors/actor-1/vaults/{}/memories/{}/entries/{}/correct",
            vault.vault_id, memory.memory_id, entry.entry_id
        );

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri.clone())
                    .header("content-type", "application/json")
                    .body(Body::from(correction_body.clone()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(correction_body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn get_latest_context_returns_default_document_as_plain_text() {
        let state = test_state().await;
        let service = state.service.clone();
        let vault = service.create_vault("actor-1", "v".to_string()).await.unwrap();
        let (memory, _) = service
            .create_memory("actor-1", &vault.vault_id, "m".to_string(), MemoryType::Other)
            .await
            .unwrap();

        let app = build_router(state);
        let uri = format!(
            "/v1/actors/actor-1/vaults/{}/memories/{}/context/latest",
            vault.vault_id, memory.memory_id
        );
        let response = app
            .oneshot(Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(
            String::from_utf8(bytes.to_vec()).unwrap(),
            "New memory created. No context yet."
        );
    }

    #[tokio::test]
    async fn put_context_exceeding_max_chars_returns_413() {
        let mut config = Config::default();
        config.domain.max_context_chars = 8;
        let state = bootstrap(&config).await.unwrap();
        let service = state.service.clone();
        let vault = service.create_vault("actor-1", "v".to_string()).await.unwrap();
        let (memory, _) = service
            .create_memory("actor-1", &vault.vault_id, "m".to_string(), MemoryType::Other)
            .await
            .unwrap();

        let app = build_router(state);
        let uri = format!(
            "/v1/actors/actor-1/vaults/{}/memories/{}/context",
            vault.vault_id, memory.memory_id
        );
        let response = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri(uri)
                    .header("content-type", "text/plain; charset=utf-8")
                    .body(Body::from("this document is far longer than eight code points"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
