mod audit;
mod dialogue;
mod store;
mod upstream;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bankchat_config::Config;
use bankchat_contracts::{
    contracts_manifest_v1, ContractsMetadata, Envelope, FailureBody, HistoryResponse,
    MessageResponse, TopicView, TurnRequest, API_VERSION,
};
use bankchat_kernel::TOPICS;
use serde::Deserialize;
use tokio::sync::Mutex;

pub use audit::{verify_audit_chain, AuditJsonl, TurnAuditRecord};
pub use dialogue::{DialogueRouter, InputError, TurnError, DEGRADED_NOTICE};
pub use store::{NewMessage, StoreBackend};
pub use upstream::{
    Collaborators, CompletionFallback, CompletionProvider, CompletionRequest,
    HttpCompletionClient, HttpRetriever, HttpSpeechToText, Passage, Retriever, SpeechToText,
    UpstreamError, SYSTEM_INSTRUCTION,
};

const DEFAULT_HISTORY_LIMIT: usize = 10;
const MAX_HISTORY_LIMIT: usize = 200;

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let app = build_app(cfg).await?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    tracing::info!(%addr, "bankchat listening");
    axum::serve(listener, app)
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

pub async fn build_app(cfg: Config) -> Result<Router, String> {
    let collaborators = Collaborators::from_config(&cfg)?;
    build_app_with(cfg, collaborators).await
}

/// Same as [`build_app`] with caller-supplied upstream services.
pub async fn build_app_with(cfg: Config, collaborators: Collaborators) -> Result<Router, String> {
    let state = AppState::new(cfg, collaborators).await?;
    Ok(Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/contracts", get(contracts))
        .route("/v1/turns", post(turns))
        .route("/v1/messages", get(history))
        .route("/v1/messages/{id}", get(message))
        .with_state(state))
}

#[derive(Clone)]
struct AppState {
    router: Arc<DialogueRouter>,
    store: Arc<Mutex<StoreBackend>>,
}

impl AppState {
    async fn new(cfg: Config, collaborators: Collaborators) -> Result<Self, String> {
        let store = Arc::new(Mutex::new(StoreBackend::open(&cfg.store)?));
        let audit = Arc::new(AuditJsonl::new(&cfg.audit.jsonl_path).await?);
        let completion = CompletionFallback::new(
            collaborators.completion,
            cfg.completion.circuit_breaker_failures,
            Duration::from_millis(cfg.completion.circuit_breaker_open_ms),
        );
        let retriever = collaborators
            .retriever
            .map(|retriever| (retriever, cfg.retrieval.top_k));
        let router = DialogueRouter::new(
            collaborators.speech,
            completion,
            retriever,
            store.clone(),
            audit,
        );
        Ok(Self {
            router: Arc::new(router),
            store,
        })
    }
}

fn failure(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(FailureBody::new(message))).into_response()
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn contracts() -> Json<ContractsMetadata> {
    let manifest = contracts_manifest_v1();
    Json(ContractsMetadata {
        api_version: API_VERSION.to_string(),
        openapi_sha256: manifest.openapi_sha256.to_string(),
        contracts_set_sha256: manifest.contracts_set_sha256.to_string(),
        generated_at: manifest.generated_at.to_string(),
        schemas: manifest
            .schemas
            .iter()
            .map(|s| (s.path.to_string(), s.sha256.to_string()))
            .collect(),
        topics: TOPICS
            .iter()
            .map(|t| TopicView {
                code: t.entry.to_string(),
                label: t.label.to_string(),
            })
            .collect(),
    })
}

async fn turns(
    State(state): State<AppState>,
    payload: Result<Json<TurnRequest>, JsonRejection>,
) -> Response {
    let turn = match payload {
        Ok(Json(turn)) => turn,
        Err(rejection) => {
            let err = InputError::MalformedRequest(rejection.body_text());
            tracing::info!(error = %err, "turn rejected before routing");
            return failure(StatusCode::BAD_REQUEST, err.to_string());
        }
    };

    match state.router.handle(turn).await {
        Ok(envelope @ Envelope::FreeForm(_)) => (StatusCode::CREATED, Json(envelope)).into_response(),
        Ok(envelope) => (StatusCode::OK, Json(envelope)).into_response(),
        Err(e @ TurnError::Input(_)) => failure(StatusCode::BAD_REQUEST, e.to_string()),
        Err(e @ TurnError::Persistence(_)) => {
            failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    chat_id: Option<i64>,
    limit: Option<usize>,
}

async fn history(
    State(state): State<AppState>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(q) => q,
        Err(rejection) => return failure(StatusCode::BAD_REQUEST, rejection.body_text()),
    };
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);

    let result = {
        let store = state.store.lock().await;
        store.history(query.chat_id, limit)
    };
    match result {
        Ok(messages) => Json(HistoryResponse {
            status: true,
            chat_id: query.chat_id,
            messages,
        })
        .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "history read failed");
            failure(StatusCode::INTERNAL_SERVER_ERROR, format!("persistence_failed: {e}"))
        }
    }
}

async fn message(
    State(state): State<AppState>,
    id: Result<Path<i64>, PathRejection>,
) -> Response {
    let Path(id) = match id {
        Ok(p) => p,
        Err(rejection) => return failure(StatusCode::BAD_REQUEST, rejection.body_text()),
    };

    let result = {
        let store = state.store.lock().await;
        store.get(id)
    };
    match result {
        Ok(Some(data)) => Json(MessageResponse {
            status: true,
            message: "Message found".to_string(),
            data,
        })
        .into_response(),
        Ok(None) => failure(StatusCode::NOT_FOUND, "Message not found"),
        Err(e) => {
            tracing::error!(error = %e, message_id = id, "message read failed");
            failure(StatusCode::INTERNAL_SERVER_ERROR, format!("persistence_failed: {e}"))
        }
    }
}
