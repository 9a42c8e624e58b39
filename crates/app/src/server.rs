//! HTTP surface for the conversational API.
//!
//! The engine loads in a background task at startup; until it is ready every
//! endpoint except `/health` answers 503.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use storechat_core::{
    load_embed_manifest, AnswerEvent, ChatAnswer, InMemorySessionStore, IndexInfo,
    OpenAiChatModel, OpenAiEmbedder, QueryEngine, QueryError, SessionStore, SqliteVectorIndex,
};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

const MAX_QUESTION_CHARS: usize = 2000;

type Engine = QueryEngine<OpenAiEmbedder, OpenAiChatModel, SqliteVectorIndex, InMemorySessionStore>;

pub struct ServeOptions {
    pub bind: String,
    pub index_file: PathBuf,
    pub embed_manifest: PathBuf,
    pub openai_api_key: String,
    pub openai_base_url: String,
    pub embedding_model: String,
    pub chat_model: String,
}

#[derive(Clone)]
struct AppState {
    engine: Arc<OnceLock<Arc<Engine>>>,
}

impl AppState {
    fn engine(&self) -> Result<&Arc<Engine>, ApiError> {
        self.engine
            .get()
            .ok_or_else(|| ApiError::not_ready("retrieval engine is still initializing"))
    }
}

pub async fn run(options: ServeOptions) -> anyhow::Result<()> {
    let state = AppState {
        engine: Arc::new(OnceLock::new()),
    };

    let holder = state.engine.clone();
    let bind = options.bind.clone();
    tokio::spawn(async move {
        match build_engine(options).await {
            Ok(engine) => {
                let _ = holder.set(Arc::new(engine));
                info!("retrieval engine ready");
            }
            Err(message) => error!(%message, "retrieval engine failed to initialize"),
        }
    });

    let app = Router::new()
        .route("/chat", post(chat))
        .route("/chat/stream", post(chat_stream))
        .route("/session", post(create_session))
        .route("/health", get(health))
        .route("/index-info", get(index_info))
        .with_state(state)
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = bind
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid bind address {bind}"))?;
    info!(%addr, "storechat API listening");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn build_engine(options: ServeOptions) -> Result<Engine, String> {
    if !options.index_file.exists() {
        return Err(format!(
            "vector index not found at {} (run the embed stage first)",
            options.index_file.display()
        ));
    }

    let embedder = OpenAiEmbedder::new(
        &options.openai_api_key,
        &options.openai_base_url,
        &options.embedding_model,
    )
    .map_err(|error| error.to_string())?;
    let chat = OpenAiChatModel::new(
        &options.openai_api_key,
        &options.openai_base_url,
        &options.chat_model,
    )
    .map_err(|error| error.to_string())?;
    let index = SqliteVectorIndex::open(&options.index_file)
        .await
        .map_err(|error| error.to_string())?;
    let manifest = load_embed_manifest(&options.embed_manifest).map_err(|error| error.to_string())?;

    Ok(
        QueryEngine::new(embedder, chat, index, InMemorySessionStore::new())
            .with_manifest(manifest),
    )
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    question: String,
    #[serde(default)]
    session_id: Option<String>,
}

impl ChatRequest {
    fn validate(&self) -> Result<(), ApiError> {
        let chars = self.question.chars().count();
        if self.question.trim().is_empty() {
            return Err(ApiError::bad_request("question must not be empty"));
        }
        if chars > MAX_QUESTION_CHARS {
            return Err(ApiError::bad_request(format!(
                "question exceeds {MAX_QUESTION_CHARS} characters"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct SessionResponse {
    session_id: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: String,
    index_loaded: bool,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_ready(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: message.into(),
        }
    }
}

impl From<QueryError> for ApiError {
    fn from(error: QueryError) -> Self {
        let status = match &error {
            QueryError::NotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
            QueryError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: format!("Error processing query: {error}"),
        }
    }
}

impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(ErrorBody { message: self.message })).into_response()
    }
}

async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatAnswer>, ApiError> {
    let engine = state.engine()?.clone();
    request.validate()?;

    let answer = engine
        .answer(&request.question, request.session_id.as_deref())
        .await?;
    Ok(Json(answer))
}

async fn chat_stream(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let engine = state.engine()?.clone();
    request.validate()?;

    let events = engine
        .answer_stream(&request.question, request.session_id.as_deref())
        .await?;

    let sse = events.map(|event| {
        Ok(match event {
            Ok(AnswerEvent::Token(token)) => sse_json("token", &token),
            Ok(AnswerEvent::Metadata(metadata)) => sse_json("metadata", &metadata),
            Err(error) => sse_json("error", &json!({ "error": error.to_string() })),
        })
    });

    Ok(Sse::new(sse))
}

fn sse_json<T: Serialize>(name: &str, payload: &T) -> SseEvent {
    match SseEvent::default().event(name).json_data(payload) {
        Ok(event) => event,
        Err(_) => SseEvent::default()
            .event("error")
            .data("{\"error\":\"event serialization failed\"}"),
    }
}

async fn create_session(State(state): State<AppState>) -> Result<Json<SessionResponse>, ApiError> {
    let engine = state.engine()?;
    Ok(Json(SessionResponse {
        session_id: engine.sessions().create(),
    }))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        timestamp: Utc::now().to_rfc3339(),
        index_loaded: state.engine.get().is_some(),
    })
}

async fn index_info(State(state): State<AppState>) -> Result<Json<IndexInfo>, ApiError> {
    let engine = state.engine()?.clone();
    Ok(Json(engine.index_info().await?))
}
