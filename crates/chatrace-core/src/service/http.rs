use std::sync::Arc;

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, State},
    http::{self, header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{ChatraceError, RaceError};
use crate::provider::{load_providers, HttpStreamOpener, ProviderDescriptor, StreamOpener};
use crate::race::{race_with_retry, RaceCoordinator, RetryPolicy};
use crate::types::{ConversationPayload, Message, Role};

/// Header naming the provider that won the race.
pub const WINNER_HEADER: &str = "x-chat-provider";

/// Shared state for HTTP handlers. Built once at startup.
pub struct AppState {
    pub config: Config,
    pub providers: Vec<ProviderDescriptor>,
    pub coordinator: RaceCoordinator,
    pub retry: RetryPolicy,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self, ChatraceError> {
        config.validate()?;
        let opener = HttpStreamOpener::from_config(&config)?;
        Ok(Self::with_opener(config, Arc::new(opener)))
    }

    /// State racing through a custom opener.
    pub fn with_opener(config: Config, opener: Arc<dyn StreamOpener>) -> Self {
        let providers = load_providers(&config);
        let coordinator = RaceCoordinator::from_config(opener, &config.race);
        let retry = RetryPolicy::from_config(&config.race);
        Self {
            config,
            providers,
            coordinator,
            retry,
        }
    }
}

/// Errors surfaced to HTTP callers. Upstream detail stays in the logs.
#[derive(Debug)]
pub enum ApiError {
    MalformedRequest(String),
    ConfigurationMissing,
    Upstream(RaceError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::MalformedRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
            }
            ApiError::ConfigurationMissing | ApiError::Upstream(RaceError::ConfigurationMissing) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "No upstream providers configured" })),
            )
                .into_response(),
            ApiError::Upstream(err) => {
                let attempts = match &err {
                    RaceError::Exhausted { attempts, .. } => *attempts,
                    _ => 1,
                };
                (
                    StatusCode::BAD_GATEWAY,
                    Json(json!({
                        "error": "All upstream providers failed",
                        "status": err.upstream_status(),
                        "attempts": attempts,
                    })),
                )
                    .into_response()
            }
        }
    }
}

/// Decoded body of `POST /api/v1/chat`.
#[derive(Debug)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub is_first: bool,
}

fn malformed(message: impl Into<String>) -> ApiError {
    ApiError::MalformedRequest(message.into())
}

/// Validate a chat body. Only user and assistant turns are accepted; the
/// system instruction is always supplied server-side.
pub fn parse_chat_request(body: &Value) -> Result<ChatRequest, ApiError> {
    let object = body
        .as_object()
        .ok_or_else(|| malformed("request body must be a JSON object"))?;
    let items = object
        .get("messages")
        .and_then(Value::as_array)
        .ok_or_else(|| malformed("`messages` must be an array"))?;
    let messages = items
        .iter()
        .enumerate()
        .map(|(i, item)| parse_message(i, item))
        .collect::<Result<Vec<_>, _>>()?;
    let is_first = object
        .get("isFirst")
        .or_else(|| object.get("is_first"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    Ok(ChatRequest { messages, is_first })
}

fn parse_message(index: usize, item: &Value) -> Result<Message, ApiError> {
    let role = match item.get("role").and_then(Value::as_str) {
        Some("user") => Role::User,
        Some("assistant") => Role::Assistant,
        Some("system") => {
            return Err(malformed(format!(
                "messages[{index}]: system messages are not accepted"
            )))
        }
        _ => {
            return Err(malformed(format!(
                "messages[{index}]: role must be \"user\" or \"assistant\""
            )))
        }
    };
    let content = match item.get("content") {
        Some(content @ (Value::String(_) | Value::Array(_))) => content.clone(),
        _ => {
            return Err(malformed(format!(
                "messages[{index}]: content must be text or an array of parts"
            )))
        }
    };
    Ok(Message { role, content })
}

/// Build the HTTP router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/chat", post(handle_chat))
        .route("/api/v1/providers", get(handle_providers))
        .route("/health", get(handle_health))
        .layer(CompressionLayer::new())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([http::Method::GET, http::Method::POST, http::Method::OPTIONS])
                .allow_headers([http::header::CONTENT_TYPE, http::header::AUTHORIZATION])
                .expose_headers([HeaderName::from_static(WINNER_HEADER)]),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// POST /api/v1/chat: race the providers and stream the winner back.
async fn handle_chat(
    State(state): State<Arc<AppState>>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(body) = body.map_err(|e| malformed(e.body_text()))?;
    let request = parse_chat_request(&body)?;
    if state.providers.is_empty() {
        return Err(ApiError::ConfigurationMissing);
    }

    let payload = Arc::new(ConversationPayload::new(
        state.config.prompt.system_message(request.is_first),
        request.messages,
    ));

    // Cancelled when this request goes away: mid-race if the handler future
    // is dropped, otherwise when the response body is dropped.
    let request_token = CancellationToken::new();
    let guard = request_token.clone().drop_guard();

    let result = race_with_retry(
        &state.coordinator,
        &state.retry,
        &state.providers,
        payload,
        &request_token,
    )
    .await
    .map_err(|e| {
        warn!("Chat request failed: {}", e);
        ApiError::Upstream(e)
    })?;

    info!("Streaming reply from {} ({:?} to first output)", result.winner, result.elapsed);

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    match winner_header(&result.winner, &result.winner_id) {
        Some(winner) => {
            headers.insert(HeaderName::from_static(WINNER_HEADER), winner);
        }
        None => warn!("Winner {:?} has no valid header form", result.winner),
    }

    let mut upstream = result.stream;
    let body = Box::pin(async_stream::stream! {
        let _guard = guard;
        while let Some(chunk) = upstream.next().await {
            yield chunk;
        }
    });

    Ok((StatusCode::OK, headers, Body::from_stream(body)).into_response())
}

/// Header value naming the winner: its display name, else its id.
fn winner_header(name: &str, id: &str) -> Option<HeaderValue> {
    HeaderValue::from_str(name)
        .or_else(|_| HeaderValue::from_str(id))
        .ok()
}

#[derive(Serialize)]
struct ProviderInfo {
    id: String,
    name: String,
    model: String,
}

/// GET /api/v1/providers: configured providers, without credentials.
async fn handle_providers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let providers: Vec<ProviderInfo> = state
        .providers
        .iter()
        .map(|p| ProviderInfo {
            id: p.id.clone(),
            name: p.display_name.clone(),
            model: p.model.clone(),
        })
        .collect();
    Json(json!({ "providers": providers }))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

/// GET /health
async fn handle_health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: crate::VERSION.to_string(),
    })
}

/// Start the HTTP server.
pub async fn serve(addr: &str, state: Arc<AppState>) -> anyhow::Result<()> {
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);
    axum::serve(listener, router).await?;
    Ok(())
}
