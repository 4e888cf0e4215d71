use super::conversation::normalize;
use super::pipelines::worker::{BackendStatus, WorkerEvent};
use super::requests::ChatCompletionRequest;
use super::responses::{APIError, ChatCompletionResponse, ChatCompletionUsageResponse, ChatResponder};
use super::sampling_params::SamplingParams;
use super::streaming::Streamer;
use super::utils::{get_created_time_secs, new_completion_id};
use super::OpenAIServerData;
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{self, Method};
use axum::response::sse::KeepAlive;
use axum::routing::{get, post};
use axum::{response::Sse, Json, Router};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{debug, error, info, warn};
use utoipa::OpenApi;

#[utoipa::path(
    post,
    tag = "minicpm-api",
    path = "/v1/chat/completions",
    request_body(content = inline(serde_json::Value), description = "Chat completion request"),
    responses(
        (status = 200, description = "Chat completion, or an SSE stream of chunks when `stream` is set"),
        (status = 400, description = "Invalid request or undecodable image"),
        (status = 413, description = "Request body too large"),
        (status = 503, description = "Model backend unavailable")
    )
)]
pub async fn chat_completions(
    State(data): State<Arc<OpenAIServerData>>,
    request: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> ChatResponder {
    match request {
        Ok(Json(request)) => chat_completions_with_data(data, request).await,
        Err(rejection) => {
            warn!("Rejected chat request body: {}", rejection.body_text());
            match rejection {
                JsonRejection::JsonDataError(_) | JsonRejection::JsonSyntaxError(_) => {
                    ChatResponder::ValidationError(APIError::new(rejection.body_text()))
                }
                // other rejections (body limit 413, content type 415) keep their status
                other => ChatResponder::Rejected(other.status(), APIError::new(other.body_text())),
            }
        }
    }
}

pub async fn chat_completions_with_data(
    data: Arc<OpenAIServerData>,
    request: ChatCompletionRequest,
) -> ChatResponder {
    let request_id = new_completion_id();
    let created = get_created_time_secs();
    let stream = request.is_stream();
    info!(
        "[{}] chat request: {} messages, stream: {}",
        request_id,
        request.messages.len(),
        stream
    );
    if let Some(model) = request.model.as_deref() {
        if model != data.served_model_name {
            debug!(
                "[{}] client asked for `{}`, serving `{}`",
                request_id, model, data.served_model_name
            );
        }
    }

    let params = match SamplingParams::from_request(&request) {
        Ok(params) => params,
        Err(e) => return ChatResponder::ValidationError(e),
    };

    let filter = if request.wants_script_convert() {
        match &data.script_filter {
            Some(filter) => Some(filter.clone()),
            None => {
                return ChatResponder::ValidationError(APIError::new_str(
                    "force_script_convert was requested but no script conversion dictionary is configured",
                ))
            }
        }
    } else {
        None
    };

    // Inline images are decoded off the async executor.
    let messages = request.messages;
    let normalized = match tokio::task::spawn_blocking(move || normalize(&messages)).await {
        Ok(normalized) => normalized,
        Err(e) => {
            error!("[{}] normalization task failed: {}", request_id, e);
            return ChatResponder::ModelError(APIError::new_str("failed to prepare conversation"));
        }
    };
    let conversation = match normalized {
        Ok(conversation) => conversation,
        Err(e) if e.is_validation() => return ChatResponder::ValidationError(APIError::from(e)),
        Err(e) => {
            warn!("[{}] {}", request_id, e);
            return ChatResponder::ImageDecodeError(APIError::from(e));
        }
    };
    info!(
        "[{}] {} turns, {} images, system prompt: {}",
        request_id,
        conversation.turns.len(),
        conversation.image_count(),
        !conversation.system_prompt.is_empty()
    );

    if let BackendStatus::Failed(reason) = data.worker.status() {
        return ChatResponder::BackendUnavailable(APIError::new(format!(
            "model backend unavailable: {reason}"
        )));
    }

    let submission = match data.worker.submit(
        request_id.clone(),
        conversation,
        params,
        stream,
    ) {
        Ok(submission) => submission,
        Err(e) => {
            error!("[{}] {}", request_id, e);
            return e.into();
        }
    };

    if stream {
        return ChatResponder::Streamer(
            Sse::new(Streamer::new(
                submission,
                request_id,
                created,
                data.served_model_name.clone(),
                filter,
            ))
            .keep_alive(KeepAlive::new().interval(data.keep_alive_interval)),
        );
    }

    // The submission guard lives across this await; a dropped request cancels the job.
    match submission.events.recv_async().await {
        Ok(WorkerEvent::Completed {
            text,
            completion_tokens,
        }) => {
            let content = match &filter {
                Some(filter) => filter.convert(&text),
                None => text,
            };
            ChatResponder::Completion(ChatCompletionResponse::new(
                request_id,
                created,
                data.served_model_name.clone(),
                content,
                ChatCompletionUsageResponse::new(0, completion_tokens),
            ))
        }
        Ok(WorkerEvent::Failed(e)) => {
            error!("[{}] {}", request_id, e);
            e.into()
        }
        Ok(other) => {
            error!("[{}] unexpected worker event {:?}", request_id, other);
            ChatResponder::ModelError(APIError::new_str("unexpected response from model worker"))
        }
        Err(_) => {
            error!("[{}] worker dropped the request", request_id);
            ChatResponder::ModelError(APIError::new_str("model worker dropped the request"))
        }
    }
}

#[utoipa::path(
    get,
    tag = "minicpm-api",
    path = "/v1/models",
    responses((status = 200, description = "Served model list"))
)]
pub async fn list_models(State(data): State<Arc<OpenAIServerData>>) -> Json<serde_json::Value> {
    Json(json!({
        "object": "list",
        "data": [{
            "id": data.served_model_name,
            "object": "model",
            "created": get_created_time_secs(),
            "owned_by": "openbmb",
        }]
    }))
}

#[utoipa::path(
    get,
    tag = "minicpm-api",
    path = "/health",
    responses((status = 200, description = "Service and backend status"))
)]
pub async fn health(State(data): State<Arc<OpenAIServerData>>) -> Json<serde_json::Value> {
    let status = data.worker.status();
    let loaded = status.is_ready();
    let mut body = json!({
        "status": if loaded { "ok" } else { "degraded" },
        "backend": data.worker.kind().name(),
        "loaded": loaded,
        "queued": data.worker.queued(),
    });
    if let BackendStatus::Failed(reason) = status {
        body["error"] = json!(reason);
    }
    Json(body)
}

pub fn get_openapi_doc() -> utoipa::openapi::OpenApi {
    #[derive(OpenApi)]
    #[openapi(
        paths(chat_completions, list_models, health),
        tags((name = "minicpm-api", description = "OpenAI-compatible MiniCPM-V chat API")),
        info(title = "minicpm-api")
    )]
    struct ApiDoc;

    ApiDoc::openapi()
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(get_openapi_doc())
}

/// Routes, CORS and body limit. `/openapi.json` is only mounted outside production mode.
pub fn build_router(data: OpenAIServerData, max_body_bytes: usize, prod: bool) -> Router {
    let cors_layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([http::header::CONTENT_TYPE, http::header::AUTHORIZATION])
        .allow_origin(AllowOrigin::any());

    let mut app = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .route("/health", get(health));
    if !prod {
        app = app.route("/openapi.json", get(openapi_json));
    }
    app.layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(cors_layer)
        .with_state(Arc::new(data))
}
