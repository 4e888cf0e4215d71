use super::pipelines::BackendError;
use super::streaming::Streamer;
use axum::extract::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Sse};
use derive_more::{Display, Error};
use serde::{Deserialize, Serialize};

#[derive(Debug, Display, Error, Serialize)]
#[display(fmt = "Error: {data}")]
pub struct APIError {
    data: String,
}

impl APIError {
    pub fn new(data: String) -> Self {
        Self { data }
    }

    pub fn new_str(data: &str) -> Self {
        Self {
            data: data.to_string(),
        }
    }

    pub fn from<T: ToString>(value: T) -> Self {
        Self::new(value.to_string())
    }

    pub fn message(&self) -> &str {
        &self.data
    }
}

#[macro_export]
macro_rules! try_api {
    ($result:expr) => {
        match $result {
            Ok(v) => v,
            Err(e) => {
                return Err($crate::openai::responses::APIError::from(e));
            }
        }
    };
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatCompletionUsageResponse {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

impl ChatCompletionUsageResponse {
    pub fn new(prompt_tokens: usize, completion_tokens: usize) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Message of a non-streaming choice
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatChoiceData {
    pub role: String,
    pub content: String,
}

impl ChatChoiceData {
    pub fn text(content: String) -> Self {
        Self {
            role: "assistant".to_string(),
            content,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatChoice {
    pub message: ChatChoiceData,
    pub index: usize,
    pub finish_reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    pub usage: ChatCompletionUsageResponse,
}

impl ChatCompletionResponse {
    pub fn new(
        id: String,
        created: u64,
        model: String,
        content: String,
        usage: ChatCompletionUsageResponse,
    ) -> Self {
        Self {
            id,
            object: "chat.completion".to_string(),
            created,
            model,
            choices: vec![ChatChoice {
                message: ChatChoiceData::text(content),
                index: 0,
                finish_reason: "stop".to_string(),
            }],
            usage,
        }
    }
}

// ============================================================================
// Streaming Response Types (Deltas)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChoiceData {
    pub role: String,
    pub content: String,
}

/// `finish_reason` is always serialized, as `null` on intermediate chunks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Choice {
    pub delta: ChoiceData,
    pub index: usize,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<Choice>,
}

impl ChatCompletionChunk {
    pub fn new(
        id: String,
        created: u64,
        model: String,
        content: String,
        finish_reason: Option<String>,
    ) -> Self {
        Self {
            id,
            object: "chat.completion.chunk".to_string(),
            created,
            model,
            choices: vec![Choice {
                delta: ChoiceData {
                    role: "assistant".to_string(),
                    content,
                },
                index: 0,
                finish_reason,
            }],
        }
    }

    pub fn content(id: String, created: u64, model: String, content: String) -> Self {
        Self::new(id, created, model, content, None)
    }

    /// Terminal chunk: empty delta, `finish_reason = "stop"`
    pub fn finish(id: String, created: u64, model: String) -> Self {
        Self::new(id, created, model, String::new(), Some("stop".to_string()))
    }
}

// ============================================================================
// Error Response Handling
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>, error_type: &str) -> Self {
        Self {
            error: ErrorDetail {
                message: message.into(),
                error_type: error_type.to_string(),
            },
        }
    }

    fn to_response(&self, code: StatusCode) -> axum::response::Response {
        let mut r = Json(self).into_response();
        *r.status_mut() = code;
        r
    }
}

pub enum ChatResponder {
    Streamer(Sse<Streamer>),
    Completion(ChatCompletionResponse),
    ValidationError(APIError),
    ImageDecodeError(APIError),
    BackendUnavailable(APIError),
    ModelError(APIError),
    /// Body refused before parsing, e.g. too large or not JSON
    Rejected(StatusCode, APIError),
}

impl ChatResponder {
    pub fn status(&self) -> StatusCode {
        match self {
            ChatResponder::Streamer(_) | ChatResponder::Completion(_) => StatusCode::OK,
            ChatResponder::ValidationError(_) | ChatResponder::ImageDecodeError(_) => {
                StatusCode::BAD_REQUEST
            }
            ChatResponder::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ChatResponder::ModelError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ChatResponder::Rejected(status, _) => *status,
        }
    }
}

impl From<BackendError> for ChatResponder {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Unavailable(_) => ChatResponder::BackendUnavailable(APIError::from(e)),
            BackendError::InvalidInput(_) => ChatResponder::ValidationError(APIError::from(e)),
            BackendError::Generation(_) | BackendError::Tokenizer(_) => {
                ChatResponder::ModelError(APIError::from(e))
            }
        }
    }
}

impl From<&BackendError> for ErrorResponse {
    fn from(e: &BackendError) -> Self {
        let error_type = match e {
            BackendError::Unavailable(_) => "backend_unavailable",
            BackendError::InvalidInput(_) => "invalid_request_error",
            BackendError::Generation(_) | BackendError::Tokenizer(_) => "model_error",
        };
        ErrorResponse::new(e.to_string(), error_type)
    }
}

impl IntoResponse for ChatResponder {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        match self {
            ChatResponder::Streamer(s) => s.into_response(),
            ChatResponder::Completion(s) => Json(s).into_response(),
            ChatResponder::ValidationError(e) => {
                ErrorResponse::new(e.message(), "invalid_request_error").to_response(status)
            }
            ChatResponder::ImageDecodeError(e) => {
                ErrorResponse::new(e.message(), "image_decode_error").to_response(status)
            }
            ChatResponder::BackendUnavailable(e) => {
                ErrorResponse::new(e.message(), "backend_unavailable").to_response(status)
            }
            ChatResponder::ModelError(e) => {
                ErrorResponse::new(e.message(), "model_error").to_response(status)
            }
            ChatResponder::Rejected(_, e) => {
                ErrorResponse::new(e.message(), "invalid_request_error").to_response(status)
            }
        }
    }
}
