use serde::{Deserialize, Serialize};

/// Author of a chat message. Anything outside these three values fails to
/// deserialize and the request is rejected before normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// URL of an image to include in the message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageUrl {
    /// Only `data:image/<fmt>;base64,<payload>` URLs are accepted
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ImageUrl {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            detail: None,
        }
    }
}

/// Content part for multimodal messages
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    ImageUrl {
        image_url: ImageUrl,
    },
    /// Part types this server does not understand (audio, files, ...). They are
    /// accepted and skipped so newer clients keep working.
    #[serde(other)]
    Unsupported,
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    pub fn image_url(url: impl Into<String>) -> Self {
        ContentPart::ImageUrl {
            image_url: ImageUrl::new(url),
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(self, ContentPart::ImageUrl { .. })
    }
}

/// Message content: either a plain string or an ordered list of typed parts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    pub fn has_images(&self) -> bool {
        match self {
            MessageContent::Text(_) => false,
            MessageContent::Parts(parts) => parts.iter().any(|p| p.is_image()),
        }
    }
}

impl From<&str> for MessageContent {
    fn from(text: &str) -> Self {
        MessageContent::Text(text.to_string())
    }
}

impl From<Vec<ContentPart>> for MessageContent {
    fn from(parts: Vec<ContentPart>) -> Self {
        MessageContent::Parts(parts)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<MessageContent>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<MessageContent>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<MessageContent>) -> Self {
        Self::new(Role::System, content)
    }
}

pub(crate) fn default_temperature() -> f32 {
    1.0
}

pub(crate) fn default_top_p() -> f32 {
    1.0
}

pub(crate) fn default_top_k() -> isize {
    100
}

pub(crate) fn default_max_tokens() -> usize {
    2048
}

pub(crate) fn default_repetition_penalty() -> f32 {
    1.05
}

/// Sampling fields are optional; an absent field and an explicit `null` both
/// fall back to the defaults above when [`SamplingParams`] is built.
///
/// [`SamplingParams`]: super::sampling_params::SamplingParams
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    /// Accepted for client compatibility; the server always answers with its served model
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub top_k: Option<isize>,
    #[serde(default)]
    pub max_tokens: Option<usize>,
    #[serde(default)]
    pub repetition_penalty: Option<f32>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub stop: Option<Vec<String>>,
    #[serde(default, alias = "force_zhtw")]
    pub force_script_convert: Option<bool>,
}

impl ChatCompletionRequest {
    pub fn is_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    pub fn wants_script_convert(&self) -> bool {
        self.force_script_convert.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_absent_fields_stay_unset() {
        let req: ChatCompletionRequest = serde_json::from_value(json!({
            "messages": [{"role": "user", "content": "Hello"}]
        }))
        .unwrap();
        assert!(req.temperature.is_none());
        assert!(req.max_tokens.is_none());
        assert!(!req.is_stream());
        assert!(req.stop.is_none());
        assert!(!req.wants_script_convert());
        assert_eq!(req.messages[0].content, MessageContent::Text("Hello".into()));
    }

    #[test]
    fn test_explicit_nulls_accepted() {
        let req: ChatCompletionRequest = serde_json::from_value(json!({
            "messages": [{"role": "user", "content": "Hello"}],
            "temperature": null,
            "top_p": null,
            "top_k": null,
            "max_tokens": null,
            "repetition_penalty": null,
            "stream": null,
            "stop": null,
            "force_zhtw": null
        }))
        .unwrap();
        assert!(req.temperature.is_none());
        assert!(req.top_p.is_none());
        assert!(req.top_k.is_none());
        assert!(req.max_tokens.is_none());
        assert!(req.repetition_penalty.is_none());
        assert!(!req.is_stream());
        assert!(!req.wants_script_convert());
    }

    #[test]
    fn test_legacy_force_zhtw_alias() {
        let req: ChatCompletionRequest = serde_json::from_value(json!({
            "messages": [{"role": "user", "content": "hi"}],
            "force_zhtw": true
        }))
        .unwrap();
        assert!(req.wants_script_convert());
    }

    #[test]
    fn test_unknown_role_rejected() {
        let result: Result<ChatCompletionRequest, _> = serde_json::from_value(json!({
            "messages": [{"role": "tool", "content": "x"}]
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_null_content_rejected() {
        let result: Result<ChatCompletionRequest, _> = serde_json::from_value(json!({
            "messages": [{"role": "user", "content": null}]
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_multimodal_parts_with_unknown_type() {
        let msg: ChatMessage = serde_json::from_value(json!({
            "role": "user",
            "content": [
                {"type": "text", "text": "What is this?"},
                {"type": "input_audio", "input_audio": {"data": "..."}},
                {"type": "image_url", "image_url": {"url": "data:image/png;base64,AAAA", "detail": "high"}}
            ]
        }))
        .unwrap();

        let MessageContent::Parts(parts) = &msg.content else {
            panic!("expected parts");
        };
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], ContentPart::text("What is this?"));
        assert_eq!(parts[1], ContentPart::Unsupported);
        assert!(parts[2].is_image());
        assert!(msg.content.has_images());
    }
}
