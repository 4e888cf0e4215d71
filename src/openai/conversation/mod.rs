pub mod image;

use self::image::ImagePart;
use super::requests::{ChatMessage, ContentPart, MessageContent, Role};
use serde::Serialize;
use tracing::{debug, info};

#[derive(thiserror::Error, Debug)]
pub enum ConversationError {
    #[error("`messages` must contain at least one message")]
    EmptyMessages,
    #[error("invalid image url: {0}")]
    InvalidDataUrl(String),
    #[error("invalid base64 image payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("unable to decode image: {0}")]
    Image(#[from] ::image::ImageError),
    #[error("message {index}: {source}")]
    InMessage {
        index: usize,
        #[source]
        source: Box<ConversationError>,
    },
}

impl ConversationError {
    pub fn is_validation(&self) -> bool {
        match self {
            ConversationError::EmptyMessages => true,
            ConversationError::InMessage { source, .. } => source.is_validation(),
            _ => false,
        }
    }
}

/// One atomic unit of normalized message content.
#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Text(String),
    Image(ImagePart),
}

impl Part {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Part::Text(text) => Some(text),
            Part::Image(_) => None,
        }
    }

    pub fn as_image(&self) -> Option<&ImagePart> {
        match self {
            Part::Image(image) => Some(image),
            Part::Text(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedTurn {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl NormalizedTurn {
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(Part::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn images(&self) -> impl Iterator<Item = &ImagePart> {
        self.parts.iter().filter_map(Part::as_image)
    }
}

/// Backend-agnostic chat history after decoding and the blank-image fallback.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NormalizedConversation {
    pub system_prompt: String,
    pub turns: Vec<NormalizedTurn>,
}

/// Text-only view of a turn, as serialized into single-image question strings.
#[derive(Serialize)]
struct TextTurn<'a> {
    role: &'a str,
    content: String,
}

impl NormalizedConversation {
    pub fn images(&self) -> impl Iterator<Item = &ImagePart> {
        self.turns.iter().flat_map(|turn| turn.images())
    }

    pub fn image_count(&self) -> usize {
        self.images().count()
    }

    /// `[{"role":..,"content":..}]` with images dropped.
    pub fn to_question_json(&self) -> Result<String, serde_json::Error> {
        let turns: Vec<TextTurn> = self
            .turns
            .iter()
            .map(|turn| TextTurn {
                role: turn.role.as_str(),
                content: turn.text(),
            })
            .collect();
        serde_json::to_string(&turns)
    }
}

/// Decode one message's content into ordered parts.
///
/// Text parts and `image_url` parts keep their relative order; unknown part
/// types are skipped. Any image that cannot be decoded fails the whole message.
pub fn decode_content(content: &MessageContent) -> Result<Vec<Part>, ConversationError> {
    match content {
        MessageContent::Text(text) => Ok(vec![Part::Text(text.clone())]),
        MessageContent::Parts(parts) => {
            let mut decoded = Vec::with_capacity(parts.len());
            for part in parts {
                match part {
                    ContentPart::Text { text } => decoded.push(Part::Text(text.clone())),
                    ContentPart::ImageUrl { image_url } => {
                        decoded.push(Part::Image(ImagePart::from_data_url(&image_url.url)?))
                    }
                    ContentPart::Unsupported => {}
                }
            }
            Ok(decoded)
        }
    }
}

/// Text-only decoding for assistant and system messages.
fn decode_text_only(content: &MessageContent) -> Vec<Part> {
    match content {
        MessageContent::Text(text) => vec![Part::Text(text.clone())],
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(Part::Text(text.clone())),
                _ => None,
            })
            .collect(),
    }
}

/// Flatten a request's message list into a [`NormalizedConversation`].
pub fn normalize(messages: &[ChatMessage]) -> Result<NormalizedConversation, ConversationError> {
    if messages.is_empty() {
        return Err(ConversationError::EmptyMessages);
    }

    // Must see the whole conversation before deciding on the fallback.
    let has_image = messages
        .iter()
        .any(|m| m.role == Role::User && m.content.has_images());
    debug!(has_image, messages = messages.len(), "scanned conversation for images");

    let mut turns = Vec::with_capacity(messages.len());
    let mut first_user = None;
    for (index, message) in messages.iter().enumerate() {
        let parts = match message.role {
            Role::User => {
                first_user.get_or_insert(index);
                decode_content(&message.content).map_err(|e| ConversationError::InMessage {
                    index,
                    source: Box::new(e),
                })?
            }
            Role::Assistant | Role::System => {
                if message.content.has_images() {
                    debug!(index, role = message.role.as_str(), "ignoring image parts");
                }
                decode_text_only(&message.content)
            }
        };
        turns.push(NormalizedTurn {
            role: message.role,
            parts,
        });
    }

    if !has_image {
        if let Some(index) = first_user {
            info!(index, "no image in conversation, attaching blank image");
            turns[index].parts.push(Part::Image(ImagePart::blank()?));
        }
    }

    let system_prompt = if turns[0].role == Role::System {
        turns.remove(0).text()
    } else {
        String::new()
    };

    Ok(NormalizedConversation {
        system_prompt,
        turns,
    })
}
