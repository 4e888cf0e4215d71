//! Model backends and the worker that owns them.
//!
//! A backend is one of a closed set of calling conventions, chosen once from the
//! model identifier at startup. The weights, tokenizer and generation loop
//! live behind [`SingleImageModel`] / [`MultiTurnModel`]; this module only adapts
//! a [`NormalizedConversation`] to whichever convention the loaded model speaks.
pub mod echo;
pub mod worker;

use super::conversation::{NormalizedConversation, NormalizedTurn};
use super::sampling_params::SamplingParams;
use image::RgbImage;
use std::fmt;
use tokenizers::Tokenizer;
use tracing::debug;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("model backend unavailable: {0}")]
    Unavailable(String),
    #[error("{0}")]
    InvalidInput(String),
    #[error("generation failed: {0}")]
    Generation(String),
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
}

/// Token counting with the backend's own tokenizer.
pub trait TokenCounter {
    fn tokenize(&self, text: &str) -> Result<Vec<u32>, BackendError>;
}

impl TokenCounter for Tokenizer {
    fn tokenize(&self, text: &str) -> Result<Vec<u32>, BackendError> {
        self.encode(text, false)
            .map(|encoding| encoding.get_ids().to_vec())
            .map_err(|e| BackendError::Tokenizer(e.to_string()))
    }
}

/// Lazily produced text fragments, pulled on the worker thread.
pub type Fragments<'a> = Box<dyn Iterator<Item = Result<String, BackendError>> + 'a>;

pub enum ModelOutput<'a> {
    Complete(String),
    Stream(Fragments<'a>),
}

impl fmt::Debug for ModelOutput<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelOutput::Complete(text) => f.debug_tuple("Complete").field(text).finish(),
            ModelOutput::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Legacy convention: one image plus a JSON-serialized message list; always
/// answers with a complete string.
pub trait SingleImageModel: Send {
    fn chat(&mut self, image: &RgbImage, question: &str) -> Result<String, BackendError>;
    fn tokenizer(&self) -> &dyn TokenCounter;
}

/// Multi-turn, multi-image convention with system prompt and sampling settings.
pub trait MultiTurnModel: Send {
    fn chat<'a>(
        &'a mut self,
        system_prompt: &str,
        turns: &[NormalizedTurn],
        params: &SamplingParams,
        stream: bool,
    ) -> Result<ModelOutput<'a>, BackendError>;
    fn tokenizer(&self) -> &dyn TokenCounter;
}

/// Model families served by this process, resolved from the model identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// OmniLMM-12B: single image, single question
    OmniLmm12B,
    /// MiniCPM-Llama3-V 2.5: multi-turn, multi-image, streaming
    MiniCpmV25,
    /// MiniCPM-V: single image, single question
    MiniCpmV,
}

impl BackendKind {
    pub fn from_model_id(model_id: &str) -> Self {
        if model_id.contains("12B") {
            BackendKind::OmniLmm12B
        } else if model_id.contains("MiniCPM-Llama3-V") {
            BackendKind::MiniCpmV25
        } else {
            BackendKind::MiniCpmV
        }
    }

    pub fn is_multi_turn(&self) -> bool {
        matches!(self, BackendKind::MiniCpmV25)
    }

    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::OmniLmm12B => "omnilmm-12b",
            BackendKind::MiniCpmV25 => "minicpm-llama3-v-2.5",
            BackendKind::MiniCpmV => "minicpm-v",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A loaded model behind one uniform `chat` entry point.
pub enum ModelBackend {
    SingleImage(Box<dyn SingleImageModel>),
    MultiTurn(Box<dyn MultiTurnModel>),
}

impl ModelBackend {
    pub fn chat<'a>(
        &'a mut self,
        conversation: &NormalizedConversation,
        params: &SamplingParams,
        stream: bool,
    ) -> Result<ModelOutput<'a>, BackendError> {
        match self {
            ModelBackend::SingleImage(model) => {
                let image = conversation.images().next().ok_or_else(|| {
                    BackendError::InvalidInput(
                        "this model needs at least one user message".to_string(),
                    )
                })?;
                if !conversation.system_prompt.is_empty() {
                    debug!("single-image backend has no system slot, dropping system prompt");
                }
                let question = conversation
                    .to_question_json()
                    .map_err(|e| BackendError::InvalidInput(e.to_string()))?;
                model.chat(&image.pixels, &question).map(ModelOutput::Complete)
            }
            ModelBackend::MultiTurn(model) => model.chat(
                &conversation.system_prompt,
                &conversation.turns,
                params,
                stream,
            ),
        }
    }

    pub fn count_tokens(&self, text: &str) -> Result<usize, BackendError> {
        let tokenizer = match self {
            ModelBackend::SingleImage(model) => model.tokenizer(),
            ModelBackend::MultiTurn(model) => model.tokenizer(),
        };
        Ok(tokenizer.tokenize(text)?.len())
    }
}
