//! Deterministic development engine: answers by echoing the last user message.
//! Useful for exercising clients and the streaming path without model weights.
use super::{
    BackendError, BackendKind, ModelBackend, ModelOutput, MultiTurnModel, SingleImageModel,
    TokenCounter,
};
use crate::openai::conversation::{NormalizedTurn, Part};
use crate::openai::requests::Role;
use crate::openai::sampling_params::SamplingParams;
use image::RgbImage;
use std::str::FromStr;
use std::time::Duration;
use tokenizers::Tokenizer;

const WHITESPACE_TOKENIZER: &str = r#"{
  "version": "1.0",
  "truncation": null,
  "padding": null,
  "added_tokens": [],
  "normalizer": null,
  "pre_tokenizer": { "type": "Whitespace" },
  "post_processor": null,
  "decoder": null,
  "model": { "type": "WordLevel", "vocab": { "[UNK]": 0 }, "unk_token": "[UNK]" }
}"#;

/// Word-level tokenizer with an empty vocabulary: one token per word or
/// punctuation run. Stands in when no `tokenizer.json` is available.
pub fn whitespace_tokenizer() -> Result<Tokenizer, BackendError> {
    Tokenizer::from_str(WHITESPACE_TOKENIZER).map_err(|e| BackendError::Tokenizer(e.to_string()))
}

/// Wrap an [`EchoModel`] in the calling convention `kind` expects.
pub fn echo_backend(kind: BackendKind, tokenizer: Tokenizer, delay: Duration) -> ModelBackend {
    let model = EchoModel::new(tokenizer, delay);
    if kind.is_multi_turn() {
        ModelBackend::MultiTurn(Box::new(model))
    } else {
        ModelBackend::SingleImage(Box::new(model))
    }
}

pub struct EchoModel {
    tokenizer: Tokenizer,
    delay: Duration,
}

impl EchoModel {
    pub fn new(tokenizer: Tokenizer, delay: Duration) -> Self {
        Self { tokenizer, delay }
    }

    fn reply(turns: &[NormalizedTurn], params: &SamplingParams) -> String {
        let text = turns
            .iter()
            .rev()
            .find(|turn| turn.role == Role::User)
            .map(NormalizedTurn::text)
            .unwrap_or_default();
        let images: Vec<String> = turns
            .iter()
            .flat_map(|turn| turn.parts.iter())
            .filter_map(|part| match part {
                Part::Image(image) if !image.is_blank() => {
                    Some(format!("{}x{}", image.width(), image.height()))
                }
                _ => None,
            })
            .collect();
        let mut reply = if images.is_empty() {
            text
        } else {
            format!("{text} [images: {}]", images.join(", "))
        };
        if let Some(cut) = params.stop.iter().filter_map(|s| reply.find(s.as_str())).min() {
            reply.truncate(cut);
        }
        reply
    }

    /// Split into at most `max_tokens` word fragments that concatenate back to
    /// the (possibly truncated) reply.
    fn fragments(reply: &str, max_tokens: usize) -> Vec<String> {
        reply
            .split_whitespace()
            .take(max_tokens)
            .enumerate()
            .map(|(i, word)| {
                if i == 0 {
                    word.to_string()
                } else {
                    format!(" {word}")
                }
            })
            .collect()
    }
}

impl MultiTurnModel for EchoModel {
    fn chat<'a>(
        &'a mut self,
        _system_prompt: &str,
        turns: &[NormalizedTurn],
        params: &SamplingParams,
        stream: bool,
    ) -> Result<ModelOutput<'a>, BackendError> {
        let fragments = Self::fragments(&Self::reply(turns, params), params.max_tokens);
        if !stream {
            return Ok(ModelOutput::Complete(fragments.concat()));
        }
        let delay = self.delay;
        Ok(ModelOutput::Stream(Box::new(
            fragments.into_iter().enumerate().map(move |(i, fragment)| {
                if i > 0 && !delay.is_zero() {
                    std::thread::sleep(delay);
                }
                Ok(fragment)
            }),
        )))
    }

    fn tokenizer(&self) -> &dyn TokenCounter {
        &self.tokenizer
    }
}

impl SingleImageModel for EchoModel {
    fn chat(&mut self, image: &RgbImage, question: &str) -> Result<String, BackendError> {
        #[derive(serde::Deserialize)]
        struct Msg {
            role: String,
            content: String,
        }
        let msgs: Vec<Msg> = serde_json::from_str(question)
            .map_err(|e| BackendError::InvalidInput(format!("malformed question: {e}")))?;
        let text = msgs
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        Ok(format!("{text} [image: {}x{}]", image.width(), image.height()))
    }

    fn tokenizer(&self) -> &dyn TokenCounter {
        &self.tokenizer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openai::conversation::normalize;
    use crate::openai::requests::ChatMessage;

    fn model() -> EchoModel {
        EchoModel::new(whitespace_tokenizer().unwrap(), Duration::ZERO)
    }

    #[test]
    fn whitespace_tokenizer_counts_words_and_punctuation() {
        let tokenizer = whitespace_tokenizer().unwrap();
        assert_eq!(tokenizer.tokenize("Hello there").unwrap().len(), 2);
        assert_eq!(tokenizer.tokenize("Hello, there!").unwrap().len(), 4);
        assert!(tokenizer.tokenize("").unwrap().is_empty());
    }

    #[test]
    fn streams_words_that_concatenate_to_complete_answer() {
        let conversation = normalize(&[ChatMessage::user("one two  three")]).unwrap();
        let params = SamplingParams::default();
        let mut echo = model();

        let complete = match MultiTurnModel::chat(&mut echo, "", &conversation.turns, &params, false)
            .unwrap()
        {
            ModelOutput::Complete(text) => text,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(complete, "one two three");

        let streamed: Vec<String> =
            match MultiTurnModel::chat(&mut echo, "", &conversation.turns, &params, true).unwrap() {
                ModelOutput::Stream(fragments) => fragments.map(Result::unwrap).collect(),
                other => panic!("unexpected {other:?}"),
            };
        assert_eq!(streamed, vec!["one", " two", " three"]);
        assert_eq!(streamed.concat(), complete);
    }

    #[test]
    fn honours_max_tokens_and_stop() {
        let conversation = normalize(&[ChatMessage::user("a b c STOP d e")]).unwrap();
        let mut params = SamplingParams::default();
        params.stop = vec!["STOP".to_string()];
        let mut echo = model();
        let mut answer = |params: &SamplingParams| {
            match MultiTurnModel::chat(&mut echo, "", &conversation.turns, params, false).unwrap() {
                ModelOutput::Complete(text) => text,
                other => panic!("unexpected {other:?}"),
            }
        };
        assert_eq!(answer(&params), "a b c");

        params.max_tokens = 2;
        assert_eq!(answer(&params), "a b");
    }

    #[test]
    fn backend_follows_kind() {
        let tokenizer = whitespace_tokenizer().unwrap();
        assert!(matches!(
            echo_backend(BackendKind::MiniCpmV25, tokenizer.clone(), Duration::ZERO),
            ModelBackend::MultiTurn(_)
        ));
        assert!(matches!(
            echo_backend(BackendKind::OmniLmm12B, tokenizer, Duration::ZERO),
            ModelBackend::SingleImage(_)
        ));
    }

    #[test]
    fn single_image_reads_question_json() {
        let mut echo = model();
        let image = RgbImage::new(3, 2);
        let answer = SingleImageModel::chat(
            &mut echo,
            &image,
            r#"[{"role":"user","content":"hi"},{"role":"assistant","content":"yo"},{"role":"user","content":"what?"}]"#,
        )
        .unwrap();
        assert_eq!(answer, "what? [image: 3x2]");
        assert!(SingleImageModel::chat(&mut echo, &image, "not json").is_err());
    }
}
