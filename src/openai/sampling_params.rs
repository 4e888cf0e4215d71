use super::requests::{
    default_max_tokens, default_repetition_penalty, default_temperature, default_top_k,
    default_top_p, ChatCompletionRequest,
};
use super::responses::APIError;

/// Generation settings forwarded to backends that accept them.
#[derive(Clone, Debug, PartialEq)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: usize,
    pub max_tokens: usize,
    pub repetition_penalty: f32,
    pub stop: Vec<String>,
}

impl SamplingParams {
    pub fn new(
        temperature: f32,
        top_p: f32,
        top_k: isize,
        max_tokens: usize,
        repetition_penalty: f32,
        stop: Vec<String>,
    ) -> Result<Self, APIError> {
        if !temperature.is_finite() || temperature < 0.0 {
            return Err(APIError::new(format!(
                "temperature must be non-negative, got {temperature}."
            )));
        }
        if !(top_p > 0.0 && top_p <= 1.0) {
            return Err(APIError::new(format!(
                "top_p must be in (0, 1], got {top_p}."
            )));
        }
        if top_k < 1 {
            return Err(APIError::new(format!("top_k must be at least 1, got {top_k}.")));
        }
        if max_tokens == 0 {
            return Err(APIError::new_str("max_tokens must be at least 1."));
        }
        if !repetition_penalty.is_finite() || repetition_penalty <= 0.0 {
            return Err(APIError::new(format!(
                "repetition_penalty must be positive, got {repetition_penalty}."
            )));
        }
        Ok(Self {
            temperature,
            top_p,
            top_k: top_k as usize,
            max_tokens,
            repetition_penalty,
            stop: stop.into_iter().filter(|s| !s.is_empty()).collect(),
        })
    }

    pub fn from_request(request: &ChatCompletionRequest) -> Result<Self, APIError> {
        Self::new(
            request.temperature.unwrap_or(default_temperature()),
            request.top_p.unwrap_or(default_top_p()),
            request.top_k.unwrap_or(default_top_k()),
            request.max_tokens.unwrap_or(default_max_tokens()),
            request.repetition_penalty.unwrap_or(default_repetition_penalty()),
            request.stop.clone().unwrap_or_default(),
        )
    }
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: default_top_k() as usize,
            max_tokens: default_max_tokens(),
            repetition_penalty: default_repetition_penalty(),
            stop: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_request_defaults() {
        let params = SamplingParams::from_request(&ChatCompletionRequest::default()).unwrap();
        assert_eq!(params, SamplingParams::default());
    }

    #[test]
    fn explicit_values_override_defaults() {
        let request = ChatCompletionRequest {
            temperature: Some(0.2),
            max_tokens: Some(16),
            ..Default::default()
        };
        let params = SamplingParams::from_request(&request).unwrap();
        assert_eq!(params.temperature, 0.2);
        assert_eq!(params.max_tokens, 16);
        assert_eq!(params.top_k, 100);
        assert_eq!(params.repetition_penalty, 1.05);
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(SamplingParams::new(-0.1, 1.0, 1, 1, 1.0, vec![]).is_err());
        assert!(SamplingParams::new(0.7, 0.0, 1, 1, 1.0, vec![]).is_err());
        assert!(SamplingParams::new(0.7, 1.5, 1, 1, 1.0, vec![]).is_err());
        assert!(SamplingParams::new(0.7, 1.0, 0, 1, 1.0, vec![]).is_err());
        assert!(SamplingParams::new(0.7, 1.0, 1, 0, 1.0, vec![]).is_err());
        assert!(SamplingParams::new(0.7, 1.0, 1, 1, 0.0, vec![]).is_err());
        assert!(SamplingParams::new(f32::NAN, 1.0, 1, 1, 1.0, vec![]).is_err());
    }

    #[test]
    fn empty_stop_strings_are_dropped() {
        let params =
            SamplingParams::new(0.0, 1.0, 1, 8, 1.0, vec!["".into(), "</s>".into()]).unwrap();
        assert_eq!(params.stop, vec!["</s>".to_string()]);
    }
}
