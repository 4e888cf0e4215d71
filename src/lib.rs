use hf_hub::{api::sync::ApiBuilder, Repo, RepoType};
use openai::pipelines::echo::whitespace_tokenizer;
use openai::responses::APIError;
use std::{
    env, fs,
    path::{Path, PathBuf},
};
use tokenizers::Tokenizer;
use tracing::{info, warn};

pub mod openai;

/// Where the backend tokenizer comes from, in order of preference.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenizerSource {
    File(PathBuf),
    Hub { model_id: String, revision: String },
    Builtin,
}

impl TokenizerSource {
    /// `--tokenizer` wins, then `<weight_path>/tokenizer.json`, then the hub
    /// when downloads are allowed, then the built-in word-level tokenizer.
    pub fn resolve(
        tokenizer: Option<PathBuf>,
        weight_path: Option<&Path>,
        hub_model_id: Option<&str>,
    ) -> Self {
        if let Some(path) = tokenizer {
            return TokenizerSource::File(path);
        }
        if let Some(dir) = weight_path {
            let path = dir.join("tokenizer.json");
            if path.is_file() {
                return TokenizerSource::File(path);
            }
            warn!("No tokenizer.json in {}", dir.display());
        }
        match hub_model_id {
            Some(model_id) => TokenizerSource::Hub {
                model_id: model_id.to_string(),
                revision: "main".to_string(),
            },
            None => TokenizerSource::Builtin,
        }
    }

    pub fn load(
        self,
        hf_token: Option<String>,
        hf_token_path: Option<String>,
    ) -> Result<Tokenizer, APIError> {
        match self {
            TokenizerSource::File(path) => load_tokenizer(&path),
            TokenizerSource::Hub { model_id, revision } => {
                let path = download_tokenizer(&model_id, revision, hf_token, hf_token_path)?;
                load_tokenizer(&path)
            }
            TokenizerSource::Builtin => {
                warn!("No tokenizer configured, counting tokens with the built-in word-level tokenizer!");
                whitespace_tokenizer().map_err(APIError::from)
            }
        }
    }
}

pub fn load_tokenizer(path: &Path) -> Result<Tokenizer, APIError> {
    info!("Loading tokenizer from {}", path.display());
    Tokenizer::from_file(path)
        .map_err(|e| APIError::new(format!("failed to load tokenizer {}: {e}", path.display())))
}

/// Hugging Face token: `hf_token` names an environment variable, `hf_token_path`
/// a file. Without either, `~/.cache/huggingface/token` is used if present;
/// `None` means anonymous access.
pub fn get_token(
    hf_token: Option<String>,
    hf_token_path: Option<String>,
) -> Result<Option<String>, APIError> {
    Ok(match (hf_token, hf_token_path) {
        (Some(envvar), None) => Some(try_api!(env::var(envvar)).trim().to_string()),
        (None, Some(path)) => Some(try_api!(fs::read_to_string(path)).trim().to_string()),
        (None, None) => dirs::home_dir()
            .map(|home| home.join(".cache/huggingface/token"))
            .and_then(|path| fs::read_to_string(path).ok())
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty()),
        _ => {
            return Err(APIError::new_str(
                "Do not specify `hf_token` and `hf_token_path` at the same time.",
            ))
        }
    })
}

pub fn download_tokenizer(
    model_id: &str,
    revision: String,
    hf_token: Option<String>,
    hf_token_path: Option<String>,
) -> Result<PathBuf, APIError> {
    info!("Downloading tokenizer.json for {} ({})", model_id, revision);
    let api = try_api!(ApiBuilder::new()
        .with_progress(true)
        .with_token(get_token(hf_token, hf_token_path)?)
        .build());
    let api = api.repo(Repo::with_revision(
        model_id.to_string(),
        RepoType::Model,
        revision,
    ));
    Ok(try_api!(api.get("tokenizer.json")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_tokenizer_wins() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tokenizer.json"), "{}").unwrap();
        let source = TokenizerSource::resolve(
            Some(PathBuf::from("/tmp/other.json")),
            Some(dir.path()),
            Some("openbmb/MiniCPM-V"),
        );
        assert_eq!(source, TokenizerSource::File(PathBuf::from("/tmp/other.json")));
    }

    #[test]
    fn weight_path_then_hub_then_builtin() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            TokenizerSource::resolve(None, Some(dir.path()), None),
            TokenizerSource::Builtin
        );
        assert_eq!(
            TokenizerSource::resolve(None, Some(dir.path()), Some("openbmb/MiniCPM-V")),
            TokenizerSource::Hub {
                model_id: "openbmb/MiniCPM-V".to_string(),
                revision: "main".to_string()
            }
        );
        let path = dir.path().join("tokenizer.json");
        std::fs::write(&path, "{}").unwrap();
        assert_eq!(
            TokenizerSource::resolve(None, Some(dir.path()), Some("openbmb/MiniCPM-V")),
            TokenizerSource::File(path)
        );
    }

    #[test]
    fn builtin_tokenizer_loads() {
        let tokenizer = TokenizerSource::Builtin.load(None, None).unwrap();
        assert_eq!(tokenizer.encode("a b", false).unwrap().get_ids().len(), 2);
    }

    #[test]
    fn token_from_file_and_conflicting_sources() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "hf_abc\n").unwrap();
        let path = file.path().to_string_lossy().to_string();
        assert_eq!(
            get_token(None, Some(path.clone())).unwrap(),
            Some("hf_abc".to_string())
        );
        assert!(get_token(Some("HF_TOKEN".to_string()), Some(path)).is_err());
        assert!(get_token(None, Some("/nonexistent/token".to_string())).is_err());
    }

    #[test]
    fn broken_tokenizer_file_is_an_error() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "not json").unwrap();
        assert!(load_tokenizer(file.path()).is_err());
    }
}
