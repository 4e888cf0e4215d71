//! Text post-processing applied to model output, e.g. simplified to
//! traditional Chinese conversion.

use ahash::AHashMap;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(thiserror::Error, Debug)]
pub enum ScriptFilterError {
    #[error("failed to read dictionary {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}:{line}: expected `source<TAB>target`")]
    Malformed { path: PathBuf, line: usize },
    #[error("no conversion entries loaded")]
    Empty,
}

pub trait ScriptFilter: Send + Sync {
    fn convert(&self, text: &str) -> String;
}

/// Dictionary based converter reading OpenCC-style text dictionaries
/// (`STCharacters.txt`, `STPhrases.txt`, `TWVariants.txt`, ...).
///
/// Each line maps a source phrase to one or more space separated targets; the
/// first target is used. Conversion is greedy longest match from left to right.
#[derive(Debug, Default)]
pub struct DictionaryConverter {
    entries: AHashMap<String, String>,
    max_key_chars: usize,
}

impl DictionaryConverter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Later insertions override earlier ones for the same key.
    pub fn insert(&mut self, source: &str, target: &str) {
        if source.is_empty() {
            return;
        }
        self.max_key_chars = self.max_key_chars.max(source.chars().count());
        self.entries.insert(source.to_string(), target.to_string());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn load_str(&mut self, path: &Path, contents: &str) -> Result<usize, ScriptFilterError> {
        let mut loaded = 0;
        for (i, line) in contents.lines().enumerate() {
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }
            let (source, targets) =
                line.split_once('\t')
                    .ok_or_else(|| ScriptFilterError::Malformed {
                        path: path.to_path_buf(),
                        line: i + 1,
                    })?;
            let target = targets
                .split(' ')
                .find(|t| !t.is_empty())
                .ok_or_else(|| ScriptFilterError::Malformed {
                    path: path.to_path_buf(),
                    line: i + 1,
                })?;
            self.insert(source, target);
            loaded += 1;
        }
        Ok(loaded)
    }

    pub fn load_file(&mut self, path: &Path) -> Result<usize, ScriptFilterError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ScriptFilterError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.load_str(path, &contents)
    }

    pub fn from_files<P: AsRef<Path>>(paths: &[P]) -> Result<Self, ScriptFilterError> {
        let mut converter = Self::new();
        for path in paths {
            let loaded = converter.load_file(path.as_ref())?;
            info!("Loaded {} script conversion entries from {}", loaded, path.as_ref().display());
        }
        if converter.is_empty() {
            return Err(ScriptFilterError::Empty);
        }
        Ok(converter)
    }
}

impl ScriptFilter for DictionaryConverter {
    fn convert(&self, text: &str) -> String {
        if self.entries.is_empty() || text.is_empty() {
            return text.to_string();
        }
        let chars: Vec<(usize, char)> = text.char_indices().collect();
        let mut out = String::with_capacity(text.len());
        let mut i = 0;
        while i < chars.len() {
            let longest = self.max_key_chars.min(chars.len() - i);
            let start = chars[i].0;
            let mut matched = false;
            for len in (1..=longest).rev() {
                let end = chars.get(i + len).map(|(b, _)| *b).unwrap_or(text.len());
                if let Some(target) = self.entries.get(&text[start..end]) {
                    out.push_str(target);
                    i += len;
                    matched = true;
                    break;
                }
            }
            if !matched {
                out.push(chars[i].1);
                i += 1;
            }
        }
        out
    }
}
