// ============================================================
// Layer 4 — Example Cache
// ============================================================
// Parsed examples are cached as JSON inside the data directory.
// The file name is a fingerprint of everything that changes what
// the examples look like downstream:
//
//   cached_<model_type>_<format_mode>_<max_seq_len>_<tokenizer>_<split>.json
//
// A different model variant, data format, sequence length or
// tokenizer therefore never reuses a stale cache file.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::domain::example::RelationExample;
use crate::domain::model_type::ModelType;
use crate::domain::task::{DataFormat, Split};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    pub model_type:     ModelType,
    pub format:         DataFormat,
    pub max_seq_len:    usize,
    pub tokenizer_name: String,
}

impl CacheKey {
    /// Only the last path component of the tokenizer location is used,
    /// so the same tokenizer reached through different paths shares a cache.
    pub fn new(model_type: ModelType, format: DataFormat, max_seq_len: usize, tokenizer_path: &Path) -> Self {
        let tokenizer_name = tokenizer_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("tokenizer")
            .to_string();
        Self { model_type, format, max_seq_len, tokenizer_name }
    }

    pub fn file_name(&self, split: Split) -> String {
        format!(
            "cached_{}_{}_{}_{}_{}.json",
            self.model_type,
            self.format.mode(),
            self.max_seq_len,
            self.tokenizer_name,
            split,
        )
    }
}

pub struct ExampleCache {
    dir:     PathBuf,
    enabled: bool,
}

impl ExampleCache {
    pub fn new(dir: impl Into<PathBuf>, enabled: bool) -> Self {
        Self { dir: dir.into(), enabled }
    }

    pub fn path_for(&self, key: &CacheKey, split: Split) -> PathBuf {
        self.dir.join(key.file_name(split))
    }

    /// Return cached examples when present, otherwise call `build`
    /// and persist its output (only when caching is enabled).
    pub fn load_or_build<F>(&self, key: &CacheKey, split: Split, build: F) -> Result<Vec<RelationExample>>
    where
        F: FnOnce() -> Result<Vec<RelationExample>>,
    {
        if !self.enabled {
            tracing::info!("Creating {} examples; the processed data will not be cached", split);
            return build();
        }

        let path = self.path_for(key, split);
        if path.exists() {
            let json = fs::read_to_string(&path)
                .with_context(|| format!("Cannot read cache '{}'", path.display()))?;
            let examples: Vec<RelationExample> = serde_json::from_str(&json)
                .with_context(|| format!("Corrupt cache file '{}'", path.display()))?;
            tracing::info!("Loaded {} data from cached file '{}'", split, path.display());
            return Ok(examples);
        }

        tracing::info!("Creating {} examples and caching them at '{}'", split, path.display());
        let examples = build()?;
        fs::write(&path, serde_json::to_string(&examples)?)
            .with_context(|| format!("Cannot write cache '{}'", path.display()))?;
        Ok(examples)
    }
}
