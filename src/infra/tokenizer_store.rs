// ============================================================
// Layer 6 — Tokenizer Store
// ============================================================
// Loads and saves HuggingFace tokenizer.json files and applies the
// relation-extraction additions on top of a pretrained vocabulary:
//
//   1. entity tags [s1] [e1] [s2] [e2] added as new tokens
//   2. a pad id resolved from the vocabulary (pad → eos → 0)
//   3. the embedding row count the model must be resized to
//
// build_word_level() writes a small word-level tokenizer JSON by
// hand. It backs the scaffolded offline base model and the tests;
// tokenizers 0.15 trainers cannot produce a ModelWrapper directly.

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use tokenizers::{AddedToken, Tokenizer};

pub const TOKENIZER_FILE: &str = "tokenizer.json";

/// Entity marker tags, in the order their ids are stored in configs.
pub const SPEC_TAGS: [&str; 4] = ["[s1]", "[e1]", "[s2]", "[e2]"];

const PAD_CANDIDATES: [&str; 3] = ["<pad>", "[PAD]", "<|pad|>"];
const EOS_CANDIDATES: [&str; 3] = ["</s>", "<|endoftext|>", "<eos>"];

pub struct TokenizerStore {
    dir: PathBuf,
}

impl TokenizerStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(TOKENIZER_FILE)
    }

    pub fn exists(&self) -> bool {
        self.path().exists()
    }

    pub fn load(&self) -> Result<Tokenizer> {
        let path = self.path();
        anyhow::ensure!(self.exists(), "No {} in '{}'", TOKENIZER_FILE, self.dir.display());
        Tokenizer::from_file(&path)
            .map_err(|e| anyhow!("Cannot load tokenizer from '{}': {}", path.display(), e))
    }

    pub fn save(&self, tokenizer: &Tokenizer) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Cannot create '{}'", self.dir.display()))?;
        let path = self.path();
        tokenizer
            .save(&path, true)
            .map_err(|e| anyhow!("Cannot write tokenizer to '{}': {}", path.display(), e))?;
        tracing::debug!("Saved tokenizer to '{}'", path.display());
        Ok(())
    }

    /// Add the entity tags (no-op for tags already present) and return
    /// their ids in SPEC_TAGS order.
    pub fn add_entity_tags(tokenizer: &mut Tokenizer) -> Result<Vec<u32>> {
        let tokens: Vec<AddedToken> = SPEC_TAGS
            .iter()
            .map(|t| AddedToken::from(t.to_string(), false))
            .collect();
        let added = tokenizer.add_tokens(&tokens);
        if added > 0 {
            tracing::info!("Added {} entity tag tokens {:?}", added, SPEC_TAGS);
        }
        SPEC_TAGS
            .iter()
            .map(|t| {
                tokenizer
                    .token_to_id(t)
                    .ok_or_else(|| anyhow!("Entity tag '{t}' missing after adding it"))
            })
            .collect()
    }

    /// Pad token id; falls back to EOS, then to 0.
    pub fn resolve_pad_id(tokenizer: &Tokenizer) -> u32 {
        if let Some(padding) = tokenizer.get_padding() {
            return padding.pad_id;
        }
        if let Some(id) = first_known(tokenizer, &PAD_CANDIDATES) {
            return id;
        }
        if let Some(id) = first_known(tokenizer, &EOS_CANDIDATES) {
            tracing::info!("Tokenizer has no pad token; assigning EOS id {id} as pad");
            return id;
        }
        tracing::warn!("Tokenizer has neither pad nor EOS token; padding with id 0");
        0
    }

    /// Rows the embedding table needs: one past the largest token id.
    pub fn embedding_rows(tokenizer: &Tokenizer) -> usize {
        tokenizer
            .get_vocab(true)
            .values()
            .copied()
            .max()
            .map_or(0, |max| max as usize + 1)
    }

    /// Build a lowercase word-level tokenizer over the `vocab_size - 4`
    /// most frequent words of `texts`. Ids are contiguous:
    /// <pad>=0 <unk>=1 <s>=2 </s>=3, then words by descending frequency.
    pub fn build_word_level(texts: &[String], vocab_size: usize) -> Result<Tokenizer> {
        let mut freq: HashMap<String, usize> = HashMap::new();
        for text in texts {
            for word in text.split_whitespace() {
                let w = word.to_lowercase();
                let w = w.trim_matches(|c: char| !c.is_alphanumeric());
                if !w.is_empty() {
                    *freq.entry(w.to_string()).or_insert(0) += 1;
                }
            }
        }

        // Frequency desc, then alphabetical so equal counts are stable.
        let mut words: Vec<(String, usize)> = freq.into_iter().collect();
        words.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        words.truncate(vocab_size.saturating_sub(4));

        let specials = ["<pad>", "<unk>", "<s>", "</s>"];
        let mut vocab = serde_json::Map::new();
        for (id, tok) in specials.iter().enumerate() {
            vocab.insert(tok.to_string(), serde_json::json!(id));
        }
        for (word, _) in &words {
            let id = vocab.len();
            vocab.entry(word.clone()).or_insert(serde_json::json!(id));
        }

        let added_tokens: Vec<serde_json::Value> = specials
            .iter()
            .enumerate()
            .map(|(id, tok)| serde_json::json!({
                "id": id, "content": tok, "single_word": false, "lstrip": false,
                "rstrip": false, "normalized": false, "special": true
            }))
            .collect();

        let tokenizer_json = serde_json::json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": added_tokens,
            "normalizer": {
                "type": "BertNormalizer",
                "clean_text": true,
                "handle_chinese_chars": true,
                "strip_accents": null,
                "lowercase": true
            },
            "pre_tokenizer": { "type": "Whitespace" },
            "post_processor": null,
            "decoder": null,
            "model": {
                "type": "WordLevel",
                "vocab": vocab,
                "unk_token": "<unk>"
            }
        });

        let tokenizer: Tokenizer = tokenizer_json
            .to_string()
            .parse()
            .map_err(|e| anyhow!("Cannot build word-level tokenizer: {e}"))?;
        tracing::info!("Built word-level tokenizer with {} entries", Self::embedding_rows(&tokenizer));
        Ok(tokenizer)
    }
}

fn first_known(tokenizer: &Tokenizer, candidates: &[&str]) -> Option<u32> {
    candidates.iter().find_map(|t| tokenizer.token_to_id(t))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn corpus() -> Vec<String> {
        vec![
            "Aspirin was given for pain.".to_string(),
            "pain resolved after aspirin".to_string(),
        ]
    }

    #[test]
    fn test_word_level_ids_are_contiguous() {
        let tok = TokenizerStore::build_word_level(&corpus(), 64).unwrap();
        let rows = TokenizerStore::embedding_rows(&tok);
        assert_eq!(rows, tok.get_vocab_size(true));
        assert_eq!(tok.token_to_id("<pad>"), Some(0));
        // aspirin and pain are the most frequent words
        assert!(tok.token_to_id("aspirin").unwrap() < 6);
    }

    #[test]
    fn test_vocab_size_caps_words() {
        let tok = TokenizerStore::build_word_level(&corpus(), 6).unwrap();
        assert_eq!(TokenizerStore::embedding_rows(&tok), 6);
    }

    #[test]
    fn test_entity_tags_are_new_and_idempotent() {
        let mut tok = TokenizerStore::build_word_level(&corpus(), 64).unwrap();
        let before = TokenizerStore::embedding_rows(&tok) as u32;

        let ids = TokenizerStore::add_entity_tags(&mut tok).unwrap();
        assert_eq!(ids.len(), 4);
        assert!(ids.iter().all(|&id| id >= before));

        let again = TokenizerStore::add_entity_tags(&mut tok).unwrap();
        assert_eq!(ids, again);
        assert_eq!(TokenizerStore::embedding_rows(&tok), before as usize + 4);

        let enc = tok.encode("[s1] aspirin [e1]", false).unwrap();
        assert_eq!(enc.get_ids().first(), Some(&ids[0]));
        assert_eq!(enc.get_ids().last(), Some(&ids[1]));
    }

    #[test]
    fn test_pad_id_resolution() {
        let tok = TokenizerStore::build_word_level(&corpus(), 64).unwrap();
        assert_eq!(TokenizerStore::resolve_pad_id(&tok), 0);
    }

    #[test]
    fn test_save_and_reload() {
        let dir   = tempdir().unwrap();
        let store = TokenizerStore::new(dir.path());
        let mut tok = TokenizerStore::build_word_level(&corpus(), 64).unwrap();
        let ids = TokenizerStore::add_entity_tags(&mut tok).unwrap();

        assert!(!store.exists());
        store.save(&tok).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.token_to_id("[s2]"), Some(ids[2]));
        assert_eq!(
            loaded.encode("pain", false).unwrap().get_ids(),
            tok.encode("pain", false).unwrap().get_ids()
        );
    }
}
