// ============================================================
// Layer 4 — Example → Feature conversion
// ============================================================
// Turns RelationExamples into token id sequences plus a class id.
//
//   Separate format → tokenizer.encode((text_a, text_b))
//   Unified format  → tokenizer.encode(text_a)
//
// Sequences are truncated to max_seq_len here, longest sentence
// first, so a long text_a cannot push text_b (and its [s2] / [e2]
// tags) out of a pair. Padding happens per batch in the batcher.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tokenizers::utils::truncation::{TruncationParams, TruncationStrategy};
use tokenizers::Tokenizer;

use crate::domain::example::RelationExample;
use crate::domain::label_index::LabelIndex;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationFeature {
    pub input_ids: Vec<u32>,
    pub label:     usize,
}

/// What to do with a label missing from the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnknownLabel {
    /// Train / dev data must only carry known labels.
    Reject,
    /// Test data often carries a placeholder label; map it to class 0.
    MapToFirst,
}

pub fn convert_examples_to_features(
    examples:    &[RelationExample],
    tokenizer:   &Tokenizer,
    max_seq_len: usize,
    labels:      &LabelIndex,
    unknown:     UnknownLabel,
) -> Result<Vec<RelationFeature>> {
    let mut tokenizer = tokenizer.clone();
    tokenizer
        .with_truncation(Some(TruncationParams {
            max_length: max_seq_len,
            strategy:   TruncationStrategy::LongestFirst,
            ..TruncationParams::default()
        }))
        .map_err(|e| anyhow!("Invalid truncation for max_seq_len {max_seq_len}: {e}"))?;

    let mut features = Vec::with_capacity(examples.len());

    for ex in examples {
        let encoding = match &ex.text_b {
            Some(b) => tokenizer.encode((ex.text_a.as_str(), b.as_str()), true),
            None    => tokenizer.encode(ex.text_a.as_str(), true),
        }
        .map_err(|e| anyhow::anyhow!("Tokenisation error in {}: {e}", ex.guid))?;

        let mut input_ids = encoding.get_ids().to_vec();
        input_ids.truncate(max_seq_len);
        // Dropping a row would shift every later prediction off its example.
        if input_ids.is_empty() {
            anyhow::bail!("{} produced no tokens", ex.guid);
        }

        let label = match (labels.index_of(&ex.label), unknown) {
            (Some(idx), _) => idx,
            (None, UnknownLabel::MapToFirst) => 0,
            (None, UnknownLabel::Reject) => anyhow::bail!(
                "Label '{}' of {} is not in the training label index",
                ex.label,
                ex.guid
            ),
        };

        features.push(RelationFeature { input_ids, label });
    }

    tracing::debug!("Converted {} examples into features", features.len());
    Ok(features)
}
