// ============================================================
// Layer 3 — LabelIndex
// ============================================================
// Maps relation labels to contiguous class indices and back.
//
// The index is derived from the training split (sorted unique
// labels) and written next to every checkpoint. At inference
// time the saved copy is reloaded so that class i means the same
// relation it meant during training.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::domain::error::TaskError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelIndex {
    pub label2idx: BTreeMap<String, usize>,
    pub idx2label: Vec<String>,
}

impl LabelIndex {
    /// Build from any label iterator; duplicates are collapsed and the
    /// remaining labels are sorted so the mapping is deterministic.
    pub fn from_labels<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let unique: BTreeSet<String> = labels.into_iter().map(Into::into).collect();
        let idx2label: Vec<String> = unique.into_iter().collect();
        let label2idx = idx2label
            .iter()
            .enumerate()
            .map(|(i, l)| (l.clone(), i))
            .collect();
        Self { label2idx, idx2label }
    }

    pub fn num_labels(&self) -> usize {
        self.idx2label.len()
    }

    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.label2idx.get(label).copied()
    }

    pub fn label_of(&self, idx: usize) -> Result<&str, TaskError> {
        self.idx2label
            .get(idx)
            .map(String::as_str)
            .ok_or(TaskError::LabelOutOfRange { index: idx, num_labels: self.num_labels() })
    }

    /// Convert predicted class indices back to label strings.
    pub fn decode(&self, preds: &[usize]) -> Result<Vec<String>, TaskError> {
        preds
            .iter()
            .map(|&p| self.label_of(p).map(str::to_string))
            .collect()
    }
}
