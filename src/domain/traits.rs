// ============================================================
// Layer 3 — Core Traits
// ============================================================

use std::collections::BTreeMap;

use anyhow::Result;

use crate::domain::example::RelationExample;
use crate::domain::label_index::LabelIndex;
use crate::domain::task::Split;

// ─── ExampleSource ────────────────────────────────────────────────────────────
/// Anything that can hand the task runner labelled relation examples.
///
/// Implementations:
///   - RelationDataProcessor → TSV files in a data directory
pub trait ExampleSource {
    fn examples(&self, split: Split) -> Result<Vec<RelationExample>>;

    /// Label index derived from the training split.
    fn labels(&self) -> Result<LabelIndex> {
        let train = self.examples(Split::Train)?;
        Ok(LabelIndex::from_labels(train.into_iter().map(|e| e.label)))
    }

    /// Number of training examples per label.
    fn sample_distribution(&self) -> Result<BTreeMap<String, usize>> {
        let mut freq = BTreeMap::new();
        for ex in self.examples(Split::Train)? {
            *freq.entry(ex.label).or_insert(0) += 1;
        }
        Ok(freq)
    }
}
