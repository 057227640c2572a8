// ============================================================
// Layer 3 — RelationExample
// ============================================================
// One labelled relation instance. Entity mentions are already
// wrapped in the tag tokens [s1] .. [e1] and [s2] .. [e2] by the
// upstream corpus builder, so the text is taken as-is.
//
// text_b is present when the two entities sit in different
// sentences and the data format keeps them apart.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationExample {
    /// "<split>-<row>" identifier, kept for traceability in logs
    pub guid:   String,
    pub text_a: String,
    pub text_b: Option<String>,
    pub label:  String,
}

impl RelationExample {
    pub fn new(
        guid:   impl Into<String>,
        text_a: impl Into<String>,
        text_b: Option<String>,
        label:  impl Into<String>,
    ) -> Self {
        Self {
            guid:   guid.into(),
            text_a: text_a.into(),
            text_b,
            label:  label.into(),
        }
    }

    /// Joins both sentences into one text, used by the unified format.
    pub fn unified_text(&self) -> String {
        match &self.text_b {
            Some(b) if !b.is_empty() => format!("{} {}", self.text_a, b),
            _ => self.text_a.clone(),
        }
    }
}
