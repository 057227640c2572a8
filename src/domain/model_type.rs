// ============================================================
// Layer 3 — ModelType
// ============================================================
// The pretrained-model variants the task runner knows how to
// initialise. The `_pre` variants start from a LoRA adapter that
// was already trained on in-domain text instead of a fresh one.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::domain::error::TaskError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    Llama1,
    Llama2,
    Llama1Pre,
    Llama2Pre,
}

impl ModelType {
    pub const ALL: [ModelType; 4] = [
        ModelType::Llama1,
        ModelType::Llama2,
        ModelType::Llama1Pre,
        ModelType::Llama2Pre,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::Llama1    => "llama1",
            ModelType::Llama2    => "llama2",
            ModelType::Llama1Pre => "llama1_pre",
            ModelType::Llama2Pre => "llama2_pre",
        }
    }

    /// True when initialisation loads a previously trained adapter
    /// rather than injecting a freshly initialised one.
    pub fn uses_pretrained_adapter(&self) -> bool {
        matches!(self, ModelType::Llama1Pre | ModelType::Llama2Pre)
    }

    /// 1 or 2 — the LLaMA generation of the base weights.
    pub fn generation(&self) -> u8 {
        match self {
            ModelType::Llama1 | ModelType::Llama1Pre => 1,
            ModelType::Llama2 | ModelType::Llama2Pre => 2,
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelType {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ModelType::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == s.trim().to_ascii_lowercase())
            .ok_or_else(|| TaskError::UnknownModelType(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_all_variants() {
        for m in ModelType::ALL {
            assert_eq!(m.as_str().parse::<ModelType>().unwrap(), m);
        }
        assert_eq!("LLAMA2_PRE".parse::<ModelType>().unwrap(), ModelType::Llama2Pre);
    }

    #[test]
    fn test_unknown_model_type_is_rejected() {
        let err = "bert".parse::<ModelType>().unwrap_err();
        assert_eq!(err.to_string(), "unsupported model type 'bert' (expected one of llama1, llama2, llama1_pre, llama2_pre)");
    }

    #[test]
    fn test_variant_properties() {
        assert!(ModelType::Llama1Pre.uses_pretrained_adapter());
        assert!(!ModelType::Llama2.uses_pretrained_adapter());
        assert_eq!(ModelType::Llama2Pre.generation(), 2);
        assert_eq!(ModelType::Llama1.generation(), 1);
    }

    #[test]
    fn test_serde_uses_snake_case() {
        let json = serde_json::to_string(&ModelType::Llama1Pre).unwrap();
        assert_eq!(json, "\"llama1_pre\"");
    }
}
