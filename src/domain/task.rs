// ============================================================
// Layer 3 — Data format modes and dataset splits
// ============================================================

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::domain::error::TaskError;

/// How the two sentences of an example reach the tokenizer.
///
///   0 → Separate: encoded as a sentence pair (text_a, text_b)
///   1 → Unified:  concatenated into one text before encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum DataFormat {
    Separate,
    Unified,
}

impl DataFormat {
    pub fn mode(&self) -> u8 {
        match self {
            DataFormat::Separate => 0,
            DataFormat::Unified  => 1,
        }
    }
}

impl TryFrom<u8> for DataFormat {
    type Error = TaskError;

    fn try_from(mode: u8) -> Result<Self, Self::Error> {
        match mode {
            0 => Ok(DataFormat::Separate),
            1 => Ok(DataFormat::Unified),
            other => Err(TaskError::UnsupportedDataFormat(other)),
        }
    }
}

impl From<DataFormat> for u8 {
    fn from(f: DataFormat) -> u8 {
        f.mode()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Split {
    Train,
    Dev,
    Test,
}

impl Split {
    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Dev   => "dev",
            Split::Test  => "test",
        }
    }

    /// Name of the TSV file holding this split inside the data dir.
    pub fn file_name(&self) -> String {
        format!("{}.tsv", self.as_str())
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Split {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "train" => Ok(Split::Train),
            "dev"   => Ok(Split::Dev),
            "test"  => Ok(Split::Test),
            other   => Err(TaskError::UnsupportedTask(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_format_modes() {
        assert_eq!(DataFormat::try_from(0).unwrap(), DataFormat::Separate);
        assert_eq!(DataFormat::try_from(1).unwrap(), DataFormat::Unified);
        assert_eq!(u8::from(DataFormat::Unified), 1);
    }

    #[test]
    fn test_unsupported_data_format_fails() {
        let err = DataFormat::try_from(2).unwrap_err();
        assert_eq!(err.to_string(), "only data_format_mode 0 or 1 is supported, got 2");
    }

    #[test]
    fn test_data_format_serde_is_numeric() {
        assert_eq!(serde_json::to_string(&DataFormat::Separate).unwrap(), "0");
        assert!(serde_json::from_str::<DataFormat>("7").is_err());
    }

    #[test]
    fn test_split_parsing() {
        assert_eq!("dev".parse::<Split>().unwrap(), Split::Dev);
        assert_eq!(Split::Test.file_name(), "test.tsv");
        let err = "validation".parse::<Split>().unwrap_err();
        assert!(matches!(err, TaskError::UnsupportedTask(ref t) if t == "validation"));
    }
}
