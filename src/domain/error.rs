use std::path::PathBuf;

/// Failures the task runner reports explicitly instead of through a
/// generic I/O error.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("only data_format_mode 0 or 1 is supported, got {0}")]
    UnsupportedDataFormat(u8),

    #[error("expected task to be train, dev or test but got '{0}'")]
    UnsupportedTask(String),

    #[error("unsupported model type '{0}' (expected one of llama1, llama2, llama1_pre, llama2_pre)")]
    UnknownModelType(String),

    #[error("predicted class {index} is outside the label index ({num_labels} labels)")]
    LabelOutOfRange { index: usize, num_labels: usize },

    #[error("no checkpoint found under {0}")]
    MissingCheckpoint(PathBuf),

    #[error("malformed row {line} in {path}: {reason}")]
    MalformedRow { path: PathBuf, line: usize, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_row_display() {
        let err = TaskError::MalformedRow {
            path:   PathBuf::from("data/train.tsv"),
            line:   3,
            reason: "expected at least 2 columns".into(),
        };
        assert_eq!(err.to_string(), "malformed row 3 in data/train.tsv: expected at least 2 columns");
    }
}
