// ============================================================
// Layer 4 — Relation Data Processor
// ============================================================
// Reads the relation corpus from `<data_dir>/{train,dev,test}.tsv`.
//
// Row layout (tab separated):
//   label <TAB> text_a <TAB> text_b [<TAB> extra columns ignored]
//
// text_a is required; text_b may be empty when both entities sit
// in one sentence.
// The first line is skipped when the files carry a header.
//
// Two formats are supported (see DataFormat):
//   Separate → text_a / text_b kept apart, encoded as a pair
//   Unified  → text_a and text_b joined before encoding

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::domain::error::TaskError;
use crate::domain::example::RelationExample;
use crate::domain::task::{DataFormat, Split};
use crate::domain::traits::ExampleSource;

#[derive(Debug, Clone)]
pub struct RelationDataProcessor {
    format:      DataFormat,
    max_seq_len: usize,
    data_dir:    PathBuf,
    /// Skip the first line of every split file
    has_header:  bool,
}

impl RelationDataProcessor {
    pub fn new(format: DataFormat, max_seq_len: usize) -> Self {
        Self {
            format,
            max_seq_len,
            data_dir:   PathBuf::from("."),
            has_header: false,
        }
    }

    /// Build the processor for a raw `data_format_mode` value.
    pub fn for_mode(mode: u8, max_seq_len: usize) -> Result<Self, TaskError> {
        Ok(Self::new(DataFormat::try_from(mode)?, max_seq_len))
    }

    pub fn set_data_dir(&mut self, dir: impl Into<PathBuf>) {
        self.data_dir = dir.into();
    }

    pub fn set_header(&mut self, has_header: bool) {
        self.has_header = has_header;
    }

    pub fn set_max_seq_len(&mut self, max_seq_len: usize) {
        self.max_seq_len = max_seq_len;
    }

    pub fn format(&self) -> DataFormat {
        self.format
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn parse_file(&self, split: Split) -> Result<Vec<RelationExample>> {
        let path = self.data_dir.join(split.file_name());
        let text = fs::read_to_string(&path)
            .with_context(|| format!("Cannot read {} data from '{}'", split, path.display()))?;

        let skip = usize::from(self.has_header);
        let mut examples = Vec::new();

        for (line_no, line) in text.lines().enumerate().skip(skip) {
            if line.trim().is_empty() {
                continue;
            }
            let cols: Vec<&str> = line.split('\t').collect();
            if cols.len() < 2 {
                return Err(TaskError::MalformedRow {
                    path:   path.clone(),
                    line:   line_no + 1,
                    reason: format!("expected at least 2 columns, found {}", cols.len()),
                }
                .into());
            }

            let label  = cols[0].trim();
            let text_a = cols[1].trim();
            if text_a.is_empty() {
                return Err(TaskError::MalformedRow {
                    path:   path.clone(),
                    line:   line_no + 1,
                    reason: "text_a is empty".into(),
                }
                .into());
            }
            let text_b = cols.get(2).map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
            let guid   = format!("{}-{}", split, line_no);

            let example = match self.format {
                DataFormat::Separate => RelationExample::new(guid, text_a, text_b, label),
                DataFormat::Unified  => {
                    let joined = RelationExample::new(guid.clone(), text_a, text_b, label).unified_text();
                    RelationExample::new(guid, joined, None, label)
                }
            };
            examples.push(example);
        }

        tracing::debug!("Parsed {} {} examples from '{}'", examples.len(), split, path.display());
        Ok(examples)
    }
}

impl ExampleSource for RelationDataProcessor {
    fn examples(&self, split: Split) -> Result<Vec<RelationExample>> {
        self.parse_file(split)
    }
}

impl fmt::Display for RelationDataProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RelationDataProcessor(format={:?}, max_seq_len={}, data_dir={}, header={})",
            self.format,
            self.max_seq_len,
            self.data_dir.display(),
            self.has_header,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_corpus(dir: &Path) {
        fs::write(
            dir.join("train.tsv"),
            "label\ttext_a\ttext_b\n\
             Reason\t[s1] aspirin [e1] for\t[s2] pain [e2]\n\
             NonRel\t[s1] ibuprofen [e1] and [s2] fever [e2]\t\n\
             Reason\t[s1] insulin [e1] for [s2] diabetes [e2]\t\n",
        )
        .unwrap();
    }

    #[test]
    fn test_separate_format_keeps_text_b() {
        let dir = tempfile::tempdir().unwrap();
        write_corpus(dir.path());

        let mut p = RelationDataProcessor::new(DataFormat::Separate, 64);
        p.set_data_dir(dir.path());
        p.set_header(true);

        let ex = p.examples(Split::Train).unwrap();
        assert_eq!(ex.len(), 3);
        assert_eq!(ex[0].text_b.as_deref(), Some("[s2] pain [e2]"));
        assert_eq!(ex[1].text_b, None);
        assert_eq!(ex[0].guid, "train-1");
    }

    #[test]
    fn test_unified_format_joins_sentences() {
        let dir = tempfile::tempdir().unwrap();
        write_corpus(dir.path());

        let mut p = RelationDataProcessor::for_mode(1, 64).unwrap();
        p.set_data_dir(dir.path());
        p.set_header(true);

        let ex = p.examples(Split::Train).unwrap();
        assert_eq!(ex[0].text_a, "[s1] aspirin [e1] for [s2] pain [e2]");
        assert!(ex.iter().all(|e| e.text_b.is_none()));
    }

    #[test]
    fn test_labels_and_distribution_come_from_train() {
        let dir = tempfile::tempdir().unwrap();
        write_corpus(dir.path());

        let mut p = RelationDataProcessor::new(DataFormat::Separate, 64);
        p.set_data_dir(dir.path());
        p.set_header(true);

        let labels = p.labels().unwrap();
        assert_eq!(labels.idx2label, vec!["NonRel", "Reason"]);

        let dist = p.sample_distribution().unwrap();
        assert_eq!(dist["Reason"], 2);
        assert_eq!(dist["NonRel"], 1);
    }

    #[test]
    fn test_header_is_parsed_as_data_when_not_flagged() {
        let dir = tempfile::tempdir().unwrap();
        write_corpus(dir.path());

        let mut p = RelationDataProcessor::new(DataFormat::Separate, 64);
        p.set_data_dir(dir.path());

        let ex = p.examples(Split::Train).unwrap();
        assert_eq!(ex.len(), 4);
        assert_eq!(ex[0].label, "label");
    }

    #[test]
    fn test_unsupported_mode_is_rejected() {
        let err = RelationDataProcessor::for_mode(3, 64).unwrap_err();
        assert!(matches!(err, TaskError::UnsupportedDataFormat(3)));
    }

    #[test]
    fn test_single_column_row_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("dev.tsv"), "Reason\tok text\nbroken-row\n").unwrap();

        let mut p = RelationDataProcessor::new(DataFormat::Separate, 64);
        p.set_data_dir(dir.path());

        let err = p.examples(Split::Dev).unwrap_err();
        let task_err = err.downcast_ref::<TaskError>().unwrap();
        assert!(matches!(task_err, TaskError::MalformedRow { line: 2, .. }));
    }

    #[test]
    fn test_empty_text_a_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("test.tsv"), "Reason\tok text\t\nOther\t\t\nReason\tmore\t\n").unwrap();

        let mut p = RelationDataProcessor::new(DataFormat::Separate, 64);
        p.set_data_dir(dir.path());

        let err = p.examples(Split::Test).unwrap_err();
        let task_err = err.downcast_ref::<TaskError>().unwrap();
        assert!(matches!(task_err, TaskError::MalformedRow { line: 2, .. }));
    }

    #[test]
    fn test_missing_split_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = RelationDataProcessor::new(DataFormat::Separate, 64);
        p.set_data_dir(dir.path());
        assert!(p.examples(Split::Test).is_err());
    }
}
