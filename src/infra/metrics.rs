// ============================================================
// Layer 6 — Metrics
// ============================================================
// Evaluation scores, the per-epoch CSV log and the step → loss
// history written at the end of training.
//
//   accuracy   = correct / total                (all labels)
//   precision  = tp / predicted relations       (non-relation label excluded)
//   recall     = tp / gold relations
//   f1         = 2PR / (P + R)
//
// Example metrics.csv:
//   epoch,train_loss,eval_loss,accuracy,precision,recall,f1
//   1,0.912300,0.843100,0.701000,0.654000,0.610000,0.631200

use anyhow::{bail, Context, Result};
use std::{
    collections::BTreeMap,
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};
use serde::{Deserialize, Serialize};

use crate::domain::label_index::LabelIndex;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvalResult {
    pub accuracy:  f64,
    pub precision: f64,
    pub recall:    f64,
    pub f1:        f64,
}

impl std::fmt::Display for EvalResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "acc: {:.4}; precision: {:.4}; recall: {:.4}; f1: {:.4}",
            self.accuracy, self.precision, self.recall, self.f1
        )
    }
}

/// Accuracy plus micro P/R/F1 over every label except `non_rel_label`.
/// An empty or unknown `non_rel_label` counts every label.
pub fn acc_and_f1(
    labels:        &[usize],
    preds:         &[usize],
    label_index:   &LabelIndex,
    non_rel_label: &str,
) -> Result<EvalResult> {
    if labels.len() != preds.len() {
        bail!("{} gold labels but {} predictions", labels.len(), preds.len());
    }
    if let Some(&bad) = preds.iter().find(|&&p| p >= label_index.num_labels()) {
        label_index.label_of(bad)?;
    }

    let negative = label_index.index_of(non_rel_label);
    if negative.is_none() && !non_rel_label.is_empty() {
        tracing::warn!("Non-relation label '{non_rel_label}' not in label index; scoring all labels");
    }
    let is_relation = |idx: usize| Some(idx) != negative;

    let correct   = labels.iter().zip(preds).filter(|(l, p)| l == p).count();
    let tp        = labels.iter().zip(preds).filter(|(l, p)| l == p && is_relation(**p)).count();
    let predicted = preds.iter().filter(|&&p| is_relation(p)).count();
    let gold      = labels.iter().filter(|&&l| is_relation(l)).count();

    let ratio = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f64 / den as f64 };
    let accuracy  = ratio(correct, labels.len());
    let precision = ratio(tp, predicted);
    let recall    = ratio(tp, gold);
    let f1 = if precision + recall == 0.0 {
        0.0
    } else {
        2.0 * precision * recall / (precision + recall)
    };

    Ok(EvalResult { accuracy, precision, recall, f1 })
}

// ─── Epoch log ──────────────────────────────────────────────

/// One row of metrics.csv
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch:      usize,
    pub train_loss: f64,
    pub eval_loss:  f64,
    pub scores:     EvalResult,
}

impl EpochMetrics {
    pub fn new(epoch: usize, train_loss: f64, eval_loss: f64, scores: EvalResult) -> Self {
        Self { epoch, train_loss, eval_loss, scores }
    }

    /// Strictly better f1 than the best seen so far.
    pub fn is_improvement(&self, best_f1: f64) -> bool {
        self.scores.f1 > best_f1
    }
}

pub struct MetricsLogger {
    csv_path: PathBuf,
}

impl MetricsLogger {
    /// Writes the CSV header if the file doesn't exist yet.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let csv_path = dir.join("metrics.csv");
        if !csv_path.exists() {
            let mut f = fs::File::create(&csv_path)?;
            writeln!(f, "epoch,train_loss,eval_loss,accuracy,precision,recall,f1")?;
            tracing::debug!("Created metrics CSV: '{}'", csv_path.display());
        }

        Ok(Self { csv_path })
    }

    pub fn log(&self, m: &EpochMetrics) -> Result<()> {
        let mut f = OpenOptions::new()
            .append(true)
            .open(&self.csv_path)
            .with_context(|| format!("Cannot open '{}'", self.csv_path.display()))?;

        writeln!(
            f,
            "{},{:.6},{:.6},{:.6},{:.6},{:.6},{:.6}",
            m.epoch,
            m.train_loss,
            m.eval_loss,
            m.scores.accuracy,
            m.scores.precision,
            m.scores.recall,
            m.scores.f1,
        )?;

        tracing::debug!("Logged epoch {} metrics: f1={:.4}", m.epoch, m.scores.f1);
        Ok(())
    }

}

// ─── Loss history ───────────────────────────────────────────

pub const LOSS_HISTORY_FILE: &str = "final_loss_dict.json";

/// Global step → running mean training loss.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossHistory {
    entries: BTreeMap<usize, f64>,
}

impl LossHistory {
    pub fn record(&mut self, step: usize, mean_loss: f64) {
        self.entries.insert(step, mean_loss);
    }

    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(LOSS_HISTORY_FILE);
        fs::write(&path, serde_json::to_string_pretty(&self.entries)?)
            .with_context(|| format!("Cannot write loss history to '{}'", path.display()))?;
        tracing::info!("Saved {} loss records to '{}'", self.entries.len(), path.display());
        Ok(path)
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn index() -> LabelIndex {
        // sorted: Dosage=0, NonRel=1, Reason=2
        LabelIndex::from_labels(["Reason", "NonRel", "Dosage"])
    }

    #[test]
    fn test_micro_scores_exclude_non_relation() {
        let labels = [2, 1, 0, 1, 2];
        let preds  = [2, 1, 1, 0, 0];
        let r = acc_and_f1(&labels, &preds, &index(), "NonRel").unwrap();

        assert!((r.accuracy - 0.4).abs() < 1e-12);
        // tp = 1 (first sample); predicted relations = 3; gold relations = 3
        assert!((r.precision - 1.0 / 3.0).abs() < 1e-12);
        assert!((r.recall - 1.0 / 3.0).abs() < 1e-12);
        assert!((r.f1 - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_without_non_relation_label_micro_equals_accuracy() {
        let labels = [0, 1, 2, 2];
        let preds  = [0, 1, 1, 2];
        let r = acc_and_f1(&labels, &preds, &index(), "").unwrap();
        assert_eq!(r.accuracy, 0.75);
        assert_eq!(r.precision, 0.75);
        assert_eq!(r.f1, 0.75);
    }

    #[test]
    fn test_no_relations_predicted_gives_zero_f1() {
        let r = acc_and_f1(&[2, 0], &[1, 1], &index(), "NonRel").unwrap();
        assert_eq!(r.f1, 0.0);
        assert_eq!(r.precision, 0.0);
    }

    #[test]
    fn test_mismatched_or_out_of_range_inputs() {
        assert!(acc_and_f1(&[0, 1], &[0], &index(), "").is_err());
        assert!(acc_and_f1(&[0], &[7], &index(), "").is_err());
    }

    #[test]
    fn test_is_improvement() {
        let scores = EvalResult { accuracy: 0.5, precision: 0.5, recall: 0.5, f1: 0.5 };
        let m = EpochMetrics::new(2, 0.9, 0.8, scores);
        assert!(m.is_improvement(0.4));
        assert!(!m.is_improvement(0.5));
    }

    #[test]
    fn test_metrics_csv_appends_rows() {
        let dir    = tempdir().unwrap();
        let logger = MetricsLogger::new(dir.path()).unwrap();
        let scores = EvalResult { accuracy: 1.0, precision: 1.0, recall: 1.0, f1: 1.0 };
        logger.log(&EpochMetrics::new(1, 0.5, 0.4, scores)).unwrap();
        logger.log(&EpochMetrics::new(2, 0.3, 0.2, scores)).unwrap();

        let csv = fs::read_to_string(dir.path().join("metrics.csv")).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[2].starts_with("2,0.300000,0.200000"));
    }

    #[test]
    fn test_loss_history_persists() {
        let dir = tempdir().unwrap();
        let mut h = LossHistory::default();
        h.record(100, 0.7);
        h.record(200, 0.6);

        let path = h.save(dir.path()).unwrap();
        assert!(path.ends_with(LOSS_HISTORY_FILE));
        let saved: BTreeMap<usize, f64> = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(saved, BTreeMap::from([(100, 0.7), (200, 0.6)]));
    }
}
