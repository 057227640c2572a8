// ============================================================
// Layer 2 — Launcher
// ============================================================
// Picks the backend and precision for a TaskConfig, then runs the
// enabled modes in order: train → eval → predict.

use anyhow::Result;
use burn::tensor::backend::AutodiffBackend;

use crate::application::task_config::TaskConfig;
use crate::application::task_runner::TaskRunner;
use crate::infra::metrics::EvalResult;
use crate::ml::backend::{dispatch, BackendTask, DeviceSupport};
use crate::ml::precision::{resolve_precision, Precision};

#[derive(Debug, Default, Clone, PartialEq)]
pub struct RunOutcome {
    pub eval:        Option<EvalResult>,
    pub predictions: Option<Vec<String>>,
}

struct RunTask {
    config: TaskConfig,
}

impl BackendTask for RunTask {
    type Output = Result<RunOutcome>;

    fn run<B: AutodiffBackend>(self, device: B::Device, precision: Precision) -> Self::Output {
        let mut runner = TaskRunner::<B>::new(self.config, device, precision)?;
        runner.init()?;
        execute(&mut runner)
    }
}

pub fn execute<B: AutodiffBackend>(runner: &mut TaskRunner<B>) -> Result<RunOutcome> {
    let config = runner.config().clone();
    let mut outcome = RunOutcome::default();

    if config.do_train {
        runner.train()?;
    }
    if config.do_eval {
        outcome.eval = Some(runner.eval(&config.non_relation_label)?);
    }
    if config.do_predict {
        let predictions = runner.predict()?;
        if let Some(path) = &config.predict_output_file {
            TaskRunner::<B>::save_predictions(&predictions, path)?;
        }
        outcome.predictions = Some(predictions);
    }
    Ok(outcome)
}

/// Validate, resolve precision (fp16 only matters when training) and run.
pub fn launch(config: TaskConfig) -> Result<RunOutcome> {
    config.validate()?;
    let precision = if config.do_train {
        resolve_precision(config.fp16, &DeviceSupport::new(config.device))
    } else {
        Precision::Full
    };
    tracing::info!("Launching on {:?} with {} precision", config.device, precision);
    dispatch(config.device, precision, RunTask { config })
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use std::{fs, path::Path};
    use tempfile::{tempdir, TempDir};

    use crate::domain::{error::TaskError, model_type::ModelType};
    use crate::infra::checkpoint::CheckpointManager;
    use crate::infra::metrics::LOSS_HISTORY_FILE;
    use crate::infra::pretrained::PretrainedStore;
    use crate::ml::backend::DeviceKind;
    use crate::ml::model::DecoderConfig;

    type CpuRunner = TaskRunner<Autodiff<NdArray<f32>>>;

    const ROWS: [(&str, &str, &str); 6] = [
        ("Reason", "[s1] aspirin [e1] was given", "for [s2] pain [e2]"),
        ("Reason", "[s1] ibuprofen [e1] was given", "for [s2] fever [e2]"),
        ("Other", "[s1] aspirin [e1] and", "[s2] rash [e2] noted"),
        ("Reason", "[s1] heparin [e1] was given", "for [s2] clot [e2]"),
        ("Other", "[s1] heparin [e1] and", "[s2] fever [e2] noted"),
        ("Other", "[s1] ibuprofen [e1] and", "[s2] clot [e2] noted"),
    ];

    /// Temp dirs for one run: base model, data and output.
    struct Workspace {
        base: TempDir,
        data: TempDir,
        out:  TempDir,
    }

    fn write_split(dir: &Path, file: &str, rows: &[(&str, &str, &str)]) {
        let body: Vec<String> = rows.iter().map(|(l, a, b)| format!("{l}\t{a}\t{b}")).collect();
        fs::write(dir.join(file), format!("label\ttext_a\ttext_b\n{}\n", body.join("\n"))).unwrap();
    }

    fn workspace() -> Workspace {
        let ws = Workspace { base: tempdir().unwrap(), data: tempdir().unwrap(), out: tempdir().unwrap() };
        for file in ["train.tsv", "dev.tsv", "test.tsv"] {
            write_split(ws.data.path(), file, &ROWS);
        }
        let corpus: Vec<String> = ROWS.iter().map(|(_, a, b)| format!("{a} {b}")).collect();
        PretrainedStore::new(ws.base.path())
            .scaffold::<NdArray<f32>>(DecoderConfig::new(64, 8, 2, 1, 16, 64), &corpus, &Default::default())
            .unwrap();
        ws
    }

    fn train_config(ws: &Workspace) -> TaskConfig {
        TaskConfig {
            model_type:            ModelType::Llama2,
            pretrained_model:      ws.base.path().to_path_buf(),
            data_dir:              ws.data.path().to_path_buf(),
            new_model_dir:         ws.out.path().to_path_buf(),
            data_file_header:      true,
            max_seq_length:        32,
            do_train:              true,
            do_eval:               true,
            train_batch_size:      2,
            eval_batch_size:       4,
            num_train_epochs:      1,
            learning_rate:         1e-3,
            max_num_checkpoints:   0,
            loss_record_step:      1,
            classification_scheme: 1,
            device:                DeviceKind::Cpu,
            ..TaskConfig::default()
        }
    }

    fn predict_config(train: &TaskConfig) -> TaskConfig {
        TaskConfig {
            do_train:   false,
            do_eval:    false,
            do_predict: true,
            ..train.clone()
        }
    }

    #[test]
    fn test_train_then_predict_from_checkpoint() {
        let ws    = workspace();
        let train = train_config(&ws);
        let out   = ws.out.path();

        let outcome = launch(train.clone()).unwrap();
        let scores  = outcome.eval.unwrap();
        assert!((0.0..=1.0).contains(&scores.accuracy));
        assert!(outcome.predictions.is_none());

        let manager = CheckpointManager::new(out, 0).unwrap();
        assert_eq!(manager.latest().unwrap(), out.join("ckpt_0"));
        assert!(out.join(LOSS_HISTORY_FILE).is_file());
        assert!(out.join("metrics.csv").is_file());

        let pred_file = out.join("predictions.txt");
        let predict = TaskConfig { predict_output_file: Some(pred_file.clone()), ..predict_config(&train) };
        let preds = launch(predict).unwrap().predictions.unwrap();
        assert_eq!(preds.len(), ROWS.len());
        assert!(preds.iter().all(|p| p == "Reason" || p == "Other"));
        assert_eq!(fs::read_to_string(pred_file).unwrap().lines().count(), ROWS.len());
    }

    #[test]
    fn test_best_checkpoints_are_rotated() {
        let ws    = workspace();
        let train = TaskConfig { num_train_epochs: 3, max_num_checkpoints: 1, ..train_config(&ws) };
        launch(train).unwrap();

        let csv = fs::read_to_string(ws.out.path().join("metrics.csv")).unwrap();
        let f1: Vec<f64> = csv
            .lines()
            .skip(1)
            .map(|row| row.rsplit(',').next().unwrap().parse().unwrap())
            .collect();
        assert_eq!(f1.len(), 3);

        // A checkpoint is written each time f1 strictly beats the best so far
        // (starting at 0); only the newest survives rotation.
        let best = f1.iter().cloned().fold(0.0, f64::max);
        let kept = CheckpointManager::new(ws.out.path(), 1).unwrap().list().unwrap();
        if best > 0.0 {
            let best_epoch = f1.iter().position(|&v| v == best).unwrap() + 1;
            assert_eq!(kept.len(), 1);
            assert_eq!(kept[0].0, best_epoch);
        } else {
            assert!(kept.is_empty());
        }
        assert!(!ws.out.path().join("ckpt_0").exists());
    }

    #[test]
    fn test_sequence_longer_than_positions_is_rejected() {
        let ws    = workspace();
        let train = train_config(&ws);
        launch(train.clone()).unwrap();

        // The scaffolded base has 64 positions.
        let predict = TaskConfig { max_seq_length: 512, ..predict_config(&train) };
        let err = launch(predict).unwrap_err();
        assert!(matches!(err.downcast_ref::<TaskError>(), Some(TaskError::InvalidConfig(_))));

        let too_long = TaskConfig { max_seq_length: 65, ..train_config(&ws) };
        assert!(launch(too_long).is_err());
    }

    #[test]
    fn test_reset_dataloader_switches_test_data() {
        let ws    = workspace();
        let train = train_config(&ws);
        launch(train.clone()).unwrap();

        let mut runner = CpuRunner::new(predict_config(&train), Default::default(), Precision::Full).unwrap();
        runner.init().unwrap();
        assert_eq!(runner.predict().unwrap().len(), ROWS.len());

        let other = tempdir().unwrap();
        write_split(other.path(), "test.tsv", &ROWS[..2]);
        runner.reset_dataloader(other.path(), Some(true), None).unwrap();
        assert_eq!(runner.predict().unwrap().len(), 2);

        assert!(runner.reset_dataloader(other.path(), None, Some(100)).is_err());
    }
}
