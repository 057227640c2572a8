// ============================================================
// Layer 2 — Task configuration
// ============================================================
// Every run parameter in one serde struct. It is built from CLI
// flags or read from a TOML file (missing keys take the defaults
// below), validated once, and written to
// <new_model_dir>/task_config.json at init so a run can be
// reproduced.
//
// Example task.toml:
//
//   model_type        = "llama2"
//   pretrained_model  = "models/llama2-base"
//   data_dir          = "data/n2c2"
//   new_model_dir     = "runs/n2c2-lora"
//   do_train          = true
//   do_eval           = true
//   num_train_epochs  = 3
//   fp16              = true

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::{Path, PathBuf}};

use crate::domain::error::TaskError;
use crate::domain::model_type::ModelType;
use crate::domain::task::DataFormat;
use crate::ml::backend::DeviceKind;
use crate::ml::lora::LoraSettings;
use crate::ml::precision::Precision;
use crate::ml::schedule::ScheduleKind;
use crate::ml::trainer::TrainSettings;

pub const TASK_CONFIG_FILE: &str = "task_config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    // ── Model & paths ─────────────────────────────────────────────────────────
    pub model_type:          ModelType,
    pub pretrained_model:    PathBuf,
    /// Pretrained adapter directory, required by the *_pre model types.
    pub peft_model_path:     Option<PathBuf>,
    pub data_dir:            PathBuf,
    pub new_model_dir:       PathBuf,
    /// Checkpoint to evaluate / predict with; latest ckpt_* when absent.
    pub ckpt_dir:            Option<PathBuf>,
    pub predict_output_file: Option<PathBuf>,

    // ── Data ──────────────────────────────────────────────────────────────────
    pub data_format_mode: u8,
    pub data_file_header: bool,
    pub cache_data:       bool,
    pub max_seq_length:   usize,
    pub num_workers:      usize,

    // ── Modes ─────────────────────────────────────────────────────────────────
    pub do_train:   bool,
    pub do_eval:    bool,
    pub do_predict: bool,

    // ── Optimisation ──────────────────────────────────────────────────────────
    pub train_batch_size:            usize,
    pub eval_batch_size:             usize,
    pub learning_rate:               f64,
    pub weight_decay:                f64,
    pub adam_epsilon:                f64,
    pub num_train_epochs:            usize,
    pub gradient_accumulation_steps: usize,
    pub max_grad_norm:               f64,
    pub do_warmup:                   bool,
    pub warmup_ratio:                f64,
    pub scheduler:                   ScheduleKind,
    pub seed:                        u64,

    // ── Hardware ──────────────────────────────────────────────────────────────
    pub fp16:   bool,
    pub device: DeviceKind,

    // ── Checkpoints & logging ─────────────────────────────────────────────────
    /// > 0: save on dev-f1 improvement and keep this many; 0: save ckpt_0 at the end.
    pub max_num_checkpoints: usize,
    pub log_step:            usize,
    pub loss_record_step:    usize,

    // ── Task head & loss ──────────────────────────────────────────────────────
    pub non_relation_label:     String,
    pub classification_scheme:  u8,
    pub use_focal_loss:         bool,
    pub focal_loss_gamma:       f64,
    pub balance_sample_weights: bool,

    // ── LoRA ──────────────────────────────────────────────────────────────────
    pub lora_rank:           usize,
    pub lora_alpha:          f64,
    pub lora_dropout:        f64,
    pub lora_target_modules: Vec<String>,
    pub modules_to_save:     Vec<String>,
}

impl Default for TaskConfig {
    fn default() -> Self {
        let lora = LoraSettings::default();
        Self {
            model_type:          ModelType::Llama2,
            pretrained_model:    PathBuf::from("pretrained"),
            peft_model_path:     None,
            data_dir:            PathBuf::from("data"),
            new_model_dir:       PathBuf::from("output"),
            ckpt_dir:            None,
            predict_output_file: None,

            data_format_mode: 0,
            data_file_header: false,
            cache_data:       false,
            max_seq_length:   512,
            num_workers:      1,

            do_train:   false,
            do_eval:    false,
            do_predict: false,

            train_batch_size:            8,
            eval_batch_size:             8,
            learning_rate:               1e-5,
            weight_decay:                0.0,
            adam_epsilon:                1e-8,
            num_train_epochs:            10,
            gradient_accumulation_steps: 1,
            max_grad_norm:               1.0,
            do_warmup:                   false,
            warmup_ratio:                0.1,
            scheduler:                   ScheduleKind::Linear,
            seed:                        13,

            fp16:   false,
            device: DeviceKind::Wgpu,

            max_num_checkpoints: 1,
            log_step:            1000,
            loss_record_step:    100,

            non_relation_label:     String::new(),
            classification_scheme:  0,
            use_focal_loss:         false,
            focal_loss_gamma:       2.0,
            balance_sample_weights: false,

            lora_rank:           lora.rank,
            lora_alpha:          lora.alpha,
            lora_dropout:        lora.dropout,
            lora_target_modules: lora.target_modules,
            modules_to_save:     lora.modules_to_save,
        }
    }
}

impl TaskConfig {
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Cannot read task config '{}'", path.display()))?;
        let config: Self = toml::from_str(&text)
            .with_context(|| format!("Malformed task config '{}'", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TaskError> {
        let invalid = |msg: String| Err(TaskError::InvalidConfig(msg));

        self.data_format()?;
        if !(self.do_train || self.do_eval || self.do_predict) {
            return invalid("at least one of do_train, do_eval, do_predict must be set".into());
        }
        if self.max_seq_length == 0 {
            return invalid("max_seq_length must be > 0".into());
        }
        if self.train_batch_size == 0 || self.eval_batch_size == 0 {
            return invalid("batch sizes must be > 0".into());
        }
        if self.gradient_accumulation_steps == 0 {
            return invalid("gradient_accumulation_steps must be > 0".into());
        }
        if self.learning_rate <= 0.0 {
            return invalid(format!("learning_rate must be > 0, got {}", self.learning_rate));
        }
        if !(0.0..=1.0).contains(&self.warmup_ratio) {
            return invalid(format!("warmup_ratio must be in [0, 1], got {}", self.warmup_ratio));
        }
        if self.classification_scheme > 2 {
            return invalid(format!("classification_scheme must be 0, 1 or 2, got {}", self.classification_scheme));
        }
        // Eval / predict rebuild the adapters from the checkpoint's model card.
        if self.do_train && self.model_type.uses_pretrained_adapter() && self.peft_model_path.is_none() {
            return invalid(format!("model type {} needs peft_model_path", self.model_type));
        }
        if !self.model_type.uses_pretrained_adapter() {
            self.lora_settings().validate().map_err(TaskError::InvalidConfig)?;
        }
        Ok(())
    }

    pub fn data_format(&self) -> Result<DataFormat, TaskError> {
        DataFormat::try_from(self.data_format_mode)
    }

    pub fn lora_settings(&self) -> LoraSettings {
        LoraSettings {
            rank:            self.lora_rank,
            alpha:           self.lora_alpha,
            dropout:         self.lora_dropout,
            target_modules:  self.lora_target_modules.clone(),
            modules_to_save: self.modules_to_save.clone(),
        }
    }

    pub fn train_settings(&self) -> TrainSettings {
        TrainSettings {
            epochs:           self.num_train_epochs,
            grad_accum:       self.gradient_accumulation_steps,
            learning_rate:    self.learning_rate,
            weight_decay:     self.weight_decay,
            adam_epsilon:     self.adam_epsilon,
            max_grad_norm:    self.max_grad_norm,
            do_warmup:        self.do_warmup,
            warmup_ratio:     self.warmup_ratio,
            schedule:         self.scheduler,
            log_step:         self.log_step,
            loss_record_step: self.loss_record_step,
            precision:        Precision::Full,
        }
    }

    /// Training keeps only dev-f1 improvements when `max_num_checkpoints > 0`,
    /// so without `do_eval` nothing would reach disk.
    pub fn saves_no_checkpoint(&self) -> bool {
        self.do_train && !self.do_eval && self.max_num_checkpoints > 0
    }

    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(TASK_CONFIG_FILE);
        fs::write(&path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Cannot write '{}'", path.display()))?;
        tracing::debug!("Saved task config to '{}'", path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn trainable() -> TaskConfig {
        TaskConfig { do_train: true, ..TaskConfig::default() }
    }

    #[test]
    fn test_toml_fills_defaults() {
        let dir  = tempdir().unwrap();
        let path = dir.path().join("task.toml");
        fs::write(&path, r#"
            model_type = "llama1"
            data_dir = "corpus"
            do_train = true
            lora_target_modules = ["q_proj", "o_proj"]
            scheduler = "cosine"
            device = "cpu"
        "#).unwrap();

        let cfg = TaskConfig::from_toml_file(&path).unwrap();
        assert_eq!(cfg.model_type, ModelType::Llama1);
        assert_eq!(cfg.data_dir, PathBuf::from("corpus"));
        assert_eq!(cfg.scheduler, ScheduleKind::Cosine);
        assert_eq!(cfg.device, DeviceKind::Cpu);
        assert_eq!(cfg.lora_settings().target_modules, vec!["q_proj", "o_proj"]);
        assert_eq!(cfg.max_seq_length, 512);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_unknown_model_type_in_toml_is_rejected() {
        let dir  = tempdir().unwrap();
        let path = dir.path().join("task.toml");
        fs::write(&path, "model_type = \"gpt2\"\n").unwrap();
        assert!(TaskConfig::from_toml_file(&path).is_err());
    }

    #[test]
    fn test_validation_errors() {
        assert!(TaskConfig::default().validate().is_err());
        assert!(trainable().validate().is_ok());

        let bad_format = TaskConfig { data_format_mode: 2, ..trainable() };
        assert!(matches!(bad_format.validate(), Err(TaskError::UnsupportedDataFormat(2))));

        let no_adapter = TaskConfig { model_type: ModelType::Llama2Pre, ..trainable() };
        assert!(matches!(no_adapter.validate(), Err(TaskError::InvalidConfig(_))));

        let bad_target = TaskConfig { lora_target_modules: vec!["wq".into()], ..trainable() };
        assert!(bad_target.validate().is_err());

        let zero_accum = TaskConfig { gradient_accumulation_steps: 0, ..trainable() };
        assert!(zero_accum.validate().is_err());
    }

    #[test]
    fn test_pretrained_adapter_only_needed_for_training() {
        let predict = TaskConfig { model_type: ModelType::Llama1Pre, do_predict: true, ..TaskConfig::default() };
        assert!(predict.validate().is_ok());

        let eval = TaskConfig { model_type: ModelType::Llama2Pre, do_eval: true, ..TaskConfig::default() };
        assert!(eval.validate().is_ok());

        let train = TaskConfig { do_train: true, ..predict };
        assert!(matches!(train.validate(), Err(TaskError::InvalidConfig(_))));
    }

    #[test]
    fn test_training_without_eval_saves_nothing_when_keeping_best() {
        let cfg = TaskConfig { max_num_checkpoints: 2, ..trainable() };
        assert!(cfg.saves_no_checkpoint());
        assert!(!TaskConfig { do_eval: true, ..cfg.clone() }.saves_no_checkpoint());
        assert!(!TaskConfig { max_num_checkpoints: 0, ..cfg }.saves_no_checkpoint());
    }

    #[test]
    fn test_save_writes_json() {
        let dir  = tempdir().unwrap();
        let cfg  = trainable();
        let path = cfg.save(dir.path()).unwrap();
        let back: TaskConfig = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(back, cfg);
    }
}
