// ============================================================
// Layer 1 — CLI Commands and Arguments
// ============================================================
// Subcommands:
//   train         — fine-tune LoRA adapters (optionally eval/predict)
//   eval          — score a checkpoint on dev.tsv
//   predict       — label test.tsv with a checkpoint
//   run           — everything from a task.toml
//   scaffold-base — write a tiny random base model for smoke tests
//
// Flags map 1:1 onto TaskConfig fields; anything not exposed here
// can be set through `run --config`.

use clap::{Args, Subcommand};
use std::path::PathBuf;

use crate::application::task_config::TaskConfig;
use crate::domain::model_type::ModelType;
use crate::ml::backend::DeviceKind;
use crate::ml::schedule::ScheduleKind;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Fine-tune a LLaMA model with LoRA for relation classification
    Train(TrainArgs),

    /// Evaluate a trained checkpoint on the dev split
    Eval(EvalArgs),

    /// Predict labels for the test split
    Predict(PredictArgs),

    /// Run the modes enabled in a TOML task file
    Run(RunArgs),

    /// Write a randomly initialised base model and tokenizer
    ScaffoldBase(ScaffoldArgs),
}

/// Paths and data options shared by every mode.
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// llama1, llama2, llama1_pre or llama2_pre
    #[arg(long, default_value = "llama2")]
    pub model_type: ModelType,

    /// Directory with config.json, model.mpk.gz and tokenizer.json
    #[arg(long)]
    pub pretrained_model: PathBuf,

    /// Pretrained adapter directory for the *_pre model types
    #[arg(long)]
    pub peft_model_path: Option<PathBuf>,

    /// Directory with train.tsv / dev.tsv / test.tsv
    #[arg(long)]
    pub data_dir: PathBuf,

    /// Output directory for checkpoints, logs and the task config
    #[arg(long)]
    pub new_model_dir: PathBuf,

    /// 0 = text_a and text_b encoded as a pair, 1 = concatenated
    #[arg(long, default_value_t = 0)]
    pub data_format_mode: u8,

    /// Skip the first line of every data file
    #[arg(long)]
    pub data_file_header: bool,

    /// Cache parsed examples next to the data files
    #[arg(long)]
    pub cache_data: bool,

    #[arg(long, default_value_t = 512)]
    pub max_seq_length: usize,

    #[arg(long, default_value_t = 8)]
    pub eval_batch_size: usize,

    /// Label excluded from micro precision / recall / F1
    #[arg(long, default_value = "")]
    pub non_relation_label: String,

    #[arg(long, value_enum, default_value_t = DeviceKind::Wgpu)]
    pub device: DeviceKind,

    #[arg(long, default_value_t = 1)]
    pub num_workers: usize,
}

impl CommonArgs {
    fn into_config(self) -> TaskConfig {
        TaskConfig {
            model_type:         self.model_type,
            pretrained_model:   self.pretrained_model,
            peft_model_path:    self.peft_model_path,
            data_dir:           self.data_dir,
            new_model_dir:      self.new_model_dir,
            data_format_mode:   self.data_format_mode,
            data_file_header:   self.data_file_header,
            cache_data:         self.cache_data,
            max_seq_length:     self.max_seq_length,
            eval_batch_size:    self.eval_batch_size,
            non_relation_label: self.non_relation_label,
            device:             self.device,
            num_workers:        self.num_workers,
            ..TaskConfig::default()
        }
    }
}

#[derive(Args, Debug)]
pub struct TrainArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Evaluate on dev after every epoch and keep the best checkpoints
    #[arg(long)]
    pub do_eval: bool,

    /// Predict the test split after training
    #[arg(long)]
    pub do_predict: bool,

    #[arg(long)]
    pub predict_output_file: Option<PathBuf>,

    #[arg(long, default_value_t = 8)]
    pub train_batch_size: usize,

    #[arg(long, default_value_t = 1e-5)]
    pub learning_rate: f64,

    #[arg(long, default_value_t = 0.0)]
    pub weight_decay: f64,

    #[arg(long, default_value_t = 1e-8)]
    pub adam_epsilon: f64,

    #[arg(long, default_value_t = 10)]
    pub num_train_epochs: usize,

    #[arg(long, default_value_t = 1)]
    pub gradient_accumulation_steps: usize,

    #[arg(long, default_value_t = 1.0)]
    pub max_grad_norm: f64,

    /// Use a warmup learning-rate schedule
    #[arg(long)]
    pub do_warmup: bool,

    #[arg(long, default_value_t = 0.1)]
    pub warmup_ratio: f64,

    /// linear or cosine
    #[arg(long, default_value = "linear")]
    pub scheduler: ScheduleKind,

    #[arg(long, default_value_t = 13)]
    pub seed: u64,

    /// Train in half precision when the device supports it
    #[arg(long)]
    pub fp16: bool,

    /// Checkpoints to keep; 0 saves a single ckpt_0 after training
    #[arg(long, default_value_t = 1)]
    pub max_num_checkpoints: usize,

    #[arg(long, default_value_t = 1000)]
    pub log_step: usize,

    #[arg(long, default_value_t = 100)]
    pub loss_record_step: usize,

    /// 0 = last token, 1 = [s1] [s2] + last, 2 = all tags + last
    #[arg(long, default_value_t = 0)]
    pub classification_scheme: u8,

    #[arg(long)]
    pub use_focal_loss: bool,

    #[arg(long, default_value_t = 2.0)]
    pub focal_loss_gamma: f64,

    /// Weight classes by inverse training frequency
    #[arg(long)]
    pub balance_sample_weights: bool,

    #[arg(long, default_value_t = 8)]
    pub lora_rank: usize,

    #[arg(long, default_value_t = 32.0)]
    pub lora_alpha: f64,

    #[arg(long, default_value_t = 0.05)]
    pub lora_dropout: f64,

    /// Comma-separated projection names, e.g. q_proj,v_proj,k_proj
    #[arg(long, value_delimiter = ',', default_value = "q_proj,v_proj,k_proj")]
    pub lora_target_modules: Vec<String>,

    /// Comma-separated modules trained in full, e.g. embed_tokens,lm_head
    #[arg(long, value_delimiter = ',', default_value = "embed_tokens,lm_head")]
    pub modules_to_save: Vec<String>,
}

impl From<TrainArgs> for TaskConfig {
    fn from(a: TrainArgs) -> Self {
        TaskConfig {
            do_train:                    true,
            do_eval:                     a.do_eval,
            do_predict:                  a.do_predict,
            predict_output_file:         a.predict_output_file,
            train_batch_size:            a.train_batch_size,
            learning_rate:               a.learning_rate,
            weight_decay:                a.weight_decay,
            adam_epsilon:                a.adam_epsilon,
            num_train_epochs:            a.num_train_epochs,
            gradient_accumulation_steps: a.gradient_accumulation_steps,
            max_grad_norm:               a.max_grad_norm,
            do_warmup:                   a.do_warmup,
            warmup_ratio:                a.warmup_ratio,
            scheduler:                   a.scheduler,
            seed:                        a.seed,
            fp16:                        a.fp16,
            max_num_checkpoints:         a.max_num_checkpoints,
            log_step:                    a.log_step,
            loss_record_step:            a.loss_record_step,
            classification_scheme:       a.classification_scheme,
            use_focal_loss:              a.use_focal_loss,
            focal_loss_gamma:            a.focal_loss_gamma,
            balance_sample_weights:      a.balance_sample_weights,
            lora_rank:                   a.lora_rank,
            lora_alpha:                  a.lora_alpha,
            lora_dropout:                a.lora_dropout,
            lora_target_modules:         a.lora_target_modules,
            modules_to_save:             a.modules_to_save,
            ..a.common.into_config()
        }
    }
}

#[derive(Args, Debug)]
pub struct EvalArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Checkpoint directory; defaults to the newest ckpt_* in new_model_dir
    #[arg(long)]
    pub ckpt_dir: Option<PathBuf>,
}

impl From<EvalArgs> for TaskConfig {
    fn from(a: EvalArgs) -> Self {
        TaskConfig {
            do_eval:  true,
            ckpt_dir: a.ckpt_dir,
            ..a.common.into_config()
        }
    }
}

#[derive(Args, Debug)]
pub struct PredictArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[arg(long)]
    pub ckpt_dir: Option<PathBuf>,

    /// Where to write one predicted label per line
    #[arg(long)]
    pub predict_output_file: PathBuf,
}

impl From<PredictArgs> for TaskConfig {
    fn from(a: PredictArgs) -> Self {
        TaskConfig {
            do_predict:          true,
            ckpt_dir:            a.ckpt_dir,
            predict_output_file: Some(a.predict_output_file),
            ..a.common.into_config()
        }
    }
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// TOML file with TaskConfig fields
    #[arg(long)]
    pub config: PathBuf,
}

#[derive(Args, Debug)]
pub struct ScaffoldArgs {
    /// Where to write config.json, model.mpk.gz and tokenizer.json
    #[arg(long)]
    pub output_dir: PathBuf,

    /// The vocabulary is built from the TSV files in this directory
    #[arg(long)]
    pub data_dir: PathBuf,

    /// Upper bound on the word-level vocabulary
    #[arg(long, default_value_t = 8000)]
    pub vocab_size: usize,

    #[arg(long, default_value_t = 64)]
    pub hidden_size: usize,

    #[arg(long, default_value_t = 4)]
    pub num_heads: usize,

    #[arg(long, default_value_t = 2)]
    pub num_layers: usize,

    #[arg(long, default_value_t = 128)]
    pub intermediate_size: usize,

    #[arg(long, default_value_t = 512)]
    pub max_position_embeddings: usize,

    /// Also write a fresh LoRA adapter here, usable as peft_model_path
    #[arg(long)]
    pub with_adapter: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Cli;
    use clap::Parser;

    fn parse(args: &[&str]) -> Commands {
        Cli::try_parse_from(args).unwrap().command
    }

    #[test]
    fn test_train_flags_map_to_config() {
        let cmd = parse(&[
            "relex-lora", "train",
            "--pretrained-model", "base", "--data-dir", "data", "--new-model-dir", "out",
            "--model-type", "llama1", "--do-eval", "--fp16",
            "--lora-target-modules", "q_proj,o_proj", "--scheduler", "cosine",
        ]);
        let Commands::Train(args) = cmd else { panic!("expected train") };
        let cfg = TaskConfig::from(args);
        assert!(cfg.do_train && cfg.do_eval && !cfg.do_predict);
        assert!(cfg.fp16);
        assert_eq!(cfg.model_type, ModelType::Llama1);
        assert_eq!(cfg.lora_target_modules, vec!["q_proj", "o_proj"]);
        assert_eq!(cfg.scheduler, ScheduleKind::Cosine);
        assert_eq!(cfg.new_model_dir, PathBuf::from("out"));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_predict_requires_output_file() {
        let res = Cli::try_parse_from([
            "relex-lora", "predict",
            "--pretrained-model", "base", "--data-dir", "data", "--new-model-dir", "out",
        ]);
        assert!(res.is_err());
    }

    #[test]
    fn test_unknown_model_type_is_rejected() {
        let res = Cli::try_parse_from([
            "relex-lora", "eval",
            "--pretrained-model", "base", "--data-dir", "data", "--new-model-dir", "out",
            "--model-type", "gpt2",
        ]);
        assert!(res.is_err());
    }
}
