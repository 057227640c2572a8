// ============================================================
// Layer 2 — TaskRunner
// ============================================================
// Controller for one fine-tuning / evaluation / prediction run.
//
//   new()    — validate config, create the output directory
//   init()   — data processor → model (new or from checkpoint)
//              → data loaders for the enabled modes
//   train()  — training loop; per-epoch dev evaluation and
//              best-f1 checkpointing; loss history at the end
//   eval()   — accuracy and micro P/R/F1 on the dev split
//   predict()— label strings for the test split
//
// Model initialisation, new model:
//   tokenizer (pretrained) + entity tags → label index from train
//   → base decoder → classifier head → resize embeddings
//   → fresh LoRA adapters, or the stored ones for *_pre types
//
// Model initialisation, trained model:
//   ckpt dir (given or latest) → label index, model card, tokenizer
//   → base decoder → resize → adapters → trainable state
//
// Generic over the autodiff backend; evaluation runs on
// B::InnerBackend through model.valid().

use anyhow::{anyhow, Context, Result};
use burn::{
    data::dataloader::{DataLoader, DataLoaderBuilder},
    module::AutodiffModule,
    prelude::*,
    tensor::backend::AutodiffBackend,
};
use std::{fs, path::{Path, PathBuf}, sync::Arc};
use tokenizers::Tokenizer;

use crate::application::task_config::TaskConfig;
use crate::data::{
    batcher::{RelationBatch, RelationBatcher},
    cache::{CacheKey, ExampleCache},
    dataset::RelationDataset,
    features::{convert_examples_to_features, RelationFeature, UnknownLabel},
    processor::RelationDataProcessor,
};
use crate::domain::{
    error::TaskError,
    label_index::LabelIndex,
    task::Split,
    traits::ExampleSource,
};
use crate::infra::{
    checkpoint::{CheckpointManager, ModelCard},
    metrics::{acc_and_f1, EpochMetrics, EvalResult, MetricsLogger},
    pretrained::{AdapterStore, PretrainedStore},
    tokenizer_store::TokenizerStore,
};
use crate::ml::{
    evaluator::run_eval,
    model::{inverse_frequency_weights, parameter_summary, ClassificationLoss, ClassifierConfig, RelationClassifier},
    precision::{GradScaler, Precision},
    trainer::fit,
};

type Loader<B> = Arc<dyn DataLoader<RelationBatch<B>>>;

/// Drives one run. `processor` and everything below it are filled in by
/// `init()`; the loaders only exist for the enabled modes.
pub struct TaskRunner<B: AutodiffBackend> {
    config:      TaskConfig,
    device:      B::Device,
    /// Resolved compute precision (fp16 may have fallen back)
    precision:   Precision,
    /// Owns `new_model_dir`: ckpt_<n> dirs, label2idx.json
    checkpoints: CheckpointManager,
    processor:   Option<RelationDataProcessor>,

    /// Pretrained (or checkpoint) tokenizer plus the entity tags
    tokenizer: Option<Tokenizer>,
    pad_id:    u32,
    labels:    Option<LabelIndex>,
    /// Architecture, head and LoRA settings; saved with every checkpoint
    card:      Option<ModelCard>,
    /// Taken out while `train()` runs
    model:     Option<RelationClassifier<B>>,

    train_loader:  Option<Loader<B>>,
    /// Batches per epoch, for the warmup schedule
    train_batches: usize,
    dev_loader:    Option<Loader<B::InnerBackend>>,
    /// Gold dev labels in loader order
    dev_labels:    Vec<usize>,
    test_loader:   Option<Loader<B::InnerBackend>>,
}

impl<B: AutodiffBackend> TaskRunner<B> {
    pub fn new(config: TaskConfig, device: B::Device, precision: Precision) -> Result<Self> {
        config.validate()?;
        let checkpoints = CheckpointManager::new(&config.new_model_dir, config.max_num_checkpoints)?;
        if config.do_train && config.fp16 && precision == Precision::Full {
            tracing::warn!("fp16 requested but no mixed precision mode is active; training in fp32");
        }
        if config.saves_no_checkpoint() {
            tracing::warn!(
                "Best checkpoints are chosen on dev f1 but do_eval is off; no checkpoint will be saved \
                 (set do_eval, or max_num_checkpoints = 0 to save the final model)"
            );
        }
        B::seed(config.seed);
        Ok(Self {
            config,
            device,
            precision,
            checkpoints,
            processor:     None,
            tokenizer:     None,
            pad_id:        0,
            labels:        None,
            card:          None,
            model:         None,
            train_loader:  None,
            train_batches: 0,
            dev_loader:    None,
            dev_labels:    Vec::new(),
            test_loader:   None,
        })
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    pub fn init(&mut self) -> Result<()> {
        // ── Data processor ────────────────────────────────────────────────────
        let mut processor = RelationDataProcessor::for_mode(self.config.data_format_mode, self.config.max_seq_length)?;
        processor.set_data_dir(&self.config.data_dir);
        processor.set_header(self.config.data_file_header);
        self.processor = Some(processor);

        // ── Model ─────────────────────────────────────────────────────────────
        if self.config.do_train {
            tracing::info!("Training precision: {}", self.precision);
            self.init_new_model()?;
            self.config.save(self.checkpoints.root())?;
        } else {
            self.init_trained_model()?;
        }

        // ── Data ──────────────────────────────────────────────────────────────
        if let Some(p) = &self.processor {
            tracing::info!("Data loader info: {p}");
        }
        self.init_dataloaders()?;

        let card = self.card()?;
        tracing::info!("Model config:\n{}", serde_json::to_string_pretty(card)?);
        tracing::info!("All parameters:\n{}", serde_json::to_string_pretty(&self.config)?);
        Ok(())
    }

    // ─── Training ─────────────────────────────────────────────

    pub fn train(&mut self) -> Result<()> {
        tracing::info!("Start training...");
        let model  = self.model.take().ok_or_else(|| anyhow!("init() must run before train()"))?;
        let loader = self.train_loader.clone().ok_or_else(|| anyhow!("No training data loader; is do_train set?"))?;

        let card      = self.card()?.clone();
        let labels    = self.labels()?.clone();
        let tokenizer = self.tokenizer()?.clone();
        let mut settings = self.config.train_settings();
        settings.precision = self.precision;
        let loss_fn   = ClassificationLoss::<B>::new(&card.classifier, &self.device);
        let eval_loss = ClassificationLoss::<B::InnerBackend>::new(&card.classifier, &self.device);
        let metrics   = MetricsLogger::new(self.checkpoints.root())?;

        let do_eval         = self.config.do_eval;
        let max_checkpoints = self.config.max_num_checkpoints;
        let non_rel         = self.config.non_relation_label.clone();
        let dev_loader      = self.dev_loader.clone();
        let dev_labels      = &self.dev_labels;
        let checkpoints     = &self.checkpoints;
        let mut best_f1     = 0.0f64;

        let output = fit(
            model,
            &settings,
            loader.as_ref(),
            self.train_batches,
            &loss_fn,
            GradScaler::for_precision(self.precision),
            |epoch, model, train_loss| {
                if !do_eval {
                    return Ok(());
                }
                let Some(dev) = &dev_loader else {
                    tracing::warn!("do_eval is set but no dev loader exists");
                    return Ok(());
                };
                let eval   = run_eval(&model.valid(), dev.as_ref(), &eval_loss)?;
                let scores = acc_and_f1(dev_labels, &eval.predictions, &labels, &non_rel)?;
                tracing::info!(
                    "\n******************************\nEpoch: {}\nevaluation on dev set\n{}\n******************************",
                    epoch, scores
                );

                let row = EpochMetrics::new(epoch, train_loss, eval.mean_loss, scores);
                metrics.log(&row)?;
                if max_checkpoints > 0 && row.is_improvement(best_f1) {
                    checkpoints.save(epoch, model, &card, &tokenizer, &labels)?;
                    best_f1 = scores.f1;
                }
                Ok(())
            },
        )?;

        tracing::info!(
            "Training done: {} batches, {} optimizer steps ({} skipped)",
            output.global_steps, output.optimizer_steps, output.skipped_steps
        );
        self.model = Some(output.model);

        if self.config.max_num_checkpoints == 0 {
            self.save_model(0)?;
            tracing::info!("Training finished and the trained model is saved.");
        }
        output.loss_history.save(self.checkpoints.root())?;
        Ok(())
    }

    // ─── Evaluation / prediction ──────────────────────────────

    pub fn eval(&self, non_rel_label: &str) -> Result<EvalResult> {
        tracing::info!("Start evaluation...");
        let loader = self.dev_loader.as_ref().ok_or_else(|| anyhow!("No dev data loader; is do_eval set?"))?;
        let model  = self.model.as_ref().ok_or_else(|| anyhow!("init() must run before eval()"))?.valid();
        let loss   = ClassificationLoss::<B::InnerBackend>::new(&self.card()?.classifier, &self.device);

        let out    = run_eval(&model, loader.as_ref(), &loss)?;
        let scores = acc_and_f1(&self.dev_labels, &out.predictions, self.labels()?, non_rel_label)?;
        tracing::info!("Dev loss {:.4}; {}", out.mean_loss, scores);
        Ok(scores)
    }

    pub fn predict(&self) -> Result<Vec<String>> {
        tracing::info!("Start prediction...");
        let loader = self.test_loader.as_ref().ok_or_else(|| anyhow!("No test data loader; is do_predict set?"))?;
        let model  = self
            .model
            .as_ref()
            .ok_or_else(|| anyhow!("init() must run before predict()"))?
            .valid()
            .merge_adapters();
        let loss   = ClassificationLoss::<B::InnerBackend>::new(&self.card()?.classifier, &self.device);

        let out    = run_eval(&model, loader.as_ref(), &loss)?;
        let labels = self.labels()?;
        tracing::info!("Label to index for prediction:\n{:?}", labels.label2idx);
        Ok(labels.decode(&out.predictions)?)
    }

    /// Write one predicted label per line.
    pub fn save_predictions(predictions: &[String], path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut text = predictions.join("\n");
        text.push('\n');
        fs::write(path, text).with_context(|| format!("Cannot write predictions to '{}'", path.display()))?;
        tracing::info!("Wrote {} predictions to '{}'", predictions.len(), path.display());
        Ok(())
    }

    /// Point the processor at a new data directory and rebuild the
    /// test loader (train / dev loaders are kept when present).
    pub fn reset_dataloader(&mut self, data_dir: &Path, has_header: Option<bool>, max_len: Option<usize>) -> Result<()> {
        let processor = self.processor.as_mut().ok_or_else(|| anyhow!("init() must run before reset_dataloader()"))?;
        processor.set_data_dir(data_dir);
        if let Some(h) = has_header {
            processor.set_header(h);
        }
        if let Some(len) = max_len.filter(|&l| l > 0) {
            processor.set_max_seq_len(len);
        }
        tracing::warn!("Reset data loader information");
        tracing::warn!("New data loader info: {processor}");
        self.config.data_dir = data_dir.to_path_buf();
        self.test_loader = None;
        self.init_dataloaders()
    }

    pub fn save_model(&self, n: usize) -> Result<PathBuf> {
        let model = self.model.as_ref().ok_or_else(|| anyhow!("No model to save"))?;
        self.checkpoints.save(n, model, self.card()?, self.tokenizer()?, self.labels()?)
    }

    // ─── Initialisation helpers ───────────────────────────────

    fn init_new_model(&mut self) -> Result<()> {
        let cfg = &self.config;
        tracing::info!("Init new model (LLaMA {} base, {})...", cfg.model_type.generation(), cfg.model_type);
        let store = PretrainedStore::new(&cfg.pretrained_model);

        // ── Tokenizer + entity tags ───────────────────────────────────────────
        let mut tokenizer = store.tokenizer_store().load()?;
        let pad_id = TokenizerStore::resolve_pad_id(&tokenizer);
        let tags   = TokenizerStore::add_entity_tags(&mut tokenizer)?;
        let rows   = TokenizerStore::embedding_rows(&tokenizer);

        // ── Labels ────────────────────────────────────────────────────────────
        let processor = self.processor.as_ref().ok_or_else(|| anyhow!("data processor not set"))?;
        let labels = processor.labels()?;
        tracing::info!("Label to index:\n{:?}", labels.label2idx);
        self.checkpoints.save_label2idx(&labels)?;

        let class_weights = if cfg.balance_sample_weights {
            let dist = processor.sample_distribution()?;
            let mut counts = vec![0usize; labels.num_labels()];
            for (label, count) in &dist {
                if let Some(idx) = labels.index_of(label) {
                    counts[idx] = *count;
                }
            }
            let weights = inverse_frequency_weights(&counts);
            tracing::info!("Using sample weights from {:?}: {:?}", dist, weights);
            Some(weights)
        } else {
            None
        };

        // ── Backbone + head ───────────────────────────────────────────────────
        let (decoder_cfg, decoder) = store.load_decoder::<B>(&self.device)?;
        let mut classifier = ClassifierConfig::new(decoder_cfg, labels.num_labels())
            .with_tags(tags)
            .with_scheme(cfg.classification_scheme)
            .with_use_focal_loss(cfg.use_focal_loss)
            .with_focal_loss_gamma(cfg.focal_loss_gamma)
            .with_class_weights(class_weights);

        let model = classifier
            .init_with(decoder, &self.device)
            .resize_token_embeddings(rows, &self.device);
        classifier.decoder.vocab_size = rows;
        tracing::info!("Model resized to {} token embeddings", rows);

        // ── Adapters ──────────────────────────────────────────────────────────
        let (lora, model) = if cfg.model_type.uses_pretrained_adapter() {
            let dir = cfg.peft_model_path.as_ref().ok_or_else(|| anyhow!("peft_model_path not set"))?;
            tracing::info!("Initialising from pretrained adapter '{}'", dir.display());
            AdapterStore::new(dir).apply(model, &self.device)?
        } else {
            let lora = cfg.lora_settings();
            tracing::info!("Initialising new LoRA adapters: {:?}", lora);
            let model = model.inject_adapters(&lora, &self.device);
            (lora, model)
        };

        let summary = parameter_summary(&model);
        tracing::info!(
            "trainable params: {} || all params: {} || trainable%: {:.4}",
            summary.trainable, summary.total, summary.trainable_percent()
        );

        self.card      = Some(ModelCard::new(cfg.model_type, classifier, lora));
        self.pad_id    = pad_id;
        self.tokenizer = Some(tokenizer);
        self.labels    = Some(labels);
        self.model     = Some(model);
        Ok(())
    }

    fn init_trained_model(&mut self) -> Result<()> {
        tracing::info!("Init trained model...");
        let ckpt = match &self.config.ckpt_dir {
            Some(dir) => dir.clone(),
            None => self.checkpoints.latest()?,
        };
        if !ckpt.is_dir() {
            return Err(TaskError::MissingCheckpoint(ckpt).into());
        }
        tracing::info!("Loading trained model and tokenizer from '{}'", ckpt.display());

        let labels = CheckpointManager::load_labels(&ckpt)?;
        let card   = CheckpointManager::load_card(&ckpt)?;
        if card.model_type != self.config.model_type {
            tracing::warn!(
                "Checkpoint was trained as {} but model_type is {}; using the checkpoint",
                card.model_type, self.config.model_type
            );
        }
        if card.classifier.num_labels != labels.num_labels() {
            return Err(TaskError::InvalidConfig(format!(
                "checkpoint head has {} labels but its label index has {}",
                card.classifier.num_labels,
                labels.num_labels()
            ))
            .into());
        }

        let mut tokenizer = TokenizerStore::new(&ckpt).load()?;
        TokenizerStore::add_entity_tags(&mut tokenizer)?;
        let pad_id = TokenizerStore::resolve_pad_id(&tokenizer);

        let store = PretrainedStore::new(&self.config.pretrained_model);
        let (base_cfg, decoder) = store.load_decoder::<B>(&self.device)?;
        let expected = &card.classifier.decoder;
        if (base_cfg.hidden_size, base_cfg.num_layers, base_cfg.num_heads)
            != (expected.hidden_size, expected.num_layers, expected.num_heads)
        {
            return Err(TaskError::InvalidConfig(format!(
                "pretrained model '{}' does not match the checkpoint architecture",
                self.config.pretrained_model.display()
            ))
            .into());
        }

        let model = card
            .classifier
            .init_with(decoder, &self.device)
            .resize_token_embeddings(expected.vocab_size, &self.device)
            .inject_adapters(&card.lora, &self.device);
        let state = CheckpointManager::load_state(&ckpt, model.trainable_state(), &self.device)?;
        let model = model.load_trainable_state(state);

        self.pad_id    = pad_id;
        self.tokenizer = Some(tokenizer);
        self.labels    = Some(labels);
        self.card      = Some(card);
        self.model     = Some(model);
        Ok(())
    }

    fn init_dataloaders(&mut self) -> Result<()> {
        let classifier = &self.card()?.classifier;
        let positions  = classifier.decoder.max_position_embeddings;
        let max_len    = self.processor.as_ref().map_or(0, RelationDataProcessor::max_seq_len);
        if max_len > positions {
            return Err(TaskError::InvalidConfig(format!(
                "max_seq_length {max_len} exceeds the model's {positions} positions"
            ))
            .into());
        }
        let pool_tokens = classifier.pool_tokens();

        if self.config.do_train && self.train_loader.is_none() {
            let features = self.features(Split::Train, UnknownLabel::Reject)?;
            let batch    = self.config.train_batch_size;
            self.train_batches = features.len().div_ceil(batch);
            tracing::info!("Train: {} features in {} batches", features.len(), self.train_batches);

            let batcher = RelationBatcher::<B>::new(self.device.clone(), self.pad_id)
                .with_pool_tokens(pool_tokens.clone());
            self.train_loader = Some(
                DataLoaderBuilder::new(batcher)
                    .batch_size(batch)
                    .shuffle(self.config.seed)
                    .num_workers(self.config.num_workers)
                    .build(RelationDataset::new(features)),
            );
        }

        if self.config.do_eval && self.dev_loader.is_none() {
            let dataset = RelationDataset::new(self.features(Split::Dev, UnknownLabel::Reject)?);
            self.dev_labels = dataset.labels();
            self.dev_loader = Some(self.eval_loader(dataset, pool_tokens.clone()));
        }

        if self.config.do_predict && self.test_loader.is_none() {
            let dataset = RelationDataset::new(self.features(Split::Test, UnknownLabel::MapToFirst)?);
            self.test_loader = Some(self.eval_loader(dataset, pool_tokens));
        }
        Ok(())
    }

    fn eval_loader(&self, dataset: RelationDataset, pool_tokens: Vec<u32>) -> Loader<B::InnerBackend> {
        let batcher = RelationBatcher::<B::InnerBackend>::new(self.device.clone(), self.pad_id)
            .with_pool_tokens(pool_tokens);
        DataLoaderBuilder::new(batcher)
            .batch_size(self.config.eval_batch_size)
            .num_workers(self.config.num_workers)
            .build(dataset)
    }

    fn features(&self, split: Split, unknown: UnknownLabel) -> Result<Vec<RelationFeature>> {
        let processor = self.processor.as_ref().ok_or_else(|| anyhow!("data processor not set"))?;
        let key = CacheKey::new(
            self.config.model_type,
            processor.format(),
            processor.max_seq_len(),
            &self.config.pretrained_model,
        );
        let cache    = ExampleCache::new(processor.data_dir(), self.config.cache_data);
        let examples = cache.load_or_build(&key, split, || processor.examples(split))?;
        convert_examples_to_features(&examples, self.tokenizer()?, processor.max_seq_len(), self.labels()?, unknown)
    }

    fn card(&self) -> Result<&ModelCard> {
        self.card.as_ref().ok_or_else(|| anyhow!("model not initialised"))
    }

    fn labels(&self) -> Result<&LabelIndex> {
        self.labels.as_ref().ok_or_else(|| anyhow!("label index not initialised"))
    }

    fn tokenizer(&self) -> Result<&Tokenizer> {
        self.tokenizer.as_ref().ok_or_else(|| anyhow!("tokenizer not initialised"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use tempfile::tempdir;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn config(out: &Path) -> TaskConfig {
        TaskConfig {
            new_model_dir: out.to_path_buf(),
            do_predict:    true,
            ..TaskConfig::default()
        }
    }

    #[test]
    fn test_new_creates_output_dir() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("run");
        let runner = TaskRunner::<TestBackend>::new(config(&out), Default::default(), Precision::Full).unwrap();
        assert!(out.is_dir());
        assert!(runner.config().do_predict);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let dir = tempdir().unwrap();
        let cfg = TaskConfig { data_format_mode: 7, ..config(dir.path()) };
        assert!(TaskRunner::<TestBackend>::new(cfg, Default::default(), Precision::Full).is_err());
    }

    #[test]
    fn test_predict_without_checkpoint_fails() {
        let dir = tempdir().unwrap();
        let mut runner = TaskRunner::<TestBackend>::new(config(dir.path()), Default::default(), Precision::Full).unwrap();
        let err = runner.init().unwrap_err();
        assert!(matches!(err.downcast_ref::<TaskError>(), Some(TaskError::MissingCheckpoint(_))));
    }

    #[test]
    fn test_predict_before_init_fails() {
        let dir = tempdir().unwrap();
        let runner = TaskRunner::<TestBackend>::new(config(dir.path()), Default::default(), Precision::Full).unwrap();
        assert!(runner.predict().is_err());
        assert!(runner.save_model(0).is_err());
    }

    #[test]
    fn test_save_predictions_one_per_line() {
        let dir  = tempdir().unwrap();
        let path = dir.path().join("out").join("pred.txt");
        let preds = vec!["Reason".to_string(), "Other".to_string()];
        TaskRunner::<TestBackend>::save_predictions(&preds, &path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "Reason\nOther\n");
    }
}
