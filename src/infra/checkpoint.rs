// ============================================================
// Layer 6 — Checkpoint Manager
// ============================================================
// Saves and restores fine-tuned checkpoints with CompactRecorder.
//
// Layout under the output directory:
//
//   <output>/
//     label2idx.json          ← label index of the training run
//     task_config.json        ← run parameters
//     ckpt_3/
//       tokenizer.json        ← tokenizer incl. entity tags
//       config.json           ← ModelCard (versioned)
//       adapter.mpk.gz        ← TrainableState record
//       label_index.json
//     ckpt_5/ ...
//
// Only the trainable state is stored; the frozen backbone is
// reloaded from the pretrained directory and the state applied
// on top of it.
//
// Rotation: after every save, while more than max_checkpoints
// ckpt_* directories exist (max > 0), the one with the smallest
// numeric suffix is deleted.

use anyhow::{Context, Result};
use std::{fs, path::{Path, PathBuf}};
use burn::{
    prelude::*,
    record::{CompactRecorder, Recorder},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokenizers::Tokenizer;

use crate::domain::error::TaskError;
use crate::domain::label_index::LabelIndex;
use crate::domain::model_type::ModelType;
use crate::infra::tokenizer_store::TokenizerStore;
use crate::ml::lora::LoraSettings;
use crate::ml::model::{ClassifierConfig, RelationClassifier, TrainableState};

pub const CONFIG_VERSION: &str = "relex-lora/1";
pub const CARD_FILE:      &str = "config.json";
pub const STATE_FILE:     &str = "adapter";
pub const LABEL_FILE:     &str = "label_index.json";
pub const LABEL2IDX_FILE: &str = "label2idx.json";
const CKPT_PREFIX: &str = "ckpt_";

/// Everything needed to rebuild a fine-tuned classifier around a backbone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCard {
    /// Always [`CONFIG_VERSION`] on write; checked on load
    pub version:    String,
    pub model_type: ModelType,
    pub classifier: ClassifierConfig,
    pub lora:       LoraSettings,
}

impl ModelCard {
    pub fn new(model_type: ModelType, classifier: ClassifierConfig, lora: LoraSettings) -> Self {
        Self { version: CONFIG_VERSION.to_string(), model_type, classifier, lora }
    }

    /// Parse a card, filling fields added since `version` with defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        let mut raw: Value = serde_json::from_str(text)?;
        let version = raw.get("version").and_then(Value::as_str).unwrap_or("").to_string();
        if version != CONFIG_VERSION {
            tracing::warn!(
                "Checkpoint config version '{}' differs from '{}'; applying defaults for missing fields",
                version, CONFIG_VERSION
            );
            merge_missing(&mut raw, &card_defaults()?);
            raw["version"] = Value::String(CONFIG_VERSION.to_string());
        }
        Ok(serde_json::from_value(raw)?)
    }
}

fn card_defaults() -> Result<Value> {
    Ok(serde_json::json!({
        "lora": serde_json::to_value(LoraSettings::default())?,
        "classifier": {
            "tags": [],
            "scheme": 0,
            "use_focal_loss": false,
            "focal_loss_gamma": 2.0,
            "class_weights": null
        }
    }))
}

fn merge_missing(target: &mut Value, defaults: &Value) {
    if let (Value::Object(t), Value::Object(d)) = (target, defaults) {
        for (key, default) in d {
            match t.get_mut(key) {
                Some(existing) => merge_missing(existing, default),
                None => {
                    t.insert(key.clone(), default.clone());
                }
            }
        }
    }
}

/// Numbered `ckpt_<n>` directories under one output root.
pub struct CheckpointManager {
    root:            PathBuf,
    /// Newest directories kept by `rotate()`
    max_checkpoints: usize,
}

impl CheckpointManager {
    /// `max_checkpoints == 0` disables rotation.
    pub fn new(root: impl Into<PathBuf>, max_checkpoints: usize) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("Cannot create output directory '{}'", root.display()))?;
        Ok(Self { root, max_checkpoints })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ckpt_dir(&self, n: usize) -> PathBuf {
        self.root.join(format!("{CKPT_PREFIX}{n}"))
    }

    pub fn save<B: Backend>(
        &self,
        n:         usize,
        model:     &RelationClassifier<B>,
        card:      &ModelCard,
        tokenizer: &Tokenizer,
        labels:    &LabelIndex,
    ) -> Result<PathBuf> {
        let dir = self.ckpt_dir(n);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Cannot create checkpoint dir '{}'", dir.display()))?;

        TokenizerStore::new(&dir).save(tokenizer)?;
        write_json(&dir.join(CARD_FILE), card)?;
        write_json(&dir.join(LABEL_FILE), labels)?;

        let path = dir.join(STATE_FILE);
        CompactRecorder::new()
            .record(model.trainable_state().into_record(), path.clone())
            .with_context(|| format!("Failed to save checkpoint to '{}'", path.display()))?;

        tracing::info!("Saved checkpoint '{}'", dir.display());
        self.rotate()?;
        Ok(dir)
    }

    /// All ckpt_<n> directories, ascending by n.
    pub fn list(&self) -> Result<Vec<(usize, PathBuf)>> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.root)
            .with_context(|| format!("Cannot list '{}'", self.root.display()))?
        {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            let suffix = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix(CKPT_PREFIX))
                .and_then(|s| s.parse::<usize>().ok());
            if let Some(n) = suffix {
                found.push((n, path));
            }
        }
        found.sort_by_key(|(n, _)| *n);
        Ok(found)
    }

    pub fn rotate(&self) -> Result<Vec<PathBuf>> {
        let mut removed = Vec::new();
        if self.max_checkpoints == 0 {
            return Ok(removed);
        }
        let mut ckpts = self.list()?;
        while ckpts.len() > self.max_checkpoints {
            let (_, oldest) = ckpts.remove(0);
            fs::remove_dir_all(&oldest)
                .with_context(|| format!("Cannot remove '{}'", oldest.display()))?;
            tracing::info!("Removed old checkpoint '{}'", oldest.display());
            removed.push(oldest);
        }
        Ok(removed)
    }

    pub fn latest(&self) -> Result<PathBuf> {
        self.list()?
            .pop()
            .map(|(_, path)| path)
            .ok_or_else(|| TaskError::MissingCheckpoint(self.root.clone()).into())
    }

    pub fn save_label2idx(&self, labels: &LabelIndex) -> Result<()> {
        write_json(&self.root.join(LABEL2IDX_FILE), &labels.label2idx)
    }

    // ─── Loading ────────────────────────────────────────────

    pub fn load_card(dir: &Path) -> Result<ModelCard> {
        let path = dir.join(CARD_FILE);
        let text = fs::read_to_string(&path).with_context(|| {
            format!("Cannot read '{}'. Is this a training checkpoint?", path.display())
        })?;
        ModelCard::from_json(&text).with_context(|| format!("Malformed '{}'", path.display()))
    }

    pub fn load_labels(dir: &Path) -> Result<LabelIndex> {
        let path = dir.join(LABEL_FILE);
        let text = fs::read_to_string(&path)
            .with_context(|| format!("Cannot read '{}'", path.display()))?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Load the stored trainable state into `template`, which must have
    /// the same shapes (same vocab rows, labels and adapter targets).
    pub fn load_state<B: Backend>(
        dir:      &Path,
        template: TrainableState<B>,
        device:   &B::Device,
    ) -> Result<TrainableState<B>> {
        let path = dir.join(STATE_FILE);
        let record = CompactRecorder::new()
            .load(path.clone(), device)
            .with_context(|| format!("Cannot load checkpoint '{}'", path.display()))?;
        Ok(template.load_record(record))
    }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    fs::write(path, serde_json::to_string_pretty(value)?)
        .with_context(|| format!("Cannot write '{}'", path.display()))
}
