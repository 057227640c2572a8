// ============================================================
// Layer 6 — Pretrained model store
// ============================================================
// A pretrained base directory holds:
//
//   config.json      ← DecoderConfig (burn Config JSON)
//   model.mpk.gz     ← Decoder record
//   tokenizer.json   ← base vocabulary
//
// A pretrained adapter directory (used by the *_pre model types)
// holds a previously trained LoRA stack:
//
//   adapter_config.json  ← LoraSettings
//   adapter.mpk.gz       ← AdapterStack record
//
// scaffold() writes a randomly initialised base so the whole
// pipeline can run offline without a converted checkpoint.

use anyhow::{anyhow, Context, Result};
use std::{fs, path::PathBuf};
use burn::{
    prelude::*,
    record::{CompactRecorder, Recorder},
};
use tokenizers::Tokenizer;

use crate::infra::tokenizer_store::TokenizerStore;
use crate::ml::lora::LoraSettings;
use crate::ml::model::{Decoder, DecoderConfig, RelationClassifier};

const BASE_CONFIG:    &str = "config.json";
const BASE_WEIGHTS:   &str = "model";
const ADAPTER_CONFIG: &str = "adapter_config.json";
const ADAPTER_FILE:   &str = "adapter";

pub struct PretrainedStore {
    dir: PathBuf,
}

impl PretrainedStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn tokenizer_store(&self) -> TokenizerStore {
        TokenizerStore::new(&self.dir)
    }

    pub fn load_config(&self) -> Result<DecoderConfig> {
        let path = self.dir.join(BASE_CONFIG);
        DecoderConfig::load(&path)
            .map_err(|e| anyhow!("Cannot load base config '{}': {}", path.display(), e))
    }

    pub fn load_decoder<B: Backend>(&self, device: &B::Device) -> Result<(DecoderConfig, Decoder<B>)> {
        let config = self.load_config()?;
        let path   = self.dir.join(BASE_WEIGHTS);
        let record = CompactRecorder::new()
            .load(path.clone(), device)
            .with_context(|| format!("Cannot load base weights '{}'", path.display()))?;
        let decoder = config.init::<B>(device).load_record(record);
        tracing::info!(
            "Loaded base decoder from '{}' ({} layers, hidden={})",
            self.dir.display(), config.num_layers, config.hidden_size
        );
        Ok((config, decoder))
    }

    pub fn save_decoder<B: Backend>(&self, config: &DecoderConfig, decoder: &Decoder<B>) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Cannot create '{}'", self.dir.display()))?;
        config
            .save(self.dir.join(BASE_CONFIG))
            .with_context(|| "Cannot write base config")?;
        let path = self.dir.join(BASE_WEIGHTS);
        CompactRecorder::new()
            .record(decoder.clone().into_record(), path.clone())
            .with_context(|| format!("Cannot write base weights '{}'", path.display()))?;
        Ok(())
    }

    /// Write a random base decoder plus a word-level tokenizer built from
    /// `corpus`. The decoder vocabulary matches the tokenizer exactly.
    pub fn scaffold<B: Backend>(
        &self,
        template: DecoderConfig,
        corpus:   &[String],
        device:   &B::Device,
    ) -> Result<(DecoderConfig, Tokenizer)> {
        template.validate().map_err(|e| anyhow!(e))?;
        let tokenizer = TokenizerStore::build_word_level(corpus, template.vocab_size)?;
        let mut config = template;
        config.vocab_size = TokenizerStore::embedding_rows(&tokenizer);
        let decoder = config.init::<B>(device);

        self.save_decoder(&config, &decoder)?;
        self.tokenizer_store().save(&tokenizer)?;
        tracing::info!("Scaffolded base model in '{}'", self.dir.display());
        Ok((config, tokenizer))
    }
}

// ─── Pretrained adapters ────────────────────────────────────

pub struct AdapterStore {
    dir: PathBuf,
}

impl AdapterStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn load_settings(&self) -> Result<LoraSettings> {
        let path = self.dir.join(ADAPTER_CONFIG);
        let text = fs::read_to_string(&path)
            .with_context(|| format!("Cannot read adapter config '{}'", path.display()))?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Inject adapters shaped by the stored settings and load their weights.
    pub fn apply<B: Backend>(
        &self,
        model:  RelationClassifier<B>,
        device: &B::Device,
    ) -> Result<(LoraSettings, RelationClassifier<B>)> {
        let settings = self.load_settings()?;
        settings.validate().map_err(|e| anyhow!(e))?;
        let model = model.inject_adapters(&settings, device);

        let path = self.dir.join(ADAPTER_FILE);
        let record = CompactRecorder::new()
            .load(path.clone(), device)
            .with_context(|| format!("Cannot load pretrained adapter '{}'", path.display()))?;
        let stack = model.adapters().load_record(record);
        tracing::info!("Loaded pretrained adapter from '{}'", self.dir.display());
        Ok((settings, model.with_adapters(stack)))
    }

    pub fn save<B: Backend>(&self, settings: &LoraSettings, model: &RelationClassifier<B>) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Cannot create '{}'", self.dir.display()))?;
        fs::write(self.dir.join(ADAPTER_CONFIG), serde_json::to_string_pretty(settings)?)
            .with_context(|| "Cannot write adapter config")?;
        let path = self.dir.join(ADAPTER_FILE);
        CompactRecorder::new()
            .record(model.adapters().into_record(), path.clone())
            .with_context(|| format!("Cannot write adapter '{}'", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use tempfile::tempdir;

    use crate::ml::model::ClassifierConfig;

    type TestBackend = NdArray<f32>;

    fn corpus() -> Vec<String> {
        vec!["aspirin for pain".into(), "ibuprofen for fever".into()]
    }

    #[test]
    fn test_scaffold_then_load() {
        let dir    = tempdir().unwrap();
        let device = Default::default();
        let store  = PretrainedStore::new(dir.path());

        let (config, tokenizer) = store
            .scaffold::<TestBackend>(DecoderConfig::new(100, 8, 2, 1, 16, 32), &corpus(), &device)
            .unwrap();
        assert_eq!(config.vocab_size, TokenizerStore::embedding_rows(&tokenizer));

        let (loaded_cfg, decoder) = store.load_decoder::<TestBackend>(&device).unwrap();
        assert_eq!(loaded_cfg.vocab_size, config.vocab_size);
        assert_eq!(decoder.embed_tokens.weight.dims()[0], config.vocab_size);
        assert!(store.tokenizer_store().load().is_ok());
    }

    #[test]
    fn test_scaffold_rejects_bad_heads() {
        let dir = tempdir().unwrap();
        let res = PretrainedStore::new(dir.path())
            .scaffold::<TestBackend>(DecoderConfig::new(50, 10, 3, 1, 16, 32), &corpus(), &Default::default());
        assert!(res.is_err());
    }

    #[test]
    fn test_adapter_roundtrip() {
        let dir      = tempdir().unwrap();
        let device   = Default::default();
        let config   = ClassifierConfig::new(DecoderConfig::new(20, 8, 2, 2, 16, 8), 2);
        let settings = LoraSettings { target_modules: vec!["q_proj".into(), "o_proj".into()], ..LoraSettings::default() };

        let source = config.init::<TestBackend>(&device).inject_adapters(&settings, &device);
        let store  = AdapterStore::new(dir.path());
        store.save(&settings, &source).unwrap();

        let (loaded, target) = store.apply(config.init::<TestBackend>(&device), &device).unwrap();
        assert_eq!(loaded, settings);

        let layer = &target.decoder.layers[1].attention;
        assert!(layer.q_proj.adapter.is_some());
        assert!(layer.k_proj.adapter.is_none());
        let a: Vec<f32> = layer.o_proj.adapter.as_ref().unwrap().lora_a.weight.val().into_data().convert::<f32>().to_vec().unwrap();
        let b: Vec<f32> = source.decoder.layers[1].attention.o_proj.adapter.as_ref().unwrap().lora_a.weight.val().into_data().convert::<f32>().to_vec().unwrap();
        assert_eq!(a, b);
    }
}
