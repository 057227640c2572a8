// ============================================================
// Layer 1 — CLI / Presentation Layer
// ============================================================
// Parses arguments with clap, turns them into a TaskConfig and
// hands off to the launcher. No training logic lives here.

pub mod commands;

use anyhow::{Context, Result};
use burn::backend::{ndarray::NdArrayDevice, NdArray};
use clap::Parser;
use std::{fs, path::Path};

use crate::application::{launcher::launch, task_config::TaskConfig};
use crate::infra::pretrained::{AdapterStore, PretrainedStore};
use crate::ml::{lora::LoraSettings, model::{ClassifierConfig, DecoderConfig}};
use commands::{Commands, ScaffoldArgs};

#[derive(Parser, Debug)]
#[command(
    name = "relex-lora",
    version,
    about = "Fine-tune LLaMA models with LoRA adapters for relation extraction."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn run(self) -> Result<()> {
        let config: TaskConfig = match self.command {
            Commands::Train(args)        => args.into(),
            Commands::Eval(args)         => args.into(),
            Commands::Predict(args)      => args.into(),
            Commands::Run(args)          => TaskConfig::from_toml_file(&args.config)?,
            Commands::ScaffoldBase(args) => return scaffold_base(args),
        };

        let outcome = launch(config)?;
        if let Some(scores) = outcome.eval {
            println!("Evaluation: {scores}");
        }
        if let Some(predictions) = outcome.predictions {
            println!("Predicted {} examples.", predictions.len());
        }
        Ok(())
    }
}

fn scaffold_base(args: ScaffoldArgs) -> Result<()> {
    let corpus = read_corpus(&args.data_dir)?;
    let device = NdArrayDevice::Cpu;
    let template = DecoderConfig::new(
        args.vocab_size,
        args.hidden_size,
        args.num_heads,
        args.num_layers,
        args.intermediate_size,
        args.max_position_embeddings,
    );
    let (config, _) = PretrainedStore::new(&args.output_dir).scaffold::<NdArray<f32>>(template, &corpus, &device)?;
    println!("Base model written to {} ({} tokens)", args.output_dir.display(), config.vocab_size);

    if let Some(dir) = args.with_adapter {
        // Adapter shapes depend only on the decoder; the head size is irrelevant.
        let settings = LoraSettings::default();
        let model = ClassifierConfig::new(config, 1)
            .init::<NdArray<f32>>(&device)
            .inject_adapters(&settings, &device);
        AdapterStore::new(&dir).save(&settings, &model)?;
        println!("Adapter written to {}", dir.display());
    }
    Ok(())
}

/// Text columns of every .tsv file in `dir` (the label column is skipped).
fn read_corpus(dir: &Path) -> Result<Vec<String>> {
    let mut corpus = Vec::new();
    let entries = fs::read_dir(dir).with_context(|| format!("Cannot read data dir '{}'", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("tsv") {
            continue;
        }
        let text = fs::read_to_string(&path).with_context(|| format!("Cannot read '{}'", path.display()))?;
        corpus.extend(
            text.lines()
                .filter_map(|line| line.split_once('\t').map(|(_, rest)| rest.replace('\t', " "))),
        );
    }
    anyhow::ensure!(!corpus.is_empty(), "No .tsv text found in '{}'", dir.display());
    Ok(corpus)
}
