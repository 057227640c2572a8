// ============================================================
// Layer 5 — Evaluation loop
// ============================================================
// Runs a model over a data loader without gradients and collects
// argmax predictions in loader order plus the mean batch loss.
//
// Callers pass model.valid() (inner backend) so dropout is off and
// no autograd graph is recorded.

use anyhow::{anyhow, Result};
use burn::{data::dataloader::DataLoader, prelude::*};

use crate::data::batcher::RelationBatch;
use crate::ml::model::{ClassificationLoss, RelationClassifier};

#[derive(Debug, Clone, PartialEq)]
pub struct EvalOutput {
    /// Argmax label index per example, in loader order
    pub predictions: Vec<usize>,
    /// Batch losses averaged over batches
    pub mean_loss:   f64,
}

pub fn run_eval<B: Backend>(
    model:   &RelationClassifier<B>,
    loader:  &dyn DataLoader<RelationBatch<B>>,
    loss_fn: &ClassificationLoss<B>,
) -> Result<EvalOutput> {
    let mut predictions = Vec::new();
    let mut loss_sum    = 0.0f64;
    let mut batches     = 0usize;

    for batch in loader.iter() {
        let labels = batch.labels.clone();
        let logits = model.forward_batch(batch);
        let [batch_size, _] = logits.dims();

        let loss: f64 = loss_fn.forward(logits.clone(), labels).into_scalar().elem();
        loss_sum += loss;
        batches  += 1;

        // argmax(1) returns [batch, 1]; flatten before reading back
        let preds: Vec<i64> = logits
            .argmax(1)
            .reshape([batch_size])
            .into_data()
            .convert::<i64>()
            .to_vec()
            .map_err(|e| anyhow!("Failed to read predictions: {e:?}"))?;
        predictions.extend(preds.into_iter().map(|p| p as usize));
    }

    let mean_loss = if batches > 0 { loss_sum / batches as f64 } else { f64::NAN };
    tracing::debug!("Evaluated {} samples in {} batches, loss {:.4}", predictions.len(), batches, mean_loss);
    Ok(EvalOutput { predictions, mean_loss })
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::data::dataloader::DataLoaderBuilder;

    use crate::data::batcher::RelationBatcher;
    use crate::data::dataset::RelationDataset;
    use crate::data::features::RelationFeature;
    use crate::ml::model::{ClassifierConfig, DecoderConfig};

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_predictions_cover_every_sample_in_order() {
        let device = Default::default();
        let config = ClassifierConfig::new(DecoderConfig::new(16, 8, 2, 1, 16, 8), 3);
        let model  = config.init::<TestBackend>(&device);
        let loss   = ClassificationLoss::new(&config, &device);

        let features = vec![
            RelationFeature { input_ids: vec![1, 2, 3], label: 0 },
            RelationFeature { input_ids: vec![4, 5],    label: 1 },
            RelationFeature { input_ids: vec![6],       label: 2 },
        ];
        let loader = DataLoaderBuilder::new(RelationBatcher::<TestBackend>::new(device, 0))
            .batch_size(2)
            .build(RelationDataset::new(features.clone()));

        let out = run_eval(&model, loader.as_ref(), &loss).unwrap();
        assert_eq!(out.predictions.len(), 3);
        assert!(out.predictions.iter().all(|&p| p < 3));
        assert!(out.mean_loss.is_finite());

        // Same model, one sample at a time: identical predictions.
        let single = DataLoaderBuilder::new(RelationBatcher::<TestBackend>::new(Default::default(), 0))
            .batch_size(1)
            .build(RelationDataset::new(features));
        let again = run_eval(&model, single.as_ref(), &loss).unwrap();
        assert_eq!(out.predictions, again.predictions);
    }
}
