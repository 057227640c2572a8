// ============================================================
// Layer 5 — Training Loop
// ============================================================
// Epoch / batch loop with gradient accumulation, optional dynamic
// loss scaling, global-norm clipping, two AdamW parameter groups
// and an optional warmup schedule.
//
//   for each batch:
//     loss  = CE(model(batch)) / grad_accum
//     grads += backward(loss · loss_scale)
//     every grad_accum batches (and at the last batch):
//       unscale → overflow? skip : clip → AdamW(decay) + AdamW(no decay)
//       schedule.step()
//
// Evaluation and checkpointing are the caller's business: the
// `on_epoch_end` hook sees the model after every epoch.
//
// Reference: Loshchilov & Hutter (2019) AdamW

use anyhow::Result;
use burn::{
    data::dataloader::DataLoader,
    optim::{AdamWConfig, GradientsAccumulator, GradientsParams, Optimizer},
    prelude::*,
    tensor::backend::AutodiffBackend,
};

use crate::data::batcher::RelationBatch;
use crate::infra::metrics::LossHistory;
use crate::ml::grad;
use crate::ml::model::{ClassificationLoss, RelationClassifier};
use crate::ml::precision::{GradScaler, Precision};
use crate::ml::schedule::{total_steps, warmup_steps, ScheduleKind, WarmupSchedule};

/// Everything `fit` needs besides the model and the data.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainSettings {
    /// Passes over the training loader
    pub epochs:           usize,
    /// Batches summed into one optimizer step
    pub grad_accum:       usize,
    /// Peak learning rate (reached after warmup when enabled)
    pub learning_rate:    f64,
    /// Decoupled weight decay for parameters with 2+ dimensions
    pub weight_decay:     f64,
    pub adam_epsilon:     f64,
    /// Global L2 clip threshold; 0 disables clipping
    pub max_grad_norm:    f64,
    pub do_warmup:        bool,
    /// Fraction of all optimizer steps spent warming up
    pub warmup_ratio:     f64,
    pub schedule:         ScheduleKind,
    /// Log every n batches within an epoch; 0 disables
    pub log_step:         usize,
    /// Record the running mean loss every n global batches
    pub loss_record_step: usize,
    /// Compute precision of the backend the model lives on
    pub precision:        Precision,
}

impl Default for TrainSettings {
    fn default() -> Self {
        Self {
            epochs:           1,
            grad_accum:       1,
            learning_rate:    1e-5,
            weight_decay:     0.0,
            adam_epsilon:     1e-8,
            max_grad_norm:    1.0,
            do_warmup:        false,
            warmup_ratio:     0.1,
            schedule:         ScheduleKind::Linear,
            log_step:         0,
            loss_record_step: 100,
            precision:        Precision::Full,
        }
    }
}

pub struct TrainOutput<B: AutodiffBackend> {
    pub model:           RelationClassifier<B>,
    pub loss_history:    LossHistory,
    pub global_steps:    usize,
    pub optimizer_steps: usize,
    pub skipped_steps:   usize,
}

pub fn fit<B, F>(
    mut model:        RelationClassifier<B>,
    settings:         &TrainSettings,
    loader:           &dyn DataLoader<RelationBatch<B>>,
    num_batches:      usize,
    loss_fn:          &ClassificationLoss<B>,
    mut scaler:       GradScaler,
    mut on_epoch_end: F,
) -> Result<TrainOutput<B>>
where
    B: AutodiffBackend,
    F: FnMut(usize, &RelationClassifier<B>, f64) -> Result<()>,
{
    let accum = settings.grad_accum.max(1);

    // ── Schedule ──────────────────────────────────────────────────────────────
    let t_total = total_steps(num_batches, accum, settings.epochs);
    let mut schedule = settings.do_warmup.then(|| {
        let warmup = warmup_steps(settings.warmup_ratio, t_total);
        WarmupSchedule::new(settings.schedule, settings.learning_rate, warmup, t_total)
    });
    if let Some(s) = &schedule {
        tracing::info!("Warmup schedule {:?}: {} warmup of {} total steps", settings.schedule, s.warmup(), s.total());
    }

    // ── AdamW, two parameter groups ───────────────────────────────────────────
    // θ = θ - lr · (m̂ / (√v̂ + ε) + λ·θ)   with λ = 0 for 1-D params
    let epsilon = settings.precision.adam_epsilon(settings.adam_epsilon);
    if f64::from(epsilon) > settings.adam_epsilon * 1.001 {
        tracing::warn!(
            "adam_epsilon {:e} is not representable in {}; using {:e}",
            settings.adam_epsilon, settings.precision, epsilon
        );
    }
    let mut optim_decay = AdamWConfig::new()
        .with_epsilon(epsilon)
        .with_weight_decay(settings.weight_decay as f32)
        .init();
    let mut optim_no_decay = AdamWConfig::new()
        .with_epsilon(epsilon)
        .with_weight_decay(0.0)
        .init();

    let mut accumulator = GradientsAccumulator::<RelationClassifier<B>>::new();
    let mut history     = LossHistory::default();
    let mut tr_loss     = 0.0f64;
    let mut t_step      = 0usize;
    let mut opt_steps   = 0usize;
    let mut skipped     = 0usize;

    tracing::info!(
        "Training: {} epochs × {} batches, grad_accum={}, loss_scaling={}",
        settings.epochs, num_batches, accum, scaler.is_enabled()
    );

    for epoch in 1..=settings.epochs {
        let mut epoch_loss = 0.0f64;
        let mut seen       = 0usize;

        for (step, batch) in loader.iter().enumerate() {
            let labels = batch.labels.clone();
            let logits = model.forward_batch(batch);
            let loss   = loss_fn.forward(logits, labels).div_scalar(accum as f64);

            let loss_value: f64 = loss.clone().into_scalar().elem();
            tr_loss    += loss_value;
            epoch_loss += loss_value * accum as f64;
            seen       += 1;
            t_step     += 1;

            let grads = loss.mul_scalar(scaler.scale()).backward();
            let grads = GradientsParams::from_grads(grads, &model);
            accumulator.accumulate(&model, grads);

            if (step + 1) % accum == 0 || step + 1 == num_batches {
                let mut grads = accumulator.grads();
                let report = grad::unscale(&model, &mut grads, scaler.scale());

                if scaler.update(!report.finite) {
                    grad::clip_global_norm(&model, &mut grads, report, settings.max_grad_norm);
                    let lr = schedule.as_ref().map_or(settings.learning_rate, WarmupSchedule::lr);
                    let (decay, no_decay) = grad::split_weight_decay(&model, grads);
                    model = optim_decay.step(lr, model, decay);
                    model = optim_no_decay.step(lr, model, no_decay);
                    opt_steps += 1;
                } else {
                    skipped += 1;
                }
                if let Some(s) = schedule.as_mut() {
                    s.step();
                }
            }

            if settings.log_step > 0 && (step + 1) % settings.log_step == 0 {
                tracing::info!(
                    "epoch: {}; global step: {}; total loss: {:.4}; average loss: {:.4}",
                    epoch, t_step, tr_loss, tr_loss / t_step as f64
                );
            }
            if settings.loss_record_step > 0 && t_step % settings.loss_record_step == 0 {
                history.record(t_step, tr_loss / t_step as f64);
            }
        }

        let mean_loss = if seen > 0 { epoch_loss / seen as f64 } else { f64::NAN };
        tracing::info!("Epoch {}/{} │ train_loss={:.4}", epoch, settings.epochs, mean_loss);
        on_epoch_end(epoch, &model, mean_loss)?;
    }

    if skipped > 0 {
        tracing::warn!("{skipped} optimizer steps skipped on non-finite gradients");
    }

    Ok(TrainOutput {
        model,
        loss_history:    history,
        global_steps:    t_step,
        optimizer_steps: opt_steps,
        skipped_steps:   skipped,
    })
}
