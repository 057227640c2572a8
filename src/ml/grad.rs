// ============================================================
// Layer 5 — Gradient post-processing
// ============================================================
// Runs between backward() and the optimizer step:
//
//   unscale   g ← g / loss_scale            (mixed precision only)
//   measure   ‖g‖₂ over every parameter; NaN/Inf ⇒ overflow
//   clip      g ← g · max_norm / ‖g‖        when ‖g‖ > max_norm
//   split     1-D params (biases, norm gains) → no weight decay
//
// Burn keys gradients by ParamId, so each pass is a ModuleVisitor
// walking the model and rewriting the matching gradient entries.

use burn::{
    module::{AutodiffModule, ModuleVisitor, ParamId},
    optim::GradientsParams,
    prelude::*,
    tensor::backend::AutodiffBackend,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradReport {
    pub norm:   f64,
    pub finite: bool,
}

struct ScaleAndMeasure<'a> {
    grads:   &'a mut GradientsParams,
    factor:  f64,
    sq_norm: f64,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for ScaleAndMeasure<'_> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        let Some(grad) = self.grads.remove::<B::InnerBackend, D>(id) else {
            return;
        };
        let grad = if self.factor == 1.0 { grad } else { grad.mul_scalar(self.factor) };
        // Squares are summed on the host in f64; in f16 they overflow past ‖g‖ ≈ 256.
        let data = grad.clone().into_data().convert::<f64>();
        self.sq_norm += data.iter::<f64>().map(|v| v * v).sum::<f64>();
        self.grads.register::<B::InnerBackend, D>(id, grad);
    }
}

fn scale_and_measure<B, M>(module: &M, grads: &mut GradientsParams, factor: f64) -> GradReport
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let mut visitor = ScaleAndMeasure { grads, factor, sq_norm: 0.0 };
    module.visit(&mut visitor);
    let norm = visitor.sq_norm.sqrt();
    GradReport { norm, finite: norm.is_finite() }
}

/// Divide every gradient by `loss_scale` and report the global L2 norm.
pub fn unscale<B, M>(module: &M, grads: &mut GradientsParams, loss_scale: f64) -> GradReport
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    scale_and_measure(module, grads, 1.0 / loss_scale)
}

/// Rescale gradients so their global norm is at most `max_norm`.
/// Returns the clip coefficient that was applied (1.0 when none).
pub fn clip_global_norm<B, M>(module: &M, grads: &mut GradientsParams, report: GradReport, max_norm: f64) -> f64
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    if max_norm <= 0.0 || !report.finite {
        return 1.0;
    }
    let coef = max_norm / (report.norm + 1e-6);
    if coef >= 1.0 {
        return 1.0;
    }
    scale_and_measure(module, grads, coef);
    coef
}

struct DecaySplitter<'a> {
    grads:    &'a mut GradientsParams,
    no_decay: GradientsParams,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for DecaySplitter<'_> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if D >= 2 {
            return;
        }
        if let Some(grad) = self.grads.remove::<B::InnerBackend, D>(id) {
            self.no_decay.register::<B::InnerBackend, D>(id, grad);
        }
    }
}

/// Split gradients into (decay, no_decay) parameter groups.
pub fn split_weight_decay<B, M>(module: &M, mut grads: GradientsParams) -> (GradientsParams, GradientsParams)
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let mut splitter = DecaySplitter { grads: &mut grads, no_decay: GradientsParams::new() };
    module.visit(&mut splitter);
    let no_decay = splitter.no_decay;
    (grads, no_decay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use burn::nn::{Linear, LinearConfig};

    type AD = Autodiff<NdArray<f32>>;

    fn grads_of_sum(scale: f32) -> (Linear<AD>, GradientsParams) {
        let device = Default::default();
        let linear = LinearConfig::new(2, 1).init::<AD>(&device);
        let x      = Tensor::<AD, 2>::ones([1, 2], &device);
        let loss   = linear.forward(x).sum().mul_scalar(scale);
        let grads  = GradientsParams::from_grads(loss.backward(), &linear);
        (linear, grads)
    }

    #[test]
    fn test_unscale_reports_norm() {
        // d(sum)/dW = [[1],[1]], d(sum)/db = [1] → ‖g‖ = √3 before scaling.
        let (linear, mut grads) = grads_of_sum(4.0);
        let report = unscale(&linear, &mut grads, 4.0);
        assert!(report.finite);
        assert!((report.norm - 3f64.sqrt()).abs() < 1e-5);
    }

    #[test]
    fn test_overflow_detected() {
        let (linear, mut grads) = grads_of_sum(f32::INFINITY);
        let report = unscale(&linear, &mut grads, 1.0);
        assert!(!report.finite);
        assert_eq!(clip_global_norm(&linear, &mut grads, report, 1.0), 1.0);
    }

    #[test]
    fn test_large_norm_is_finite() {
        let (linear, mut grads) = grads_of_sum(1000.0);
        let report = unscale(&linear, &mut grads, 1.0);
        assert!(report.finite);
        assert!((report.norm - 1000.0 * 3f64.sqrt()).abs() < 1e-2);
    }

    #[test]
    fn test_clip_to_max_norm() {
        let (linear, mut grads) = grads_of_sum(1.0);
        let report = unscale(&linear, &mut grads, 1.0);
        let coef   = clip_global_norm(&linear, &mut grads, report, 1.0);
        assert!(coef < 1.0);

        let after = unscale(&linear, &mut grads, 1.0);
        assert!((after.norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_no_clip_below_threshold() {
        let (linear, mut grads) = grads_of_sum(1.0);
        let report = unscale(&linear, &mut grads, 1.0);
        assert_eq!(clip_global_norm(&linear, &mut grads, report, 10.0), 1.0);
    }

    #[test]
    fn test_bias_goes_to_no_decay_group() {
        let (linear, grads) = grads_of_sum(1.0);
        assert_eq!(grads.len(), 2);
        let (decay, no_decay) = split_weight_decay(&linear, grads);
        assert_eq!(decay.len(), 1);
        assert_eq!(no_decay.len(), 1);
    }
}
