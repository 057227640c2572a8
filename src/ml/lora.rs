// ============================================================
// Layer 5 — Low-rank adapters (LoRA)
// ============================================================
// A LoraLinear wraps a frozen base projection W and, once an
// adapter is injected, adds a trainable low-rank update:
//
//   y = x·W + (alpha / r) · dropout(x)·A·B
//
//   A: [d_in, r]   default (Kaiming) init
//   B: [r, d_out]  zero init, so the adapted layer starts out
//                  numerically identical to the base layer
//
// Reference: Hu et al. (2021) LoRA

use burn::{
    nn::{Dropout, DropoutConfig, Initializer, Linear, LinearConfig},
    prelude::*,
};
use serde::{Deserialize, Serialize};

/// Names of the projections an adapter can be attached to.
pub const ADAPTABLE_MODULES: [&str; 7] =
    ["q_proj", "k_proj", "v_proj", "o_proj", "gate_proj", "up_proj", "down_proj"];

/// Names of the non-adapter modules that can stay fully trainable.
pub const SAVABLE_MODULES: [&str; 2] = ["embed_tokens", "lm_head"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraSettings {
    /// Inner dimension `r` of the low-rank update
    pub rank:            usize,
    pub alpha:           f64,
    pub dropout:         f64,
    /// Attention projections that get an adapter (`q_proj`, `v_proj`, ...)
    pub target_modules:  Vec<String>,
    /// Entries of [`SAVABLE_MODULES`] trained and saved in full
    pub modules_to_save: Vec<String>,
}

impl Default for LoraSettings {
    fn default() -> Self {
        Self {
            rank:            8,
            alpha:           32.0,
            dropout:         0.05,
            target_modules:  vec!["q_proj".into(), "v_proj".into(), "k_proj".into()],
            modules_to_save: vec!["embed_tokens".into(), "lm_head".into()],
        }
    }
}

impl LoraSettings {
    pub fn targets(&self, module: &str) -> bool {
        self.target_modules.iter().any(|m| m == module)
    }

    pub fn saves(&self, module: &str) -> bool {
        self.modules_to_save.iter().any(|m| m == module)
    }

    pub fn scaling(&self) -> f64 {
        self.alpha / self.rank as f64
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.rank == 0 {
            return Err("lora_rank must be > 0".into());
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err("lora_dropout must be in [0, 1)".into());
        }
        if let Some(bad) = self.target_modules.iter().find(|m| !ADAPTABLE_MODULES.contains(&m.as_str())) {
            return Err(format!("unknown LoRA target module '{bad}'"));
        }
        if let Some(bad) = self.modules_to_save.iter().find(|m| !SAVABLE_MODULES.contains(&m.as_str())) {
            return Err(format!("unknown module to save '{bad}'"));
        }
        Ok(())
    }
}

#[derive(Module, Debug)]
pub struct LoraAdapter<B: Backend> {
    /// Down-projection, `d_input -> rank`
    pub lora_a:  Linear<B>,
    /// Up-projection, zero-initialised so a fresh adapter is a no-op
    pub lora_b:  Linear<B>,
    pub dropout: Dropout,
    /// `alpha / rank`
    pub scaling: f64,
}

impl<B: Backend> LoraAdapter<B> {
    pub fn new(d_input: usize, d_output: usize, settings: &LoraSettings, device: &B::Device) -> Self {
        let lora_a = LinearConfig::new(d_input, settings.rank)
            .with_bias(false)
            .init(device);
        let lora_b = LinearConfig::new(settings.rank, d_output)
            .with_bias(false)
            .with_initializer(Initializer::Zeros)
            .init(device);
        Self {
            lora_a,
            lora_b,
            dropout: DropoutConfig::new(settings.dropout).init(),
            scaling: settings.scaling(),
        }
    }

    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let x = self.dropout.forward(x);
        self.lora_b.forward(self.lora_a.forward(x)).mul_scalar(self.scaling)
    }

    /// The dense weight update A·B·scaling, shaped like the base weight.
    pub fn delta_weight(&self) -> Tensor<B, 2> {
        self.lora_a
            .weight
            .val()
            .matmul(self.lora_b.weight.val())
            .mul_scalar(self.scaling)
    }
}

#[derive(Module, Debug)]
pub struct LoraLinear<B: Backend> {
    pub base:    Linear<B>,
    pub adapter: Option<LoraAdapter<B>>,
}

impl<B: Backend> LoraLinear<B> {
    pub fn new(d_input: usize, d_output: usize, device: &B::Device) -> Self {
        Self {
            base:    LinearConfig::new(d_input, d_output).with_bias(false).init(device),
            adapter: None,
        }
    }

    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        match &self.adapter {
            Some(adapter) => self.base.forward(x.clone()) + adapter.forward(x),
            None => self.base.forward(x),
        }
    }

    /// Freeze the base projection and attach a fresh adapter.
    pub fn inject(self, settings: &LoraSettings, device: &B::Device) -> Self {
        let [d_input, d_output] = self.base.weight.dims();
        Self {
            base:    self.base.no_grad(),
            adapter: Some(LoraAdapter::new(d_input, d_output, settings, device)),
        }
    }

    /// Fold the adapter into the base weight; the result has no adapter.
    pub fn merge(self) -> Self {
        match self.adapter {
            Some(adapter) => {
                let weight = self.base.weight.val() + adapter.delta_weight();
                let base = Linear {
                    weight: burn::module::Param::from_tensor(weight),
                    bias:   self.base.bias,
                };
                Self { base: base.no_grad(), adapter: None }
            }
            None => self,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    fn max_abs_diff(a: Tensor<TestBackend, 2>, b: Tensor<TestBackend, 2>) -> f32 {
        (a - b).abs().max().into_scalar()
    }

    #[test]
    fn test_injected_adapter_starts_as_identity_update() {
        let device = Default::default();
        let layer  = LoraLinear::<TestBackend>::new(6, 4, &device);
        let x      = Tensor::<TestBackend, 2>::random([3, 6], Distribution::Default, &device);

        let before = layer.forward(x.clone());
        let layer  = layer.inject(&LoraSettings::default(), &device);
        let after  = layer.forward(x);

        assert!(layer.adapter.is_some());
        assert!(max_abs_diff(before, after) < 1e-6);
    }

    #[test]
    fn test_merge_matches_adapted_forward() {
        let device   = Default::default();
        let settings = LoraSettings { dropout: 0.0, ..LoraSettings::default() };
        let mut layer = LoraLinear::<TestBackend>::new(5, 3, &device).inject(&settings, &device);

        // Give B non-zero values so the adapter contributes.
        if let Some(adapter) = layer.adapter.take() {
            let b = Tensor::<TestBackend, 2>::random([settings.rank, 3], Distribution::Default, &device);
            layer.adapter = Some(LoraAdapter {
                lora_b: Linear { weight: burn::module::Param::from_tensor(b), bias: None },
                ..adapter
            });
        }

        let x        = Tensor::<TestBackend, 2>::random([2, 5], Distribution::Default, &device);
        let adapted  = layer.forward(x.clone());
        let merged   = layer.merge();
        let folded   = merged.forward(x);

        assert!(merged.adapter.is_none());
        assert!(max_abs_diff(adapted, folded) < 1e-4);
    }

    #[test]
    fn test_settings_validation() {
        assert!(LoraSettings::default().validate().is_ok());

        let bad_rank = LoraSettings { rank: 0, ..LoraSettings::default() };
        assert!(bad_rank.validate().is_err());

        let bad_target = LoraSettings { target_modules: vec!["c_attn".into()], ..LoraSettings::default() };
        assert_eq!(bad_target.validate().unwrap_err(), "unknown LoRA target module 'c_attn'");
    }

    #[test]
    fn test_default_scaling() {
        assert!((LoraSettings::default().scaling() - 4.0).abs() < 1e-12);
    }
}
