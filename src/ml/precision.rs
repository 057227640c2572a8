// ============================================================
// Layer 5 — Mixed precision
// ============================================================
// Resolution is a fallback chain, tried in order:
//
//   1. native half (f16) compute + dynamic loss scaling
//   2. bfloat16 compute, no loss scaling (bf16 has f32's range)
//   3. full precision, with an error logged
//
// Each candidate is tried on the device before it is chosen, so a
// backend without f16/bf16 kernels degrades instead of aborting.

use burn::tensor::f16;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    Full,
    Half,
    BFloat,
}

impl Precision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Precision::Full   => "fp32",
            Precision::Half   => "fp16",
            Precision::BFloat => "bf16",
        }
    }

    /// Only f16 needs loss scaling to keep small gradients representable.
    pub fn needs_loss_scaling(&self) -> bool {
        matches!(self, Precision::Half)
    }

    /// AdamW epsilon as it will be stored in this precision.
    ///
    /// f16 flushes anything below its smallest normal value (~6.1e-5)
    /// towards zero, and a zero epsilon turns the first update of a
    /// zero gradient (every `lora_a` while `lora_b` is still zero)
    /// into 0/0. Half precision therefore raises epsilon to that floor.
    pub fn adam_epsilon(&self, requested: f64) -> f32 {
        match self {
            Precision::Half => requested.max(f16::MIN_POSITIVE.to_f64()) as f32,
            Precision::Full | Precision::BFloat => requested as f32,
        }
    }
}

impl std::fmt::Display for Precision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Answers whether a reduced-precision mode actually works on the device.
pub trait PrecisionSupport {
    fn supports(&self, precision: Precision) -> bool;
}

pub fn resolve_precision(fp16_requested: bool, support: &dyn PrecisionSupport) -> Precision {
    if !fp16_requested {
        return Precision::Full;
    }
    if support.supports(Precision::Half) {
        tracing::info!("Mixed precision: native fp16 with dynamic loss scaling");
        return Precision::Half;
    }
    tracing::warn!("fp16 kernels unavailable on this device; trying bf16");
    if support.supports(Precision::BFloat) {
        tracing::info!("Mixed precision: bf16 without loss scaling");
        return Precision::BFloat;
    }
    tracing::error!("No mixed precision mode is available on this device; fp16 training disabled");
    Precision::Full
}

// ─── Dynamic loss scaling ───────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct GradScaler {
    /// Current loss multiplier
    scale:           f64,
    growth_factor:   f64,
    backoff_factor:  f64,
    /// Finite steps needed before the scale grows again
    growth_interval: usize,
    clean_steps:     usize,
    enabled:         bool,
}

impl GradScaler {
    pub fn new() -> Self {
        Self {
            scale:           65536.0,
            growth_factor:   2.0,
            backoff_factor:  0.5,
            growth_interval: 2000,
            clean_steps:     0,
            enabled:         true,
        }
    }

    /// A pass-through scaler: scale is always 1 and never changes.
    pub fn disabled() -> Self {
        Self { scale: 1.0, enabled: false, ..Self::new() }
    }

    /// Start from a different loss scale (65536 by default).
    #[cfg(test)]
    pub fn with_init_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub fn for_precision(precision: Precision) -> Self {
        if precision.needs_loss_scaling() { Self::new() } else { Self::disabled() }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Record the outcome of one optimizer step. Returns true when the
    /// step should be applied, false when it must be skipped.
    pub fn update(&mut self, found_non_finite: bool) -> bool {
        if !self.enabled {
            return !found_non_finite;
        }
        if found_non_finite {
            self.scale *= self.backoff_factor;
            self.clean_steps = 0;
            tracing::warn!("Non-finite gradients; skipping step, loss scale → {}", self.scale);
            return false;
        }
        self.clean_steps += 1;
        if self.clean_steps == self.growth_interval {
            self.scale *= self.growth_factor;
            self.clean_steps = 0;
            tracing::debug!("Loss scale grown to {}", self.scale);
        }
        true
    }
}

impl Default for GradScaler {
    fn default() -> Self {
        Self::new()
    }
}
