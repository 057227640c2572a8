// ============================================================
// Layer 5 — Learning-rate warmup schedules
// ============================================================
//   t_total = ⌊batches / grad_accum⌋ · epochs
//   warmup  = ⌊warmup_ratio · t_total⌋
//
//   linear:  lr · s/w                        s < w
//            lr · max(0, (T - s)/(T - w))    otherwise
//   cosine:  lr · s/w                        s < w
//            lr · ½(1 + cos(π · p))          p = (s - w)/(T - w)
//
// `s` counts optimizer steps, not batches.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleKind {
    #[default]
    Linear,
    Cosine,
}

impl std::str::FromStr for ScheduleKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "linear" => Ok(ScheduleKind::Linear),
            "cosine" => Ok(ScheduleKind::Cosine),
            other => Err(format!("unknown schedule '{other}' (expected linear or cosine)")),
        }
    }
}

pub fn total_steps(num_batches: usize, grad_accum: usize, epochs: usize) -> usize {
    num_batches / grad_accum.max(1) * epochs
}

pub fn warmup_steps(warmup_ratio: f64, total: usize) -> usize {
    (warmup_ratio * total as f64).floor() as usize
}

#[derive(Debug, Clone, PartialEq)]
pub struct WarmupSchedule {
    kind:    ScheduleKind,
    base_lr: f64,
    warmup:  usize,
    total:   usize,
    step:    usize,
}

impl WarmupSchedule {
    pub fn new(kind: ScheduleKind, base_lr: f64, warmup: usize, total: usize) -> Self {
        Self { kind, base_lr, warmup, total, step: 0 }
    }

    pub fn warmup(&self) -> usize {
        self.warmup
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Multiplier applied to the base learning rate at the current step.
    pub fn factor(&self) -> f64 {
        let s = self.step as f64;
        if self.step < self.warmup {
            return s / self.warmup.max(1) as f64;
        }
        let decay_span = self.total.saturating_sub(self.warmup).max(1) as f64;
        let progress = (s - self.warmup as f64) / decay_span;
        match self.kind {
            ScheduleKind::Linear => (1.0 - progress).max(0.0),
            ScheduleKind::Cosine => (0.5 * (1.0 + (PI * progress).cos())).max(0.0),
        }
    }

    pub fn lr(&self) -> f64 {
        self.base_lr * self.factor()
    }

    pub fn step(&mut self) {
        self.step += 1;
    }
}
