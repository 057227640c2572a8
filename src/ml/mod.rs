// ============================================================
// Layer 5 — ML / Model Layer (Burn)
// ============================================================
// All Burn-specific model and optimisation code lives here.
//
//   lora.rs       — LoraLinear: frozen base + low-rank adapter
//   model.rs      — LLaMA-style decoder, relation classifier head,
//                   trainable-state split, weighted/focal loss
//   precision.rs  — fp16 → bf16 → fp32 resolution, GradScaler
//   grad.rs       — unscale, overflow check, global-norm clip,
//                   weight-decay parameter groups
//   schedule.rs   — linear / cosine warmup schedules
//   trainer.rs    — epoch loop with gradient accumulation
//   evaluator.rs  — inference loop: predictions + mean loss
//   backend.rs    — concrete backend per device and precision
//
// Reference: Burn Book §3 (Building Blocks), §5 (Training)
//            Touvron et al. (2023) LLaMA
//            Hu et al. (2021) LoRA

pub mod lora;
pub mod model;
pub mod precision;
pub mod grad;
pub mod schedule;
pub mod trainer;
pub mod evaluator;
pub mod backend;
