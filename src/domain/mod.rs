// ============================================================
// Layer 3 — Domain Layer
// ============================================================
// Plain Rust types shared by every other layer:
//
//   example.rs      — one relation-extraction example
//   label_index.rs  — label ↔ index bookkeeping, persisted per checkpoint
//   model_type.rs   — supported pretrained-model variants
//   task.rs         — data format modes and dataset splits
//   traits.rs       — the ExampleSource seam
//   error.rs        — typed errors raised by the task runner
//
// No Burn types and no file I/O live here.

pub mod example;

pub mod label_index;

pub mod model_type;

pub mod task;

pub mod traits;

pub mod error;
