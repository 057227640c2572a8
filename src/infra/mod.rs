// ============================================================
// Layer 6 — Infrastructure Layer
// ============================================================
// File-system persistence and bookkeeping shared by the other
// layers:
//
//   checkpoint.rs      — ckpt_<n> directories: save, rotate,
//                        find latest, reload trainable state
//   tokenizer_store.rs — tokenizer.json load/save, entity tags,
//                        pad id resolution
//   pretrained.rs      — base decoder weights and pretrained
//                        LoRA adapters; offline scaffolding
//   metrics.rs         — accuracy / micro-F1, metrics.csv,
//                        loss history
//
// Reference: Burn Book §5 (Records and Checkpointing)

pub mod checkpoint;
pub mod tokenizer_store;
pub mod pretrained;
pub mod metrics;
