// ============================================================
// Layer 2 — Application
// ============================================================
// Workflow coordination only: the task runner sequences data,
// model, training and checkpoint calls; the launcher picks the
// backend and runs the enabled modes.

pub mod task_config;
pub mod task_runner;
pub mod launcher;
