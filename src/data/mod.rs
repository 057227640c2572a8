// ============================================================
// Layer 4 — Data Pipeline
// ============================================================
// From TSV files on disk to tensor batches:
//
//   {train,dev,test}.tsv
//       │
//       ▼
//   RelationDataProcessor → RelationExample  (format mode 0 / 1)
//       │
//       ▼
//   ExampleCache          → reuse parsed examples across runs
//       │
//       ▼
//   features              → token ids + class id
//       │
//       ▼
//   RelationDataset       → Burn Dataset
//       │
//       ▼
//   RelationBatcher       → padded tensor batches for the DataLoader

/// Reads relation TSV files in separate or unified format
pub mod processor;

/// Fingerprinted JSON cache of parsed examples
pub mod cache;

/// Tokenises examples into features
pub mod features;

/// Implements Burn's Dataset trait for relation features
pub mod dataset;

/// Implements Burn's Batcher trait to create padded batches
pub mod batcher;
