// ============================================================
// Layer 4 — Relation Batcher
// ============================================================
// Implements Burn's Batcher trait: stacks variable-length features
// into right-padded tensors.
//
//   Input:  N features, lengths L1..LN
//   Output: RelationBatch with tensors of shape [N, max(Li)]
//
// Besides ids and the attention mask the batch carries a pooling
// mask [N, K, max(Li)] with one 1.0 per (row, slot):
//
//   slot 0..K-2 → first occurrence of each pooled tag token
//                 ([s1], [s2], ... depending on the scheme)
//   slot K-1    → last real token
//
// A tag that was truncated away falls back to the last real token.
// The classifier reads pool_mask · hidden, which is [N, K, d].

use burn::{
    data::dataloader::batcher::Batcher,
    prelude::*,
};

use crate::data::features::RelationFeature;

#[derive(Debug, Clone)]
pub struct RelationBatch<B: Backend> {
    /// [batch_size, seq_len]
    pub input_ids: Tensor<B, 2, Int>,

    /// [batch_size, seq_len]; 1 = real token, 0 = padding
    pub attention_mask: Tensor<B, 2, Int>,

    /// [batch_size, pooled_positions, seq_len]
    pub pool_mask: Tensor<B, 3>,

    /// [batch_size]
    pub labels: Tensor<B, 1, Int>,
}

#[derive(Clone, Debug)]
pub struct RelationBatcher<B: Backend> {
    pub device:      B::Device,
    pub pad_id:      u32,
    pub pool_tokens: Vec<u32>,
}

impl<B: Backend> RelationBatcher<B> {
    pub fn new(device: B::Device, pad_id: u32) -> Self {
        Self { device, pad_id, pool_tokens: Vec::new() }
    }

    /// Additionally pool the hidden state at each of these token ids.
    pub fn with_pool_tokens(mut self, pool_tokens: Vec<u32>) -> Self {
        self.pool_tokens = pool_tokens;
        self
    }

    pub fn pooled_positions(&self) -> usize {
        self.pool_tokens.len() + 1
    }
}

impl<B: Backend> Batcher<RelationFeature, RelationBatch<B>> for RelationBatcher<B> {
    fn batch(&self, items: Vec<RelationFeature>) -> RelationBatch<B> {
        let batch_size = items.len();
        let seq_len    = items.iter().map(|f| f.input_ids.len()).max().unwrap_or(1).max(1);
        let slots      = self.pooled_positions();

        let mut ids   = Vec::with_capacity(batch_size * seq_len);
        let mut mask  = Vec::with_capacity(batch_size * seq_len);
        let mut pool  = vec![0.0f32; batch_size * slots * seq_len];
        let mut label = Vec::with_capacity(batch_size);

        for (row, f) in items.iter().enumerate() {
            let len  = f.input_ids.len();
            let last = len.saturating_sub(1);
            ids.extend(f.input_ids.iter().map(|&x| x as i32));
            ids.extend(std::iter::repeat(self.pad_id as i32).take(seq_len - len));
            mask.extend(std::iter::repeat(1i32).take(len));
            mask.extend(std::iter::repeat(0i32).take(seq_len - len));

            let base = row * slots * seq_len;
            for (slot, tag) in self.pool_tokens.iter().enumerate() {
                let pos = f.input_ids.iter().position(|id| id == tag).unwrap_or(last);
                pool[base + slot * seq_len + pos] = 1.0;
            }
            pool[base + (slots - 1) * seq_len + last] = 1.0;
            label.push(f.label as i32);
        }

        let input_ids = Tensor::<B, 1, Int>::from_ints(ids.as_slice(), &self.device)
            .reshape([batch_size, seq_len]);
        let attention_mask = Tensor::<B, 1, Int>::from_ints(mask.as_slice(), &self.device)
            .reshape([batch_size, seq_len]);
        let pool_mask = Tensor::<B, 1>::from_floats(pool.as_slice(), &self.device)
            .reshape([batch_size, slots, seq_len]);
        let labels = Tensor::<B, 1, Int>::from_ints(label.as_slice(), &self.device);

        RelationBatch { input_ids, attention_mask, pool_mask, labels }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_pads_to_longest_and_marks_last_token() {
        let device  = Default::default();
        let batcher = RelationBatcher::<TestBackend>::new(device, 0);
        let batch = batcher.batch(vec![
            RelationFeature { input_ids: vec![5, 6, 7], label: 1 },
            RelationFeature { input_ids: vec![8],       label: 0 },
        ]);

        assert_eq!(batch.input_ids.dims(), [2, 3]);
        assert_eq!(batch.pool_mask.dims(), [2, 1, 3]);

        let ids: Vec<i64> = batch.input_ids.into_data().convert::<i64>().to_vec().unwrap();
        assert_eq!(ids, vec![5, 6, 7, 8, 0, 0]);

        let mask: Vec<i64> = batch.attention_mask.into_data().convert::<i64>().to_vec().unwrap();
        assert_eq!(mask, vec![1, 1, 1, 1, 0, 0]);

        let pool: Vec<f32> = batch.pool_mask.into_data().convert::<f32>().to_vec().unwrap();
        assert_eq!(pool, vec![0.0, 0.0, 1.0, 1.0, 0.0, 0.0]);

        let labels: Vec<i64> = batch.labels.into_data().convert::<i64>().to_vec().unwrap();
        assert_eq!(labels, vec![1, 0]);
    }

    #[test]
    fn test_pool_tokens_fall_back_to_last_token() {
        let device  = Default::default();
        let batcher = RelationBatcher::<TestBackend>::new(device, 0).with_pool_tokens(vec![90, 91]);
        let batch = batcher.batch(vec![
            RelationFeature { input_ids: vec![90, 4, 91, 5], label: 0 },
            RelationFeature { input_ids: vec![4, 90],        label: 0 },
        ]);

        assert_eq!(batch.pool_mask.dims(), [2, 3, 4]);
        let pool: Vec<f32> = batch.pool_mask.into_data().convert::<f32>().to_vec().unwrap();
        #[rustfmt::skip]
        let expected = vec![
            // row 0: [s1] at 0, [s2] at 2, last at 3
            1.0, 0.0, 0.0, 0.0,
            0.0, 0.0, 1.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
            // row 1: [s1] at 1, [s2] missing → last, last at 1
            0.0, 1.0, 0.0, 0.0,
            0.0, 1.0, 0.0, 0.0,
            0.0, 1.0, 0.0, 0.0,
        ];
        assert_eq!(pool, expected);
    }
}
