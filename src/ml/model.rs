use burn::{
    module::{Param, ParamId},
    nn::{
        attention::generate_autoregressive_mask,
        Dropout, DropoutConfig,
        Embedding, EmbeddingConfig,
        Linear, LinearConfig,
        RmsNorm, RmsNormConfig,
    },
    prelude::*,
    tensor::{
        activation::{log_softmax, silu, softmax},
        Distribution,
    },
};

use crate::data::batcher::RelationBatch;
use crate::ml::lora::{LoraAdapter, LoraLinear, LoraSettings};

/// Additive bias for blocked attention positions.
const MASK_BIAS: f64 = -1.0e4;

// Config derive supplies Clone, Serialize and Deserialize.
#[derive(Config, Debug)]
pub struct DecoderConfig {
    pub vocab_size:              usize,
    pub hidden_size:             usize,
    pub num_heads:               usize,
    pub num_layers:              usize,
    pub intermediate_size:       usize,
    pub max_position_embeddings: usize,
    #[config(default = 1e-6)]
    pub rms_norm_eps:            f64,
    #[config(default = 0.0)]
    pub dropout:                 f64,
}

impl DecoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Decoder<B> {
        let embed_tokens    = EmbeddingConfig::new(self.vocab_size, self.hidden_size).init(device);
        let embed_positions = EmbeddingConfig::new(self.max_position_embeddings, self.hidden_size).init(device);
        let layers: Vec<DecoderBlock<B>> = (0..self.num_layers)
            .map(|_| self.build_block(device))
            .collect();
        let norm    = self.build_norm(device);
        let dropout = DropoutConfig::new(self.dropout).init();
        Decoder { embed_tokens, embed_positions, layers, norm, dropout }
    }

    fn build_norm<B: Backend>(&self, device: &B::Device) -> RmsNorm<B> {
        RmsNormConfig::new(self.hidden_size)
            .with_epsilon(self.rms_norm_eps)
            .init(device)
    }

    fn build_block<B: Backend>(&self, device: &B::Device) -> DecoderBlock<B> {
        let (d, ff) = (self.hidden_size, self.intermediate_size);
        let attention = CausalSelfAttention {
            q_proj:    LoraLinear::new(d, d, device),
            k_proj:    LoraLinear::new(d, d, device),
            v_proj:    LoraLinear::new(d, d, device),
            o_proj:    LoraLinear::new(d, d, device),
            num_heads: self.num_heads,
        };
        let mlp = GatedMlp {
            gate_proj: LoraLinear::new(d, ff, device),
            up_proj:   LoraLinear::new(d, ff, device),
            down_proj: LoraLinear::new(ff, d, device),
        };
        DecoderBlock {
            input_norm:          self.build_norm(device),
            attention,
            post_attention_norm: self.build_norm(device),
            mlp,
            dropout:             DropoutConfig::new(self.dropout).init(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.num_heads == 0 || self.hidden_size % self.num_heads != 0 {
            return Err(format!(
                "hidden_size {} is not divisible by num_heads {}",
                self.hidden_size, self.num_heads
            ));
        }
        Ok(())
    }
}

// ─── Decoder blocks ─────────────────────────────────────────

#[derive(Module, Debug)]
pub struct CausalSelfAttention<B: Backend> {
    pub q_proj:    LoraLinear<B>,
    pub k_proj:    LoraLinear<B>,
    pub v_proj:    LoraLinear<B>,
    pub o_proj:    LoraLinear<B>,
    pub num_heads: usize,
}

impl<B: Backend> CausalSelfAttention<B> {
    /// x: [b, s, d], bias: [b, 1, s, s] additive → [b, s, d]
    pub fn forward(&self, x: Tensor<B, 3>, bias: Tensor<B, 4>) -> Tensor<B, 3> {
        let [b, s, d] = x.dims();
        let heads    = self.num_heads;
        let head_dim = d / heads;
        let split = |t: Tensor<B, 3>| t.reshape([b, s, heads, head_dim]).swap_dims(1, 2);

        let q = split(self.q_proj.forward(x.clone()));
        let k = split(self.k_proj.forward(x.clone()));
        let v = split(self.v_proj.forward(x));

        let scores = q.matmul(k.swap_dims(2, 3)).div_scalar((head_dim as f64).sqrt()) + bias;
        let probs  = softmax(scores, 3);
        let context = probs.matmul(v).swap_dims(1, 2).reshape([b, s, d]);
        self.o_proj.forward(context)
    }
}

#[derive(Module, Debug)]
pub struct GatedMlp<B: Backend> {
    pub gate_proj: LoraLinear<B>,
    pub up_proj:   LoraLinear<B>,
    pub down_proj: LoraLinear<B>,
}

impl<B: Backend> GatedMlp<B> {
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let gate = silu(self.gate_proj.forward(x.clone()));
        self.down_proj.forward(gate * self.up_proj.forward(x))
    }
}

#[derive(Module, Debug)]
pub struct DecoderBlock<B: Backend> {
    pub input_norm:          RmsNorm<B>,
    pub attention:           CausalSelfAttention<B>,
    pub post_attention_norm: RmsNorm<B>,
    pub mlp:                 GatedMlp<B>,
    pub dropout:             Dropout,
}

impl<B: Backend> DecoderBlock<B> {
    pub fn forward(&self, x: Tensor<B, 3>, bias: Tensor<B, 4>) -> Tensor<B, 3> {
        let attn = self.attention.forward(self.input_norm.forward(x.clone()), bias);
        let x    = x + self.dropout.forward(attn);
        let ffn  = self.mlp.forward(self.post_attention_norm.forward(x.clone()));
        x + self.dropout.forward(ffn)
    }

    fn inject(mut self, lora: &LoraSettings, device: &B::Device) -> Self {
        let pick = |layer: LoraLinear<B>, name: &str| {
            if lora.targets(name) { layer.inject(lora, device) } else { layer }
        };
        self.attention.q_proj = pick(self.attention.q_proj, "q_proj");
        self.attention.k_proj = pick(self.attention.k_proj, "k_proj");
        self.attention.v_proj = pick(self.attention.v_proj, "v_proj");
        self.attention.o_proj = pick(self.attention.o_proj, "o_proj");
        self.mlp.gate_proj    = pick(self.mlp.gate_proj, "gate_proj");
        self.mlp.up_proj      = pick(self.mlp.up_proj, "up_proj");
        self.mlp.down_proj    = pick(self.mlp.down_proj, "down_proj");
        self
    }

    fn adapters(&self) -> LayerAdapters<B> {
        LayerAdapters {
            q_proj:    self.attention.q_proj.adapter.clone(),
            k_proj:    self.attention.k_proj.adapter.clone(),
            v_proj:    self.attention.v_proj.adapter.clone(),
            o_proj:    self.attention.o_proj.adapter.clone(),
            gate_proj: self.mlp.gate_proj.adapter.clone(),
            up_proj:   self.mlp.up_proj.adapter.clone(),
            down_proj: self.mlp.down_proj.adapter.clone(),
        }
    }

    fn with_adapters(mut self, a: LayerAdapters<B>) -> Self {
        self.attention.q_proj.adapter = a.q_proj;
        self.attention.k_proj.adapter = a.k_proj;
        self.attention.v_proj.adapter = a.v_proj;
        self.attention.o_proj.adapter = a.o_proj;
        self.mlp.gate_proj.adapter    = a.gate_proj;
        self.mlp.up_proj.adapter      = a.up_proj;
        self.mlp.down_proj.adapter    = a.down_proj;
        self
    }

    fn merge(mut self) -> Self {
        self.attention.q_proj = self.attention.q_proj.merge();
        self.attention.k_proj = self.attention.k_proj.merge();
        self.attention.v_proj = self.attention.v_proj.merge();
        self.attention.o_proj = self.attention.o_proj.merge();
        self.mlp.gate_proj    = self.mlp.gate_proj.merge();
        self.mlp.up_proj      = self.mlp.up_proj.merge();
        self.mlp.down_proj    = self.mlp.down_proj.merge();
        self
    }
}

// ─── Decoder backbone ───────────────────────────────────────

/// The pretrained part of the network; its record is the base model file.
#[derive(Module, Debug)]
pub struct Decoder<B: Backend> {
    pub embed_tokens:    Embedding<B>,
    pub embed_positions: Embedding<B>,
    pub layers:          Vec<DecoderBlock<B>>,
    pub norm:            RmsNorm<B>,
    pub dropout:         Dropout,
}

impl<B: Backend> Decoder<B> {
    /// input_ids, attention_mask: [b, s] → hidden states [b, s, d]
    pub fn forward(&self, input_ids: Tensor<B, 2, Int>, attention_mask: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        let [batch_size, seq_len] = input_ids.dims();
        let device = input_ids.device();

        let tok_emb = self.embed_tokens.forward(input_ids);
        let positions = Tensor::<B, 1, Int>::arange(0..seq_len as i64, &device)
            .unsqueeze::<2>()
            .expand([batch_size, seq_len]);
        let pos_emb = self.embed_positions.forward(positions);

        // Blocked = future position OR padding key.
        let causal  = generate_autoregressive_mask::<B>(batch_size, seq_len, &device).float();
        let padding = attention_mask.equal_elem(0).float().reshape([batch_size, 1, seq_len]);
        let bias = (causal + padding)
            .clamp_max(1.0)
            .mul_scalar(MASK_BIAS)
            .reshape([batch_size, 1, seq_len, seq_len]);

        let mut x = self.dropout.forward(tok_emb + pos_emb);
        for layer in &self.layers {
            x = layer.forward(x, bias.clone());
        }
        self.norm.forward(x)
    }

    pub fn hidden_size(&self) -> usize {
        self.embed_tokens.weight.dims()[1]
    }
}

// ─── Classifier ─────────────────────────────────────────────

#[derive(Config, Debug)]
pub struct ClassifierConfig {
    pub decoder:    DecoderConfig,
    pub num_labels: usize,
    /// Token ids of [s1] [e1] [s2] [e2], in that order.
    #[config(default = "Vec::new()")]
    pub tags:       Vec<u32>,
    /// 0: last token; 1: [s1] [s2] + last token; 2: all four tags + last token.
    #[config(default = 0)]
    pub scheme:     u8,
    #[config(default = false)]
    pub use_focal_loss:   bool,
    #[config(default = 2.0)]
    pub focal_loss_gamma: f64,
    pub class_weights:    Option<Vec<f32>>,
}

impl ClassifierConfig {
    /// Token ids whose hidden states are pooled next to the last token.
    pub fn pool_tokens(&self) -> Vec<u32> {
        let tag = |i: usize| self.tags.get(i).copied();
        let picked: Vec<Option<u32>> = match self.scheme {
            0 => Vec::new(),
            1 => vec![tag(0), tag(2)],
            _ => (0..4).map(tag).collect(),
        };
        picked.into_iter().flatten().collect()
    }

    pub fn pooled_positions(&self) -> usize {
        self.pool_tokens().len() + 1
    }

    /// Wrap a (loaded) backbone with a freshly initialised score head.
    pub fn init_with<B: Backend>(&self, decoder: Decoder<B>, device: &B::Device) -> RelationClassifier<B> {
        let score = LinearConfig::new(decoder.hidden_size() * self.pooled_positions(), self.num_labels)
            .init(device);
        RelationClassifier { decoder, score, pooled_positions: self.pooled_positions() }
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> RelationClassifier<B> {
        self.init_with(self.decoder.init(device), device)
    }
}

#[derive(Module, Debug)]
pub struct RelationClassifier<B: Backend> {
    pub decoder:          Decoder<B>,
    pub score:            Linear<B>,
    pub pooled_positions: usize,
}

impl<B: Backend> RelationClassifier<B> {
    /// → logits [b, num_labels]
    pub fn forward(
        &self,
        input_ids:      Tensor<B, 2, Int>,
        attention_mask: Tensor<B, 2, Int>,
        pool_mask:      Tensor<B, 3>,
    ) -> Tensor<B, 2> {
        let hidden = self.decoder.forward(input_ids, attention_mask); // [b, s, d]
        let [batch_size, _, d] = hidden.dims();
        let pooled = pool_mask
            .matmul(hidden)
            .reshape([batch_size, self.pooled_positions * d]);
        self.score.forward(pooled)
    }

    pub fn forward_batch(&self, batch: RelationBatch<B>) -> Tensor<B, 2> {
        self.forward(batch.input_ids, batch.attention_mask, batch.pool_mask)
    }

    /// Grow (or shrink) the token embedding table to `rows`, keeping
    /// existing rows. New rows are drawn from N(0, 0.02).
    pub fn resize_token_embeddings(mut self, rows: usize, device: &B::Device) -> Self {
        let weight = self.decoder.embed_tokens.weight.val();
        let [old_rows, d] = weight.dims();
        let resized = if rows > old_rows {
            let extra = Tensor::<B, 2>::random([rows - old_rows, d], Distribution::Normal(0.0, 0.02), device);
            Tensor::cat(vec![weight, extra], 0)
        } else if rows < old_rows {
            weight.slice([0..rows, 0..d])
        } else {
            return self;
        };
        tracing::debug!("Resized token embeddings {old_rows} → {rows}");
        self.decoder.embed_tokens = Embedding { weight: Param::from_tensor(resized) };
        self
    }

    /// Freeze the backbone and attach adapters to the target projections.
    /// The score head always stays trainable; token embeddings stay
    /// trainable only when listed in `modules_to_save`.
    pub fn inject_adapters(mut self, lora: &LoraSettings, device: &B::Device) -> Self {
        self.decoder.layers = self
            .decoder
            .layers
            .into_iter()
            .map(|layer| layer.no_grad().inject(lora, device))
            .collect();
        self.decoder.embed_positions = self.decoder.embed_positions.no_grad();
        self.decoder.norm = self.decoder.norm.no_grad();
        if !lora.saves("embed_tokens") {
            self.decoder.embed_tokens = self.decoder.embed_tokens.no_grad();
        }
        self
    }

    pub fn adapters(&self) -> AdapterStack<B> {
        AdapterStack { layers: self.decoder.layers.iter().map(DecoderBlock::adapters).collect() }
    }

    pub fn with_adapters(mut self, stack: AdapterStack<B>) -> Self {
        self.decoder.layers = self
            .decoder
            .layers
            .into_iter()
            .zip(stack.layers)
            .map(|(layer, adapters)| layer.with_adapters(adapters))
            .collect();
        self
    }

    /// Everything a checkpoint stores: adapters, embeddings, score head.
    pub fn trainable_state(&self) -> TrainableState<B> {
        TrainableState {
            embed_tokens: self.decoder.embed_tokens.clone(),
            score:        self.score.clone(),
            adapters:     self.adapters(),
        }
    }

    pub fn load_trainable_state(mut self, state: TrainableState<B>) -> Self {
        self.decoder.embed_tokens = state.embed_tokens;
        self.score = state.score;
        self.with_adapters(state.adapters)
    }

    /// Fold every adapter into its base projection for inference.
    pub fn merge_adapters(mut self) -> Self {
        self.decoder.layers = self.decoder.layers.into_iter().map(DecoderBlock::merge).collect();
        self
    }
}

// ─── Trainable state ────────────────────────────────────────

#[derive(Module, Debug)]
pub struct LayerAdapters<B: Backend> {
    pub q_proj:    Option<LoraAdapter<B>>,
    pub k_proj:    Option<LoraAdapter<B>>,
    pub v_proj:    Option<LoraAdapter<B>>,
    pub o_proj:    Option<LoraAdapter<B>>,
    pub gate_proj: Option<LoraAdapter<B>>,
    pub up_proj:   Option<LoraAdapter<B>>,
    pub down_proj: Option<LoraAdapter<B>>,
}

#[derive(Module, Debug)]
pub struct AdapterStack<B: Backend> {
    pub layers: Vec<LayerAdapters<B>>,
}

#[derive(Module, Debug)]
pub struct TrainableState<B: Backend> {
    pub embed_tokens: Embedding<B>,
    pub score:        Linear<B>,
    pub adapters:     AdapterStack<B>,
}

// ─── Parameter summary ──────────────────────────────────────

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ParamSummary {
    pub total:     usize,
    pub trainable: usize,
}

impl ParamSummary {
    pub fn trainable_percent(&self) -> f64 {
        if self.total == 0 { 0.0 } else { 100.0 * self.trainable as f64 / self.total as f64 }
    }
}

struct ParamCounter {
    summary: ParamSummary,
}

impl<B: Backend> burn::module::ModuleVisitor<B> for ParamCounter {
    fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
        let n = tensor.shape().num_elements();
        let trainable = tensor.is_require_grad();
        self.summary.total += n;
        if trainable {
            self.summary.trainable += n;
        }
        tracing::trace!("param {id:?} {:?} requires_grad={trainable}", tensor.dims());
    }
}

/// Count all and trainable parameters, logging each one at trace level.
pub fn parameter_summary<B: Backend, M: Module<B>>(module: &M) -> ParamSummary {
    let mut counter = ParamCounter { summary: ParamSummary::default() };
    module.visit(&mut counter);
    counter.summary
}

// ─── Loss ───────────────────────────────────────────────────

/// Class-weighted cross entropy, optionally focal:
///
///   l_i = -w[y_i] · (1 - p_i)^γ · log p_i       loss = Σ l_i / Σ w[y_i]
///
/// Without weights every w is 1, which is the plain batch mean.
#[derive(Debug, Clone)]
pub struct ClassificationLoss<B: Backend> {
    class_weights: Option<Tensor<B, 1>>,
    focal_gamma:   Option<f64>,
}

impl<B: Backend> ClassificationLoss<B> {
    pub fn new(config: &ClassifierConfig, device: &B::Device) -> Self {
        let class_weights = config
            .class_weights
            .as_ref()
            .map(|w| Tensor::<B, 1>::from_floats(w.as_slice(), device));
        let focal_gamma = config.use_focal_loss.then_some(config.focal_loss_gamma);
        Self { class_weights, focal_gamma }
    }

    /// logits [b, c], targets [b] → scalar loss [1]
    pub fn forward(&self, logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> Tensor<B, 1> {
        let [batch_size, _] = logits.dims();
        let log_probs = log_softmax(logits, 1);
        let log_pt = log_probs
            .gather(1, targets.clone().reshape([batch_size, 1]))
            .reshape([batch_size]);

        let mut per_sample = log_pt.clone().neg();
        if let Some(gamma) = self.focal_gamma {
            let modulating = log_pt.exp().neg().add_scalar(1.0).powf_scalar(gamma);
            per_sample = per_sample * modulating;
        }

        match &self.class_weights {
            Some(weights) => {
                let w = weights.clone().gather(0, targets);
                (per_sample * w.clone()).sum() / w.sum()
            }
            None => per_sample.mean(),
        }
    }
}

/// Inverse-frequency class weights, normalised so a balanced
/// distribution gives 1.0 for every class. Missing classes get 1.0.
pub fn inverse_frequency_weights(counts: &[usize]) -> Vec<f32> {
    let total: usize = counts.iter().sum();
    let present = counts.iter().filter(|&&c| c > 0).count().max(1);
    counts
        .iter()
        .map(|&c| if c == 0 { 1.0 } else { total as f32 / (present as f32 * c as f32) })
        .collect()
}
