//! LLaMA forward pass with a residual-stream injection point
//!
//! Runs layer-by-layer so the hidden state after any decoder layer can be
//! read (source pass) or replaced on a span of positions (intervened pass).
//!
//! Every op on the path from the injection layer to the logits has a
//! backward pass in candle, so gradients reach the alignment parameters:
//! - RMSNorm is written out with elementwise ops (computed in f32)
//! - softmax is the generic `candle_nn::ops::softmax`
//! - no KV-cache; generation re-runs the full sequence
//!
//! Pretrained weights come out of the `VarBuilder` as plain tensors, never
//! `Var`s, so the frozen model contributes no trainable parameters.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{embedding, linear_no_bias, Embedding, Linear, VarBuilder};
use rand::{Rng, SeedableRng};
use tracing::info;

use crate::masks::create_causal_mask;
use crate::model::{AlignableBackend, Injection, ModelFamily, ModelSource};

/// Model configuration (matches HuggingFace config.json for LLaMA)
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct LlamaConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    pub num_hidden_layers: usize,
    pub vocab_size: usize,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub tie_word_embeddings: bool,
}

fn default_rope_theta() -> f64 {
    10_000.0
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_max_position_embeddings() -> usize {
    2048
}

impl LlamaConfig {
    fn kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.num_attention_heads > 0 && self.hidden_size % self.num_attention_heads == 0,
            "hidden_size {} not divisible by {} heads",
            self.hidden_size,
            self.num_attention_heads
        );
        anyhow::ensure!(
            self.kv_heads() > 0 && self.num_attention_heads % self.kv_heads() == 0,
            "{} heads not divisible by {} key/value heads",
            self.num_attention_heads,
            self.kv_heads()
        );
        anyhow::ensure!(self.head_dim() % 2 == 0, "Head dim must be even for RoPE");
        Ok(())
    }
}

/// Rotary Position Embeddings (RoPE), HF "rotate half" layout
struct RotaryEmbedding {
    /// `[max_seq_len, head_dim]`
    cos: Tensor,
    sin: Tensor,
}

impl RotaryEmbedding {
    fn new(
        dim: usize,
        max_seq_len: usize,
        theta: f64,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let inv_freq: Vec<f32> = (0..dim)
            .step_by(2)
            .map(|i| (1.0 / theta.powf(i as f64 / dim as f64)) as f32)
            .collect();
        let n_freq = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, n_freq), device)?;

        let positions: Vec<f32> = (0..max_seq_len).map(|i| i as f32).collect();
        let positions = Tensor::from_vec(positions, (max_seq_len, 1), device)?;

        // [seq_len, dim/2] -> [seq_len, dim]
        let freqs = positions.matmul(&inv_freq)?;
        let freqs = Tensor::cat(&[&freqs, &freqs], D::Minus1)?;

        Ok(Self {
            cos: freqs.cos()?.to_dtype(dtype)?,
            sin: freqs.sin()?.to_dtype(dtype)?,
        })
    }

    fn apply(&self, q: &Tensor, k: &Tensor) -> Result<(Tensor, Tensor)> {
        let seq_len = q.dim(2)?;
        let cos = self.cos.narrow(0, 0, seq_len)?;
        let sin = self.sin.narrow(0, 0, seq_len)?;
        Ok((
            apply_rotary_emb(q, &cos, &sin)?,
            apply_rotary_emb(k, &cos, &sin)?,
        ))
    }
}

fn rotate_half(x: &Tensor) -> Result<Tensor> {
    let half = x.dim(D::Minus1)? / 2;
    let x1 = x.narrow(D::Minus1, 0, half)?;
    let x2 = x.narrow(D::Minus1, half, half)?;
    Ok(Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)?)
}

fn apply_rotary_emb(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    let cos = cos.unsqueeze(0)?.unsqueeze(0)?;
    let sin = sin.unsqueeze(0)?.unsqueeze(0)?;
    Ok((x.broadcast_mul(&cos)? + rotate_half(x)?.broadcast_mul(&sin)?)?)
}

/// RMSNorm from elementwise ops so it stays differentiable
struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    fn load(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            weight: vb.get(size, "weight")?,
            eps,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;
        let mean_sq = x.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = x.broadcast_div(&(mean_sq + self.eps)?.sqrt()?)?;
        Ok(normed.to_dtype(dtype)?.broadcast_mul(&self.weight)?)
    }
}

/// Multi-head attention (no bias on any projection)
struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn load(vb: VarBuilder, config: &LlamaConfig) -> Result<Self> {
        let head_dim = config.head_dim();
        let kv_heads = config.kv_heads();
        Ok(Self {
            q_proj: linear_no_bias(
                config.hidden_size,
                config.num_attention_heads * head_dim,
                vb.pp("q_proj"),
            )?,
            k_proj: linear_no_bias(config.hidden_size, kv_heads * head_dim, vb.pp("k_proj"))?,
            v_proj: linear_no_bias(config.hidden_size, kv_heads * head_dim, vb.pp("v_proj"))?,
            o_proj: linear_no_bias(
                config.num_attention_heads * head_dim,
                config.hidden_size,
                vb.pp("o_proj"),
            )?,
            num_heads: config.num_attention_heads,
            num_kv_heads: kv_heads,
            head_dim,
        })
    }

    fn forward(&self, x: &Tensor, rotary: &RotaryEmbedding) -> Result<Tensor> {
        let (b, seq_len, _) = x.dims3()?;

        let q = self
            .q_proj
            .forward(x)?
            .reshape((b, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = self
            .k_proj
            .forward(x)?
            .reshape((b, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = self
            .v_proj
            .forward(x)?
            .reshape((b, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;

        let (q, k) = rotary.apply(&q, &k)?;

        // Expand KV heads for grouped query attention
        let n_rep = self.num_heads / self.num_kv_heads;
        let k = repeat_kv(k, n_rep)?.contiguous()?;
        let v = repeat_kv(v, n_rep)?.contiguous()?;
        let q = q.contiguous()?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let attn_weights = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;

        let mask = create_causal_mask(seq_len, x.device(), attn_weights.dtype())?;
        let attn_weights = attn_weights.broadcast_add(&mask)?;
        let attn_weights = candle_nn::ops::softmax(&attn_weights, D::Minus1)?;
        let attn_output = attn_weights.matmul(&v)?;

        let attn_output = attn_output.transpose(1, 2)?.reshape((b, seq_len, ()))?;
        Ok(self.o_proj.forward(&attn_output)?)
    }
}

fn repeat_kv(x: Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x);
    }
    let (b, num_kv_heads, seq_len, head_dim) = x.dims4()?;
    let x = x.unsqueeze(2)?;
    let x = x.expand((b, num_kv_heads, n_rep, seq_len, head_dim))?;
    Ok(x.reshape((b, num_kv_heads * n_rep, seq_len, head_dim))?)
}

/// MLP block (LLaMA style - SwiGLU, no bias)
#[allow(clippy::upper_case_acronyms)]
struct MLP {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl MLP {
    fn load(vb: VarBuilder, config: &LlamaConfig) -> Result<Self> {
        Ok(Self {
            gate_proj: linear_no_bias(
                config.hidden_size,
                config.intermediate_size,
                vb.pp("gate_proj"),
            )?,
            up_proj: linear_no_bias(
                config.hidden_size,
                config.intermediate_size,
                vb.pp("up_proj"),
            )?,
            down_proj: linear_no_bias(
                config.intermediate_size,
                config.hidden_size,
                vb.pp("down_proj"),
            )?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // SwiGLU: down(silu(gate(x)) * up(x))
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(x)?)?;
        let up = self.up_proj.forward(x)?;
        Ok(self.down_proj.forward(&(gate * up)?)?)
    }
}

struct DecoderLayer {
    self_attn: Attention,
    mlp: MLP,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl DecoderLayer {
    fn load(vb: VarBuilder, config: &LlamaConfig) -> Result<Self> {
        Ok(Self {
            self_attn: Attention::load(vb.pp("self_attn"), config)?,
            mlp: MLP::load(vb.pp("mlp"), config)?,
            input_layernorm: RmsNorm::load(
                config.hidden_size,
                config.rms_norm_eps,
                vb.pp("input_layernorm"),
            )?,
            post_attention_layernorm: RmsNorm::load(
                config.hidden_size,
                config.rms_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
        })
    }

    fn forward(&self, x: &Tensor, rotary: &RotaryEmbedding) -> Result<Tensor> {
        let residual = x;
        let h = self.input_layernorm.forward(x)?;
        let h = self.self_attn.forward(&h, rotary)?;
        let x = (residual + h)?;

        let residual = &x;
        let h = self.post_attention_layernorm.forward(&x)?;
        let h = self.mlp.forward(&h)?;
        Ok((residual + h)?)
    }
}

/// Safetensors index for sharded models
#[derive(Debug, serde::Deserialize)]
struct SafetensorsIndex {
    weight_map: HashMap<String, String>,
}

/// Frozen LLaMA with a residual-stream injection point
pub struct AlignableLlama {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    lm_head: Linear,
    rotary: RotaryEmbedding,
    config: LlamaConfig,
    dtype: DType,
}

impl AlignableLlama {
    /// Load from a HuggingFace repo id or a local model directory
    pub fn load(model_id: &str, device: &Device, dtype: DType) -> Result<Self> {
        info!("Loading LLaMA from: {}", model_id);
        let source = ModelSource::open(model_id)?;

        let config_path = source.get("config.json")?;
        let config_str = std::fs::read_to_string(&config_path).context("Failed to read config")?;
        let config: LlamaConfig = serde_json::from_str(&config_str)?;

        info!(
            "Model config: {} layers, {} hidden, {} vocab",
            config.num_hidden_layers, config.hidden_size, config.vocab_size
        );

        let weights_paths: Vec<PathBuf> =
            if let Ok(index_path) = source.get("model.safetensors.index.json") {
                info!("Model is sharded, loading index...");
                let index_str =
                    std::fs::read_to_string(&index_path).context("Failed to read index")?;
                let index: SafetensorsIndex = serde_json::from_str(&index_str)?;

                let mut shard_names: Vec<String> = index.weight_map.values().cloned().collect();
                shard_names.sort();
                shard_names.dedup();

                info!("Fetching {} shard files...", shard_names.len());
                shard_names
                    .iter()
                    .map(|name| source.get(name))
                    .collect::<Result<_>>()?
            } else {
                vec![source.get("model.safetensors")?]
            };

        info!("Loading weights from {} file(s)...", weights_paths.len());
        // SAFETY: the weight files are not modified while mapped
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&weights_paths, dtype, device)? };
        Self::from_varbuilder(vb, config, dtype)
    }

    /// Build with seeded random weights (smoke runs and tests)
    pub fn random(config: LlamaConfig, seed: u64, device: &Device) -> Result<Self> {
        config.validate()?;
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let mut uniform = |shape: (usize, usize)| -> Result<Tensor> {
            let scale = 1.0 / (shape.1 as f32).sqrt();
            let values: Vec<f32> = (0..shape.0 * shape.1)
                .map(|_| rng.gen_range(-scale..scale))
                .collect();
            Ok(Tensor::from_vec(values, shape, device)?)
        };

        let h = config.hidden_size;
        let kv = config.kv_heads() * config.head_dim();
        let ones = Tensor::ones(h, DType::F32, device)?;
        let mut tensors = HashMap::new();
        tensors.insert(
            "model.embed_tokens.weight".to_string(),
            uniform((config.vocab_size, h))?,
        );
        for i in 0..config.num_hidden_layers {
            let p = format!("model.layers.{i}");
            tensors.insert(format!("{p}.self_attn.q_proj.weight"), uniform((h, h))?);
            tensors.insert(format!("{p}.self_attn.k_proj.weight"), uniform((kv, h))?);
            tensors.insert(format!("{p}.self_attn.v_proj.weight"), uniform((kv, h))?);
            tensors.insert(format!("{p}.self_attn.o_proj.weight"), uniform((h, h))?);
            tensors.insert(
                format!("{p}.mlp.gate_proj.weight"),
                uniform((config.intermediate_size, h))?,
            );
            tensors.insert(
                format!("{p}.mlp.up_proj.weight"),
                uniform((config.intermediate_size, h))?,
            );
            tensors.insert(
                format!("{p}.mlp.down_proj.weight"),
                uniform((h, config.intermediate_size))?,
            );
            tensors.insert(format!("{p}.input_layernorm.weight"), ones.clone());
            tensors.insert(format!("{p}.post_attention_layernorm.weight"), ones.clone());
        }
        tensors.insert("model.norm.weight".to_string(), ones);
        if !config.tie_word_embeddings {
            tensors.insert("lm_head.weight".to_string(), uniform((config.vocab_size, h))?);
        }

        let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
        Self::from_varbuilder(vb, config, DType::F32)
    }

    fn from_varbuilder(vb: VarBuilder, config: LlamaConfig, dtype: DType) -> Result<Self> {
        config.validate()?;
        let device = vb.device().clone();
        let vb_model = vb.pp("model");

        let embed_tokens = embedding(
            config.vocab_size,
            config.hidden_size,
            vb_model.pp("embed_tokens"),
        )?;

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            if (i + 1) % 10 == 0 || i == 0 {
                info!("Loading layer {}/{}", i + 1, config.num_hidden_layers);
            }
            layers.push(DecoderLayer::load(vb_model.pp(format!("layers.{i}")), &config)?);
        }

        let norm = RmsNorm::load(config.hidden_size, config.rms_norm_eps, vb_model.pp("norm"))?;

        let lm_head = if config.tie_word_embeddings {
            Linear::new(embed_tokens.embeddings().clone(), None)
        } else {
            linear_no_bias(config.hidden_size, config.vocab_size, vb.pp("lm_head"))?
        };

        let rotary = RotaryEmbedding::new(
            config.head_dim(),
            config.max_position_embeddings,
            config.rope_theta,
            &device,
            dtype,
        )?;

        info!(
            "Model loaded with {} layers (vocab_size: {})",
            config.num_hidden_layers, config.vocab_size
        );

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            rotary,
            config,
            dtype,
        })
    }

    pub fn config(&self) -> &LlamaConfig {
        &self.config
    }

    fn check_length(&self, input_ids: &Tensor) -> Result<()> {
        let seq_len = input_ids.dim(1)?;
        anyhow::ensure!(
            seq_len <= self.config.max_position_embeddings,
            "Sequence length {seq_len} exceeds max position embeddings {}",
            self.config.max_position_embeddings
        );
        Ok(())
    }
}

impl AlignableBackend for AlignableLlama {
    fn family(&self) -> ModelFamily {
        ModelFamily::DecoderOnly
    }

    fn n_layers(&self) -> usize {
        self.config.num_hidden_layers
    }

    fn d_model(&self) -> usize {
        self.config.hidden_size
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn max_seq_len(&self) -> usize {
        self.config.max_position_embeddings
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn forward_hidden_states(&self, input_ids: &Tensor, up_to_layer: usize) -> Result<Vec<Tensor>> {
        anyhow::ensure!(
            up_to_layer < self.layers.len(),
            "Layer {up_to_layer} out of range ({} layers)",
            self.layers.len()
        );
        self.check_length(input_ids)?;

        let mut hidden = self.embed_tokens.forward(input_ids)?;
        let mut states = Vec::with_capacity(up_to_layer + 1);
        for layer in &self.layers[..=up_to_layer] {
            hidden = layer.forward(&hidden, &self.rotary)?;
            states.push(hidden.clone());
        }
        Ok(states)
    }

    fn forward_with_injection(
        &self,
        input_ids: &Tensor,
        _decoder_targets: Option<&Tensor>,
        injection: Option<&Injection<'_>>,
    ) -> Result<Tensor> {
        self.check_length(input_ids)?;

        let mut hidden = self.embed_tokens.forward(input_ids)?;
        for (i, layer) in self.layers.iter().enumerate() {
            hidden = layer.forward(&hidden, &self.rotary)?;
            if let Some(injection) = injection.filter(|inj| inj.layer == i) {
                hidden = injection.apply(&hidden)?;
            }
        }

        let output = self.norm.forward(&hidden)?;
        Ok(self.lm_head.forward(&output)?.to_dtype(DType::F32)?)
    }
}
