//! GPT-2 forward pass with per-layer capture
//!
//! Runs block by block so that hidden states and attention patterns can be
//! captured along the way. Pre-LayerNorm decoder, learned absolute positions,
//! fused QKV projection, tanh-GELU MLP, LM head tied to the token embeddings.
//!
//! Checkpoints store the projections as `Conv1D` (weight shape `[in, out]`),
//! so they are transposed once at load time into ordinary `Linear` layers.

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_nn::{embedding, Embedding, LayerNorm, Linear, VarBuilder};
use std::path::PathBuf;
use tracing::info;

use crate::attention::AttentionCache;
use crate::cache::HiddenStateCache;
use crate::masks::create_causal_mask;
use crate::model::RoleBackend;

/// Model configuration (matches HuggingFace config.json for GPT-2)
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Gpt2Config {
    pub n_embd: usize,
    pub n_head: usize,
    pub n_layer: usize,
    pub n_positions: usize,
    pub vocab_size: usize,
    #[serde(default)]
    pub n_inner: Option<usize>,
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f64,
}

fn default_layer_norm_epsilon() -> f64 {
    1e-5
}

/// `Conv1D` weights stored `[in, out]` loaded as a `Linear`
fn conv1d(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Linear> {
    let weight = vb.get((in_dim, out_dim), "weight")?.t()?.contiguous()?;
    let bias = vb.get(out_dim, "bias")?;
    Ok(Linear::new(weight, Some(bias)))
}

/// Causal self-attention with fused QKV
struct Attention {
    c_attn: Linear,
    c_proj: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn load(vb: VarBuilder, config: &Gpt2Config) -> Result<Self> {
        let c_attn = conv1d(config.n_embd, 3 * config.n_embd, vb.pp("c_attn"))?;
        let c_proj = conv1d(config.n_embd, config.n_embd, vb.pp("c_proj"))?;
        Ok(Self {
            c_attn,
            c_proj,
            num_heads: config.n_head,
            head_dim: config.n_embd / config.n_head,
        })
    }

    /// Returns (output, attention_weights) with weights `[batch, heads, seq, seq]`
    fn forward_with_attn(&self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        let (b, seq_len, d_model) = x.dims3()?;

        let qkv = self.c_attn.forward(x)?;
        let split = |i: usize| -> Result<Tensor> {
            Ok(qkv
                .narrow(2, i * d_model, d_model)?
                .reshape((b, seq_len, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()?)
        };
        let q = split(0)?;
        let k = split(1)?;
        let v = split(2)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let attn_weights = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;

        let mask = create_causal_mask(seq_len, x.device(), x.dtype())?;
        let attn_weights = attn_weights.broadcast_add(&mask)?;

        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let attn_output = attn_weights.matmul(&v)?;

        let attn_output = attn_output.transpose(1, 2)?.reshape((b, seq_len, ()))?;
        Ok((self.c_proj.forward(&attn_output)?, attn_weights))
    }
}

#[allow(clippy::upper_case_acronyms)]
struct MLP {
    c_fc: Linear,
    c_proj: Linear,
}

impl MLP {
    fn load(vb: VarBuilder, config: &Gpt2Config) -> Result<Self> {
        let inner = config.n_inner.unwrap_or(4 * config.n_embd);
        Ok(Self {
            c_fc: conv1d(config.n_embd, inner, vb.pp("c_fc"))?,
            c_proj: conv1d(inner, config.n_embd, vb.pp("c_proj"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let hidden = self.c_fc.forward(x)?.gelu()?;
        Ok(self.c_proj.forward(&hidden)?)
    }
}

struct Block {
    ln_1: LayerNorm,
    attn: Attention,
    ln_2: LayerNorm,
    mlp: MLP,
}

impl Block {
    fn load(vb: VarBuilder, config: &Gpt2Config) -> Result<Self> {
        let eps = config.layer_norm_epsilon;
        Ok(Self {
            ln_1: candle_nn::layer_norm(config.n_embd, eps, vb.pp("ln_1"))?,
            attn: Attention::load(vb.pp("attn"), config)?,
            ln_2: candle_nn::layer_norm(config.n_embd, eps, vb.pp("ln_2"))?,
            mlp: MLP::load(vb.pp("mlp"), config)?,
        })
    }

    fn forward_with_attn(&self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        let residual = x;
        let h = self.ln_1.forward(x)?;
        let (h, attn_weights) = self.attn.forward_with_attn(&h)?;
        let x = (residual + h)?;

        let residual = &x;
        let h = self.mlp.forward(&self.ln_2.forward(&x)?)?;
        Ok(((residual + h)?, attn_weights))
    }
}

/// GPT-2 language model with per-layer capture
pub struct RoleGpt2 {
    wte: Embedding,
    wpe: Embedding,
    blocks: Vec<Block>,
    ln_f: LayerNorm,
    lm_head: Linear,
    config: Gpt2Config,
}

impl RoleGpt2 {
    /// Build from a downloaded config.json and safetensors files
    pub fn load(
        config_json: &str,
        weights_paths: &[PathBuf],
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let config: Gpt2Config =
            serde_json::from_str(config_json).context("Failed to parse GPT-2 config")?;
        info!(
            "GPT-2 config: {} layers, {} hidden, {} heads, {} vocab",
            config.n_layer, config.n_embd, config.n_head, config.vocab_size
        );

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(weights_paths, dtype, device)? };
        // Hub checkpoints come both with and without the `transformer.` prefix
        let vb = if vb.contains_tensor("transformer.wte.weight") {
            vb.pp("transformer")
        } else {
            vb
        };
        let model = Self::from_var_builder(vb, config)?;
        info!("GPT-2 loaded with {} layers", model.config.n_layer);
        Ok(model)
    }

    /// Build from weights rooted at `wte`, `wpe`, `h.{i}` and `ln_f`
    pub fn from_var_builder(vb: VarBuilder, config: Gpt2Config) -> Result<Self> {
        let wte = embedding(config.vocab_size, config.n_embd, vb.pp("wte"))?;
        let wpe = embedding(config.n_positions, config.n_embd, vb.pp("wpe"))?;

        let blocks = (0..config.n_layer)
            .map(|i| Block::load(vb.pp(format!("h.{i}")), &config))
            .collect::<Result<Vec<_>>>()?;

        let ln_f = candle_nn::layer_norm(config.n_embd, config.layer_norm_epsilon, vb.pp("ln_f"))?;
        let lm_head = Linear::new(wte.embeddings().clone(), None);

        Ok(Self {
            wte,
            wpe,
            blocks,
            ln_f,
            lm_head,
            config,
        })
    }

    fn embed(&self, input_ids: &Tensor) -> Result<Tensor> {
        let seq_len = input_ids.dim(1)?;
        anyhow::ensure!(
            seq_len <= self.config.n_positions,
            "Sequence of {seq_len} tokens exceeds context window of {}",
            self.config.n_positions
        );
        let positions = Tensor::arange(0u32, seq_len as u32, input_ids.device())?.unsqueeze(0)?;
        let tokens = self.wte.forward(input_ids)?;
        let positions = self.wpe.forward(&positions)?;
        Ok(tokens.broadcast_add(&positions)?)
    }

    /// Run all blocks, handing each block's output and attention to `observe`.
    ///
    /// The last block's output is observed after the final LayerNorm, so the
    /// observed states line up with HuggingFace `hidden_states`.
    fn run(
        &self,
        input_ids: &Tensor,
        mut observe: impl FnMut(&Tensor, Tensor) -> Result<()>,
    ) -> Result<Tensor> {
        let mut hidden = self.embed(input_ids)?;
        let n_blocks = self.blocks.len();
        for (i, block) in self.blocks.iter().enumerate() {
            let (next, attn) = block.forward_with_attn(&hidden)?;
            hidden = if i + 1 == n_blocks {
                self.ln_f.forward(&next)?
            } else {
                next
            };
            observe(&hidden, attn)?;
        }
        if n_blocks == 0 {
            hidden = self.ln_f.forward(&hidden)?;
        }
        Ok(self.lm_head.forward(&hidden)?)
    }
}

impl RoleBackend for RoleGpt2 {
    fn n_layers(&self) -> usize {
        self.config.n_layer
    }

    fn d_model(&self) -> usize {
        self.config.n_embd
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn n_heads(&self) -> usize {
        self.config.n_head
    }

    fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        self.run(input_ids, |_, _| Ok(()))
    }

    fn forward_with_cache(&self, input_ids: &Tensor) -> Result<(Tensor, HiddenStateCache)> {
        let mut cache = HiddenStateCache::with_capacity(self.config.n_layer + 1);
        cache.push(self.embed(input_ids)?.i(0)?);
        let logits = self.run(input_ids, |hidden, _| {
            cache.push(hidden.i(0)?);
            Ok(())
        })?;
        Ok((logits, cache))
    }

    fn forward_with_attention(&self, input_ids: &Tensor) -> Result<(Tensor, AttentionCache)> {
        let mut attn_cache = AttentionCache::with_capacity(self.config.n_layer);
        let logits = self.run(input_ids, |_, attn| {
            attn_cache.push(attn);
            Ok(())
        })?;
        Ok((logits, attn_cache))
    }
}
