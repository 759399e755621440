//! BERT / RoBERTa masked-LM forward pass with per-layer capture
//!
//! Post-LayerNorm encoder with bidirectional attention. The two families
//! share the encoder and differ in weight prefixes, the MLM head layout, and
//! RoBERTa's position offset (positions start after the padding index).

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_nn::{embedding, linear, Embedding, LayerNorm, Linear, VarBuilder};
use std::path::PathBuf;
use tracing::info;

use crate::attention::AttentionCache;
use crate::cache::HiddenStateCache;
use crate::model::RoleBackend;

/// Model configuration (matches HuggingFace config.json for BERT and RoBERTa)
#[derive(Debug, Clone, serde::Deserialize)]
pub struct BertConfig {
    pub model_type: String,
    pub hidden_size: usize,
    pub num_attention_heads: usize,
    pub num_hidden_layers: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    pub max_position_embeddings: usize,
    #[serde(default = "default_type_vocab_size")]
    pub type_vocab_size: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default)]
    pub pad_token_id: usize,
}

fn default_type_vocab_size() -> usize {
    2
}

fn default_layer_norm_eps() -> f64 {
    1e-12
}

impl BertConfig {
    fn is_roberta(&self) -> bool {
        self.model_type == "roberta"
    }

    /// First position id; RoBERTa counts from `pad_token_id + 1`
    fn position_offset(&self) -> u32 {
        if self.is_roberta() {
            self.pad_token_id as u32 + 1
        } else {
            0
        }
    }
}

/// LayerNorm stored either as weight/bias or as the older gamma/beta
fn layer_norm(size: usize, eps: f64, vb: VarBuilder) -> Result<LayerNorm> {
    let (weight, bias) = match (vb.get(size, "weight"), vb.get(size, "bias")) {
        (Ok(weight), Ok(bias)) => (weight, bias),
        (Err(err), _) | (_, Err(err)) => match (vb.get(size, "gamma"), vb.get(size, "beta")) {
            (Ok(weight), Ok(bias)) => (weight, bias),
            _ => return Err(err.into()),
        },
    };
    Ok(LayerNorm::new(weight, bias, eps))
}

struct Embeddings {
    word_embeddings: Embedding,
    position_embeddings: Embedding,
    token_type_embeddings: Embedding,
    layer_norm: LayerNorm,
    position_offset: u32,
}

impl Embeddings {
    fn load(vb: VarBuilder, config: &BertConfig) -> Result<Self> {
        Ok(Self {
            word_embeddings: embedding(
                config.vocab_size,
                config.hidden_size,
                vb.pp("word_embeddings"),
            )?,
            position_embeddings: embedding(
                config.max_position_embeddings,
                config.hidden_size,
                vb.pp("position_embeddings"),
            )?,
            token_type_embeddings: embedding(
                config.type_vocab_size,
                config.hidden_size,
                vb.pp("token_type_embeddings"),
            )?,
            layer_norm: layer_norm(config.hidden_size, config.layer_norm_eps, vb.pp("LayerNorm"))?,
            position_offset: config.position_offset(),
        })
    }

    fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let seq_len = input_ids.dim(1)? as u32;
        let device = input_ids.device();
        let positions = Tensor::arange(self.position_offset, self.position_offset + seq_len, device)?
            .unsqueeze(0)?;
        let token_types = input_ids.zeros_like()?;

        let x = self.word_embeddings.forward(input_ids)?;
        let x = x.broadcast_add(&self.position_embeddings.forward(&positions)?)?;
        let x = (x + self.token_type_embeddings.forward(&token_types)?)?;
        Ok(self.layer_norm.forward(&x)?)
    }
}

/// Bidirectional self-attention with output projection and residual norm
struct Attention {
    query: Linear,
    key: Linear,
    value: Linear,
    output: Linear,
    output_norm: LayerNorm,
    num_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn load(vb: VarBuilder, config: &BertConfig) -> Result<Self> {
        let h = config.hidden_size;
        let self_vb = vb.pp("self");
        let out_vb = vb.pp("output");
        Ok(Self {
            query: linear(h, h, self_vb.pp("query"))?,
            key: linear(h, h, self_vb.pp("key"))?,
            value: linear(h, h, self_vb.pp("value"))?,
            output: linear(h, h, out_vb.pp("dense"))?,
            output_norm: layer_norm(h, config.layer_norm_eps, out_vb.pp("LayerNorm"))?,
            num_heads: config.num_attention_heads,
            head_dim: h / config.num_attention_heads,
        })
    }

    fn forward_with_attn(&self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        let (b, seq_len, _) = x.dims3()?;
        let heads = |t: Tensor| -> Result<Tensor> {
            Ok(t.reshape((b, seq_len, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()?)
        };
        let q = heads(self.query.forward(x)?)?;
        let k = heads(self.key.forward(x)?)?;
        let v = heads(self.value.forward(x)?)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let attn_weights = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let attn_output = attn_weights.matmul(&v)?;

        let attn_output = attn_output.transpose(1, 2)?.reshape((b, seq_len, ()))?;
        let projected = self.output.forward(&attn_output)?;
        let out = self.output_norm.forward(&(projected + x)?)?;
        Ok((out, attn_weights))
    }
}

struct Layer {
    attention: Attention,
    intermediate: Linear,
    output: Linear,
    output_norm: LayerNorm,
}

impl Layer {
    fn load(vb: VarBuilder, config: &BertConfig) -> Result<Self> {
        let h = config.hidden_size;
        Ok(Self {
            attention: Attention::load(vb.pp("attention"), config)?,
            intermediate: linear(h, config.intermediate_size, vb.pp("intermediate").pp("dense"))?,
            output: linear(config.intermediate_size, h, vb.pp("output").pp("dense"))?,
            output_norm: layer_norm(h, config.layer_norm_eps, vb.pp("output").pp("LayerNorm"))?,
        })
    }

    fn forward_with_attn(&self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        let (x, attn_weights) = self.attention.forward_with_attn(x)?;
        let h = self.intermediate.forward(&x)?.gelu_erf()?;
        let h = self.output.forward(&h)?;
        Ok((self.output_norm.forward(&(h + x)?)?, attn_weights))
    }
}

/// Transform + tied decoder over the vocabulary
struct MlmHead {
    dense: Linear,
    norm: LayerNorm,
    decoder: Linear,
}

impl MlmHead {
    fn load(vb: VarBuilder, config: &BertConfig, word_embeddings: &Tensor) -> Result<Self> {
        let h = config.hidden_size;
        let eps = config.layer_norm_eps;
        let (dense, norm, bias) = if config.is_roberta() {
            let head = vb.pp("lm_head");
            (
                linear(h, h, head.pp("dense"))?,
                layer_norm(h, eps, head.pp("layer_norm"))?,
                head.get(config.vocab_size, "bias")?,
            )
        } else {
            let predictions = vb.pp("cls").pp("predictions");
            let transform = predictions.pp("transform");
            (
                linear(h, h, transform.pp("dense"))?,
                layer_norm(h, eps, transform.pp("LayerNorm"))?,
                predictions.get(config.vocab_size, "bias")?,
            )
        };
        Ok(Self {
            dense,
            norm,
            decoder: Linear::new(word_embeddings.clone(), Some(bias)),
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.dense.forward(x)?.gelu_erf()?;
        let h = self.norm.forward(&h)?;
        Ok(self.decoder.forward(&h)?)
    }
}

/// Masked language model with per-layer capture
pub struct RoleBert {
    embeddings: Embeddings,
    layers: Vec<Layer>,
    head: MlmHead,
    config: BertConfig,
}

impl RoleBert {
    /// Build from a downloaded config.json and safetensors files
    pub fn load(
        config_json: &str,
        weights_paths: &[PathBuf],
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let config: BertConfig =
            serde_json::from_str(config_json).context("Failed to parse encoder config")?;
        info!(
            "{} config: {} layers, {} hidden, {} heads, {} vocab",
            config.model_type,
            config.num_hidden_layers,
            config.hidden_size,
            config.num_attention_heads,
            config.vocab_size
        );

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(weights_paths, dtype, device)? };
        let base = if config.is_roberta() { "roberta" } else { "bert" };
        let encoder_vb = if vb.contains_tensor(&format!("{base}.embeddings.word_embeddings.weight"))
        {
            vb.pp(base)
        } else {
            vb.clone()
        };

        let embeddings = Embeddings::load(encoder_vb.pp("embeddings"), &config)?;
        let layers = (0..config.num_hidden_layers)
            .map(|i| Layer::load(encoder_vb.pp(format!("encoder.layer.{i}")), &config))
            .collect::<Result<Vec<_>>>()?;
        let head = MlmHead::load(vb, &config, embeddings.word_embeddings.embeddings())
            .context("Checkpoint has no masked-LM head")?;

        info!("{} loaded with {} layers", config.model_type, config.num_hidden_layers);

        Ok(Self {
            embeddings,
            layers,
            head,
            config,
        })
    }

    fn check_length(&self, input_ids: &Tensor) -> Result<()> {
        let seq_len = input_ids.dim(1)?;
        let limit = self.config.max_position_embeddings - self.embeddings.position_offset as usize;
        anyhow::ensure!(
            seq_len <= limit,
            "Sequence of {seq_len} tokens exceeds context window of {limit}"
        );
        Ok(())
    }

    fn run(
        &self,
        input_ids: &Tensor,
        mut observe: impl FnMut(&Tensor, Tensor) -> Result<()>,
    ) -> Result<Tensor> {
        self.check_length(input_ids)?;
        let mut hidden = self.embeddings.forward(input_ids)?;
        for layer in &self.layers {
            let (next, attn) = layer.forward_with_attn(&hidden)?;
            hidden = next;
            observe(&hidden, attn)?;
        }
        self.head.forward(&hidden)
    }
}

impl RoleBackend for RoleBert {
    fn n_layers(&self) -> usize {
        self.config.num_hidden_layers
    }

    fn d_model(&self) -> usize {
        self.config.hidden_size
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn n_heads(&self) -> usize {
        self.config.num_attention_heads
    }

    fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        self.run(input_ids, |_, _| Ok(()))
    }

    fn forward_with_cache(&self, input_ids: &Tensor) -> Result<(Tensor, HiddenStateCache)> {
        self.check_length(input_ids)?;
        let mut cache = HiddenStateCache::with_capacity(self.config.num_hidden_layers + 1);
        cache.push(self.embeddings.forward(input_ids)?.i(0)?);
        let logits = self.run(input_ids, |hidden, _| {
            cache.push(hidden.i(0)?);
            Ok(())
        })?;
        Ok((logits, cache))
    }

    fn forward_with_attention(&self, input_ids: &Tensor) -> Result<(Tensor, AttentionCache)> {
        let mut attn_cache = AttentionCache::with_capacity(self.config.num_hidden_layers);
        let logits = self.run(input_ids, |_, attn| {
            attn_cache.push(attn);
            Ok(())
        })?;
        Ok((logits, attn_cache))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roberta_position_offset() {
        let json = r#"{"model_type": "roberta", "hidden_size": 768, "num_attention_heads": 12,
                       "num_hidden_layers": 12, "intermediate_size": 3072, "vocab_size": 50265,
                       "max_position_embeddings": 514, "type_vocab_size": 1,
                       "layer_norm_eps": 1e-5, "pad_token_id": 1}"#;
        let config: BertConfig = serde_json::from_str(json).unwrap();
        assert!(config.is_roberta());
        assert_eq!(config.position_offset(), 2);
    }

    #[test]
    fn test_bert_defaults() {
        let json = r#"{"model_type": "bert", "hidden_size": 768, "num_attention_heads": 12,
                       "num_hidden_layers": 12, "intermediate_size": 3072, "vocab_size": 30522,
                       "max_position_embeddings": 512}"#;
        let config: BertConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.position_offset(), 0);
        assert_eq!(config.type_vocab_size, 2);
        assert_eq!(config.layer_norm_eps, 1e-12);
    }
}
