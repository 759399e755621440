//! RoleModel wrapper for surprisal scoring and activation extraction
//!
//! Supports autoregressive (GPT-2) and masked (BERT, RoBERTa) backends
//! with a unified interface. The model family is decided once at load time
//! from the checkpoint's `config.json` and drives every family-specific
//! choice downstream: how tokens are scored, how sentences are pooled, and
//! which words make up a cloze completion.

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Tensor, D};
use hf_hub::{api::sync::Api, api::sync::ApiRepo, Repo, RepoType};
use std::path::PathBuf;
use tokenizers::{Encoding, Tokenizer};
use tracing::{debug, info};

use crate::alignment::{ScoredToken, TokenSurprisal};
use crate::attention::AttentionCache;
use crate::cache::HiddenStateCache;
use crate::config::ScoringConfig;
use crate::forward_bert::RoleBert;
use crate::forward_gpt2::RoleGpt2;
use crate::positioning::EncodingWithOffsets;
use crate::scorer::TokenScorer;
use crate::surprisal::ClozeSpan;

/// How a model assigns probability to a token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    /// Left-to-right language model (GPT-2)
    Autoregressive,
    /// Masked language model (BERT, RoBERTa), scored by pseudo-log-likelihood
    Masked,
}

impl ModelFamily {
    /// Map a HuggingFace `model_type` to a family
    pub fn from_model_type(model_type: &str) -> Result<Self> {
        match model_type {
            "gpt2" => Ok(Self::Autoregressive),
            "bert" | "roberta" => Ok(Self::Masked),
            other => anyhow::bail!(
                "Unsupported model_type '{other}' (expected gpt2, bert or roberta)"
            ),
        }
    }

    /// Which trailing words form a cloze completion for this family
    pub fn cloze_span(self) -> ClozeSpan {
        match self {
            Self::Masked => ClozeSpan::WordOnly,
            Self::Autoregressive => ClozeSpan::WordAndTerminal,
        }
    }

    /// Whether tokenizer special tokens ([CLS], [SEP]) belong in the input
    pub fn adds_special_tokens(self) -> bool {
        matches!(self, Self::Masked)
    }
}

/// Unified backend trait for all model architectures.
pub trait RoleBackend {
    // --- Metadata ---
    fn n_layers(&self) -> usize;
    fn d_model(&self) -> usize;
    fn vocab_size(&self) -> usize;
    fn n_heads(&self) -> usize;

    // --- Forward passes ---

    /// Logits `[batch, seq, vocab]`
    fn forward(&self, input_ids: &Tensor) -> Result<Tensor>;
    /// Logits plus hidden states of the first batch row, embeddings included
    fn forward_with_cache(&self, input_ids: &Tensor) -> Result<(Tensor, HiddenStateCache)>;
    /// Logits plus attention weights of every layer
    fn forward_with_attention(&self, input_ids: &Tensor) -> Result<(Tensor, AttentionCache)>;
}

#[derive(Debug, serde::Deserialize)]
struct ModelTypeProbe {
    model_type: String,
}

/// Safetensors index for sharded models
#[derive(Debug, serde::Deserialize)]
struct SafetensorsIndex {
    weight_map: std::collections::HashMap<String, String>,
}

/// Download the weight files, sharded or single
fn fetch_weights(repo: &ApiRepo) -> Result<Vec<PathBuf>> {
    if let Ok(index_path) = repo.get("model.safetensors.index.json") {
        info!("Model is sharded, loading index...");
        let index_str = std::fs::read_to_string(&index_path).context("Failed to read index")?;
        let index: SafetensorsIndex = serde_json::from_str(&index_str)?;

        let mut shard_names: Vec<String> = index.weight_map.values().cloned().collect();
        shard_names.sort();
        shard_names.dedup();

        shard_names
            .iter()
            .map(|name| {
                repo.get(name)
                    .with_context(|| format!("Failed to download {name}"))
            })
            .collect()
    } else {
        let path = repo
            .get("model.safetensors")
            .context("Failed to download model.safetensors")?;
        Ok(vec![path])
    }
}

/// Whether the tokenizer folds case (uncased WordPiece vocabularies)
fn tokenizer_folds_case(tokenizer: &Tokenizer) -> bool {
    tokenizer
        .encode("A", false)
        .ok()
        .and_then(|enc| enc.get_tokens().first().cloned())
        .is_some_and(|token| token == "a")
}

/// High-level model wrapper for role-reversal experiments
pub struct RoleModel {
    model: Box<dyn RoleBackend>,
    tokenizer: Tokenizer,
    device: Device,
    family: ModelFamily,
    model_id: String,
    lowercase: bool,
    prepend_bos: bool,
}

impl RoleModel {
    /// Load a model from HuggingFace (tries CUDA, falls back to CPU)
    pub fn from_pretrained(model_id: &str) -> Result<Self> {
        Self::from_pretrained_with_device(model_id, None)
    }

    /// Load from a scoring configuration
    pub fn from_config(config: &ScoringConfig) -> Result<Self> {
        Ok(
            Self::from_pretrained_with_device(&config.model_id, Some(config.force_cpu))?
                .with_prepend_bos(config.prepend_bos),
        )
    }

    /// Load with explicit device choice (None = auto-detect)
    ///
    /// The model family is read from the checkpoint's config.json.
    pub fn from_pretrained_with_device(model_id: &str, force_cpu: Option<bool>) -> Result<Self> {
        let device = if force_cpu == Some(true) {
            info!("Forcing CPU mode");
            Device::Cpu
        } else {
            match Device::cuda_if_available(0) {
                Ok(dev) if dev.is_cuda() => {
                    info!("Using CUDA device");
                    dev
                }
                _ => {
                    info!("CUDA not available, using CPU");
                    Device::Cpu
                }
            }
        };
        // Scoring compares small log-probability differences; keep full precision
        let dtype = DType::F32;

        info!("Loading model: {}", model_id);

        let api = Api::new()?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));

        let config_path = repo
            .get("config.json")
            .context("Failed to download config.json")?;
        let config_json = std::fs::read_to_string(&config_path).context("Failed to read config")?;
        let probe: ModelTypeProbe =
            serde_json::from_str(&config_json).context("config.json has no model_type")?;
        let family = ModelFamily::from_model_type(&probe.model_type)?;
        info!("Family: {:?} ({})", family, probe.model_type);

        let tokenizer_path = repo
            .get("tokenizer.json")
            .context("Failed to download tokenizer.json")?;
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("Tokenizer error: {e}"))?;

        let weights_paths = fetch_weights(&repo)?;
        info!("Loading weights from {} file(s)...", weights_paths.len());

        let model: Box<dyn RoleBackend> = match family {
            ModelFamily::Autoregressive => {
                Box::new(RoleGpt2::load(&config_json, &weights_paths, &device, dtype)?)
            }
            ModelFamily::Masked => {
                Box::new(RoleBert::load(&config_json, &weights_paths, &device, dtype)?)
            }
        };

        let lowercase =
            model_id.to_lowercase().contains("uncased") || tokenizer_folds_case(&tokenizer);
        if lowercase {
            info!("Uncased vocabulary: input text will be lower-cased");
        }

        Ok(Self {
            model,
            tokenizer,
            device,
            family,
            model_id: model_id.to_string(),
            lowercase,
            prepend_bos: false,
        })
    }

    /// Condition the first token on BOS when scoring (autoregressive only)
    pub fn with_prepend_bos(mut self, prepend_bos: bool) -> Self {
        self.prepend_bos = prepend_bos;
        self
    }

    pub fn family(&self) -> ModelFamily {
        self.family
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn n_layers(&self) -> usize {
        self.model.n_layers()
    }

    pub fn d_model(&self) -> usize {
        self.model.d_model()
    }

    pub fn vocab_size(&self) -> usize {
        self.model.vocab_size()
    }

    pub fn n_heads(&self) -> usize {
        self.model.n_heads()
    }

    /// The end-of-text token string, if the vocabulary has one
    pub fn eos_token(&self) -> Option<&'static str> {
        ["<|endoftext|>", "</s>"]
            .into_iter()
            .find(|t| self.tokenizer.token_to_id(t).is_some())
    }

    fn mask_token_id(&self) -> Result<u32> {
        ["[MASK]", "<mask>"]
            .into_iter()
            .find_map(|t| self.tokenizer.token_to_id(t))
            .ok_or_else(|| anyhow::anyhow!("Tokenizer has no mask token"))
    }

    /// Decode a token ID to string
    pub fn decode_token(&self, token_id: u32) -> String {
        self.tokenizer
            .decode(&[token_id], false)
            .unwrap_or_else(|_| format!("<{token_id}>"))
    }

    fn encode(&self, text: &str) -> Result<Encoding> {
        self.tokenizer
            .encode(text, self.family.adds_special_tokens())
            .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))
    }

    fn input_tensor(&self, ids: &[u32]) -> Result<Tensor> {
        Ok(Tensor::new(ids, &self.device)?.unsqueeze(0)?)
    }

    /// Tokenize text and return tokens with character offsets
    ///
    /// Masked models get their special tokens, which carry `(0, 0)` offsets.
    pub fn tokenize_with_offsets(&self, text: &str) -> Result<EncodingWithOffsets> {
        let encoding = self.encode(text)?;
        let ids = encoding.get_ids().to_vec();
        let tokens: Vec<String> = ids.iter().map(|&id| self.decode_token(id)).collect();
        let offsets = encoding.get_offsets().to_vec();
        Ok(EncodingWithOffsets::new(ids, tokens, offsets))
    }

    /// Hidden states of every layer for a text input
    pub fn hidden_states(&self, text: &str) -> Result<(EncodingWithOffsets, HiddenStateCache)> {
        let encoding = self.tokenize_with_offsets(text)?;
        let input = self.input_tensor(&encoding.ids)?;
        let (_, cache) = self.model.forward_with_cache(&input)?;
        Ok((encoding, cache))
    }

    /// Attention patterns of every layer for a text input
    pub fn attention(&self, text: &str) -> Result<(EncodingWithOffsets, AttentionCache)> {
        let encoding = self.tokenize_with_offsets(text)?;
        let input = self.input_tensor(&encoding.ids)?;
        let (_, cache) = self.model.forward_with_attention(&input)?;
        Ok((encoding, cache))
    }

    /// Left-to-right surprisal: token i is predicted from logits at i - 1
    fn causal_surprisals(&self, ids: &[u32]) -> Result<Vec<f64>> {
        let bos = if self.prepend_bos {
            let eos = self
                .eos_token()
                .ok_or_else(|| anyhow::anyhow!("Tokenizer has no BOS/EOS token to prepend"))?;
            self.tokenizer.token_to_id(eos)
        } else {
            None
        };

        let (input, first) = match bos {
            Some(bos_id) => {
                let mut input = Vec::with_capacity(ids.len() + 1);
                input.push(bos_id);
                input.extend_from_slice(ids);
                (input, 0)
            }
            None => (ids.to_vec(), 1),
        };
        let offset = input.len() - ids.len();

        let mut surprisals = vec![0.0; first.min(ids.len())];
        if first >= ids.len() {
            return Ok(surprisals);
        }

        let logits = self.model.forward(&self.input_tensor(&input)?)?;
        let log_probs =
            candle_nn::ops::log_softmax(&logits.i(0)?.to_dtype(DType::F32)?, D::Minus1)?;

        let rows: Vec<u32> = (first..ids.len()).map(|i| (i + offset - 1) as u32).collect();
        let targets: Vec<u32> = ids[first..].to_vec();
        let rows = Tensor::new(rows.as_slice(), &self.device)?;
        let targets = Tensor::new(targets.as_slice(), &self.device)?.unsqueeze(1)?;

        let picked: Vec<f32> = log_probs
            .index_select(&rows, 0)?
            .gather(&targets, 1)?
            .squeeze(1)?
            .to_vec1()?;
        surprisals.extend(picked.into_iter().map(|lp| -f64::from(lp) / std::f64::consts::LN_2));
        Ok(surprisals)
    }

    /// Pseudo-log-likelihood: each non-special position masked in its own copy
    fn masked_surprisals(&self, ids: &[u32], special: &[u32]) -> Result<Vec<f64>> {
        let positions: Vec<usize> = special
            .iter()
            .enumerate()
            .filter(|(_, &s)| s == 0)
            .map(|(i, _)| i)
            .collect();
        if positions.is_empty() {
            return Ok(Vec::new());
        }
        let mask_id = self.mask_token_id()?;

        let batch: Vec<u32> = positions
            .iter()
            .flat_map(|&p| {
                ids.iter()
                    .enumerate()
                    .map(move |(i, &id)| if i == p { mask_id } else { id })
            })
            .collect();
        let input = Tensor::from_vec(batch, (positions.len(), ids.len()), &self.device)?;
        let logits = self.model.forward(&input)?.to_dtype(DType::F32)?;

        positions
            .iter()
            .enumerate()
            .map(|(row, &p)| {
                let log_probs = candle_nn::ops::log_softmax(&logits.i((row, p))?, D::Minus1)?;
                let lp: f32 = log_probs.i(ids[p] as usize)?.to_scalar()?;
                Ok(-f64::from(lp) / std::f64::consts::LN_2)
            })
            .collect()
    }
}

impl TokenScorer for RoleModel {
    fn token_surprisals(&self, sentence: &str) -> Result<TokenSurprisal> {
        let encoding = self.encode(sentence)?;
        let ids = encoding.get_ids();
        anyhow::ensure!(!ids.is_empty(), "Sentence '{sentence}' produced no tokens");

        let (scored_ids, surprisals): (Vec<u32>, Vec<f64>) = match self.family {
            ModelFamily::Autoregressive => (ids.to_vec(), self.causal_surprisals(ids)?),
            ModelFamily::Masked => {
                let special = encoding.get_special_tokens_mask();
                let kept: Vec<u32> = ids
                    .iter()
                    .zip(special)
                    .filter(|(_, &s)| s == 0)
                    .map(|(&id, _)| id)
                    .collect();
                (kept, self.masked_surprisals(ids, special)?)
            }
        };

        let tokens: Vec<ScoredToken> = scored_ids
            .iter()
            .zip(surprisals)
            .map(|(&id, surprisal)| ScoredToken {
                token: self.decode_token(id).trim().to_string(),
                surprisal,
            })
            .collect();
        debug!("Scored '{}' into {} tokens", sentence, tokens.len());
        Ok(TokenSurprisal::new(tokens))
    }

    fn lowercases_input(&self) -> bool {
        self.lowercase
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_from_model_type() {
        assert_eq!(
            ModelFamily::from_model_type("gpt2").unwrap(),
            ModelFamily::Autoregressive
        );
        assert_eq!(
            ModelFamily::from_model_type("bert").unwrap(),
            ModelFamily::Masked
        );
        assert_eq!(
            ModelFamily::from_model_type("roberta").unwrap(),
            ModelFamily::Masked
        );
        assert!(ModelFamily::from_model_type("llama").is_err());
    }

    #[test]
    fn test_family_cloze_span() {
        assert_eq!(ModelFamily::Masked.cloze_span(), ClozeSpan::WordOnly);
        assert_eq!(
            ModelFamily::Autoregressive.cloze_span(),
            ClozeSpan::WordAndTerminal
        );
        assert!(ModelFamily::Masked.adds_special_tokens());
        assert!(!ModelFamily::Autoregressive.adds_special_tokens());
    }

    #[test]
    #[ignore = "requires model download"]
    fn test_gpt2_scores_every_token() {
        let model = RoleModel::from_pretrained_with_device("gpt2", Some(true)).unwrap();
        let tokens = model.token_surprisals("The dog bit the man.").unwrap();
        assert_eq!(tokens.get(0).unwrap().surprisal, 0.0);
        assert!(tokens.iter().skip(1).all(|t| t.surprisal > 0.0));
    }

    #[test]
    #[ignore = "requires model download"]
    fn test_bert_pll_skips_special_tokens() {
        let model = RoleModel::from_pretrained_with_device("bert-base-uncased", Some(true)).unwrap();
        assert!(model.lowercases_input());
        let tokens = model.token_surprisals("the dog bit the man .").unwrap();
        assert_eq!(tokens.len(), 6);
        assert!(tokens.iter().all(|t| t.token != "[CLS]" && t.token != "[SEP]"));
    }
}
