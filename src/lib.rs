// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::cast_possible_wrap)] // usize→i64 in tensor ops
#![allow(clippy::many_single_char_names)] // x, y, i, j standard in math
#![allow(clippy::similar_names)] // related variables like `head`/`heads`
#![allow(clippy::module_name_repetitions)] // RoleModel in model.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::unused_self)] // &self for API consistency
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility
#![allow(clippy::unnecessary_wraps)] // Result for future error handling
#![allow(clippy::cast_sign_loss)] // f64→usize when value is known positive

//! rolerev-rs: role-reversal surprisal analysis for language models
//!
//! Measures how surprised pretrained language models are when the agent and
//! patient of a sentence swap places ("the dog bit the man" vs "the man bit
//! the dog"), and where in the network the roles are represented.
//!
//! ## Architecture
//!
//! - `alignment`: sub-word token surprisal to word surprisal
//! - `surprisal`: target-word and cloze surprisal extraction with per-item results
//! - `effects`: paired contrasts (reversal, comparison) and effect summaries
//! - `scorer`: the `TokenScorer` seam, plus offline replay of recorded scores
//! - `model`: High-level RoleModel wrapper; model family decided at load time
//! - `forward_gpt2`: GPT-2 forward pass with hidden-state and attention capture
//! - `forward_bert`: BERT/RoBERTa masked-LM forward pass with capture
//! - `cache`: HiddenStateCache for per-layer hidden states
//! - `attention`: Attention capture and agent/patient head selection
//! - `masks`: Causal mask utilities
//! - `positioning`: Character-offset based word positioning
//! - `embeddings`: Sentence and word embeddings at a fixed layer
//! - `probe`: k-fold cross-validated linear probes with linfa
//! - `stimuli`: CSV stimulus tables
//! - `config`: Stimulus configuration and run settings
//! - `experiment`: Runners for scoring, effects, probing and attention
//! - `error`: Typed errors for the pipeline

pub mod alignment;
pub mod attention;
pub mod cache;
pub mod config;
pub mod effects;
pub mod embeddings;
pub mod error;
pub mod experiment;
pub mod forward_bert;
pub mod forward_gpt2;
pub mod masks;
pub mod model;
pub mod positioning;
pub mod probe;
pub mod scorer;
pub mod stimuli;
pub mod surprisal;

pub use alignment::{align_surprisal, ScoredToken, ScoredWord, TokenSurprisal, WordSurprisal};
pub use attention::{select_heads, AttentionCache, HeadChoice, HeadSelection, RowAttention};
pub use cache::HiddenStateCache;
pub use config::{
    AttentionConfig, EffectsConfig, ExperimentDesign, ProbeConfig, ScoringConfig,
    StimulusConfig,
};
pub use effects::{
    reversal_surprisal_effect, summarize_effects, surprisal_effects, ContrastOutcome,
    ContrastRow, EffectSummary, ReversalRow,
};
pub use embeddings::{sentence_embedding, word_embedding};
pub use error::{AlignmentError, ConfigError, ContrastError, SurprisalError, TableError};
pub use experiment::{
    run_attention, run_effects, run_probe, run_reversal, score_cloze_surprisal,
    score_target_surprisal, score_target_surprisal_with, EffectsReport, ProbeInput, ProbeReport,
    ScoringReport,
};
pub use forward_bert::RoleBert;
pub use forward_gpt2::RoleGpt2;
pub use masks::create_causal_mask;
pub use model::{ModelFamily, RoleBackend, RoleModel};
pub use positioning::EncodingWithOffsets;
pub use probe::{CrossValidationResults, ProbeResults, ProbeTrainer};
pub use scorer::{LookupScorer, RecordingScorer, TokenScorer};
pub use stimuli::{StimulusItem, StimulusTable};
pub use surprisal::{
    cloze_surprisal, surprisal_at_word, target_surprisal, ClozeSpan, TargetMatch,
    ItemScore, FAILED_SURPRISAL,
};
