//! Sentence and word embeddings at a fixed layer
//!
//! Sentence pooling depends on the model family: masked models summarize the
//! sentence in the leading `[CLS]` token, autoregressive models only see the
//! whole sentence at its final position, so the sentence is wrapped in
//! end-of-text tokens and the last one is read.

use anyhow::{Context, Result};
use tracing::debug;

use crate::cache::HiddenStateCache;
use crate::model::{ModelFamily, RoleModel};
use crate::positioning::EncodingWithOffsets;
use crate::scorer::prepare_text;

/// Text actually fed to the model for sentence pooling
pub fn pooling_input(family: ModelFamily, sentence: &str, eos: Option<&str>) -> String {
    match (family, eos) {
        (ModelFamily::Autoregressive, Some(eos)) => format!("{eos} {sentence} {eos}"),
        _ => sentence.to_string(),
    }
}

/// Token position holding the pooled sentence representation
pub fn pooling_position(family: ModelFamily, encoding: &EncodingWithOffsets) -> Result<usize> {
    anyhow::ensure!(!encoding.is_empty(), "Cannot pool an empty encoding");
    Ok(match family {
        ModelFamily::Masked => 0,
        ModelFamily::Autoregressive => encoding.len() - 1,
    })
}

/// Sentence embedding at `layer` (0 = embedding output)
pub fn sentence_embedding(model: &RoleModel, sentence: &str, layer: usize) -> Result<Vec<f32>> {
    Ok(sentence_embeddings(model, sentence, &[layer])?.remove(0))
}

/// Sentence embeddings at several layers from one forward pass
pub fn sentence_embeddings(
    model: &RoleModel,
    sentence: &str,
    layers: &[usize],
) -> Result<Vec<Vec<f32>>> {
    let sentence = prepare_text(model, sentence);
    let input = pooling_input(model.family(), &sentence, model.eos_token());
    let (encoding, cache) = model.hidden_states(&input)?;
    let position = pooling_position(model.family(), &encoding)?;
    debug!("Pooling '{}' at token {}", sentence, position);
    layers
        .iter()
        .map(|&layer| cache.position_vec(layer, position))
        .collect()
}

/// Mean hidden state of the tokens of the first whole-word occurrence of `word`
pub fn pooled_word_state(
    encoding: &EncodingWithOffsets,
    cache: &HiddenStateCache,
    text: &str,
    word: &str,
    layer: usize,
) -> Result<Vec<f32>> {
    let positions = encoding.first_word_token_indices(text, word);
    anyhow::ensure!(
        !positions.is_empty(),
        "Word '{word}' does not occur in '{text}'"
    );
    cache.mean_over_positions(layer, &positions)
}

/// Contextual embedding of `word` inside `sentence` at `layer`
pub fn word_embedding(
    model: &RoleModel,
    sentence: &str,
    word: &str,
    layer: usize,
) -> Result<Vec<f32>> {
    Ok(word_embeddings(model, sentence, word, &[layer])?.remove(0))
}

/// Contextual embeddings of `word` at several layers from one forward pass
pub fn word_embeddings(
    model: &RoleModel,
    sentence: &str,
    word: &str,
    layers: &[usize],
) -> Result<Vec<Vec<f32>>> {
    let sentence = prepare_text(model, sentence);
    let word = prepare_text(model, word);
    let (encoding, cache) = model.hidden_states(&sentence)?;
    layers
        .iter()
        .map(|&layer| {
            pooled_word_state(&encoding, &cache, &sentence, &word, layer)
                .with_context(|| format!("Failed to embed '{word}' at layer {layer}"))
        })
        .collect()
}
