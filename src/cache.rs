//! Hidden-state cache for embedding extraction

use anyhow::Result;
use candle_core::{DType, IndexOp, Tensor};

/// All-position hidden states from one forward pass.
///
/// Layer 0 is the embedding output, layer `i` the output of block `i`, so a
/// model with `n` blocks yields `n + 1` entries. Each tensor has shape
/// `(seq_len, d_model)`.
#[derive(Debug)]
pub struct HiddenStateCache {
    states: Vec<Tensor>,
}

impl HiddenStateCache {
    /// Create an empty cache with capacity for n_layers
    pub fn with_capacity(n_layers: usize) -> Self {
        Self {
            states: Vec::with_capacity(n_layers),
        }
    }

    /// Add the next layer's hidden states, shape `(seq_len, d_model)`
    pub fn push(&mut self, tensor: Tensor) {
        self.states.push(tensor);
    }

    /// Hidden state at one layer and token position, shape `(d_model,)`
    pub fn get_position(&self, layer: usize, position: usize) -> Result<Tensor> {
        let layer_tensor = self.layer_or_err(layer)?;
        let seq_len = layer_tensor.dim(0)?;
        anyhow::ensure!(
            position < seq_len,
            "Position {position} out of range (seq_len={seq_len})"
        );
        Ok(layer_tensor.i(position)?)
    }

    /// Hidden state at one position as f32
    pub fn position_vec(&self, layer: usize, position: usize) -> Result<Vec<f32>> {
        Ok(self
            .get_position(layer, position)?
            .to_dtype(DType::F32)?
            .to_vec1()?)
    }

    /// Mean hidden state over a set of token positions, as f32
    pub fn mean_over_positions(&self, layer: usize, positions: &[usize]) -> Result<Vec<f32>> {
        anyhow::ensure!(!positions.is_empty(), "No token positions to pool");
        let rows = positions
            .iter()
            .map(|&p| self.get_position(layer, p))
            .collect::<Result<Vec<_>>>()?;
        let stacked = Tensor::stack(&rows, 0)?.to_dtype(DType::F32)?;
        Ok(stacked.mean(0)?.to_vec1()?)
    }

    /// Number of cached layers (blocks + embeddings)
    pub fn n_layers(&self) -> usize {
        self.states.len()
    }

    pub fn seq_len(&self) -> Result<usize> {
        let first = self
            .states
            .first()
            .ok_or_else(|| anyhow::anyhow!("Cache is empty"))?;
        Ok(first.dim(0)?)
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    fn layer_or_err(&self, layer: usize) -> Result<&Tensor> {
        self.states
            .get(layer)
            .ok_or_else(|| anyhow::anyhow!("Layer {layer} not in cache ({} layers)", self.states.len()))
    }
}
