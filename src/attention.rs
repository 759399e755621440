//! Attention capture and head selection
//!
//! For role-reversal stimuli the question is which attention head links the
//! verb to its arguments. Per stimulus group, every (layer, head) is scored
//! by the attention mass flowing from the target-verb tokens to the agent
//! tokens (and, separately, to the patient tokens), averaged over the group.
//! The best head for each argument is then read out row by row.

use anyhow::Result;
use candle_core::{DType, IndexOp, Tensor};

/// Attention weights per layer, each `[batch, heads, seq, seq]`
#[derive(Debug)]
pub struct AttentionCache {
    patterns: Vec<Tensor>,
}

impl AttentionCache {
    pub fn with_capacity(n_layers: usize) -> Self {
        Self {
            patterns: Vec::with_capacity(n_layers),
        }
    }

    pub fn push(&mut self, pattern: Tensor) {
        self.patterns.push(pattern);
    }

    pub fn n_layers(&self) -> usize {
        self.patterns.len()
    }

    /// Summed attention from `from` positions to `to` positions, per layer and head.
    ///
    /// Returns `[layer][head]`. Empty position sets contribute zero.
    pub fn summed_attention(&self, from: &[usize], to: &[usize]) -> Result<Vec<Vec<f64>>> {
        self.patterns
            .iter()
            .map(|pattern| {
                let n_heads = pattern.dim(1)?;
                if from.is_empty() || to.is_empty() {
                    return Ok(vec![0.0; n_heads]);
                }
                let device = pattern.device();
                let from_idx = Tensor::new(to_u32(from).as_slice(), device)?;
                let to_idx = Tensor::new(to_u32(to).as_slice(), device)?;

                let per_head = pattern
                    .i(0)? // [heads, seq, seq]
                    .to_dtype(DType::F32)?
                    .index_select(&from_idx, 1)?
                    .index_select(&to_idx, 2)?
                    .sum((1, 2))?; // [heads]
                let values: Vec<f32> = per_head.to_vec1()?;
                Ok(values.into_iter().map(f64::from).collect())
            })
            .collect()
    }
}

fn to_u32(positions: &[usize]) -> Vec<u32> {
    positions.iter().map(|&p| p as u32).collect()
}

/// Target-to-argument attention for one stimulus row, `[layer][head]`
#[derive(Debug, Clone, PartialEq)]
pub struct RowAttention {
    pub to_agent: Vec<Vec<f64>>,
    pub to_patient: Vec<Vec<f64>>,
}

/// A (layer, head) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadChoice {
    pub layer: usize,
    pub head: usize,
}

impl std::fmt::Display for HeadChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.layer, self.head)
    }
}

/// Per-row attention read out at the selected heads
#[derive(Debug, Clone, PartialEq)]
pub struct RowHeadAttention {
    pub max_attn_to_agent: f64,
    pub max_attn_to_patient: f64,
    /// Attention to the patient at the agent head
    pub agent_layer_patient_attn: f64,
    /// Attention to the agent at the patient head
    pub patient_layer_agent_attn: f64,
}

/// Head selection result for one stimulus group
#[derive(Debug, Clone, PartialEq)]
pub struct HeadSelection {
    pub agent_head: HeadChoice,
    pub patient_head: HeadChoice,
    pub rows: Vec<RowHeadAttention>,
}

/// Element-wise mean of `[layer][head]` matrices
fn mean_matrix<'a>(matrices: impl Iterator<Item = &'a Vec<Vec<f64>>>) -> Vec<Vec<f64>> {
    let mut sum: Vec<Vec<f64>> = Vec::new();
    let mut count = 0usize;
    for m in matrices {
        if sum.is_empty() {
            sum = m.iter().map(|row| vec![0.0; row.len()]).collect();
        }
        for (acc_row, row) in sum.iter_mut().zip(m) {
            for (acc, v) in acc_row.iter_mut().zip(row) {
                *acc += v;
            }
        }
        count += 1;
    }
    if count > 0 {
        for v in sum.iter_mut().flatten() {
            *v /= count as f64;
        }
    }
    sum
}

/// First maximum in row-major order
fn argmax(matrix: &[Vec<f64>]) -> Option<HeadChoice> {
    let mut best: Option<(HeadChoice, f64)> = None;
    for (layer, row) in matrix.iter().enumerate() {
        for (head, &v) in row.iter().enumerate() {
            if best.is_none_or(|(_, b)| v > b) {
                best = Some((HeadChoice { layer, head }, v));
            }
        }
    }
    best.map(|(choice, _)| choice)
}

fn at(matrix: &[Vec<f64>], choice: HeadChoice) -> f64 {
    matrix
        .get(choice.layer)
        .and_then(|row| row.get(choice.head))
        .copied()
        .unwrap_or(0.0)
}

/// Pick the heads with maximum mean attention to agent and to patient
pub fn select_heads(rows: &[RowAttention]) -> Result<HeadSelection> {
    anyhow::ensure!(!rows.is_empty(), "Cannot select heads for an empty group");

    let agent_mean = mean_matrix(rows.iter().map(|r| &r.to_agent));
    let patient_mean = mean_matrix(rows.iter().map(|r| &r.to_patient));
    let agent_head =
        argmax(&agent_mean).ok_or_else(|| anyhow::anyhow!("No attention heads captured"))?;
    let patient_head =
        argmax(&patient_mean).ok_or_else(|| anyhow::anyhow!("No attention heads captured"))?;

    let rows = rows
        .iter()
        .map(|r| RowHeadAttention {
            max_attn_to_agent: at(&r.to_agent, agent_head),
            max_attn_to_patient: at(&r.to_patient, patient_head),
            agent_layer_patient_attn: at(&r.to_patient, agent_head),
            patient_layer_agent_attn: at(&r.to_agent, patient_head),
        })
        .collect();

    Ok(HeadSelection {
        agent_head,
        patient_head,
        rows,
    })
}
