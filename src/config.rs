//! Stimulus configuration and run settings

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Contrast label used for the reversal pair
pub const REVERSAL_LABEL: &str = "Reversal";

/// Design of one experiment file: which conditions form which contrast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentDesign {
    /// `[reversed, canonical]`; absent for control-only files
    #[serde(default)]
    pub reversal: Option<[String; 2]>,
    /// `[comparison, baseline]`
    pub comparison: [String; 2],
    /// Label of the comparison axis (e.g. "Substitution")
    pub comparison_condition: String,
    /// Experiment tag; defaults to the filename stem
    #[serde(default)]
    pub expt: Option<String>,
}

/// Experiment filename -> design, read from `stimulus_config.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StimulusConfig {
    experiments: BTreeMap<String, ExperimentDesign>,
}

impl StimulusConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_json(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }

    /// Design for an experiment file; a missing entry aborts the run
    pub fn design(&self, filename: &str) -> Result<&ExperimentDesign, ConfigError> {
        self.experiments
            .get(filename)
            .ok_or_else(|| ConfigError::MissingEntry {
                experiment: filename.to_string(),
            })
    }

    pub fn insert(&mut self, filename: &str, design: ExperimentDesign) {
        self.experiments.insert(filename.to_string(), design);
    }

    pub fn len(&self) -> usize {
        self.experiments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.experiments.is_empty()
    }
}

/// Settings for a surprisal scoring run
#[derive(Debug, Clone)]
pub struct ScoringConfig {
    /// HuggingFace model ID; also names the output column
    pub model_id: String,
    /// Force CPU even when CUDA is available
    pub force_cpu: bool,
    /// Condition the first token on BOS (autoregressive models only)
    pub prepend_bos: bool,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            model_id: "gpt2".to_string(),
            force_cpu: false,
            prepend_bos: false,
        }
    }
}

/// Settings for computing contrast tables over a results directory
#[derive(Debug, Clone)]
pub struct EffectsConfig {
    /// Directory holding scored stimulus CSVs
    pub results_dir: PathBuf,
    /// Path to `stimulus_config.json`
    pub config_path: PathBuf,
    /// Only files ending with this suffix are processed
    pub file_suffix: String,
    /// Output contrast table
    pub output: PathBuf,
}

impl Default for EffectsConfig {
    fn default() -> Self {
        Self {
            results_dir: PathBuf::from("data/surprisal_results"),
            config_path: PathBuf::from("data/stimulus_config.json"),
            file_suffix: "_clean.csv".to_string(),
            output: PathBuf::from("data/surprisal_results/surprisal_effects.csv"),
        }
    }
}

/// Settings for embedding probes
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Hidden-state layers to probe (0 = embeddings); empty = every layer
    pub layers: Vec<usize>,
    /// Number of cross-validation folds
    pub folds: usize,
    /// Logistic regression iteration cap
    pub max_iterations: u64,
    /// Fold shuffling seed
    pub seed: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            layers: vec![6],
            folds: 10,
            max_iterations: 500,
            seed: 42,
        }
    }
}

/// Settings for attention head selection
#[derive(Debug, Clone)]
pub struct AttentionConfig {
    /// Columns whose values define a stimulus group
    pub group_by: Vec<String>,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            group_by: vec!["condition".to_string()],
        }
    }
}
