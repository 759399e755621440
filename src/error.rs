//! Typed errors for the surprisal pipeline.
//!
//! Per-item failures (alignment, missing targets, incomplete contrasts) are
//! values the batch loops record and log; structural failures (schema,
//! configuration) abort a run before anything is written.

use std::path::PathBuf;

use thiserror::Error;

/// Token/word reconciliation failed for one sentence.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AlignmentError {
    #[error("token stream exhausted while aligning word {word_index} ('{word}'), accumulated '{accumulated}'")]
    TokensExhausted {
        word: String,
        word_index: usize,
        accumulated: String,
    },
    #[error("tokens diverged from word {word_index} ('{word}'): accumulated '{accumulated}'")]
    Diverged {
        word: String,
        word_index: usize,
        accumulated: String,
    },
    #[error("{remaining} token(s) left after the last word, starting at '{next_token}'")]
    UnconsumedTokens { remaining: usize, next_token: String },
}

/// Failure to produce a surprisal value for one stimulus item.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SurprisalError {
    #[error(transparent)]
    Alignment(#[from] AlignmentError),
    #[error("no word of target '{target}' occurs in the sentence")]
    TargetAbsent { target: String },
    #[error("context has no '{placeholder}' placeholder")]
    MissingPlaceholder { placeholder: String },
    #[error("cloze sentence aligned to {words} word(s), need at least 2")]
    TooFewWords { words: usize },
    #[error("scorer failed: {message}")]
    Scoring { message: String },
}

impl SurprisalError {
    pub(crate) fn scoring(err: impl std::fmt::Display) -> Self {
        Self::Scoring {
            message: err.to_string(),
        }
    }
}

/// An item that could not contribute a contrast row.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContrastError {
    #[error("item {item}: no row for condition '{condition}'")]
    MissingCondition { item: String, condition: String },
    #[error("item {item}: {count} rows for condition '{condition}', expected exactly one")]
    DuplicateCondition {
        item: String,
        condition: String,
        count: usize,
    },
    #[error("item '{item}' does not follow the '<prefix>-a' / '<prefix>-b' naming")]
    MalformedItem { item: String },
}

impl ContrastError {
    /// Item ID the failure refers to.
    pub fn item(&self) -> &str {
        match self {
            Self::MissingCondition { item, .. }
            | Self::DuplicateCondition { item, .. }
            | Self::MalformedItem { item } => item,
        }
    }
}

/// Stimulus table loading, validation and writing.
#[derive(Debug, Error)]
pub enum TableError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("CSV error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("{table}: missing required column(s): {}", missing.join(", "))]
    Schema { table: String, missing: Vec<String> },
    #[error("column '{column}' has {got} values, table has {expected} rows")]
    RaggedColumn {
        column: String,
        got: usize,
        expected: usize,
    },
    #[error("row {row}, column '{column}': '{value}' is not a number")]
    InvalidNumber {
        row: usize,
        column: String,
        value: String,
    },
}

impl TableError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn csv(path: impl Into<PathBuf>, source: csv::Error) -> Self {
        Self::Csv {
            path: path.into(),
            source,
        }
    }
}

/// Stimulus configuration errors. All of them abort the run.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON parse error in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("no stimulus config entry for '{experiment}'")]
    MissingEntry { experiment: String },
}
