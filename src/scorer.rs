//! Token-level surprisal sources
//!
//! The alignment pipeline only needs a function from a sentence to its
//! sub-word token surprisals. [`TokenScorer`] is that seam: `RoleModel`
//! implements it with a real forward pass, [`LookupScorer`] replays
//! precomputed scores (from tests or from a JSON dump of an earlier run).

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::alignment::{ScoredToken, TokenSurprisal};

/// Source of per-token surprisal (bits) for a sentence
pub trait TokenScorer {
    /// Score one sentence
    fn token_surprisals(&self, sentence: &str) -> Result<TokenSurprisal>;

    /// Whether sentences must be lower-cased before scoring (uncased vocabularies)
    fn lowercases_input(&self) -> bool {
        false
    }

    /// Score several sentences; one result per input, in order
    fn token_surprisals_batch(&self, sentences: &[String]) -> Vec<Result<TokenSurprisal>> {
        sentences
            .iter()
            .map(|s| self.token_surprisals(s))
            .collect()
    }
}

impl<T: TokenScorer + ?Sized> TokenScorer for &T {
    fn token_surprisals(&self, sentence: &str) -> Result<TokenSurprisal> {
        (**self).token_surprisals(sentence)
    }

    fn lowercases_input(&self) -> bool {
        (**self).lowercases_input()
    }

    fn token_surprisals_batch(&self, sentences: &[String]) -> Vec<Result<TokenSurprisal>> {
        (**self).token_surprisals_batch(sentences)
    }
}

impl<T: TokenScorer + ?Sized> TokenScorer for Box<T> {
    fn token_surprisals(&self, sentence: &str) -> Result<TokenSurprisal> {
        (**self).token_surprisals(sentence)
    }

    fn lowercases_input(&self) -> bool {
        (**self).lowercases_input()
    }

    fn token_surprisals_batch(&self, sentences: &[String]) -> Vec<Result<TokenSurprisal>> {
        (**self).token_surprisals_batch(sentences)
    }
}

/// Lower-case `text` when the scorer's vocabulary is uncased
pub fn prepare_text<S: TokenScorer + ?Sized>(scorer: &S, text: &str) -> String {
    if scorer.lowercases_input() {
        text.to_lowercase()
    } else {
        text.to_string()
    }
}

/// One sentence's scores in a score dump
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentenceScores {
    pub sentence: String,
    pub tokens: Vec<(String, f64)>,
}

/// Score dump file layout
#[derive(Debug, Serialize, Deserialize)]
struct ScoreFile {
    model: Option<String>,
    #[serde(default)]
    lowercase: bool,
    sentences: Vec<SentenceScores>,
}

/// Scorer backed by a fixed sentence -> token scores table
#[derive(Debug, Clone, Default)]
pub struct LookupScorer {
    scores: HashMap<String, Vec<(String, f64)>>,
    lowercase: bool,
}

impl LookupScorer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the token scores for one sentence
    pub fn with(mut self, sentence: &str, tokens: &[(&str, f64)]) -> Self {
        self.insert(
            sentence,
            tokens.iter().map(|(t, s)| ((*t).to_string(), *s)).collect(),
        );
        self
    }

    /// Mark the recorded sentences as lower-cased
    pub fn with_lowercase(mut self, lowercase: bool) -> Self {
        self.lowercase = lowercase;
        self
    }

    pub fn insert(&mut self, sentence: &str, tokens: Vec<(String, f64)>) {
        self.scores.insert(sentence.to_string(), tokens);
    }

    /// Load a score dump written by [`LookupScorer::save`] or `score --dump-scores`
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read score file {}", path.display()))?;
        let file: ScoreFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse score file {}", path.display()))?;
        let mut scorer = Self::new().with_lowercase(file.lowercase);
        for entry in file.sentences {
            scorer.insert(&entry.sentence, entry.tokens);
        }
        Ok(scorer)
    }

    /// Write all scores as JSON, sorted by sentence
    pub fn save(&self, path: &Path, model: Option<&str>) -> Result<()> {
        let mut sentences: Vec<SentenceScores> = self
            .scores
            .iter()
            .map(|(sentence, tokens)| SentenceScores {
                sentence: sentence.clone(),
                tokens: tokens.clone(),
            })
            .collect();
        sentences.sort_by(|a, b| a.sentence.cmp(&b.sentence));
        let file = ScoreFile {
            model: model.map(str::to_string),
            lowercase: self.lowercase,
            sentences,
        };
        std::fs::write(path, serde_json::to_string_pretty(&file)?)
            .with_context(|| format!("Failed to write score file {}", path.display()))?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

impl TokenScorer for LookupScorer {
    fn token_surprisals(&self, sentence: &str) -> Result<TokenSurprisal> {
        let tokens = self
            .scores
            .get(sentence)
            .with_context(|| format!("No token scores recorded for '{sentence}'"))?;
        Ok(TokenSurprisal::new(
            tokens
                .iter()
                .map(|(token, surprisal)| ScoredToken {
                    token: token.clone(),
                    surprisal: *surprisal,
                })
                .collect(),
        ))
    }

    fn lowercases_input(&self) -> bool {
        self.lowercase
    }
}

/// Wraps a scorer and records every sentence it scores, for `--dump-scores`
pub struct RecordingScorer<S> {
    inner: S,
    recorded: std::cell::RefCell<LookupScorer>,
}

impl<S: TokenScorer> RecordingScorer<S> {
    pub fn new(inner: S) -> Self {
        let recorded = LookupScorer::new().with_lowercase(inner.lowercases_input());
        Self {
            inner,
            recorded: std::cell::RefCell::new(recorded),
        }
    }

    /// Scores seen so far
    pub fn into_recorded(self) -> LookupScorer {
        self.recorded.into_inner()
    }
}

impl<S: TokenScorer> TokenScorer for RecordingScorer<S> {
    fn token_surprisals(&self, sentence: &str) -> Result<TokenSurprisal> {
        let tokens = self.inner.token_surprisals(sentence)?;
        self.recorded.borrow_mut().insert(
            sentence,
            tokens
                .iter()
                .map(|t| (t.token.clone(), t.surprisal))
                .collect(),
        );
        Ok(tokens)
    }

    fn lowercases_input(&self) -> bool {
        self.inner.lowercases_input()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_scorer() {
        let scorer = LookupScorer::new().with("the dog", &[("the", 1.0), ("dog", 2.0)]);
        let tokens = scorer.token_surprisals("the dog").unwrap();
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens.get(1).unwrap().token, "dog");
        assert!(scorer.token_surprisals("the cat").is_err());
    }

    #[test]
    fn test_recording_scorer_dump_and_reload() {
        let inner = LookupScorer::new().with("a b", &[("a", 0.5), ("b", 1.5)]);
        let recorder = RecordingScorer::new(&inner);
        recorder.token_surprisals("a b").unwrap();
        let recorded = recorder.into_recorded();
        assert_eq!(recorded.len(), 1);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scores.json");
        recorded.save(&path, Some("gpt2")).unwrap();

        let reloaded = LookupScorer::load(&path).unwrap();
        let tokens = reloaded.token_surprisals("a b").unwrap();
        assert!((tokens.total() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_lowercase_flag_survives_dump() {
        let inner = LookupScorer::new()
            .with_lowercase(true)
            .with("the dog", &[("the", 1.0), ("dog", 2.0)]);
        assert_eq!(prepare_text(&inner, "The Dog"), "the dog");

        let recorder = RecordingScorer::new(&inner);
        recorder.token_surprisals("the dog").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scores.json");
        recorder.into_recorded().save(&path, None).unwrap();

        let reloaded = LookupScorer::load(&path).unwrap();
        assert!(reloaded.lowercases_input());
        assert_eq!(prepare_text(&LookupScorer::new(), "The Dog"), "The Dog");
    }
}
