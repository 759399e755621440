//! Token-to-word surprisal alignment
//!
//! Scorers report surprisal per sub-word token, while stimuli are annotated
//! per whitespace-delimited word. The aligner walks both sequences in
//! lock-step and merges consecutive tokens until their de-marked text spells
//! the current word, summing their surprisals.
//!
//! ## Example
//!
//! ```text
//! tokens: the(1.0) dog(2.0) bit(0.5) the(0.3) man(1.2) ran(0.4) ##sack(3.1) ##ed(0.2)
//! words:  the      dog      bit      the      man      ransacked
//! result: the=1.0  dog=2.0  bit=0.5  the=0.3  man=1.2  ransacked=3.7
//! ```

use crate::error::AlignmentError;

/// WordPiece continuation marker.
pub const CONTINUATION_MARKER: &str = "##";

/// A sub-word token with its surprisal in bits
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredToken {
    pub token: String,
    pub surprisal: f64,
}

/// Token-level surprisal for one sentence, in tokenizer order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenSurprisal {
    tokens: Vec<ScoredToken>,
}

impl TokenSurprisal {
    pub fn new(tokens: Vec<ScoredToken>) -> Self {
        Self { tokens }
    }

    /// Build from `(token, surprisal)` pairs
    pub fn from_pairs<S: Into<String>>(pairs: impl IntoIterator<Item = (S, f64)>) -> Self {
        Self {
            tokens: pairs
                .into_iter()
                .map(|(token, surprisal)| ScoredToken {
                    token: token.into(),
                    surprisal,
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ScoredToken> {
        self.tokens.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScoredToken> {
        self.tokens.iter()
    }

    /// Total surprisal over all tokens
    pub fn total(&self) -> f64 {
        self.tokens.iter().map(|t| t.surprisal).sum()
    }
}

/// A whitespace-delimited word with its aggregated surprisal
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredWord {
    pub word: String,
    pub surprisal: f64,
}

/// Word-level surprisal for one sentence, one entry per word
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WordSurprisal {
    words: Vec<ScoredWord>,
}

impl WordSurprisal {
    pub fn new(words: Vec<ScoredWord>) -> Self {
        Self { words }
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ScoredWord> {
        self.words.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScoredWord> {
        self.words.iter()
    }

    pub fn words(&self) -> &[ScoredWord] {
        &self.words
    }

    /// Total surprisal over all words
    pub fn total(&self) -> f64 {
        self.words.iter().map(|w| w.surprisal).sum()
    }
}

/// Remove the sub-word continuation marker from a token
pub fn strip_continuation(token: &str) -> &str {
    token.strip_prefix(CONTINUATION_MARKER).unwrap_or(token)
}

/// Align token surprisals to the whitespace-delimited words of `sentence`.
///
/// Greedy, no backtracking: each word starts at the current token and
/// absorbs following tokens until the concatenated text equals the word.
/// Every token must be consumed and every word must receive exactly one
/// entry; anything else is an [`AlignmentError`].
pub fn align_surprisal(
    tokens: &TokenSurprisal,
    sentence: &str,
) -> Result<WordSurprisal, AlignmentError> {
    let words: Vec<&str> = sentence.split_whitespace().collect();
    let mut aligned = Vec::with_capacity(words.len());
    let mut cursor = 0;

    for (word_index, &word) in words.iter().enumerate() {
        let mut accumulated = String::new();
        let mut surprisal = 0.0;

        loop {
            let Some(next) = tokens.get(cursor) else {
                return Err(AlignmentError::TokensExhausted {
                    word: word.to_string(),
                    word_index,
                    accumulated,
                });
            };
            accumulated.push_str(strip_continuation(&next.token));
            surprisal += next.surprisal;
            cursor += 1;

            if accumulated == word {
                break;
            }
            // Concatenation only grows, so a non-prefix can never match
            if !word.starts_with(accumulated.as_str()) {
                return Err(AlignmentError::Diverged {
                    word: word.to_string(),
                    word_index,
                    accumulated,
                });
            }
        }

        aligned.push(ScoredWord {
            word: word.to_string(),
            surprisal,
        });
    }

    if let Some(next) = tokens.get(cursor) {
        return Err(AlignmentError::UnconsumedTokens {
            remaining: tokens.len() - cursor,
            next_token: next.token.clone(),
        });
    }

    Ok(WordSurprisal::new(aligned))
}
