//! Target and cloze surprisal extraction
//!
//! Turns aligned word surprisals into one number per stimulus: the summed
//! surprisal of a (possibly multi-word) target, or the surprisal of a cloze
//! completion at the end of a sentence. Batch helpers never abort on a single
//! bad sentence; they return an [`ItemScore`] per input and log failures.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::alignment::{align_surprisal, TokenSurprisal, WordSurprisal};
use crate::error::SurprisalError;
use crate::scorer::TokenScorer;

/// Value written to the CSV for items that could not be scored.
/// Surprisal is non-negative, so this never collides with a real value.
pub const FAILED_SURPRISAL: f64 = -1.0;

/// Cloze placeholder in stimulus contexts
pub const MASK_PLACEHOLDER: &str = "[MASK]";

/// Per-item outcome of a scoring batch
pub type ItemScore = Result<f64, SurprisalError>;

/// Render an item score as a table value (sentinel on failure)
pub fn score_value(score: &ItemScore) -> f64 {
    match score {
        Ok(value) => *value,
        Err(_) => FAILED_SURPRISAL,
    }
}

/// Whether a stored value is the failure sentinel
pub fn is_failed_value(value: f64) -> bool {
    value < 0.0
}

/// Sum the surprisal of every word whose text is one of the target's words.
///
/// The target is treated as a set: word order is irrelevant and every
/// occurrence in the sentence counts. Fails with `TargetAbsent` when no
/// target word occurs at all, so an absent target never reads as zero.
pub fn target_surprisal(words: &WordSurprisal, target: &str) -> Result<f64, SurprisalError> {
    let targets: HashSet<&str> = target.split_whitespace().collect();

    let mut total = 0.0;
    let mut matched = 0usize;
    for word in words.iter() {
        if targets.contains(word.word.as_str()) {
            total += word.surprisal;
            matched += 1;
        }
    }

    if matched == 0 {
        return Err(SurprisalError::TargetAbsent {
            target: target.to_string(),
        });
    }
    Ok(total)
}

/// Sum the surprisal of the first contiguous occurrence of `phrase`.
///
/// Unlike [`target_surprisal`], repeated words elsewhere in the sentence are
/// not counted.
pub fn span_surprisal(words: &WordSurprisal, phrase: &str) -> Result<f64, SurprisalError> {
    let needle: Vec<&str> = phrase.split_whitespace().collect();
    let absent = || SurprisalError::TargetAbsent {
        target: phrase.to_string(),
    };
    if needle.is_empty() || needle.len() > words.len() {
        return Err(absent());
    }

    words
        .words()
        .windows(needle.len())
        .find(|window| window.iter().zip(&needle).all(|(w, n)| w.word == *n))
        .map(|window| window.iter().map(|w| w.surprisal).sum())
        .ok_or_else(absent)
}

/// How a target phrase is matched against the aligned words
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TargetMatch {
    /// Every occurrence of every target word counts ([`target_surprisal`])
    #[default]
    WordSet,
    /// First contiguous occurrence of the phrase only ([`span_surprisal`])
    Contiguous,
}

impl TargetMatch {
    pub fn surprisal(self, words: &WordSurprisal, target: &str) -> Result<f64, SurprisalError> {
        match self {
            Self::WordSet => target_surprisal(words, target),
            Self::Contiguous => span_surprisal(words, target),
        }
    }
}

/// Which trailing words make up a cloze completion's surprisal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClozeSpan {
    /// The completed word alone (second-to-last aligned word)
    WordOnly,
    /// The completed word plus the sentence-final token
    WordAndTerminal,
}

/// Substitute a cloze completion into a context's `[MASK]` placeholder
pub fn fill_cloze(context: &str, completion: &str) -> Result<String, SurprisalError> {
    if !context.contains(MASK_PLACEHOLDER) {
        return Err(SurprisalError::MissingPlaceholder {
            placeholder: MASK_PLACEHOLDER.to_string(),
        });
    }
    Ok(context.replace(MASK_PLACEHOLDER, completion))
}

/// Surprisal of the completed word in a cloze sentence.
///
/// The last aligned word is the sentence-final token; the completion sits
/// just before it.
pub fn word_final_surprisal(words: &WordSurprisal, span: ClozeSpan) -> Result<f64, SurprisalError> {
    let n = words.len();
    if n < 2 {
        return Err(SurprisalError::TooFewWords { words: n });
    }
    let word = words.words()[n - 2].surprisal;
    Ok(match span {
        ClozeSpan::WordOnly => word,
        ClozeSpan::WordAndTerminal => word + words.words()[n - 1].surprisal,
    })
}

fn score_and_align<S: TokenScorer + ?Sized>(
    scorer: &S,
    sentence: &str,
) -> Result<(TokenSurprisal, WordSurprisal), SurprisalError> {
    align_scored(scorer.token_surprisals(sentence), sentence)
}

fn align_scored(
    scored: anyhow::Result<TokenSurprisal>,
    sentence: &str,
) -> Result<(TokenSurprisal, WordSurprisal), SurprisalError> {
    let tokens = scored.map_err(SurprisalError::scoring)?;
    match align_surprisal(&tokens, sentence) {
        Ok(words) => Ok((tokens, words)),
        Err(err) => {
            let scores: Vec<(&str, f64)> = tokens
                .iter()
                .map(|t| (t.token.as_str(), t.surprisal))
                .collect();
            warn!(
                "Alignment failed for sentence '{}' with scores {:?}: {}",
                sentence, scores, err
            );
            Err(err.into())
        }
    }
}

/// Target surprisal for a batch of `(sentence, target)` pairs.
///
/// Sentences are scored through [`TokenScorer::token_surprisals_batch`].
/// One [`ItemScore`] per input, in order. Failures are logged and do not
/// stop the batch.
pub fn surprisal_at_word<S: TokenScorer + ?Sized>(
    scorer: &S,
    sentences: &[String],
    targets: &[String],
    matching: TargetMatch,
) -> Vec<ItemScore> {
    let scored = scorer.token_surprisals_batch(sentences);
    sentences
        .iter()
        .zip(targets)
        .zip(scored)
        .enumerate()
        .map(|(idx, ((sentence, target), tokens))| {
            let score = align_scored(tokens, sentence)
                .and_then(|(_, words)| matching.surprisal(&words, target));
            match &score {
                Ok(value) => debug!("[{}] '{}' -> {:.3} bits", idx, target, value),
                Err(err) => warn!(
                    "Failed to compute surprisal for row {} ('{}', target '{}'): {}",
                    idx, sentence, target, err
                ),
            }
            score
        })
        .collect()
}

/// Cloze surprisal for one context/completion pair
pub fn cloze_surprisal<S: TokenScorer + ?Sized>(
    scorer: &S,
    context: &str,
    completion: &str,
    span: ClozeSpan,
) -> ItemScore {
    let sentence = fill_cloze(context, completion)?;
    let (_, words) = score_and_align(scorer, &sentence)?;
    word_final_surprisal(&words, span)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::ScoredWord;
    use crate::error::AlignmentError;
    use crate::scorer::LookupScorer;

    fn words(pairs: &[(&str, f64)]) -> WordSurprisal {
        WordSurprisal::new(
            pairs
                .iter()
                .map(|(w, s)| ScoredWord {
                    word: (*w).to_string(),
                    surprisal: *s,
                })
                .collect(),
        )
    }

    fn dog_bit_man() -> WordSurprisal {
        words(&[
            ("the", 1.0),
            ("dog", 2.0),
            ("bit", 0.5),
            ("the", 0.3),
            ("man", 1.2),
        ])
    }

    #[test]
    fn test_single_word_target() {
        let value = target_surprisal(&dog_bit_man(), "dog").unwrap();
        assert!((value - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_multi_word_target_counts_every_occurrence() {
        let value = target_surprisal(&dog_bit_man(), "the man").unwrap();
        assert!((value - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_target_order_invariance() {
        let w = dog_bit_man();
        let a = target_surprisal(&w, "dog bit").unwrap();
        let b = target_surprisal(&w, "bit dog").unwrap();
        assert!((a - b).abs() < 1e-12);
    }

    #[test]
    fn test_partially_absent_target() {
        let value = target_surprisal(&dog_bit_man(), "dog cat").unwrap();
        assert!((value - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_absent_target_fails() {
        let err = target_surprisal(&dog_bit_man(), "cat").unwrap_err();
        assert_eq!(
            err,
            SurprisalError::TargetAbsent {
                target: "cat".into()
            }
        );
        assert!(target_surprisal(&dog_bit_man(), "").is_err());
    }

    #[test]
    fn test_span_surprisal_contiguous() {
        let value = span_surprisal(&dog_bit_man(), "the man").unwrap();
        assert!((value - 1.5).abs() < 1e-9);
        let value = span_surprisal(&dog_bit_man(), "the dog").unwrap();
        assert!((value - 3.0).abs() < 1e-9);
        assert!(span_surprisal(&dog_bit_man(), "man the").is_err());
    }

    #[test]
    fn test_target_match_modes() {
        let w = dog_bit_man();
        assert_eq!(TargetMatch::default(), TargetMatch::WordSet);
        assert!((TargetMatch::WordSet.surprisal(&w, "the man").unwrap() - 2.5).abs() < 1e-9);
        assert!((TargetMatch::Contiguous.surprisal(&w, "the man").unwrap() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_batch_contiguous_target() {
        let scorer = LookupScorer::new().with(
            "the dog bit the man",
            &[("the", 1.0), ("dog", 2.0), ("bit", 0.5), ("the", 0.3), ("man", 1.2)],
        );
        let sentences = vec!["the dog bit the man".to_string()];
        let targets = vec!["the man".to_string()];

        let set = surprisal_at_word(&scorer, &sentences, &targets, TargetMatch::WordSet);
        let span = surprisal_at_word(&scorer, &sentences, &targets, TargetMatch::Contiguous);
        assert!((set[0].as_ref().unwrap() - 2.5).abs() < 1e-9);
        assert!((span[0].as_ref().unwrap() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_word_final_spans() {
        let w = words(&[("the", 1.0), ("dog", 2.0), ("barked", 6.0), (".", 0.5)]);
        assert!((word_final_surprisal(&w, ClozeSpan::WordOnly).unwrap() - 6.0).abs() < 1e-9);
        assert!(
            (word_final_surprisal(&w, ClozeSpan::WordAndTerminal).unwrap() - 6.5).abs() < 1e-9
        );
        assert_eq!(
            word_final_surprisal(&words(&[(".", 0.1)]), ClozeSpan::WordOnly).unwrap_err(),
            SurprisalError::TooFewWords { words: 1 }
        );
    }

    #[test]
    fn test_fill_cloze() {
        assert_eq!(
            fill_cloze("the dog [MASK] .", "barked").unwrap(),
            "the dog barked ."
        );
        assert!(matches!(
            fill_cloze("the dog barked .", "barked"),
            Err(SurprisalError::MissingPlaceholder { .. })
        ));
    }

    #[test]
    fn test_batch_isolates_failures() {
        let scorer = LookupScorer::new()
            .with(
                "the dog bit the man",
                &[
                    ("the", 1.0),
                    ("dog", 2.0),
                    ("bit", 0.5),
                    ("the", 0.3),
                    ("man", 1.2),
                ],
            )
            .with("the man bit", &[("the", 1.0), ("men", 2.0), ("bit", 0.5)]);

        let sentences = vec![
            "the man bit".to_string(),
            "the dog bit the man".to_string(),
            "never scored".to_string(),
        ];
        let targets = vec!["man".to_string(), "dog".to_string(), "dog".to_string()];
        let scores = surprisal_at_word(&scorer, &sentences, &targets, TargetMatch::WordSet);

        assert_eq!(scores.len(), 3);
        assert!(matches!(
            scores[0],
            Err(SurprisalError::Alignment(AlignmentError::Diverged { .. }))
        ));
        assert!((scores[1].as_ref().unwrap() - 2.0).abs() < 1e-9);
        assert!(matches!(scores[2], Err(SurprisalError::Scoring { .. })));

        let values: Vec<f64> = scores.iter().map(score_value).collect();
        assert_eq!(values[0], FAILED_SURPRISAL);
        assert_eq!(values[2], FAILED_SURPRISAL);
        assert!(is_failed_value(values[0]));
        assert!(!is_failed_value(values[1]));
    }

    #[test]
    fn test_cloze_surprisal_end_to_end() {
        let scorer = LookupScorer::new().with(
            "the dog barked .",
            &[("the", 1.0), ("dog", 2.0), ("bark", 4.0), ("##ed", 1.5), (".", 0.25)],
        );
        let word_only =
            cloze_surprisal(&scorer, "the dog [MASK] .", "barked", ClozeSpan::WordOnly).unwrap();
        assert!((word_only - 5.5).abs() < 1e-9);
        let with_terminal =
            cloze_surprisal(&scorer, "the dog [MASK] .", "barked", ClozeSpan::WordAndTerminal)
                .unwrap();
        assert!((with_terminal - 5.75).abs() < 1e-9);
    }
}
