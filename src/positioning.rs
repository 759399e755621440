//! Character-offset based word positioning
//!
//! Word-level analyses (word embeddings, attention between agent, patient and
//! verb) need the sub-word tokens that make up a word. Instead of matching
//! tokenizer-specific piece sequences, we locate the word in the sentence by
//! character offsets and select every token whose offset range overlaps it.
//! This works the same for WordPiece and byte-level BPE vocabularies.

/// Encoding result with tokens and their offsets
#[derive(Debug, Clone)]
pub struct EncodingWithOffsets {
    /// Token IDs
    pub ids: Vec<u32>,
    /// Token strings
    pub tokens: Vec<String>,
    /// Byte offsets for each token: (start, end). Special tokens have (0, 0).
    pub offsets: Vec<(usize, usize)>,
}

impl EncodingWithOffsets {
    pub fn new(ids: Vec<u32>, tokens: Vec<String>, offsets: Vec<(usize, usize)>) -> Self {
        Self {
            ids,
            tokens,
            offsets,
        }
    }

    /// Index of the token spanning the given byte position
    pub fn char_to_token(&self, char_pos: usize) -> Option<usize> {
        self.offsets
            .iter()
            .position(|(start, end)| char_pos >= *start && char_pos < *end)
    }

    /// All token indices overlapping the byte range `[start_char, end_char)`.
    /// Zero-width (special) tokens never overlap.
    pub fn char_range_to_tokens(&self, start_char: usize, end_char: usize) -> Vec<usize> {
        self.offsets
            .iter()
            .enumerate()
            .filter_map(|(idx, (start, end))| {
                if start < end && *end > start_char && *start < end_char {
                    Some(idx)
                } else {
                    None
                }
            })
            .collect()
    }

    /// Token indices of every whole-word occurrence of `word` in `text`
    pub fn word_token_indices(&self, text: &str, word: &str) -> Vec<usize> {
        let mut indices: Vec<usize> = find_word_occurrences(text, word)
            .into_iter()
            .flat_map(|(start, end)| self.char_range_to_tokens(start, end))
            .collect();
        indices.sort_unstable();
        indices.dedup();
        indices
    }

    /// Token indices of the first whole-word occurrence of `word` in `text`
    pub fn first_word_token_indices(&self, text: &str, word: &str) -> Vec<usize> {
        find_word_occurrences(text, word)
            .first()
            .map(|(start, end)| self.char_range_to_tokens(*start, *end))
            .unwrap_or_default()
    }

    /// Get the number of tokens
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Byte ranges of whole-word occurrences of `word` (may be a multi-word phrase)
///
/// A match must be bounded by the text edges or by non-alphanumeric
/// characters, so "bit" does not match inside "bitten".
pub fn find_word_occurrences(text: &str, word: &str) -> Vec<(usize, usize)> {
    let word = word.trim();
    if word.is_empty() {
        return Vec::new();
    }

    let is_boundary = |c: Option<char>| c.is_none_or(|c| !c.is_alphanumeric());

    text.match_indices(word)
        .filter(|(start, matched)| {
            let end = start + matched.len();
            let before = text[..*start].chars().next_back();
            let after = text[end..].chars().next();
            is_boundary(before) && is_boundary(after)
        })
        .map(|(start, matched)| (start, start + matched.len()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// "[CLS] the dog bit ##ten the man [SEP]" over "the dog bitten the man"
    fn encoding() -> EncodingWithOffsets {
        EncodingWithOffsets::new(
            vec![101, 1, 2, 3, 4, 1, 5, 102],
            vec![
                "[CLS]".into(),
                "the".into(),
                "dog".into(),
                "bit".into(),
                "##ten".into(),
                "the".into(),
                "man".into(),
                "[SEP]".into(),
            ],
            vec![
                (0, 0),
                (0, 3),
                (4, 7),
                (8, 11),
                (11, 14),
                (15, 18),
                (19, 22),
                (0, 0),
            ],
        )
    }

    #[test]
    fn test_char_to_token() {
        let enc = encoding();
        assert_eq!(enc.char_to_token(0), Some(1));
        assert_eq!(enc.char_to_token(12), Some(4));
        assert_eq!(enc.char_to_token(3), None);
    }

    #[test]
    fn test_special_tokens_never_overlap() {
        let enc = encoding();
        assert_eq!(enc.char_range_to_tokens(0, 3), vec![1]);
    }

    #[test]
    fn test_find_word_occurrences_whole_words() {
        let text = "the dog bitten the man";
        assert_eq!(find_word_occurrences(text, "the"), vec![(0, 3), (15, 18)]);
        assert!(find_word_occurrences(text, "bit").is_empty());
        assert_eq!(find_word_occurrences(text, "bitten"), vec![(8, 14)]);
        assert_eq!(find_word_occurrences(text, "the man"), vec![(15, 22)]);
        assert!(find_word_occurrences(text, " ").is_empty());
    }

    #[test]
    fn test_word_token_indices() {
        let enc = encoding();
        let text = "the dog bitten the man";
        assert_eq!(enc.word_token_indices(text, "bitten"), vec![3, 4]);
        assert_eq!(enc.word_token_indices(text, "the"), vec![1, 5]);
        assert_eq!(enc.first_word_token_indices(text, "the"), vec![1]);
        assert!(enc.word_token_indices(text, "cat").is_empty());
    }
}
