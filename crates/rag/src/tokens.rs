//! Token estimation and boundary-aware truncation
//!
//! The estimate is `ceil(max(chars / 4, words * 0.75))` and is used for every
//! budget decision in the crate.

use unicode_segmentation::UnicodeSegmentation;

/// Estimate the model token count of `text`
pub fn estimate_tokens(text: &str) -> usize {
    estimate_from_counts(text.chars().count(), text.split_whitespace().count())
}

fn estimate_from_counts(chars: usize, words: usize) -> usize {
    let by_chars = chars as f64 / 4.0;
    let by_words = words as f64 * 0.75;
    by_chars.max(by_words).ceil() as usize
}

/// Split into sentences; concatenating the pieces restores the input
pub fn sentences(text: &str) -> Vec<&str> {
    text.split_sentence_bounds().collect()
}

/// Result of truncating a passage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Truncated {
    pub text: String,
    pub tokens: usize,
}

/// Longest prefix that fits `max_tokens`, cut at a sentence boundary when
/// one fits and at a word boundary otherwise
///
/// Returns `None` when not even the first word fits.
pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> Option<Truncated> {
    if max_tokens == 0 {
        return None;
    }

    let mut end = 0;
    let mut best: Option<usize> = None;
    for piece in text.split_sentence_bounds() {
        end += piece.len();
        if estimate_tokens(text[..end].trim_end()) <= max_tokens {
            best = Some(end);
        } else {
            break;
        }
    }

    let cut = match best {
        Some(end) => end,
        None => truncate_at_word(text, max_tokens)?,
    };

    let kept = text[..cut].trim_end();
    if kept.is_empty() {
        return None;
    }
    Some(Truncated {
        text: kept.to_string(),
        tokens: estimate_tokens(kept),
    })
}

/// Byte offset of the last word boundary whose prefix fits
fn truncate_at_word(text: &str, max_tokens: usize) -> Option<usize> {
    let mut chars = 0usize;
    let mut words = 0usize;
    let mut in_word = false;
    let mut best = None;

    for (idx, c) in text.char_indices() {
        if c.is_whitespace() {
            if in_word && estimate_from_counts(chars, words) <= max_tokens {
                best = Some(idx);
            }
            in_word = false;
        } else if !in_word {
            in_word = true;
            words += 1;
        }
        chars += 1;
    }

    if in_word && estimate_from_counts(chars, words) <= max_tokens {
        best = Some(text.len());
    }
    best
}
