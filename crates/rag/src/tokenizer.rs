//! Keyword tokenizer for Latin and CJK text
//!
//! Latin text is lowercased and split on anything that is not alphanumeric.
//! Tokens shorter than two characters and English stop words are dropped.
//!
//! CJK runs are handled without a dictionary:
//! - runs of 2..=8 characters are emitted whole
//! - runs of 4 or more also emit adjacent bigrams, minus a noise denylist
//! - runs of exactly 2 also emit both single characters
//!
//! [`tokenize`] deduplicates in first-seen order; [`token_stream`] keeps
//! repeats for term-frequency counting.

use once_cell::sync::Lazy;
use std::collections::HashSet;

use grounding_config::constants::keyword::MAX_CJK_RUN;

const MIN_LATIN_LEN: usize = 2;
const MIN_CJK_RUN: usize = 2;
const BIGRAM_RUN: usize = 4;

static STOP_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "a", "an", "and", "are", "as", "at", "be", "been", "but", "by", "can", "do", "does",
        "for", "from", "had", "has", "have", "he", "her", "his", "how", "i", "if", "in", "into",
        "is", "it", "its", "me", "my", "no", "not", "of", "on", "or", "our", "she", "so", "that",
        "the", "their", "them", "then", "there", "these", "they", "this", "to", "was", "we",
        "were", "what", "when", "where", "which", "who", "why", "will", "with", "you", "your",
    ]
    .into_iter()
    .collect()
});

/// Bigrams made of particles and connectives that match almost everything
static NOISE_BIGRAMS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "的是", "是的", "的一", "了的", "的人", "是一", "了一", "一个", "这个", "那个", "我们",
        "你们", "他们", "什么", "怎么", "可以", "没有", "就是", "还是", "但是", "因为", "所以",
        "如果", "的话", "以及", "或者", "而且", "已经", "这些", "那些", "不是", "也是", "都是",
        "有的", "在的", "之后", "之前", "的时", "时候", "のは", "ので", "です", "ます", "した",
        "して", "いる", "ある",
    ]
    .into_iter()
    .collect()
});

/// CJK ideographs, kana and hangul
pub fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{3040}'..='\u{30FF}'   // Hiragana, Katakana
        | '\u{3400}'..='\u{4DBF}' // CJK Extension A
        | '\u{4E00}'..='\u{9FFF}' // CJK Unified Ideographs
        | '\u{AC00}'..='\u{D7AF}' // Hangul syllables
        | '\u{F900}'..='\u{FAFF}' // CJK Compatibility Ideographs
    )
}

pub fn contains_cjk(text: &str) -> bool {
    text.chars().any(is_cjk)
}

pub fn is_stop_word(word: &str) -> bool {
    STOP_WORDS.contains(word)
}

pub fn is_noise_bigram(bigram: &str) -> bool {
    NOISE_BIGRAMS.contains(bigram)
}

/// Tokenize text, deduplicated in first-seen order
pub fn tokenize(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    token_stream(text)
        .into_iter()
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

/// Every token occurrence in order, used for term frequencies
pub fn token_stream(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let lowered = text.to_lowercase();

    let mut latin = String::new();
    let mut cjk: Vec<char> = Vec::new();

    for c in lowered.chars() {
        if is_cjk(c) {
            flush_latin(&mut latin, &mut out);
            cjk.push(c);
        } else {
            flush_cjk(&mut cjk, &mut out);
            latin.push(c);
        }
    }
    flush_latin(&mut latin, &mut out);
    flush_cjk(&mut cjk, &mut out);

    out
}

fn flush_latin(buf: &mut String, out: &mut Vec<String>) {
    for word in buf.split(|c: char| !c.is_alphanumeric()) {
        if word.chars().count() >= MIN_LATIN_LEN && !is_stop_word(word) {
            out.push(word.to_string());
        }
    }
    buf.clear();
}

fn flush_cjk(run: &mut Vec<char>, out: &mut Vec<String>) {
    let n = run.len();

    if (MIN_CJK_RUN..=MAX_CJK_RUN).contains(&n) {
        let whole: String = run.iter().collect();
        // A two-character run is itself a bigram
        if !(n == MIN_CJK_RUN && is_noise_bigram(&whole)) {
            out.push(whole);
        }
    }

    if n >= BIGRAM_RUN {
        for pair in run.windows(2) {
            let bigram: String = pair.iter().collect();
            if !is_noise_bigram(&bigram) {
                out.push(bigram);
            }
        }
    }

    if n == MIN_CJK_RUN {
        for c in run.iter() {
            out.push(c.to_string());
        }
    }

    run.clear();
}
