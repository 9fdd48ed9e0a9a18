//! Property tests for the keyword tokenizer and token estimation

use proptest::prelude::*;

use grounding_rag::tokenizer::{is_noise_bigram, token_stream, tokenize};
use grounding_rag::tokens::{estimate_tokens, truncate_to_tokens};

/// Mixed Latin, CJK and punctuation
fn mixed_text() -> impl Strategy<Value = String> {
    prop::collection::vec(
        prop_oneof![
            "[a-zA-Z0-9]{1,8}",
            "[的是我们合约地址钱包跨链桥一个这]{1,6}",
            "[ ,.!?$@#-]{1,3}",
        ],
        0..12,
    )
    .prop_map(|parts| parts.concat())
}

proptest! {
    #[test]
    fn tokens_are_nonempty_and_lowercase(text in mixed_text()) {
        for token in tokenize(&text) {
            prop_assert!(!token.is_empty());
            prop_assert_eq!(token.to_lowercase(), token);
        }
    }

    #[test]
    fn tokenize_is_deduplicated_stream(text in mixed_text()) {
        let tokens = tokenize(&text);
        let stream = token_stream(&text);

        let mut seen = std::collections::HashSet::new();
        prop_assert!(tokens.iter().all(|t| seen.insert(t.clone())));
        prop_assert!(tokens.iter().all(|t| stream.contains(t)));
        prop_assert!(stream.iter().all(|t| tokens.contains(t)));
    }

    #[test]
    fn noise_bigrams_never_emitted(text in mixed_text()) {
        for token in token_stream(&text) {
            if token.chars().count() == 2 {
                prop_assert!(!is_noise_bigram(&token), "emitted {}", token);
            }
        }
    }

    #[test]
    fn truncation_fits_budget(words in prop::collection::vec("[a-z]{1,10}", 1..200), max in 1usize..120) {
        let text = words.join(" ");
        match truncate_to_tokens(&text, max) {
            Some(cut) => {
                prop_assert!(cut.tokens <= max);
                prop_assert!(text.starts_with(&cut.text));
                prop_assert_eq!(cut.tokens, estimate_tokens(&cut.text));
            },
            None => prop_assert!(estimate_tokens(&words[0]) > max),
        }
    }
}

#[test]
fn empty_text_has_no_tokens() {
    assert!(tokenize("").is_empty());
    assert!(token_stream("").is_empty());
    assert_eq!(estimate_tokens(""), 0);
}
