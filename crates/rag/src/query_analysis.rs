//! Query analysis
//!
//! Turns a raw query into a [`QueryAnalysis`]: exact signals, glossary
//! expansion, intents and whether keyword search is worth running.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;

use grounding_config::Glossary;
use grounding_core::{ExactSignal, Intent, IntentKind, QueryAnalysis, SignalKind};

use crate::tokenizer::contains_cjk;

static EVM_TX_HASH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b0x[0-9a-fA-F]{64}\b").expect("valid regex"));
static EVM_ADDRESS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b0x[0-9a-fA-F]{40}\b").expect("valid regex"));
static SOLANA_ADDRESS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[1-9A-HJ-NP-Za-km-z]{32,44}\b").expect("valid regex"));
static HANDLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|[^\w@])(@[A-Za-z0-9_]{2,30})\b").expect("valid regex"));
static TICKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$([A-Za-z][A-Za-z0-9]{1,9})\b").expect("valid regex"));
static NUMBER_WITH_UNIT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b\d+(?:[.,]\d+)?\s?(?:%|(?:gwei|wei|eth|btc|sol|usdt|usdc|usd|tps|ms|gb|mb|kb|k|m|b|x|tokens?|blocks?|seconds?|days?)\b)",
    )
    .expect("valid regex")
});
static QUOTED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""[^"]+"|“[^”]+”|「[^」]+」"#).expect("valid regex"));

const SIGNAL_CONFIDENCE: f32 = 0.95;
const KEYWORD_CONFIDENCE: f32 = 0.7;
const KEYWORD_CONFIDENCE_STEP: f32 = 0.1;
const KEYWORD_CONFIDENCE_CAP: f32 = 0.9;

const CONTRACT_KEYWORDS: &[&str] = &[
    "contract address", "token address", "contract", "ca", "address", "合约", "合约地址", "代币地址",
];
const TICKER_KEYWORDS: &[&str] = &["ticker", "symbol", "token symbol", "代币符号", "代码"];
const CHANNEL_KEYWORDS: &[&str] = &[
    "official", "twitter", "telegram", "discord", "website", "channel", "link", "links",
    "官方", "官网", "推特", "电报", "社区", "频道",
];
const TECH_KEYWORDS: &[&str] = &[
    "tps", "consensus", "block time", "throughput", "gas", "architecture", "specs",
    "specification", "latency", "validator", "validators", "finality", "技术", "共识", "性能",
    "出块",
];

/// Query analyzer with an optional glossary
#[derive(Debug, Clone, Default)]
pub struct QueryAnalyzer {
    glossary: Option<Arc<Glossary>>,
}

impl QueryAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_glossary(mut self, glossary: Arc<Glossary>) -> Self {
        self.glossary = Some(glossary);
        self
    }

    /// Run every analysis step
    pub fn analyze(&self, query: &str) -> QueryAnalysis {
        let exact_signals = detect_signals(query);
        let expanded = self.expand(query);
        let intents = classify_intents(query, &exact_signals);

        let needs_keyword_search = !exact_signals.is_empty()
            || !intents.is_empty()
            || contains_cjk(query)
            || QUOTED.is_match(query);

        tracing::debug!(
            signals = exact_signals.len(),
            intents = ?intents.iter().map(|i| i.kind.as_str()).collect::<Vec<_>>(),
            needs_keyword_search,
            expanded = expanded.len() != query.len(),
            "Query analyzed"
        );

        QueryAnalysis {
            original: query.to_string(),
            expanded,
            exact_signals,
            intents,
            needs_keyword_search,
        }
    }

    /// Append glossary translations; the original text is always kept
    pub fn expand(&self, query: &str) -> String {
        let Some(glossary) = self.glossary.as_deref().filter(|g| !g.is_empty()) else {
            return query.to_string();
        };

        let lowered = query.to_lowercase();
        let mut matched: Vec<&str> = Vec::new();

        for phrase in glossary.phrases() {
            if lowered.contains(phrase.as_str()) {
                matched.push(phrase);
            }
        }
        for word in lowered.split(|c: char| !c.is_alphanumeric() && !is_joiner(c)) {
            let word = word.trim_matches(is_joiner);
            if !word.is_empty() && !contains_cjk(word) {
                matched.push(word);
            }
        }
        // CJK text has no word boundaries; match keys as substrings
        if contains_cjk(&lowered) {
            let mut cjk_keys: Vec<&str> = glossary
                .keys()
                .filter(|k| contains_cjk(k) && lowered.contains(*k))
                .collect();
            cjk_keys.sort_unstable();
            matched.extend(cjk_keys);
        }

        let mut seen: HashSet<String> = HashSet::new();
        let mut additions: Vec<String> = Vec::new();
        for key in matched {
            for translation in glossary.lookup(key) {
                if lowered.contains(translation.as_str()) {
                    continue;
                }
                if seen.insert(translation.clone()) {
                    additions.push(translation.clone());
                }
            }
        }

        if additions.is_empty() {
            query.to_string()
        } else {
            format!("{} {}", query, additions.join(" "))
        }
    }
}

fn is_joiner(c: char) -> bool {
    c == '-' || c == '\''
}

/// Run the detectors in order
///
/// Tx hashes are detected before addresses, and a span already claimed by an
/// earlier detector is never reported again.
pub fn detect_signals(query: &str) -> Vec<ExactSignal> {
    let mut signals: Vec<ExactSignal> = Vec::new();

    let push = |kind: SignalKind, start: usize, end: usize, signals: &mut Vec<ExactSignal>| {
        if signals.iter().any(|s| start < s.end && s.start < end) {
            return;
        }
        signals.push(ExactSignal {
            kind,
            value: query[start..end].to_string(),
            start,
            end,
        });
    };

    for m in EVM_TX_HASH.find_iter(query) {
        push(SignalKind::EvmTxHash, m.start(), m.end(), &mut signals);
    }
    for m in EVM_ADDRESS.find_iter(query) {
        push(SignalKind::EvmAddress, m.start(), m.end(), &mut signals);
    }
    for m in SOLANA_ADDRESS.find_iter(query) {
        push(SignalKind::SolanaAddress, m.start(), m.end(), &mut signals);
    }
    for caps in HANDLE.captures_iter(query) {
        if let Some(m) = caps.get(1) {
            push(SignalKind::Handle, m.start(), m.end(), &mut signals);
        }
    }
    for m in TICKER.find_iter(query) {
        push(SignalKind::Ticker, m.start(), m.end(), &mut signals);
    }
    for m in NUMBER_WITH_UNIT.find_iter(query) {
        push(SignalKind::NumberWithUnit, m.start(), m.end(), &mut signals);
    }

    signals
}

/// Classify intents from signals and keyword sets; several may co-occur
pub fn classify_intents(query: &str, signals: &[ExactSignal]) -> Vec<Intent> {
    let lowered = query.to_lowercase();
    let words: HashSet<&str> = lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    let keyword_hits = |keywords: &[&str]| -> usize {
        keywords
            .iter()
            .filter(|kw| {
                if contains_cjk(kw) || kw.contains(' ') {
                    lowered.contains(*kw)
                } else {
                    words.contains(*kw)
                }
            })
            .count()
    };

    let has_signal = |kinds: &[SignalKind]| signals.iter().any(|s| kinds.contains(&s.kind));

    let rules: [(IntentKind, &[SignalKind], &[&str]); 4] = [
        (
            IntentKind::ContractAddress,
            &[SignalKind::EvmAddress, SignalKind::SolanaAddress],
            CONTRACT_KEYWORDS,
        ),
        (IntentKind::TickerSymbol, &[SignalKind::Ticker], TICKER_KEYWORDS),
        (IntentKind::OfficialChannel, &[SignalKind::Handle], CHANNEL_KEYWORDS),
        (IntentKind::TechnicalSpecs, &[SignalKind::NumberWithUnit], TECH_KEYWORDS),
    ];

    rules
        .into_iter()
        .filter_map(|(kind, signal_kinds, keywords)| {
            let hits = keyword_hits(keywords);
            let from_keywords = (hits > 0).then(|| {
                (KEYWORD_CONFIDENCE + KEYWORD_CONFIDENCE_STEP * (hits - 1) as f32)
                    .min(KEYWORD_CONFIDENCE_CAP)
            });
            let from_signal = has_signal(signal_kinds).then_some(SIGNAL_CONFIDENCE);

            let confidence = match (from_signal, from_keywords) {
                (Some(s), Some(k)) => s.max(k),
                (Some(s), None) => s,
                (None, Some(k)) => k,
                (None, None) => return None,
            };
            Some(Intent { kind, confidence })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDRESS: &str = "0x1234567890abcdef1234567890abcdef12345678";
    const TX_HASH: &str = "0x1234567890abcdef1234567890abcdef1234567890abcdef1234567890abcdef";

    fn kinds(signals: &[ExactSignal]) -> Vec<SignalKind> {
        signals.iter().map(|s| s.kind).collect()
    }

    #[test]
    fn test_tx_hash_not_reported_as_address() {
        let query = format!("status of {}", TX_HASH);
        let signals = detect_signals(&query);
        assert_eq!(kinds(&signals), vec![SignalKind::EvmTxHash]);
        assert_eq!(signals[0].value, TX_HASH);
        assert_eq!(&query[signals[0].start..signals[0].end], TX_HASH);
    }

    #[test]
    fn test_address_detected() {
        let signals = detect_signals(&format!("is {} legit?", ADDRESS));
        assert_eq!(kinds(&signals), vec![SignalKind::EvmAddress]);
    }

    #[test]
    fn test_solana_address() {
        let signals = detect_signals("send to 7xKXtg2CW87d97TXJSDpbD5jBkheTqA83TZRuJosgAsU please");
        assert_eq!(kinds(&signals), vec![SignalKind::SolanaAddress]);
    }

    #[test]
    fn test_handle_ticker_and_units() {
        let signals = detect_signals("Is @acme_labs the account for $ACME with 5000 tps and 2% fee?");
        let found = kinds(&signals);
        assert!(found.contains(&SignalKind::Handle));
        assert!(found.contains(&SignalKind::Ticker));
        assert_eq!(
            found.iter().filter(|k| **k == SignalKind::NumberWithUnit).count(),
            2
        );

        let ticker = signals.iter().find(|s| s.kind == SignalKind::Ticker).unwrap();
        assert_eq!(ticker.value, "$ACME");
        let handle = signals.iter().find(|s| s.kind == SignalKind::Handle).unwrap();
        assert_eq!(handle.value, "@acme_labs");
    }

    #[test]
    fn test_price_is_not_a_ticker() {
        let signals = detect_signals("is it worth $100");
        assert!(!kinds(&signals).contains(&SignalKind::Ticker));
    }

    #[test]
    fn test_email_is_not_a_handle() {
        let signals = detect_signals("mail support@example.com");
        assert!(!kinds(&signals).contains(&SignalKind::Handle));
    }

    #[test]
    fn test_intents_from_signals_and_keywords() {
        let analyzer = QueryAnalyzer::new();

        let a = analyzer.analyze("What is the $ABC contract address?");
        assert!(a.has_intent(IntentKind::ContractAddress));
        assert!(a.has_intent(IntentKind::TickerSymbol));
        assert!(a.needs_keyword_search);

        let a = analyzer.analyze("official telegram group");
        assert!(a.has_intent(IntentKind::OfficialChannel));

        let a = analyzer.analyze("what consensus does the chain use");
        assert!(a.has_intent(IntentKind::TechnicalSpecs));
    }

    #[test]
    fn test_plain_query_skips_keyword_search() {
        let a = QueryAnalyzer::new().analyze("how do I get started");
        assert!(a.exact_signals.is_empty());
        assert!(a.intents.is_empty());
        assert!(!a.needs_keyword_search);
        assert_eq!(a.expanded, a.original);
    }

    #[test]
    fn test_cjk_and_quotes_need_keyword_search() {
        let analyzer = QueryAnalyzer::new();
        assert!(analyzer.analyze("怎么开始").needs_keyword_search);
        assert!(analyzer.analyze(r#"what does "liquid restaking" mean"#).needs_keyword_search);
    }

    #[test]
    fn test_signal_confidence_beats_keywords() {
        let signals = detect_signals(ADDRESS);
        let intents = classify_intents(ADDRESS, &signals);
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].kind, IntentKind::ContractAddress);
        assert!((intents[0].confidence - SIGNAL_CONFIDENCE).abs() < f32::EPSILON);
    }

    #[test]
    fn test_glossary_expansion_appends() {
        let glossary = Glossary::from_yaml(
            r#"
entries:
  - term: wallet
    translations: ["钱包"]
  - term: contract address
    translations: ["合约地址"]
"#,
        )
        .unwrap();
        let analyzer = QueryAnalyzer::new().with_glossary(Arc::new(glossary));

        let expanded = analyzer.expand("Which wallet supports the contract address?");
        assert!(expanded.starts_with("Which wallet supports the contract address?"));
        assert!(expanded.contains("钱包"));
        assert!(expanded.contains("合约地址"));

        let expanded = analyzer.expand("钱包怎么用");
        assert!(expanded.starts_with("钱包怎么用"));
        assert!(expanded.contains("wallet"));
    }

    #[test]
    fn test_glossary_expansion_deduplicates() {
        let glossary = Glossary::from_yaml(
            r#"
entries:
  - term: wallet
    translations: ["钱包"]
"#,
        )
        .unwrap();
        let analyzer = QueryAnalyzer::new().with_glossary(Arc::new(glossary));
        let expanded = analyzer.expand("wallet wallet");
        assert_eq!(expanded.matches("钱包").count(), 1);

        // Already present translations are not appended again
        assert_eq!(analyzer.expand("wallet 钱包"), "wallet 钱包");
    }
}
