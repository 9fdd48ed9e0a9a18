//! Query analysis types

use serde::{Deserialize, Serialize};

/// High-precision pattern kinds detected in a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    /// `0x` + 40 hex
    EvmAddress,
    /// `0x` + 64 hex
    EvmTxHash,
    /// base58, 32-44 chars
    SolanaAddress,
    /// `@handle`
    Handle,
    /// `$TICKER`
    Ticker,
    /// Number followed by a unit (`10 gwei`, `5%`, `21M tokens`)
    NumberWithUnit,
}

/// An exact signal found in the query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExactSignal {
    pub kind: SignalKind,
    pub value: String,
    /// Byte range in the original query
    pub start: usize,
    pub end: usize,
}

/// Classified query purpose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    ContractAddress,
    TickerSymbol,
    OfficialChannel,
    TechnicalSpecs,
}

impl IntentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ContractAddress => "contract_address",
            Self::TickerSymbol => "ticker_symbol",
            Self::OfficialChannel => "official_channel",
            Self::TechnicalSpecs => "technical_specs",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub kind: IntentKind,
    /// 0.0 - 1.0
    pub confidence: f32,
}

/// Result of query preparation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryAnalysis {
    pub original: String,
    /// Original text plus glossary translations
    pub expanded: String,
    pub exact_signals: Vec<ExactSignal>,
    pub intents: Vec<Intent>,
    pub needs_keyword_search: bool,
}

impl QueryAnalysis {
    pub fn has_intent(&self, kind: IntentKind) -> bool {
        self.intents.iter().any(|i| i.kind == kind)
    }

    pub fn has_signal(&self, kind: SignalKind) -> bool {
        self.exact_signals.iter().any(|s| s.kind == kind)
    }

    pub fn intent_kinds(&self) -> Vec<IntentKind> {
        self.intents.iter().map(|i| i.kind).collect()
    }

    /// Support-style lookups that need verified integrations only
    pub fn is_support_lookup(&self) -> bool {
        self.has_intent(IntentKind::ContractAddress) || self.has_intent(IntentKind::OfficialChannel)
    }
}
