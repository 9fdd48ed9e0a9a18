//! Knowledge section rendering

use grounding_config::ContextStyle;
use grounding_core::{MetaCard, RetrievalResult};
use serde_json::Value;

use super::budget::SelectedChunk;
use crate::tokens::estimate_tokens;

const STRUCTURED_SEPARATOR: &str = "\n\n---\n\n";

/// Text rendered around one chunk body
///
/// `prefix + body + suffix` for every chunk, concatenated in order, is the
/// knowledge section. The prefix carries the separator for all but the
/// first chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub prefix: String,
    pub suffix: String,
}

impl Frame {
    /// Tokens the frame adds on top of its body
    ///
    /// Estimates are summed piecewise, which never undercounts the
    /// estimate of the joined text.
    pub fn tokens(&self) -> usize {
        estimate_tokens(&self.prefix) + estimate_tokens(&self.suffix)
    }
}

/// Frame for the chunk at `position` in the knowledge section
pub fn frame(
    result: &RetrievalResult,
    position: usize,
    style: ContextStyle,
    include_citations: bool,
) -> Frame {
    let separator = match (position, style) {
        (0, _) => "",
        (_, ContextStyle::Structured) => STRUCTURED_SEPARATOR,
        (_, ContextStyle::Conversational) => "\n",
        (_, ContextStyle::Minimal) => "\n\n",
    };
    let card = result
        .meta_card
        .as_ref()
        .and_then(render_meta_card)
        .map(|block| format!("\n{}", block))
        .unwrap_or_default();

    match style {
        ContextStyle::Structured => {
            let header = if include_citations {
                format!("[{}] {} ({})", position + 1, title_of(result), citation_of(result))
            } else {
                format!("[{}] {}", position + 1, title_of(result))
            };
            Frame {
                prefix: format!("{}{}\n", separator, header),
                suffix: card,
            }
        },
        ContextStyle::Conversational => {
            let citation = if include_citations {
                format!(" (source: {})", citation_of(result))
            } else {
                String::new()
            };
            Frame {
                prefix: format!("{}- ", separator),
                suffix: format!("{}{}", card, citation),
            }
        },
        ContextStyle::Minimal => Frame {
            prefix: separator.to_string(),
            suffix: card,
        },
    }
}

/// Render the selected chunks in the configured style
pub fn format_knowledge(
    chunks: &[SelectedChunk],
    style: ContextStyle,
    include_citations: bool,
) -> String {
    chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            let frame = frame(&chunk.result, i, style, include_citations);
            format!("{}{}{}", frame.prefix, chunk.text, frame.suffix)
        })
        .collect()
}

/// Render a meta card as a labelled block, `None` when it has no content
pub fn render_meta_card(card: &MetaCard) -> Option<String> {
    if card.is_empty() {
        return None;
    }

    let mut lines = vec!["Key facts:".to_string()];
    if let Some(address) = card.contract_address.as_deref().filter(|s| !s.is_empty()) {
        lines.push(format!("  Contract address: {}", address));
    }
    if let Some(ticker) = card.ticker.as_deref().filter(|s| !s.is_empty()) {
        lines.push(format!("  Ticker: {}", ticker));
    }
    if let Some(chain) = card.blockchain.as_deref().filter(|s| !s.is_empty()) {
        lines.push(format!("  Blockchain: {}", chain));
    }
    if !card.channels.is_empty() {
        lines.push("  Official channels:".to_string());
        for (name, link) in &card.channels {
            lines.push(format!("    {}: {}", name, link));
        }
    }
    for (key, value) in &card.extra {
        // Nested values are not meant for the prompt
        let rendered = match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => continue,
        };
        lines.push(format!("  {}: {}", key, rendered));
    }

    Some(lines.join("\n"))
}

fn title_of(result: &RetrievalResult) -> &str {
    result
        .metadata
        .title
        .as_deref()
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| result.id.as_str())
}

fn citation_of(result: &RetrievalResult) -> &str {
    let meta = &result.metadata;
    [&meta.url, &meta.source_id, &meta.path]
        .into_iter()
        .find_map(|v| v.as_deref().filter(|s| !s.is_empty()))
        .unwrap_or_else(|| result.id.as_str())
}
