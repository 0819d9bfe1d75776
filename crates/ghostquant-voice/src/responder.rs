//! Reply generation seam.
//!
//! The knowledge base answering user queries lives outside this crate; the
//! pipeline only needs a synchronous `respond` call.

use crate::tone::ConversationContext;

pub trait ResponseGenerator: Send + Sync {
    fn respond(&self, query: &str, context: &ConversationContext) -> String;
}

/// Keyword lookup over a fixed table. First entry whose keyword appears in the
/// query wins.
#[derive(Debug, Clone)]
pub struct CannedResponder {
    entries: Vec<(String, String)>,
    fallback: String,
}

impl CannedResponder {
    pub fn new(fallback: impl Into<String>) -> Self {
        Self {
            entries: Vec::new(),
            fallback: fallback.into(),
        }
    }

    pub fn with_entry(mut self, keyword: impl Into<String>, reply: impl Into<String>) -> Self {
        self.entries.push((keyword.into().to_lowercase(), reply.into()));
        self
    }
}

impl Default for CannedResponder {
    fn default() -> Self {
        Self::new("I don't have an answer for that yet.")
            .with_entry(
                "hydra",
                "Hydra groups wallets that move funds together into clusters.",
            )
            .with_entry(
                "whale",
                "Whale tracking follows the largest wallets and flags unusual movements.",
            )
            .with_entry(
                "risk",
                "Risk scores combine transaction patterns, counterparties and history.",
            )
    }
}

impl ResponseGenerator for CannedResponder {
    fn respond(&self, query: &str, context: &ConversationContext) -> String {
        let query = query.to_lowercase();
        let topic = context.topic.as_deref().unwrap_or_default().to_lowercase();
        self.entries
            .iter()
            .find(|(keyword, _)| query.contains(keyword.as_str()))
            .or_else(|| {
                self.entries
                    .iter()
                    .find(|(keyword, _)| !topic.is_empty() && topic.contains(keyword.as_str()))
            })
            .map(|(_, reply)| reply.clone())
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_then_topic_then_fallback() {
        let responder = CannedResponder::default();
        let ctx = ConversationContext::default();
        assert!(responder.respond("What is Hydra?", &ctx).starts_with("Hydra"));

        let risky = ConversationContext {
            topic: Some("risk".to_string()),
            ..Default::default()
        };
        assert!(responder.respond("tell me more", &risky).starts_with("Risk"));
        assert_eq!(
            responder.respond("tell me more", &ctx),
            "I don't have an answer for that yet."
        );
    }
}
