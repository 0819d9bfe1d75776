//! **ToneEngine** — picks the prosody of every spoken reply.
//!
//! Selection is a prioritized decision list over the user's input, an optional
//! intent label and the conversation context; the first matching rule wins.
//! Each tone maps to a fixed [`ToneProfile`] handed to the synthesizer.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use tracing::debug;

const HISTORY_LIMIT: usize = 10;

/// Speaking tone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToneType {
    Conversational,
    Friendly,
    Serious,
    Calm,
    Teaching,
    InvestorDemo,
    /// Only selected explicitly; no rule produces it.
    Excited,
}

impl ToneType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToneType::Conversational => "conversational",
            ToneType::Friendly => "friendly",
            ToneType::Serious => "serious",
            ToneType::Calm => "calm",
            ToneType::Teaching => "teaching",
            ToneType::InvestorDemo => "investor-demo",
            ToneType::Excited => "excited",
        }
    }
}

impl fmt::Display for ToneType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Prosody handed to the synthesizer. Immutable per selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToneProfile {
    pub tone: ToneType,
    /// 1.0 = normal speed.
    pub speech_rate: f32,
    /// 1.0 = normal pitch.
    pub pitch: f32,
    /// 0..1
    pub volume: f32,
    pub pause_duration_ms: u32,
    /// 0..1
    pub emphasis_level: f32,
    pub voice_style: String,
}

impl Default for ToneProfile {
    fn default() -> Self {
        profile_for(ToneType::Conversational)
    }
}

/// Fixed profile table.
pub fn profile_for(tone: ToneType) -> ToneProfile {
    let (speech_rate, pitch, volume, pause_duration_ms, emphasis_level, voice_style) = match tone {
        ToneType::Conversational => (1.0, 1.0, 0.9, 300, 0.5, "neutral"),
        ToneType::Friendly => (1.05, 1.1, 0.95, 250, 0.6, "warm"),
        ToneType::Serious => (0.9, 0.9, 1.0, 450, 0.8, "authoritative"),
        ToneType::Calm => (0.85, 0.95, 0.8, 500, 0.3, "soothing"),
        ToneType::Teaching => (0.92, 1.0, 0.9, 400, 0.7, "clear"),
        ToneType::InvestorDemo => (1.0, 1.05, 1.0, 350, 0.75, "confident"),
        ToneType::Excited => (1.15, 1.2, 1.0, 200, 0.9, "energetic"),
    };
    ToneProfile {
        tone,
        speech_rate,
        pitch,
        volume,
        pause_duration_ms,
        emphasis_level,
        voice_style: voice_style.to_string(),
    }
}

/// Coarse keyword sentiment of a user utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Negative,
    Urgent,
    Curious,
    Neutral,
}

const URGENT_WORDS: &[&str] = &[
    "urgent", "asap", "immediately", "emergency", "right now", "critical", "hurry",
];
const NEGATIVE_WORDS: &[&str] = &[
    "angry", "furious", "terrible", "frustrated", "annoyed", "disappointed", "worried",
    "scared", "upset", "lost money", "confused", "hate", "awful", "bad",
];
const POSITIVE_WORDS: &[&str] = &[
    "thanks", "thank you", "great", "awesome", "helpful", "love", "excellent", "nice",
    "perfect", "amazing",
];
const CURIOUS_WORDS: &[&str] = &["curious", "wonder", "tell me", "interested"];
const INVESTOR_WORDS: &[&str] = &[
    "investor", "investors", "demo", "pitch", "valuation", "funding", "roadmap",
];
const RISK_TOPICS: &[&str] = &["risk", "threat", "fraud", "scam", "hack", "attack", "exploit"];
const HELP_TOPICS: &[&str] = &["help", "tutorial", "guide", "onboarding", "getting started"];

static EXPLAIN_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(how (do|does|to|can|should)|what (is|are|does)|why (is|are|does|do))\b")
        .unwrap_or_else(|e| panic!("invalid explain pattern: {}", e))
});

fn contains_word(text: &str, needle: &str) -> bool {
    text.match_indices(needle).any(|(i, _)| {
        let before = text[..i].chars().next_back();
        let after = text[i + needle.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}

fn contains_any(text: &str, words: &[&str]) -> bool {
    words.iter().any(|w| contains_word(text, w))
}

/// Keyword sentiment. Urgency outranks negativity, which outranks positivity.
pub fn analyze_sentiment(text: &str) -> Sentiment {
    let lower = text.to_lowercase();
    if contains_any(&lower, URGENT_WORDS) {
        return Sentiment::Urgent;
    }
    if contains_any(&lower, NEGATIVE_WORDS) {
        return Sentiment::Negative;
    }
    if contains_any(&lower, POSITIVE_WORDS) {
        return Sentiment::Positive;
    }
    if lower.trim_end().ends_with('?') || contains_any(&lower, CURIOUS_WORDS) {
        return Sentiment::Curious;
    }
    Sentiment::Neutral
}

/// What the conversation is currently about. Owned by the host application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationContext {
    pub topic: Option<String>,
    pub focus_address: Option<String>,
    pub cluster: Option<String>,
    /// Most recent user turns, newest last.
    pub recent_turns: Vec<String>,
}

/// Result of a tone selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToneSelection {
    pub tone: ToneType,
    /// 0..1
    pub confidence: f32,
    pub reason: String,
    pub profile: ToneProfile,
}

#[derive(Debug, Default)]
pub struct ToneEngine {
    history: VecDeque<ToneType>,
}

impl ToneEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick the tone for a reply to `input`.
    pub fn select_tone(
        &mut self,
        input: &str,
        intent: Option<&str>,
        context: Option<&ConversationContext>,
    ) -> ToneSelection {
        let (tone, confidence, reason) = Self::decide(input, intent, context);
        debug!(tone = %tone, confidence, reason = %reason, "tone selected");

        self.history.push_back(tone);
        while self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
        }

        ToneSelection {
            tone,
            confidence,
            reason,
            profile: profile_for(tone),
        }
    }

    fn decide(
        input: &str,
        intent: Option<&str>,
        context: Option<&ConversationContext>,
    ) -> (ToneType, f32, String) {
        let lower = input.to_lowercase();
        let intent = intent.map(|i| i.trim().to_lowercase());

        if intent.as_deref() == Some("demo") || contains_any(&lower, INVESTOR_WORDS) {
            return (ToneType::InvestorDemo, 0.9, "investor or demo request".to_string());
        }
        if intent.as_deref() == Some("explain") || EXPLAIN_PATTERN.is_match(&lower) {
            return (ToneType::Teaching, 0.85, "explanatory question".to_string());
        }

        match analyze_sentiment(&lower) {
            Sentiment::Urgent => return (ToneType::Serious, 0.85, "urgent sentiment".to_string()),
            Sentiment::Negative => return (ToneType::Calm, 0.8, "negative sentiment".to_string()),
            Sentiment::Positive => {
                return (ToneType::Friendly, 0.75, "positive sentiment".to_string())
            }
            Sentiment::Curious => {
                return (ToneType::Friendly, 0.65, "curious question".to_string())
            }
            Sentiment::Neutral => {}
        }

        if let Some(topic) = context.and_then(|c| c.topic.as_deref()) {
            let topic = topic.to_lowercase();
            if contains_any(&topic, RISK_TOPICS) {
                return (ToneType::Serious, 0.6, format!("risk topic '{}'", topic));
            }
            if contains_any(&topic, HELP_TOPICS) {
                return (ToneType::Teaching, 0.6, format!("help topic '{}'", topic));
            }
        }

        (ToneType::Conversational, 0.5, "default".to_string())
    }

    /// Most frequent tone among the last ten selections. Ties go to the most recent.
    pub fn most_frequent_tone(&self) -> Option<ToneType> {
        let mut counts: HashMap<ToneType, usize> = HashMap::new();
        for tone in &self.history {
            *counts.entry(*tone).or_default() += 1;
        }
        let best = counts.values().copied().max()?;
        self.history
            .iter()
            .rev()
            .find(|t| counts.get(*t).copied() == Some(best))
            .copied()
    }

    pub fn history(&self) -> impl Iterator<Item = &ToneType> {
        self.history.iter()
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }
}
