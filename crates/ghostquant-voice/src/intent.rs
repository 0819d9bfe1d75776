//! Leading-phrase intent detection on partial transcripts.
//!
//! English only. Patterns are anchored at the start of the utterance, so they
//! fire as soon as the first words are recognized.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Named intents broadcast on the application bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    WakeWord,
    Stop,
    Cancel,
    Pause,
    Navigation,
    Show,
    Question,
}

impl IntentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentKind::WakeWord => "wake_word",
            IntentKind::Stop => "stop",
            IntentKind::Cancel => "cancel",
            IntentKind::Pause => "pause",
            IntentKind::Navigation => "navigation",
            IntentKind::Show => "show",
            IntentKind::Question => "question",
        }
    }
}

impl fmt::Display for IntentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static PATTERNS: Lazy<Vec<(IntentKind, Regex)>> = Lazy::new(|| {
    [
        (IntentKind::Stop, r"^(stop|shut up|be quiet|enough)\b"),
        (IntentKind::Cancel, r"^(cancel|never ?mind|forget it)\b"),
        (IntentKind::Pause, r"^(wait|hold on|pause|one (sec|second|moment))\b"),
        (IntentKind::Navigation, r"^(go to|open|navigate to|take me to)\b"),
        (IntentKind::Show, r"^(show( me)?|display|pull up)\b"),
        (
            IntentKind::Question,
            r"^(what|who|why|how|when|where|which|is|are|can|could|does|do)\b",
        ),
    ]
    .into_iter()
    .filter_map(|(kind, pattern)| Regex::new(pattern).ok().map(|re| (kind, re)))
    .collect()
});

/// Match the leading words of `text` against the intent patterns.
pub fn detect_leading_intent(text: &str) -> Option<IntentKind> {
    let normalized = text.trim().to_lowercase();
    if normalized.is_empty() {
        return None;
    }
    PATTERNS
        .iter()
        .find(|(_, re)| re.is_match(&normalized))
        .map(|(kind, _)| *kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leading_patterns() {
        assert_eq!(detect_leading_intent("Stop talking"), Some(IntentKind::Stop));
        assert_eq!(detect_leading_intent("never mind"), Some(IntentKind::Cancel));
        assert_eq!(detect_leading_intent("nevermind that"), Some(IntentKind::Cancel));
        assert_eq!(detect_leading_intent("hold on"), Some(IntentKind::Pause));
        assert_eq!(detect_leading_intent("one sec"), Some(IntentKind::Pause));
        assert_eq!(
            detect_leading_intent("take me to the dashboard"),
            Some(IntentKind::Navigation)
        );
        assert_eq!(detect_leading_intent("show me whales"), Some(IntentKind::Show));
        assert_eq!(detect_leading_intent("what is hydra"), Some(IntentKind::Question));
    }

    #[test]
    fn only_leading_words_count() {
        assert_eq!(detect_leading_intent("please stop"), None);
        assert_eq!(detect_leading_intent("stopwatch"), None);
        assert_eq!(detect_leading_intent("   "), None);
    }
}
