//! Session transcript types.
//!
//! A call session owns an append-only transcript. Entries are appended in
//! non-decreasing timestamp order by the single session task that writes
//! them; the store layer persists the list as-is at session end.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who produced a transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Agent,
    System,
}

/// What kind of entry this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    #[default]
    Speech,
    FunctionCall,
    FunctionResult,
}

/// One line of a session transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub timestamp: DateTime<Utc>,
    pub speaker: Speaker,
    pub text: String,
    #[serde(default)]
    pub kind: EntryKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
}

impl TranscriptEntry {
    pub fn speech(speaker: Speaker, text: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            speaker,
            text: text.into(),
            kind: EntryKind::Speech,
            latency_ms: None,
            confidence: None,
            function_name: None,
        }
    }

    pub fn function_call(name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            speaker: Speaker::Agent,
            text: arguments.into(),
            kind: EntryKind::FunctionCall,
            latency_ms: None,
            confidence: None,
            function_name: Some(name.into()),
        }
    }

    pub fn function_result(name: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            speaker: Speaker::System,
            text: result.into(),
            kind: EntryKind::FunctionResult,
            latency_ms: None,
            confidence: None,
            function_name: Some(name.into()),
        }
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }
}

/// A transcription result from the STT stream.
#[derive(Debug, Clone, Default)]
pub struct TranscriptResult {
    pub text: String,
    pub confidence: f32,
    pub is_final: bool,
    /// Language reported by the transcriber, if any.
    pub language: Option<String>,
}

impl TranscriptResult {
    pub fn partial(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence,
            is_final: false,
            language: None,
        }
    }

    pub fn final_result(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence,
            is_final: true,
            language: None,
        }
    }

    /// Word count on whitespace boundaries.
    pub fn word_count(&self) -> usize {
        self.text.split_whitespace().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_carry_kind() {
        let call = TranscriptEntry::function_call("search_knowledge", r#"{"query":"rates"}"#);
        assert_eq!(call.kind, EntryKind::FunctionCall);
        assert_eq!(call.function_name.as_deref(), Some("search_knowledge"));

        let speech = TranscriptEntry::speech(Speaker::User, "hello");
        assert_eq!(speech.kind, EntryKind::Speech);
        assert!(speech.function_name.is_none());
    }

    #[test]
    fn word_count() {
        let r = TranscriptResult::partial("wait a moment", 0.9);
        assert_eq!(r.word_count(), 3);
        assert_eq!(TranscriptResult::default().word_count(), 0);
    }
}
