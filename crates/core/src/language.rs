//! Language and script handling.
//!
//! Agents carry a locale-form language code (`hi-IN`, `en-US`). The TTS
//! segmenter and the STT session both key off the [`Language`] resolved from
//! that code. Sentence terminators and minimum segment lengths are
//! script-aware so that Indic and Perso-Arabic text streams split correctly.

use serde::{Deserialize, Serialize};

/// Devanagari danda (purna viram).
pub const DANDA: char = '\u{0964}';
/// Devanagari double danda.
pub const DOUBLE_DANDA: char = '\u{0965}';
/// Arabic full stop, used by Urdu.
pub const ARABIC_FULL_STOP: char = '\u{06D4}';

/// Languages the platform synthesizes and transcribes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    English,
    Hindi,
    Tamil,
    Telugu,
    Kannada,
    Malayalam,
    Bengali,
    Marathi,
    Gujarati,
    Punjabi,
    Odia,
    Urdu,
}

impl Language {
    /// ISO 639-1 code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::English => "en",
            Self::Hindi => "hi",
            Self::Tamil => "ta",
            Self::Telugu => "te",
            Self::Kannada => "kn",
            Self::Malayalam => "ml",
            Self::Bengali => "bn",
            Self::Marathi => "mr",
            Self::Gujarati => "gu",
            Self::Punjabi => "pa",
            Self::Odia => "or",
            Self::Urdu => "ur",
        }
    }

    /// Script used by this language.
    pub fn script(&self) -> Script {
        match self {
            Self::English => Script::Latin,
            Self::Hindi | Self::Marathi => Script::Devanagari,
            Self::Tamil => Script::Tamil,
            Self::Telugu => Script::Telugu,
            Self::Kannada => Script::Kannada,
            Self::Malayalam => Script::Malayalam,
            Self::Bengali => Script::Bengali,
            Self::Gujarati => Script::Gujarati,
            Self::Punjabi => Script::Gurmukhi,
            Self::Odia => Script::Odia,
            Self::Urdu => Script::Arabic,
        }
    }

    /// Sentence terminators for this language's script.
    ///
    /// Ordered most specific first; the segmenter tries them in order.
    pub fn sentence_terminators(&self) -> &'static [char] {
        match self.script() {
            Script::Devanagari => &[DOUBLE_DANDA, DANDA, '.', '?', '!'],
            Script::Arabic => &[ARABIC_FULL_STOP, '\u{061F}', '.', '?', '!'],
            Script::Latin => &['.', '?', '!'],
            // Remaining Indic scripts borrow the danda in practice.
            _ => &[DANDA, '.', '?', '!'],
        }
    }

    /// Minimum characters before the TTS segmenter will cut a segment.
    ///
    /// English reads fluently in longer spans; Indic scripts pack more
    /// phonetic content per character so shorter segments still sound
    /// natural and shave latency.
    pub fn min_segment_chars(&self) -> usize {
        match self {
            Self::English => 60,
            Self::Urdu => 30,
            Self::Malayalam => 40,
            _ => 35,
        }
    }

    /// Parse a locale-form code such as `hi-IN`, `en_US` or a bare `ta`.
    pub fn from_locale(code: &str) -> Option<Self> {
        let primary = code
            .trim()
            .split(['-', '_'])
            .next()
            .unwrap_or("")
            .to_lowercase();
        match primary.as_str() {
            "en" | "english" => Some(Self::English),
            "hi" | "hindi" => Some(Self::Hindi),
            "ta" | "tamil" => Some(Self::Tamil),
            "te" | "telugu" => Some(Self::Telugu),
            "kn" | "kannada" => Some(Self::Kannada),
            "ml" | "malayalam" => Some(Self::Malayalam),
            "bn" | "bengali" | "bangla" => Some(Self::Bengali),
            "mr" | "marathi" => Some(Self::Marathi),
            "gu" | "gujarati" => Some(Self::Gujarati),
            "pa" | "punjabi" => Some(Self::Punjabi),
            "or" | "odia" | "oriya" => Some(Self::Odia),
            "ur" | "urdu" => Some(Self::Urdu),
            _ => None,
        }
    }

    /// All supported languages.
    pub fn all() -> &'static [Language] {
        &[
            Self::English,
            Self::Hindi,
            Self::Tamil,
            Self::Telugu,
            Self::Kannada,
            Self::Malayalam,
            Self::Bengali,
            Self::Marathi,
            Self::Gujarati,
            Self::Punjabi,
            Self::Odia,
            Self::Urdu,
        ]
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Script systems covered by the supported languages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Script {
    Latin,
    Devanagari,
    Bengali,
    Tamil,
    Telugu,
    Kannada,
    Malayalam,
    Gujarati,
    Gurmukhi,
    Odia,
    Arabic,
}

impl Script {
    /// Primary Unicode block for this script.
    pub fn unicode_range(&self) -> (u32, u32) {
        match self {
            Self::Latin => (0x0000, 0x007F),
            Self::Devanagari => (0x0900, 0x097F),
            Self::Bengali => (0x0980, 0x09FF),
            Self::Tamil => (0x0B80, 0x0BFF),
            Self::Telugu => (0x0C00, 0x0C7F),
            Self::Kannada => (0x0C80, 0x0CFF),
            Self::Malayalam => (0x0D00, 0x0D7F),
            Self::Gujarati => (0x0A80, 0x0AFF),
            Self::Gurmukhi => (0x0A00, 0x0A7F),
            Self::Odia => (0x0B00, 0x0B7F),
            Self::Arabic => (0x0600, 0x06FF),
        }
    }

    /// Whether a character falls in this script's primary block.
    pub fn contains_char(&self, c: char) -> bool {
        let code = c as u32;
        let (start, end) = self.unicode_range();
        code >= start && code <= end
    }

    /// Detect the dominant non-Latin script in a text, if any.
    ///
    /// Used by query expansion to decide whether Indic-mixed handling
    /// applies.
    pub fn detect(text: &str) -> Option<Self> {
        let mut counts = std::collections::HashMap::new();
        for c in text.chars() {
            for script in &[
                Self::Devanagari,
                Self::Bengali,
                Self::Tamil,
                Self::Telugu,
                Self::Kannada,
                Self::Malayalam,
                Self::Gujarati,
                Self::Gurmukhi,
                Self::Odia,
                Self::Arabic,
                Self::Latin,
            ] {
                if script.contains_char(c) {
                    *counts.entry(*script).or_insert(0usize) += 1;
                    break;
                }
            }
        }
        counts.into_iter().max_by_key(|(_, v)| *v).map(|(k, _)| k)
    }

    /// Whether this is an Indic script.
    pub fn is_indic(&self) -> bool {
        !matches!(self, Self::Latin | Self::Arabic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locale_parsing() {
        assert_eq!(Language::from_locale("hi-IN"), Some(Language::Hindi));
        assert_eq!(Language::from_locale("en_US"), Some(Language::English));
        assert_eq!(Language::from_locale("ta"), Some(Language::Tamil));
        assert_eq!(Language::from_locale("xx-YY"), None);
    }

    #[test]
    fn segment_thresholds() {
        assert_eq!(Language::English.min_segment_chars(), 60);
        assert_eq!(Language::Hindi.min_segment_chars(), 35);
        assert_eq!(Language::Urdu.min_segment_chars(), 30);
        assert_eq!(Language::Malayalam.min_segment_chars(), 40);
    }

    #[test]
    fn terminators_include_danda() {
        assert!(Language::Hindi.sentence_terminators().contains(&DANDA));
        assert!(Language::Hindi
            .sentence_terminators()
            .contains(&DOUBLE_DANDA));
        assert!(Language::Urdu
            .sentence_terminators()
            .contains(&ARABIC_FULL_STOP));
    }

    #[test]
    fn script_detection() {
        assert_eq!(Script::detect("Hello world"), Some(Script::Latin));
        assert_eq!(Script::detect("नमस्ते दुनिया"), Some(Script::Devanagari));
        assert_eq!(Script::detect(""), None);
    }
}
