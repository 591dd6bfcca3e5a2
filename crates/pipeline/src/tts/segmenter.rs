//! Language-aware sentence segmentation for streaming synthesis.
//!
//! LLM output arrives as arbitrary fragments; synthesis quality and
//! latency both depend on cutting at real sentence boundaries. Rules, in
//! the order they are tried:
//!
//! 1. A terminator followed by a newline always breaks.
//! 2. A terminator followed by whitespace breaks once the pending segment
//!    has reached the language's minimum length (bytes).
//! 3. End-of-input (`flush`) breaks unconditionally.
//! 4. With no boundary in sight, a buffer past 2x the minimum length is
//!    force-cut at the last whitespace.
//!
//! Terminators come from [`Language::sentence_terminators`], most specific
//! first (double danda before danda before ASCII). Segmentation is
//! deterministic for a given `(text, language)`.

use callbridge_core::Language;

/// How a segment was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    /// Cut at a sentence terminator.
    Sentence,
    /// Forced cut of an over-long buffer with no boundary.
    Forced,
    /// Remainder emitted at end of input.
    Flush,
}

/// A segment ready for synthesis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSegment {
    pub text: String,
    pub kind: SegmentKind,
    /// Zero-based index within the utterance.
    pub index: usize,
}

/// Incremental sentence segmenter.
pub struct SentenceSegmenter {
    language: Language,
    buffer: String,
    next_index: usize,
}

impl SentenceSegmenter {
    pub fn new(language: Language) -> Self {
        Self {
            language,
            buffer: String::new(),
            next_index: 0,
        }
    }

    pub fn language(&self) -> Language {
        self.language
    }

    /// Append a fragment and return any segments it completes.
    pub fn push(&mut self, fragment: &str) -> Vec<TextSegment> {
        self.buffer.push_str(fragment);
        let mut segments = Vec::new();

        loop {
            match self.find_boundary() {
                Some(cut) => {
                    let rest = self.buffer.split_off(cut);
                    let text = std::mem::replace(&mut self.buffer, rest);
                    if let Some(segment) = self.emit(text, SegmentKind::Sentence) {
                        segments.push(segment);
                    }
                }
                None => break,
            }
        }

        // Overflow guard: cut a boundary-less buffer at 2x the threshold.
        let limit = self.language.min_segment_chars() * 2;
        while self.buffer.len() > limit {
            let cut = match self.last_whitespace_before(limit) {
                Some(pos) => pos,
                None => break, // single unbroken token; wait for input or flush
            };
            let rest = self.buffer.split_off(cut);
            let text = std::mem::replace(&mut self.buffer, rest);
            if let Some(segment) = self.emit(text, SegmentKind::Forced) {
                segments.push(segment);
            }
        }

        segments
    }

    /// Emit whatever remains at end of input.
    pub fn flush(&mut self) -> Option<TextSegment> {
        let text = std::mem::take(&mut self.buffer);
        self.emit(text, SegmentKind::Flush)
    }

    /// Drop buffered text without emitting (interrupt path).
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.next_index = 0;
    }

    fn emit(&mut self, text: String, kind: SegmentKind) -> Option<TextSegment> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return None;
        }
        let segment = TextSegment {
            text: trimmed.to_string(),
            kind,
            index: self.next_index,
        };
        self.next_index += 1;
        Some(segment)
    }

    /// Byte offset just past the first admissible boundary, or None.
    fn find_boundary(&self) -> Option<usize> {
        let min_len = self.language.min_segment_chars();
        let terminators = self.language.sentence_terminators();

        let mut chars = self.buffer.char_indices().peekable();
        while let Some((pos, c)) = chars.next() {
            if !terminators.contains(&c) {
                continue;
            }
            let end = pos + c.len_utf8();
            let next = chars.peek().map(|(_, n)| *n);

            match next {
                // Terminator + newline breaks regardless of length.
                Some('\n') | Some('\r') => return Some(end),
                // Terminator + whitespace breaks once long enough.
                Some(n) if n.is_whitespace() => {
                    if end >= min_len {
                        return Some(end);
                    }
                }
                // Mid-word terminator (decimals, abbreviations) or
                // end-of-buffer: not a mid-stream boundary.
                _ => {}
            }
        }
        None
    }

    /// Byte offset of the last whitespace at or before `limit`.
    fn last_whitespace_before(&self, limit: usize) -> Option<usize> {
        self.buffer[..limit.min(self.buffer.len())]
            .char_indices()
            .filter(|(_, c)| c.is_whitespace())
            .map(|(i, _)| i)
            .last()
            .filter(|&i| i > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn english_waits_for_min_length() {
        let mut seg = SentenceSegmenter::new(Language::English);
        // "Hi. " is a boundary but far below the 60-byte threshold.
        assert!(seg.push("Hi. ").is_empty());
        let out = seg.push(
            "This sentence is comfortably longer than sixty bytes in total. And more follows.",
        );
        assert_eq!(out.len(), 1);
        assert!(out[0].text.starts_with("Hi. This sentence"));
        assert_eq!(out[0].kind, SegmentKind::Sentence);
    }

    #[test]
    fn hindi_question_splits_at_danda_boundary() {
        let mut seg = SentenceSegmenter::new(Language::Hindi);
        let segments = seg.push("नमस्ते, आप कैसे हैं? मैं ठीक हूँ।");
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].text, "नमस्ते, आप कैसे हैं?");
        // Devanagari is three bytes per code point, comfortably past 35.
        assert!(segments[0].text.len() >= 35);

        let tail = seg.flush().expect("remainder");
        assert_eq!(tail.text, "मैं ठीक हूँ।");
        assert_eq!(tail.kind, SegmentKind::Flush);
    }

    #[test]
    fn terminator_newline_breaks_short_segments() {
        let mut seg = SentenceSegmenter::new(Language::English);
        let out = seg.push("Ok.\nNext line continues");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text, "Ok.");
    }

    #[test]
    fn forced_cut_past_double_threshold() {
        let mut seg = SentenceSegmenter::new(Language::English);
        let words = "word ".repeat(40); // 200 bytes, no terminator
        let out = seg.push(&words);
        assert!(!out.is_empty());
        assert_eq!(out[0].kind, SegmentKind::Forced);
        assert!(out[0].text.len() <= 120);
    }

    #[test]
    fn unbroken_token_waits_for_flush() {
        let mut seg = SentenceSegmenter::new(Language::English);
        let blob = "x".repeat(300);
        assert!(seg.push(&blob).is_empty());
        let out = seg.flush().expect("flush emits");
        assert_eq!(out.text.len(), 300);
    }

    #[test]
    fn decimal_point_is_not_a_boundary() {
        let mut seg = SentenceSegmenter::new(Language::English);
        let out = seg.push(
            "The rate is 10.5 percent per annum which makes this quite a long sentence. Done.",
        );
        assert_eq!(out.len(), 1);
        assert!(out[0].text.contains("10.5"));
    }

    #[test]
    fn segmentation_is_deterministic() {
        let text = "पहला वाक्य यहाँ है। दूसरा वाक्य भी यहाँ है। तीसरा।";
        let run = |t: &str| {
            let mut seg = SentenceSegmenter::new(Language::Hindi);
            let mut out = seg.push(t);
            out.extend(seg.flush());
            out
        };
        assert_eq!(run(text), run(text));
    }

    #[test]
    fn indices_are_sequential() {
        let mut seg = SentenceSegmenter::new(Language::Hindi);
        let mut out = seg.push("यह पहला लम्बा वाक्य है जो सीमा पार करता है। यह दूसरा लम्बा वाक्य है जो सीमा पार करता है। ");
        out.extend(seg.flush());
        let indices: Vec<usize> = out.iter().map(|s| s.index).collect();
        assert_eq!(indices, (0..out.len()).collect::<Vec<_>>());
    }
}
