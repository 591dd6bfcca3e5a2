//! Structure-aware chunking.
//!
//! Chunks respect section boundaries (no chunk spans a heading when
//! avoidable), target a token budget with overlap, and carry a content
//! type and a quality score. FAQ-style question lines are promoted to
//! headings before chunking so each Q/A pair becomes its own section.
//! Near-identical chunks are dropped by normalized text hash.

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};

use crate::parser::{annotate_sections, AnnotatedElement, ElementKind, StructuredElement};

/// Chunk content classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    #[default]
    Text,
    Code,
    Table,
    Image,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Code => "code",
            Self::Table => "table",
            Self::Image => "image",
        }
    }
}

/// A chunk before persistence/embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkDraft {
    pub chunk_index: usize,
    pub text: String,
    pub token_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_number: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section_title: Option<String>,
    #[serde(default)]
    pub section_path: Vec<String>,
    pub content_type: ContentType,
    pub quality_score: f32,
}

/// Chunker tuning.
#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    /// Target chunk size in tokens.
    pub target_tokens: usize,
    /// Hard ceiling per chunk.
    pub max_tokens: usize,
    /// Chunks below this are merged forward or dropped if final.
    pub min_tokens: usize,
    /// Overlap carried between adjacent chunks of a section (fraction of
    /// target).
    pub overlap_percent: f32,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            target_tokens: 256,
            max_tokens: 512,
            min_tokens: 24,
            overlap_percent: 0.15,
        }
    }
}

/// Rough token estimate: four characters per token for Latin text, two
/// per grapheme for Indic-heavy text.
pub fn estimate_tokens(text: &str) -> usize {
    use unicode_segmentation::UnicodeSegmentation;
    let graphemes = text.graphemes(true).count();
    let indic = text
        .chars()
        .filter(|c| ('\u{0900}'..='\u{0DFF}').contains(c))
        .count();
    let estimate = if indic > graphemes / 3 {
        graphemes / 2
    } else {
        graphemes / 4
    };
    estimate.max(1)
}

/// Structure-aware chunker.
pub struct DocumentChunker {
    config: ChunkerConfig,
}

impl DocumentChunker {
    pub fn new(config: ChunkerConfig) -> Self {
        Self { config }
    }

    /// Chunk a parsed element sequence.
    pub fn chunk(&self, elements: Vec<StructuredElement>) -> Vec<ChunkDraft> {
        let promoted = promote_faq_questions(elements);
        let annotated = annotate_sections(promoted);

        let mut chunks: Vec<ChunkDraft> = Vec::new();
        let mut seen_hashes: HashSet<u64> = HashSet::new();
        let mut builder = ChunkBuilder::new();

        for item in &annotated {
            if item.element.kind == ElementKind::Heading {
                // Section boundary: close the open chunk.
                self.finish(&mut builder, &mut chunks, &mut seen_hashes);
                builder.enter_section(item);
                continue;
            }

            let tokens = estimate_tokens(&item.element.text);

            // Oversized single element: split by sentences.
            if tokens > self.config.max_tokens {
                self.finish(&mut builder, &mut chunks, &mut seen_hashes);
                for piece in split_long_text(&item.element.text, self.config.max_tokens) {
                    builder.push_text(&piece, item);
                    self.finish(&mut builder, &mut chunks, &mut seen_hashes);
                }
                continue;
            }

            if builder.tokens + tokens > self.config.max_tokens
                && builder.tokens >= self.config.min_tokens
            {
                let overlap = self.overlap_tail(&builder.text);
                self.finish(&mut builder, &mut chunks, &mut seen_hashes);
                if let Some(overlap) = overlap {
                    builder.push_overlap(&overlap);
                }
            }

            builder.push_text(&item.element.text, item);
        }
        self.finish(&mut builder, &mut chunks, &mut seen_hashes);

        for (index, chunk) in chunks.iter_mut().enumerate() {
            chunk.chunk_index = index;
        }
        chunks
    }

    fn finish(
        &self,
        builder: &mut ChunkBuilder,
        chunks: &mut Vec<ChunkDraft>,
        seen: &mut HashSet<u64>,
    ) {
        let Some(mut chunk) = builder.take() else {
            return;
        };
        if chunk.token_count < self.config.min_tokens && !chunks.is_empty() {
            // Tiny trailing fragments merge into the previous chunk of the
            // same section rather than standing alone.
            if let Some(previous) = chunks.last_mut() {
                if previous.section_path == chunk.section_path
                    && previous.token_count + chunk.token_count <= self.config.max_tokens
                {
                    previous.text.push(' ');
                    previous.text.push_str(&chunk.text);
                    previous.token_count += chunk.token_count;
                    return;
                }
            }
        }

        let hash = normalized_hash(&chunk.text);
        if !seen.insert(hash) {
            tracing::debug!(section = ?chunk.section_title, "Dropped near-duplicate chunk");
            return;
        }

        chunk.quality_score = quality_score(&chunk, self.config.target_tokens);
        chunks.push(chunk);
    }

    fn overlap_tail(&self, text: &str) -> Option<String> {
        let overlap_tokens =
            (self.config.target_tokens as f32 * self.config.overlap_percent) as usize;
        if overlap_tokens == 0 {
            return None;
        }
        let overlap_chars = overlap_tokens * 4;
        if text.len() <= overlap_chars {
            return None;
        }
        // Cut at a word boundary inside the tail window.
        let tail_start = text.len() - overlap_chars;
        let boundary = text[tail_start..]
            .char_indices()
            .find(|(_, c)| c.is_whitespace())
            .map(|(i, _)| tail_start + i + 1)?;
        Some(text[boundary..].trim().to_string()).filter(|s| !s.is_empty())
    }
}

struct ChunkBuilder {
    text: String,
    tokens: usize,
    section_path: Vec<String>,
    section_title: Option<String>,
    page: Option<u32>,
    has_table: bool,
    has_image: bool,
}

impl ChunkBuilder {
    fn new() -> Self {
        Self {
            text: String::new(),
            tokens: 0,
            section_path: Vec::new(),
            section_title: None,
            page: None,
            has_table: false,
            has_image: false,
        }
    }

    fn enter_section(&mut self, heading: &AnnotatedElement) {
        self.section_path = heading.section_path.clone();
        self.section_title = Some(heading.element.text.clone());
    }

    fn push_text(&mut self, text: &str, item: &AnnotatedElement) {
        if self.text.is_empty() {
            self.section_path = item.section_path.clone();
            self.section_title = item.section_path.last().cloned();
            self.page = item.element.page;
        }
        match item.element.kind {
            ElementKind::Table => self.has_table = true,
            ElementKind::Image => self.has_image = true,
            _ => {}
        }
        if !self.text.is_empty() {
            self.text.push(' ');
        }
        self.text.push_str(text.trim());
        self.tokens = estimate_tokens(&self.text);
    }

    fn push_overlap(&mut self, overlap: &str) {
        self.text = overlap.to_string();
        self.tokens = estimate_tokens(&self.text);
    }

    fn take(&mut self) -> Option<ChunkDraft> {
        if self.text.trim().is_empty() {
            return None;
        }
        let content_type = if self.has_table {
            ContentType::Table
        } else if self.has_image {
            ContentType::Image
        } else if looks_like_code(&self.text) {
            ContentType::Code
        } else {
            ContentType::Text
        };
        let chunk = ChunkDraft {
            chunk_index: 0,
            text: std::mem::take(&mut self.text).trim().to_string(),
            token_count: self.tokens,
            page_number: self.page,
            section_title: self.section_title.clone(),
            section_path: std::mem::take(&mut self.section_path),
            content_type,
            quality_score: 0.0,
        };
        self.tokens = 0;
        self.page = None;
        self.has_table = false;
        self.has_image = false;
        Some(chunk)
    }
}

/// Promote FAQ-style question lines (5..=200 chars ending in `?`) to
/// headings so each Q/A pair becomes a section.
fn promote_faq_questions(elements: Vec<StructuredElement>) -> Vec<StructuredElement> {
    let mut out = Vec::with_capacity(elements.len());
    for element in elements {
        if !matches!(element.kind, ElementKind::Paragraph | ElementKind::Text) {
            out.push(element);
            continue;
        }

        let mut rest = String::new();
        let mut promoted_any = false;
        for line in element.text.lines() {
            let trimmed = line.trim();
            let is_question = (trimmed.ends_with('?') || trimmed.ends_with('？'))
                && (5..=200).contains(&trimmed.chars().count());
            if is_question {
                if !rest.trim().is_empty() {
                    out.push(StructuredElement::paragraph(rest.trim()));
                    rest.clear();
                }
                out.push(StructuredElement::heading(3, trimmed));
                promoted_any = true;
            } else {
                if !rest.is_empty() {
                    rest.push('\n');
                }
                rest.push_str(line);
            }
        }
        if !rest.trim().is_empty() {
            out.push(StructuredElement::paragraph(rest.trim()));
        } else if !promoted_any && element.text.trim().is_empty() {
            // Nothing useful in this element.
        }
    }
    out
}

/// Split one long text on sentence terminators into max_tokens pieces.
fn split_long_text(text: &str, max_tokens: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    for sentence in text.split_inclusive(['.', '?', '!', '।', '۔']) {
        if estimate_tokens(&current) + estimate_tokens(sentence) > max_tokens
            && !current.trim().is_empty()
        {
            pieces.push(current.trim().to_string());
            current = String::new();
        }
        current.push_str(sentence);
    }
    if !current.trim().is_empty() {
        pieces.push(current.trim().to_string());
    }
    pieces
}

fn looks_like_code(text: &str) -> bool {
    if text.contains("```") {
        return true;
    }
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.len() < 3 {
        return false;
    }
    let codey = lines
        .iter()
        .filter(|l| {
            let t = l.trim_end();
            t.ends_with(';') || t.ends_with('{') || t.ends_with('}') || t.starts_with("fn ")
        })
        .count();
    codey * 2 > lines.len()
}

fn normalized_hash(text: &str) -> u64 {
    let normalized: String = text
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let mut hasher = DefaultHasher::new();
    normalized.hash(&mut hasher);
    hasher.finish()
}

/// Bounded quality score from length, section completeness and
/// non-boilerplate ratio.
fn quality_score(chunk: &ChunkDraft, target_tokens: usize) -> f32 {
    // Length factor peaks at the target and degrades for fragments.
    let length = (chunk.token_count as f32 / target_tokens as f32).min(1.0);

    // Section completeness: titled chunks that end on a terminator.
    let mut completeness: f32 = 0.0;
    if chunk.section_title.is_some() {
        completeness += 0.5;
    }
    if chunk
        .text
        .trim_end()
        .ends_with(['.', '?', '!', '।', '॥', '۔'])
    {
        completeness += 0.5;
    }

    // Non-boilerplate ratio: unique word share.
    let words: Vec<&str> = chunk.text.split_whitespace().collect();
    let unique: HashSet<&str> = words.iter().copied().collect();
    let variety = if words.is_empty() {
        0.0
    } else {
        unique.len() as f32 / words.len() as f32
    };

    (0.4 * length + 0.3 * completeness + 0.3 * variety).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paragraphs(n: usize, text: &str) -> Vec<StructuredElement> {
        (0..n)
            .map(|i| StructuredElement::paragraph(format!("{text} variant {i}.")))
            .collect()
    }

    #[test]
    fn chunks_respect_section_boundaries() {
        let mut elements = vec![StructuredElement::heading(1, "Fees")];
        elements.push(StructuredElement::paragraph(
            "Processing fee is one percent of the sanctioned amount.",
        ));
        elements.push(StructuredElement::heading(1, "Eligibility"));
        elements.push(StructuredElement::paragraph(
            "Applicants must be over eighteen years of age.",
        ));

        let chunks = DocumentChunker::new(ChunkerConfig {
            min_tokens: 1,
            ..Default::default()
        })
        .chunk(elements);

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].section_title.as_deref(), Some("Fees"));
        assert_eq!(chunks[1].section_title.as_deref(), Some("Eligibility"));
        assert!(!chunks[0].text.contains("eighteen"));
    }

    #[test]
    fn indices_are_ordered() {
        let chunks = DocumentChunker::new(ChunkerConfig {
            min_tokens: 1,
            max_tokens: 40,
            target_tokens: 30,
            ..Default::default()
        })
        .chunk(paragraphs(
            20,
            "A reasonably long sentence about loan products and their terms",
        ));
        assert!(chunks.len() > 1);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i);
        }
    }

    #[test]
    fn faq_questions_become_sections() {
        let elements = vec![StructuredElement::paragraph(
            "What is the interest rate?\nThe rate starts at nine and a half percent per annum for all approved applicants.",
        )];
        let chunks = DocumentChunker::new(ChunkerConfig {
            min_tokens: 1,
            ..Default::default()
        })
        .chunk(elements);

        assert_eq!(chunks.len(), 1);
        assert_eq!(
            chunks[0].section_title.as_deref(),
            Some("What is the interest rate?")
        );
    }

    #[test]
    fn question_length_bounds_apply() {
        // Too short to be a question heading.
        let short = promote_faq_questions(vec![StructuredElement::paragraph("Eh?")]);
        assert!(short.iter().all(|e| e.kind != ElementKind::Heading));

        let long_question = format!("{}?", "why ".repeat(60));
        let long = promote_faq_questions(vec![StructuredElement::paragraph(long_question)]);
        assert!(long.iter().all(|e| e.kind != ElementKind::Heading));
    }

    #[test]
    fn duplicate_chunks_are_dropped() {
        let text = "Identical boilerplate paragraph that repeats everywhere in the file.";
        let elements = vec![
            StructuredElement::paragraph(text),
            StructuredElement::heading(1, "Other"),
            StructuredElement::paragraph(text),
        ];
        let chunks = DocumentChunker::new(ChunkerConfig {
            min_tokens: 1,
            ..Default::default()
        })
        .chunk(elements);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn table_content_type_wins() {
        let elements = vec![StructuredElement {
            kind: ElementKind::Table,
            level: None,
            text: "Tenure | Rate\n12 | 9.5\n24 | 10.0".into(),
            markdown: None,
            page: Some(3),
        }];
        let chunks = DocumentChunker::new(ChunkerConfig {
            min_tokens: 1,
            ..Default::default()
        })
        .chunk(elements);
        assert_eq!(chunks[0].content_type, ContentType::Table);
        assert_eq!(chunks[0].page_number, Some(3));
    }

    #[test]
    fn quality_is_bounded() {
        let chunks = DocumentChunker::new(ChunkerConfig {
            min_tokens: 1,
            ..Default::default()
        })
        .chunk(vec![
            StructuredElement::heading(1, "Section"),
            StructuredElement::paragraph(
                "A complete, well formed paragraph with varied vocabulary that ends properly.",
            ),
        ]);
        let quality = chunks[0].quality_score;
        assert!((0.0..=1.0).contains(&quality));
        assert!(quality > 0.3);
    }

    #[test]
    fn oversized_element_is_split() {
        let long: String = (0..200)
            .map(|i| format!("Sentence number {i} carries some content. "))
            .collect();
        let chunks = DocumentChunker::new(ChunkerConfig {
            min_tokens: 1,
            max_tokens: 100,
            target_tokens: 80,
            ..Default::default()
        })
        .chunk(vec![StructuredElement::paragraph(long)]);
        assert!(chunks.len() > 2);
        assert!(chunks.iter().all(|c| c.token_count <= 120));
    }
}
