//! Query normalization, intent classification and expansion.
//!
//! Intent shifts the similarity threshold: exploratory phrasings accept
//! weaker matches, factual lookups demand stronger ones. For Indic-mixed
//! queries the expander also produces paraphrases from a synonym table so
//! romanized and native-script phrasings of the same question land on the
//! same chunks.

use callbridge_core::Script;
use std::collections::HashMap;

use callbridge_config::constants::rag;

/// Coarse intent classes that adjust the similarity threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryIntent {
    /// Open-ended browsing ("tell me about ...").
    Exploratory,
    /// Specific fact lookup ("what is the rate ...").
    Factual,
    Generic,
}

impl QueryIntent {
    /// Shift applied to the base similarity threshold.
    pub fn threshold_shift(&self) -> f32 {
        match self {
            Self::Exploratory => -rag::INTENT_THRESHOLD_SHIFT,
            Self::Factual => rag::INTENT_THRESHOLD_SHIFT,
            Self::Generic => 0.0,
        }
    }
}

const EXPLORATORY_MARKERS: &[&str] = &[
    "tell me about",
    "explain",
    "overview",
    "what can",
    "how does",
    "बताओ",
    "समझाओ",
    "के बारे में",
];

const FACTUAL_MARKERS: &[&str] = &[
    "what is the",
    "how much",
    "when",
    "where",
    "rate",
    "price",
    "fee",
    "charge",
    "कितना",
    "कितनी",
    "कब",
    "कहाँ",
    "दर",
];

/// Query expander with a synonym table.
pub struct QueryExpander {
    synonyms: HashMap<String, Vec<String>>,
    max_expansions: usize,
}

impl QueryExpander {
    pub fn new(max_expansions: usize) -> Self {
        Self {
            synonyms: HashMap::new(),
            max_expansions: max_expansions.max(1),
        }
    }

    /// Extend the synonym table (term -> alternatives).
    pub fn with_synonyms(mut self, synonyms: HashMap<String, Vec<String>>) -> Self {
        for (term, alts) in synonyms {
            self.synonyms
                .entry(term.to_lowercase())
                .or_default()
                .extend(alts);
        }
        self
    }

    /// Lowercase, collapse whitespace, strip punctuation noise.
    pub fn normalize(query: &str) -> String {
        query
            .to_lowercase()
            .chars()
            .filter(|c| !c.is_control())
            .collect::<String>()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Classify the intent of a normalized query.
    pub fn classify(query: &str) -> QueryIntent {
        let lowered = query.to_lowercase();
        if FACTUAL_MARKERS.iter().any(|m| lowered.contains(m)) {
            return QueryIntent::Factual;
        }
        if EXPLORATORY_MARKERS.iter().any(|m| lowered.contains(m)) {
            return QueryIntent::Exploratory;
        }
        QueryIntent::Generic
    }

    /// Produce up to `max_expansions` alternative phrasings.
    ///
    /// Expansion only applies to Indic-mixed content: pure-Latin queries
    /// pass through unexpanded unless a synonym hits.
    pub fn expand(&self, normalized: &str) -> Vec<String> {
        let script = Script::detect(normalized);
        let indic_mixed = script.map(|s| s.is_indic()).unwrap_or(false)
            || normalized
                .chars()
                .any(|c| Script::Devanagari.contains_char(c));

        let mut expansions: Vec<String> = Vec::new();
        for (term, alternatives) in &self.synonyms {
            if !normalized.contains(term.as_str()) {
                continue;
            }
            for alternative in alternatives {
                if expansions.len() >= self.max_expansions {
                    break;
                }
                let candidate = normalized.replace(term.as_str(), alternative);
                if candidate != normalized && !expansions.contains(&candidate) {
                    expansions.push(candidate);
                }
            }
        }

        if !indic_mixed {
            // Latin-only queries keep synonym substitutions only.
            expansions.truncate(self.max_expansions);
            return expansions;
        }

        // Indic-mixed: also issue a whitespace-split token subset query,
        // which behaves like a loose paraphrase for agglutinated phrasings.
        if expansions.len() < self.max_expansions {
            let tokens: Vec<&str> = normalized.split_whitespace().collect();
            if tokens.len() > 3 {
                let head = tokens[..tokens.len() - 1].join(" ");
                if !expansions.contains(&head) {
                    expansions.push(head);
                }
            }
        }

        expansions.truncate(self.max_expansions);
        expansions
    }
}

impl Default for QueryExpander {
    fn default() -> Self {
        let mut synonyms: HashMap<String, Vec<String>> = HashMap::new();
        // Romanized <-> native-script pivots common in voice transcripts.
        synonyms.insert("byaj".into(), vec!["ब्याज".into(), "interest".into()]);
        synonyms.insert("ब्याज".into(), vec!["interest".into()]);
        synonyms.insert("दर".into(), vec!["rate".into()]);
        synonyms.insert("kitna".into(), vec!["कितना".into(), "how much".into()]);
        synonyms.insert("documents".into(), vec!["दस्तावेज़".into(), "papers".into()]);
        Self::new(rag::MAX_EXPANSIONS).with_synonyms(synonyms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_collapses_whitespace() {
        assert_eq!(
            QueryExpander::normalize("  What   IS the\tRate "),
            "what is the rate"
        );
    }

    #[test]
    fn intent_classification() {
        assert_eq!(
            QueryExpander::classify("what is the rate of interest"),
            QueryIntent::Factual
        );
        assert_eq!(
            QueryExpander::classify("tell me about your services"),
            QueryIntent::Exploratory
        );
        assert_eq!(
            QueryExpander::classify("hello there"),
            QueryIntent::Generic
        );
    }

    #[test]
    fn threshold_shifts() {
        assert!(QueryIntent::Exploratory.threshold_shift() < 0.0);
        assert!(QueryIntent::Factual.threshold_shift() > 0.0);
        assert_eq!(QueryIntent::Generic.threshold_shift(), 0.0);
    }

    #[test]
    fn indic_mixed_query_expands() {
        let expander = QueryExpander::default();
        let expansions = expander.expand("ब्याज दर क्या है अभी");
        assert!(!expansions.is_empty());
        assert!(expansions.len() <= rag::MAX_EXPANSIONS);
    }

    #[test]
    fn latin_query_without_synonyms_stays_bare() {
        let expander = QueryExpander::default();
        assert!(expander.expand("completely unrelated words").is_empty());
    }

    #[test]
    fn synonym_substitution_applies() {
        let expander = QueryExpander::default();
        let expansions = expander.expand("byaj kitna hai");
        assert!(expansions.iter().any(|e| e.contains("ब्याज")));
    }
}
