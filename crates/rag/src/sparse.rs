//! BM25 sparse index (tantivy).
//!
//! One in-memory index per agent namespace, feeding the sparse side of
//! hybrid retrieval. The simple Unicode tokenizer handles Indic scripts;
//! stemming applies to English only.

use parking_lot::RwLock;
use std::collections::HashMap;
use tantivy::{
    collector::TopDocs,
    query::QueryParser,
    schema::{Field, OwnedValue, Schema, TextFieldIndexing, TextOptions, STORED, STRING},
    tokenizer::{Language, LowerCaser, RemoveLongFilter, SimpleTokenizer, Stemmer, TextAnalyzer},
    Index, IndexReader, IndexWriter, TantivyDocument,
};

use crate::RagError;

/// One BM25 hit.
#[derive(Debug, Clone)]
pub struct SparseHit {
    pub chunk_id: String,
    pub score: f32,
    pub text: String,
    pub metadata: HashMap<String, String>,
}

/// A document entering the sparse index.
#[derive(Debug, Clone)]
pub struct SparseDoc {
    pub chunk_id: String,
    pub text: String,
    pub section_title: Option<String>,
}

/// Per-namespace BM25 index.
pub struct SparseIndex {
    index: Index,
    reader: IndexReader,
    writer: RwLock<Option<IndexWriter>>,
    id_field: Field,
    text_field: Field,
    section_field: Field,
}

impl SparseIndex {
    /// Create an in-memory index.
    pub fn new(language: &str) -> Result<Self, RagError> {
        let mut schema_builder = Schema::builder();

        let text_options = TextOptions::default()
            .set_indexing_options(
                TextFieldIndexing::default()
                    .set_tokenizer("multilingual")
                    .set_index_option(tantivy::schema::IndexRecordOption::WithFreqsAndPositions),
            )
            .set_stored();

        let id_field = schema_builder.add_text_field("chunk_id", STRING | STORED);
        let text_field = schema_builder.add_text_field("text", text_options.clone());
        let section_field = schema_builder.add_text_field("section", text_options);
        let schema = schema_builder.build();

        let index = Index::create_in_ram(schema);
        index
            .tokenizers()
            .register("multilingual", Self::build_tokenizer(language));

        let reader = index.reader().map_err(|e| RagError::Index(e.to_string()))?;
        let writer = index
            .writer(50_000_000)
            .map_err(|e| RagError::Index(e.to_string()))?;

        Ok(Self {
            index,
            reader,
            writer: RwLock::new(Some(writer)),
            id_field,
            text_field,
            section_field,
        })
    }

    /// SimpleTokenizer copes with Devanagari and friends; only English
    /// gets a stemmer.
    fn build_tokenizer(language: &str) -> TextAnalyzer {
        let base = TextAnalyzer::builder(SimpleTokenizer::default())
            .filter(RemoveLongFilter::limit(100))
            .filter(LowerCaser);
        if language == "en" {
            base.filter(Stemmer::new(Language::English)).build()
        } else {
            base.build()
        }
    }

    /// Add documents and commit.
    pub fn index_documents(&self, documents: &[SparseDoc]) -> Result<(), RagError> {
        let mut writer = self.writer.write();
        let writer = writer
            .as_mut()
            .ok_or_else(|| RagError::Index("writer not available".to_string()))?;

        for doc in documents {
            let mut tantivy_doc = TantivyDocument::default();
            tantivy_doc.add_text(self.id_field, &doc.chunk_id);
            tantivy_doc.add_text(self.text_field, &doc.text);
            if let Some(ref section) = doc.section_title {
                tantivy_doc.add_text(self.section_field, section);
            }
            writer
                .add_document(tantivy_doc)
                .map_err(|e| RagError::Index(e.to_string()))?;
        }

        writer.commit().map_err(|e| RagError::Index(e.to_string()))?;
        self.reader
            .reload()
            .map_err(|e| RagError::Index(e.to_string()))?;
        Ok(())
    }

    /// BM25 search.
    pub fn search(&self, query: &str, top_k: usize) -> Result<Vec<SparseHit>, RagError> {
        let searcher = self.reader.searcher();
        let parser = QueryParser::for_index(&self.index, vec![self.text_field, self.section_field]);

        let parsed = match parser.parse_query(query) {
            Ok(parsed) => parsed,
            // User text with stray syntax characters falls back to a miss.
            Err(e) => {
                tracing::debug!(error = %e, query, "Sparse query parse failed");
                return Ok(Vec::new());
            }
        };

        let top_docs = searcher
            .search(&parsed, &TopDocs::with_limit(top_k))
            .map_err(|e| RagError::Search(e.to_string()))?;

        let mut hits = Vec::with_capacity(top_docs.len());
        for (score, address) in top_docs {
            let doc: TantivyDocument = searcher
                .doc(address)
                .map_err(|e| RagError::Search(e.to_string()))?;

            let get_str = |field: Field| -> Option<String> {
                doc.get_first(field).and_then(|v| match v {
                    OwnedValue::Str(s) => Some(s.clone()),
                    _ => None,
                })
            };

            let mut metadata = HashMap::new();
            if let Some(section) = get_str(self.section_field) {
                metadata.insert("section_title".to_string(), section);
            }

            hits.push(SparseHit {
                chunk_id: get_str(self.id_field).unwrap_or_default(),
                score,
                text: get_str(self.text_field).unwrap_or_default(),
                metadata,
            });
        }
        Ok(hits)
    }

    /// Remove chunks by id.
    pub fn delete(&self, chunk_ids: &[String]) -> Result<(), RagError> {
        let mut writer = self.writer.write();
        let writer = writer
            .as_mut()
            .ok_or_else(|| RagError::Index("writer not available".to_string()))?;
        for id in chunk_ids {
            writer.delete_term(tantivy::Term::from_field_text(self.id_field, id));
        }
        writer.commit().map_err(|e| RagError::Index(e.to_string()))?;
        self.reader
            .reload()
            .map_err(|e| RagError::Index(e.to_string()))?;
        Ok(())
    }

    pub fn doc_count(&self) -> u64 {
        self.reader.searcher().num_docs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn docs() -> Vec<SparseDoc> {
        vec![
            SparseDoc {
                chunk_id: "c1".into(),
                text: "Interest rates start at 9.5 percent per annum".into(),
                section_title: Some("Pricing".into()),
            },
            SparseDoc {
                chunk_id: "c2".into(),
                text: "Upload your identity documents to apply online".into(),
                section_title: Some("Application".into()),
            },
        ]
    }

    #[test]
    fn index_and_search() {
        let index = SparseIndex::new("en").unwrap();
        index.index_documents(&docs()).unwrap();
        assert_eq!(index.doc_count(), 2);

        let hits = index.search("interest rate", 5).unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].chunk_id, "c1");
        assert_eq!(
            hits[0].metadata.get("section_title").map(String::as_str),
            Some("Pricing")
        );
    }

    #[test]
    fn delete_removes_from_results() {
        let index = SparseIndex::new("en").unwrap();
        index.index_documents(&docs()).unwrap();
        index.delete(&["c1".to_string()]).unwrap();
        assert_eq!(index.doc_count(), 1);

        let hits = index.search("interest", 5).unwrap();
        assert!(hits.iter().all(|h| h.chunk_id != "c1"));
    }

    #[test]
    fn devanagari_text_is_searchable() {
        let index = SparseIndex::new("hi").unwrap();
        index
            .index_documents(&[SparseDoc {
                chunk_id: "c3".into(),
                text: "ब्याज दर नौ प्रतिशत से शुरू होती है".into(),
                section_title: None,
            }])
            .unwrap();
        let hits = index.search("ब्याज दर", 5).unwrap();
        assert_eq!(hits.len(), 1);
    }
}
