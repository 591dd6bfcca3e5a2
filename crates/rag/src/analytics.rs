//! Knowledge-base analytics.
//!
//! Pure aggregation over chunk records; the server feeds rows from the
//! datastore and exposes the result on the analytics routes.

use serde::{Deserialize, Serialize};

/// One chunk row as stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub chunk_id: String,
    pub document_id: String,
    pub token_count: usize,
    pub content_type: String,
    pub quality_score: f32,
    pub access_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_accessed_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Content-type counts.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContentTypeDistribution {
    pub text: usize,
    pub code: usize,
    pub table: usize,
    pub image: usize,
}

/// Quality-score histogram.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QualityBuckets {
    /// quality < 0.4
    pub low: usize,
    /// 0.4 <= quality < 0.7
    pub medium: usize,
    /// quality >= 0.7
    pub high: usize,
}

/// Namespace-level aggregates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunksAnalytics {
    pub total_chunks: usize,
    pub total_tokens: usize,
    pub avg_quality: f32,
    pub total_access_count: u64,
    pub content_types: ContentTypeDistribution,
    pub quality_buckets: QualityBuckets,
}

impl ChunksAnalytics {
    /// Aggregate over a namespace's chunk rows.
    pub fn compute(records: &[ChunkRecord]) -> Self {
        let total_chunks = records.len();
        let total_tokens = records.iter().map(|r| r.token_count).sum();
        let total_access_count = records.iter().map(|r| r.access_count).sum();
        let avg_quality = if total_chunks == 0 {
            0.0
        } else {
            records.iter().map(|r| r.quality_score).sum::<f32>() / total_chunks as f32
        };

        let mut content_types = ContentTypeDistribution::default();
        let mut quality_buckets = QualityBuckets::default();
        for record in records {
            match record.content_type.as_str() {
                "code" => content_types.code += 1,
                "table" => content_types.table += 1,
                "image" => content_types.image += 1,
                _ => content_types.text += 1,
            }
            if record.quality_score < 0.4 {
                quality_buckets.low += 1;
            } else if record.quality_score < 0.7 {
                quality_buckets.medium += 1;
            } else {
                quality_buckets.high += 1;
            }
        }

        Self {
            total_chunks,
            total_tokens,
            avg_quality,
            total_access_count,
            content_types,
            quality_buckets,
        }
    }
}

/// The most-accessed chunks of a namespace, strongest first.
pub fn hot_chunks(records: &[ChunkRecord], limit: usize) -> Vec<ChunkRecord> {
    let mut sorted: Vec<ChunkRecord> = records.to_vec();
    sorted.sort_by(|a, b| b.access_count.cmp(&a.access_count));
    sorted.truncate(limit);
    sorted
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, tokens: usize, kind: &str, quality: f32, access: u64) -> ChunkRecord {
        ChunkRecord {
            chunk_id: id.to_string(),
            document_id: "d1".to_string(),
            token_count: tokens,
            content_type: kind.to_string(),
            quality_score: quality,
            access_count: access,
            section_title: None,
            last_accessed_at: None,
        }
    }

    #[test]
    fn aggregates_totals_and_buckets() {
        let records = vec![
            record("c1", 100, "text", 0.9, 5),
            record("c2", 50, "table", 0.5, 2),
            record("c3", 25, "text", 0.2, 0),
        ];
        let analytics = ChunksAnalytics::compute(&records);

        assert_eq!(analytics.total_chunks, 3);
        assert_eq!(analytics.total_tokens, 175);
        assert_eq!(analytics.total_access_count, 7);
        assert!((analytics.avg_quality - 0.533).abs() < 0.01);
        assert_eq!(analytics.content_types.table, 1);
        assert_eq!(analytics.content_types.text, 2);
        assert_eq!(
            analytics.quality_buckets,
            QualityBuckets {
                low: 1,
                medium: 1,
                high: 1
            }
        );
    }

    #[test]
    fn empty_namespace_is_zeroed() {
        let analytics = ChunksAnalytics::compute(&[]);
        assert_eq!(analytics.total_chunks, 0);
        assert_eq!(analytics.avg_quality, 0.0);
    }

    #[test]
    fn hot_chunks_orders_by_access() {
        let records = vec![
            record("cold", 10, "text", 0.5, 1),
            record("hot", 10, "text", 0.5, 100),
            record("warm", 10, "text", 0.5, 10),
        ];
        let hot = hot_chunks(&records, 2);
        assert_eq!(hot.len(), 2);
        assert_eq!(hot[0].chunk_id, "hot");
        assert_eq!(hot[1].chunk_id, "warm");
    }
}
