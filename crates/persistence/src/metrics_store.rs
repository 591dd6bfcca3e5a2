//! Call metrics store.
//!
//! Append-only; the latency tracker flushes one batch per session.
//! Reads aggregate by `(agent, type, window)` with percentiles computed
//! in process.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use callbridge_core::LatencySample;

use crate::{PersistenceError, ScyllaClient};

/// Metric classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Latency,
    FunctionCall,
    Error,
    Quality,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Latency => "latency",
            Self::FunctionCall => "function_call",
            Self::Error => "error",
            Self::Quality => "quality",
        }
    }
}

/// One metric row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallMetricRecord {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub metric_type: MetricType,
    pub metric_name: String,
    pub value: f64,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
}

impl CallMetricRecord {
    /// Build latency rows from a session's drained samples.
    pub fn from_latency_samples(
        session_id: &str,
        agent_id: &str,
        samples: &[LatencySample],
    ) -> Vec<Self> {
        samples
            .iter()
            .map(|sample| Self {
                session_id: session_id.to_string(),
                agent_id: Some(agent_id.to_string()),
                metric_type: MetricType::Latency,
                metric_name: sample.operation.as_str().to_string(),
                value: sample.duration_ms as f64,
                unit: "ms".to_string(),
                timestamp: sample.recorded_at,
            })
            .collect()
    }
}

/// Windowed aggregate for one metric name.
#[derive(Debug, Clone, Serialize)]
pub struct MetricAggregate {
    pub metric_name: String,
    pub count: usize,
    pub avg: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub max: f64,
}

/// Metrics operations.
#[async_trait]
pub trait MetricsStore: Send + Sync {
    async fn record_batch(&self, metrics: &[CallMetricRecord]) -> Result<(), PersistenceError>;

    async fn query_window(
        &self,
        agent_id: &str,
        metric_type: MetricType,
        since: DateTime<Utc>,
    ) -> Result<Vec<CallMetricRecord>, PersistenceError>;

    /// Percentile aggregation by metric name over a window.
    async fn aggregate_window(
        &self,
        agent_id: &str,
        metric_type: MetricType,
        since: DateTime<Utc>,
    ) -> Result<Vec<MetricAggregate>, PersistenceError> {
        let rows = self.query_window(agent_id, metric_type, since).await?;
        Ok(aggregate(rows))
    }
}

fn aggregate(rows: Vec<CallMetricRecord>) -> Vec<MetricAggregate> {
    use std::collections::HashMap;
    let mut by_name: HashMap<String, Vec<f64>> = HashMap::new();
    for row in rows {
        by_name.entry(row.metric_name).or_default().push(row.value);
    }
    let mut aggregates: Vec<MetricAggregate> = by_name
        .into_iter()
        .map(|(metric_name, mut values)| {
            values.sort_by(f64::total_cmp);
            let count = values.len();
            let sum: f64 = values.iter().sum();
            let pct = |q: f64| {
                let rank = ((count as f64) * q).ceil() as usize;
                values[rank.clamp(1, count) - 1]
            };
            MetricAggregate {
                metric_name,
                count,
                avg: sum / count as f64,
                p50: pct(0.50),
                p95: pct(0.95),
                p99: pct(0.99),
                max: values[count - 1],
            }
        })
        .collect();
    aggregates.sort_by(|a, b| a.metric_name.cmp(&b.metric_name));
    aggregates
}

/// Scylla implementation.
pub struct ScyllaMetricsStore {
    client: ScyllaClient,
}

impl ScyllaMetricsStore {
    pub fn new(client: ScyllaClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MetricsStore for ScyllaMetricsStore {
    async fn record_batch(&self, metrics: &[CallMetricRecord]) -> Result<(), PersistenceError> {
        let insert = format!(
            "INSERT INTO {}.call_metrics
             (agent_id, metric_type, ts, session_id, metric_name, value, unit)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            self.client.keyspace()
        );
        for metric in metrics {
            self.client
                .session()
                .query_unpaged(
                    insert.clone(),
                    (
                        metric.agent_id.as_deref().unwrap_or(""),
                        metric.metric_type.as_str(),
                        metric.timestamp.timestamp_millis(),
                        &metric.session_id,
                        &metric.metric_name,
                        metric.value,
                        &metric.unit,
                    ),
                )
                .await?;
        }
        Ok(())
    }

    async fn query_window(
        &self,
        agent_id: &str,
        metric_type: MetricType,
        since: DateTime<Utc>,
    ) -> Result<Vec<CallMetricRecord>, PersistenceError> {
        let query = format!(
            "SELECT ts, session_id, metric_name, value, unit
             FROM {}.call_metrics
             WHERE agent_id = ? AND metric_type = ? AND ts >= ?",
            self.client.keyspace()
        );
        let result = self
            .client
            .session()
            .query_unpaged(
                query,
                (
                    agent_id,
                    metric_type.as_str(),
                    since.timestamp_millis(),
                ),
            )
            .await?;

        let mut rows = Vec::new();
        if let Some(result_rows) = result.rows {
            for row in result_rows {
                let (ts, session_id, metric_name, value, unit): (
                    i64,
                    String,
                    String,
                    f64,
                    String,
                ) = row
                    .into_typed()
                    .map_err(|e| PersistenceError::InvalidData(e.to_string()))?;
                rows.push(CallMetricRecord {
                    session_id,
                    agent_id: Some(agent_id.to_string()),
                    metric_type,
                    metric_name,
                    value,
                    unit,
                    timestamp: DateTime::from_timestamp_millis(ts).unwrap_or_else(Utc::now),
                });
            }
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(name: &str, value: f64) -> CallMetricRecord {
        CallMetricRecord {
            session_id: "s1".into(),
            agent_id: Some("a1".into()),
            metric_type: MetricType::Latency,
            metric_name: name.into(),
            value,
            unit: "ms".into(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn aggregation_computes_percentiles() {
        let rows: Vec<CallMetricRecord> =
            (1..=100).map(|i| metric("llm_ttft", i as f64)).collect();
        let aggregates = aggregate(rows);
        assert_eq!(aggregates.len(), 1);
        let a = &aggregates[0];
        assert_eq!(a.count, 100);
        assert_eq!(a.p50, 50.0);
        assert_eq!(a.p95, 95.0);
        assert_eq!(a.max, 100.0);
    }

    #[test]
    fn latency_samples_map_to_rows() {
        use callbridge_core::Operation;
        let samples = vec![LatencySample {
            operation: Operation::E2eTurn,
            duration_ms: 900,
            exceeded_target: false,
            recorded_at: Utc::now(),
        }];
        let rows = CallMetricRecord::from_latency_samples("s1", "a1", &samples);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].metric_name, "e2e_turn");
        assert_eq!(rows[0].unit, "ms");
        assert_eq!(rows[0].value, 900.0);
    }
}
