//! Per-session latency tracking.
//!
//! Every stage of a live turn is timed against a configurable target.
//! Breaches publish a [`LatencyEvent::TargetExceeded`] and bump a metrics
//! counter; at session end the recorded samples are drained and flushed to
//! the metrics store in one batch.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Operations the live path times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    SttPartial,
    SttFinal,
    LlmTtft,
    LlmTotal,
    TtsTtfb,
    TtsTotal,
    SipConnect,
    ToolCall,
    /// User speech end to first audio byte of the reply.
    E2eTurn,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SttPartial => "stt_partial",
            Self::SttFinal => "stt_final",
            Self::LlmTtft => "llm_ttft",
            Self::LlmTotal => "llm_total",
            Self::TtsTtfb => "tts_ttfb",
            Self::TtsTotal => "tts_total",
            Self::SipConnect => "sip_connect",
            Self::ToolCall => "tool_call",
            Self::E2eTurn => "e2e_turn",
        }
    }

    pub fn all() -> &'static [Operation] {
        &[
            Self::SttPartial,
            Self::SttFinal,
            Self::LlmTtft,
            Self::LlmTotal,
            Self::TtsTtfb,
            Self::TtsTotal,
            Self::SipConnect,
            Self::ToolCall,
            Self::E2eTurn,
        ]
    }
}

/// Per-operation latency targets in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyTargets {
    targets_ms: HashMap<Operation, u64>,
}

impl Default for LatencyTargets {
    fn default() -> Self {
        let mut targets_ms = HashMap::new();
        targets_ms.insert(Operation::SttPartial, 300);
        targets_ms.insert(Operation::SttFinal, 500);
        targets_ms.insert(Operation::LlmTtft, 800);
        targets_ms.insert(Operation::LlmTotal, 3000);
        targets_ms.insert(Operation::TtsTtfb, 400);
        targets_ms.insert(Operation::TtsTotal, 5000);
        targets_ms.insert(Operation::SipConnect, 5000);
        targets_ms.insert(Operation::ToolCall, 2000);
        targets_ms.insert(Operation::E2eTurn, 1500);
        Self { targets_ms }
    }
}

impl LatencyTargets {
    pub fn target_for(&self, op: Operation) -> Option<Duration> {
        self.targets_ms.get(&op).map(|ms| Duration::from_millis(*ms))
    }

    pub fn set(&mut self, op: Operation, target: Duration) {
        self.targets_ms.insert(op, target.as_millis() as u64);
    }
}

/// An in-flight timing started with [`LatencyTracker::start`].
#[derive(Debug)]
pub struct LatencyHandle {
    op: Operation,
    started_at: Instant,
}

/// A completed measurement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencySample {
    pub operation: Operation,
    pub duration_ms: u64,
    pub exceeded_target: bool,
    pub recorded_at: chrono::DateTime<chrono::Utc>,
}

/// Events published by the tracker.
#[derive(Debug, Clone)]
pub enum LatencyEvent {
    TargetExceeded {
        operation: Operation,
        duration: Duration,
        target: Duration,
    },
}

/// Aggregate statistics for one operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationStats {
    pub operation: Operation,
    pub count: usize,
    pub exceeded_count: usize,
    pub min_ms: u64,
    pub avg_ms: u64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub max_ms: u64,
}

struct TrackerState {
    samples: Vec<LatencySample>,
}

/// Per-session latency tracker.
pub struct LatencyTracker {
    session_id: String,
    targets: LatencyTargets,
    state: Mutex<TrackerState>,
    event_tx: broadcast::Sender<LatencyEvent>,
}

impl LatencyTracker {
    pub fn new(session_id: impl Into<String>, targets: LatencyTargets) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            session_id: session_id.into(),
            targets,
            state: Mutex::new(TrackerState {
                samples: Vec::with_capacity(64),
            }),
            event_tx,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Subscribe to target-exceeded events.
    pub fn subscribe(&self) -> broadcast::Receiver<LatencyEvent> {
        self.event_tx.subscribe()
    }

    /// Begin timing an operation.
    pub fn start(&self, op: Operation) -> LatencyHandle {
        LatencyHandle {
            op,
            started_at: Instant::now(),
        }
    }

    /// Finish a timing and record it.
    pub fn end(&self, handle: LatencyHandle) -> Duration {
        let duration = handle.started_at.elapsed();
        self.mark(handle.op, duration);
        duration
    }

    /// Record a duration measured elsewhere.
    pub fn mark(&self, op: Operation, duration: Duration) {
        let target = self.targets.target_for(op);
        let exceeded = target.map(|t| duration > t).unwrap_or(false);

        metrics::histogram!("callbridge_latency_ms", "operation" => op.as_str())
            .record(duration.as_millis() as f64);

        if exceeded {
            metrics::counter!("callbridge_latency_target_exceeded", "operation" => op.as_str())
                .increment(1);
            if let Some(target) = target {
                tracing::warn!(
                    session_id = %self.session_id,
                    operation = op.as_str(),
                    duration_ms = duration.as_millis() as u64,
                    target_ms = target.as_millis() as u64,
                    "Latency target exceeded"
                );
                let _ = self.event_tx.send(LatencyEvent::TargetExceeded {
                    operation: op,
                    duration,
                    target,
                });
            }
        }

        self.state.lock().samples.push(LatencySample {
            operation: op,
            duration_ms: duration.as_millis() as u64,
            exceeded_target: exceeded,
            recorded_at: chrono::Utc::now(),
        });
    }

    /// Aggregate stats per operation for the session so far.
    pub fn session_stats(&self) -> Vec<OperationStats> {
        let state = self.state.lock();
        let mut by_op: HashMap<Operation, Vec<u64>> = HashMap::new();
        let mut exceeded: HashMap<Operation, usize> = HashMap::new();
        for sample in &state.samples {
            by_op.entry(sample.operation).or_default().push(sample.duration_ms);
            if sample.exceeded_target {
                *exceeded.entry(sample.operation).or_insert(0) += 1;
            }
        }

        let mut stats: Vec<OperationStats> = by_op
            .into_iter()
            .map(|(op, mut durations)| {
                durations.sort_unstable();
                let count = durations.len();
                let sum: u64 = durations.iter().sum();
                OperationStats {
                    operation: op,
                    count,
                    exceeded_count: exceeded.get(&op).copied().unwrap_or(0),
                    min_ms: durations[0],
                    avg_ms: sum / count as u64,
                    p50_ms: percentile(&durations, 0.50),
                    p95_ms: percentile(&durations, 0.95),
                    p99_ms: percentile(&durations, 0.99),
                    max_ms: durations[count - 1],
                }
            })
            .collect();
        stats.sort_by_key(|s| s.operation.as_str());
        stats
    }

    /// Drain the recorded samples for the batch flush at session end.
    pub fn drain(&self) -> Vec<LatencySample> {
        std::mem::take(&mut self.state.lock().samples)
    }
}

/// Nearest-rank percentile over a sorted slice.
fn percentile(sorted: &[u64], q: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((sorted.len() as f64) * q).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_end_records_sample() {
        let tracker = LatencyTracker::new("s1", LatencyTargets::default());
        let handle = tracker.start(Operation::LlmTtft);
        let duration = tracker.end(handle);
        assert!(duration.as_nanos() > 0);

        let stats = tracker.session_stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].count, 1);
    }

    #[test]
    fn exceeded_target_emits_event() {
        let mut targets = LatencyTargets::default();
        targets.set(Operation::TtsTtfb, Duration::from_millis(10));
        let tracker = LatencyTracker::new("s1", targets);
        let mut rx = tracker.subscribe();

        tracker.mark(Operation::TtsTtfb, Duration::from_millis(50));

        let event = rx.try_recv().expect("expected an event");
        match event {
            LatencyEvent::TargetExceeded { operation, .. } => {
                assert_eq!(operation, Operation::TtsTtfb);
            }
        }
        let stats = tracker.session_stats();
        assert_eq!(stats[0].exceeded_count, 1);
    }

    #[test]
    fn percentiles_over_known_distribution() {
        let tracker = LatencyTracker::new("s1", LatencyTargets::default());
        for ms in 1..=100u64 {
            tracker.mark(Operation::E2eTurn, Duration::from_millis(ms));
        }
        let stats = tracker.session_stats();
        let s = &stats[0];
        assert_eq!(s.min_ms, 1);
        assert_eq!(s.max_ms, 100);
        assert_eq!(s.p50_ms, 50);
        assert_eq!(s.p95_ms, 95);
        assert_eq!(s.p99_ms, 99);
    }

    #[test]
    fn drain_empties_samples() {
        let tracker = LatencyTracker::new("s1", LatencyTargets::default());
        tracker.mark(Operation::ToolCall, Duration::from_millis(5));
        assert_eq!(tracker.drain().len(), 1);
        assert!(tracker.session_stats().is_empty());
    }
}
