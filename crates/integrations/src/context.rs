//! Per-call integration context.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use callbridge_core::TranscriptEntry;

/// Everything a plugin may want to know about a finished call.
#[derive(Debug, Clone, Serialize)]
pub struct CallContext {
    pub session_id: String,
    pub agent_id: Option<String>,
    pub organization_id: String,
    pub call_type: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub transcript: Vec<TranscriptEntry>,
    /// Structured values captured by tools during the call, merged over
    /// each other in call order.
    pub extracted_data: Map<String, Value>,
    /// `(name, arguments, result)` per function call.
    pub function_calls: Vec<FunctionInvocation>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionInvocation {
    pub name: String,
    pub arguments: Value,
    pub result: Value,
    pub at: DateTime<Utc>,
}

impl CallContext {
    pub fn new(
        session_id: impl Into<String>,
        agent_id: Option<String>,
        organization_id: impl Into<String>,
        call_type: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            agent_id,
            organization_id: organization_id.into(),
            call_type: call_type.into(),
            started_at: Utc::now(),
            ended_at: None,
            transcript: Vec::new(),
            extracted_data: Map::new(),
            function_calls: Vec::new(),
        }
    }

    /// Append a transcript line.
    pub fn add_transcript_message(&mut self, entry: TranscriptEntry) {
        self.transcript.push(entry);
    }

    /// Record a function call; object results merge into extracted data.
    pub fn on_function_called(&mut self, name: &str, arguments: Value, result: Value) {
        if let Value::Object(fields) = &result {
            for (key, value) in fields {
                self.extracted_data.insert(key.clone(), value.clone());
            }
        }
        self.function_calls.push(FunctionInvocation {
            name: name.to_string(),
            arguments,
            result,
            at: Utc::now(),
        });
    }

    /// Close the context at call end.
    pub fn finish(&mut self) {
        self.ended_at = Some(Utc::now());
    }

    pub fn duration_seconds(&self) -> i64 {
        self.ended_at
            .map(|end| (end - self.started_at).num_seconds())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callbridge_core::Speaker;
    use serde_json::json;

    #[test]
    fn function_results_merge_into_extracted_data() {
        let mut context = CallContext::new("s1", Some("a1".into()), "o1", "inbound");
        context.on_function_called(
            "capture_lead",
            json!({"name": "Asha"}),
            json!({"lead_name": "Asha", "city": "Pune"}),
        );
        context.on_function_called(
            "capture_lead",
            json!({"city": "Mumbai"}),
            json!({"city": "Mumbai"}),
        );

        // Later calls overwrite earlier keys.
        assert_eq!(context.extracted_data["city"], "Mumbai");
        assert_eq!(context.extracted_data["lead_name"], "Asha");
        assert_eq!(context.function_calls.len(), 2);
    }

    #[test]
    fn transcript_accumulates_in_order() {
        let mut context = CallContext::new("s1", None, "o1", "web");
        context.add_transcript_message(TranscriptEntry::speech(Speaker::User, "hello"));
        context.add_transcript_message(TranscriptEntry::speech(Speaker::Agent, "hi"));
        assert_eq!(context.transcript.len(), 2);
        assert!(context.transcript[0].timestamp <= context.transcript[1].timestamp);
    }

    #[test]
    fn finish_sets_duration() {
        let mut context = CallContext::new("s1", None, "o1", "web");
        assert_eq!(context.duration_seconds(), 0);
        context.finish();
        assert!(context.duration_seconds() >= 0);
        assert!(context.ended_at.is_some());
    }
}
