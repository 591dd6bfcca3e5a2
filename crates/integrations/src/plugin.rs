//! Integration plugin contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::CallContext;
use crate::IntegrationError;

/// Events a binding can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    CallStarted,
    CallEnded,
    TranscriptReady,
    Custom,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CallStarted => "call_started",
            Self::CallEnded => "call_ended",
            Self::TranscriptReady => "transcript_ready",
            Self::Custom => "custom",
        }
    }
}

/// One configured integration on an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationBinding {
    pub integration_id: String,
    pub agent_id: String,
    pub organization_id: String,
    /// Which plugin executes this binding.
    pub tool_id: String,
    pub name: String,
    /// Plugin-specific config; validated against the plugin's schema.
    /// Unknown fields are preserved verbatim.
    pub config: Value,
    pub enabled_triggers: Vec<Trigger>,
    pub enabled: bool,
}

impl IntegrationBinding {
    pub fn wants(&self, trigger: Trigger) -> bool {
        self.enabled && self.enabled_triggers.contains(&trigger)
    }
}

/// A pluggable integration.
#[async_trait]
pub trait IntegrationPlugin: Send + Sync {
    /// Stable plugin id referenced by bindings (`tool_id`).
    fn id(&self) -> &'static str;

    /// JSON schema of the accepted config.
    fn config_schema(&self) -> Value;

    /// Run the integration for a finished (or starting) call.
    async fn execute(
        &self,
        context: &CallContext,
        config: &Value,
    ) -> Result<Value, IntegrationError>;

    /// Verify the config can reach its target system.
    async fn test_connection(&self, config: &Value) -> Result<(), IntegrationError>;
}

/// Validate a binding config against a plugin's schema.
pub fn validate_config(schema: &Value, config: &Value) -> Result<(), IntegrationError> {
    let compiled = jsonschema::JSONSchema::compile(schema)
        .map_err(|e| IntegrationError::InvalidConfig(format!("bad schema: {e}")))?;
    if let Err(errors) = compiled.validate(config) {
        let details: Vec<String> = errors.map(|e| e.to_string()).take(5).collect();
        return Err(IntegrationError::InvalidConfig(details.join("; ")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "required": ["url"],
            "properties": {
                "url": {"type": "string"},
                "timeout_secs": {"type": "integer", "minimum": 1}
            }
        })
    }

    #[test]
    fn valid_config_passes() {
        let config = json!({"url": "https://example.com/hook", "timeout_secs": 5});
        assert!(validate_config(&schema(), &config).is_ok());
    }

    #[test]
    fn missing_required_field_fails() {
        let config = json!({"timeout_secs": 5});
        assert!(matches!(
            validate_config(&schema(), &config),
            Err(IntegrationError::InvalidConfig(_))
        ));
    }

    #[test]
    fn unknown_fields_are_preserved() {
        // Schema without additionalProperties:false keeps extra fields.
        let config = json!({"url": "https://example.com", "x_custom": {"a": 1}});
        assert!(validate_config(&schema(), &config).is_ok());
        assert_eq!(config["x_custom"]["a"], 1);
    }

    #[test]
    fn binding_trigger_filter() {
        let binding = IntegrationBinding {
            integration_id: "i1".into(),
            agent_id: "a1".into(),
            organization_id: "o1".into(),
            tool_id: "webhook".into(),
            name: "CRM push".into(),
            config: json!({}),
            enabled_triggers: vec![Trigger::CallEnded],
            enabled: true,
        };
        assert!(binding.wants(Trigger::CallEnded));
        assert!(!binding.wants(Trigger::CallStarted));

        let disabled = IntegrationBinding {
            enabled: false,
            ..binding
        };
        assert!(!disabled.wants(Trigger::CallEnded));
    }
}
