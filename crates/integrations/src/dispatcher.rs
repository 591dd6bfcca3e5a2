//! Trigger dispatch with per-binding retry.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use callbridge_core::TranscriptEntry;

use crate::context::CallContext;
use crate::plugin::{IntegrationBinding, IntegrationPlugin, Trigger};
use crate::IntegrationError;

/// Dispatcher tuning.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
        }
    }
}

/// Result of one binding execution.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub integration_id: String,
    pub tool_id: String,
    pub success: bool,
    pub attempts: u32,
    pub error: Option<String>,
}

/// The event bus for integrations.
pub struct Dispatcher {
    plugins: HashMap<&'static str, Arc<dyn IntegrationPlugin>>,
    contexts: DashMap<String, Arc<Mutex<CallContext>>>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            plugins: HashMap::new(),
            contexts: DashMap::new(),
            config,
        }
    }

    pub fn register(mut self, plugin: Arc<dyn IntegrationPlugin>) -> Self {
        self.plugins.insert(plugin.id(), plugin);
        self
    }

    pub fn plugin(&self, tool_id: &str) -> Option<Arc<dyn IntegrationPlugin>> {
        self.plugins.get(tool_id).cloned()
    }

    /// Open a session context at `call_started`.
    pub fn on_call_started(
        &self,
        session_id: &str,
        agent_id: Option<String>,
        organization_id: &str,
        call_type: &str,
    ) {
        let context = CallContext::new(session_id, agent_id, organization_id, call_type);
        self.contexts
            .insert(session_id.to_string(), Arc::new(Mutex::new(context)));
    }

    /// Feed a transcript line into the session context.
    pub fn add_transcript_message(&self, session_id: &str, entry: TranscriptEntry) {
        if let Some(context) = self.contexts.get(session_id) {
            context.lock().add_transcript_message(entry);
        }
    }

    /// Record a tool invocation into the session context.
    pub fn on_function_called(
        &self,
        session_id: &str,
        name: &str,
        arguments: Value,
        result: Value,
    ) {
        if let Some(context) = self.contexts.get(session_id) {
            context.lock().on_function_called(name, arguments, result);
        }
    }

    /// Run every matching binding for `call_ended`, then drop the
    /// context. Each binding retries independently; one failure never
    /// affects another.
    pub async fn dispatch_call_ended(
        &self,
        session_id: &str,
        bindings: &[IntegrationBinding],
    ) -> Result<Vec<DispatchOutcome>, IntegrationError> {
        let (_, context) = self
            .contexts
            .remove(session_id)
            .ok_or_else(|| IntegrationError::NoContext(session_id.to_string()))?;
        context.lock().finish();
        let snapshot = context.lock().clone();

        let mut outcomes = Vec::new();
        for binding in bindings.iter().filter(|b| b.wants(Trigger::CallEnded)) {
            let outcome = self.run_binding(binding, &snapshot).await;
            metrics::counter!(
                "callbridge_integration_dispatch",
                "tool" => binding.tool_id.clone(),
                "outcome" => if outcome.success { "success" } else { "failure" },
            )
            .increment(1);
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn run_binding(
        &self,
        binding: &IntegrationBinding,
        context: &CallContext,
    ) -> DispatchOutcome {
        let Some(plugin) = self.plugin(&binding.tool_id) else {
            return DispatchOutcome {
                integration_id: binding.integration_id.clone(),
                tool_id: binding.tool_id.clone(),
                success: false,
                attempts: 0,
                error: Some(format!("unknown plugin {}", binding.tool_id)),
            };
        };

        // Config is validated at the boundary; a drifted config fails the
        // binding without burning retries.
        if let Err(e) = crate::plugin::validate_config(&plugin.config_schema(), &binding.config) {
            return DispatchOutcome {
                integration_id: binding.integration_id.clone(),
                tool_id: binding.tool_id.clone(),
                success: false,
                attempts: 0,
                error: Some(e.to_string()),
            };
        }

        let mut backoff = self.config.initial_backoff;
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match plugin.execute(context, &binding.config).await {
                Ok(_) => {
                    tracing::info!(
                        integration = %binding.name,
                        tool = %binding.tool_id,
                        attempts,
                        "Integration dispatched"
                    );
                    return DispatchOutcome {
                        integration_id: binding.integration_id.clone(),
                        tool_id: binding.tool_id.clone(),
                        success: true,
                        attempts,
                        error: None,
                    };
                }
                Err(e) if e.is_transient() && attempts < self.config.max_retries => {
                    tracing::warn!(
                        integration = %binding.name,
                        attempts,
                        error = %e,
                        "Integration failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => {
                    tracing::error!(
                        integration = %binding.name,
                        attempts,
                        error = %e,
                        "Integration failed permanently"
                    );
                    return DispatchOutcome {
                        integration_id: binding.integration_id.clone(),
                        tool_id: binding.tool_id.clone(),
                        success: false,
                        attempts,
                        error: Some(e.to_string()),
                    };
                }
            }
        }
    }

    /// Snapshot of an active context, if any.
    pub fn context_snapshot(&self, session_id: &str) -> Option<CallContext> {
        self.contexts.get(session_id).map(|c| c.lock().clone())
    }

    pub fn active_contexts(&self) -> usize {
        self.contexts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use callbridge_core::Speaker;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyPlugin {
        failures_before_success: AtomicU32,
        always_fail: bool,
    }

    #[async_trait]
    impl IntegrationPlugin for FlakyPlugin {
        fn id(&self) -> &'static str {
            "flaky"
        }

        fn config_schema(&self) -> Value {
            json!({"type": "object"})
        }

        async fn execute(
            &self,
            _context: &CallContext,
            _config: &Value,
        ) -> Result<Value, IntegrationError> {
            if self.always_fail {
                return Err(IntegrationError::ConnectionFailed("down".into()));
            }
            if self.failures_before_success.load(Ordering::SeqCst) > 0 {
                self.failures_before_success.fetch_sub(1, Ordering::SeqCst);
                return Err(IntegrationError::ConnectionFailed("blip".into()));
            }
            Ok(json!({"ok": true}))
        }

        async fn test_connection(&self, _config: &Value) -> Result<(), IntegrationError> {
            Ok(())
        }
    }

    fn binding(tool_id: &str) -> IntegrationBinding {
        IntegrationBinding {
            integration_id: format!("{tool_id}-binding"),
            agent_id: "a1".into(),
            organization_id: "o1".into(),
            tool_id: tool_id.into(),
            name: format!("{tool_id} test"),
            config: json!({}),
            enabled_triggers: vec![Trigger::CallEnded],
            enabled: true,
        }
    }

    fn dispatcher(plugin: FlakyPlugin) -> Dispatcher {
        Dispatcher::new(DispatcherConfig {
            max_retries: 3,
            initial_backoff: Duration::from_millis(1),
        })
        .register(Arc::new(plugin))
    }

    #[tokio::test]
    async fn transient_failures_retry_to_success() {
        let dispatcher = dispatcher(FlakyPlugin {
            failures_before_success: AtomicU32::new(2),
            always_fail: false,
        });
        dispatcher.on_call_started("s1", Some("a1".into()), "o1", "inbound");
        dispatcher
            .add_transcript_message("s1", TranscriptEntry::speech(Speaker::User, "hi"));

        let outcomes = dispatcher
            .dispatch_call_ended("s1", &[binding("flaky")])
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].success);
        assert_eq!(outcomes[0].attempts, 3);
    }

    #[tokio::test]
    async fn permanent_failure_is_isolated() {
        let dispatcher = Dispatcher::new(DispatcherConfig {
            max_retries: 2,
            initial_backoff: Duration::from_millis(1),
        })
        .register(Arc::new(FlakyPlugin {
            failures_before_success: AtomicU32::new(0),
            always_fail: true,
        }));

        dispatcher.on_call_started("s1", None, "o1", "web");
        let bindings = vec![binding("flaky"), binding("missing-plugin")];
        let outcomes = dispatcher
            .dispatch_call_ended("s1", &bindings)
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| !o.success));
        // The failing plugin exhausted its retries.
        assert_eq!(outcomes[0].attempts, 2);
    }

    #[tokio::test]
    async fn disabled_bindings_are_skipped() {
        let dispatcher = dispatcher(FlakyPlugin {
            failures_before_success: AtomicU32::new(0),
            always_fail: false,
        });
        dispatcher.on_call_started("s1", None, "o1", "web");

        let mut disabled = binding("flaky");
        disabled.enabled = false;
        let outcomes = dispatcher
            .dispatch_call_ended("s1", &[disabled])
            .await
            .unwrap();
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn dispatch_without_context_errors() {
        let dispatcher = dispatcher(FlakyPlugin {
            failures_before_success: AtomicU32::new(0),
            always_fail: false,
        });
        assert!(matches!(
            dispatcher.dispatch_call_ended("ghost", &[]).await,
            Err(IntegrationError::NoContext(_))
        ));
    }

    #[tokio::test]
    async fn context_is_dropped_after_dispatch() {
        let dispatcher = dispatcher(FlakyPlugin {
            failures_before_success: AtomicU32::new(0),
            always_fail: false,
        });
        dispatcher.on_call_started("s1", None, "o1", "web");
        assert_eq!(dispatcher.active_contexts(), 1);
        let _ = dispatcher.dispatch_call_ended("s1", &[]).await.unwrap();
        assert_eq!(dispatcher.active_contexts(), 0);
    }
}
