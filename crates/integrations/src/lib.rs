//! Integration dispatch.
//!
//! Agents carry integration bindings (a plugin id plus a JSON config).
//! During a call the dispatcher accumulates a per-session context; on
//! `call_ended` every enabled binding with that trigger runs through its
//! plugin with bounded retries. Failures are isolated per binding and
//! recorded as metrics.

mod context;
mod dispatcher;
mod plugin;
mod webhook;

pub use context::{CallContext, FunctionInvocation};
pub use dispatcher::{DispatchOutcome, Dispatcher, DispatcherConfig};
pub use plugin::{validate_config, IntegrationBinding, IntegrationPlugin, Trigger};
pub use webhook::WebhookPlugin;

use thiserror::Error;

/// Integration errors.
#[derive(Error, Debug)]
pub enum IntegrationError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("unknown plugin: {0}")]
    UnknownPlugin(String),

    #[error("no active context for session {0}")]
    NoContext(String),
}

impl IntegrationError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionFailed(_))
    }
}
