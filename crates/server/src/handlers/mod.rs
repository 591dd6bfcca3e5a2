//! HTTP handlers, one module per resource.

pub mod agents;
pub mod analytics;
pub mod calls;
pub mod documents;
pub mod organizations;
