//! Callbridge server.
//!
//! Wires the stores, the call orchestrator, the ingestion pipeline and
//! the knowledge retriever behind the `/api/v1` HTTP surface, with
//! liveness/readiness probes, Prometheus exposition and graceful
//! shutdown.

pub mod adapters;
pub mod error;
pub mod handlers;
pub mod http;
pub mod metrics;
pub mod runtime;
pub mod shutdown;
pub mod state;

pub use error::ApiError;
pub use http::create_router;
pub use metrics::init_metrics;
pub use shutdown::ShutdownCoordinator;
pub use state::AppState;

use thiserror::Error;

/// Server errors (outside the HTTP boundary).
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("startup error: {0}")]
    Startup(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] callbridge_persistence::PersistenceError),
}
