use thiserror::Error;

use crate::store::StoreError;

/// Failures of the runtime around the cache: the entry store, tracing, signals.
#[derive(Debug, Error)]
pub enum InfraError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
    #[error("failed to listen for shutdown signal: {0}")]
    Signal(#[source] std::io::Error),
}

impl InfraError {
    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }
}
