//! Lifecycle error types.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The listener returned an error: it could not bind, or its accept loop died.
    #[error("listener failed: {0}")]
    ListenerFailed(String),

    /// The listener task panicked before reporting an outcome.
    #[error("listener task ended without reporting an outcome")]
    ListenerPanicked,

    /// The listener did not stop within the grace period and was force-closed.
    #[error("graceful shutdown timed out after {elapsed:?}")]
    ShutdownTimeout { elapsed: Duration },

    /// SIGINT/SIGTERM handlers could not be installed.
    #[error("failed to install signal handlers: {0}")]
    SignalHandler(#[from] std::io::Error),
}
