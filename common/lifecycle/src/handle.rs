//! In-process access to the shutdown machinery.

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Clone-able handle returned by [`Manager::handle`](crate::Manager::handle).
#[derive(Clone)]
pub struct ShutdownHandle {
    pub(crate) trigger: CancellationToken,
    pub(crate) drain: CancellationToken,
}

impl ShutdownHandle {
    /// Raise the termination trigger from inside the process; handled exactly like
    /// SIGINT/SIGTERM. Calling it more than once, or after another trigger won, is a no-op.
    pub fn request_shutdown(&self) {
        self.trigger.cancel();
    }

    /// True once the manager has entered Draining.
    pub fn is_shutting_down(&self) -> bool {
        self.drain.is_cancelled()
    }

    /// Future that resolves when draining begins. Use in `tokio::select!` to stop
    /// accepting new work.
    pub fn shutdown_recv(&self) -> WaitForCancellationFuture<'_> {
        self.drain.cancelled()
    }
}
