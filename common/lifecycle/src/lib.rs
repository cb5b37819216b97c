//! Process lifecycle for a single network listener: SIGINT/SIGTERM trapping,
//! in-process shutdown requests, and a bounded graceful drain followed by a forced
//! close. Exactly one trigger starts the shutdown, and the listener task is fully
//! gone before [`Manager::serve`] returns.

mod error;
mod handle;
mod manager;
mod signals;
mod state;

pub use error::LifecycleError;
pub use handle::ShutdownHandle;
pub use manager::{
    Manager, ManagerBuilder, ManagerOptions, ShutdownOutcome, ShutdownReport, ShutdownTrigger,
};
pub use state::ServerState;
