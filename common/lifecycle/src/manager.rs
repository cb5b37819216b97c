//! Lifecycle manager: runs the listener on a background task, races it against the
//! termination triggers, then drains it within a bounded grace period.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::error::LifecycleError;
use crate::handle::ShutdownHandle;
use crate::signals::ShutdownSignals;
use crate::state::ServerState;

/// Options for creating a lifecycle manager.
#[derive(Clone, Debug)]
pub struct ManagerOptions {
    pub name: String,
    /// How long the listener gets to finish in-flight work once draining starts.
    pub shutdown_grace_period: Duration,
    /// Install SIGINT/SIGTERM handlers (default: true).
    pub trap_signals: bool,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            name: "app".to_string(),
            shutdown_grace_period: Duration::from_secs(10),
            trap_signals: true,
        }
    }
}

/// The single event that moved the manager from Serving to Draining.
#[derive(Debug)]
pub enum ShutdownTrigger {
    /// SIGINT or SIGTERM, by name.
    Signal(&'static str),
    /// [`ShutdownHandle::request_shutdown`].
    Requested,
    /// The listener returned `Ok` without being asked to stop.
    ListenerExited,
    /// The listener returned an error or panicked.
    ListenerFailed(LifecycleError),
}

impl ShutdownTrigger {
    fn reason(&self) -> &'static str {
        match self {
            ShutdownTrigger::Signal(_) => "signal",
            ShutdownTrigger::Requested => "requested",
            ShutdownTrigger::ListenerExited => "listener_exited",
            ShutdownTrigger::ListenerFailed(_) => "listener_failed",
        }
    }
}

#[derive(Debug)]
pub enum ShutdownOutcome {
    /// The listener stopped on its own within the grace period.
    Graceful,
    /// In-flight work was abandoned; carries why.
    Forced(LifecycleError),
}

/// What happened during a [`Manager::serve`] run.
#[derive(Debug)]
pub struct ShutdownReport {
    pub trigger: ShutdownTrigger,
    pub outcome: ShutdownOutcome,
    /// Time from entering Draining to the listener task being gone.
    pub drain_duration: Duration,
}

impl ShutdownReport {
    pub fn is_graceful(&self) -> bool {
        matches!(self.outcome, ShutdownOutcome::Graceful)
    }

    /// A listener failure is a fatal error for the process. A forced close after a
    /// signal or request is not: the shutdown was still orderly.
    pub fn into_result(self) -> Result<(), LifecycleError> {
        match self.trigger {
            ShutdownTrigger::ListenerFailed(e) => Err(e),
            _ => Ok(()),
        }
    }
}

/// Builder for [`Manager`].
pub struct ManagerBuilder {
    options: ManagerOptions,
}

impl ManagerBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            options: ManagerOptions {
                name: name.to_string(),
                ..Default::default()
            },
        }
    }

    /// Accepts any duration type that implements `TryInto<Duration>`; invalid values keep the default.
    pub fn with_shutdown_grace_period<D>(mut self, d: D) -> Self
    where
        D: TryInto<Duration>,
    {
        if let Ok(d) = d.try_into() {
            self.options.shutdown_grace_period = d;
        }
        self
    }

    pub fn with_trap_signals(mut self, trap: bool) -> Self {
        self.options.trap_signals = trap;
        self
    }

    pub fn build(self) -> Manager {
        Manager::new(self.options)
    }
}

/// Drives one listener through Starting -> Serving -> Draining -> Stopped.
pub struct Manager {
    options: ManagerOptions,
    trigger_token: CancellationToken,
    drain_token: CancellationToken,
    state_tx: watch::Sender<ServerState>,
}

impl Manager {
    pub fn new(options: ManagerOptions) -> Self {
        let (state_tx, _) = watch::channel(ServerState::Starting);
        Self {
            options,
            trigger_token: CancellationToken::new(),
            drain_token: CancellationToken::new(),
            state_tx,
        }
    }

    pub fn builder(name: &str) -> ManagerBuilder {
        ManagerBuilder::new(name)
    }

    pub fn handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            trigger: self.trigger_token.clone(),
            drain: self.drain_token.clone(),
        }
    }

    pub fn state(&self) -> watch::Receiver<ServerState> {
        self.state_tx.subscribe()
    }

    /// Future that resolves when draining begins; hand it to the listener as its
    /// request to stop accepting and finish in-flight work.
    pub fn shutdown_signal(&self) -> impl Future<Output = ()> + Send + 'static {
        let token = self.drain_token.clone();
        async move {
            token.cancelled().await;
        }
    }

    /// Run `listener` to completion under the manager's supervision.
    ///
    /// Returns once the listener task is gone, so anything it borrowed (connection
    /// pools, sockets) can be released by the caller. `Err` means the run never
    /// started: signal handlers could not be installed, and the listener was dropped
    /// without being polled.
    pub async fn serve<F, E>(self, listener: F) -> Result<ShutdownReport, LifecycleError>
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let span = tracing::info_span!("lifecycle", app = %self.options.name);
        self.run(listener).instrument(span).await
    }

    async fn run<F, E>(self, listener: F) -> Result<ShutdownReport, LifecycleError>
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let mut signals = if self.options.trap_signals {
            Some(ShutdownSignals::install()?)
        } else {
            None
        };

        let (done_tx, mut done_rx) = oneshot::channel::<Result<(), String>>();
        let task = tokio::spawn(async move {
            let result = listener.await.map_err(|e| e.to_string());
            // Nobody is waiting any more if the manager already gave up on us.
            drop(done_tx.send(result));
        });
        self.transition(ServerState::Serving);

        let trigger = tokio::select! {
            biased;

            result = &mut done_rx => listener_trigger(result),
            name = wait_for_signal(&mut signals) => ShutdownTrigger::Signal(name),
            _ = self.trigger_token.cancelled() => ShutdownTrigger::Requested,
        };
        log_trigger(&trigger);

        self.transition(ServerState::Draining);
        self.drain_token.cancel();
        let drain_clock = Instant::now();
        let grace = self.options.shutdown_grace_period;

        // done_rx has already yielded if the listener itself was the trigger.
        let listener_stopped = matches!(
            trigger,
            ShutdownTrigger::ListenerExited | ShutdownTrigger::ListenerFailed(_)
        );
        let outcome = if listener_stopped {
            ShutdownOutcome::Graceful
        } else {
            match tokio::time::timeout(grace, &mut done_rx).await {
                Ok(Ok(Ok(()))) => ShutdownOutcome::Graceful,
                Ok(Ok(Err(reason))) => {
                    ShutdownOutcome::Forced(LifecycleError::ListenerFailed(reason))
                }
                Ok(Err(_)) => ShutdownOutcome::Forced(LifecycleError::ListenerPanicked),
                Err(_) => {
                    task.abort();
                    ShutdownOutcome::Forced(LifecycleError::ShutdownTimeout { elapsed: grace })
                }
            }
        };

        // The task must be gone, connections included, before the caller releases
        // anything the listener depends on.
        if let Err(e) = task.await {
            if e.is_panic() {
                debug!("Lifecycle: listener task panicked");
            }
        }
        let drain_duration = drain_clock.elapsed();

        match &outcome {
            ShutdownOutcome::Graceful => info!(
                result = "graceful",
                duration_secs = drain_duration.as_secs_f64(),
                "Lifecycle: listener stopped"
            ),
            ShutdownOutcome::Forced(reason) => warn!(
                result = "forced",
                duration_secs = drain_duration.as_secs_f64(),
                error = %reason,
                "Lifecycle: listener force-closed, in-flight requests abandoned"
            ),
        }
        self.transition(ServerState::Stopped);

        Ok(ShutdownReport {
            trigger,
            outcome,
            drain_duration,
        })
    }

    fn transition(&self, next: ServerState) {
        let previous = self.state_tx.send_replace(next);
        debug_assert!(
            previous.can_transition_to(next),
            "invalid lifecycle transition {previous} -> {next}"
        );
        info!(from = %previous, to = %next, "Lifecycle: state changed");
    }
}

fn listener_trigger(
    result: Result<Result<(), String>, oneshot::error::RecvError>,
) -> ShutdownTrigger {
    match result {
        Ok(Ok(())) => ShutdownTrigger::ListenerExited,
        Ok(Err(reason)) => ShutdownTrigger::ListenerFailed(LifecycleError::ListenerFailed(reason)),
        Err(_) => ShutdownTrigger::ListenerFailed(LifecycleError::ListenerPanicked),
    }
}

async fn wait_for_signal(signals: &mut Option<ShutdownSignals>) -> &'static str {
    match signals {
        Some(signals) => signals.recv().await,
        None => std::future::pending().await,
    }
}

fn log_trigger(trigger: &ShutdownTrigger) {
    let trigger_reason = trigger.reason();
    match trigger {
        ShutdownTrigger::Signal(signal) => {
            info!(trigger_reason, signal, "Lifecycle: shutdown initiated")
        }
        ShutdownTrigger::Requested => info!(trigger_reason, "Lifecycle: shutdown requested"),
        ShutdownTrigger::ListenerExited => warn!(
            trigger_reason,
            "Lifecycle: shutdown initiated, listener exited unexpectedly"
        ),
        ShutdownTrigger::ListenerFailed(e) => error!(
            trigger_reason,
            error = %e,
            "Lifecycle: shutdown initiated, listener failed"
        ),
    }
}
