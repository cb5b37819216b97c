use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lifecycle::{
    LifecycleError, Manager, ServerState, ShutdownOutcome, ShutdownReport, ShutdownTrigger,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Manager without signal trapping; tests drive shutdown through the handle.
fn test_manager(grace: Duration) -> Manager {
    Manager::builder("test")
        .with_trap_signals(false)
        .with_shutdown_grace_period(grace)
        .build()
}

/// Every run gets a hard ceiling so a broken drain fails the test instead of hanging it.
async fn serve_with_deadline<F, E>(manager: Manager, listener: F) -> ShutdownReport
where
    F: std::future::Future<Output = Result<(), E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    tokio::time::timeout(Duration::from_secs(10), manager.serve(listener))
        .await
        .expect("serve did not return in time")
        .expect("serve failed to start")
}

/// Set when dropped; tells us whether the listener future was torn down.
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Fake listeners
// ---------------------------------------------------------------------------

/// Stops accepting when asked, then takes `drain` to finish in-flight work.
async fn cooperative_listener(
    shutdown: impl std::future::Future<Output = ()>,
    drain: Duration,
) -> Result<(), String> {
    shutdown.await;
    tokio::time::sleep(drain).await;
    Ok(())
}

/// Never finishes its in-flight work.
async fn stuck_listener(dropped: Arc<AtomicBool>) -> Result<(), String> {
    let _flag = DropFlag(dropped);
    std::future::pending::<()>().await;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test_log::test(tokio::test)]
async fn requested_shutdown_drains_gracefully() {
    let manager = test_manager(Duration::from_secs(5));
    let handle = manager.handle();
    let listener = cooperative_listener(manager.shutdown_signal(), Duration::ZERO);

    let requester = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.request_shutdown();
    });

    let report = serve_with_deadline(manager, listener).await;
    requester.await.unwrap();

    assert!(matches!(report.trigger, ShutdownTrigger::Requested));
    assert!(matches!(report.outcome, ShutdownOutcome::Graceful));
    assert!(report.is_graceful());
    assert!(report.into_result().is_ok());
}

#[test_log::test(tokio::test)]
async fn state_moves_forward_through_every_phase() {
    let manager = test_manager(Duration::from_secs(5));
    let handle = manager.handle();
    let mut state = manager.state();
    assert_eq!(*state.borrow(), ServerState::Starting);

    let listener = cooperative_listener(manager.shutdown_signal(), Duration::ZERO);
    let run = tokio::spawn(manager.serve(listener));

    state
        .wait_for(|s| *s == ServerState::Serving)
        .await
        .unwrap();
    assert!(!handle.is_shutting_down());

    handle.request_shutdown();
    state
        .wait_for(|s| *s == ServerState::Stopped)
        .await
        .unwrap();
    assert!(handle.is_shutting_down());

    let report = run.await.unwrap().unwrap();
    assert!(report.is_graceful());
}

#[test_log::test(tokio::test)]
async fn drain_waits_for_in_flight_work_within_grace_period() {
    let manager = test_manager(Duration::from_secs(5));
    let handle = manager.handle();
    let listener = cooperative_listener(manager.shutdown_signal(), Duration::from_millis(200));
    handle.request_shutdown();

    let report = serve_with_deadline(manager, listener).await;

    assert!(report.is_graceful());
    assert!(report.drain_duration >= Duration::from_millis(200));
}

#[test_log::test(tokio::test)]
async fn stuck_listener_is_force_closed_after_grace_period() {
    let grace = Duration::from_millis(200);
    let manager = test_manager(grace);
    let handle = manager.handle();
    let dropped = Arc::new(AtomicBool::new(false));
    let listener = stuck_listener(dropped.clone());

    let started = Instant::now();
    handle.request_shutdown();
    let report = serve_with_deadline(manager, listener).await;
    let elapsed = started.elapsed();

    match report.outcome {
        ShutdownOutcome::Forced(LifecycleError::ShutdownTimeout { elapsed: waited }) => {
            assert_eq!(waited, grace)
        }
        other => panic!("expected forced close on timeout, got {other:?}"),
    }
    // Forced close still counts as an orderly shutdown for the exit status.
    assert!(report.into_result().is_ok());

    // Listener torn down before serve returned, and not much later than the grace period.
    assert!(dropped.load(Ordering::SeqCst));
    assert!(elapsed >= grace);
    assert!(elapsed < grace + Duration::from_secs(2), "took {elapsed:?}");
}

#[test_log::test(tokio::test)]
async fn listener_failure_triggers_shutdown() {
    let manager = test_manager(Duration::from_secs(5));
    let handle = manager.handle();
    let listener = async { Err::<(), _>("listen tcp 127.0.0.1:8080: address already in use") };

    let report = serve_with_deadline(manager, listener).await;

    assert!(handle.is_shutting_down());
    assert!(report.is_graceful());
    match report.into_result() {
        Err(LifecycleError::ListenerFailed(msg)) => assert!(msg.contains("address already in use")),
        other => panic!("expected listener failure, got {other:?}"),
    }
}

#[test_log::test(tokio::test)]
async fn listener_exiting_on_its_own_is_not_an_error() {
    let manager = test_manager(Duration::from_secs(5));
    let report = serve_with_deadline(manager, async { Ok::<(), String>(()) }).await;

    assert!(matches!(report.trigger, ShutdownTrigger::ListenerExited));
    assert!(report.into_result().is_ok());
}

#[test_log::test(tokio::test)]
async fn listener_panic_is_reported_as_failure() {
    let manager = test_manager(Duration::from_secs(5));
    let listener = async {
        if true {
            panic!("accept loop exploded");
        }
        Ok::<(), String>(())
    };

    let report = serve_with_deadline(manager, listener).await;

    assert!(matches!(
        report.trigger,
        ShutdownTrigger::ListenerFailed(LifecycleError::ListenerPanicked)
    ));
}

#[test_log::test(tokio::test)]
async fn error_while_draining_downgrades_to_forced() {
    let manager = test_manager(Duration::from_secs(5));
    let handle = manager.handle();
    let shutdown = manager.shutdown_signal();
    let listener = async move {
        shutdown.await;
        Err::<(), _>("connection reset while draining")
    };
    handle.request_shutdown();

    let report = serve_with_deadline(manager, listener).await;

    assert!(matches!(report.trigger, ShutdownTrigger::Requested));
    assert!(matches!(
        report.outcome,
        ShutdownOutcome::Forced(LifecycleError::ListenerFailed(_))
    ));
    assert!(report.into_result().is_ok());
}

#[test_log::test(tokio::test)]
async fn concurrent_triggers_start_exactly_one_shutdown() {
    let manager = test_manager(Duration::from_secs(5));
    let handle = manager.handle();
    let state = manager.state();
    let listener = async { Err::<(), _>("listener died") };

    // Both triggers are live before the run starts.
    handle.request_shutdown();
    handle.request_shutdown();
    let report = serve_with_deadline(manager, listener).await;

    // Whichever trigger won, the run drained once and finished.
    assert!(matches!(
        report.trigger,
        ShutdownTrigger::Requested | ShutdownTrigger::ListenerFailed(_)
    ));
    assert_eq!(*state.borrow(), ServerState::Stopped);
}

#[test_log::test(tokio::test)]
async fn shutdown_recv_resolves_once_draining() {
    let manager = test_manager(Duration::from_secs(5));
    let handle = manager.handle();
    let observer = manager.handle();

    let watcher = tokio::spawn(async move {
        observer.shutdown_recv().await;
        observer.is_shutting_down()
    });

    let listener = cooperative_listener(manager.shutdown_signal(), Duration::ZERO);
    handle.request_shutdown();
    serve_with_deadline(manager, listener).await;

    assert!(watcher.await.unwrap());
}
