use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Install the global subscriber: pretty console output when `debug`, JSON otherwise,
/// filtered by `RUST_LOG` (default `info`).
///
/// Lines are written by a background worker. Dropping the returned guard flushes and
/// stops it, so it must outlive every other part of the process.
pub fn init_tracing(debug: bool) -> WorkerGuard {
    let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let base_layer = fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_level(true);

    let log_layer = if debug {
        base_layer
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_ansi(true)
            .with_filter(filter)
            .boxed()
    } else {
        base_layer.json().with_filter(filter).boxed()
    };

    tracing_subscriber::registry().with(log_layer).init();
    guard
}
