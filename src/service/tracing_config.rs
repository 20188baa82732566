use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use super::WireResult;

/// Console-only tracing setup, intended for tests and local runs.
///
/// The filter is taken from `RUST_LOG`.
pub fn setup_local_tracing() -> WireResult<()> {
    let timer = ChronoLocal::new("%Y-%m-%d %H:%M:%S%.6f".to_string());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(timer)
        .with_target(true)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_line_number(true);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    Ok(())
}

/// Full tracing setup: console plus an hourly-rolling log file written through
/// a non-blocking appender.
///
/// The returned guard must be kept alive for the lifetime of the process;
/// dropping it flushes and stops the appender worker.
pub fn setup_tracing(log_dir: &str, file_prefix: &str) -> WorkerGuard {
    let file_appender = tracing_appender::rolling::hourly(log_dir, file_prefix);
    let (non_blocking, worker_guard) = tracing_appender::non_blocking(file_appender);

    let writer = non_blocking.and(std::io::stdout);

    let timer = ChronoLocal::new("%Y-%m-%d %H:%M:%S%.6f".to_string());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(timer)
        .with_target(true)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(true)
        .with_writer(writer);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    worker_guard
}
