//! Structured logging init.
//!
//! Identical shape to the teacher's `main.rs` subscriber setup: JSON
//! output, target + thread ids included, level driven by `RUST_LOG` via
//! `EnvFilter`. `tracing-appender` gives us a non-blocking file sink when
//! `LOG_DIR` is set, otherwise logs go to stdout only — both paths share
//! one subscriber so span timing/attributes recorded by the tracer (C10)
//! land in the same stream operators already watch.
use tracing_appender::non_blocking::WorkerGuard;

/// Must be held for the lifetime of the process; dropping it stops the
/// non-blocking writer from flushing.
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

pub fn init_tracing() -> LoggingGuard {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let file_guard = if let Ok(dir) = std::env::var("LOG_DIR") {
        let file_appender = tracing_appender::rolling::daily(dir, "corpus-qa-server.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .json()
            .with_writer(non_blocking)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .json()
            .init();
        None
    };

    LoggingGuard {
        _file_guard: file_guard,
    }
}
