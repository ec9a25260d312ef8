use std::sync::OnceLock;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// Non-blocking writers stop on guard drop; park them for the process
// lifetime.
static WRITER_GUARDS: OnceLock<[WorkerGuard; 2]> = OnceLock::new();

/// Console output plus a daily-rotated file under `log_dir`. The filter
/// comes from `LOG_LEVEL`, then `RUST_LOG`, then defaults to info.
pub fn init(log_dir: &str) -> anyhow::Result<()> {
    std::fs::create_dir_all(log_dir)?;

    let (file_writer, file_guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, "cloudbrowser.log"));
    let (console_writer, console_guard) = tracing_appender::non_blocking(std::io::stdout());

    let filter = std::env::var("LOG_LEVEL")
        .ok()
        .map(EnvFilter::new)
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_target(true),
        )
        .with(fmt::layer().with_writer(console_writer).with_target(false))
        .init();

    let _ = WRITER_GUARDS.set([file_guard, console_guard]);

    info!("Logging to {log_dir}/cloudbrowser.log");
    Ok(())
}
