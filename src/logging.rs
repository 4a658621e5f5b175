//! Logging setup.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "flamenco_server=info,sqlx=warn";

/// Initialize the tracing subscriber.
///
/// Logs go to stderr; when `FLAMENCO_LOG_DIR` is set, a daily-rotated
/// file layer is added. The returned guard must stay alive for the file
/// writer to flush.
pub fn init() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    match std::env::var("FLAMENCO_LOG_DIR") {
        Ok(log_dir) => {
            let appender = tracing_appender::rolling::daily(log_dir, "flamenco-server.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        Err(_) => {
            registry.init();
            None
        }
    }
}
