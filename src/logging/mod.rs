//! Logging setup.
//!
//! Console output plus an optional daily-rotated file under `logs/`, both
//! behind a single `EnvFilter`. The returned guard must stay alive for the
//! process lifetime or buffered file output is lost.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "yoink=info,tower_http=warn,reqwest=warn";

/// Initialize logging. `log_dir` of `None` logs to the console only.
pub fn init(log_dir: Option<&str>) -> crate::Result<Option<WorkerGuard>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_ansi(true));

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, "yoink.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                .try_init()
                .map_err(|e| crate::Error::Other(format!("Failed to init logging: {e}")))?;
            Ok(Some(guard))
        }
        None => {
            registry
                .try_init()
                .map_err(|e| crate::Error::Other(format!("Failed to init logging: {e}")))?;
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_scopes_the_crate() {
        assert!(DEFAULT_LOG_FILTER.contains("yoink=info"));
    }
}
