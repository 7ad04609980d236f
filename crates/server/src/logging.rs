use std::path::PathBuf;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

const DEFAULT_FILTER: &str = "info,tower_http=warn,hyper=warn";
const LOG_FILE: &str = "server.log";

pub struct LoggingHandle {
    /// `stdout` or the log file path
    pub sink: String,
    pub guard: WorkerGuard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    fn parse(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            _ => LogFormat::Json,
        }
    }
}

/// Install the global subscriber.
///
/// Logs go to `$REPLHOST_LOG_DIR/server.log` when that is set and to stdout
/// otherwise. The returned guard must be held until shutdown so buffered
/// lines are flushed.
pub fn init_logging() -> anyhow::Result<LoggingHandle> {
    let (filter, filter_source) = filter_from_env();
    let format = LogFormat::parse(std::env::var("REPLHOST_LOG_FORMAT").ok().as_deref());
    let (writer, guard, sink) = open_sink(std::env::var("REPLHOST_LOG_DIR").ok())?;

    let fmt_layer = match format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .pretty()
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .with_writer(writer)
            .json()
            .flatten_event(true)
            .with_file(true)
            .with_line_number(true)
            .with_current_span(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter)
        .try_init()?;

    tracing::info!(
        component = "logging",
        event = "logging.initialized",
        sink = %sink,
        format = ?format,
        filter = %filter_source,
    );

    Ok(LoggingHandle { sink, guard })
}

/// `REPLHOST_LOG_FILTER`, then `RUST_LOG`, then the default.
fn filter_from_env() -> (EnvFilter, String) {
    ["REPLHOST_LOG_FILTER", "RUST_LOG"]
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .find_map(|value| EnvFilter::try_new(&value).ok().map(|f| (f, value)))
        .unwrap_or_else(|| (EnvFilter::new(DEFAULT_FILTER), DEFAULT_FILTER.to_string()))
}

fn open_sink(dir: Option<String>) -> anyhow::Result<(NonBlocking, WorkerGuard, String)> {
    match dir.filter(|d| !d.is_empty()) {
        Some(dir) => {
            let log_dir = PathBuf::from(dir);
            std::fs::create_dir_all(&log_dir)?;
            let appender = tracing_appender::rolling::never(&log_dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            Ok((writer, guard, log_dir.join(LOG_FILE).display().to_string()))
        }
        None => {
            let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
            Ok((writer, guard, "stdout".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_defaults_to_json() {
        assert_eq!(LogFormat::parse(None), LogFormat::Json);
        assert_eq!(LogFormat::parse(Some("PRETTY")), LogFormat::Pretty);
        assert_eq!(LogFormat::parse(Some("yaml")), LogFormat::Json);
    }

    #[test]
    fn file_sink_lands_in_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("logs");
        let (_, _guard, sink) = open_sink(Some(target.display().to_string())).unwrap();
        assert!(target.is_dir());
        assert!(sink.ends_with("logs/server.log"));
    }
}
