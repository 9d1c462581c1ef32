use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,tower_http=warn,hyper=warn";
const FILTER_ENV: &str = "CAPTURE_RELAY_LOG_FILTER";

pub struct LoggingHandle {
    pub run_id: String,
    pub guard: WorkerGuard,
}

fn log_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".capture-relay")
        .join("logs")
}

fn filter_source() -> String {
    std::env::var(FILTER_ENV)
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| DEFAULT_FILTER.to_string())
}

/// Install the global subscriber. Events go to `~/.capture-relay/logs/server.log`
/// as JSON unless `CAPTURE_RELAY_LOG_FORMAT=pretty`, or to stderr when
/// `CAPTURE_RELAY_LOG_STDERR=1`.
pub fn init_logging() -> anyhow::Result<LoggingHandle> {
    let to_stderr = std::env::var("CAPTURE_RELAY_LOG_STDERR").as_deref() == Ok("1");
    let log_path = log_dir().join("server.log");

    let (writer, guard) = if to_stderr {
        tracing_appender::non_blocking(std::io::stderr())
    } else {
        let dir = log_dir();
        std::fs::create_dir_all(&dir)?;
        tracing_appender::non_blocking(tracing_appender::rolling::never(&dir, "server.log"))
    };

    let filter =
        EnvFilter::try_new(filter_source()).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let format = std::env::var("CAPTURE_RELAY_LOG_FORMAT").unwrap_or_else(|_| "json".into());

    let registry = tracing_subscriber::registry().with(filter);
    if format.eq_ignore_ascii_case("pretty") {
        registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .pretty()
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(true),
            )
            .try_init()?;
    } else {
        registry
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .json()
                    .flatten_event(true)
                    .with_target(true)
                    .with_current_span(true),
            )
            .try_init()?;
    }

    let run_id = std::env::var("CAPTURE_RELAY_RUN_ID").unwrap_or_else(|_| {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        format!("pid-{}-{}", std::process::id(), now)
    });

    tracing::info!(
        component = "logging",
        event = "logging.initialized",
        run_id = %run_id,
        destination = if to_stderr { "stderr".to_string() } else { log_path.display().to_string() },
        format = %format,
        filter = %filter_source(),
    );

    Ok(LoggingHandle { run_id, guard })
}
