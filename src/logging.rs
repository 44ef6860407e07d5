use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;

const AGENT_LOG_NAME: &str = "agent.log";

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "campaign_agent=debug"
    } else {
        "campaign_agent=info"
    }
}

/// Operator-facing logging on stderr. `RUST_LOG` overrides the default level.
pub fn init_cli(verbose: bool) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose))),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Where a run's log file lives: one directory per `log_path`.
pub fn agent_log_file(log_dir: &Path, log_path: &str) -> PathBuf {
    log_dir.join(log_path).join(AGENT_LOG_NAME)
}

/// Non-blocking writer appending to the run's log file, creating its directory.
fn agent_writer(log_dir: &Path, log_path: &str) -> Result<(NonBlocking, WorkerGuard), InitError> {
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(AGENT_LOG_NAME)
        .build(log_dir.join(log_path))?;
    Ok(tracing_appender::non_blocking(appender))
}

/// Logging for the background agent, whose stdout/stderr are discarded.
///
/// The returned guard flushes buffered lines when dropped; hold it until exit.
pub fn init_agent(log_dir: &Path, log_path: &str, debug: bool) -> Result<WorkerGuard, InitError> {
    let (writer, guard) = agent_writer(log_dir, log_path)?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(default_directive(debug)))
        .with_ansi(false)
        .with_thread_ids(true)
        .with_writer(writer)
        .init();

    Ok(guard)
}
