//! File logging for penlab-ctl.
//!
//! stdout carries command output, so diagnostics go to
//! `~/.penlab/logs/penlab-ctl.log` through a non-blocking writer. The returned
//! guard must live until exit or buffered lines are lost.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "PENLAB_CTL_LOG";
const LOG_FILE: &str = "penlab-ctl.log";

pub fn init() -> Option<WorkerGuard> {
    let log_dir = dirs::home_dir()?.join(".penlab").join("logs");
    if let Err(err) = fs_err::create_dir_all(&log_dir) {
        eprintln!("penlab-ctl: logging disabled: {}", err);
        return None;
    }

    let appender = tracing_appender::rolling::never(&log_dir, LOG_FILE);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .ok()?;
    Some(guard)
}
