//! Logging setup for tor-manager-rs.
//!
//! All modules log through `tracing`. This module installs the global
//! subscriber and provides [`plog`] for level-driven messages.
//!
//! # Log Levels
//!
//! | Level | tracing level | Typical content |
//! |-------|---------------|-----------------|
//! | [`Debug`](crate::LogLevel::Debug) | `DEBUG` | Control traffic, Tor's own stdout (`tor` target) |
//! | [`Info`](crate::LogLevel::Info) | `INFO` | Listener changes, reconnects |
//! | [`Notice`](crate::LogLevel::Notice) | `INFO` | Lifecycle transitions (default) |
//! | [`Warn`](crate::LogLevel::Warn) | `WARN` | Crashes, restarts, lagging consumers |
//! | [`Error`](crate::LogLevel::Error) | `ERROR` | Fatal conditions |
//!
//! `RUST_LOG` overrides the configured level, e.g.
//! `RUST_LOG=tor_manager=debug,tor=info`.
//!
//! # Output Destinations
//!
//! ```rust,no_run
//! use tor_manager::{logger, LogLevel};
//!
//! // stdout with colors
//! logger::init(LogLevel::Notice, None).unwrap();
//! ```
//!
//! - `None`: stdout, ANSI colors
//! - `Some(":syslog:")`: the local syslog socket (Unix only)
//! - `Some(path)`: append to `path` through a non-blocking writer
//!
//! # What This Module Does NOT Do
//!
//! - **Log rotation**: use logrotate or similar

use std::io::Write;
use std::path::Path;
use std::sync::OnceLock;

use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use crate::config::LogLevel;
use crate::error::{Error, Result};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Later calls are no-ops.
///
/// # Errors
///
/// Returns [`Error::Io`] if the log file cannot be opened, or
/// [`Error::Config`] if no syslog socket exists or another subscriber is
/// already installed.
pub fn init(level: LogLevel, logfile: Option<&str>) -> Result<()> {
    if LOGGER_INITIALIZED.get().is_some() {
        return Ok(());
    }

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_directive(level)));

    match logfile {
        None => {
            let subscriber = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_thread_ids(false)
                .with_span_events(FmtSpan::NONE)
                .with_ansi(true)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| Error::Config(format!("failed to set logger: {}", e)))?;
        }
        Some(":syslog:") => init_syslog(env_filter)?,
        Some(path) => init_file_logger(path, env_filter)?,
    }

    LOGGER_INITIALIZED.get_or_init(|| ());
    Ok(())
}

/// `EnvFilter` directive for a configured level.
///
/// Tor's forwarded output (`tor` target) is only shown at debug.
pub fn filter_directive(level: LogLevel) -> String {
    let base = match level {
        LogLevel::Debug => "debug",
        LogLevel::Info | LogLevel::Notice => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    };
    if level == LogLevel::Debug {
        base.to_string()
    } else {
        format!("{},tor=warn", base)
    }
}

#[cfg(unix)]
fn init_syslog(env_filter: EnvFilter) -> Result<()> {
    let syslog_path = ["/dev/log", "/var/run/syslog"]
        .into_iter()
        .find(|p| Path::new(p).exists())
        .ok_or_else(|| Error::Config("no syslog socket found".to_string()))?;

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_ansi(false)
        .with_writer(move || SyslogWriter::connect(syslog_path))
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::Config(format!("failed to set logger: {}", e)))
}

#[cfg(not(unix))]
fn init_syslog(_env_filter: EnvFilter) -> Result<()> {
    Err(Error::Config(
        "syslog logging is only available on Unix".to_string(),
    ))
}

/// Datagram writer for the syslog socket; drops messages it cannot send.
#[cfg(unix)]
struct SyslogWriter {
    socket: Option<std::os::unix::net::UnixDatagram>,
}

#[cfg(unix)]
impl SyslogWriter {
    fn connect(path: &str) -> Self {
        let socket = std::os::unix::net::UnixDatagram::unbound()
            .and_then(|sock| sock.connect(path).map(|_| sock))
            .ok();
        Self { socket }
    }
}

#[cfg(unix)]
impl Write for SyslogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Some(ref socket) = self.socket {
            let msg = format!("tor-manager: {}", String::from_utf8_lossy(buf));
            socket.send(msg.as_bytes())?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn init_file_logger(path: &str, env_filter: EnvFilter) -> Result<()> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    let (writer, guard) = tracing_appender::non_blocking(file);

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_ansi(false)
        .with_writer(writer)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::Config(format!("failed to set logger: {}", e)))?;

    let _ = FILE_GUARD.set(guard);
    Ok(())
}

/// Logs `message` at `level`. Notice maps to `info!`.
///
/// ```rust
/// use tor_manager::{logger, LogLevel};
///
/// logger::plog(LogLevel::Notice, "Tor is running");
/// ```
pub fn plog(level: LogLevel, message: &str) {
    match level {
        LogLevel::Debug => debug!("{}", message),
        LogLevel::Info => info!("{}", message),
        LogLevel::Notice => info!("{}", message),
        LogLevel::Warn => warn!("{}", message),
        LogLevel::Error => error!("{}", message),
    }
}

/// [`plog`] with `format!` arguments.
///
/// ```rust
/// use tor_manager::{plog_fmt, LogLevel};
///
/// plog_fmt!(LogLevel::Notice, "SOCKS proxy at {}", "socks5://127.0.0.1:9050");
/// ```
#[macro_export]
macro_rules! plog_fmt {
    ($level:expr, $($arg:tt)*) => {
        $crate::logger::plog($level, &format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directive() {
        assert_eq!(filter_directive(LogLevel::Debug), "debug");
        assert_eq!(filter_directive(LogLevel::Notice), "info,tor=warn");
        assert_eq!(filter_directive(LogLevel::Error), "error,tor=warn");
    }

    #[test]
    fn test_plog_without_subscriber() {
        plog(LogLevel::Notice, "no subscriber installed");
        crate::plog_fmt!(LogLevel::Warn, "value {}", 1);
    }
}
