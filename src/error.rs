//! Error types for tor-manager-rs.
//!
//! This module defines the [`enum@Error`] enum representing every failure the
//! manager can hit while supervising the Tor process, talking to its control
//! port, or validating caller input.
//!
//! # Error Categories
//!
//! ```text
//!   Error
//!   ├── Io                    ◄── File/network I/O failures
//!   ├── Config                ◄── Invalid configuration
//!   ├── Validation            ◄── Invalid caller input (bridge lines, keys)
//!   ├── InvalidIsolationMode  ◄── Unknown isolation mode name
//!   ├── BinaryNotFound        ◄── No usable Tor executable
//!   ├── Process               ◄── Spawn/kill failures
//!   ├── StartTimeout          ◄── Control port never became reachable
//!   ├── ProcessCrashed        ◄── Tor exited unexpectedly
//!   ├── Auth                  ◄── Control port authentication failed
//!   ├── NotAuthenticated      ◄── Command issued before authentication
//!   ├── Disconnected          ◄── Control connection dropped
//!   ├── CommandRejected       ◄── Non-2xx control reply
//!   ├── Protocol              ◄── Malformed control-protocol frame
//!   └── Timeout               ◄── Bounded wait elapsed
//! ```
//!
//! # Recovery Guide
//!
//! | Error | Recoverable | Handled by |
//! |-------|-------------|------------|
//! | [`Disconnected`](Error::Disconnected) | Yes | Reconnect + re-authenticate |
//! | [`ProcessCrashed`](Error::ProcessCrashed) | Yes, bounded | Restart with backoff |
//! | [`Timeout`](Error::Timeout) | Yes | Caller retry |
//! | [`BinaryNotFound`](Error::BinaryNotFound) | No | Fix `tor_path`/`bundle_dir` |
//! | [`Auth`](Error::Auth) | No after retries | Fix password/cookie setup |
//! | [`Config`](Error::Config) / [`Validation`](Error::Validation) | No | Fix input |
//!
//! At the caller-facing boundary these errors are folded into
//! [`OperationResult`](crate::manager::OperationResult) values instead of being
//! propagated, so an embedding UI can render them without unwinding.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during tor-manager-rs operations.
///
/// # Example
///
/// ```rust
/// use tor_manager::Error;
///
/// fn describe(err: &Error) -> &'static str {
///     if err.is_fatal() {
///         "giving up"
///     } else if err.is_recoverable() {
///         "retrying"
///     } else {
///         "fix the input"
///     }
/// }
///
/// assert_eq!(describe(&Error::Disconnected), "retrying");
/// assert_eq!(describe(&Error::BinaryNotFound("tor".into())), "giving up");
/// ```
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error during file or network operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    ///
    /// Invalid configuration values, TOML parsing failures, or an operation
    /// that the current configuration cannot satisfy.
    #[error("configuration error: {0}")]
    Config(String),

    /// Input validation error (bridge lines, isolation keys, country codes).
    #[error("validation error: {0}")]
    Validation(String),

    /// The requested isolation mode name is not one of the supported modes.
    #[error("invalid isolation mode: {0} (expected none, per_tab, per_domain or custom)")]
    InvalidIsolationMode(String),

    /// No usable Tor executable could be located.
    ///
    /// The message lists the locations that were searched.
    #[error("tor binary not found: {0}")]
    BinaryNotFound(String),

    /// The Tor child process could not be spawned, signalled or reaped.
    #[error("process error: {0}")]
    Process(String),

    /// The control port did not become connectable within the start timeout.
    #[error("tor did not open its control port within {0:?}")]
    StartTimeout(Duration),

    /// The Tor process exited while it was expected to be running.
    #[error("tor process exited unexpectedly (exit code {code:?}, {restarts} restart(s) attempted)")]
    ProcessCrashed {
        /// Exit code reported by the OS, `None` if killed by a signal.
        code: Option<i32>,
        /// Number of automatic restarts attempted before this error surfaced.
        restarts: u32,
    },

    /// Authentication with the control port failed.
    #[error("control port authentication failed: {0}")]
    Auth(String),

    /// A command was issued before authentication succeeded.
    #[error("control connection is not authenticated")]
    NotAuthenticated,

    /// The control connection dropped.
    #[error("control connection closed")]
    Disconnected,

    /// The control port answered with a non-success status code.
    #[error("command rejected ({code}): {message}")]
    CommandRejected {
        /// Three-digit status code from the reply.
        code: u16,
        /// Status text of the final reply line.
        message: String,
    },

    /// The control port sent something that is not a valid reply frame.
    #[error("control protocol error: {0}")]
    Protocol(String),

    /// A bounded wait elapsed.
    #[error("timed out: {0}")]
    Timeout(String),
}

impl Error {
    /// Returns true if the manager retries this error on its own.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Disconnected | Error::ProcessCrashed { .. } | Error::Timeout(_) | Error::Io(_)
        )
    }

    /// Returns true if the error pins the manager in the `error` state.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::BinaryNotFound(_) | Error::Auth(_))
    }
}

/// Result type alias for tor-manager-rs operations.
pub type Result<T> = std::result::Result<T, Error>;
