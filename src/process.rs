//! Tor child-process supervision.
//!
//! [`ProcessSupervisor`] owns one Tor child at a time. It resolves the
//! executable, writes the rendered torrc, spawns Tor, waits until the control
//! port accepts connections and then hands the [`Child`] to a monitor task.
//!
//! # Process Lifecycle
//!
//! ```text
//!   resolve_binary ──▶ write torrc (0600) ──▶ spawn ──▶ wait for control port
//!                                               │              │
//!                                               │       exit ──┴──▶ ProcessCrashed
//!                                               │    timeout ─────▶ kill + StartTimeout
//!                                               ▼
//!                                        monitor task ──▶ watch<Option<ExitRecord>>
//!                                               ▲
//!                          stop(grace) ─────────┘  wait, then kill via oneshot
//! ```
//!
//! Tor is launched with `__OwningControllerProcess <our pid>`, so it exits on
//! its own if the manager dies without stopping it. Its stdout and stderr are
//! forwarded line by line to `tracing` under the `tor` target.
//!
//! # What This Module Does NOT Do
//!
//! - **Speak the control protocol**: asking Tor to shut down cleanly
//!   (`SIGNAL HALT`) is the manager's job; this module only waits and kills.
//! - **Restart**: crash policy lives in the manager's supervising task.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::{is_hashed_password, Config, Endpoint};
use crate::error::{Error, Result};
use crate::torrc::ConfigPayload;

/// File name of the rendered torrc inside the data directory.
pub const TORRC_FILE_NAME: &str = "torrc";

const CONNECT_POLL: Duration = Duration::from_millis(100);
const HASH_TIMEOUT: Duration = Duration::from_secs(10);

/// How and when the child exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitRecord {
    /// Exit code, `None` if the process was killed by a signal.
    pub code: Option<i32>,
    /// Time the exit was observed.
    pub at: DateTime<Utc>,
}

/// Receiver side of the exit channel; `None` while the child runs.
pub type ExitWatch = watch::Receiver<Option<ExitRecord>>;

/// Supervises a single Tor child process.
#[derive(Debug, Default)]
pub struct ProcessSupervisor {
    torrc_path: Option<PathBuf>,
    pid: Option<u32>,
    started_at: Option<DateTime<Utc>>,
    exit_rx: Option<ExitWatch>,
    kill_tx: Option<oneshot::Sender<()>>,
    monitor: Option<JoinHandle<()>>,
}

impl ProcessSupervisor {
    /// Creates a supervisor with no child.
    pub fn new() -> Self {
        Self::default()
    }

    /// Launches Tor with `payload` and waits for its control port.
    ///
    /// `config` must already be prepared with [`launch_config`] so the data
    /// directory exists and is absolute.
    ///
    /// # Errors
    ///
    /// - [`Error::BinaryNotFound`] if no executable resolves
    /// - [`Error::Process`] if a child is already running or spawning fails
    /// - [`Error::ProcessCrashed`] if Tor exits before opening the control port
    /// - [`Error::StartTimeout`] if the control port stays closed; the child
    ///   is killed before returning
    pub async fn start(&mut self, payload: &ConfigPayload, config: &Config) -> Result<()> {
        if self.is_alive() {
            return Err(Error::Process("tor is already running".to_string()));
        }
        self.reset();

        let binary = resolve_binary(config)?;
        let torrc = config.data_dir.join(TORRC_FILE_NAME);
        write_torrc(&torrc, payload)?;

        tracing::info!(binary = %binary.display(), torrc = %torrc.display(), "starting tor");

        let mut child = Command::new(&binary)
            .arg("-f")
            .arg(&torrc)
            .arg("__OwningControllerProcess")
            .arg(std::process::id().to_string())
            .current_dir(&config.data_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Process(format!("cannot spawn {}: {}", binary.display(), e)))?;

        self.pid = child.id();
        self.started_at = Some(Utc::now());
        self.torrc_path = Some(torrc);

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel();
        self.monitor = Some(tokio::spawn(monitor(child, exit_tx, kill_rx)));
        self.exit_rx = Some(exit_rx.clone());
        self.kill_tx = Some(kill_tx);

        let endpoint = config.control_endpoint();
        let timeout = config.start_timeout();
        match tokio::time::timeout(timeout, wait_for_control(&endpoint, exit_rx)).await {
            Ok(Ok(())) => {
                tracing::info!(pid = ?self.pid, control = %endpoint, "tor control port is up");
                Ok(())
            }
            Ok(Err(e)) => {
                self.cleanup_torrc();
                Err(e)
            }
            Err(_) => {
                tracing::warn!(?timeout, "tor did not open its control port, killing it");
                self.kill().await;
                Err(Error::StartTimeout(timeout))
            }
        }
    }

    /// Waits up to `grace` for the child to exit, then kills it.
    ///
    /// Idempotent: stopping a supervisor without a child succeeds. The torrc
    /// is removed either way.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Process`] if the child survives the kill.
    pub async fn stop(&mut self, grace: Duration) -> Result<()> {
        let Some(mut exit_rx) = self.exit_rx.clone() else {
            self.cleanup_torrc();
            return Ok(());
        };

        if tokio::time::timeout(grace, wait_exit(&mut exit_rx))
            .await
            .is_err()
        {
            tracing::warn!(pid = ?self.pid, ?grace, "tor did not exit in time, killing it");
            if let Some(tx) = self.kill_tx.take() {
                let _ = tx.send(());
            }
            if tokio::time::timeout(grace.max(Duration::from_secs(1)), wait_exit(&mut exit_rx))
                .await
                .is_err()
            {
                return Err(Error::Process(format!(
                    "tor (pid {:?}) did not exit after kill",
                    self.pid
                )));
            }
        }

        if let Some(handle) = self.monitor.take() {
            let _ = handle.await;
        }
        self.cleanup_torrc();
        tracing::info!(pid = ?self.pid, "tor stopped");
        self.reset();
        Ok(())
    }

    /// Kills the child immediately and waits for it to be reaped.
    pub async fn kill(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.monitor.take() {
            let _ = handle.await;
        }
        self.cleanup_torrc();
    }

    /// Returns true while the child has not exited.
    pub fn is_alive(&self) -> bool {
        self.exit_rx
            .as_ref()
            .is_some_and(|rx| rx.borrow().is_none())
    }

    /// A receiver for the child's exit, if one was started.
    pub fn exit_watch(&self) -> Option<ExitWatch> {
        self.exit_rx.clone()
    }

    /// OS process id of the current child.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// When the current child was spawned.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Path of the torrc written for the current child.
    pub fn torrc_path(&self) -> Option<&Path> {
        self.torrc_path.as_deref()
    }

    fn cleanup_torrc(&mut self) {
        if let Some(path) = self.torrc_path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::debug!(path = %path.display(), error = %e, "cannot remove torrc");
                }
            }
        }
    }

    fn reset(&mut self) {
        self.pid = None;
        self.started_at = None;
        self.exit_rx = None;
        self.kill_tx = None;
        self.monitor = None;
    }
}

async fn monitor(
    mut child: Child,
    exit_tx: watch::Sender<Option<ExitRecord>>,
    kill_rx: oneshot::Receiver<()>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            if let Err(e) = child.start_kill() {
                tracing::debug!(error = %e, "kill failed");
            }
            child.wait().await
        }
    };

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            tracing::warn!(error = %e, "cannot reap tor");
            None
        }
    };
    tracing::debug!(?code, "tor exited");
    let _ = exit_tx.send(Some(ExitRecord {
        code,
        at: Utc::now(),
    }));
}

async fn forward_output<R>(stream: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(target: "tor", "{}", line);
    }
}

async fn wait_exit(rx: &mut ExitWatch) {
    let _ = rx.wait_for(|record| record.is_some()).await;
}

async fn wait_for_control(endpoint: &Endpoint, exit_rx: ExitWatch) -> Result<()> {
    let addr = endpoint.to_string();
    loop {
        let exited = *exit_rx.borrow();
        if let Some(record) = exited {
            return Err(Error::ProcessCrashed {
                code: record.code,
                restarts: 0,
            });
        }
        match TcpStream::connect(&addr).await {
            Ok(_) => return Ok(()),
            Err(e) => tracing::trace!(%addr, error = %e, "control port not ready"),
        }
        tokio::time::sleep(CONNECT_POLL).await;
    }
}

/// Finds the Tor executable.
///
/// Order: the explicit `tor_path`, the bundle directory candidates, then
/// every directory on `PATH`.
///
/// # Errors
///
/// Returns [`Error::BinaryNotFound`] listing what was searched.
pub fn resolve_binary(config: &Config) -> Result<PathBuf> {
    if let Some(ref path) = config.tor_path {
        return if is_executable(path) {
            Ok(path.clone())
        } else {
            Err(Error::BinaryNotFound(format!(
                "configured tor_path {} is not an executable file",
                path.display()
            )))
        };
    }

    let exe = format!("tor{}", std::env::consts::EXE_SUFFIX);
    let mut searched = Vec::new();

    if let Some(ref bundle) = config.bundle_dir {
        for candidate in [
            bundle.join(&exe),
            bundle.join("Tor").join(&exe),
            bundle.join("tor").join(&exe),
        ] {
            if is_executable(&candidate) {
                return Ok(candidate);
            }
            searched.push(candidate.display().to_string());
        }
    }

    if let Some(paths) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&paths) {
            let candidate = dir.join(&exe);
            if is_executable(&candidate) {
                return Ok(candidate);
            }
        }
        searched.push("$PATH".to_string());
    }

    Err(Error::BinaryNotFound(format!("searched {}", searched.join(", "))))
}

/// GeoIP directory to reference in the torrc.
///
/// The explicit `geoip_dir` wins; otherwise `<bundle>/data` or
/// `<bundle>/geoip`, whichever holds a `geoip` file.
pub fn resolve_geoip_dir(config: &Config) -> Option<PathBuf> {
    if let Some(ref dir) = config.geoip_dir {
        return Some(dir.clone());
    }
    let bundle = config.bundle_dir.as_ref()?;
    [bundle.join("data"), bundle.join("geoip")]
        .into_iter()
        .find(|dir| dir.join("geoip").is_file())
}

/// Prepares a copy of `config` for launching.
///
/// Creates the data directory (mode 0700 on Unix), makes it absolute, and
/// fills in the GeoIP directory.
///
/// # Errors
///
/// Returns [`Error::Io`] if the data directory cannot be created.
pub fn launch_config(config: &Config) -> Result<Config> {
    std::fs::create_dir_all(&config.data_dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&config.data_dir, std::fs::Permissions::from_mode(0o700))?;
    }

    let mut launch = config.clone();
    launch.data_dir = std::fs::canonicalize(&config.data_dir)?;
    launch.geoip_dir = resolve_geoip_dir(config);
    Ok(launch)
}

/// Writes the torrc atomically with owner-only permissions.
///
/// # Errors
///
/// Returns [`Error::Io`] on any filesystem failure.
pub fn write_torrc(path: &Path, payload: &ConfigPayload) -> Result<()> {
    use std::io::Write;

    let temp_path = path.with_extension("tmp");

    #[cfg(unix)]
    let mut file = {
        use std::os::unix::fs::OpenOptionsExt;
        std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&temp_path)?
    };

    #[cfg(not(unix))]
    let mut file = std::fs::File::create(&temp_path)?;

    file.write_all(payload.as_str().as_bytes())?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&temp_path, path)?;
    Ok(())
}

/// Hashes `plaintext` with `tor --hash-password`.
///
/// # Errors
///
/// Returns [`Error::Process`] if Tor cannot be run, fails, or prints no
/// `16:` hash.
pub async fn hash_password(binary: &Path, plaintext: &str) -> Result<String> {
    let output = Command::new(binary)
        .arg("--hash-password")
        .arg(plaintext)
        .arg("--quiet")
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(HASH_TIMEOUT, output)
        .await
        .map_err(|_| Error::Timeout("tor --hash-password".to_string()))?
        .map_err(|e| Error::Process(format!("cannot run {}: {}", binary.display(), e)))?;

    if !output.status.success() {
        return Err(Error::Process(format!(
            "tor --hash-password exited with {}",
            output.status
        )));
    }

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .rev()
        .find(|line| is_hashed_password(line))
        .map(str::to_string)
        .ok_or_else(|| Error::Process("tor --hash-password printed no hash".to_string()))
}

fn is_executable(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}
