//! End-to-end lifecycle tests against a stand-in Tor.
//!
//! The "tor" binary is a shell script that sleeps (or prints a fixed hash for
//! `--hash-password`); the control port is served in-process and answers the
//! commands the manager sends.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::watch;

use tor_manager::{Config, ManagerState, TorManager};

const EXIT_FP: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";

type Log = Arc<Mutex<Vec<String>>>;

const FAKE_HASH: &str = "16:0123456789ABCDEF0123456789ABCDEF0123456789ABCDEF0123456789";

fn fake_tor(dir: &Path) -> PathBuf {
    let path = dir.join("tor");
    let script = format!(
        "#!/bin/sh\nif [ \"$1\" = \"--hash-password\" ]; then echo {}; exit 0; fi\nexec sleep 30\n",
        FAKE_HASH
    );
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// In-process control port.
///
/// With a password set, only `AUTHENTICATE "<password>"` succeeds; otherwise
/// NULL authentication is offered. Commands starting with a prefix passed to
/// `reject` fail, and `hang_up` closes every open connection.
struct MockControl {
    port: u16,
    log: Log,
    rejected: Log,
    hangups: watch::Sender<u64>,
}

impl MockControl {
    async fn start(password: Option<&'static str>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let rejected: Log = Arc::new(Mutex::new(Vec::new()));
        let (hangups, _) = watch::channel(0u64);

        let accept_log = Arc::clone(&log);
        let accept_rejected = Arc::clone(&rejected);
        let accept_hangups = hangups.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let log = Arc::clone(&accept_log);
                let rejected = Arc::clone(&accept_rejected);
                let mut hangup = accept_hangups.subscribe();
                tokio::spawn(async move {
                    let (read, mut write) = stream.into_split();
                    let mut lines = BufReader::new(read).lines();
                    loop {
                        let line = tokio::select! {
                            line = lines.next_line() => match line {
                                Ok(Some(line)) => line,
                                _ => return,
                            },
                            _ = hangup.changed() => return,
                        };
                        log.lock().unwrap().push(line.clone());
                        let refuse = rejected
                            .lock()
                            .unwrap()
                            .iter()
                            .any(|prefix| line.starts_with(prefix.as_str()));
                        for reply in replies(&line, password, refuse) {
                            if write.write_all(format!("{}\r\n", reply).as_bytes()).await.is_err() {
                                return;
                            }
                        }
                    }
                });
            }
        });

        Self {
            port,
            log,
            rejected,
            hangups,
        }
    }

    fn reject(&self, prefix: &str) {
        self.rejected.lock().unwrap().push(prefix.to_string());
    }

    fn hang_up(&self) {
        self.hangups.send_modify(|n| *n += 1);
    }

    fn commands(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn auth_attempts(&self) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| c.starts_with("AUTHENTICATE"))
            .collect()
    }
}

fn replies(line: &str, password: Option<&str>, refuse: bool) -> Vec<String> {
    if line.starts_with("AUTHENTICATE") {
        let accepted = !refuse
            && match password {
                Some(pw) => line == format!("AUTHENTICATE \"{}\"", pw),
                None => line == "AUTHENTICATE",
            };
        let reply = if accepted {
            "250 OK"
        } else {
            "515 Authentication failed"
        };
        return vec![reply.to_string()];
    }
    if refuse {
        return vec!["552 Refused".to_string()];
    }

    let lines: &[&str] = match line {
        "PROTOCOLINFO 1" => {
            let methods = if password.is_some() {
                "250-AUTH METHODS=HASHEDPASSWORD"
            } else {
                "250-AUTH METHODS=NULL"
            };
            return vec![
                "250-PROTOCOLINFO 1".to_string(),
                methods.to_string(),
                "250-VERSION Tor=\"0.4.8.12\"".to_string(),
                "250 OK".to_string(),
            ];
        }
        "GETINFO version" => &["250-version=0.4.8.12", "250 OK"],
        "GETINFO circuit-status" => &["250-circuit-status=", "250 OK"],
        "GETINFO status/bootstrap-phase" => &[
            "250-status/bootstrap-phase=NOTICE BOOTSTRAP PROGRESS=100 TAG=done SUMMARY=\"Done\"",
            "250 OK",
        ],
        l if l.starts_with("GETINFO ns/id/") => &["552 Unrecognized key"],
        l if l.starts_with("SETEVENTS") => {
            return vec![
                "250 OK".to_string(),
                format!("650 CIRC 7 BUILT ${}~exitrelay PURPOSE=GENERAL", EXIT_FP),
            ]
        }
        _ => &["250 OK"],
    };
    lines.iter().map(|l| l.to_string()).collect()
}

fn test_config(dir: &TempDir, mock: &MockControl, max_restarts: u32, backoff_ms: u64) -> Config {
    Config {
        tor_path: Some(fake_tor(dir.path())),
        data_dir: dir.path().join("data"),
        socks_port: free_port(),
        control_port: mock.port,
        start_timeout_secs: 5,
        stop_timeout_secs: 1,
        command_timeout_secs: 2,
        max_restarts,
        max_reconnects: 3,
        restart_backoff_ms: backoff_ms,
        ..Config::default()
    }
}

async fn manager_with(dir: &TempDir, max_restarts: u32) -> (TorManager, MockControl) {
    let mock = MockControl::start(None).await;
    let config = test_config(dir, &mock, max_restarts, 50);
    (TorManager::new(config).unwrap(), mock)
}

async fn wait_until<F>(manager: &TorManager, mut done: F) -> bool
where
    F: FnMut(&tor_manager::StatusSnapshot) -> bool,
{
    for _ in 0..100 {
        if done(&manager.get_status()) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

fn kill_pid(pid: u32) {
    let status = std::process::Command::new("kill")
        .arg("-9")
        .arg(pid.to_string())
        .status()
        .unwrap();
    assert!(status.success());
}

#[tokio::test]
async fn test_start_status_and_stop() {
    let dir = TempDir::new().unwrap();
    let (manager, mock) = manager_with(&dir, 0).await;

    let started = manager.start().await;
    assert!(started.success, "{}", started.message);
    assert_eq!(started.state, ManagerState::Running);

    let status = manager.get_status();
    assert_eq!(status.state, ManagerState::Running);
    assert!(status.process_running);
    assert!(status.control_connected);
    assert!(status.pid.is_some());
    assert_eq!(status.tor_version.as_deref(), Some("0.4.8.12"));
    assert_eq!(status.bootstrap_progress, 100);

    assert!(wait_until(&manager, |s| s.current_exit.as_deref() == Some(EXIT_FP)).await);

    let again = manager.start().await;
    assert!(again.success);
    assert!(again.message.contains("already running"));

    let stopped = manager.stop().await;
    assert!(stopped.success, "{}", stopped.message);
    let status = manager.get_status();
    assert_eq!(status.state, ManagerState::Stopped);
    assert!(!status.process_running);
    assert!(status.circuits.is_empty());

    let commands = mock.commands();
    assert!(commands.iter().any(|c| c == "AUTHENTICATE"));
    assert!(commands.iter().any(|c| c == "SETEVENTS CIRC BW STATUS_CLIENT"));
    assert!(commands.iter().any(|c| c == "SIGNAL HALT"));

    let torrc = dir.path().join("data").join("torrc");
    assert!(!torrc.exists());
}

#[tokio::test]
async fn test_isolated_endpoints_open_listeners() {
    let dir = TempDir::new().unwrap();
    let (manager, mock) = manager_with(&dir, 0).await;
    assert!(manager.set_isolation_mode("per_tab").await.success);
    assert!(manager.start().await.success);

    let first = manager.get_isolated_endpoint("tab-1").await;
    let second = manager.get_isolated_endpoint("tab-2").await;
    let repeat = manager.get_isolated_endpoint("tab-1").await;
    assert!(first.success && second.success && repeat.success);
    assert_ne!(first.endpoint, second.endpoint);
    assert_ne!(first.session_group, second.session_group);
    assert_eq!(first.endpoint, repeat.endpoint);

    let socks_port = manager.config().socks_port;
    assert_ne!(first.endpoint.as_ref().unwrap().port, socks_port);
    assert_eq!(manager.get_status().isolation_contexts.len(), 2);

    let setconf: Vec<String> = mock
        .commands()
        .into_iter()
        .filter(|c| c.starts_with("SETCONF SocksPort"))
        .collect();
    assert_eq!(setconf.len(), 2);
    assert!(setconf[1].contains("SessionGroup="));

    assert!(manager.release_isolation("tab-1").await.success);
    assert_eq!(manager.get_status().isolation_contexts.len(), 1);

    manager.stop().await;
    assert!(manager.get_status().isolation_contexts.is_empty());
}

#[tokio::test]
async fn test_external_kill_without_restarts_pins_error() {
    let dir = TempDir::new().unwrap();
    let (manager, _mock) = manager_with(&dir, 0).await;
    assert!(manager.start().await.success);
    let pid = manager.get_status().pid.unwrap();

    kill_pid(pid);

    assert!(wait_until(&manager, |s| s.state == ManagerState::Error && s.fatal).await);
    let status = manager.get_status();
    assert!(!status.process_running);
    assert!(status.last_error.is_some());

    let stopped = manager.stop().await;
    assert!(stopped.success);
    assert_eq!(manager.get_status().state, ManagerState::Stopped);
}

#[tokio::test]
async fn test_crash_is_restarted() {
    let dir = TempDir::new().unwrap();
    let (manager, _mock) = manager_with(&dir, 2).await;
    assert!(manager.start().await.success);
    let pid = manager.get_status().pid.unwrap();

    kill_pid(pid);

    let restarted = wait_until(&manager, |s| {
        s.state == ManagerState::Running && s.restart_count == 1 && s.pid != Some(pid)
    })
    .await;
    assert!(restarted);
    assert!(manager.get_status().process_running);

    manager.stop().await;
}

#[tokio::test]
async fn test_exit_policy_update_while_running() {
    let dir = TempDir::new().unwrap();
    let (manager, mock) = manager_with(&dir, 0).await;
    assert!(manager.start().await.success);

    let update = tor_manager::ConfigUpdate::from_json(r#"{"exit_countries": ["DE"]}"#).unwrap();
    let result = manager.configure(update).await;
    assert!(result.success, "{}", result.message);

    let commands = mock.commands();
    assert!(commands
        .iter()
        .any(|c| c.starts_with("SETCONF ExitNodes=\"{de}\"")));
    assert!(commands.iter().any(|c| c == "SIGNAL NEWNYM"));

    assert!(manager.request_new_identity().await.success);
    manager.stop().await;
}

#[tokio::test]
async fn test_exit_policy_kept_when_newnym_fails() {
    let dir = TempDir::new().unwrap();
    let (manager, mock) = manager_with(&dir, 0).await;
    assert!(manager.start().await.success);
    mock.reject("SIGNAL NEWNYM");

    let update = tor_manager::ConfigUpdate::from_json(r#"{"exit_countries": ["nl"]}"#).unwrap();
    let result = manager.configure(update).await;
    assert!(result.success, "{}", result.message);
    assert_eq!(manager.config().exit_countries, ["nl"]);
    assert_eq!(manager.get_status().exit_policy.exit_countries, ["nl"]);
    assert!(mock
        .commands()
        .iter()
        .any(|c| c.starts_with("SETCONF ExitNodes=\"{nl}\"")));

    manager.stop().await;
}

#[tokio::test]
async fn test_rejected_exit_policy_leaves_config_unchanged() {
    let dir = TempDir::new().unwrap();
    let (manager, mock) = manager_with(&dir, 0).await;
    assert!(manager.start().await.success);
    mock.reject("SETCONF ExitNodes");

    let update = tor_manager::ConfigUpdate::from_json(r#"{"exit_countries": ["nl"]}"#).unwrap();
    let result = manager.configure(update).await;
    assert!(!result.success);
    assert!(manager.config().exit_countries.is_empty());

    manager.stop().await;
}

#[tokio::test]
async fn test_control_loss_reconnects_and_reauthenticates() {
    let dir = TempDir::new().unwrap();
    let mock = MockControl::start(None).await;
    // a slow first retry keeps the error window observable
    let manager = TorManager::new(test_config(&dir, &mock, 0, 400)).unwrap();
    assert!(manager.start().await.success);
    let pid = manager.get_status().pid;
    assert_eq!(mock.auth_attempts().len(), 1);

    mock.hang_up();

    assert!(wait_until(&manager, |s| s.state == ManagerState::Error && !s.fatal).await);
    assert!(
        wait_until(&manager, |s| s.state == ManagerState::Running && s.control_connected).await
    );
    let status = manager.get_status();
    assert!(status.process_running);
    assert_eq!(status.pid, pid);
    assert_eq!(status.restart_count, 0);
    assert!(status.last_error.is_none());
    assert_eq!(mock.auth_attempts().len(), 2);

    manager.stop().await;
}

#[tokio::test]
async fn test_failed_reauthentication_is_fatal() {
    let dir = TempDir::new().unwrap();
    let (manager, mock) = manager_with(&dir, 2).await;
    assert!(manager.start().await.success);

    mock.reject("AUTHENTICATE");
    mock.hang_up();

    assert!(wait_until(&manager, |s| s.state == ManagerState::Error && s.fatal).await);
    assert!(wait_until(&manager, |s| !s.process_running).await);
    let status = manager.get_status();
    assert_eq!(status.restart_count, 0);
    assert!(status.last_error.unwrap().contains("authentication failed"));

    assert!(manager.stop().await.success);
    assert_eq!(manager.get_status().state, ManagerState::Stopped);
}

#[tokio::test]
async fn test_reconnect_uses_password_tor_was_started_with() {
    let dir = TempDir::new().unwrap();
    let mock = MockControl::start(Some("old")).await;
    let config = Config {
        control_password: Some("old".to_string()),
        ..test_config(&dir, &mock, 0, 50)
    };
    let manager = TorManager::new(config).unwrap();
    let started = manager.start().await;
    assert!(started.success, "{}", started.message);

    let update = tor_manager::ConfigUpdate::from_json(r#"{"control_password": "new"}"#).unwrap();
    assert!(manager.configure(update).await.success);

    mock.hang_up();

    assert!(wait_until(&manager, |s| s.state == ManagerState::Error).await);
    assert!(
        wait_until(&manager, |s| s.state == ManagerState::Running && s.control_connected).await
    );
    let status = manager.get_status();
    assert!(!status.fatal);
    assert!(status.process_running);
    assert_eq!(
        mock.auth_attempts(),
        ["AUTHENTICATE \"old\"", "AUTHENTICATE \"old\""]
    );

    manager.stop().await;
}
