//! Control-port client.
//!
//! [`ControlClient`] owns one TCP connection to Tor's control port. A reader
//! task feeds incoming lines through [`ReplyParser`] and routes complete
//! frames:
//!
//! ```text
//!                       ┌──────────────┐   Frame::Reply   ┌──────────────┐
//!   TcpStream (read) ──▶│ reader task  │─────────────────▶│ mpsc replies │──▶ send_command
//!                       │ ReplyParser  │                  └──────────────┘
//!                       └──────┬───────┘
//!                              │ Frame::Event (650)
//!                              ▼
//!                    broadcast<ControlEvent> ──▶ subscribers (never block the reader)
//! ```
//!
//! Commands are serialized by an async mutex: exactly one synchronous command
//! is in flight, and its reply is the next non-event frame. Because the
//! protocol has no request ids, a command that times out closes the
//! connection; a late reply could otherwise be taken for the next command's.
//!
//! # Authentication
//!
//! | Method | Wire form |
//! |--------|-----------|
//! | Password | `AUTHENTICATE "<escaped password>"` |
//! | Cookie | `AUTHENTICATE <hex of the 32-byte cookie file>` |
//! | Null | `AUTHENTICATE` |
//!
//! [`ControlClient::authenticate_auto`] picks a method from `PROTOCOLINFO`.
//!
//! # See Also
//!
//! - [`crate::protocol`] - Reply framing
//! - [`crate::events`] - Typed events

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use zeroize::{Zeroize, Zeroizing};

use crate::config::Endpoint;
use crate::error::{Error, Result};
use crate::events::{CircuitEvent, ControlEvent, EventKind};
use crate::isolation::Listener;
use crate::protocol::{quote, split_arguments, Frame, Reply, ReplyParser};

/// Capacity of the event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

const COOKIE_LEN: usize = 32;

/// A wrapper for sensitive strings that clears itself on drop.
///
/// Debug output shows `[REDACTED]`; clones are zeroized independently.
///
/// ```rust
/// use tor_manager::SecurePassword;
///
/// let password = SecurePassword::new("hunter2".to_string());
/// assert_eq!(password.as_str(), "hunter2");
/// assert!(!format!("{:?}", password).contains("hunter2"));
/// ```
#[derive(Clone)]
pub struct SecurePassword(String);

impl SecurePassword {
    /// Wraps a password.
    pub fn new(password: String) -> Self {
        Self(password)
    }

    /// Borrows the password. Avoid copying it into an owned `String`.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Drop for SecurePassword {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for SecurePassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecurePassword([REDACTED])")
    }
}

/// How to authenticate with the control port.
#[derive(Debug, Clone)]
pub enum AuthMethod {
    /// `HashedControlPassword` authentication.
    Password(SecurePassword),
    /// `CookieAuthentication` with the given cookie file.
    Cookie(PathBuf),
    /// No authentication configured on the Tor side.
    Null,
}

/// Signals accepted by `SIGNAL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Switch to clean circuits for new streams.
    NewNym,
    /// Immediate clean shutdown.
    Halt,
    /// Shutdown after `ShutdownWaitLength`.
    Shutdown,
    /// Reload the torrc.
    Reload,
    /// Forget cached DNS answers.
    ClearDnsCache,
    /// Log a heartbeat message.
    Heartbeat,
}

impl Signal {
    /// Name used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::NewNym => "NEWNYM",
            Signal::Halt => "HALT",
            Signal::Shutdown => "SHUTDOWN",
            Signal::Reload => "RELOAD",
            Signal::ClearDnsCache => "CLEARDNSCACHE",
            Signal::Heartbeat => "HEARTBEAT",
        }
    }
}

/// A control command.
///
/// [`Command::to_wire`] is the only place commands are turned into text.
#[derive(Debug, Clone)]
pub enum Command {
    /// `PROTOCOLINFO 1`
    ProtocolInfo,
    /// `AUTHENTICATE [token]`, the token already wire-encoded.
    Authenticate(Option<SecurePassword>),
    /// `SETEVENTS ...`
    SetEvents(Vec<EventKind>),
    /// `SIGNAL ...`
    Signal(Signal),
    /// `GETINFO key ...`
    GetInfo(Vec<String>),
    /// `GETCONF key`
    GetConf(String),
    /// `SETCONF key="value" ...`; a `None` value resets the option.
    SetConf(Vec<(String, Option<String>)>),
}

impl Command {
    /// Command keyword, safe for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Command::ProtocolInfo => "PROTOCOLINFO",
            Command::Authenticate(_) => "AUTHENTICATE",
            Command::SetEvents(_) => "SETEVENTS",
            Command::Signal(_) => "SIGNAL",
            Command::GetInfo(_) => "GETINFO",
            Command::GetConf(_) => "GETCONF",
            Command::SetConf(_) => "SETCONF",
        }
    }

    /// The command line without its CRLF terminator.
    pub fn to_wire(&self) -> String {
        match self {
            Command::ProtocolInfo => "PROTOCOLINFO 1".to_string(),
            Command::Authenticate(None) => "AUTHENTICATE".to_string(),
            Command::Authenticate(Some(token)) => format!("AUTHENTICATE {}", token.as_str()),
            Command::SetEvents(kinds) => {
                let mut line = "SETEVENTS".to_string();
                for kind in kinds {
                    line.push(' ');
                    line.push_str(kind.as_str());
                }
                line
            }
            Command::Signal(signal) => format!("SIGNAL {}", signal.as_str()),
            Command::GetInfo(keys) => format!("GETINFO {}", keys.join(" ")),
            Command::GetConf(key) => format!("GETCONF {}", key),
            Command::SetConf(options) => {
                let mut line = "SETCONF".to_string();
                for (key, value) in options {
                    line.push(' ');
                    line.push_str(key);
                    if let Some(value) = value {
                        line.push('=');
                        line.push_str(&quote(value));
                    }
                }
                line
            }
        }
    }

    fn allowed_before_auth(&self) -> bool {
        matches!(self, Command::ProtocolInfo | Command::Authenticate(_))
    }
}

/// Parsed `PROTOCOLINFO` reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtocolInfo {
    /// Offered methods, e.g. `COOKIE`, `SAFECOOKIE`, `HASHEDPASSWORD`, `NULL`.
    pub auth_methods: Vec<String>,
    /// Cookie file path, if cookie authentication is offered.
    pub cookie_file: Option<PathBuf>,
    /// Tor version string.
    pub tor_version: Option<String>,
}

impl ProtocolInfo {
    fn from_reply(reply: &Reply) -> Self {
        let mut info = Self::default();
        for line in &reply.lines {
            if let Some(rest) = line.text.strip_prefix("AUTH ") {
                for (key, value) in split_arguments(rest) {
                    match key.as_str() {
                        "METHODS" => {
                            info.auth_methods = value.split(',').map(str::to_string).collect()
                        }
                        "COOKIEFILE" => info.cookie_file = Some(PathBuf::from(value)),
                        _ => {}
                    }
                }
            } else if let Some(rest) = line.text.strip_prefix("VERSION ") {
                info.tor_version = split_arguments(rest)
                    .into_iter()
                    .find(|(k, _)| k == "Tor")
                    .map(|(_, v)| v);
            }
        }
        info
    }

    fn offers(&self, method: &str) -> bool {
        self.auth_methods.iter().any(|m| m == method)
    }
}

/// Relay details for an exit fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitNodeInfo {
    /// Relay fingerprint.
    pub fingerprint: String,
    /// Relay nickname.
    pub nickname: String,
    /// Relay IP address.
    pub address: String,
    /// Two-letter country code, if Tor has GeoIP data.
    pub country: Option<String>,
}

struct CommandChannel {
    writer: OwnedWriteHalf,
    replies: mpsc::Receiver<Reply>,
}

/// An open control connection.
pub struct ControlClient {
    endpoint: Endpoint,
    channel: Mutex<CommandChannel>,
    events: broadcast::Sender<ControlEvent>,
    connected: Arc<AtomicBool>,
    authenticated: AtomicBool,
    command_timeout: Duration,
    reader: JoinHandle<()>,
}

impl fmt::Debug for ControlClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlClient")
            .field("endpoint", &self.endpoint)
            .field("connected", &self.is_connected())
            .field("authenticated", &self.is_authenticated())
            .finish_non_exhaustive()
    }
}

impl ControlClient {
    /// Connects to the control port.
    ///
    /// `command_timeout` bounds the connect itself and every later command.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if the connect does not complete in time,
    /// or [`Error::Io`] if it is refused.
    pub async fn connect(endpoint: &Endpoint, command_timeout: Duration) -> Result<Self> {
        let addr = endpoint.to_string();
        let stream = tokio::time::timeout(command_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::Timeout(format!("connecting to control port {}", addr)))??;
        let (read, writer) = stream.into_split();

        let (reply_tx, replies) = mpsc::channel(16);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let connected = Arc::new(AtomicBool::new(true));

        let reader = tokio::spawn(read_loop(
            read,
            reply_tx,
            events.clone(),
            Arc::clone(&connected),
        ));

        tracing::debug!(control = %endpoint, "control connection established");

        Ok(Self {
            endpoint: endpoint.clone(),
            channel: Mutex::new(CommandChannel { writer, replies }),
            events,
            connected,
            authenticated: AtomicBool::new(false),
            command_timeout,
            reader,
        })
    }

    /// The endpoint this client is connected to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Returns true until the connection drops or is closed.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Returns true once authentication succeeded on a live connection.
    pub fn is_authenticated(&self) -> bool {
        self.is_connected() && self.authenticated.load(Ordering::SeqCst)
    }

    /// Sends one command and waits for its reply.
    ///
    /// # Errors
    ///
    /// - [`Error::NotAuthenticated`] before authentication
    /// - [`Error::Disconnected`] if the connection is gone
    /// - [`Error::CommandRejected`] for a non-2xx reply
    /// - [`Error::Timeout`] if no reply arrives within the command timeout;
    ///   the connection is closed
    pub async fn send_command(&self, command: &Command) -> Result<Reply> {
        if !self.is_connected() {
            return Err(Error::Disconnected);
        }
        if !command.allowed_before_auth() && !self.authenticated.load(Ordering::SeqCst) {
            return Err(Error::NotAuthenticated);
        }

        let mut channel = self.channel.lock().await;
        let mut line = Zeroizing::new(command.to_wire());
        line.push_str("\r\n");

        if let Err(e) = channel.writer.write_all(line.as_bytes()).await {
            tracing::debug!(command = command.name(), error = %e, "control write failed");
            self.mark_closed();
            return Err(Error::Disconnected);
        }

        match tokio::time::timeout(self.command_timeout, channel.replies.recv()).await {
            Ok(Some(reply)) => {
                tracing::trace!(command = command.name(), status = reply.status, "reply");
                reply.into_result()
            }
            Ok(None) => {
                self.mark_closed();
                Err(Error::Disconnected)
            }
            Err(_) => {
                tracing::warn!(
                    command = command.name(),
                    timeout = ?self.command_timeout,
                    "no reply from control port, closing connection"
                );
                self.close();
                Err(Error::Timeout(format!("{} reply", command.name())))
            }
        }
    }

    /// Sends `PROTOCOLINFO`.
    ///
    /// # Errors
    ///
    /// See [`ControlClient::send_command`].
    pub async fn protocol_info(&self) -> Result<ProtocolInfo> {
        let reply = self.send_command(&Command::ProtocolInfo).await?;
        Ok(ProtocolInfo::from_reply(&reply))
    }

    /// Authenticates with an explicit method.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Auth`] if the cookie cannot be read or Tor rejects
    /// the credentials, or a connection error.
    pub async fn authenticate(&self, method: &AuthMethod) -> Result<()> {
        let token = match method {
            AuthMethod::Password(password) => {
                Some(SecurePassword::new(quote(password.as_str())))
            }
            AuthMethod::Cookie(path) => {
                let mut cookie = tokio::fs::read(path).await.map_err(|e| {
                    Error::Auth(format!("cannot read cookie {}: {}", path.display(), e))
                })?;
                if cookie.len() != COOKIE_LEN {
                    cookie.zeroize();
                    return Err(Error::Auth(format!(
                        "cookie {} is not {} bytes",
                        path.display(),
                        COOKIE_LEN
                    )));
                }
                let token = SecurePassword::new(hex::encode(&cookie));
                cookie.zeroize();
                Some(token)
            }
            AuthMethod::Null => None,
        };

        match self.send_command(&Command::Authenticate(token)).await {
            Ok(_) => {
                self.authenticated.store(true, Ordering::SeqCst);
                tracing::debug!(control = %self.endpoint, "authenticated");
                Ok(())
            }
            Err(Error::CommandRejected { message, .. }) => Err(Error::Auth(message)),
            Err(e) => Err(e),
        }
    }

    /// Authenticates with whatever `PROTOCOLINFO` offers.
    ///
    /// Preference: `NULL`, then the password if one is given and
    /// `HASHEDPASSWORD` is offered, then the cookie.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Auth`] if no offered method can be used.
    pub async fn authenticate_auto(&self, password: Option<&SecurePassword>) -> Result<()> {
        let info = self.protocol_info().await?;

        let method = if info.offers("NULL") {
            AuthMethod::Null
        } else if let Some(pw) = password.filter(|_| info.offers("HASHEDPASSWORD")) {
            AuthMethod::Password(pw.clone())
        } else if let Some(path) = info.cookie_file.clone().filter(|_| info.offers("COOKIE")) {
            AuthMethod::Cookie(path)
        } else {
            return Err(Error::Auth(format!(
                "no usable authentication method (offered: {})",
                info.auth_methods.join(",")
            )));
        };

        self.authenticate(&method).await
    }

    /// Subscribes to the event channel and enables `kinds` on the Tor side.
    ///
    /// The receiver is created before `SETEVENTS` is sent, so no event
    /// emitted after the command is missed.
    ///
    /// # Errors
    ///
    /// See [`ControlClient::send_command`].
    pub async fn subscribe_events(
        &self,
        kinds: &[EventKind],
    ) -> Result<broadcast::Receiver<ControlEvent>> {
        let rx = self.events.subscribe();
        self.send_command(&Command::SetEvents(kinds.to_vec()))
            .await?;
        Ok(rx)
    }

    /// A new receiver on the event channel, without changing `SETEVENTS`.
    pub fn events(&self) -> broadcast::Receiver<ControlEvent> {
        self.events.subscribe()
    }

    /// Sends a signal.
    ///
    /// # Errors
    ///
    /// See [`ControlClient::send_command`].
    pub async fn signal(&self, signal: Signal) -> Result<()> {
        self.send_command(&Command::Signal(signal)).await?;
        Ok(())
    }

    /// Requests clean circuits (`SIGNAL NEWNYM`).
    ///
    /// # Errors
    ///
    /// See [`ControlClient::send_command`].
    pub async fn new_identity(&self) -> Result<()> {
        self.signal(Signal::NewNym).await
    }

    /// Sets (or with `None`, resets) options in one `SETCONF`.
    ///
    /// Tor applies the whole command or none of it.
    ///
    /// # Errors
    ///
    /// See [`ControlClient::send_command`].
    pub async fn set_conf(&self, options: &[(String, Option<String>)]) -> Result<()> {
        self.send_command(&Command::SetConf(options.to_vec())).await?;
        Ok(())
    }

    /// Replaces every SOCKS listener with `listeners`.
    ///
    /// # Errors
    ///
    /// See [`ControlClient::send_command`].
    pub async fn set_socks_listeners(&self, listeners: &[Listener]) -> Result<()> {
        let options: Vec<(String, Option<String>)> = listeners
            .iter()
            .map(|l| ("SocksPort".to_string(), Some(l.socks_port_value())))
            .collect();
        self.set_conf(&options).await
    }

    /// Values of a configuration option. An unset option yields no values.
    ///
    /// # Errors
    ///
    /// See [`ControlClient::send_command`].
    pub async fn get_conf(&self, key: &str) -> Result<Vec<String>> {
        let reply = self.send_command(&Command::GetConf(key.to_string())).await?;
        Ok(reply
            .lines
            .iter()
            .filter_map(|line| {
                let (k, v) = line.text.split_once('=')?;
                k.eq_ignore_ascii_case(key).then(|| v.to_string())
            })
            .collect())
    }

    /// `GETINFO` for a single key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the reply lacks the key, otherwise see
    /// [`ControlClient::send_command`].
    pub async fn get_info(&self, key: &str) -> Result<String> {
        let reply = self
            .send_command(&Command::GetInfo(vec![key.to_string()]))
            .await?;
        reply
            .value(key)
            .map(str::to_string)
            .ok_or_else(|| Error::Protocol(format!("GETINFO reply without {}", key)))
    }

    /// Current circuits from `GETINFO circuit-status`.
    ///
    /// # Errors
    ///
    /// See [`ControlClient::get_info`].
    pub async fn circuit_status(&self) -> Result<Vec<CircuitEvent>> {
        let body = self.get_info("circuit-status").await?;
        Ok(body
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| match CircuitEvent::parse(l) {
                Ok(c) => Some(c),
                Err(e) => {
                    tracing::debug!(line = l, error = %e, "skipping circuit-status line");
                    None
                }
            })
            .collect())
    }

    /// Tor's version string.
    ///
    /// # Errors
    ///
    /// See [`ControlClient::get_info`].
    pub async fn version(&self) -> Result<String> {
        self.get_info("version").await
    }

    /// Bootstrap percentage from `status/bootstrap-phase`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the phase has no `PROGRESS`.
    pub async fn bootstrap_progress(&self) -> Result<u8> {
        let phase = self.get_info("status/bootstrap-phase").await?;
        split_arguments(&phase)
            .into_iter()
            .find(|(k, _)| k == "PROGRESS")
            .and_then(|(_, v)| v.parse::<u8>().ok())
            .map(|p| p.min(100))
            .ok_or_else(|| Error::Protocol(format!("no PROGRESS in {:?}", phase)))
    }

    /// Nickname, address and country of a relay.
    ///
    /// A missing GeoIP database leaves `country` empty instead of failing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the consensus entry has no router line.
    pub async fn exit_node_info(&self, fingerprint: &str) -> Result<ExitNodeInfo> {
        let entry = self.get_info(&format!("ns/id/{}", fingerprint)).await?;
        let router = entry
            .lines()
            .find_map(|l| l.strip_prefix("r "))
            .ok_or_else(|| Error::Protocol(format!("no router line for {}", fingerprint)))?;
        let words: Vec<&str> = router.split_whitespace().collect();
        let (nickname, address) = match (words.first(), words.get(5)) {
            (Some(n), Some(a)) => (n.to_string(), a.to_string()),
            _ => {
                return Err(Error::Protocol(format!(
                    "malformed router line for {}",
                    fingerprint
                )))
            }
        };

        let country = match self.get_info(&format!("ip-to-country/{}", address)).await {
            Ok(cc) if cc != "??" && !cc.is_empty() => Some(cc.to_ascii_lowercase()),
            Ok(_) => None,
            Err(Error::CommandRejected { message, .. }) => {
                tracing::debug!(%address, %message, "no country for exit");
                None
            }
            Err(e) => return Err(e),
        };

        Ok(ExitNodeInfo {
            fingerprint: fingerprint.to_string(),
            nickname,
            address,
            country,
        })
    }

    /// Closes the connection. Subscribers get [`ControlEvent::ConnectionClosed`].
    pub fn close(&self) {
        self.reader.abort();
        self.mark_closed();
    }

    fn mark_closed(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(ControlEvent::ConnectionClosed);
        }
    }
}

impl Drop for ControlClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(
    read: OwnedReadHalf,
    replies: mpsc::Sender<Reply>,
    events: broadcast::Sender<ControlEvent>,
    connected: Arc<AtomicBool>,
) {
    let mut reader = BufReader::new(read);
    let mut parser = ReplyParser::new();
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => {
                tracing::debug!("control connection closed by tor");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(error = %e, "control read failed");
                break;
            }
        }

        let line = String::from_utf8_lossy(&buf);
        match parser.push_line(&line) {
            Ok(None) => {}
            Ok(Some(Frame::Event(reply))) => {
                let _ = events.send(ControlEvent::from_reply(&reply));
            }
            Ok(Some(Frame::Reply(reply))) => {
                if replies.send(reply).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "unparseable control data, dropping connection");
                break;
            }
        }
    }

    if connected.swap(false, Ordering::SeqCst) {
        let _ = events.send(ControlEvent::ConnectionClosed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CircuitStatus;
    use tokio::net::TcpListener;

    const FP: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";

    /// Serves one connection, answering each command with `handler`.
    /// Resolves to every line received once the client hangs up.
    async fn mock_tor<F>(handler: F) -> (Endpoint, JoinHandle<Vec<String>>)
    where
        F: Fn(&str) -> Vec<String> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            let mut seen = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                let replies = handler(&line);
                seen.push(line);
                for reply in replies {
                    if reply == "<hangup>" {
                        return seen;
                    }
                    if write.write_all(format!("{}\r\n", reply).as_bytes()).await.is_err() {
                        return seen;
                    }
                }
            }
            seen
        });
        (Endpoint::new("127.0.0.1", port), handle)
    }

    fn ok() -> Vec<String> {
        vec!["250 OK".to_string()]
    }

    fn password_handler(line: &str) -> Vec<String> {
        match line {
            "AUTHENTICATE \"secret\"" => ok(),
            l if l.starts_with("AUTHENTICATE") => {
                vec!["515 Authentication failed: Password did not match HashedControlPassword value from configuration".to_string()]
            }
            "GETINFO version" => vec!["250-version=0.4.8.12".to_string(), "250 OK".to_string()],
            "SIGNAL NEWNYM" => ok(),
            "SIGNAL BOGUS" => vec!["552 Unrecognized signal code \"BOGUS\"".to_string()],
            _ => vec!["510 Unrecognized command".to_string()],
        }
    }

    async fn authenticated_client<F>(handler: F) -> (ControlClient, JoinHandle<Vec<String>>)
    where
        F: Fn(&str) -> Vec<String> + Send + 'static,
    {
        let (endpoint, handle) = mock_tor(handler).await;
        let client = ControlClient::connect(&endpoint, Duration::from_secs(2))
            .await
            .unwrap();
        client
            .authenticate(&AuthMethod::Password(SecurePassword::new("secret".to_string())))
            .await
            .unwrap();
        (client, handle)
    }

    #[test]
    fn test_command_wire_forms() {
        assert_eq!(Command::ProtocolInfo.to_wire(), "PROTOCOLINFO 1");
        assert_eq!(
            Command::SetEvents(vec![EventKind::Circ, EventKind::Bw, EventKind::StatusClient])
                .to_wire(),
            "SETEVENTS CIRC BW STATUS_CLIENT"
        );
        assert_eq!(Command::Signal(Signal::NewNym).to_wire(), "SIGNAL NEWNYM");
        assert_eq!(
            Command::SetConf(vec![
                ("ExitNodes".to_string(), Some("{de},{nl}".to_string())),
                ("ExcludeExitNodes".to_string(), None),
            ])
            .to_wire(),
            "SETCONF ExitNodes=\"{de},{nl}\" ExcludeExitNodes"
        );
        let auth = Command::Authenticate(Some(SecurePassword::new("\"pw\"".to_string())));
        assert_eq!(auth.to_wire(), "AUTHENTICATE \"pw\"");
        assert!(!format!("{:?}", auth).contains("pw"));
    }

    #[test]
    fn test_protocol_info_parsing() {
        let mut parser = ReplyParser::new();
        let mut frame = None;
        for line in [
            "250-PROTOCOLINFO 1",
            "250-AUTH METHODS=COOKIE,SAFECOOKIE COOKIEFILE=\"/var/lib/tor/control_auth_cookie\"",
            "250-VERSION Tor=\"0.4.8.12\"",
            "250 OK",
        ] {
            frame = parser.push_line(line).unwrap();
        }
        let Some(Frame::Reply(reply)) = frame else {
            panic!("expected reply");
        };
        let info = ProtocolInfo::from_reply(&reply);
        assert_eq!(info.auth_methods, ["COOKIE", "SAFECOOKIE"]);
        assert_eq!(
            info.cookie_file,
            Some(PathBuf::from("/var/lib/tor/control_auth_cookie"))
        );
        assert_eq!(info.tor_version.as_deref(), Some("0.4.8.12"));
    }

    #[tokio::test]
    async fn test_commands_require_authentication() {
        let (endpoint, _handle) = mock_tor(password_handler).await;
        let client = ControlClient::connect(&endpoint, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(matches!(
            client.version().await,
            Err(Error::NotAuthenticated)
        ));
        assert!(!client.is_authenticated());
    }

    #[tokio::test]
    async fn test_password_authentication() {
        let (client, _handle) = authenticated_client(password_handler).await;
        assert!(client.is_authenticated());
        assert_eq!(client.version().await.unwrap(), "0.4.8.12");
        client.new_identity().await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_password_is_auth_error() {
        let (endpoint, _handle) = mock_tor(password_handler).await;
        let client = ControlClient::connect(&endpoint, Duration::from_secs(2))
            .await
            .unwrap();
        let result = client
            .authenticate(&AuthMethod::Password(SecurePassword::new("wrong".to_string())))
            .await;
        assert!(matches!(result, Err(Error::Auth(_))));
        assert!(!client.is_authenticated());
    }

    #[tokio::test]
    async fn test_rejected_command() {
        let (client, _handle) = authenticated_client(password_handler).await;
        let result = client
            .send_command(&Command::GetInfo(vec!["nonsense".to_string()]))
            .await;
        assert!(matches!(
            result,
            Err(Error::CommandRejected { code: 510, .. })
        ));
        // the connection stays usable after a rejection
        assert_eq!(client.version().await.unwrap(), "0.4.8.12");
    }

    #[tokio::test]
    async fn test_cookie_authentication_via_protocolinfo() {
        let dir = tempfile::TempDir::new().unwrap();
        let cookie_path = dir.path().join("control_auth_cookie");
        let cookie: Vec<u8> = (0u8..32).collect();
        std::fs::write(&cookie_path, &cookie).unwrap();
        let expected = format!("AUTHENTICATE {}", hex::encode(&cookie));
        let cookie_line = format!(
            "250-AUTH METHODS=COOKIE,SAFECOOKIE COOKIEFILE=\"{}\"",
            cookie_path.display()
        );

        let (endpoint, handle) = mock_tor(move |line| {
            if line == "PROTOCOLINFO 1" {
                vec![
                    "250-PROTOCOLINFO 1".to_string(),
                    cookie_line.clone(),
                    "250-VERSION Tor=\"0.4.8.12\"".to_string(),
                    "250 OK".to_string(),
                ]
            } else if line == expected {
                ok()
            } else {
                vec!["515 Authentication failed".to_string()]
            }
        })
        .await;

        let client = ControlClient::connect(&endpoint, Duration::from_secs(2))
            .await
            .unwrap();
        client.authenticate_auto(None).await.unwrap();
        assert!(client.is_authenticated());

        drop(client);
        let seen = handle.await.unwrap();
        assert_eq!(seen[0], "PROTOCOLINFO 1");
        assert!(seen[1].starts_with("AUTHENTICATE 000102"));
    }

    #[tokio::test]
    async fn test_short_cookie_is_rejected_locally() {
        let dir = tempfile::TempDir::new().unwrap();
        let cookie_path = dir.path().join("cookie");
        std::fs::write(&cookie_path, b"short").unwrap();

        let (endpoint, _handle) = mock_tor(|_| ok()).await;
        let client = ControlClient::connect(&endpoint, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(matches!(
            client.authenticate(&AuthMethod::Cookie(cookie_path)).await,
            Err(Error::Auth(_))
        ));
    }

    #[tokio::test]
    async fn test_events_are_published() {
        let circ = format!("650 CIRC 3 BUILT ${}~exit PURPOSE=GENERAL", FP);
        let (client, _handle) = authenticated_client(move |line| {
            if line.starts_with("AUTHENTICATE") {
                ok()
            } else if line == "SETEVENTS CIRC BW STATUS_CLIENT" {
                vec!["250 OK".to_string(), circ.clone(), "650 BW 100 200".to_string()]
            } else {
                vec!["510 Unrecognized command".to_string()]
            }
        })
        .await;

        let mut events = client
            .subscribe_events(&[EventKind::Circ, EventKind::Bw, EventKind::StatusClient])
            .await
            .unwrap();

        match events.recv().await.unwrap() {
            ControlEvent::Circuit(c) => {
                assert_eq!(c.id, "3");
                assert_eq!(c.status, CircuitStatus::Built);
                assert_eq!(c.exit(), Some(FP));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            events.recv().await.unwrap(),
            ControlEvent::Bandwidth {
                read: 100,
                written: 200
            }
        );
    }

    #[tokio::test]
    async fn test_disconnect_is_reported() {
        let (client, _handle) = authenticated_client(|line| {
            if line.starts_with("AUTHENTICATE") {
                ok()
            } else {
                vec!["<hangup>".to_string()]
            }
        })
        .await;
        let mut events = client.events();

        assert!(matches!(
            client.signal(Signal::NewNym).await,
            Err(Error::Disconnected)
        ));
        assert!(!client.is_connected());
        assert!(!client.is_authenticated());
        assert_eq!(events.recv().await.unwrap(), ControlEvent::ConnectionClosed);
        assert!(matches!(
            client.version().await,
            Err(Error::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_timeout_closes_connection() {
        let (endpoint, _handle) = mock_tor(|line| {
            if line.starts_with("AUTHENTICATE") {
                ok()
            } else {
                Vec::new()
            }
        })
        .await;
        let client = ControlClient::connect(&endpoint, Duration::from_millis(300))
            .await
            .unwrap();
        client.authenticate(&AuthMethod::Null).await.unwrap();

        assert!(matches!(client.version().await, Err(Error::Timeout(_))));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_listeners_and_conf() {
        let (client, handle) = authenticated_client(|line| {
            if line.starts_with("AUTHENTICATE") || line.starts_with("SETCONF") {
                ok()
            } else if line == "GETCONF SocksPort" {
                vec![
                    "250-SocksPort=127.0.0.1:9050".to_string(),
                    "250 SocksPort=127.0.0.1:9052 SessionGroup=1".to_string(),
                ]
            } else {
                vec!["510 Unrecognized command".to_string()]
            }
        })
        .await;

        let listeners = vec![
            Listener {
                endpoint: Endpoint::new("127.0.0.1", 9050),
                session_group: None,
            },
            Listener {
                endpoint: Endpoint::new("127.0.0.1", 9052),
                session_group: Some(1),
            },
        ];
        client.set_socks_listeners(&listeners).await.unwrap();
        assert_eq!(
            client.get_conf("SocksPort").await.unwrap(),
            ["127.0.0.1:9050", "127.0.0.1:9052 SessionGroup=1"]
        );

        drop(client);
        let seen = handle.await.unwrap();
        assert_eq!(
            seen[1],
            "SETCONF SocksPort=\"127.0.0.1:9050\" SocksPort=\"127.0.0.1:9052 SessionGroup=1\""
        );
    }

    #[tokio::test]
    async fn test_circuit_status_and_exit_info() {
        let (client, _handle) = authenticated_client(|line| {
            if line.starts_with("AUTHENTICATE") {
                ok()
            } else if line == "GETINFO circuit-status" {
                vec![
                    "250+circuit-status=".to_string(),
                    format!("1 BUILT ${}~exit PURPOSE=GENERAL", FP),
                    "2 LAUNCHED PURPOSE=GENERAL".to_string(),
                    ".".to_string(),
                    "250 OK".to_string(),
                ]
            } else if line == format!("GETINFO ns/id/{}", FP) {
                vec![
                    format!("250+ns/id/{}=", FP),
                    "r exitrelay qqqqqqqqqqqqqqqqqqqqqqqqqqo 5555555555555555555555555555 2024-01-01 00:00:00 198.51.100.7 9001 0".to_string(),
                    "s Exit Fast Running Stable Valid".to_string(),
                    ".".to_string(),
                    "250 OK".to_string(),
                ]
            } else if line == "GETINFO ip-to-country/198.51.100.7" {
                vec![
                    "250-ip-to-country/198.51.100.7=de".to_string(),
                    "250 OK".to_string(),
                ]
            } else if line == "GETINFO status/bootstrap-phase" {
                vec![
                    "250-status/bootstrap-phase=NOTICE BOOTSTRAP PROGRESS=100 TAG=done SUMMARY=\"Done\"".to_string(),
                    "250 OK".to_string(),
                ]
            } else {
                vec!["552 Unrecognized key".to_string()]
            }
        })
        .await;

        let circuits = client.circuit_status().await.unwrap();
        assert_eq!(circuits.len(), 2);
        assert_eq!(circuits[0].exit(), Some(FP));

        let info = client.exit_node_info(FP).await.unwrap();
        assert_eq!(info.nickname, "exitrelay");
        assert_eq!(info.address, "198.51.100.7");
        assert_eq!(info.country.as_deref(), Some("de"));

        assert_eq!(client.bootstrap_progress().await.unwrap(), 100);
    }
}
