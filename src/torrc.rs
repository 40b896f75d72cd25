//! Rendering of the torrc handed to the Tor process.
//!
//! [`render`] is a pure function: the same configuration, bridges and
//! listeners always produce byte-identical output. It does not touch the
//! filesystem; the process supervisor writes the payload to disk.
//!
//! # Layout
//!
//! ```text
//!   # header
//!   SocksPort ...            base listener, then one per isolation context
//!   ControlPort ...
//!   HashedControlPassword    or CookieAuthentication + CookieAuthFile
//!   DataDirectory ...
//!   GeoIPFile / GeoIPv6File  when a GeoIP directory is known
//!   ExitNodes / ExcludeExitNodes / StrictNodes
//!   UseBridges / ClientTransportPlugin / Bridge
//!   ClientOnly / AvoidDiskWrites / Log
//! ```

use std::fmt;
use std::path::Path;

use crate::bridges::BridgeRegistry;
use crate::config::Config;
use crate::isolation::Listener;
use crate::protocol::quote;

/// Name of the cookie file inside the data directory.
pub const COOKIE_FILE_NAME: &str = "control_auth_cookie";

/// Rendered torrc contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigPayload(String);

impl ConfigPayload {
    /// The full torrc text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if some line is exactly `line`.
    pub fn has_line(&self, line: &str) -> bool {
        self.0.lines().any(|l| l == line)
    }

    /// Values of every line starting with `key`.
    pub fn values<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0.lines().filter_map(move |l| {
            let (k, v) = l.split_once(' ')?;
            (k == key).then_some(v)
        })
    }
}

impl fmt::Display for ConfigPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Renders the torrc for `config`.
///
/// `listeners` should come from [`IsolationManager::listeners`], so isolation
/// contexts survive a restart. An empty slice falls back to the base SOCKS
/// endpoint alone.
///
/// [`IsolationManager::listeners`]: crate::isolation::IsolationManager::listeners
pub fn render(config: &Config, bridges: &BridgeRegistry, listeners: &[Listener]) -> ConfigPayload {
    let mut out = Vec::new();
    out.push("# Generated by tor-manager. Changes are overwritten on restart.".to_string());

    if listeners.is_empty() {
        out.push(format!("SocksPort {}", config.socks_endpoint()));
    } else {
        for listener in listeners {
            out.push(format!("SocksPort {}", listener.socks_port_value()));
        }
    }
    out.push(format!("ControlPort {}", config.control_endpoint()));

    match config.hashed_control_password {
        Some(ref hash) => out.push(format!("HashedControlPassword {}", hash)),
        None => {
            out.push("CookieAuthentication 1".to_string());
            out.push(format!(
                "CookieAuthFile {}",
                path_value(&config.data_dir.join(COOKIE_FILE_NAME))
            ));
        }
    }
    out.push(format!("DataDirectory {}", path_value(&config.data_dir)));

    if let Some(ref dir) = config.geoip_dir {
        out.push(format!("GeoIPFile {}", path_value(&dir.join("geoip"))));
        out.push(format!("GeoIPv6File {}", path_value(&dir.join("geoip6"))));
    }

    if let Some(nodes) = country_set(&config.exit_countries) {
        out.push(format!("ExitNodes {}", nodes));
    }
    if let Some(nodes) = country_set(&config.exclude_exit_countries) {
        out.push(format!("ExcludeExitNodes {}", nodes));
    }
    if config.strict_nodes {
        out.push("StrictNodes 1".to_string());
    }

    if !bridges.is_empty() {
        out.push("UseBridges 1".to_string());
        for transport in bridges.transports() {
            if let Some(plugin) = config.plugin_for(transport) {
                out.push(format!(
                    "ClientTransportPlugin {} exec {}",
                    transport,
                    path_value(plugin)
                ));
            }
        }
        for bridge in bridges.iter() {
            out.push(format!("Bridge {}", bridge.raw));
        }
    }

    out.push("ClientOnly 1".to_string());
    out.push("AvoidDiskWrites 1".to_string());
    out.push("Log notice stdout".to_string());

    let mut text = out.join("\n");
    text.push('\n');
    ConfigPayload(text)
}

/// Formats country codes as Tor's `{de},{nl}` node set.
///
/// Returns `None` for an empty list.
pub fn country_set(codes: &[String]) -> Option<String> {
    if codes.is_empty() {
        return None;
    }
    Some(
        codes
            .iter()
            .map(|c| format!("{{{}}}", c.to_ascii_lowercase()))
            .collect::<Vec<_>>()
            .join(","),
    )
}

fn path_value(path: &Path) -> String {
    let s = path.to_string_lossy();
    if s.chars().any(|c| c.is_whitespace() || c == '"' || c == '\\' || c == '#') {
        quote(&s)
    } else {
        s.into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Endpoint;
    use std::path::PathBuf;

    const FP: &str = "0123456789ABCDEF0123456789ABCDEF01234567";

    fn base_config() -> Config {
        Config {
            data_dir: PathBuf::from("/var/lib/tm"),
            ..Config::default()
        }
    }

    #[test]
    fn test_defaults_use_cookie_auth() {
        let payload = render(&base_config(), &BridgeRegistry::new(), &[]);
        assert!(payload.has_line("SocksPort 127.0.0.1:9050"));
        assert!(payload.has_line("ControlPort 127.0.0.1:9051"));
        assert!(payload.has_line("CookieAuthentication 1"));
        assert!(payload.has_line("CookieAuthFile /var/lib/tm/control_auth_cookie"));
        assert!(payload.has_line("DataDirectory /var/lib/tm"));
        assert!(payload.has_line("ClientOnly 1"));
        assert!(!payload.as_str().contains("UseBridges"));
        assert!(!payload.as_str().contains("ExitNodes"));
        assert!(payload.as_str().starts_with('#'));
        assert!(payload.as_str().ends_with('\n'));
    }

    #[test]
    fn test_hashed_password_replaces_cookie() {
        let mut config = base_config();
        config.hashed_control_password = Some(format!("16:{}", "A".repeat(58)));
        let payload = render(&config, &BridgeRegistry::new(), &[]);
        assert_eq!(payload.values("HashedControlPassword").count(), 1);
        assert!(!payload.has_line("CookieAuthentication 1"));
    }

    #[test]
    fn test_listeners_and_exit_policy() {
        let mut config = base_config();
        config.exit_countries = vec!["DE".to_string(), "nl".to_string()];
        config.exclude_exit_countries = vec!["us".to_string()];
        config.strict_nodes = true;
        config.geoip_dir = Some(PathBuf::from("/opt/tor/data"));

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
        let payload = render(&config, &BridgeRegistry::new(), &listeners);
        let socks: Vec<&str> = payload.values("SocksPort").collect();
        assert_eq!(socks, ["127.0.0.1:9050", "127.0.0.1:9052 SessionGroup=1"]);
        assert!(payload.has_line("ExitNodes {de},{nl}"));
        assert!(payload.has_line("ExcludeExitNodes {us}"));
        assert!(payload.has_line("StrictNodes 1"));
        assert!(payload.has_line("GeoIPFile /opt/tor/data/geoip"));
        assert!(payload.has_line("GeoIPv6File /opt/tor/data/geoip6"));
    }

    #[test]
    fn test_bridges_with_plugins() {
        let mut config = base_config();
        config
            .transport_plugins
            .insert("obfs4".to_string(), PathBuf::from("/opt/pt/lyrebird"));
        let bridges = BridgeRegistry::from_lines([
            format!("obfs4 192.0.2.1:443 {} cert=abc iat-mode=0", FP),
            "192.0.2.2:9001".to_string(),
        ])
        .unwrap();

        let payload = render(&config, &bridges, &[]);
        assert!(payload.has_line("UseBridges 1"));
        assert!(payload.has_line("ClientTransportPlugin obfs4 exec /opt/pt/lyrebird"));
        let lines: Vec<&str> = payload.values("Bridge").collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("obfs4 192.0.2.1:443"));
        assert_eq!(lines[1], "192.0.2.2:9001");
    }

    #[test]
    fn test_paths_with_spaces_are_quoted() {
        let mut config = base_config();
        config.data_dir = PathBuf::from("/home/me/Tor Data");
        let payload = render(&config, &BridgeRegistry::new(), &[]);
        assert!(payload.has_line("DataDirectory \"/home/me/Tor Data\""));
    }

    #[test]
    fn test_country_set() {
        assert_eq!(country_set(&[]), None);
        assert_eq!(country_set(&["CH".to_string()]).as_deref(), Some("{ch}"));
    }
}
