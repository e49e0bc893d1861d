//! Load config from file and environment.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Daemon configuration. File: ~/.config/lanchat/config.toml or /etc/lanchat/config.toml.
/// Env overrides: LANCHAT_DISCOVERY_PORT, LANCHAT_CHAT_PORT, LANCHAT_BROADCAST_INTERVAL_MS,
/// LANCHAT_HEARTBEAT_TIMEOUT_MS, LANCHAT_RESPONSE_TIMEOUT_MS, LANCHAT_ANNOUNCE_ADDR,
/// LANCHAT_BIND_ADDR, LANCHAT_SELF_ADDRESS, LANCHAT_DISPLAY_NAME, LANCHAT_QUEUE_PATH.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Discovery UDP port (default 12345).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Chat TCP port, same on every device (default 12345).
    #[serde(default = "default_chat_port")]
    pub chat_port: u16,
    #[serde(default = "default_broadcast_interval_ms")]
    pub broadcast_interval_ms: u64,
    /// Peers not heard from for this long are evicted; also the sweep period.
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    /// Bound on connect + write + ACK read for one outbound message.
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    /// Where presence datagrams go: limited broadcast or an IPv4 multicast group.
    #[serde(default = "default_announce_addr")]
    pub announce_addr: Ipv4Addr,
    /// Local address for the chat server and discovery listener.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: Ipv4Addr,
    /// Address to announce instead of the auto-detected one.
    #[serde(default)]
    pub self_address: Option<Ipv4Addr>,
    /// Name to announce instead of the host name.
    #[serde(default)]
    pub display_name: Option<String>,
    /// JSON file for the offline queue (default ~/.local/share/lanchat/queue.json).
    #[serde(default)]
    pub queue_path: Option<PathBuf>,
}

fn default_discovery_port() -> u16 {
    12345
}
fn default_chat_port() -> u16 {
    12345
}
fn default_broadcast_interval_ms() -> u64 {
    5_000
}
fn default_heartbeat_timeout_ms() -> u64 {
    15_000
}
fn default_response_timeout_ms() -> u64 {
    5_000
}
fn default_announce_addr() -> Ipv4Addr {
    Ipv4Addr::BROADCAST
}
fn default_bind_addr() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery_port: default_discovery_port(),
            chat_port: default_chat_port(),
            broadcast_interval_ms: default_broadcast_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            response_timeout_ms: default_response_timeout_ms(),
            announce_addr: default_announce_addr(),
            bind_addr: default_bind_addr(),
            self_address: None,
            display_name: None,
            queue_path: None,
        }
    }
}

impl Config {
    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_interval_ms.max(1))
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms.max(1))
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms.max(1))
    }

    /// Configured queue file, else the per-user default. None if HOME is unset.
    pub fn queue_file(&self) -> Option<PathBuf> {
        self.queue_path.clone().or_else(|| {
            std::env::var_os("HOME")
                .map(PathBuf::from)
                .map(|h| h.join(".local/share/lanchat/queue.json"))
        })
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(name: &str, raw: Option<String>) -> Option<T> {
            let raw = raw?;
            match raw.parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    log::warn!("ignoring {name}={raw}: not a valid value");
                    None
                }
            }
        }
        if let Some(p) = parsed("LANCHAT_DISCOVERY_PORT", var("LANCHAT_DISCOVERY_PORT")) {
            self.discovery_port = p;
        }
        if let Some(p) = parsed("LANCHAT_CHAT_PORT", var("LANCHAT_CHAT_PORT")) {
            self.chat_port = p;
        }
        if let Some(ms) = parsed(
            "LANCHAT_BROADCAST_INTERVAL_MS",
            var("LANCHAT_BROADCAST_INTERVAL_MS"),
        ) {
            self.broadcast_interval_ms = ms;
        }
        if let Some(ms) = parsed(
            "LANCHAT_HEARTBEAT_TIMEOUT_MS",
            var("LANCHAT_HEARTBEAT_TIMEOUT_MS"),
        ) {
            self.heartbeat_timeout_ms = ms;
        }
        if let Some(ms) = parsed(
            "LANCHAT_RESPONSE_TIMEOUT_MS",
            var("LANCHAT_RESPONSE_TIMEOUT_MS"),
        ) {
            self.response_timeout_ms = ms;
        }
        if let Some(a) = parsed("LANCHAT_ANNOUNCE_ADDR", var("LANCHAT_ANNOUNCE_ADDR")) {
            self.announce_addr = a;
        }
        if let Some(a) = parsed("LANCHAT_BIND_ADDR", var("LANCHAT_BIND_ADDR")) {
            self.bind_addr = a;
        }
        if let Some(a) = parsed("LANCHAT_SELF_ADDRESS", var("LANCHAT_SELF_ADDRESS")) {
            self.self_address = Some(a);
        }
        if let Some(name) = var("LANCHAT_DISPLAY_NAME").filter(|n| !n.trim().is_empty()) {
            self.display_name = Some(name);
        }
        if let Some(path) = var("LANCHAT_QUEUE_PATH").filter(|p| !p.is_empty()) {
            self.queue_path = Some(PathBuf::from(path));
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    c.apply_env(|k| std::env::var(k).ok());
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/lanchat/config.toml"));
    }
    out.push(PathBuf::from("/etc/lanchat/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => {
                        log::info!("loaded config from {}", p.display());
                        return Some(c);
                    }
                    Err(e) => log::warn!("ignoring {}: {e}", p.display()),
                },
                Err(e) => log::warn!("cannot read {}: {e}", p.display()),
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_reference_behavior() {
        let c = Config::default();
        assert_eq!(c.broadcast_interval(), Duration::from_secs(5));
        assert_eq!(c.heartbeat_timeout(), Duration::from_secs(15));
        assert_eq!(c.response_timeout(), Duration::from_secs(5));
        assert_eq!(c.announce_addr, Ipv4Addr::BROADCAST);
    }

    #[test]
    fn toml_partial_file_fills_defaults() {
        let c: Config = toml::from_str(
            "chat_port = 4000\nannounce_addr = \"239.255.42.99\"\ndisplay_name = \"desk\"\n",
        )
        .unwrap();
        assert_eq!(c.chat_port, 4000);
        assert_eq!(c.discovery_port, 12345);
        assert_eq!(c.announce_addr, Ipv4Addr::new(239, 255, 42, 99));
        assert_eq!(c.display_name.as_deref(), Some("desk"));
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128\n").is_err());
    }

    #[test]
    fn env_overrides_and_bad_values() {
        let env: HashMap<&str, &str> = [
            ("LANCHAT_CHAT_PORT", "4100"),
            ("LANCHAT_DISCOVERY_PORT", "not-a-port"),
            ("LANCHAT_HEARTBEAT_TIMEOUT_MS", "2000"),
            ("LANCHAT_SELF_ADDRESS", "10.1.2.3"),
            ("LANCHAT_DISPLAY_NAME", "  "),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        c.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.chat_port, 4100);
        assert_eq!(c.discovery_port, 12345);
        assert_eq!(c.heartbeat_timeout(), Duration::from_secs(2));
        assert_eq!(c.self_address, Some(Ipv4Addr::new(10, 1, 2, 3)));
        assert_eq!(c.display_name, None);
    }
}
