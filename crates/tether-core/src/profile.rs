//! Connection profiles and port-forward definitions.
//!
//! A `ConnectionProfile` is an immutable-by-replacement value describing one
//! remote endpoint. Mutations (e.g. a font-size change) produce a replacement
//! value that an external store persists; live sessions hold the latest copy.

use serde::{Deserialize, Serialize};

/// Wire protocol a profile connects with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// A networked remote shell.
    Shell,
    /// A local pty, no network involved.
    Local,
}

/// A named configuration describing one remote endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionProfile {
    /// Unique key identifying this profile.
    pub nickname: String,
    /// Login username.
    pub username: String,
    /// Remote address.
    pub hostname: String,
    /// Remote port.
    pub port: u16,
    /// Protocol used to reach the endpoint.
    pub protocol: Protocol,
    /// Character encoding label for the terminal stream (e.g. "utf-8").
    pub encoding: String,
    /// Terminal font size in points.
    pub font_size: u16,
    /// Automatically queue a reconnect instead of closing when the
    /// connection drops.
    pub stay_connected: bool,
    /// Close immediately on disconnect without asking the user.
    pub quick_disconnect: bool,
    /// Command injected into the terminal after login, if any.
    pub post_login: Option<String>,
}

impl ConnectionProfile {
    /// Create a profile with default behavior flags.
    pub fn new(nickname: &str, username: &str, hostname: &str, port: u16) -> Self {
        Self {
            nickname: nickname.to_string(),
            username: username.to_string(),
            hostname: hostname.to_string(),
            port,
            protocol: Protocol::Shell,
            encoding: "utf-8".to_string(),
            font_size: 10,
            stay_connected: false,
            quick_disconnect: false,
            post_login: None,
        }
    }
}

/// Kinds of port forwarding a transport can set up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortForwardKind {
    Local,
    Remote,
    Dynamic,
}

/// A single port-forward definition belonging to a profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForward {
    /// Human-readable name.
    pub nickname: String,
    pub kind: PortForwardKind,
    pub source_port: u16,
    /// Destination address (unused for dynamic forwards).
    pub dest_addr: Option<String>,
    pub dest_port: Option<u16>,
    /// Whether the forward is currently operational.
    pub enabled: bool,
}

impl PortForward {
    /// One-line description for logs and error reports.
    pub fn description(&self) -> String {
        match self.kind {
            PortForwardKind::Dynamic => {
                format!("{} (dynamic, port {})", self.nickname, self.source_port)
            }
            _ => format!(
                "{} ({:?}, {} -> {}:{})",
                self.nickname,
                self.kind,
                self.source_port,
                self.dest_addr.as_deref().unwrap_or("?"),
                self.dest_port.unwrap_or(0)
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_defaults() {
        let p = ConnectionProfile::new("work", "alice", "example.com", 22);
        assert_eq!(p.encoding, "utf-8");
        assert!(!p.stay_connected);
        assert!(!p.quick_disconnect);
        assert_eq!(p.protocol, Protocol::Shell);
    }

    #[test]
    fn profile_serde_round_trip() {
        let p = ConnectionProfile::new("work", "alice", "example.com", 22);
        let json = serde_json::to_string(&p).unwrap();
        let back: ConnectionProfile = serde_json::from_str(&json).unwrap();
        assert_eq!(back.nickname, "work");
        assert_eq!(back.port, 22);
    }

    #[test]
    fn forward_description() {
        let fwd = PortForward {
            nickname: "web".into(),
            kind: PortForwardKind::Local,
            source_port: 8080,
            dest_addr: Some("localhost".into()),
            dest_port: Some(80),
            enabled: false,
        };
        assert!(fwd.description().contains("8080"));
        assert!(fwd.description().contains("localhost"));
    }
}
