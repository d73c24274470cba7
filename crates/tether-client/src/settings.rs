//! Session-layer settings. Deserialized from whatever config surface the
//! embedding application exposes; every field has a usable default.

use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Keep decrypted keys cached in memory after first use.
    #[serde(default = "default_true")]
    pub retain_keys: bool,
    /// Hold the exclusive network resource (radio wake lock) while any
    /// session needs the network.
    #[serde(default = "default_true")]
    pub lock_network: bool,
    /// How long a session tolerates network loss before treating the
    /// connection as broken.
    #[serde(default = "default_grace_secs")]
    pub grace_period_secs: u64,
    /// How long the registry stays alive after the last binder detaches
    /// with no sessions open.
    #[serde(default = "default_idle_secs")]
    pub idle_timeout_secs: u64,
    /// Minimum spacing between reconnect sweeps after a restore edge.
    #[serde(default = "default_reconnect_interval_secs")]
    pub reconnect_interval_secs: u64,
    /// Relay decode buffer size in bytes.
    #[serde(default = "default_relay_buffer")]
    pub relay_buffer_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            retain_keys: default_true(),
            lock_network: default_true(),
            grace_period_secs: default_grace_secs(),
            idle_timeout_secs: default_idle_secs(),
            reconnect_interval_secs: default_reconnect_interval_secs(),
            relay_buffer_size: default_relay_buffer(),
        }
    }
}

impl Settings {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }
}

fn default_true() -> bool {
    true
}
fn default_grace_secs() -> u64 {
    60
}
fn default_idle_secs() -> u64 {
    300
}
fn default_reconnect_interval_secs() -> u64 {
    10
}
fn default_relay_buffer() -> usize {
    4096
}
