//! Point-in-time descriptions of network reachability.

use std::collections::BTreeSet;
use std::net::IpAddr;

/// The kind of link a network snapshot was taken on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Wifi,
    Cellular,
    Ethernet,
    Vpn,
}

/// A point-in-time description of reachability and local addresses.
///
/// Snapshots are replaced wholesale on every observed change and never
/// mutated in place. Comparing a fresh snapshot's address set against a
/// captured one decides whether a restored network is "the same"
/// connection (any shared address) or a different one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSnapshot {
    /// Whether the network is usable at all.
    pub connected: bool,
    /// Local addresses assigned on this network.
    pub addresses: BTreeSet<IpAddr>,
    /// Opaque identity of the network (e.g. SSID or interface name).
    pub identity: String,
    pub link: LinkKind,
}

impl NetworkSnapshot {
    /// A disconnected snapshot with no addresses.
    pub fn disconnected() -> Self {
        Self {
            connected: false,
            addresses: BTreeSet::new(),
            identity: String::new(),
            link: LinkKind::Wifi,
        }
    }

    /// A connected snapshot with the given addresses.
    pub fn connected(identity: &str, link: LinkKind, addresses: &[IpAddr]) -> Self {
        Self {
            connected: true,
            addresses: addresses.iter().copied().collect(),
            identity: identity.to_string(),
            link,
        }
    }

    /// Whether this snapshot shares at least one local address with
    /// `other`. A shared address means an already-open connection bound
    /// to it may still be valid.
    pub fn shares_address_with(&self, other: &NetworkSnapshot) -> bool {
        self.addresses.iter().any(|a| other.addresses.contains(a))
    }
}
