//! tether-core: Shared library for the tether remote-shell client.
//!
//! Provides connection profiles, port-forward definitions, network
//! snapshots, the abstract transport and sink capabilities, and the
//! traits the session layer uses to talk to persisted state.

pub mod error;
pub mod network;
pub mod profile;
pub mod store;
pub mod transport;

// Re-export commonly used items at crate root.
pub use error::{TetherError, TetherResult};
pub use network::{LinkKind, NetworkSnapshot};
pub use profile::{ConnectionProfile, PortForward, PortForwardKind, Protocol};
pub use store::{CredentialSource, ForwardStore, ProfileStore};
pub use transport::{Sink, Transport, TransportFactory};
