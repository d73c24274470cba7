//! Abstract transport and sink capabilities.
//!
//! The session layer never implements a wire protocol of its own; it
//! drives a `Transport` handed to it by a `TransportFactory` and feeds
//! decoded output into a `Sink` supplied by the embedding layer.

use crate::error::TetherResult;
use crate::profile::{ConnectionProfile, PortForward};
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by dyn-compatible async transport methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One attempted or open connection to a remote endpoint.
///
/// Methods take `&self` so a session can read and write concurrently
/// through one shared handle; implementations synchronize internally.
/// Async methods return boxed futures so the trait stays usable as a
/// trait object.
pub trait Transport: Send + Sync {
    /// Open the connection. Resolves once the remote session is usable.
    fn connect(&self) -> BoxFuture<'_, TetherResult<()>>;

    /// Read up to `buf.len()` bytes. Returns number of bytes read, 0 = EOF.
    fn read<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, TetherResult<usize>>;

    /// Write all bytes.
    fn write<'a>(&'a self, data: &'a [u8]) -> BoxFuture<'a, TetherResult<()>>;

    /// Close the connection. Unconditional; not subject to cooperative
    /// cancellation.
    fn close(&self) -> BoxFuture<'_, TetherResult<()>>;

    /// Whether the transport currently has an open session.
    fn is_connected(&self) -> bool;

    /// Inform the remote side of new terminal dimensions.
    fn set_dimensions(
        &self,
        cols: u16,
        rows: u16,
        px_width: u16,
        px_height: u16,
    ) -> BoxFuture<'_, TetherResult<()>>;

    /// Register a port forward with the transport. May be called before
    /// `connect`.
    fn add_port_forward(&self, forward: &PortForward) -> TetherResult<()>;

    /// Remove a previously added port forward.
    fn remove_port_forward(&self, forward: &PortForward) -> TetherResult<()>;

    /// Make a registered forward operational.
    fn enable_port_forward<'a>(
        &'a self,
        forward: &'a PortForward,
    ) -> BoxFuture<'a, TetherResult<()>>;

    /// Tear down an operational forward.
    fn disable_port_forward<'a>(
        &'a self,
        forward: &'a PortForward,
    ) -> BoxFuture<'a, TetherResult<()>>;

    /// Whether this transport supports port forwarding at all.
    fn can_forward_ports(&self) -> bool;

    /// Whether this transport needs the network (false for local ptys).
    fn uses_network(&self) -> bool;
}

/// Creates transports for profiles. Injected into the registry so that
/// reconnect attempts can produce a fresh transport for an existing
/// session.
pub trait TransportFactory: Send + Sync {
    fn create(&self, profile: &ConnectionProfile) -> TetherResult<Box<dyn Transport>>;
}

/// Consumer of decoded terminal output.
///
/// The relay hands the sink complete runs of canonical UTF-8 bytes; the
/// embedding layer feeds them to its terminal emulator.
pub trait Sink: Send + Sync {
    /// Accept a run of decoded bytes for display or processing.
    fn receive(&self, data: &[u8]);

    /// Discard everything buffered so far. Called once when a session
    /// reaches the connected state, to drop pre-login output.
    fn reset(&self);
}
