//! tether-client: session lifecycle and connectivity resilience.
//!
//! Maintains a registry of concurrent remote-shell sessions, shields each
//! session from transient network loss with a grace period, multiplexes
//! terminal I/O through a charset transcoding relay, and arbitrates the
//! interactive prompts (credentials, host keys) a background session
//! needs answered without blocking the process.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tether_client::{Settings, SessionRegistry};
//! use tether_core::ConnectionProfile;
//!
//! # async fn example(
//! #     factory: Arc<dyn tether_core::TransportFactory>,
//! #     sinks: Arc<dyn tether_client::SinkFactory>,
//! # ) -> tether_core::TetherResult<()> {
//! let registry = SessionRegistry::new(Settings::default(), factory, sinks);
//! let _binder = registry.bind();
//!
//! let profile = ConnectionProfile::new("work", "alice", "example.com", 22);
//! let session = registry.open_connection(profile)?;
//! session.write_text("ls\n");
//! session.dispatch_disconnect(false);
//! # Ok(())
//! # }
//! ```

pub mod connectivity;
pub mod credentials;
pub mod prompt;
pub mod registry;
pub mod relay;
pub mod session;
pub mod settings;

#[cfg(test)]
pub(crate) mod testutil;

// Re-export primary public types.
pub use connectivity::{ConnectivityEvent, ConnectivityMonitor, NetworkLock};
pub use credentials::{CredentialCache, CredentialHandle};
pub use prompt::{Prompt, PromptAnswer, PromptCoordinator, PromptKind};
pub use registry::{RegistryBinder, RegistryEvent, SessionError, SessionRegistry, SinkFactory};
pub use relay::{Charset, Relay};
pub use session::{Session, SessionState};
pub use settings::Settings;

// Re-export tether-core error types for convenience.
pub use tether_core::{TetherError, TetherResult};
