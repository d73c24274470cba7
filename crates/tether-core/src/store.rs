//! Traits for the persisted-state collaborators.
//!
//! Profile, port-forward, and credential persistence live outside this
//! core; the session layer only sees these seams.

use crate::error::TetherResult;
use crate::profile::{ConnectionProfile, PortForward};

/// CRUD access to stored connection profiles.
pub trait ProfileStore: Send + Sync {
    /// Look up a profile by its unique nickname.
    fn find(&self, nickname: &str) -> TetherResult<Option<ConnectionProfile>>;

    /// Persist a replacement value for an existing profile.
    fn save(&self, profile: &ConnectionProfile) -> TetherResult<()>;

    /// Update the profile's last-connected timestamp.
    fn touch(&self, nickname: &str) -> TetherResult<()>;
}

/// Access to the port forwards configured for a profile.
pub trait ForwardStore: Send + Sync {
    /// Load the forwards for a profile. Implementations report a failure
    /// for the whole list; per-forward validation failures surface as
    /// `Err` entries so one bad forward does not sink the rest.
    fn forwards_for(&self, nickname: &str) -> Vec<TetherResult<PortForward>>;
}

/// Source of encrypted key material for interactive unlocking.
pub trait CredentialSource: Send + Sync {
    /// Decrypt the stored key for `nickname` with the given passphrase,
    /// returning the raw private-key seed bytes.
    fn decrypt(&self, nickname: &str, passphrase: &str) -> TetherResult<Vec<u8>>;
}
