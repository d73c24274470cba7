//! In-memory cache of decrypted key material.
//!
//! Keys live here between the moment a user unlocks them and the moment
//! policy, an explicit removal, or an expiry timer evicts them. The
//! cache never leaves the process; losing the process loses the keys.

use ed25519_dalek::{SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// SHA-256 fingerprint of a public key.
pub fn fingerprint(key: &VerifyingKey) -> Vec<u8> {
    Sha256::digest(key.to_bytes()).to_vec()
}

/// A decrypted key cached under a profile nickname.
#[derive(Clone)]
pub struct CredentialHandle {
    /// Nickname of the credential, matching its stored entry.
    pub nickname: String,
    pub key: SigningKey,
    /// Derived public-key fingerprint bytes.
    pub fingerprint: Vec<u8>,
    /// How long the entry may stay cached; `None` means until removed.
    pub lifetime: Option<Duration>,
}

// Key material stays out of debug output.
impl fmt::Debug for CredentialHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialHandle")
            .field("nickname", &self.nickname)
            .field("fingerprint", &hex::encode(&self.fingerprint))
            .field("lifetime", &self.lifetime)
            .finish_non_exhaustive()
    }
}

impl CredentialHandle {
    pub fn new(nickname: &str, key: SigningKey, lifetime: Option<Duration>) -> Self {
        let fingerprint = fingerprint(&key.verifying_key());
        Self {
            nickname: nickname.to_string(),
            key,
            fingerprint,
            lifetime,
        }
    }
}

struct Entry {
    handle: CredentialHandle,
    expiry: Option<JoinHandle<()>>,
}

impl Drop for Entry {
    fn drop(&mut self) {
        if let Some(task) = self.expiry.take() {
            task.abort();
        }
    }
}

/// The registry-owned credential cache.
pub struct CredentialCache {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    retain: bool,
}

impl CredentialCache {
    /// `retain` is the "keep decrypted keys in memory" policy flag.
    pub fn new(retain: bool) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            retain,
        }
    }

    /// Add a credential. Returns false when the retention policy is
    /// disabled and `force` is not set (the key is simply not cached).
    /// Any prior entry under the same nickname is evicted first. A
    /// positive lifetime schedules automatic removal, independent of
    /// any later access.
    pub fn add(&self, handle: CredentialHandle, force: bool) -> bool {
        if !self.retain && !force {
            debug!(nickname = %handle.nickname, "not caching key, retention disabled");
            return false;
        }

        let nickname = handle.nickname.clone();
        let expiry = handle.lifetime.filter(|d| !d.is_zero()).map(|lifetime| {
            let entries = self.entries.clone();
            let nickname = nickname.clone();
            tokio::spawn(async move {
                tokio::time::sleep(lifetime).await;
                if entries
                    .lock()
                    .expect("credential cache poisoned")
                    .remove(&nickname)
                    .is_some()
                {
                    info!(nickname = %nickname, "cached key expired");
                }
            })
        });

        // Replacing the map entry drops the old one, aborting its timer.
        self.entries
            .lock()
            .expect("credential cache poisoned")
            .insert(nickname.clone(), Entry { handle, expiry });
        debug!(nickname = %nickname, "key added to in-memory cache");
        true
    }

    /// Remove a credential by nickname.
    pub fn remove(&self, nickname: &str) -> bool {
        self.entries
            .lock()
            .expect("credential cache poisoned")
            .remove(nickname)
            .is_some()
    }

    /// Remove a credential by its public-key fingerprint. Returns the
    /// evicted nickname, if any.
    pub fn remove_by_fingerprint(&self, fingerprint: &[u8]) -> Option<String> {
        let mut entries = self.entries.lock().expect("credential cache poisoned");
        let nickname = entries
            .values()
            .find(|e| e.handle.fingerprint == fingerprint)
            .map(|e| e.handle.nickname.clone())?;
        entries.remove(&nickname);
        Some(nickname)
    }

    pub fn contains(&self, nickname: &str) -> bool {
        self.entries
            .lock()
            .expect("credential cache poisoned")
            .contains_key(nickname)
    }

    /// Fetch a cached credential. Access does not extend its lifetime.
    pub fn get(&self, nickname: &str) -> Option<CredentialHandle> {
        self.entries
            .lock()
            .expect("credential cache poisoned")
            .get(nickname)
            .map(|e| e.handle.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("credential cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether any entry carries a lifetime (consulted when the idle
    /// countdown fires, for logging only).
    pub fn has_lifetimed_entries(&self) -> bool {
        self.entries
            .lock()
            .expect("credential cache poisoned")
            .values()
            .any(|e| e.handle.lifetime.is_some())
    }

    /// Drop every entry, aborting expiry timers.
    pub fn clear(&self) {
        self.entries.lock().expect("credential cache poisoned").clear();
    }
}
