//! The session registry: tracks live sessions, cached credentials, the
//! pending-reconnect queue and process idle shutdown.
//!
//! Sessions report back over a notice channel drained by one dispatcher
//! task, which also fans connectivity edges out to affected sessions.
//! The registry's indices hold weak references only; a session's
//! lifetime is driven by its own state machine, never by index cleanup.

use crate::connectivity::{ConnectivityEvent, ConnectivityMonitor, NetworkLock, NoopLock};
use crate::credentials::{CredentialCache, CredentialHandle};
use crate::session::{Session, SessionSeed};
use crate::settings::Settings;
use ed25519_dalek::SigningKey;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tether_core::{
    ConnectionProfile, CredentialSource, ForwardStore, ProfileStore, Sink, TetherError,
    TetherResult, TransportFactory,
};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Produces the sink a new session feeds decoded output into.
pub trait SinkFactory: Send + Sync {
    fn create(&self, profile: &ConnectionProfile) -> Arc<dyn Sink>;
}

/// A session-scoped failure carrying enough context for the embedding
/// layer to render a notification.
#[derive(Debug, Clone)]
pub struct SessionError {
    pub nickname: String,
    pub hostname: String,
    pub reason: String,
}

/// Status changes broadcast to subscribers.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    SessionOpened { nickname: String },
    SessionDisconnected { nickname: String },
    SessionError(SessionError),
    /// The last session closed and nothing is pending reconnect.
    AllSessionsClosed,
    /// The idle countdown elapsed with no binder and no sessions.
    IdleExpired,
}

/// Messages sessions send back to the registry.
pub(crate) enum Notice {
    Disconnected(Arc<Session>),
    RequestReconnect(Arc<Session>),
    Error(SessionError),
}

struct Inner {
    settings: Settings,
    factory: Arc<dyn TransportFactory>,
    sinks: Arc<dyn SinkFactory>,
    profile_store: Mutex<Option<Arc<dyn ProfileStore>>>,
    forward_store: Mutex<Option<Arc<dyn ForwardStore>>>,
    credential_source: Mutex<Option<Arc<dyn CredentialSource>>>,
    credentials: CredentialCache,
    monitor: ConnectivityMonitor,
    by_nickname: Mutex<HashMap<String, Weak<Session>>>,
    by_id: Mutex<HashMap<String, Weak<Session>>>,
    disconnected: Mutex<BTreeSet<String>>,
    pending: Mutex<Vec<Weak<Session>>>,
    events_tx: broadcast::Sender<RegistryEvent>,
    notices_tx: mpsc::UnboundedSender<Notice>,
    binders: Mutex<u32>,
    idle_task: Mutex<Option<JoinHandle<()>>>,
    last_sweep: Mutex<Option<Instant>>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
}

/// The top-level authority over sessions. Cheap to clone via `Arc`
/// internally; construct once and inject into callers.
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

/// Keeps the registry out of idle shutdown while held.
pub struct RegistryBinder {
    inner: Arc<Inner>,
}

impl SessionRegistry {
    /// Create a registry with no platform network lock.
    pub fn new(
        settings: Settings,
        factory: Arc<dyn TransportFactory>,
        sinks: Arc<dyn SinkFactory>,
    ) -> Self {
        Self::with_lock(settings, factory, sinks, Arc::new(NoopLock::default()))
    }

    /// Create a registry holding the given network resource lock while
    /// any session needs the network.
    pub fn with_lock(
        settings: Settings,
        factory: Arc<dyn TransportFactory>,
        sinks: Arc<dyn SinkFactory>,
        lock: Arc<dyn NetworkLock>,
    ) -> Self {
        let (monitor, network_rx) = ConnectivityMonitor::new(lock, settings.lock_network);
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(64);
        let credentials = CredentialCache::new(settings.retain_keys);

        let inner = Arc::new(Inner {
            settings,
            factory,
            sinks,
            profile_store: Mutex::new(None),
            forward_store: Mutex::new(None),
            credential_source: Mutex::new(None),
            credentials,
            monitor,
            by_nickname: Mutex::new(HashMap::new()),
            by_id: Mutex::new(HashMap::new()),
            disconnected: Mutex::new(BTreeSet::new()),
            pending: Mutex::new(Vec::new()),
            events_tx,
            notices_tx,
            binders: Mutex::new(0),
            idle_task: Mutex::new(None),
            last_sweep: Mutex::new(None),
            dispatch_task: Mutex::new(None),
        });

        let task = tokio::spawn(dispatch_loop(
            Arc::downgrade(&inner),
            notices_rx,
            network_rx,
        ));
        *inner.dispatch_task.lock().expect("task slot poisoned") = Some(task);

        Self { inner }
    }

    pub fn set_profile_store(&self, store: Arc<dyn ProfileStore>) {
        *self.inner.profile_store.lock().expect("store slot poisoned") = Some(store);
    }

    pub fn set_forward_store(&self, store: Arc<dyn ForwardStore>) {
        *self.inner.forward_store.lock().expect("store slot poisoned") = Some(store);
    }

    pub fn set_credential_source(&self, source: Arc<dyn CredentialSource>) {
        *self
            .inner
            .credential_source
            .lock()
            .expect("store slot poisoned") = Some(source);
    }

    /// Open a session for the profile and start its connection attempt.
    /// Fails with `AlreadyConnected` while a session for the same
    /// nickname is live.
    pub fn open_connection(&self, profile: ConnectionProfile) -> TetherResult<Arc<Session>> {
        self.inner.cancel_idle();

        let session = {
            let mut index = self
                .inner
                .by_nickname
                .lock()
                .expect("nickname index poisoned");
            index.retain(|_, weak| weak.strong_count() > 0);
            if index.contains_key(&profile.nickname) {
                return Err(TetherError::AlreadyConnected(profile.nickname));
            }

            let transport = self.inner.factory.create(&profile)?;
            let sink = self.inner.sinks.create(&profile);
            let session = Session::spawn(
                SessionSeed {
                    profile: profile.clone(),
                    settings: self.inner.settings.clone(),
                    monitor: self.inner.monitor.clone(),
                    sink,
                    forward_store: self
                        .inner
                        .forward_store
                        .lock()
                        .expect("store slot poisoned")
                        .clone(),
                    notices: self.inner.notices_tx.clone(),
                },
                transport,
            );
            index.insert(profile.nickname.clone(), Arc::downgrade(&session));
            session
        };

        self.inner
            .by_id
            .lock()
            .expect("id index poisoned")
            .insert(session.id().to_string(), Arc::downgrade(&session));
        self.inner
            .disconnected
            .lock()
            .expect("disconnected set poisoned")
            .remove(&profile.nickname);

        if session.uses_network() {
            self.inner.monitor.inc_ref();
        }

        if let Some(store) = self
            .inner
            .profile_store
            .lock()
            .expect("store slot poisoned")
            .clone()
        {
            if let Err(err) = store.touch(&profile.nickname) {
                warn!(nickname = %profile.nickname, %err, "failed to record last connection");
            }
        }

        info!(nickname = %profile.nickname, host = %profile.hostname, "session opened");
        let _ = self.inner.events_tx.send(RegistryEvent::SessionOpened {
            nickname: profile.nickname,
        });
        Ok(session)
    }

    pub fn find_session(&self, nickname: &str) -> Option<Arc<Session>> {
        self.inner
            .by_nickname
            .lock()
            .expect("nickname index poisoned")
            .get(nickname)
            .and_then(Weak::upgrade)
    }

    pub fn find_session_by_id(&self, id: &str) -> Option<Arc<Session>> {
        self.inner
            .by_id
            .lock()
            .expect("id index poisoned")
            .get(id)
            .and_then(Weak::upgrade)
    }

    /// All currently live sessions.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.inner.sessions()
    }

    pub fn active_count(&self) -> usize {
        self.inner.sessions().len()
    }

    /// Profiles whose sessions have disconnected since they last opened.
    pub fn disconnected_profiles(&self) -> Vec<String> {
        self.inner
            .disconnected
            .lock()
            .expect("disconnected set poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Disconnect one session by nickname.
    pub fn disconnect_session(&self, nickname: &str, immediate: bool) -> TetherResult<()> {
        let session = self
            .find_session(nickname)
            .ok_or_else(|| TetherError::SessionNotFound(nickname.to_string()))?;
        session.dispatch_disconnect(immediate);
        Ok(())
    }

    /// Disconnect every live session. Networkless sessions (local ptys)
    /// can be excluded, for shutdown paths triggered by network policy.
    pub fn disconnect_all(&self, immediate: bool, exclude_networkless: bool) {
        for session in self.inner.sessions() {
            if exclude_networkless && !session.uses_network() {
                continue;
            }
            session.dispatch_disconnect(immediate);
        }
    }

    /// Queue a session for reconnection. If it does not need the network
    /// or the network is available, the attempt happens right away.
    pub fn request_reconnect(&self, session: &Arc<Session>) {
        self.inner.queue_reconnect(session.clone());
    }

    /// Subscribe to status changes.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Attach an external binder, cancelling any idle countdown.
    pub fn bind(&self) -> RegistryBinder {
        self.inner.cancel_idle();
        *self.inner.binders.lock().expect("binder count poisoned") += 1;
        RegistryBinder {
            inner: self.inner.clone(),
        }
    }

    /// Feed a platform network snapshot into the monitor.
    pub fn observe_network(&self, snapshot: tether_core::NetworkSnapshot) {
        self.inner.monitor.observe(snapshot);
    }

    pub fn monitor(&self) -> &ConnectivityMonitor {
        &self.inner.monitor
    }

    /// Cache decrypted key material under the retention policy. Returns
    /// whether the key was actually retained.
    pub fn add_key(&self, handle: CredentialHandle, force: bool) -> bool {
        self.inner.credentials.add(handle, force)
    }

    pub fn remove_key(&self, nickname: &str) -> bool {
        self.inner.credentials.remove(nickname)
    }

    pub fn remove_key_by_fingerprint(&self, fingerprint: &[u8]) -> Option<String> {
        self.inner.credentials.remove_by_fingerprint(fingerprint)
    }

    pub fn is_key_loaded(&self, nickname: &str) -> bool {
        self.inner.credentials.contains(nickname)
    }

    pub fn get_key(&self, nickname: &str) -> Option<CredentialHandle> {
        self.inner.credentials.get(nickname)
    }

    /// Decrypt stored key material through the configured credential
    /// source and cache the result.
    pub fn unlock_key(
        &self,
        nickname: &str,
        passphrase: &str,
        lifetime: Option<Duration>,
    ) -> TetherResult<()> {
        let source = self
            .inner
            .credential_source
            .lock()
            .expect("store slot poisoned")
            .clone()
            .ok_or_else(|| {
                TetherError::CredentialDecryptFailed("no credential source configured".into())
            })?;
        let material = source.decrypt(nickname, passphrase)?;
        let seed: [u8; 32] = material.as_slice().try_into().map_err(|_| {
            TetherError::CredentialDecryptFailed("unexpected key material length".into())
        })?;
        let key = SigningKey::from_bytes(&seed);
        self.inner
            .credentials
            .add(CredentialHandle::new(nickname, key, lifetime), false);
        Ok(())
    }

    /// Tear everything down: sessions, the dispatcher, the network lock
    /// and all cached key material.
    pub fn shutdown(&self) {
        info!("registry shutting down");
        self.disconnect_all(true, false);
        self.inner.cancel_idle();
        if let Some(task) = self
            .inner
            .dispatch_task
            .lock()
            .expect("task slot poisoned")
            .take()
        {
            task.abort();
        }
        self.inner.monitor.shutdown();
        self.inner.credentials.clear();
    }
}

impl Drop for RegistryBinder {
    fn drop(&mut self) {
        let remaining = {
            let mut binders = self.inner.binders.lock().expect("binder count poisoned");
            *binders = binders.saturating_sub(1);
            *binders
        };
        if remaining == 0 && self.inner.sessions().is_empty() {
            self.inner.arm_idle();
        }
    }
}

impl Inner {
    fn sessions(&self) -> Vec<Arc<Session>> {
        self.by_nickname
            .lock()
            .expect("nickname index poisoned")
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Bookkeeping after a session fully disconnects.
    fn on_disconnected(self: &Arc<Self>, session: &Arc<Session>) {
        let nickname = session.nickname();
        {
            let mut index = self.by_nickname.lock().expect("nickname index poisoned");
            if let Some(weak) = index.get(&nickname) {
                let same = weak
                    .upgrade()
                    .map(|live| Arc::ptr_eq(&live, session))
                    .unwrap_or(true);
                if same {
                    index.remove(&nickname);
                }
            }
        }
        self.by_id
            .lock()
            .expect("id index poisoned")
            .remove(session.id());

        if session.uses_network() {
            self.monitor.dec_ref();
        }
        self.disconnected
            .lock()
            .expect("disconnected set poisoned")
            .insert(nickname.clone());

        debug!(nickname = %nickname, "session removed from registry");
        let _ = self
            .events_tx
            .send(RegistryEvent::SessionDisconnected { nickname });

        let pending_empty = {
            let mut pending = self.pending.lock().expect("pending queue poisoned");
            pending.retain(|w| w.strong_count() > 0);
            pending.is_empty()
        };
        if pending_empty && self.sessions().is_empty() {
            let _ = self.events_tx.send(RegistryEvent::AllSessionsClosed);
            if *self.binders.lock().expect("binder count poisoned") == 0 {
                self.arm_idle();
            }
        }
    }

    fn queue_reconnect(self: &Arc<Self>, session: Arc<Session>) {
        let immediate = !session.uses_network() || self.monitor.is_connected();
        self.pending
            .lock()
            .expect("pending queue poisoned")
            .push(Arc::downgrade(&session));
        if immediate {
            self.sweep_reconnects(true);
        }
    }

    /// Hand fresh transports to every pending session. Restore-edge
    /// sweeps are rate limited so a flapping network cannot flood the
    /// factory; explicit requests bypass the limit.
    fn sweep_reconnects(self: &Arc<Self>, force: bool) {
        {
            let mut last = self.last_sweep.lock().expect("sweep clock poisoned");
            let now = Instant::now();
            if !force {
                if let Some(previous) = *last {
                    if now.duration_since(previous) < self.settings.reconnect_interval() {
                        return;
                    }
                }
            }
            *last = Some(now);
        }

        let waiting: Vec<Arc<Session>> = {
            let mut pending = self.pending.lock().expect("pending queue poisoned");
            pending.drain(..).filter_map(|w| w.upgrade()).collect()
        };

        for session in waiting {
            let profile = session.profile();
            match self.factory.create(&profile) {
                Ok(transport) => {
                    info!(nickname = %profile.nickname, "reconnecting");
                    session.deliver_transport(transport);
                }
                Err(err) => {
                    warn!(nickname = %profile.nickname, %err, "reconnect attempt failed");
                    let _ = self.events_tx.send(RegistryEvent::SessionError(SessionError {
                        nickname: profile.nickname,
                        hostname: profile.hostname,
                        reason: format!("reconnect failed: {err}"),
                    }));
                    self.pending
                        .lock()
                        .expect("pending queue poisoned")
                        .push(Arc::downgrade(&session));
                }
            }
        }
    }

    fn fan_out_lost(&self) {
        for session in self.sessions() {
            if session.uses_network() {
                session.notify_network_lost();
            }
        }
    }

    fn fan_out_restored(self: &Arc<Self>, snapshot: tether_core::NetworkSnapshot) {
        for session in self.sessions() {
            if session.uses_network() {
                session.notify_network_restored(snapshot.clone());
            }
        }
        self.sweep_reconnects(false);
    }

    /// Start the countdown to process termination. A cached key with a
    /// lifetime does not defer it; the memory-only cache is lost on
    /// termination either way.
    fn arm_idle(self: &Arc<Self>) {
        if self.credentials.has_lifetimed_entries() {
            debug!("idle countdown armed with lifetimed keys still cached");
        }
        let weak = Arc::downgrade(self);
        let timeout = self.settings.idle_timeout();
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let idle = *inner.binders.lock().expect("binder count poisoned") == 0
                && inner.sessions().is_empty();
            if idle {
                info!("idle timeout expired");
                let _ = inner.events_tx.send(RegistryEvent::IdleExpired);
            }
        });
        let mut slot = self.idle_task.lock().expect("idle slot poisoned");
        if let Some(old) = slot.replace(task) {
            old.abort();
        }
    }

    fn cancel_idle(&self) {
        if let Some(task) = self.idle_task.lock().expect("idle slot poisoned").take() {
            task.abort();
        }
    }
}

/// Drains session notices and connectivity edges. Holds only a weak
/// reference to the registry so dropping the last handle stops the loop.
async fn dispatch_loop(
    registry: Weak<Inner>,
    mut notices_rx: mpsc::UnboundedReceiver<Notice>,
    mut network_rx: mpsc::UnboundedReceiver<ConnectivityEvent>,
) {
    loop {
        tokio::select! {
            notice = notices_rx.recv() => {
                let Some(notice) = notice else { break };
                let Some(inner) = registry.upgrade() else { break };
                match notice {
                    Notice::Disconnected(session) => inner.on_disconnected(&session),
                    Notice::RequestReconnect(session) => inner.queue_reconnect(session),
                    Notice::Error(err) => {
                        let _ = inner.events_tx.send(RegistryEvent::SessionError(err));
                    }
                }
            }
            event = network_rx.recv() => {
                let Some(event) = event else { break };
                let Some(inner) = registry.upgrade() else { break };
                match event {
                    ConnectivityEvent::Lost => inner.fan_out_lost(),
                    ConnectivityEvent::Restored(snapshot) => inner.fan_out_restored(snapshot),
                }
            }
        }
    }
}
