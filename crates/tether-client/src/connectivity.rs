//! Network reachability monitoring and ref-counted resource locking.
//!
//! A platform watcher feeds snapshots into the monitor via `observe`;
//! the monitor debounces them into loss/restore edges delivered over a
//! channel the registry drains. It also owns the exclusive network
//! resource (a radio wake lock), held collectively by all sessions via
//! reference counting — no session may release it unilaterally.
//!
//! If no watcher ever registers (platform setup failure), the monitor
//! simply never sees a snapshot and reports the network as available:
//! sessions keep working, resilience degrades to assume-connected.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_core::NetworkSnapshot;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Settle window for flap suppression. An observation only becomes an
/// edge if the state is still changed once the window elapses.
const DEBOUNCE: Duration = Duration::from_millis(300);

/// Edges the monitor delivers. Only genuine transitions produce one.
#[derive(Debug, Clone)]
pub enum ConnectivityEvent {
    /// A previously validated network was lost.
    Lost,
    /// A validated network came back after having none.
    Restored(NetworkSnapshot),
}

/// Exclusive resource held while anything needs the network.
pub trait NetworkLock: Send + Sync {
    fn acquire(&self);
    fn release(&self);
    fn is_held(&self) -> bool;
}

/// A lock for platforms with no radio resource to hold.
#[derive(Default)]
pub struct NoopLock {
    held: Mutex<bool>,
}

impl NetworkLock for NoopLock {
    fn acquire(&self) {
        *self.held.lock().expect("lock state poisoned") = true;
    }
    fn release(&self) {
        *self.held.lock().expect("lock state poisoned") = false;
    }
    fn is_held(&self) -> bool {
        *self.held.lock().expect("lock state poisoned")
    }
}

struct MonitorState {
    /// Latest observed snapshot. `None` until a watcher reports.
    snapshot: Option<NetworkSnapshot>,
    /// Connectivity as last reported to the registry.
    reported_connected: bool,
    /// Consumers currently needing the network.
    refs: u32,
    /// Whether holding the resource lock is desired at all.
    want_lock: bool,
}

struct MonitorInner {
    state: Mutex<MonitorState>,
    lock: Arc<dyn NetworkLock>,
    events_tx: mpsc::UnboundedSender<ConnectivityEvent>,
    debounce: Mutex<Option<JoinHandle<()>>>,
}

/// Observes network changes and owns the shared resource lock.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<MonitorInner>,
}

impl ConnectivityMonitor {
    /// Create a monitor. The returned receiver carries debounced edges.
    pub fn new(
        lock: Arc<dyn NetworkLock>,
        want_lock: bool,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectivityEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let monitor = Self {
            inner: Arc::new(MonitorInner {
                state: Mutex::new(MonitorState {
                    snapshot: None,
                    reported_connected: true,
                    refs: 0,
                    want_lock,
                }),
                lock,
                events_tx,
                debounce: Mutex::new(None),
            }),
        };
        (monitor, events_rx)
    }

    /// The latest observed snapshot, if a watcher has reported one.
    pub fn current_network(&self) -> Option<NetworkSnapshot> {
        self.inner
            .state
            .lock()
            .expect("monitor state poisoned")
            .snapshot
            .clone()
    }

    /// Whether the network is currently usable. With no watcher input we
    /// assume it is, so a broken platform monitor never blocks sessions.
    pub fn is_connected(&self) -> bool {
        self.inner
            .state
            .lock()
            .expect("monitor state poisoned")
            .snapshot
            .as_ref()
            .map(|s| s.connected)
            .unwrap_or(true)
    }

    /// Feed an observed snapshot from the platform watcher. Rapid
    /// flapping inside the settle window produces no edge.
    pub fn observe(&self, snapshot: NetworkSnapshot) {
        {
            let mut state = self.inner.state.lock().expect("monitor state poisoned");
            debug!(
                connected = snapshot.connected,
                identity = %snapshot.identity,
                "network snapshot observed"
            );
            state.snapshot = Some(snapshot);
        }

        // Re-arm the settle timer; only the last observation in a burst
        // gets to emit an edge.
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(DEBOUNCE).await;

            let event = {
                let mut state = inner.state.lock().expect("monitor state poisoned");
                let settled = state
                    .snapshot
                    .as_ref()
                    .map(|s| s.connected)
                    .unwrap_or(true);
                if settled == state.reported_connected {
                    None
                } else {
                    state.reported_connected = settled;
                    if settled {
                        state.snapshot.clone().map(ConnectivityEvent::Restored)
                    } else {
                        Some(ConnectivityEvent::Lost)
                    }
                }
            };

            if let Some(event) = event {
                info!(?event, "connectivity edge");
                let _ = inner.events_tx.send(event);
            }
        });

        let mut debounce = self.inner.debounce.lock().expect("debounce slot poisoned");
        if let Some(old) = debounce.replace(task) {
            old.abort();
        }
    }

    /// Record another consumer of the network, acquiring the resource
    /// lock if it is wanted and not yet held.
    pub fn inc_ref(&self) {
        let mut state = self.inner.state.lock().expect("monitor state poisoned");
        state.refs += 1;
        self.sync_lock(&mut state);
    }

    /// Drop one consumer of the network, releasing the resource lock
    /// when the last one goes away. Underflow is rejected, never stored.
    pub fn dec_ref(&self) {
        let mut state = self.inner.state.lock().expect("monitor state poisoned");
        if state.refs == 0 {
            warn!("network ref count underflow ignored");
            return;
        }
        state.refs -= 1;
        self.sync_lock(&mut state);
    }

    /// Toggle whether holding the resource lock is desired (a user
    /// preference). Takes effect immediately.
    pub fn set_want_lock(&self, want: bool) {
        let mut state = self.inner.state.lock().expect("monitor state poisoned");
        state.want_lock = want;
        self.sync_lock(&mut state);
    }

    /// Current consumer count, for diagnostics.
    pub fn ref_count(&self) -> u32 {
        self.inner
            .state
            .lock()
            .expect("monitor state poisoned")
            .refs
    }

    /// Hold the lock iff it is wanted and at least one consumer is
    /// active; release the moment either condition fails.
    fn sync_lock(&self, state: &mut MonitorState) {
        let should_hold = state.want_lock && state.refs > 0;
        let held = self.inner.lock.is_held();
        if should_hold && !held {
            debug!(refs = state.refs, "acquiring network resource lock");
            self.inner.lock.acquire();
        } else if !should_hold && held {
            debug!(refs = state.refs, "releasing network resource lock");
            self.inner.lock.release();
        }
    }

    /// Release the lock and drop the debounce task on teardown.
    pub fn shutdown(&self) {
        if let Some(task) = self
            .inner
            .debounce
            .lock()
            .expect("debounce slot poisoned")
            .take()
        {
            task.abort();
        }
        if self.inner.lock.is_held() {
            self.inner.lock.release();
        }
    }
}
