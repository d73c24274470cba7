//! One live or pending remote-shell session.
//!
//! A session owns its transport, the relay pump and one ordered outbound
//! write queue, and runs a single driver task that folds the three event
//! sources (remote peer, network monitor, local callers) into one state
//! machine. Network loss while connected opens a grace window instead of
//! tearing the session down; a restore on the same address set resumes
//! silently.

use crate::connectivity::ConnectivityMonitor;
use crate::prompt::PromptCoordinator;
use crate::registry::{Notice, SessionError};
use crate::relay::{Charset, Relay};
use crate::settings::Settings;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tether_core::{
    ConnectionProfile, ForwardStore, NetworkSnapshot, PortForward, Sink, TetherResult, Transport,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Where a session currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport constructed, connect attempt in flight.
    Connecting,
    /// The remote session is open and the relay is pumping.
    Connected,
    /// Network lost while connected; the grace timer is running.
    NetworkGrace,
    /// The connection is gone. With stay-connected set the session
    /// lingers here awaiting a fresh transport.
    Disconnected,
    /// The connection is gone and the user declined to close; only an
    /// immediate disconnect finishes the session off.
    AwaitingClose,
}

/// Commands drained by the session's driver task.
pub(crate) enum SessionCmd {
    NetworkLost,
    NetworkRestored(NetworkSnapshot),
    Disconnect { immediate: bool },
    Reconnect(Box<dyn Transport>),
    RelayEnded(TetherResult<()>),
    TransportFailed(String),
}

enum WriteCmd {
    Text(String),
    Bytes(Vec<u8>),
}

/// Everything a session needs from the registry at construction time.
pub(crate) struct SessionSeed {
    pub profile: ConnectionProfile,
    pub settings: Settings,
    pub monitor: ConnectivityMonitor,
    pub sink: Arc<dyn Sink>,
    pub forward_store: Option<Arc<dyn ForwardStore>>,
    pub notices: mpsc::UnboundedSender<Notice>,
}

pub struct Session {
    id: String,
    profile: RwLock<ConnectionProfile>,
    uses_network: bool,
    settings: Settings,
    monitor: ConnectivityMonitor,
    sink: Arc<dyn Sink>,
    forward_store: Option<Arc<dyn ForwardStore>>,
    notices: mpsc::UnboundedSender<Notice>,
    charset: Arc<Charset>,
    prompt: Arc<PromptCoordinator>,
    state_tx: watch::Sender<SessionState>,
    disconnected: AtomicBool,
    awaiting_close: AtomicBool,
    cleaned_up: AtomicBool,
    cmd_tx: mpsc::UnboundedSender<SessionCmd>,
    write_tx: Mutex<Option<mpsc::UnboundedSender<WriteCmd>>>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    forwards: Mutex<Vec<PortForward>>,
    last_network: Mutex<Option<NetworkSnapshot>>,
    pump_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("nickname", &self.nickname())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create the session and start its driver task. The connect attempt
    /// begins immediately.
    pub(crate) fn spawn(seed: SessionSeed, transport: Box<dyn Transport>) -> Arc<Self> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(SessionState::Connecting);
        let uses_network = transport.uses_network();
        let charset = Arc::new(Charset::new(&seed.profile.encoding));

        let session = Arc::new(Self {
            id: hex::encode(rand::random::<[u8; 8]>()),
            profile: RwLock::new(seed.profile),
            uses_network,
            settings: seed.settings,
            monitor: seed.monitor,
            sink: seed.sink,
            forward_store: seed.forward_store,
            notices: seed.notices,
            charset,
            prompt: Arc::new(PromptCoordinator::new()),
            state_tx,
            disconnected: AtomicBool::new(false),
            awaiting_close: AtomicBool::new(false),
            cleaned_up: AtomicBool::new(false),
            cmd_tx,
            write_tx: Mutex::new(None),
            transport: Mutex::new(None),
            forwards: Mutex::new(Vec::new()),
            last_network: Mutex::new(None),
            pump_tasks: Mutex::new(Vec::new()),
        });

        tokio::spawn(session.clone().drive(cmd_rx, transport));
        session
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn nickname(&self) -> String {
        self.profile.read().expect("profile poisoned").nickname.clone()
    }

    /// The latest copy of the owning profile.
    pub fn profile(&self) -> ConnectionProfile {
        self.profile.read().expect("profile poisoned").clone()
    }

    /// Replace the profile wholesale. Persistence is the caller's job.
    pub fn update_profile(&self, profile: ConnectionProfile) {
        *self.profile.write().expect("profile poisoned") = profile;
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Subscribe to state transitions.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn prompt(&self) -> &Arc<PromptCoordinator> {
        &self.prompt
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    pub fn is_awaiting_close(&self) -> bool {
        self.awaiting_close.load(Ordering::SeqCst)
    }

    pub(crate) fn uses_network(&self) -> bool {
        self.uses_network
    }

    /// Queue text for the remote side, encoded in the session charset.
    /// Input before the session is connected is discarded.
    pub fn write_text(&self, text: &str) {
        self.enqueue(WriteCmd::Text(text.to_string()));
    }

    /// Queue raw bytes for the remote side.
    pub fn write_bytes(&self, data: &[u8]) {
        self.enqueue(WriteCmd::Bytes(data.to_vec()));
    }

    fn enqueue(&self, cmd: WriteCmd) {
        let guard = self.write_tx.lock().expect("write queue poisoned");
        match guard.as_ref() {
            Some(tx) => {
                let _ = tx.send(cmd);
            }
            None => debug!(nickname = %self.nickname(), "dropping write, session not connected"),
        }
    }

    /// Switch the session charset. Affects both decode and encode sides
    /// at their next buffer boundary. Returns false for unknown labels.
    pub fn set_charset(&self, label: &str) -> bool {
        if self.charset.set_label(label) {
            self.profile.write().expect("profile poisoned").encoding = label.to_string();
            true
        } else {
            false
        }
    }

    /// Propagate new terminal dimensions to the remote side.
    pub async fn resize(&self, cols: u16, rows: u16, px_width: u16, px_height: u16) {
        let transport = self.transport.lock().expect("transport slot poisoned").clone();
        if let Some(transport) = transport {
            if let Err(err) = transport.set_dimensions(cols, rows, px_width, px_height).await {
                debug!(nickname = %self.nickname(), %err, "resize failed");
            }
        }
    }

    /// Register a port forward on the live transport.
    pub fn add_port_forward(&self, forward: PortForward) -> TetherResult<()> {
        if let Some(transport) = self.transport.lock().expect("transport slot poisoned").clone() {
            transport.add_port_forward(&forward)?;
        }
        self.forwards.lock().expect("forwards poisoned").push(forward);
        Ok(())
    }

    pub fn remove_port_forward(&self, forward: &PortForward) -> TetherResult<()> {
        if let Some(transport) = self.transport.lock().expect("transport slot poisoned").clone() {
            transport.remove_port_forward(forward)?;
        }
        self.forwards
            .lock()
            .expect("forwards poisoned")
            .retain(|f| f.nickname != forward.nickname);
        Ok(())
    }

    pub async fn enable_port_forward(&self, forward: &PortForward) -> TetherResult<()> {
        let transport = self.transport.lock().expect("transport slot poisoned").clone();
        match transport {
            Some(transport) => transport.enable_port_forward(forward).await,
            None => Ok(()),
        }
    }

    pub async fn disable_port_forward(&self, forward: &PortForward) -> TetherResult<()> {
        let transport = self.transport.lock().expect("transport slot poisoned").clone();
        match transport {
            Some(transport) => transport.disable_port_forward(forward).await,
            None => Ok(()),
        }
    }

    pub fn port_forwards(&self) -> Vec<PortForward> {
        self.forwards.lock().expect("forwards poisoned").clone()
    }

    /// Ask the interactive layer to verify a host key fingerprint.
    pub async fn confirm_host_key(&self, algorithm: &str, fingerprint: &[u8]) -> TetherResult<bool> {
        let hint = format!("{} key fingerprint {}", algorithm, hex::encode(fingerprint));
        self.prompt
            .request_bool(
                Some("The authenticity of this host cannot be established."),
                &hint,
            )
            .await
    }

    /// Request disconnection. Idempotent: once the flag is set, further
    /// non-immediate requests are no-ops; immediate requests always go
    /// through and are themselves idempotent.
    pub fn dispatch_disconnect(&self, immediate: bool) {
        if self.disconnected.swap(true, Ordering::SeqCst) && !immediate {
            return;
        }
        let _ = self.cmd_tx.send(SessionCmd::Disconnect { immediate });
    }

    pub(crate) fn notify_network_lost(&self) {
        let _ = self.cmd_tx.send(SessionCmd::NetworkLost);
    }

    pub(crate) fn notify_network_restored(&self, snapshot: NetworkSnapshot) {
        let _ = self.cmd_tx.send(SessionCmd::NetworkRestored(snapshot));
    }

    pub(crate) fn deliver_transport(&self, transport: Box<dyn Transport>) {
        let _ = self.cmd_tx.send(SessionCmd::Reconnect(transport));
    }

    fn set_state(&self, state: SessionState) {
        self.state_tx.send_replace(state);
    }

    fn report(&self, reason: String) {
        let profile = self.profile();
        let _ = self.notices.send(Notice::Error(SessionError {
            nickname: profile.nickname,
            hostname: profile.hostname,
            reason,
        }));
    }

    /// The driver task: runs one connection attempt at a time, and with
    /// stay-connected set loops through fresh transports handed back by
    /// the registry.
    async fn drive(
        self: Arc<Self>,
        mut cmd_rx: mpsc::UnboundedReceiver<SessionCmd>,
        transport: Box<dyn Transport>,
    ) {
        let mut transport: Arc<dyn Transport> = Arc::from(transport);
        loop {
            let immediate = self.run_connection(&mut cmd_rx, transport.clone()).await;
            self.tear_down(transport.clone()).await;

            let profile = self.profile();
            if immediate || (profile.quick_disconnect && !profile.stay_connected) {
                break;
            }

            if profile.stay_connected {
                info!(nickname = %profile.nickname, "queueing for reconnect");
                self.set_state(SessionState::Disconnected);
                let _ = self.notices.send(Notice::RequestReconnect(self.clone()));
                match self.await_transport(&mut cmd_rx).await {
                    Some(next) => {
                        transport = Arc::from(next);
                        self.disconnected.store(false, Ordering::SeqCst);
                        continue;
                    }
                    None => break,
                }
            }

            // The connection is already gone; ask before closing the
            // session itself. An immediate request cuts the question
            // short; a "no" parks it until an immediate request.
            self.set_state(SessionState::Disconnected);
            let ask = self
                .prompt
                .request_bool(Some("Connection lost."), "Close session?");
            tokio::pin!(ask);
            let close_now = loop {
                tokio::select! {
                    answer = &mut ask => break matches!(answer, Ok(true)),
                    cmd = cmd_rx.recv() => match cmd {
                        Some(SessionCmd::Disconnect { immediate: true }) | None => {
                            self.prompt.cancel();
                            break true;
                        }
                        Some(_) => {}
                    },
                }
            };
            if close_now {
                break;
            }
            self.awaiting_close.store(true, Ordering::SeqCst);
            self.set_state(SessionState::AwaitingClose);
            self.await_immediate_close(&mut cmd_rx).await;
            break;
        }
        self.finalize();
    }

    /// One connection attempt from connect through disconnect decision.
    /// Returns whether the disconnect was requested as immediate.
    async fn run_connection(
        self: &Arc<Self>,
        cmd_rx: &mut mpsc::UnboundedReceiver<SessionCmd>,
        transport: Arc<dyn Transport>,
    ) -> bool {
        self.set_state(SessionState::Connecting);

        // Forwards attach before connect; a bad one is reported and
        // skipped, never fatal to the attempt.
        let forwards = self.load_forwards();
        for forward in &forwards {
            if let Err(err) = transport.add_port_forward(forward) {
                self.report(format!("port forward {} failed: {err}", forward.description()));
            }
        }
        *self.forwards.lock().expect("forwards poisoned") = forwards.clone();

        match self.connect_interruptible(cmd_rx, &transport).await {
            ConnectOutcome::Connected => {}
            ConnectOutcome::Failed(err) => {
                warn!(nickname = %self.nickname(), %err, "connect failed");
                self.report(format!("connection failed: {err}"));
                self.disconnected.store(true, Ordering::SeqCst);
                self.set_state(SessionState::Disconnected);
                return false;
            }
            ConnectOutcome::Cancelled { immediate } => {
                self.disconnected.store(true, Ordering::SeqCst);
                return immediate;
            }
        }

        *self.transport.lock().expect("transport slot poisoned") = Some(transport.clone());

        // Anything the sink buffered before login is noise.
        self.sink.reset();
        let captured = self.monitor.current_network();
        *self.last_network.lock().expect("network slot poisoned") = captured.clone();

        self.start_pumps(transport.clone());

        for forward in forwards.iter().filter(|f| f.enabled) {
            if let Err(err) = transport.enable_port_forward(forward).await {
                self.report(format!("port forward {} failed: {err}", forward.nickname));
            }
        }

        if let Some(post_login) = self.profile().post_login {
            let mut command = post_login;
            if !command.ends_with('\n') {
                command.push('\n');
            }
            self.write_text(&command);
        }

        info!(nickname = %self.nickname(), "session connected");
        self.set_state(SessionState::Connected);

        let immediate = self.event_loop(cmd_rx, captured).await;
        self.disconnected.store(true, Ordering::SeqCst);
        immediate
    }

    /// Await connect while staying responsive to disconnect requests.
    async fn connect_interruptible(
        &self,
        cmd_rx: &mut mpsc::UnboundedReceiver<SessionCmd>,
        transport: &Arc<dyn Transport>,
    ) -> ConnectOutcome {
        let mut connect = transport.connect();
        loop {
            tokio::select! {
                res = &mut connect => {
                    return match res {
                        Ok(()) => ConnectOutcome::Connected,
                        Err(err) => ConnectOutcome::Failed(err.to_string()),
                    };
                }
                cmd = cmd_rx.recv() => match cmd {
                    Some(SessionCmd::Disconnect { immediate }) => {
                        return ConnectOutcome::Cancelled { immediate };
                    }
                    Some(_) => {}
                    None => return ConnectOutcome::Cancelled { immediate: true },
                },
            }
        }
    }

    /// Drain events while connected, including the grace window. Returns
    /// whether the resulting disconnect is immediate.
    async fn event_loop(
        &self,
        cmd_rx: &mut mpsc::UnboundedReceiver<SessionCmd>,
        mut captured: Option<NetworkSnapshot>,
    ) -> bool {
        let mut grace_deadline: Option<Instant> = None;
        loop {
            let cmd = match grace_deadline {
                Some(deadline) => {
                    tokio::select! {
                        cmd = cmd_rx.recv() => cmd,
                        _ = tokio::time::sleep_until(deadline) => {
                            warn!(nickname = %self.nickname(), "grace period expired");
                            self.report("network lost".to_string());
                            return false;
                        }
                    }
                }
                None => cmd_rx.recv().await,
            };

            match cmd {
                Some(SessionCmd::NetworkLost) => {
                    if self.uses_network
                        && !self.disconnected.load(Ordering::SeqCst)
                        && grace_deadline.is_none()
                    {
                        info!(nickname = %self.nickname(), "network lost, starting grace period");
                        grace_deadline = Some(Instant::now() + self.settings.grace_period());
                        self.set_state(SessionState::NetworkGrace);
                    }
                }
                Some(SessionCmd::NetworkRestored(snapshot)) => {
                    if grace_deadline.is_some() {
                        let same = captured
                            .as_ref()
                            .map(|c| snapshot.shares_address_with(c))
                            .unwrap_or(true);
                        if same {
                            info!(nickname = %self.nickname(), "network restored on a shared address");
                            grace_deadline = None;
                            *self.last_network.lock().expect("network slot poisoned") =
                                Some(snapshot.clone());
                            captured = Some(snapshot);
                            self.set_state(SessionState::Connected);
                        } else {
                            info!(nickname = %self.nickname(), "network changed, connection assumed broken");
                            return false;
                        }
                    }
                }
                Some(SessionCmd::Disconnect { immediate }) => return immediate,
                Some(SessionCmd::RelayEnded(result)) => {
                    if let Err(err) = result {
                        self.report(format!("connection lost: {err}"));
                    }
                    return false;
                }
                Some(SessionCmd::TransportFailed(reason)) => {
                    self.report(format!("write failed: {reason}"));
                    return false;
                }
                Some(SessionCmd::Reconnect(_)) => {
                    debug!(nickname = %self.nickname(), "ignoring reconnect while connected");
                }
                None => return true,
            }
        }
    }

    /// Start the relay pump and the ordered outbound writer.
    fn start_pumps(self: &Arc<Self>, transport: Arc<dyn Transport>) {
        let (write_tx, mut write_rx) = mpsc::unbounded_channel();
        *self.write_tx.lock().expect("write queue poisoned") = Some(write_tx);

        let relay = Relay::new(
            transport.clone(),
            self.sink.clone(),
            self.charset.clone(),
            self.settings.relay_buffer_size,
        );
        let cmd_tx = self.cmd_tx.clone();
        let reader = tokio::spawn(async move {
            let result = relay.pump().await;
            let _ = cmd_tx.send(SessionCmd::RelayEnded(result));
        });

        let charset = self.charset.clone();
        let cmd_tx = self.cmd_tx.clone();
        let writer = tokio::spawn(async move {
            while let Some(cmd) = write_rx.recv().await {
                let bytes = match cmd {
                    WriteCmd::Text(text) => charset.encode(&text),
                    WriteCmd::Bytes(bytes) => bytes,
                };
                if let Err(err) = transport.write(&bytes).await {
                    let _ = cmd_tx.send(SessionCmd::TransportFailed(err.to_string()));
                    break;
                }
            }
        });

        let mut tasks = self.pump_tasks.lock().expect("tasks poisoned");
        tasks.push(reader);
        tasks.push(writer);
    }

    /// Shut one connection down: cancel the outstanding prompt, stop the
    /// pumps and dispatch the transport close without blocking.
    async fn tear_down(&self, transport: Arc<dyn Transport>) {
        self.prompt.cancel();
        *self.write_tx.lock().expect("write queue poisoned") = None;
        *self.transport.lock().expect("transport slot poisoned") = None;

        tokio::spawn(async move {
            if let Err(err) = transport.close().await {
                debug!(%err, "transport close failed");
            }
        });

        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.pump_tasks.lock().expect("tasks poisoned");
            guard.drain(..).collect()
        };
        for task in tasks {
            task.abort();
        }
    }

    /// Park until the registry hands back a fresh transport.
    async fn await_transport(
        &self,
        cmd_rx: &mut mpsc::UnboundedReceiver<SessionCmd>,
    ) -> Option<Box<dyn Transport>> {
        loop {
            match cmd_rx.recv().await {
                Some(SessionCmd::Reconnect(transport)) => return Some(transport),
                Some(SessionCmd::Disconnect { immediate: true }) => return None,
                Some(_) => {}
                None => return None,
            }
        }
    }

    /// Park until an immediate disconnect finishes the session off.
    async fn await_immediate_close(&self, cmd_rx: &mut mpsc::UnboundedReceiver<SessionCmd>) {
        loop {
            match cmd_rx.recv().await {
                Some(SessionCmd::Disconnect { immediate: true }) | None => return,
                Some(_) => {}
            }
        }
    }

    /// Notify the registry and release everything. Runs exactly once.
    fn finalize(self: &Arc<Self>) {
        if self.cleaned_up.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(SessionState::Disconnected);
        info!(nickname = %self.nickname(), "session closed");
        let _ = self.notices.send(Notice::Disconnected(self.clone()));

        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.pump_tasks.lock().expect("tasks poisoned");
            guard.drain(..).collect()
        };
        for task in tasks {
            task.abort();
        }
        *self.write_tx.lock().expect("write queue poisoned") = None;
        *self.transport.lock().expect("transport slot poisoned") = None;
    }

    fn load_forwards(&self) -> Vec<PortForward> {
        let Some(store) = self.forward_store.as_ref() else {
            return Vec::new();
        };
        let nickname = self.nickname();
        let mut loaded = Vec::new();
        for entry in store.forwards_for(&nickname) {
            match entry {
                Ok(forward) => loaded.push(forward),
                Err(err) => {
                    self.report(format!("failed to load a port forward: {err}"));
                }
            }
        }
        loaded
    }
}

enum ConnectOutcome {
    Connected,
    Failed(String),
    Cancelled { immediate: bool },
}
