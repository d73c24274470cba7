//! In-memory doubles for transports, sinks and stores used across the
//! crate's unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tether_core::{
    ConnectionProfile, ForwardStore, PortForward, ProfileStore, Sink, TetherError, TetherResult,
    Transport, TransportFactory,
};
use tether_core::transport::BoxFuture;
use tokio::sync::Notify;

/// Shared interior of a `MockTransport`, kept around by tests for
/// assertions after the boxed transport has been handed off.
#[derive(Default)]
pub(crate) struct MockState {
    incoming: Mutex<VecDeque<Vec<u8>>>,
    written: Mutex<Vec<u8>>,
    connected: AtomicBool,
    closed: AtomicBool,
    drained_is_eof: AtomicBool,
    fail_connect: AtomicBool,
    fail_read: AtomicBool,
    uses_network: AtomicBool,
    forwards_added: Mutex<Vec<PortForward>>,
    forwards_enabled: Mutex<Vec<String>>,
    wake: Notify,
}

pub(crate) type MockHandle = Arc<MockState>;

impl MockState {
    /// Queue bytes for the transport's read side.
    pub(crate) fn push_incoming(&self, data: &[u8]) {
        self.incoming
            .lock()
            .unwrap()
            .push_back(data.to_vec());
        self.wake.notify_waiters();
    }

    /// Signal end-of-stream once queued data is drained.
    pub(crate) fn finish(&self) {
        self.drained_is_eof.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    pub(crate) fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn forwards_added(&self) -> Vec<PortForward> {
        self.forwards_added.lock().unwrap().clone()
    }

    pub(crate) fn forwards_enabled(&self) -> Vec<String> {
        self.forwards_enabled.lock().unwrap().clone()
    }
}

/// A scripted in-memory transport.
pub(crate) struct MockTransport {
    state: MockHandle,
}

impl MockTransport {
    /// A transport that serves the given chunks then reports EOF.
    pub(crate) fn with_incoming(chunks: Vec<Vec<u8>>) -> Self {
        let state = Arc::new(MockState::default());
        *state.incoming.lock().unwrap() = chunks.into();
        state.drained_is_eof.store(true, Ordering::SeqCst);
        state.uses_network.store(true, Ordering::SeqCst);
        Self { state }
    }

    /// A transport whose reads stay pending until data is pushed or the
    /// handle signals EOF. Returns the transport and its handle.
    pub(crate) fn open_ended() -> (Self, MockHandle) {
        let state = Arc::new(MockState::default());
        state.uses_network.store(true, Ordering::SeqCst);
        (Self { state: state.clone() }, state)
    }

    /// A transport whose connect attempt fails.
    pub(crate) fn failing_connect() -> (Self, MockHandle) {
        let (t, h) = Self::open_ended();
        h.fail_connect.store(true, Ordering::SeqCst);
        (t, h)
    }

    /// A transport whose reads fail with an I/O error.
    pub(crate) fn failing_read() -> Self {
        let (t, h) = Self::open_ended();
        h.fail_read.store(true, Ordering::SeqCst);
        t
    }

    /// A transport that does not use the network (local pty).
    pub(crate) fn networkless() -> (Self, MockHandle) {
        let (t, h) = Self::open_ended();
        h.uses_network.store(false, Ordering::SeqCst);
        (t, h)
    }
}

impl Transport for MockTransport {
    fn connect(&self) -> BoxFuture<'_, TetherResult<()>> {
        let state = self.state.clone();
        Box::pin(async move {
            if state.fail_connect.load(Ordering::SeqCst) {
                return Err(TetherError::ConnectFailed {
                    host: "mock".into(),
                    reason: "scripted failure".into(),
                });
            }
            state.connected.store(true, Ordering::SeqCst);
            Ok(())
        })
    }

    fn read<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, TetherResult<usize>> {
        let state = self.state.clone();
        Box::pin(async move {
            loop {
                if state.fail_read.load(Ordering::SeqCst) {
                    return Err(TetherError::Transport("scripted read failure".into()));
                }
                let chunk = state.incoming.lock().unwrap().pop_front();
                if let Some(chunk) = chunk {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    // Re-queue any remainder that did not fit.
                    if n < chunk.len() {
                        state
                            .incoming
                            .lock()
                            .unwrap()
                            .push_front(chunk[n..].to_vec());
                    }
                    return Ok(n);
                }
                if state.drained_is_eof.load(Ordering::SeqCst)
                    || state.closed.load(Ordering::SeqCst)
                {
                    return Ok(0);
                }
                state.wake.notified().await;
            }
        })
    }

    fn write<'a>(&'a self, data: &'a [u8]) -> BoxFuture<'a, TetherResult<()>> {
        let state = self.state.clone();
        Box::pin(async move {
            state.written.lock().unwrap().extend_from_slice(data);
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, TetherResult<()>> {
        let state = self.state.clone();
        Box::pin(async move {
            state.closed.store(true, Ordering::SeqCst);
            state.connected.store(false, Ordering::SeqCst);
            state.wake.notify_waiters();
            Ok(())
        })
    }

    fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    fn set_dimensions(
        &self,
        _cols: u16,
        _rows: u16,
        _px_width: u16,
        _px_height: u16,
    ) -> BoxFuture<'_, TetherResult<()>> {
        Box::pin(async { Ok(()) })
    }

    fn add_port_forward(&self, forward: &PortForward) -> TetherResult<()> {
        self.state.forwards_added.lock().unwrap().push(forward.clone());
        Ok(())
    }

    fn remove_port_forward(&self, forward: &PortForward) -> TetherResult<()> {
        self.state
            .forwards_added
            .lock()
            .unwrap()
            .retain(|f| f.nickname != forward.nickname);
        Ok(())
    }

    fn enable_port_forward<'a>(
        &'a self,
        forward: &'a PortForward,
    ) -> BoxFuture<'a, TetherResult<()>> {
        let state = self.state.clone();
        Box::pin(async move {
            state
                .forwards_enabled
                .lock()
                .unwrap()
                .push(forward.nickname.clone());
            Ok(())
        })
    }

    fn disable_port_forward<'a>(
        &'a self,
        forward: &'a PortForward,
    ) -> BoxFuture<'a, TetherResult<()>> {
        let state = self.state.clone();
        Box::pin(async move {
            state
                .forwards_enabled
                .lock()
                .unwrap()
                .retain(|n| n != &forward.nickname);
            Ok(())
        })
    }

    fn can_forward_ports(&self) -> bool {
        true
    }

    fn uses_network(&self) -> bool {
        self.state.uses_network.load(Ordering::SeqCst)
    }
}

/// Factory serving pre-built mock transports in order.
#[derive(Default)]
pub(crate) struct MockFactory {
    queue: Mutex<VecDeque<MockTransport>>,
}

impl MockFactory {
    pub(crate) fn with(transports: Vec<MockTransport>) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(transports.into()),
        })
    }
}

impl TransportFactory for MockFactory {
    fn create(&self, profile: &ConnectionProfile) -> TetherResult<Box<dyn Transport>> {
        self.queue
            .lock()
            .unwrap()
            .pop_front()
            .map(|t| Box::new(t) as Box<dyn Transport>)
            .ok_or_else(|| TetherError::ConnectFailed {
                host: profile.hostname.clone(),
                reason: "no transport scripted".into(),
            })
    }
}

/// Sink that accumulates received runs and counts resets.
#[derive(Default)]
pub(crate) struct CollectSink {
    received: Mutex<Vec<u8>>,
    resets: AtomicUsize,
}

impl CollectSink {
    pub(crate) fn text(&self) -> String {
        String::from_utf8_lossy(&self.received.lock().unwrap()).into_owned()
    }

    pub(crate) fn reset_count(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

impl Sink for CollectSink {
    fn receive(&self, data: &[u8]) {
        self.received.lock().unwrap().extend_from_slice(data);
    }

    fn reset(&self) {
        self.received.lock().unwrap().clear();
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

/// Sink factory handing out a shared `CollectSink`.
pub(crate) struct SharedSinkFactory {
    pub(crate) sink: Arc<CollectSink>,
}

impl SharedSinkFactory {
    pub(crate) fn new() -> (Arc<Self>, Arc<CollectSink>) {
        let sink = Arc::new(CollectSink::default());
        (Arc::new(Self { sink: sink.clone() }), sink)
    }
}

impl crate::registry::SinkFactory for SharedSinkFactory {
    fn create(&self, _profile: &ConnectionProfile) -> Arc<dyn Sink> {
        self.sink.clone()
    }
}

/// Forward store returning a scripted list.
#[derive(Default)]
pub(crate) struct MemForwardStore {
    pub(crate) forwards: Mutex<Vec<TetherResult<PortForward>>>,
}

impl ForwardStore for MemForwardStore {
    fn forwards_for(&self, _nickname: &str) -> Vec<TetherResult<PortForward>> {
        std::mem::take(&mut *self.forwards.lock().unwrap())
    }
}

/// Profile store recording touches.
#[derive(Default)]
pub(crate) struct MemProfileStore {
    pub(crate) touched: Mutex<Vec<String>>,
}

impl ProfileStore for MemProfileStore {
    fn find(&self, _nickname: &str) -> TetherResult<Option<ConnectionProfile>> {
        Ok(None)
    }

    fn save(&self, _profile: &ConnectionProfile) -> TetherResult<()> {
        Ok(())
    }

    fn touch(&self, nickname: &str) -> TetherResult<()> {
        self.touched.lock().unwrap().push(nickname.to_string());
        Ok(())
    }
}
