//! Mock transport for testing

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use fieldlink_core::TransportKind;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;

use super::{IncomingFrame, Transport, TransportError, TransportEvent};
use crate::config::MockConfig;

/// A scripted reply to one sent frame
#[derive(Debug, Clone)]
pub struct MockReply {
    /// Delay before the reply is delivered
    pub delay: Duration,
    /// Identity the reply appears to come from
    pub identity: Option<String>,
    pub data: Bytes,
}

impl MockReply {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            delay: Duration::ZERO,
            identity: None,
            data: data.into(),
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn from_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }
}

type Responder = Arc<dyn Fn(Option<&str>, &[u8]) -> Vec<MockReply> + Send + Sync>;

/// Mock transport adapter for testing
///
/// Echoes every frame back by default; install a responder to script
/// delays, silence, or replies from other identities.
pub struct MockTransport {
    kind: TransportKind,
    latency: Duration,
    connected: AtomicBool,
    events: broadcast::Sender<TransportEvent>,
    responder: RwLock<Option<Responder>>,
    sent: Mutex<Vec<(Option<String>, Bytes)>>,
    closed_peers: Mutex<Vec<String>>,
    connect_attempts: AtomicUsize,
    close_calls: AtomicUsize,
    failing_connects: AtomicUsize,
    failing_sends: AtomicUsize,
    connect_delay: RwLock<Duration>,
}

impl MockTransport {
    pub fn new(config: &MockConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            kind: TransportKind::Stream,
            latency: Duration::from_millis(config.latency_ms),
            connected: AtomicBool::new(false),
            events,
            responder: RwLock::new(None),
            sent: Mutex::new(Vec::new()),
            closed_peers: Mutex::new(Vec::new()),
            connect_attempts: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
            failing_connects: AtomicUsize::new(0),
            failing_sends: AtomicUsize::new(0),
            connect_delay: RwLock::new(Duration::ZERO),
        }
    }

    /// Mock with the given transport shape (e.g. `Server` for multi-identity tests)
    pub fn with_kind(kind: TransportKind) -> Self {
        Self {
            kind,
            ..Self::new(&MockConfig::default())
        }
    }

    /// Replace the echo behaviour
    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(Option<&str>, &[u8]) -> Vec<MockReply> + Send + Sync + 'static,
    {
        *self.responder.write() = Some(Arc::new(responder));
    }

    /// Never answer anything
    pub fn silence(&self) {
        self.set_responder(|_, _| Vec::new());
    }

    /// Fail the next `count` connect attempts
    pub fn fail_next_connects(&self, count: usize) {
        self.failing_connects.store(count, Ordering::SeqCst);
    }

    /// Refuse the next `count` sends while staying connected
    pub fn fail_next_sends(&self, count: usize) {
        self.failing_sends.store(count, Ordering::SeqCst);
    }

    /// Make connect attempts take this long
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.write() = delay;
    }

    /// Simulate losing the transport
    pub fn fail(&self, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self
            .events
            .send(TransportEvent::Disconnected(reason.to_string()));
    }

    /// Inject an unsolicited frame
    pub fn inject(&self, identity: Option<&str>, data: impl Into<Bytes>) {
        let frame = IncomingFrame::new(identity.map(str::to_string), data);
        let _ = self.events.send(TransportEvent::Received(frame));
    }

    /// Simulate a server-style peer coming and going
    pub fn peer_connected(&self, identity: &str) {
        let _ = self
            .events
            .send(TransportEvent::PeerConnected(identity.to_string()));
    }

    pub fn peer_disconnected(&self, identity: &str) {
        let _ = self
            .events
            .send(TransportEvent::PeerDisconnected(identity.to_string()));
    }

    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn sent_frames(&self) -> Vec<(Option<String>, Bytes)> {
        self.sent.lock().clone()
    }

    pub fn closed_peers(&self) -> Vec<String> {
        self.closed_peers.lock().clone()
    }

    fn replies(&self, identity: Option<&str>, frame: &[u8]) -> Vec<MockReply> {
        let responder = self.responder.read().clone();
        match responder {
            Some(responder) => responder(identity, frame),
            None => {
                let mut reply = MockReply::new(Bytes::copy_from_slice(frame)).after(self.latency);
                reply.identity = identity.map(str::to_string);
                vec![reply]
            }
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn describe(&self) -> String {
        format!("mock://{}", self.kind)
    }

    async fn connect(&self) -> Result<(), TransportError> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let delay = *self.connect_delay.read();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failing = self.failing_connects.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_connects.store(failing - 1, Ordering::SeqCst);
            return Err(TransportError::ConnectionFailed(
                "Mock connect refused".to_string(),
            ));
        }

        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close_peer(&self, identity: &str) -> Result<(), TransportError> {
        self.closed_peers.lock().push(identity.to_string());
        Ok(())
    }

    async fn send(&self, identity: Option<&str>, frame: &[u8]) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        let failing = self.failing_sends.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_sends.store(failing - 1, Ordering::SeqCst);
            return Err(TransportError::SendFailed("Mock send refused".to_string()));
        }

        self.sent
            .lock()
            .push((identity.map(str::to_string), Bytes::copy_from_slice(frame)));
        tracing::debug!(?identity, len = frame.len(), "Mock transport: sent frame");

        for reply in self.replies(identity, frame) {
            let events = self.events.clone();
            tokio::spawn(async move {
                if !reply.delay.is_zero() {
                    tokio::time::sleep(reply.delay).await;
                }
                let frame = IncomingFrame::new(reply.identity, reply.data);
                let _ = events.send(TransportEvent::Received(frame));
            });
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
