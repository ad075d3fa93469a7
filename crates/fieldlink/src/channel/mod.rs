//! Shared physical channel
//!
//! A [`Channel`] owns one transport and fans its traffic out to the devices
//! attached to it. Membership changes happen under a short structural lock
//! that is never held across I/O; connect and close are serialized by a
//! separate async gate.

mod events;

pub use events::{ChannelHandler, EventFlow, Lifecycle};

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use bytes::BytesMut;
use dashmap::DashMap;
use fieldlink_core::{
    FrameAdapter, InboundMessage, LinkError, LinkResult, Protocol, TransportKind,
};
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ChannelConfig;
use crate::device::DeviceId;
use crate::sync::{CancelReason, CorrelationRegistry, EndpointLock, EndpointLocks};
use crate::transport::{create_transport, IncomingFrame, Transport, TransportError, TransportEvent};

/// Connection state of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Offline,
    Connecting,
    Online,
    Closing,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Offline => "offline",
            ChannelState::Connecting => "connecting",
            ChannelState::Online => "online",
            ChannelState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Result of removing a member
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Departure {
    /// Members still attached
    pub remaining: usize,
    /// Another remaining member uses the same identity
    pub identity_shared: bool,
}

struct Member {
    device: DeviceId,
    identity: Option<String>,
    handler: Weak<dyn ChannelHandler>,
}

#[derive(Default)]
struct Membership {
    adapter: Option<Arc<dyn FrameAdapter>>,
    protocol: Option<String>,
    exclusive: bool,
    members: Vec<Member>,
}

/// One transport shared by one or more devices
pub struct Channel {
    name: String,
    kind: TransportKind,
    transport: Arc<dyn Transport>,
    me: Weak<Channel>,
    state: watch::Sender<ChannelState>,
    membership: Mutex<Membership>,
    io_gate: tokio::sync::Mutex<()>,
    closed: Mutex<CancellationToken>,
    default_registry: Arc<CorrelationRegistry>,
    registries: DashMap<String, Arc<CorrelationRegistry>>,
    endpoint_locks: EndpointLocks,
    pump: Mutex<Option<JoinHandle<()>>>,
}

/// Puts the state back to offline unless the connect attempt completed
struct ConnectingGuard<'a> {
    state: &'a watch::Sender<ChannelState>,
    armed: bool,
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.state.send_replace(ChannelState::Offline);
        }
    }
}

impl Channel {
    pub fn new(name: impl Into<String>, transport: Arc<dyn Transport>) -> Arc<Self> {
        let (state, _) = watch::channel(ChannelState::Offline);
        let kind = transport.kind();
        Arc::new_cyclic(|me| Self {
            name: name.into(),
            kind,
            transport,
            me: me.clone(),
            state,
            membership: Mutex::new(Membership::default()),
            io_gate: tokio::sync::Mutex::new(()),
            closed: Mutex::new(CancellationToken::new()),
            default_registry: Arc::new(CorrelationRegistry::new()),
            registries: DashMap::new(),
            endpoint_locks: EndpointLocks::new(),
            pump: Mutex::new(None),
        })
    }

    /// Build the configured transport; nothing is opened yet
    pub fn from_config(config: &ChannelConfig) -> Result<Arc<Self>, TransportError> {
        let transport = create_transport(&config.transport)?;
        Ok(Self::new(config.name.clone(), transport))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.state() == ChannelState::Online
    }

    /// Observe state transitions
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    /// Signal cancelled when the current session tears down
    ///
    /// A fresh token is installed by the next successful connect.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.lock().clone()
    }

    pub fn member_count(&self) -> usize {
        self.membership.lock().members.len()
    }

    /// Name of the protocol that configured the framing
    pub fn protocol_name(&self) -> Option<String> {
        self.membership.lock().protocol.clone()
    }

    /// Framing adapter installed by the first member
    pub fn adapter(&self) -> LinkResult<Arc<dyn FrameAdapter>> {
        self.membership.lock().adapter.clone().ok_or_else(|| {
            LinkError::InvalidOperation(format!("channel '{}' has no members", self.name))
        })
    }

    /// Correlation registry serving `identity`
    ///
    /// Server-style channels keep one registry per remote identity; every
    /// other channel shares a single registry among its members.
    pub fn registry(&self, identity: Option<&str>) -> Arc<CorrelationRegistry> {
        match identity {
            Some(identity) if self.kind.is_multi_identity() => self
                .registries
                .entry(identity.to_string())
                .or_insert_with(|| Arc::new(CorrelationRegistry::new()))
                .clone(),
            _ => self.default_registry.clone(),
        }
    }

    /// Serialization lock for `identity` on server-style channels
    ///
    /// `None` means the caller is its own endpoint.
    pub fn endpoint_lock(&self, identity: Option<&str>) -> Option<EndpointLock> {
        match identity {
            Some(identity) if self.kind.is_multi_identity() => {
                Some(self.endpoint_locks.get(identity))
            }
            _ => None,
        }
    }

    /// Add a member; `Ok(false)` if it was already attached
    pub(crate) fn join(
        &self,
        device: DeviceId,
        identity: Option<String>,
        protocol: &dyn Protocol,
        handler: Weak<dyn ChannelHandler>,
    ) -> LinkResult<bool> {
        let mut membership = self.membership.lock();
        if membership.members.iter().any(|m| m.device == device) {
            return Ok(false);
        }

        if membership.members.is_empty() {
            membership.adapter = Some(protocol.adapter(self.kind));
            membership.protocol = Some(protocol.name().to_string());
            membership.exclusive = !protocol.supports_multiple_devices();
            debug!(
                channel = %self.name,
                protocol = protocol.name(),
                kind = %self.kind,
                "Channel framing configured"
            );
        } else if membership.exclusive || !protocol.supports_multiple_devices() {
            return Err(LinkError::InvalidOperation(format!(
                "channel '{}' does not accept more than one device",
                self.name
            )));
        }

        membership.members.push(Member {
            device,
            identity,
            handler,
        });
        Ok(true)
    }

    /// Remove a member; `None` if it was not attached
    pub(crate) fn leave(&self, device: DeviceId) -> Option<Departure> {
        let mut membership = self.membership.lock();
        let index = membership.members.iter().position(|m| m.device == device)?;
        let member = membership.members.remove(index);

        let identity_shared = member.identity.is_some()
            && membership
                .members
                .iter()
                .any(|m| m.identity == member.identity);
        let remaining = membership.members.len();
        if remaining == 0 {
            membership.adapter = None;
            membership.protocol = None;
            membership.exclusive = false;
        }
        Some(Departure {
            remaining,
            identity_shared,
        })
    }

    fn handlers(&self) -> Vec<Arc<dyn ChannelHandler>> {
        self.membership
            .lock()
            .members
            .iter()
            .filter_map(|m| m.handler.upgrade())
            .collect()
    }

    async fn broadcast(&self, stage: Lifecycle) {
        for handler in self.handlers() {
            let flow = match stage {
                Lifecycle::Starting => handler.on_starting(self).await,
                Lifecycle::Started => handler.on_started(self).await,
                Lifecycle::Stopping => handler.on_stopping(self).await,
                Lifecycle::Stopped => handler.on_stopped(self).await,
            };
            if flow.is_handled() {
                break;
            }
        }
    }

    fn dispatch(&self, message: &InboundMessage) {
        for handler in self.handlers() {
            match handler.on_message(self, message) {
                Ok(EventFlow::Handled) => return,
                Ok(EventFlow::Continue) => {}
                Err(e) => {
                    warn!(channel = %self.name, error = %e, "Message handler failed");
                }
            }
        }
        debug!(
            channel = %self.name,
            sign = ?message.sign,
            identity = ?message.identity,
            "Inbound message not claimed by any device"
        );
    }

    /// Bring the transport up if it is not already
    pub async fn connect(&self) -> LinkResult<()> {
        let _gate = self.io_gate.lock().await;
        if self.is_online() {
            return Ok(());
        }

        self.state.send_replace(ChannelState::Connecting);
        let mut connecting = ConnectingGuard {
            state: &self.state,
            armed: true,
        };
        self.broadcast(Lifecycle::Starting).await;

        {
            let mut closed = self.closed.lock();
            if closed.is_cancelled() {
                *closed = CancellationToken::new();
            }
        }

        // Subscribe before connecting so no early frame is missed
        let events = self.transport.subscribe();
        self.transport.connect().await.map_err(|e| {
            warn!(channel = %self.name, error = %e, "Channel connect failed");
            LinkError::offline(format!("{}: {}", self.transport.describe(), e))
        })?;

        self.stop_pump();
        *self.pump.lock() = Some(self.spawn_pump(events));

        connecting.armed = false;
        self.state.send_replace(ChannelState::Online);
        info!(channel = %self.name, transport = %self.transport.describe(), "Channel online");
        self.broadcast(Lifecycle::Started).await;
        Ok(())
    }

    /// Write one framed message to the transport
    ///
    /// `identity` selects the peer on server-style channels.
    pub async fn send(&self, identity: Option<&str>, frame: &[u8]) -> LinkResult<()> {
        if !self.is_online() {
            return Err(LinkError::offline(format!(
                "channel '{}' is {}",
                self.name,
                self.state()
            )));
        }
        self.transport
            .send(identity, frame)
            .await
            .map_err(|e| LinkError::transport(e.to_string()))
    }

    /// Tear the channel down; idempotent
    pub async fn close(&self) {
        let _gate = self.io_gate.lock().await;
        self.teardown().await;
    }

    /// Cancel every waiter on every registry
    pub fn cancel_pending(&self, reason: CancelReason) -> usize {
        let mut cancelled = self.default_registry.cancel_all(reason);
        for entry in self.registries.iter() {
            cancelled += entry.value().cancel_all(reason);
        }
        cancelled
    }

    /// Drop one remote identity on a server-style channel
    ///
    /// Cancels that identity's waiters and closes only its sub-connection.
    pub async fn close_identity(&self, identity: &str) {
        if let Some((_, registry)) = self.registries.remove(identity) {
            registry.cancel_all(CancelReason::ChannelClosed);
        }
        self.endpoint_locks.remove(identity);
        if let Err(e) = self.transport.close_peer(identity).await {
            warn!(channel = %self.name, %identity, error = %e, "Failed to close peer");
        }
    }

    async fn teardown(&self) {
        let pump_running = self.pump.lock().is_some();
        if self.state() == ChannelState::Offline && !pump_running {
            return;
        }

        self.state.send_replace(ChannelState::Closing);
        self.broadcast(Lifecycle::Stopping).await;

        self.closed.lock().cancel();
        let cancelled = self.cancel_pending(CancelReason::ChannelClosed);
        self.stop_pump();
        if let Err(e) = self.transport.close().await {
            warn!(channel = %self.name, error = %e, "Transport close failed");
        }

        self.broadcast(Lifecycle::Stopped).await;
        self.state.send_replace(ChannelState::Offline);
        info!(channel = %self.name, cancelled, "Channel closed");
    }

    async fn close_after_failure(&self, reason: &str) {
        let _gate = self.io_gate.lock().await;
        if self.transport.is_connected() || self.state() != ChannelState::Online {
            return;
        }
        warn!(channel = %self.name, %reason, "Transport lost");
        self.teardown().await;
    }

    fn stop_pump(&self) {
        if let Some(handle) = self.pump.lock().take() {
            handle.abort();
        }
    }

    fn spawn_pump(&self, mut events: broadcast::Receiver<TransportEvent>) -> JoinHandle<()> {
        let channel = self.me.clone();
        tokio::spawn(async move {
            let mut buffers: HashMap<Option<String>, BytesMut> = HashMap::new();
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Receive path lagged, discarding partial frames");
                        buffers.clear();
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(channel) = channel.upgrade() else {
                    break;
                };

                match event {
                    TransportEvent::Received(frame) => channel.ingest(&mut buffers, frame),
                    TransportEvent::PeerConnected(identity) => {
                        debug!(channel = %channel.name, %identity, "Peer connected");
                    }
                    TransportEvent::PeerDisconnected(identity) => {
                        buffers.remove(&Some(identity.clone()));
                        let cancelled = channel
                            .registries
                            .get(&identity)
                            .map_or(0, |registry| {
                                registry.cancel_all(CancelReason::ChannelClosed)
                            });
                        info!(channel = %channel.name, %identity, cancelled, "Peer disconnected");
                    }
                    TransportEvent::Disconnected(reason) => {
                        // Teardown aborts this task, so it runs elsewhere
                        tokio::spawn(async move {
                            channel.close_after_failure(&reason).await;
                        });
                        break;
                    }
                }
            }
        })
    }

    fn ingest(&self, buffers: &mut HashMap<Option<String>, BytesMut>, frame: IncomingFrame) {
        let adapter = match self.adapter() {
            Ok(adapter) => adapter,
            Err(_) => {
                debug!(channel = %self.name, "No framing configured, dropping input");
                return;
            }
        };

        let buf = buffers.entry(frame.identity.clone()).or_default();
        buf.extend_from_slice(&frame.data);
        loop {
            match adapter.decode(buf) {
                Ok(Some(mut message)) => {
                    if message.identity.is_none() {
                        message.identity = frame.identity.clone();
                    }
                    self.dispatch(&message);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(
                        channel = %self.name,
                        identity = ?frame.identity,
                        error = %e,
                        "Discarding undecodable input"
                    );
                    buf.clear();
                    break;
                }
            }
        }
        // A datagram never continues in the next one
        if self.kind == TransportKind::Datagram {
            buf.clear();
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.stop_pump();
        self.closed.lock().cancel();
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .field("members", &self.member_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::{SignedFrameAdapter, SignedProtocol};
    use crate::transport::mock::MockTransport;
    use fieldlink_core::Sign;

    struct Recorder {
        seen: Mutex<Vec<InboundMessage>>,
        stages: Mutex<Vec<Lifecycle>>,
        claim: bool,
    }

    impl Recorder {
        fn new(claim: bool) -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                stages: Mutex::new(Vec::new()),
                claim,
            })
        }
    }

    #[async_trait::async_trait]
    impl ChannelHandler for Recorder {
        async fn on_started(&self, _channel: &Channel) -> EventFlow {
            self.stages.lock().push(Lifecycle::Started);
            EventFlow::Continue
        }

        async fn on_stopped(&self, _channel: &Channel) -> EventFlow {
            self.stages.lock().push(Lifecycle::Stopped);
            EventFlow::Continue
        }

        fn on_message(&self, _channel: &Channel, message: &InboundMessage) -> LinkResult<EventFlow> {
            self.seen.lock().push(message.clone());
            Ok(if self.claim {
                EventFlow::Handled
            } else {
                EventFlow::Continue
            })
        }
    }

    fn handler(recorder: &Arc<Recorder>) -> Weak<dyn ChannelHandler> {
        let weak: Weak<Recorder> = Arc::downgrade(recorder);
        weak
    }

    fn mock_channel() -> (Arc<MockTransport>, Arc<Channel>) {
        let mock = Arc::new(MockTransport::new(&Default::default()));
        let channel = Channel::new("test", mock.clone());
        (mock, channel)
    }

    #[test]
    fn test_first_member_configures_framing() {
        let (_, channel) = mock_channel();
        assert!(channel.adapter().is_err());

        let recorder = Recorder::new(false);
        let protocol = SignedProtocol::new("signed");
        assert!(channel
            .join(DeviceId::next(), None, &protocol, handler(&recorder))
            .unwrap());
        assert!(channel.adapter().is_ok());
        assert_eq!(channel.protocol_name().as_deref(), Some("signed"));
    }

    #[test]
    fn test_exclusive_protocol_refuses_company() {
        let (_, channel) = mock_channel();
        let recorder = Recorder::new(false);
        let shared = SignedProtocol::new("shared");
        let exclusive = SignedProtocol::new("solo").exclusive();

        channel
            .join(DeviceId::next(), None, &shared, handler(&recorder))
            .unwrap();
        let err = channel
            .join(DeviceId::next(), None, &exclusive, handler(&recorder))
            .unwrap_err();
        assert!(matches!(err, LinkError::InvalidOperation(_)));
        assert_eq!(channel.member_count(), 1);
    }

    #[test]
    fn test_leave_reports_shared_identity() {
        let (_, channel) = mock_channel();
        let recorder = Recorder::new(false);
        let protocol = SignedProtocol::default();
        let a = DeviceId::next();
        let b = DeviceId::next();
        let c = DeviceId::next();
        channel.join(a, Some("X".into()), &protocol, handler(&recorder)).unwrap();
        channel.join(b, Some("X".into()), &protocol, handler(&recorder)).unwrap();
        channel.join(c, Some("Y".into()), &protocol, handler(&recorder)).unwrap();

        let departure = channel.leave(a).unwrap();
        assert_eq!(departure.remaining, 2);
        assert!(departure.identity_shared);

        let departure = channel.leave(c).unwrap();
        assert_eq!(departure.remaining, 1);
        assert!(!departure.identity_shared);

        assert!(channel.leave(c).is_none());
        channel.leave(b).unwrap();
        assert!(channel.adapter().is_err());
    }

    #[tokio::test]
    async fn test_connect_and_close_cycle() {
        let (mock, channel) = mock_channel();
        let recorder = Recorder::new(false);
        channel
            .join(DeviceId::next(), None, &SignedProtocol::default(), handler(&recorder))
            .unwrap();

        let first_token = channel.closed_token();
        channel.connect().await.unwrap();
        channel.connect().await.unwrap();
        assert_eq!(mock.connect_attempts(), 1);
        assert_eq!(channel.state(), ChannelState::Online);

        channel.close().await;
        channel.close().await;
        assert_eq!(mock.close_calls(), 1);
        assert_eq!(channel.state(), ChannelState::Offline);
        assert!(first_token.is_cancelled());
        assert_eq!(
            *recorder.stages.lock(),
            vec![Lifecycle::Started, Lifecycle::Stopped]
        );

        channel.connect().await.unwrap();
        assert!(!channel.closed_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_failed_connect_returns_to_offline() {
        let (mock, channel) = mock_channel();
        mock.fail_next_connects(1);
        let err = channel.connect().await.unwrap_err();
        assert!(matches!(err, LinkError::ChannelOffline { sign: None, .. }));
        assert_eq!(channel.state(), ChannelState::Offline);
    }

    #[tokio::test]
    async fn test_first_claim_stops_delivery() {
        let (mock, channel) = mock_channel();
        let first = Recorder::new(true);
        let second = Recorder::new(true);
        let protocol = SignedProtocol::default();
        channel.join(DeviceId::next(), None, &protocol, handler(&first)).unwrap();
        channel.join(DeviceId::next(), None, &protocol, handler(&second)).unwrap();
        channel.connect().await.unwrap();

        mock.inject(None, SignedFrameAdapter::response(4, b"ok").unwrap());
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let seen = first.seen.lock().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].sign, Some(Sign(4)));
        assert!(second.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_garbage_does_not_poison_receive_path() {
        let (mock, channel) = mock_channel();
        let recorder = Recorder::new(true);
        channel
            .join(DeviceId::next(), None, &SignedProtocol::default(), handler(&recorder))
            .unwrap();
        channel.connect().await.unwrap();

        mock.inject(None, vec![0x00, 0x01, 0xF0, 0x00, 0x00]);
        mock.inject(None, SignedFrameAdapter::response(9, b"after").unwrap());
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let seen = recorder.seen.lock().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(&seen[0].payload[..], b"after");
    }

    #[tokio::test]
    async fn test_transport_loss_tears_down() {
        let (mock, channel) = mock_channel();
        let recorder = Recorder::new(false);
        channel
            .join(DeviceId::next(), None, &SignedProtocol::default(), handler(&recorder))
            .unwrap();
        channel.connect().await.unwrap();
        let closed = channel.closed_token();

        mock.fail("cable pulled");
        tokio::time::timeout(std::time::Duration::from_secs(1), closed.cancelled())
            .await
            .unwrap();
        let mut state = channel.watch_state();
        state
            .wait_for(|s| *s == ChannelState::Offline)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unknown_peer_disconnect_leaves_registries_alone() {
        let mock = Arc::new(MockTransport::with_kind(TransportKind::Server));
        let channel = Channel::new("dtu", mock.clone());
        let recorder = Recorder::new(false);
        channel
            .join(DeviceId::next(), Some("A".into()), &SignedProtocol::default(), handler(&recorder))
            .unwrap();
        channel.connect().await.unwrap();

        let registry = channel.registry(Some("A"));
        let mut waiter = registry.register().unwrap();

        mock.peer_disconnected("ghost");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!channel.registries.contains_key("ghost"));
        assert_eq!(channel.registries.len(), 1);
        assert!(waiter.try_take().is_none());

        mock.peer_disconnected("A");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(waiter.try_take().is_some());
        assert!(registry.is_empty());
        assert_eq!(channel.registries.len(), 1);
    }
}
