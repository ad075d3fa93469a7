//! Request/response correlation over a mock transport
//!
//! Run with: cargo test -p fieldlink --test request_response

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use fieldlink::transport::mock::{MockReply, MockTransport};
use fieldlink::{
    Channel, Device, DeviceOptions, InboundMessage, LinkError, OutboundMessage, Sign,
    SignedFrameAdapter, SignedProtocol, Transport, TransportError, TransportEvent, TransportKind,
};
use pretty_assertions::assert_eq;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

fn setup(options: DeviceOptions) -> (Arc<MockTransport>, Arc<Channel>, Arc<Device>) {
    let mock = Arc::new(MockTransport::new(&Default::default()));
    let channel = Channel::new("line", mock.clone());
    let device = Device::new("meter", Arc::new(SignedProtocol::default()), options);
    device.attach(&channel, None).unwrap();
    (mock, channel, device)
}

fn request(payload: &[u8]) -> OutboundMessage {
    OutboundMessage::new(payload.to_vec())
}

/// Reply to every frame with `payload` under the same sign, after `delay`
fn answer_with(mock: &MockTransport, payload: &'static [u8], delay: Duration) {
    mock.set_responder(move |identity, frame| {
        let Some(sign) = SignedFrameAdapter::peek_sign(frame) else {
            return Vec::new();
        };
        let mut reply =
            MockReply::new(SignedFrameAdapter::response(sign, payload).unwrap()).after(delay);
        reply.identity = identity.map(str::to_string);
        vec![reply]
    });
}

// =============================================================================
// Basic exchanges
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_response_resolves_request() {
    let (mock, _channel, device) = setup(DeviceOptions::default());
    answer_with(&mock, b"read A", Duration::from_millis(50));

    let reply = device
        .send_then_return(&request(b"read A"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(reply.sign, Some(Sign(1)));
    assert_eq!(&reply.payload[..], b"read A");
    assert_eq!(device.stats().successes, 1);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_names_sign() {
    let (mock, _channel, device) =
        setup(DeviceOptions::default().with_request_timeout(Duration::from_millis(200)));
    let mute = Arc::new(AtomicBool::new(false));
    let muted = mute.clone();
    mock.set_responder(move |_, frame| {
        if muted.load(Ordering::SeqCst) {
            return Vec::new();
        }
        let sign = SignedFrameAdapter::peek_sign(frame).unwrap_or(0);
        vec![MockReply::new(SignedFrameAdapter::response(sign, b"ok").unwrap())
            .after(Duration::from_millis(50))]
    });
    let cancel = CancellationToken::new();

    for expected in 1..=7u32 {
        let reply = device.send_then_return(&request(b"read"), &cancel).await.unwrap();
        assert_eq!(reply.sign, Some(Sign(expected)));
    }

    mute.store(true, Ordering::SeqCst);
    let err = device
        .send_then_return(&request(b"read B"), &cancel)
        .await
        .unwrap_err();

    assert_eq!(
        err,
        LinkError::RequestTimeout {
            sign: Sign(8),
            timeout: Duration::from_millis(200),
        }
    );
    let msg = err.to_string();
    assert!(msg.contains("Timeout"), "{}", msg);
    assert!(msg.contains("sign: 8"), "{}", msg);
    assert_eq!(device.stats().timeouts, 1);
}

#[tokio::test(start_paused = true)]
async fn test_caller_cancellation_is_not_a_timeout() {
    let (mock, _channel, device) = setup(DeviceOptions::default());
    mock.silence();
    let cancel = CancellationToken::new();

    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        canceller.cancel();
    });

    let started = tokio::time::Instant::now();
    let err = device
        .send_then_return(&request(b"slow"), &cancel)
        .await
        .unwrap_err();

    assert_eq!(err, LinkError::Cancelled { sign: Some(Sign(1)) });
    assert!(!err.is_timeout());
    assert!(started.elapsed() < Duration::from_millis(3000));
    assert_eq!(device.stats().cancellations, 1);
}

#[tokio::test(start_paused = true)]
async fn test_precancelled_token_fails_fast() {
    let (mock, _channel, device) = setup(DeviceOptions::default());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = device
        .send_then_return(&request(b"x"), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::Cancelled { sign: Some(_) }));
    assert!(mock.sent_frames().is_empty());
}

#[tokio::test]
async fn test_transport_failure_closes_all_waiters() {
    let mock = Arc::new(MockTransport::new(&Default::default()));
    mock.silence();
    let channel = Channel::new("line", mock.clone());
    let protocol = Arc::new(SignedProtocol::default());
    let a = Device::new("a", protocol.clone(), DeviceOptions::default());
    let b = Device::new("b", protocol, DeviceOptions::default());
    a.attach(&channel, None).unwrap();
    b.attach(&channel, None).unwrap();

    let cancel = CancellationToken::new();
    let pending_a = {
        let (a, cancel) = (a.clone(), cancel.clone());
        tokio::spawn(async move { a.send_then_return(&request(b"a"), &cancel).await })
    };
    let pending_b = {
        let (b, cancel) = (b.clone(), cancel.clone());
        tokio::spawn(async move { b.send_then_return(&request(b"b"), &cancel).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(mock.sent_frames().len(), 2);
    mock.fail("link down");

    let err_a = pending_a.await.unwrap().unwrap_err();
    let err_b = pending_b.await.unwrap().unwrap_err();
    assert!(matches!(err_a, LinkError::ChannelClosed { sign: Some(_) }), "{:?}", err_a);
    assert!(matches!(err_b, LinkError::ChannelClosed { sign: Some(_) }), "{:?}", err_b);
    assert!(err_a.to_string().contains("sign: "));
}

#[tokio::test(start_paused = true)]
async fn test_error_response_surfaces_as_protocol_error() {
    let (mock, _channel, device) = setup(DeviceOptions::default());
    mock.set_responder(|_, frame| {
        let sign = SignedFrameAdapter::peek_sign(frame).unwrap_or(0);
        vec![MockReply::new(SignedFrameAdapter::error_response(sign, "busy").unwrap())]
    });

    let err = device
        .send_then_return(&request(b"x"), &CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        LinkError::Protocol(msg) => {
            assert!(msg.contains("busy"));
            assert!(msg.contains("sign: 1"));
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_stale_response_is_ignored() {
    let (mock, _channel, device) =
        setup(DeviceOptions::default().with_request_timeout(Duration::from_millis(100)));
    // Late reply for the first request, then the second arrives on time
    mock.set_responder(|_, frame| {
        let sign = SignedFrameAdapter::peek_sign(frame).unwrap_or(0);
        let delay = if sign == 1 { 150 } else { 10 };
        vec![MockReply::new(SignedFrameAdapter::response(sign, b"late?").unwrap())
            .after(Duration::from_millis(delay))]
    });
    let cancel = CancellationToken::new();

    let first = device.send_then_return(&request(b"1"), &cancel).await;
    assert!(matches!(first, Err(LinkError::RequestTimeout { .. })));

    let second = device.send_then_return(&request(b"2"), &cancel).await.unwrap();
    assert_eq!(second.sign, Some(Sign(2)));

    tokio::time::sleep(Duration::from_millis(100)).await;
    let stats = device.stats();
    assert_eq!(stats.requests, 2);
    assert_eq!(stats.timeouts, 1);
    assert_eq!(stats.successes, 1);
}

#[tokio::test(start_paused = true)]
async fn test_fire_and_forget_send() {
    let (mock, _channel, device) = setup(DeviceOptions::default());
    mock.silence();

    device
        .send(&request(b"set"), &CancellationToken::new())
        .await
        .unwrap();

    let sent = mock.sent_frames();
    assert_eq!(sent.len(), 1);
    assert_eq!(&sent[0].1[fieldlink::framing::HEADER_LEN..], b"set");
}

#[tokio::test(start_paused = true)]
async fn test_send_failure_names_sign() {
    let (mock, channel, device) = setup(DeviceOptions::default());
    mock.fail_next_sends(1);
    let cancel = CancellationToken::new();

    let err = device.send_then_return(&request(b"x"), &cancel).await.unwrap_err();
    assert!(matches!(err, LinkError::Transport { .. }), "{:?}", err);
    assert_eq!(err.sign(), Some(Sign(1)));
    assert!(err.to_string().contains("sign: 1"), "{}", err);
    assert!(channel.is_online());

    let reply = device.send_then_return(&request(b"y"), &cancel).await.unwrap();
    assert_eq!(reply.sign, Some(Sign(2)));
    assert_eq!(channel.registry(None).len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_encode_failure_names_sign() {
    let (mock, _channel, device) = setup(DeviceOptions::default());

    let oversized = OutboundMessage::new(vec![0u8; 70_000]);
    let err = device
        .send_then_return(&oversized, &CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        LinkError::Protocol(msg) => assert!(msg.contains("sign: 1"), "{}", msg),
        other => panic!("unexpected error {:?}", other),
    }
    assert!(mock.sent_frames().is_empty());
}

/// Completes the matching waiter from inside `send`
struct InlineAnswer {
    channel: OnceLock<Weak<Channel>>,
    events: broadcast::Sender<TransportEvent>,
    connected: AtomicBool,
}

impl InlineAnswer {
    fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            channel: OnceLock::new(),
            events,
            connected: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Transport for InlineAnswer {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    fn describe(&self) -> String {
        "inline://".to_string()
    }

    async fn connect(&self) -> Result<(), TransportError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, _identity: Option<&str>, frame: &[u8]) -> Result<(), TransportError> {
        let channel = self
            .channel
            .get()
            .and_then(Weak::upgrade)
            .ok_or(TransportError::ConnectionClosed)?;
        let sign = SignedFrameAdapter::peek_sign(frame)
            .map(|sign| Sign(u32::from(sign)))
            .ok_or_else(|| TransportError::SendFailed("unframed".to_string()))?;
        let reply = InboundMessage {
            sign: Some(sign),
            identity: None,
            payload: Bytes::from_static(b"inline"),
            error: None,
        };
        channel.registry(None).complete(sign, &reply);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[tokio::test]
async fn test_reply_during_send_skips_the_wait() {
    let transport = Arc::new(InlineAnswer::new());
    let channel = Channel::new("inline", transport.clone());
    let _ = transport.channel.set(Arc::downgrade(&channel));
    let device = Device::new("meter", Arc::new(SignedProtocol::default()), DeviceOptions::default());
    device.attach(&channel, None).unwrap();
    channel.connect().await.unwrap();

    let reply = device
        .send_then_return(&request(b"x"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(reply.sign, Some(Sign(1)));
    assert_eq!(&reply.payload[..], b"inline");
    assert_eq!(device.timeouts_allocated(), 0);
}

// =============================================================================
// Timeout pool
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_timeout_controller_is_reused() {
    let (mock, _channel, device) =
        setup(DeviceOptions::default().with_request_timeout(Duration::from_millis(100)));
    mock.silence();
    let cancel = CancellationToken::new();

    let err = device.send_then_return(&request(b"a"), &cancel).await.unwrap_err();
    assert!(err.is_timeout());

    answer_with(&mock, b"ok", Duration::from_millis(20));
    for _ in 0..10 {
        device.send_then_return(&request(b"b"), &cancel).await.unwrap();
    }

    assert_eq!(device.timeouts_allocated(), 1);
    assert_eq!(device.stats().successes, 10);
}

// =============================================================================
// Multi-identity channels
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_identity_scoped_completion() {
    let mock = Arc::new(MockTransport::with_kind(TransportKind::Server));
    let channel = Channel::new("dtu", mock.clone());
    let protocol = Arc::new(SignedProtocol::default());
    let a = Device::new("a", protocol.clone(), DeviceOptions::default().with_identity("ID=A"));
    let b = Device::new("b", protocol, DeviceOptions::default().with_identity("ID=B"));
    a.attach(&channel, None).unwrap();
    b.attach(&channel, None).unwrap();

    // Only ID=A answers
    mock.set_responder(|identity, frame| {
        if identity != Some("ID=A") {
            return Vec::new();
        }
        let sign = SignedFrameAdapter::peek_sign(frame).unwrap_or(0);
        vec![MockReply::new(SignedFrameAdapter::response(sign, b"A").unwrap())
            .after(Duration::from_millis(30))
            .from_identity("ID=A")]
    });

    let cancel = CancellationToken::new();
    let pending_b = {
        let (b, cancel) = (b.clone(), cancel.clone());
        tokio::spawn(async move { b.send_then_return(&request(b"b"), &cancel).await })
    };
    tokio::task::yield_now().await;

    let reply = a.send_then_return(&request(b"a"), &cancel).await.unwrap();
    assert_eq!(reply.identity.as_deref(), Some("ID=A"));
    assert_eq!(&reply.payload[..], b"A");

    let registry_b = channel.registry(Some("ID=B"));
    assert_eq!(registry_b.len(), 1);
    assert!(!pending_b.is_finished());

    let err = pending_b.await.unwrap().unwrap_err();
    assert!(err.is_timeout());
}

#[tokio::test(start_paused = true)]
async fn test_peer_disconnect_closes_its_waiters() {
    let mock = Arc::new(MockTransport::with_kind(TransportKind::Server));
    mock.silence();
    let channel = Channel::new("dtu", mock.clone());
    let device = Device::new(
        "a",
        Arc::new(SignedProtocol::default()),
        DeviceOptions::default().with_identity("DTU1"),
    );
    device.attach(&channel, None).unwrap();

    let pending = {
        let device = device.clone();
        tokio::spawn(async move {
            device
                .send_then_return(&request(b"x"), &CancellationToken::new())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    mock.peer_disconnected("DTU1");

    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err, LinkError::ChannelClosed { sign: Some(Sign(1)) });
    assert!(channel.is_online());
}
