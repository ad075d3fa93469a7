//! Logical protocol endpoint attached to a shared channel
//!
//! A [`Device`] connects its channel on demand, keeps at most one request in
//! flight per endpoint, and resolves every request exactly once: with the
//! matching response, a timeout, a caller cancellation, channel teardown, or
//! its own disposal.

mod options;
mod stats;

pub use options::DeviceOptions;
pub use stats::DeviceStats;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use fieldlink_core::{
    BigEndianConverter, Converted, DataType, InboundMessage, LinkError, LinkResult,
    OutboundMessage, Protocol, Sign, Value, ValueConverter,
};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument, Span};

use crate::channel::{Channel, ChannelHandler, ChannelState, EventFlow};
use crate::sync::{
    CancelReason, EndpointGuard, EndpointLock, Interrupted, TimeoutPool, WaitOutcome, WaitState,
    Waiter,
};

use stats::StatsCounters;

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique device handle used for channel membership
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(u64);

impl DeviceId {
    pub(crate) fn next() -> Self {
        DeviceId(NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev-{}", self.0)
    }
}

/// A logical endpoint on a [`Channel`]
pub struct Device {
    id: DeviceId,
    name: String,
    options: DeviceOptions,
    protocol: Arc<dyn Protocol>,
    converter: Arc<dyn ValueConverter>,
    channel: Mutex<Option<Arc<Channel>>>,
    span: RwLock<Span>,
    lock: EndpointLock,
    connect_lock: tokio::sync::Mutex<()>,
    timeouts: TimeoutPool,
    disposed: CancellationToken,
    disposing: AtomicBool,
    stats: StatsCounters,
}

impl Device {
    /// Device using the big-endian value converter
    pub fn new(
        name: impl Into<String>,
        protocol: Arc<dyn Protocol>,
        options: DeviceOptions,
    ) -> Arc<Self> {
        Self::with_converter(name, protocol, Arc::new(BigEndianConverter), options)
    }

    pub fn with_converter(
        name: impl Into<String>,
        protocol: Arc<dyn Protocol>,
        converter: Arc<dyn ValueConverter>,
        options: DeviceOptions,
    ) -> Arc<Self> {
        let timeouts = TimeoutPool::new(options.pool_capacity);
        Arc::new(Self {
            id: DeviceId::next(),
            name: name.into(),
            options,
            protocol,
            converter,
            channel: Mutex::new(None),
            span: RwLock::new(Span::none()),
            lock: EndpointLock::new(),
            connect_lock: tokio::sync::Mutex::new(()),
            timeouts,
            disposed: CancellationToken::new(),
            disposing: AtomicBool::new(false),
            stats: StatsCounters::default(),
        })
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &DeviceOptions {
        &self.options
    }

    pub fn identity(&self) -> Option<&str> {
        self.options.identity.as_deref()
    }

    pub fn protocol(&self) -> &Arc<dyn Protocol> {
        &self.protocol
    }

    /// Channel this device is attached to
    pub fn channel(&self) -> Option<Arc<Channel>> {
        self.channel.lock().clone()
    }

    /// State of the attached channel (`Offline` when detached)
    pub fn state(&self) -> ChannelState {
        self.channel()
            .map(|channel| channel.state())
            .unwrap_or(ChannelState::Offline)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposing.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> DeviceStats {
        self.stats.snapshot()
    }

    /// Timeout controllers created so far by this device's pool
    pub fn timeouts_allocated(&self) -> usize {
        self.timeouts.allocated()
    }

    fn span(&self) -> Span {
        self.span.read().clone()
    }

    /// Attach to `channel`, optionally logging under the given span
    ///
    /// Attaching to the same channel again is a no-op. A device belongs to
    /// one channel for its lifetime.
    pub fn attach(self: &Arc<Self>, channel: &Arc<Channel>, span: Option<Span>) -> LinkResult<()> {
        if self.is_disposed() {
            return Err(LinkError::Disposed);
        }

        let mut current = self.channel.lock();
        if let Some(existing) = current.as_ref() {
            if Arc::ptr_eq(existing, channel) {
                return Ok(());
            }
            return Err(LinkError::InvalidOperation(format!(
                "device '{}' is already attached to channel '{}'",
                self.name,
                existing.name()
            )));
        }

        if channel.kind().is_multi_identity() && self.identity().is_none() {
            return Err(LinkError::InvalidOperation(format!(
                "device '{}' needs an identity to join server channel '{}'",
                self.name,
                channel.name()
            )));
        }

        let weak: Weak<Device> = Arc::downgrade(self);
        let handler: Weak<dyn ChannelHandler> = weak;
        channel.join(
            self.id,
            self.options.identity.clone(),
            self.protocol.as_ref(),
            handler,
        )?;
        *current = Some(channel.clone());
        drop(current);

        let span = span.unwrap_or_else(|| {
            info_span!("device", name = %self.name, channel = %channel.name())
        });
        *self.span.write() = span;
        self.span().in_scope(|| {
            debug!(
                id = %self.id,
                protocol = self.protocol.name(),
                identity = ?self.identity(),
                "Device attached"
            );
        });
        Ok(())
    }

    fn attached(&self) -> LinkResult<Arc<Channel>> {
        if self.is_disposed() {
            return Err(LinkError::Disposed);
        }
        self.channel().ok_or_else(|| {
            LinkError::InvalidOperation(format!("device '{}' is not attached", self.name))
        })
    }

    /// Connect the channel, bounded by the connect timeout
    pub async fn connect(&self, cancel: &CancellationToken) -> LinkResult<()> {
        let channel = self.attached()?;
        self.connect_channel(&channel, cancel)
            .instrument(self.span())
            .await
    }

    async fn connect_channel(&self, channel: &Channel, cancel: &CancellationToken) -> LinkResult<()> {
        if channel.is_online() {
            return Ok(());
        }

        let _connecting = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LinkError::Cancelled { sign: None }),
            _ = self.disposed.cancelled() => return Err(LinkError::Disposed),
            guard = self.connect_lock.lock() => guard,
        };
        // Another caller may have finished connecting while we waited
        if channel.is_online() {
            return Ok(());
        }

        let mut timer = self.timeouts.borrow();
        timer.set(self.options.connect_timeout);
        match timer
            .run(channel.connect(), [Some(cancel), Some(&self.disposed), None])
            .await
        {
            Ok(result) => result,
            Err(Interrupted::Timer) => {
                warn!(channel = %channel.name(), "Connect timed out");
                Err(LinkError::ConnectTimeout {
                    timeout: self.options.connect_timeout,
                    sign: None,
                })
            }
            Err(Interrupted::Link(0)) => Err(LinkError::Cancelled { sign: None }),
            Err(_) => Err(LinkError::Disposed),
        }
    }

    async fn ensure_online(&self, channel: &Channel, cancel: &CancellationToken) -> LinkResult<()> {
        if channel.is_online() {
            return Ok(());
        }
        if !self.options.auto_connect {
            return Err(LinkError::offline(format!(
                "channel '{}' is {} and auto-connect is disabled",
                channel.name(),
                channel.state()
            )));
        }
        self.connect_channel(channel, cancel).await
    }

    fn endpoint_lock(&self, channel: &Channel) -> EndpointLock {
        channel
            .endpoint_lock(self.identity())
            .unwrap_or_else(|| self.lock.clone())
    }

    async fn acquire(&self, lock: &EndpointLock, cancel: &CancellationToken) -> LinkResult<EndpointGuard> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LinkError::Cancelled { sign: None }),
            _ = self.disposed.cancelled() => Err(LinkError::Disposed),
            guard = lock.acquire() => Ok(guard),
        }
    }

    async fn pace(&self) {
        if !self.options.send_delay.is_zero() {
            tokio::time::sleep(self.options.send_delay).await;
        }
    }

    /// Send without waiting for a response
    pub async fn send(&self, message: &OutboundMessage, cancel: &CancellationToken) -> LinkResult<()> {
        let result = self.send_inner(message, cancel).instrument(self.span()).await;
        self.stats.record(&result);
        if let Err(e) = &result {
            debug!(parent: &self.span(), error = %e, "Send failed");
        }
        result
    }

    async fn send_inner(&self, message: &OutboundMessage, cancel: &CancellationToken) -> LinkResult<()> {
        let channel = self.attached()?;
        let lock = self.endpoint_lock(&channel);
        let _guard = self.acquire(&lock, cancel).await?;
        self.ensure_online(&channel, cancel).await?;
        self.pace().await;

        let sign = channel.registry(self.identity()).allocate_sign();
        let frame = channel
            .adapter()?
            .encode(message, sign)
            .map_err(|e| e.with_sign(sign))?;
        channel
            .send(self.identity(), &frame)
            .await
            .map_err(|e| e.with_sign(sign))
    }

    /// Send a request and wait for its matching response
    pub async fn send_then_return(
        &self,
        message: &OutboundMessage,
        cancel: &CancellationToken,
    ) -> LinkResult<InboundMessage> {
        let result = self.request(message, cancel).instrument(self.span()).await;
        self.stats.record(&result);
        if let Err(e) = &result {
            debug!(parent: &self.span(), error = %e, "Request failed");
        }
        result
    }

    async fn request(
        &self,
        message: &OutboundMessage,
        cancel: &CancellationToken,
    ) -> LinkResult<InboundMessage> {
        let channel = self.attached()?;
        let mut waiter = channel.registry(self.identity()).register()?;
        let sign = waiter.sign();
        self.exchange(&channel, &mut waiter, message, cancel)
            .await
            .map_err(|e| e.with_sign(sign))
    }

    async fn exchange(
        &self,
        channel: &Channel,
        waiter: &mut Waiter,
        message: &OutboundMessage,
        cancel: &CancellationToken,
    ) -> LinkResult<InboundMessage> {
        let sign = waiter.sign();
        let lock = self.endpoint_lock(channel);
        let _guard = self.acquire(&lock, cancel).await?;
        // Teardown may have settled the waiter while it was queued
        if let Some(outcome) = waiter.try_take() {
            return Self::settled(outcome, sign);
        }
        self.ensure_online(channel, cancel).await?;
        self.pace().await;
        if let Some(outcome) = waiter.try_take() {
            return Self::settled(outcome, sign);
        }

        let frame = channel.adapter()?.encode(message, sign)?;
        let closed = channel.closed_token();
        channel.send(self.identity(), &frame).await?;

        // A reply may land while the frame is still being written
        if let Some(outcome) = waiter.try_take() {
            return Self::settled(outcome, sign);
        }

        let mut timer = self.timeouts.borrow();
        timer.set(self.options.request_timeout);
        let waited = timer
            .run(
                waiter.wait(),
                [Some(cancel), Some(&closed), Some(&self.disposed)],
            )
            .await;
        let outcome = match waited {
            Ok(outcome) => outcome,
            Err(interrupted) => {
                let state = if timer.timed_out() {
                    WaitState::TimedOut
                } else {
                    match interrupted {
                        Interrupted::Link(0) => WaitState::Cancelled,
                        Interrupted::Link(1) => WaitState::Closed,
                        _ => WaitState::Disposed,
                    }
                };
                match waiter.expire(state).await {
                    // The response beat the interruption
                    Some(outcome) => outcome,
                    None => return Err(self.interrupted(state, sign)),
                }
            }
        };
        Self::settled(outcome, sign)
    }

    fn settled(outcome: WaitOutcome, sign: Sign) -> LinkResult<InboundMessage> {
        match outcome {
            WaitOutcome::Response(response) => match response.error {
                Some(error) => Err(LinkError::Protocol(format!("{} (sign: {})", error, sign))),
                None => Ok(response),
            },
            WaitOutcome::Cancelled(CancelReason::ChannelClosed) => {
                Err(LinkError::ChannelClosed { sign: Some(sign) })
            }
            WaitOutcome::Cancelled(CancelReason::Disposed) => Err(LinkError::Disposed),
        }
    }

    fn interrupted(&self, state: WaitState, sign: Sign) -> LinkError {
        match state {
            WaitState::TimedOut => LinkError::RequestTimeout {
                sign,
                timeout: self.options.request_timeout,
            },
            WaitState::Cancelled => LinkError::Cancelled { sign: Some(sign) },
            WaitState::Closed => LinkError::ChannelClosed { sign: Some(sign) },
            _ => LinkError::Disposed,
        }
    }

    /// Decode a value out of response bytes with this device's converter
    pub fn decode_value(
        &self,
        raw: &[u8],
        address: &str,
        data_type: DataType,
        array_len: usize,
        previous: Option<&Value>,
    ) -> LinkResult<Converted> {
        self.converter
            .convert(raw, address, data_type, array_len, previous)
    }

    /// Detach from the channel and release resources; idempotent
    ///
    /// The last device to leave closes the channel. On server-style channels
    /// a departing device closes only its own identity's connection, unless
    /// another member still uses that identity.
    pub async fn dispose(&self) {
        if self.disposing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.disposed.cancel();

        let channel = self.channel.lock().take();
        if let Some(channel) = channel {
            if let Some(plan) = self.detach(&channel) {
                plan.run(&channel).instrument(self.span()).await;
            }
        }
        self.release();
    }

    /// Synchronous dispose
    ///
    /// Channel I/O that detaching requires is spawned on the current tokio
    /// runtime; without one the transport is left for the channel's own drop.
    pub fn dispose_sync(&self) {
        if self.disposing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.disposed.cancel();

        let channel = self.channel.lock().take();
        if let Some(channel) = channel {
            if let Some(plan) = self.detach(&channel) {
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        let span = self.span();
                        handle.spawn(async move { plan.run(&channel).await }.instrument(span));
                    }
                    Err(_) => {
                        warn!(device = %self.name, "No runtime to close channel from dispose");
                    }
                }
            }
        }
        self.release();
    }

    /// Leave the membership and work out what must be closed
    fn detach(&self, channel: &Channel) -> Option<Detach> {
        let departure = channel.leave(self.id)?;
        debug!(
            parent: &self.span(),
            remaining = departure.remaining,
            "Device detached"
        );

        if departure.remaining == 0 {
            let cancelled = channel.cancel_pending(CancelReason::Disposed);
            if cancelled > 0 {
                debug!(parent: &self.span(), cancelled, "Cancelled pending requests");
            }
            return Some(Detach::CloseChannel);
        }

        match self.identity() {
            Some(identity) if channel.kind().is_multi_identity() && !departure.identity_shared => {
                Some(Detach::CloseIdentity(identity.to_string()))
            }
            _ => None,
        }
    }

    fn release(&self) {
        self.timeouts.close();
        *self.span.write() = Span::none();
    }
}

enum Detach {
    CloseChannel,
    CloseIdentity(String),
}

impl Detach {
    async fn run(self, channel: &Channel) {
        match self {
            Detach::CloseChannel => channel.close().await,
            Detach::CloseIdentity(identity) => channel.close_identity(&identity).await,
        }
    }
}

#[async_trait]
impl ChannelHandler for Device {
    async fn on_started(&self, channel: &Channel) -> EventFlow {
        debug!(parent: &self.span(), channel = %channel.name(), "Channel started");
        EventFlow::Continue
    }

    async fn on_stopped(&self, channel: &Channel) -> EventFlow {
        debug!(parent: &self.span(), channel = %channel.name(), "Channel stopped");
        EventFlow::Continue
    }

    fn on_message(&self, channel: &Channel, message: &InboundMessage) -> LinkResult<EventFlow> {
        if channel.kind().is_multi_identity() && message.identity.as_deref() != self.identity() {
            return Ok(EventFlow::Continue);
        }
        let Some(sign) = message.sign else {
            return Ok(EventFlow::Continue);
        };

        if channel.registry(self.identity()).complete(sign, message) {
            Ok(EventFlow::Handled)
        } else {
            Ok(EventFlow::Continue)
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.dispose_sync();
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("identity", &self.options.identity)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::SignedProtocol;
    use crate::transport::mock::MockTransport;
    use fieldlink_core::TransportKind;

    fn device(name: &str) -> Arc<Device> {
        Device::new(name, Arc::new(SignedProtocol::default()), DeviceOptions::default())
    }

    #[tokio::test]
    async fn test_attach_same_channel_is_noop() {
        let channel = Channel::new("c", Arc::new(MockTransport::new(&Default::default())));
        let dev = device("a");
        dev.attach(&channel, None).unwrap();
        dev.attach(&channel, None).unwrap();
        assert_eq!(channel.member_count(), 1);
    }

    #[tokio::test]
    async fn test_attach_second_channel_fails() {
        let first = Channel::new("one", Arc::new(MockTransport::new(&Default::default())));
        let second = Channel::new("two", Arc::new(MockTransport::new(&Default::default())));
        let dev = device("a");
        dev.attach(&first, None).unwrap();
        let err = dev.attach(&second, None).unwrap_err();
        assert!(matches!(err, LinkError::InvalidOperation(_)));
        assert_eq!(second.member_count(), 0);
    }

    #[tokio::test]
    async fn test_server_channel_requires_identity() {
        let channel = Channel::new(
            "dtu",
            Arc::new(MockTransport::with_kind(TransportKind::Server)),
        );
        let err = device("anon").attach(&channel, None).unwrap_err();
        assert!(matches!(err, LinkError::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn test_unattached_request_fails() {
        let dev = device("loose");
        let err = dev
            .send_then_return(&OutboundMessage::new(vec![1]), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent_and_blocks_reattach() {
        let channel = Channel::new("c", Arc::new(MockTransport::new(&Default::default())));
        let dev = device("a");
        dev.attach(&channel, None).unwrap();
        dev.dispose().await;
        dev.dispose().await;
        dev.dispose_sync();

        assert!(dev.is_disposed());
        assert!(dev.channel().is_none());
        assert_eq!(channel.member_count(), 0);
        assert!(matches!(dev.attach(&channel, None), Err(LinkError::Disposed)));
    }

    #[tokio::test]
    async fn test_dropping_last_device_closes_channel() {
        let mock = Arc::new(MockTransport::new(&Default::default()));
        let channel = Channel::new("c", mock.clone());
        let dev = device("a");
        dev.attach(&channel, None).unwrap();
        dev.connect(&CancellationToken::new()).await.unwrap();
        assert!(channel.is_online());

        drop(dev);
        let mut state = channel.watch_state();
        tokio::time::timeout(
            std::time::Duration::from_secs(1),
            state.wait_for(|s| *s == ChannelState::Offline),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(mock.close_calls(), 1);
    }

    #[test]
    fn test_decode_value_uses_converter() {
        let dev = device("a");
        let converted = dev
            .decode_value(&[0x01, 0x02], "0", DataType::UInt16, 1, None)
            .unwrap();
        assert_eq!(converted.value, Value::UInt(0x0102));
        assert!(converted.changed);

        let again = dev
            .decode_value(&[0x01, 0x02], "0", DataType::UInt16, 1, Some(&converted.value))
            .unwrap();
        assert!(!again.changed);
    }
}
