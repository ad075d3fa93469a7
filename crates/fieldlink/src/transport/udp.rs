//! UDP transport

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use fieldlink_core::TransportKind;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::{IncomingFrame, Transport, TransportError, TransportEvent};
use crate::config::UdpConfig;

const MAX_DATAGRAM: usize = 65_535;

/// Datagram socket bound locally and connected to one remote
pub struct UdpTransport {
    local: String,
    remote: String,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    connected: Arc<AtomicBool>,
    events: broadcast::Sender<TransportEvent>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl UdpTransport {
    pub fn new(config: &UdpConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            local: config.local.clone(),
            remote: config.remote.clone(),
            socket: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            events,
            reader: Mutex::new(None),
        }
    }

    /// Local address once bound
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket
            .lock()
            .as_ref()
            .and_then(|socket| socket.local_addr().ok())
    }

    fn stop_reader(&self) {
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Datagram
    }

    fn describe(&self) -> String {
        format!("udp://{}", self.remote)
    }

    async fn connect(&self) -> Result<(), TransportError> {
        self.stop_reader();

        let socket = UdpSocket::bind(&self.local)
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("bind {}: {}", self.local, e)))?;
        socket
            .connect(&self.remote)
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", self.remote, e)))?;
        let socket = Arc::new(socket);
        info!(local = ?socket.local_addr().ok(), remote = %self.remote, "UDP transport ready");

        let reader_socket = socket.clone();
        let events = self.events.clone();
        let connected = self.connected.clone();
        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                match reader_socket.recv(&mut buf).await {
                    Ok(n) => {
                        let frame = IncomingFrame::new(None, Bytes::copy_from_slice(&buf[..n]));
                        let _ = events.send(TransportEvent::Received(frame));
                    }
                    // ICMP port unreachable surfaces here; the socket stays usable
                    Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                        warn!(%e, "UDP peer unreachable");
                    }
                    Err(e) => {
                        warn!(%e, "UDP receive error");
                        connected.store(false, Ordering::SeqCst);
                        let _ = events.send(TransportEvent::Disconnected(e.to_string()));
                        break;
                    }
                }
            }
        });

        *self.socket.lock() = Some(socket);
        *self.reader.lock() = Some(handle);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        self.stop_reader();
        self.socket.lock().take();
        Ok(())
    }

    async fn send(&self, _identity: Option<&str>, frame: &[u8]) -> Result<(), TransportError> {
        let socket = self
            .socket
            .lock()
            .clone()
            .ok_or(TransportError::ConnectionClosed)?;
        socket
            .send(frame)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.stop_reader();
    }
}
