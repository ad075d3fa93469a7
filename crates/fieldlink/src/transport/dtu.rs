//! DTU server transport
//!
//! Listens for DTU terminals dialling in over TCP. Each connection's first
//! frame is its registration packet carrying the DTU id; everything read
//! afterwards is tagged with that id so one channel can host many terminals.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use fieldlink_core::TransportKind;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{IncomingFrame, Transport, TransportError, TransportEvent};
use crate::config::DtuServerConfig;

const READ_BUFFER_SIZE: usize = 4096;

struct DtuSession {
    generation: u64,
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    cancel: CancellationToken,
}

/// Shared between the transport handle and its accept/reader tasks
struct DtuShared {
    sessions: DashMap<String, DtuSession>,
    events: broadcast::Sender<TransportEvent>,
    generation: AtomicU64,
    registration_timeout: Duration,
}

/// TCP listener hosting many identified DTU peers
pub struct DtuServerTransport {
    bind: String,
    shared: Arc<DtuShared>,
    listening: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl DtuServerTransport {
    pub fn new(config: &DtuServerConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            bind: config.bind.clone(),
            shared: Arc::new(DtuShared {
                sessions: DashMap::new(),
                events,
                generation: AtomicU64::new(0),
                registration_timeout: Duration::from_millis(config.registration_timeout_ms),
            }),
            listening: AtomicBool::new(false),
            local_addr: Mutex::new(None),
            acceptor: Mutex::new(None),
        }
    }

    /// Bound address once listening (useful with port 0)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Identities currently registered
    pub fn identities(&self) -> Vec<String> {
        self.shared
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    fn drop_all_sessions(&self) {
        let ids = self.identities();
        for id in ids {
            if let Some((_, session)) = self.shared.sessions.remove(&id) {
                session.cancel.cancel();
            }
        }
    }
}

impl DtuShared {
    async fn serve(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let (mut read_half, write_half) = stream.into_split();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        let registration =
            tokio::time::timeout(self.registration_timeout, read_half.read(&mut buf)).await;
        let id = match registration {
            Ok(Ok(n)) if n > 0 => String::from_utf8_lossy(&buf[..n]).trim().to_string(),
            Ok(Ok(_)) => return,
            Ok(Err(e)) => {
                debug!(%peer, %e, "DTU registration read failed");
                return;
            }
            Err(_) => {
                warn!(%peer, "DTU did not register in time");
                return;
            }
        };
        if id.is_empty() {
            warn!(%peer, "DTU sent empty registration packet");
            return;
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let session = DtuSession {
            generation,
            writer: Arc::new(tokio::sync::Mutex::new(write_half)),
            cancel: cancel.clone(),
        };
        if let Some(previous) = self.sessions.insert(id.clone(), session) {
            info!(%id, "DTU re-registered, replacing previous session");
            previous.cancel.cancel();
        }
        info!(%id, %peer, "DTU registered");
        let _ = self.events.send(TransportEvent::PeerConnected(id.clone()));

        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => break,
                read = read_half.read(&mut buf) => read,
            };
            match read {
                Ok(0) => break,
                Ok(n) => {
                    let frame =
                        IncomingFrame::new(Some(id.clone()), Bytes::copy_from_slice(&buf[..n]));
                    let _ = self.events.send(TransportEvent::Received(frame));
                }
                Err(e) => {
                    debug!(%id, %e, "DTU receive error");
                    break;
                }
            }
        }

        let removed = self
            .sessions
            .remove_if(&id, |_, session| session.generation == generation)
            .is_some();
        if removed {
            info!(%id, "DTU disconnected");
            let _ = self.events.send(TransportEvent::PeerDisconnected(id));
        }
    }
}

#[async_trait]
impl Transport for DtuServerTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Server
    }

    fn describe(&self) -> String {
        format!("dtu://{}", self.bind)
    }

    async fn connect(&self) -> Result<(), TransportError> {
        if self.listening.load(Ordering::SeqCst) {
            return Ok(());
        }

        let listener = TcpListener::bind(&self.bind)
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("bind {}: {}", self.bind, e)))?;
        let local = listener
            .local_addr()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        *self.local_addr.lock() = Some(local);
        info!(%local, "DTU server listening");

        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        tokio::spawn(shared.clone().serve(stream, peer));
                    }
                    Err(e) => {
                        warn!(%e, "DTU accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });

        *self.acceptor.lock() = Some(handle);
        self.listening.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.listening.store(false, Ordering::SeqCst);
        if let Some(handle) = self.acceptor.lock().take() {
            handle.abort();
        }
        self.drop_all_sessions();
        Ok(())
    }

    async fn close_peer(&self, identity: &str) -> Result<(), TransportError> {
        if let Some((_, session)) = self.shared.sessions.remove(identity) {
            session.cancel.cancel();
            let _ = session.writer.lock().await.shutdown().await;
            info!(%identity, "DTU session closed");
        }
        Ok(())
    }

    async fn send(&self, identity: Option<&str>, frame: &[u8]) -> Result<(), TransportError> {
        let identity = identity.ok_or_else(|| {
            TransportError::SendFailed("DTU server requires a target identity".into())
        })?;
        let writer = self
            .shared
            .sessions
            .get(identity)
            .map(|session| session.writer.clone())
            .ok_or_else(|| TransportError::UnknownPeer(identity.to_string()))?;

        let mut writer = writer.lock().await;
        writer
            .write_all(frame)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.events.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }
}

impl Drop for DtuServerTransport {
    fn drop(&mut self) {
        if let Some(handle) = self.acceptor.lock().take() {
            handle.abort();
        }
        self.drop_all_sessions();
    }
}
