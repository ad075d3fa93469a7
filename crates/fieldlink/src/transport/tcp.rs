//! TCP client transport

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use fieldlink_core::TransportKind;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{IncomingFrame, Transport, TransportError, TransportEvent};
use crate::config::TcpConfig;

const READ_BUFFER_SIZE: usize = 4096;

/// Point-to-point TCP connection to one remote endpoint
pub struct TcpClientTransport {
    addr: String,
    connect_timeout: Duration,
    writer: Mutex<Option<OwnedWriteHalf>>,
    connected: Arc<AtomicBool>,
    events: broadcast::Sender<TransportEvent>,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl TcpClientTransport {
    pub fn new(config: &TcpConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            addr: format!("{}:{}", config.host, config.port),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            writer: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            events,
            reader: parking_lot::Mutex::new(None),
        }
    }

    fn stop_reader(&self) {
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
    }

    fn start_reader(&self, mut read_half: OwnedReadHalf) {
        let connected = self.connected.clone();
        let events = self.events.clone();
        let addr = self.addr.clone();

        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; READ_BUFFER_SIZE];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => {
                        info!(%addr, "TCP peer closed connection");
                        connected.store(false, Ordering::SeqCst);
                        let _ = events.send(TransportEvent::Disconnected("peer closed".into()));
                        break;
                    }
                    Ok(n) => {
                        let frame = IncomingFrame::new(None, Bytes::copy_from_slice(&buf[..n]));
                        let _ = events.send(TransportEvent::Received(frame));
                    }
                    Err(e) => {
                        warn!(%addr, %e, "TCP receive error");
                        connected.store(false, Ordering::SeqCst);
                        let _ = events.send(TransportEvent::Disconnected(e.to_string()));
                        break;
                    }
                }
            }
        });

        *self.reader.lock() = Some(handle);
    }
}

#[async_trait]
impl Transport for TcpClientTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }

    async fn connect(&self) -> Result<(), TransportError> {
        self.stop_reader();

        info!(addr = %self.addr, "Connecting TCP transport");
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| TransportError::Timeout("Connection timeout".into()))?
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        if let Err(e) = stream.set_nodelay(true) {
            debug!(%e, "Failed to set TCP_NODELAY");
        }

        let (read_half, write_half) = stream.into_split();
        *self.writer.lock().await = Some(write_half);
        self.connected.store(true, Ordering::SeqCst);
        self.start_reader(read_half);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        self.stop_reader();
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        Ok(())
    }

    async fn send(&self, _identity: Option<&str>, frame: &[u8]) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::ConnectionClosed)?;
        if let Err(e) = writer.write_all(frame).await {
            warn!(addr = %self.addr, %e, "TCP send error");
            guard.take();
            if self.connected.swap(false, Ordering::SeqCst) {
                let _ = self.events.send(TransportEvent::Disconnected(e.to_string()));
            }
            return Err(TransportError::SendFailed(e.to_string()));
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

impl Drop for TcpClientTransport {
    fn drop(&mut self) {
        self.stop_reader();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_send_failure_reports_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let transport = TcpClientTransport::new(&TcpConfig {
            host: "127.0.0.1".to_string(),
            port,
            connect_timeout_ms: 1000,
        });
        let mut events = transport.subscribe();

        transport.connect().await.unwrap();
        // Only the write path may notice the loss
        transport.stop_reader();
        tokio::task::yield_now().await;
        let (peer, _) = listener.accept().await.unwrap();
        drop(peer);

        let mut failed = false;
        for _ in 0..50 {
            if transport.send(None, b"ping").await.is_err() {
                failed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(failed);
        assert!(!transport.is_connected());
        assert!(matches!(events.try_recv(), Ok(TransportEvent::Disconnected(_))));
        assert!(matches!(
            transport.send(None, b"ping").await,
            Err(TransportError::ConnectionClosed)
        ));
    }
}
