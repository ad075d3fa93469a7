//! Serial line transport (requires the `serial` feature)

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use fieldlink_core::TransportKind;
use tokio::io::{AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{info, warn};

use super::{IncomingFrame, Transport, TransportError, TransportEvent};
use crate::config::SerialConfig;

/// RS-232/RS-485 line shared by the devices on one bus
pub struct SerialTransport {
    path: String,
    baud_rate: u32,
    writer: Mutex<Option<WriteHalf<SerialStream>>>,
    connected: Arc<AtomicBool>,
    events: broadcast::Sender<TransportEvent>,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl SerialTransport {
    pub fn new(config: &SerialConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            path: config.path.clone(),
            baud_rate: config.baud_rate,
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
}

#[async_trait]
impl Transport for SerialTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn describe(&self) -> String {
        format!("serial://{}@{}", self.path, self.baud_rate)
    }

    async fn connect(&self) -> Result<(), TransportError> {
        self.stop_reader();

        let port = tokio_serial::new(&self.path, self.baud_rate)
            .open_native_async()
            .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", self.path, e)))?;
        info!(path = %self.path, baud = self.baud_rate, "Serial port opened");

        let (mut read_half, write_half) = tokio::io::split(port);
        *self.writer.lock().await = Some(write_half);

        let events = self.events.clone();
        let connected = self.connected.clone();
        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => {
                        connected.store(false, Ordering::SeqCst);
                        let _ = events.send(TransportEvent::Disconnected("port closed".into()));
                        break;
                    }
                    Ok(n) => {
                        let frame = IncomingFrame::new(None, Bytes::copy_from_slice(&buf[..n]));
                        let _ = events.send(TransportEvent::Received(frame));
                    }
                    Err(e) => {
                        warn!(%e, "Serial receive error");
                        connected.store(false, Ordering::SeqCst);
                        let _ = events.send(TransportEvent::Disconnected(e.to_string()));
                        break;
                    }
                }
            }
        });
        *self.reader.lock() = Some(handle);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        self.stop_reader();
        self.writer.lock().await.take();
        Ok(())
    }

    async fn send(&self, _identity: Option<&str>, frame: &[u8]) -> Result<(), TransportError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::ConnectionClosed)?;
        writer
            .write_all(frame)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.stop_reader();
    }
}
