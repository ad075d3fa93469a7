//! End-to-end tests for fieldlink
//!
//! This crate exercises the coordination layer over real loopback sockets:
//! - TCP client channels against a local echo peer
//! - UDP channels against a local datagram peer
//! - DTU server channels with emulated dial-in terminals
//! - Configuration files loaded from disk
//!
//! # Running Tests
//!
//! ```bash
//! cargo test -p fieldlink-tests
//! ```
//!
//! The helpers below play the remote side of each link and speak the
//! sign-tagged framing from `fieldlink::framing`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use fieldlink::framing::SignedFrameAdapter;
use fieldlink::transport::dtu::DtuServerTransport;
use fieldlink_core::FrameAdapter;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;

/// Decides the reply payload for a request payload; `None` hangs up
pub type Responder = Arc<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;

fn echo() -> Responder {
    Arc::new(|payload: &[u8]| Some(payload.to_vec()))
}

/// Answer sign-tagged requests on `stream` until EOF or a hang-up decision
async fn serve_stream(mut stream: TcpStream, responder: Responder) {
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        match stream.read_buf(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        while let Ok(Some(request)) = SignedFrameAdapter.decode(&mut buf) {
            let Some(sign) = request.sign else { continue };
            let Some(reply) = responder(&request.payload) else {
                let _ = stream.shutdown().await;
                return;
            };
            let Ok(frame) = SignedFrameAdapter::response(sign.get() as u16, &reply) else {
                continue;
            };
            if stream.write_all(&frame).await.is_err() {
                return;
            }
        }
    }
}

/// Local TCP peer answering every request
pub struct TcpPeer {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl TcpPeer {
    pub async fn echo() -> Self {
        Self::start(echo()).await
    }

    pub async fn start(responder: Responder) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind loopback");
        let addr = listener.local_addr().expect("local addr");
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_stream(stream, responder.clone()));
            }
        });
        Self { addr, task }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for TcpPeer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Local UDP peer answering every request datagram
pub struct UdpPeer {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl UdpPeer {
    pub async fn echo() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind loopback");
        let addr = socket.local_addr().expect("local addr");
        let task = tokio::spawn(async move {
            let mut datagram = vec![0u8; 65_535];
            while let Ok((n, from)) = socket.recv_from(&mut datagram).await {
                let mut buf = BytesMut::from(&datagram[..n]);
                if let Ok(Some(request)) = SignedFrameAdapter.decode(&mut buf) {
                    let Some(sign) = request.sign else { continue };
                    if let Ok(frame) =
                        SignedFrameAdapter::response(sign.get() as u16, &request.payload)
                    {
                        let _ = socket.send_to(&frame, from).await;
                    }
                }
            }
        });
        Self { addr, task }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for UdpPeer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Emulated DTU dialling into a server channel
///
/// Registers with its id, then answers every request with the id as payload.
pub struct DtuTerminal {
    id: String,
    task: JoinHandle<()>,
}

impl DtuTerminal {
    pub async fn dial(addr: SocketAddr, id: &str) -> std::io::Result<Self> {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(id.as_bytes()).await?;
        let reply = Bytes::copy_from_slice(id.as_bytes());
        let responder: Responder = Arc::new(move |_: &[u8]| Some(reply.to_vec()));
        let task = tokio::spawn(serve_stream(stream, responder));
        Ok(Self {
            id: id.to_string(),
            task,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// True once the server side closed this terminal's session
    pub fn is_hung_up(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for DtuTerminal {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Wait until the server lists `identity` as registered
pub async fn wait_for_registration(server: &DtuServerTransport, identity: &str) -> bool {
    for _ in 0..100 {
        if server.identities().iter().any(|id| id == identity) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Poll `condition` for up to a second
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Write `contents` to a fresh config file inside `dir`
pub fn write_config(dir: &tempfile::TempDir, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join("fieldlink.toml");
    std::fs::write(&path, contents).expect("write config");
    path
}
