//! Shared fixtures: a session that "tunnels" by dialing TCP directly, plus
//! small local servers to forward to.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bastion_tunnel::ssh::{AuthMethod, Endpoint, TunnelConfig, TunnelError};
use bastion_tunnel::tunnel::{RemoteStream, SessionConnector, TunnelSession};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Session whose channels are plain TCP connections from the test process
#[derive(Default)]
pub struct DirectSession {
    closed: CancellationToken,
    pub channels_opened: AtomicUsize,
    pub close_calls: AtomicUsize,
}

impl DirectSession {
    /// Simulate the bastion dropping the connection
    pub fn drop_transport(&self) {
        self.closed.cancel();
    }
}

#[async_trait]
impl TunnelSession for DirectSession {
    async fn open_channel(&self, host: &str, port: u16) -> Result<RemoteStream, TunnelError> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| TunnelError::Channel(format!("connect {}:{}: {}", host, port, e)))?;
        self.channels_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(stream))
    }

    fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.cancel();
    }
}

/// Hands out one shared [`DirectSession`], or fails with a fixed error
pub struct DirectConnector {
    pub session: Arc<DirectSession>,
    failure: Option<fn() -> TunnelError>,
    pub connects: AtomicUsize,
}

impl DirectConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            session: Arc::new(DirectSession::default()),
            failure: None,
            connects: AtomicUsize::new(0),
        })
    }

    pub fn failing(failure: fn() -> TunnelError) -> Arc<Self> {
        Arc::new(Self {
            session: Arc::new(DirectSession::default()),
            failure: Some(failure),
            connects: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl SessionConnector for DirectConnector {
    async fn connect(
        &self,
        _config: &Arc<TunnelConfig>,
        _tunnel_id: &str,
    ) -> Result<Arc<dyn TunnelSession>, TunnelError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(failure) = self.failure {
            return Err(failure());
        }
        Ok(self.session.clone() as Arc<dyn TunnelSession>)
    }
}

pub fn config_for(remote: SocketAddr) -> TunnelConfig {
    TunnelConfig::new(
        Endpoint::new(remote.ip().to_string(), remote.port()),
        Endpoint::new("bastion.invalid", 22),
        "ops",
        AuthMethod::password("secret"),
    )
}

/// An address nothing is listening on
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Echo server; returns its address
pub async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

/// Server that writes to every client until the connection breaks
pub async fn spawn_streaming_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let chunk = vec![0x5au8; 16 * 1024];
                while stream.write_all(&chunk).await.is_ok() {}
            });
        }
    });
    addr
}

/// Send `payload` and read back the same number of bytes
pub async fn echo_roundtrip(stream: &mut TcpStream, payload: &[u8]) -> Vec<u8> {
    stream.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("echo timed out")
        .unwrap();
    buf
}

/// Poll `check` until it holds or `limit` passes
pub async fn eventually<F: FnMut() -> bool>(limit: Duration, mut check: F) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
