//! Connection Forwarder
//!
//! Relays one accepted local connection through a channel opened on the
//! tunnel session. The pairing ends as soon as either direction finishes:
//! a peer that half-closes its sending side loses whatever the other side
//! was still sending.

use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::session::TunnelSession;
use crate::ssh::{Endpoint, TunnelError};

/// Relay buffer per direction
const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// Statistics for a tunnel
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardStats {
    /// Total connections accepted
    pub connection_count: u64,
    /// Forwarding tasks still running
    pub active_connections: u64,
    /// Total bytes sent (local -> remote)
    pub bytes_sent: u64,
    /// Total bytes received (remote -> local)
    pub bytes_received: u64,
}

pub(crate) type SharedStats = Arc<parking_lot::RwLock<ForwardStats>>;

/// Counts one in-flight forwarded connection for as long as it lives
pub(crate) struct ActiveConnection {
    stats: SharedStats,
}

impl ActiveConnection {
    pub(crate) fn register(stats: &SharedStats) -> Self {
        {
            let mut s = stats.write();
            s.connection_count += 1;
            s.active_connections += 1;
        }
        Self {
            stats: stats.clone(),
        }
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        let mut s = self.stats.write();
        s.active_connections = s.active_connections.saturating_sub(1);
    }
}

/// How a relay ended
#[derive(Debug)]
enum RelayEnd {
    LocalClosed(std::io::Result<u64>),
    RemoteClosed(std::io::Result<u64>),
    Cancelled,
}

/// Forward a single accepted connection to `target`
///
/// A failed channel open drops (closes) `local` and returns the error; the
/// caller only logs it.
pub(crate) async fn forward_connection(
    session: Arc<dyn TunnelSession>,
    local: TcpStream,
    peer: SocketAddr,
    target: &Endpoint,
    cancel: CancellationToken,
    stats: SharedStats,
) -> Result<(), TunnelError> {
    let remote = tokio::select! {
        _ = cancel.cancelled() => {
            debug!("Tunnel stopping before channel to {} opened for {}", target, peer);
            return Ok(());
        }
        opened = session.open_channel(&target.host, target.port) => opened?,
    };

    debug!("Forwarding {} -> {}", peer, target);

    let (mut local_read, mut local_write) = local.into_split();
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);

    let end = tokio::select! {
        sent = relay(&mut local_read, &mut remote_write, |n| stats.write().bytes_sent += n) => {
            RelayEnd::LocalClosed(sent)
        }
        received = relay(&mut remote_read, &mut local_write, |n| stats.write().bytes_received += n) => {
            RelayEnd::RemoteClosed(received)
        }
        _ = cancel.cancelled() => RelayEnd::Cancelled,
    };

    match &end {
        RelayEnd::LocalClosed(Ok(n)) => debug!("{} closed after sending {} bytes", peer, n),
        RelayEnd::LocalClosed(Err(e)) => debug!("Local side {} failed: {}", peer, e),
        RelayEnd::RemoteClosed(Ok(n)) => debug!("{} closed after receiving {} bytes", target, n),
        RelayEnd::RemoteClosed(Err(e)) => debug!("Remote side {} failed: {}", target, e),
        RelayEnd::Cancelled => debug!("Forward {} -> {} cancelled", peer, target),
    }

    let _ = local_write.shutdown().await;
    if !matches!(end, RelayEnd::Cancelled) {
        // EOF to the remote side; bounded by the stop signal
        tokio::select! {
            _ = remote_write.shutdown() => {}
            _ = cancel.cancelled() => {}
        }
    }

    debug!("Forward connection {} closed", peer);
    Ok(())
}

/// Copy `reader` into `writer` until EOF, reporting each chunk
async fn relay<R, W, F>(reader: &mut R, writer: &mut W, on_chunk: F) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
    F: Fn(u64),
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        total += n as u64;
        on_chunk(n as u64);
    }
}
