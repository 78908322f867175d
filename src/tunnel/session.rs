//! Tunnel Session
//!
//! The seam between the lifecycle controller and the transport to the
//! bastion. [`SshConnector`] is the russh implementation; anything that can
//! open byte streams to a `host:port` can stand in for it.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::ssh::{HandleController, ResolvedAuth, SshClient, TunnelConfig, TunnelError};

/// Byte stream to the remote target
pub trait RemoteIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> RemoteIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type RemoteStream = Box<dyn RemoteIo>;

/// One authenticated transport able to open channels to the remote side
#[async_trait]
pub trait TunnelSession: Send + Sync {
    /// Open a channel to `host:port`. Called concurrently by forwarders.
    async fn open_channel(&self, host: &str, port: u16) -> Result<RemoteStream, TunnelError>;

    /// Cancelled when the transport is gone
    fn closed_token(&self) -> CancellationToken;

    /// Close the transport. Safe to call more than once.
    async fn close(&self);
}

/// Produces a [`TunnelSession`] for a validated configuration
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(
        &self,
        config: &Arc<TunnelConfig>,
        tunnel_id: &str,
    ) -> Result<Arc<dyn TunnelSession>, TunnelError>;
}

/// russh-backed connector
///
/// Credentials are resolved when the connector is built so that an
/// unreadable key fails before any network I/O.
#[derive(Debug)]
pub struct SshConnector {
    auth: ResolvedAuth,
}

impl SshConnector {
    pub fn new(config: &TunnelConfig) -> Result<Self, TunnelError> {
        config.validate()?;
        let auth = ResolvedAuth::resolve(&config.auth)?;
        Ok(Self { auth })
    }
}

#[async_trait]
impl SessionConnector for SshConnector {
    async fn connect(
        &self,
        config: &Arc<TunnelConfig>,
        tunnel_id: &str,
    ) -> Result<Arc<dyn TunnelSession>, TunnelError> {
        let client = SshClient::new(config.clone(), self.auth.clone());
        let controller = client.connect(tunnel_id.to_string()).await?;
        Ok(Arc::new(SshTunnelSession { controller }))
    }
}

/// Session backed by the handle owner task
pub struct SshTunnelSession {
    controller: HandleController,
}

#[async_trait]
impl TunnelSession for SshTunnelSession {
    async fn open_channel(&self, host: &str, port: u16) -> Result<RemoteStream, TunnelError> {
        let channel = self
            .controller
            .open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
            .await?;
        debug!("Opened direct-tcpip channel to {}:{}", host, port);
        Ok(Box::new(channel.into_stream()))
    }

    fn closed_token(&self) -> CancellationToken {
        self.controller.closed_token()
    }

    async fn close(&self) {
        self.controller.disconnect().await;
    }
}
