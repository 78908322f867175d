//! Handle Owner Task
//!
//! Only one task owns the `Handle<ClientHandler>`. Forwarders talk to it
//! through a cloneable [`HandleController`] which sends commands over an
//! mpsc channel. Each channel open runs as its own in-flight task, so a
//! target the bastion is slow to reach never holds up other opens or a
//! disconnect.
//!
//! ```ignore
//! let controller = spawn_handle_owner_task(handle, tunnel_id);
//! let channel = controller.open_direct_tcpip("10.0.0.5", 8086, "127.0.0.1", 0).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::TunnelError;

const DISCONNECT_WAIT: Duration = Duration::from_secs(5);

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a direct-tcpip channel to the tunnel target
    ChannelOpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Disconnect the SSH connection
    Disconnect,
}

/// Controller for sending commands to the Handle Owner Task
///
/// Cloning only copies the sender. Whoever holds a controller can open
/// channels or disconnect the session, so it never leaves the process.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    /// Cancelled once the owner task has exited
    closed: CancellationToken,
}

impl HandleController {
    #[cfg(test)]
    fn with_sender(cmd_tx: mpsc::Sender<HandleCommand>) -> Self {
        Self {
            cmd_tx,
            closed: CancellationToken::new(),
        }
    }

    /// Token cancelled when the SSH connection is gone
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Open a direct-tcpip channel
    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, TunnelError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenDirectTcpip {
                host: host.to_string(),
                port,
                originator_host: originator_host.to_string(),
                originator_port,
                reply_tx,
            })
            .await
            .map_err(|_| TunnelError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| TunnelError::Disconnected)?
            .map_err(|e| TunnelError::Channel(e.to_string()))
    }

    /// Disconnect the SSH connection and wait (at most 5s) for the owner task to exit
    pub async fn disconnect(&self) {
        if self.cmd_tx.send(HandleCommand::Disconnect).await.is_err() {
            return;
        }
        if tokio::time::timeout(DISCONNECT_WAIT, self.closed.cancelled())
            .await
            .is_err()
        {
            warn!("Timeout waiting for SSH session to close");
        }
    }
}

/// Spawn the Handle Owner Task
///
/// Consumes the Handle and returns a controller for sending commands.
pub fn spawn_handle_owner_task(
    handle: Handle<ClientHandler>,
    tunnel_id: String,
) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);
    let closed = CancellationToken::new();
    let closed_for_task = closed.clone();

    let handle = Arc::new(handle);

    tokio::spawn(async move {
        info!("Handle owner task started for tunnel {}", tunnel_id);

        // Channel opens waiting for the bastion's confirmation
        let mut opens = JoinSet::new();

        loop {
            tokio::select! {
                biased;

                cmd = cmd_rx.recv() => match cmd {
                    Some(HandleCommand::ChannelOpenDirectTcpip {
                        host,
                        port,
                        originator_host,
                        originator_port,
                        reply_tx,
                    }) => {
                        let handle = handle.clone();
                        opens.spawn(async move {
                            let result = handle
                                .channel_open_direct_tcpip(host, port, originator_host, originator_port)
                                .await;
                            if reply_tx.send(result).is_err() {
                                // Channel is dropped here, the server closes it
                                warn!("Caller dropped before receiving direct_tcpip result");
                            }
                        });
                    }
                    Some(HandleCommand::Disconnect) => {
                        info!("Disconnect requested for tunnel {}", tunnel_id);
                        break;
                    }
                    None => {
                        info!("All controllers dropped for tunnel {}", tunnel_id);
                        break;
                    }
                },

                Some(_) = opens.join_next(), if !opens.is_empty() => {}

                _ = wait_closed(&handle) => {
                    warn!("SSH connection lost for tunnel {}", tunnel_id);
                    break;
                }
            }
        }

        // Dropping an aborted open drops its reply sender, callers see Disconnected
        if !opens.is_empty() {
            debug!("Aborting {} pending channel opens for tunnel {}", opens.len(), tunnel_id);
        }
        opens.abort_all();
        drain_pending_commands(&mut cmd_rx);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Tunnel closed", "en")
            .await;
        closed_for_task.cancel();
        info!("Handle owner task terminated for tunnel {}", tunnel_id);
    });

    HandleController { cmd_tx, closed }
}

/// Resolves once the underlying session has shut down
async fn wait_closed(handle: &Handle<ClientHandler>) {
    while !handle.is_closed() {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

/// Reply `Disconnect` to every command still queued
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Disconnect => {
                debug!("Ignoring queued disconnect");
            }
        }
    }
}
