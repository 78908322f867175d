//! Tunnel Lifecycle
//!
//! A [`Tunnel`] goes `Created -> Started -> Stopped` exactly once.
//! `start` dials the bastion and binds an ephemeral loopback listener as one
//! step; `stop` stops accepting, drains every forwarding task and closes the
//! session before reporting `Stopped`.
//!
//! Every suspend point (accept, channel open, relay I/O) is attached to the
//! tunnel's cancellation token, and cancelling it drops the listener and the
//! forwarded sockets. A fresh `Tunnel` must be built to retry.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::forwarder::{forward_connection, ActiveConnection, ForwardStats, SharedStats};
use super::session::{SessionConnector, SshConnector, TunnelSession};
use crate::ssh::{Endpoint, TunnelConfig, TunnelError};

/// Listener address: loopback, OS-assigned port
const LISTEN_ADDR: &str = "127.0.0.1:0";

/// Pause before accepting again after a transient accept error
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Lifecycle state of a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelState {
    Created,
    Started,
    Stopped,
}

/// State visible to API callers, guarded by one lock
struct Shared {
    state: TunnelState,
    local_addr: Option<SocketAddr>,
    start_attempted: bool,
}

/// Resources held while `Started`
struct Running {
    session: Arc<dyn TunnelSession>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    accept_task: JoinHandle<()>,
}

/// SSH tunnel from an ephemeral local port to a remote endpoint behind a bastion
pub struct Tunnel {
    id: String,
    config: Arc<TunnelConfig>,
    connector: Arc<dyn SessionConnector>,
    listen_addr: String,
    shared: parking_lot::Mutex<Shared>,
    /// Also the transition lock: `start` and `stop` hold it for their whole run
    running: tokio::sync::Mutex<Option<Running>>,
    stats: SharedStats,
}

impl Tunnel {
    /// Build a tunnel that reaches the bastion over SSH
    ///
    /// Validates the configuration and loads the private key, if any.
    pub fn new(config: TunnelConfig) -> Result<Self, TunnelError> {
        let connector = SshConnector::new(&config)?;
        Self::with_connector(config, Arc::new(connector))
    }

    /// Build a tunnel over a custom session connector
    pub fn with_connector(
        config: TunnelConfig,
        connector: Arc<dyn SessionConnector>,
    ) -> Result<Self, TunnelError> {
        config.validate()?;
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            config: Arc::new(config),
            connector,
            listen_addr: LISTEN_ADDR.to_string(),
            shared: parking_lot::Mutex::new(Shared {
                state: TunnelState::Created,
                local_addr: None,
                start_attempted: false,
            }),
            running: tokio::sync::Mutex::new(None),
            stats: SharedStats::default(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn state(&self) -> TunnelState {
        self.shared.lock().state
    }

    pub fn is_started(&self) -> bool {
        self.state() == TunnelState::Started
    }

    /// Bound local endpoint as `ip:port`, empty unless started
    pub fn local_address(&self) -> String {
        self.shared
            .lock()
            .local_addr
            .map(|addr| addr.to_string())
            .unwrap_or_default()
    }

    /// Bound local endpoint
    pub fn bound_addr(&self) -> Result<SocketAddr, TunnelError> {
        self.shared.lock().local_addr.ok_or(TunnelError::NotStarted)
    }

    pub fn stats(&self) -> ForwardStats {
        self.stats.read().clone()
    }

    /// Dial the bastion, bind the local listener and start accepting
    ///
    /// Only the first call on an instance does anything; later calls return
    /// `AlreadyStarted`, whether or not the first one succeeded.
    pub async fn start(&self) -> Result<(), TunnelError> {
        let mut running = self.running.lock().await;

        {
            let mut shared = self.shared.lock();
            if shared.start_attempted {
                return Err(TunnelError::AlreadyStarted);
            }
            shared.start_attempted = true;
        }

        info!(
            "Starting tunnel {}: {}@{} -> {}",
            self.id, self.config.username, self.config.bastion, self.config.remote
        );

        let session = self.connector.connect(&self.config, &self.id).await?;

        let listener = match TcpListener::bind(self.listen_addr.as_str()).await {
            Ok(listener) => listener,
            Err(e) => {
                session.close().await;
                return Err(bind_error(&self.listen_addr, e));
            }
        };

        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                session.close().await;
                return Err(TunnelError::Bind(format!(
                    "Failed to get bound address: {}",
                    e
                )));
            }
        };

        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();

        {
            let mut shared = self.shared.lock();
            shared.state = TunnelState::Started;
            shared.local_addr = Some(local_addr);
        }

        let accept_loop = AcceptLoop {
            tunnel_id: self.id.clone(),
            listener,
            session: session.clone(),
            target: Arc::new(self.config.remote.clone()),
            shutdown: shutdown.clone(),
            tracker: tracker.clone(),
            stats: self.stats.clone(),
        };
        let accept_task = tokio::spawn(accept_loop.run());

        *running = Some(Running {
            session,
            shutdown,
            tracker,
            accept_task,
        });

        info!(
            "Tunnel {} listening on {} -> {}",
            self.id, local_addr, self.config.remote
        );
        Ok(())
    }

    /// Stop accepting, drain forwarded connections and close the session
    ///
    /// Succeeds without side effects unless the tunnel is started. Concurrent
    /// callers wait for the one doing the teardown and then return `Ok`.
    pub async fn stop(&self) -> Result<(), TunnelError> {
        let mut running = self.running.lock().await;
        let Some(run) = running.take() else {
            debug!("Stop on tunnel {} that is not running", self.id);
            return Ok(());
        };

        info!("Stopping tunnel {}", self.id);

        run.shutdown.cancel();

        // Listener is dropped when the accept loop returns
        if let Err(e) = run.accept_task.await {
            warn!("Accept loop of tunnel {} ended abnormally: {}", self.id, e);
        }

        run.tracker.close();
        let pending = run.tracker.len();
        if pending > 0 {
            debug!(
                "Waiting for {} forwarded connections on tunnel {}",
                pending, self.id
            );
        }
        run.tracker.wait().await;

        run.session.close().await;

        {
            let mut shared = self.shared.lock();
            shared.state = TunnelState::Stopped;
            shared.local_addr = None;
        }

        info!("Tunnel {} stopped", self.id);
        Ok(())
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        if let Some(run) = self.running.get_mut().take() {
            debug!("Dropping running tunnel {}", self.id);
            run.shutdown.cancel();
        }
    }
}

fn bind_error(addr: &str, e: std::io::Error) -> TunnelError {
    match e.kind() {
        std::io::ErrorKind::AddrInUse => {
            TunnelError::Bind(format!("No free local port on {}: {}", addr, e))
        }
        std::io::ErrorKind::PermissionDenied => {
            TunnelError::Bind(format!("Permission denied binding to {}", addr))
        }
        std::io::ErrorKind::AddrNotAvailable => TunnelError::Bind(format!(
            "Address not available: {}. Loopback may be disabled on this system.",
            addr
        )),
        _ => TunnelError::Bind(format!("Failed to bind to {}: {}", addr, e)),
    }
}

/// Accepts local connections and hands each one to a forwarder
struct AcceptLoop {
    tunnel_id: String,
    listener: TcpListener,
    session: Arc<dyn TunnelSession>,
    target: Arc<Endpoint>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    stats: SharedStats,
}

impl AcceptLoop {
    async fn run(self) {
        let session_closed = self.session.closed_token();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("Accept loop of tunnel {} stopping", self.tunnel_id);
                    break;
                }

                _ = session_closed.cancelled() => {
                    warn!(
                        "SSH session of tunnel {} lost, no longer accepting connections",
                        self.tunnel_id
                    );
                    self.shutdown.cancel();
                    break;
                }

                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.dispatch(stream, peer),
                    Err(e) => {
                        if self.shutdown.is_cancelled() {
                            break;
                        }
                        warn!("Accept error on tunnel {}: {}", self.tunnel_id, e);
                        tokio::select! {
                            _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
                            _ = self.shutdown.cancelled() => break,
                        }
                    }
                },
            }
        }

        info!("Accept loop of tunnel {} exited", self.tunnel_id);
    }

    fn dispatch(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }

        debug!("Accepted connection from {} on tunnel {}", peer, self.tunnel_id);

        let active = ActiveConnection::register(&self.stats);
        let session = self.session.clone();
        let target = self.target.clone();
        let cancel = self.shutdown.child_token();
        let stats = self.stats.clone();

        self.tracker.spawn(async move {
            let _active = active;
            if let Err(e) =
                forward_connection(session, stream, peer, &target, cancel, stats).await
            {
                warn!("Forward connection from {} to {} failed: {}", peer, target, e);
            }
        });
    }
}
