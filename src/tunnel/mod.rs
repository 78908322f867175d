//! Tunnel Module
//!
//! Forwards connections from an ephemeral loopback port through an SSH
//! bastion to a fixed remote endpoint.

mod forwarder;
mod lifecycle;
pub mod registry;
mod session;

pub use forwarder::ForwardStats;
pub use lifecycle::{Tunnel, TunnelState};
pub use registry::TunnelRegistry;
pub use session::{
    RemoteIo, RemoteStream, SessionConnector, SshConnector, SshTunnelSession, TunnelSession,
};
