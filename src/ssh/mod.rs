//! SSH module - bastion session for the tunnel
//!
//! Provides the russh-based client used to reach the bastion:
//! configuration and validation, credential resolution, host key policy,
//! and the single-owner task that opens `direct-tcpip` channels.

mod client;
mod config;
mod error;
mod handle_owner;

pub use client::{fingerprint, ClientHandler, ResolvedAuth, SshClient};
pub use config::{AuthMethod, Endpoint, TunnelConfig};
pub use error::TunnelError;
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController};
