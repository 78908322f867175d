//! bastion-tunnel - SSH tunnels for a time-series database manager
//!
//! Forwards an ephemeral loopback port through an SSH bastion to a database
//! endpoint that is not reachable directly. The HTTP client is then pointed
//! at the tunnel's local address.
//!
//! ```ignore
//! let tunnel = Tunnel::new(profile.tunnel_config()?)?;
//! tunnel.start().await?;
//! let client_profile = profile.through_tunnel(&tunnel.local_address());
//! // ...
//! tunnel.stop().await?;
//! ```

pub mod config;
pub mod logging;
pub mod ssh;
pub mod tunnel;

pub use config::ConnectionProfile;
pub use logging::init_logging;
pub use ssh::{AuthMethod, Endpoint, TunnelConfig, TunnelError};
pub use tunnel::{ForwardStats, Tunnel, TunnelRegistry, TunnelState};
