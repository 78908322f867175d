//! Connection profiles
//!
//! The SSH fields of a stored connection profile and their conversion into a
//! [`TunnelConfig`]. Profiles are persisted by the shell as JSON; only the
//! fields the tunnel needs are modelled here.

use serde::{Deserialize, Serialize};

use crate::ssh::{AuthMethod, Endpoint, TunnelConfig, TunnelError};

/// Stored connection profile (tunnel-relevant subset)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionProfile {
    pub name: String,

    /// `host:port` of the database HTTP endpoint
    pub address: String,

    #[serde(default, rename = "enableSSH")]
    pub enable_ssh: bool,

    #[serde(default)]
    pub ssh_host: String,

    #[serde(default)]
    pub ssh_port: u16,

    #[serde(default)]
    pub ssh_username: String,

    #[serde(default)]
    pub ssh_password: String,

    #[serde(default)]
    pub ssh_key_path: String,

    #[serde(default)]
    pub ssh_key_passphrase: String,
}

impl ConnectionProfile {
    pub fn from_json(json: &str) -> Result<Self, TunnelError> {
        serde_json::from_str(json)
            .map_err(|e| TunnelError::Config(format!("Invalid connection profile: {}", e)))
    }

    /// Build the tunnel configuration for this profile
    ///
    /// A key path wins over a password when both are set.
    pub fn tunnel_config(&self) -> Result<TunnelConfig, TunnelError> {
        if !self.enable_ssh {
            return Err(TunnelError::Config("SSH is not enabled".to_string()));
        }

        let auth = if !self.ssh_key_path.trim().is_empty() {
            let passphrase = Some(self.ssh_key_passphrase.clone()).filter(|p| !p.is_empty());
            AuthMethod::key(self.ssh_key_path.trim(), passphrase)
        } else {
            AuthMethod::password(self.ssh_password.clone())
        };

        let config = TunnelConfig::new(
            Endpoint::parse(&self.address)?,
            Endpoint::new(self.ssh_host.trim(), self.ssh_port),
            self.ssh_username.trim(),
            auth,
        );
        config.validate()?;
        Ok(config)
    }

    /// Copy of this profile that talks to `local_address` instead of the remote
    pub fn through_tunnel(&self, local_address: &str) -> Self {
        Self {
            address: local_address.to_string(),
            ..self.clone()
        }
    }
}
