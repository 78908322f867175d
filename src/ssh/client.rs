//! SSH client for the bastion, using russh

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use russh::client;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{PrivateKey, PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::config::{AuthMethod, TunnelConfig};
use super::error::TunnelError;
use super::handle_owner::{spawn_handle_owner_task, HandleController};

/// Credentials resolved from an [`AuthMethod`], ready to present to the bastion
#[derive(Clone)]
pub enum ResolvedAuth {
    Key(Arc<PrivateKey>),
    Password(String),
}

impl std::fmt::Debug for ResolvedAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolvedAuth::Key(_) => f.write_str("ResolvedAuth::Key(..)"),
            ResolvedAuth::Password(_) => f.write_str("ResolvedAuth::Password(..)"),
        }
    }
}

impl ResolvedAuth {
    /// Read and parse the key file, or take the password as is
    pub fn resolve(auth: &AuthMethod) -> Result<Self, TunnelError> {
        match auth {
            AuthMethod::Key {
                key_path,
                passphrase,
            } => {
                let path = expand_tilde(key_path);
                let passphrase = passphrase.as_deref().filter(|p| !p.is_empty());
                let key = russh::keys::load_secret_key(&path, passphrase).map_err(|e| {
                    TunnelError::Config(format!("Failed to load SSH private key {}: {}", path, e))
                })?;
                Ok(ResolvedAuth::Key(Arc::new(key)))
            }
            AuthMethod::Password { password } if !password.is_empty() => {
                Ok(ResolvedAuth::Password(password.clone()))
            }
            AuthMethod::Password { .. } => Err(TunnelError::Config(
                "SSH authentication method not configured (password or key required)".to_string(),
            )),
        }
    }
}

/// Expand ~ to home directory so key paths from profiles work with russh::keys
pub(crate) fn expand_tilde(path: &str) -> String {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped).to_string_lossy().into_owned();
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home.to_string_lossy().into_owned();
        }
    }
    path.to_string()
}

/// Compute the OpenSSH-style SHA256 fingerprint of a public key
pub fn fingerprint(key: &PublicKey) -> String {
    let key_bytes = key.public_key_bytes();
    let mut hasher = Sha256::new();
    hasher.update(&key_bytes);
    let hash = hasher.finalize();
    format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
}

/// Dials and authenticates one bastion session
pub struct SshClient {
    config: Arc<TunnelConfig>,
    auth: ResolvedAuth,
}

impl SshClient {
    pub fn new(config: Arc<TunnelConfig>, auth: ResolvedAuth) -> Self {
        Self { config, auth }
    }

    /// Connect, authenticate and hand the session to its owner task
    pub async fn connect(&self, tunnel_id: String) -> Result<HandleController, TunnelError> {
        let bastion = &self.config.bastion;
        info!("Connecting to SSH bastion at {}", bastion);

        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };

        let handler = ClientHandler::new(
            bastion.host.clone(),
            bastion.port,
            self.config.host_key_fingerprint.clone(),
        );

        let connect = client::connect(
            Arc::new(ssh_config),
            (bastion.host.as_str(), bastion.port),
            handler,
        );

        let connected = match self.config.connect_timeout() {
            Some(limit) => tokio::time::timeout(limit, connect).await.map_err(|_| {
                TunnelError::Dial(format!(
                    "Connection to {} timed out after {}s",
                    bastion,
                    limit.as_secs()
                ))
            })?,
            None => connect.await,
        };

        let mut handle = connected.map_err(|e| match e {
            TunnelError::Dial(msg) => TunnelError::Dial(msg),
            other => TunnelError::Dial(format!("Failed to connect to {}: {}", bastion, other)),
        })?;

        debug!("SSH handshake completed with {}", bastion);

        let username = &self.config.username;
        let result = match &self.auth {
            ResolvedAuth::Key(key) => {
                // rsa-sha2-256/512 when the bastion advertises them, OpenSSH 8.8+ refuses ssh-rsa
                let hash = handle.best_supported_rsa_hash().await?.flatten();
                let key_with_hash = PrivateKeyWithHashAlg::new(key.clone(), hash);
                handle
                    .authenticate_publickey(username, key_with_hash)
                    .await
                    .map_err(|e| TunnelError::Auth(e.to_string()))?
            }
            ResolvedAuth::Password(password) => handle
                .authenticate_password(username, password)
                .await
                .map_err(|e| TunnelError::Auth(e.to_string()))?,
        };

        if !result.success() {
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "Authentication failed", "en")
                .await;
            return Err(TunnelError::Auth(format!(
                "Bastion {} rejected credentials for {}",
                bastion, username
            )));
        }

        info!("SSH authentication successful on {}", bastion);

        Ok(spawn_handle_owner_task(handle, tunnel_id))
    }
}

/// Client handler for russh callbacks
///
/// Host keys are accepted without verification unless a fingerprint is
/// pinned in the tunnel configuration.
pub struct ClientHandler {
    host: String,
    port: u16,
    pinned_fingerprint: Option<String>,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, pinned_fingerprint: Option<String>) -> Self {
        Self {
            host,
            port,
            pinned_fingerprint,
        }
    }

    fn verify(&self, actual: &str) -> Result<bool, TunnelError> {
        match &self.pinned_fingerprint {
            Some(expected) if expected.trim() == actual => {
                info!("Host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            Some(expected) => {
                warn!(
                    "HOST KEY MISMATCH for {}:{}! Expected {}, got {}",
                    self.host, self.port, expected, actual
                );
                Err(TunnelError::Dial(format!(
                    "Host key verification failed for {}:{}: expected {}, got {}",
                    self.host, self.port, expected, actual
                )))
            }
            None => {
                warn!(
                    "Accepting unverified host key for {}:{} (fingerprint: {})",
                    self.host, self.port, actual
                );
                Ok(true)
            }
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = TunnelError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        self.verify(&fingerprint(server_public_key))
    }
}
