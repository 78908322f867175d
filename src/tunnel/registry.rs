//! Tunnel Registry
//!
//! Live tunnels of the desktop shell, keyed by connection name. Opening a
//! connection that already has a tunnel replaces it; shell shutdown closes
//! them all.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};

use super::lifecycle::Tunnel;
use super::session::SessionConnector;
use crate::ssh::{TunnelConfig, TunnelError};

#[derive(Default)]
pub struct TunnelRegistry {
    tunnels: DashMap<String, Arc<Tunnel>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start an SSH tunnel for `name` and return its local address
    pub async fn open(&self, name: &str, config: TunnelConfig) -> Result<String, TunnelError> {
        let tunnel = Tunnel::new(config)?;
        self.install(name, tunnel).await
    }

    /// Same as [`open`](Self::open) with a custom session connector
    pub async fn open_with_connector(
        &self,
        name: &str,
        config: TunnelConfig,
        connector: Arc<dyn SessionConnector>,
    ) -> Result<String, TunnelError> {
        let tunnel = Tunnel::with_connector(config, connector)?;
        self.install(name, tunnel).await
    }

    async fn install(&self, name: &str, tunnel: Tunnel) -> Result<String, TunnelError> {
        // The previous tunnel for this connection is stopped before the new one dials
        self.close(name).await?;

        tunnel.start().await?;
        let local_address = tunnel.local_address();

        if let Some(previous) = self.tunnels.insert(name.to_string(), Arc::new(tunnel)) {
            // Raced with another open for the same name
            warn!("Replacing tunnel for connection {} opened concurrently", name);
            previous.stop().await?;
        }

        info!("Tunnel for connection {} ready on {}", name, local_address);
        Ok(local_address)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Tunnel>> {
        self.tunnels.get(name).map(|entry| entry.value().clone())
    }

    pub fn local_address(&self, name: &str) -> Option<String> {
        self.tunnels
            .get(name)
            .map(|entry| entry.local_address())
            .filter(|addr| !addr.is_empty())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tunnels.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.tunnels.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Stop and forget the tunnel for `name`; unknown names are ignored
    pub async fn close(&self, name: &str) -> Result<(), TunnelError> {
        let Some((_, tunnel)) = self.tunnels.remove(name) else {
            return Ok(());
        };
        info!("Closing tunnel for connection {}", name);
        tunnel.stop().await
    }

    /// Stop every tunnel (best-effort)
    pub async fn close_all(&self) {
        for name in self.names() {
            if let Err(e) = self.close(&name).await {
                warn!("Failed to stop tunnel {} during shutdown: {}", name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_close_unknown_is_noop() {
        let registry = TunnelRegistry::new();
        registry.close("missing").await.unwrap();
        assert!(registry.is_empty());
        assert!(registry.local_address("missing").is_none());
    }

    #[tokio::test]
    async fn test_open_rejects_invalid_config() {
        use crate::ssh::{AuthMethod, Endpoint};

        let registry = TunnelRegistry::new();
        let config = TunnelConfig::new(
            Endpoint::new("db", 8086),
            Endpoint::new("", 22),
            "ops",
            AuthMethod::password("secret"),
        );
        let result = registry.open("prod", config).await;
        assert!(matches!(result, Err(TunnelError::Config(_))));
        assert!(!registry.contains("prod"));
    }
}
