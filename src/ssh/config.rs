//! Tunnel Configuration

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::TunnelError;

/// A `host:port` pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port` or `[v6addr]:port`
    pub fn parse(s: &str) -> Result<Self, TunnelError> {
        let s = s.trim();
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| TunnelError::Config(format!("Missing port in address '{}'", s)))?;

        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        let port = port
            .parse::<u16>()
            .map_err(|_| TunnelError::Config(format!("Invalid port in address '{}'", s)))?;

        Ok(Self::new(host, port))
    }

    fn is_complete(&self) -> bool {
        !self.host.trim().is_empty() && self.port != 0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Authentication methods supported against the bastion
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    /// Password authentication
    Password { password: String },

    /// SSH key authentication
    Key {
        /// Path to private key file
        key_path: String,
        /// Optional passphrase for encrypted keys
        passphrase: Option<String>,
    },
}

impl AuthMethod {
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password {
            password: password.into(),
        }
    }

    pub fn key(key_path: impl Into<String>, passphrase: Option<String>) -> Self {
        Self::Key {
            key_path: key_path.into(),
            passphrase,
        }
    }

    fn is_usable(&self) -> bool {
        match self {
            AuthMethod::Password { password } => !password.is_empty(),
            AuthMethod::Key { key_path, .. } => !key_path.trim().is_empty(),
        }
    }
}

/// Everything needed to reach `remote` through `bastion`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Target reachable only from the bastion
    pub remote: Endpoint,

    /// SSH bastion
    #[serde(default = "default_bastion")]
    pub bastion: Endpoint,

    /// Username on the bastion
    pub username: String,

    /// Authentication method
    pub auth: AuthMethod,

    /// Pinned bastion host key (`SHA256:...`). `None` accepts any key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_key_fingerprint: Option<String>,

    /// Bastion connect timeout in seconds. `None` waits indefinitely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_secs: Option<u64>,
}

fn default_bastion() -> Endpoint {
    Endpoint::new(String::new(), default_port())
}

fn default_port() -> u16 {
    22
}

impl TunnelConfig {
    pub fn new(
        remote: Endpoint,
        bastion: Endpoint,
        username: impl Into<String>,
        auth: AuthMethod,
    ) -> Self {
        Self {
            remote,
            bastion,
            username: username.into(),
            auth,
            host_key_fingerprint: None,
            connect_timeout_secs: None,
        }
    }

    pub fn with_host_key_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.host_key_fingerprint = Some(fingerprint.into());
        self
    }

    pub fn with_connect_timeout(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = Some(secs);
        self
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_secs.map(Duration::from_secs)
    }

    /// Reject incomplete configurations before any network I/O
    pub fn validate(&self) -> Result<(), TunnelError> {
        if !self.bastion.is_complete() {
            return Err(TunnelError::Config(
                "SSH host and port are required".to_string(),
            ));
        }
        if !self.remote.is_complete() {
            return Err(TunnelError::Config(
                "Remote host and port are required".to_string(),
            ));
        }
        if self.username.trim().is_empty() {
            return Err(TunnelError::Config("SSH username is required".to_string()));
        }
        if !self.auth.is_usable() {
            return Err(TunnelError::Config(
                "SSH authentication method not configured (password or key required)".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> TunnelConfig {
        TunnelConfig::new(
            Endpoint::new("10.0.0.5", 8086),
            Endpoint::new("bastion.example.com", 22),
            "ops",
            AuthMethod::password("secret"),
        )
    }

    #[test]
    fn test_endpoint_parse() {
        let ep = Endpoint::parse("db.internal:8086").unwrap();
        assert_eq!(ep, Endpoint::new("db.internal", 8086));

        let v6 = Endpoint::parse("[::1]:8086").unwrap();
        assert_eq!(v6.host, "::1");
        assert_eq!(v6.to_string(), "[::1]:8086");

        assert!(Endpoint::parse("db.internal").is_err());
        assert!(Endpoint::parse("db.internal:http").is_err());
    }

    #[test]
    fn test_validate_accepts_complete_config() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_fields() {
        let mut cfg = valid();
        cfg.bastion.host.clear();
        assert!(matches!(cfg.validate(), Err(TunnelError::Config(_))));

        let mut cfg = valid();
        cfg.bastion.port = 0;
        assert!(matches!(cfg.validate(), Err(TunnelError::Config(_))));

        let mut cfg = valid();
        cfg.remote.port = 0;
        assert!(matches!(cfg.validate(), Err(TunnelError::Config(_))));

        let mut cfg = valid();
        cfg.username = "  ".into();
        assert!(matches!(cfg.validate(), Err(TunnelError::Config(_))));

        let mut cfg = valid();
        cfg.auth = AuthMethod::password("");
        assert!(matches!(cfg.validate(), Err(TunnelError::Config(_))));

        let mut cfg = valid();
        cfg.auth = AuthMethod::key("", None);
        assert!(matches!(cfg.validate(), Err(TunnelError::Config(_))));
    }

    #[test]
    fn test_bastion_port_defaults_to_22() {
        let json = r#"{
            "remote": {"host": "db", "port": 8086},
            "username": "ops",
            "auth": {"type": "password", "password": "x"}
        }"#;
        let cfg: TunnelConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.bastion.port, 22);
        assert!(cfg.connect_timeout().is_none());
        assert!(cfg.host_key_fingerprint.is_none());
    }

    #[test]
    fn test_auth_method_tagged_serde() {
        let auth = AuthMethod::key("~/.ssh/id_ed25519", None);
        let json = serde_json::to_value(&auth).unwrap();
        assert_eq!(json["type"], "key");
        assert_eq!(json["key_path"], "~/.ssh/id_ed25519");
    }
}
