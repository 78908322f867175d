//! Tunnel error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Invalid tunnel configuration: {0}")]
    Config(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Dial failed: {0}")]
    Dial(String),

    #[error("Bind failed: {0}")]
    Bind(String),

    #[error("Tunnel already started")]
    AlreadyStarted,

    #[error("Tunnel not started")]
    NotStarted,

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("SSH protocol error: {0}")]
    Protocol(String),

    #[error("Disconnected")]
    Disconnected,
}

impl From<russh::Error> for TunnelError {
    fn from(err: russh::Error) -> Self {
        TunnelError::Protocol(err.to_string())
    }
}

// Errors cross the desktop shell boundary as plain strings
impl serde::Serialize for TunnelError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
