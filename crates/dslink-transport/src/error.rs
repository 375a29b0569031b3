//! Transport errors.

use std::io;

use dslink_core::envelope::ProtocolError;
use thiserror::Error;

/// Transport error.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Cannot resolve {addr}: {source}")]
    Resolve { addr: String, source: io::Error },
    #[error("No address found for {0}")]
    Unresolved(String),
    #[error("Cannot bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },
    #[error("Send failed: {0}")]
    Send(io::Error),
    #[error("Receive failed: {0}")]
    Recv(io::Error),
    #[error("Encode failed: {0}")]
    Encode(#[from] ProtocolError),
}

impl TransportError {
    /// Whether this error comes from the socket and needs a restart.
    ///
    /// Encode failures concern one envelope only.
    #[must_use]
    pub const fn is_socket_fault(&self) -> bool {
        !matches!(self, Self::Encode(_))
    }
}
