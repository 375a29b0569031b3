//! UDP uplink to the remote monitor.
//!
//! The socket is left unconnected: envelopes go out with `send_to` and replies
//! are read with `recv_from`, so an unreachable monitor does not surface as
//! receive errors.

use std::{net::SocketAddr, sync::Arc};

use dslink_core::envelope::{self, Envelope};
use tokio::{net::UdpSocket, sync::mpsc};
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;

/// Largest datagram the receive loop accepts.
pub const MAX_DATAGRAM: usize = 65_535;

/// Sends envelopes to the monitor and receives its replies.
pub struct Uplink {
    socket: UdpSocket,
    remote: SocketAddr,
}

impl Uplink {
    /// Resolve the monitor address and bind an ephemeral local socket.
    ///
    /// # Errors
    /// Returns error if the address does not resolve or the socket cannot bind.
    pub async fn connect(monitor: &str) -> Result<Self, TransportError> {
        let remote = tokio::net::lookup_host(monitor)
            .await
            .map_err(|source| TransportError::Resolve {
                addr: monitor.to_string(),
                source,
            })?
            .next()
            .ok_or_else(|| TransportError::Unresolved(monitor.to_string()))?;

        let local = if remote.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|source| TransportError::Bind {
                addr: local.to_string(),
                source,
            })?;

        tracing::info!(%remote, local = ?socket.local_addr().ok(), "Uplink ready");
        Ok(Self { socket, remote })
    }

    #[must_use]
    pub const fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Local socket address.
    ///
    /// # Errors
    /// Returns error if the socket has no local address.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Encode and send one envelope.
    ///
    /// # Errors
    /// Returns [`TransportError::Encode`] for an unencodable envelope and
    /// [`TransportError::Send`] for a socket failure.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let datagram = envelope.encode()?;
        self.socket
            .send_to(&datagram, self.remote)
            .await
            .map_err(TransportError::Send)?;
        tracing::trace!(opcode = %envelope.opcode, len = datagram.len(), "Envelope sent");
        Ok(())
    }

    /// Receive envelopes until cancelled.
    ///
    /// Only datagrams from the monitor address are accepted; anything else,
    /// and any malformed datagram, is logged and dropped. Returns `Ok` when cancelled
    /// or when the inbound receiver is gone.
    ///
    /// # Errors
    /// Returns [`TransportError::Recv`] on a socket failure.
    pub async fn receive_loop(
        self: Arc<Self>,
        inbound: mpsc::Sender<Envelope>,
        cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, from) = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                result = self.socket.recv_from(&mut buf) => result.map_err(TransportError::Recv)?,
            };

            if from != self.remote {
                tracing::debug!(%from, len, "Ignoring datagram from unknown sender");
                continue;
            }

            let envelope = match envelope::decode(&buf[..len]) {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::warn!(%from, len, "Invalid envelope: {e}");
                    continue;
                }
            };
            tracing::trace!(%from, opcode = %envelope.opcode, "Envelope received");

            if inbound.send(envelope).await.is_err() {
                return Ok(());
            }
        }
    }
}
