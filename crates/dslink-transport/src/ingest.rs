//! Telemetry ingest: local datagrams in, TELEMETRY envelopes out.

use std::{net::SocketAddr, sync::Arc};

use dslink_core::{
    envelope::{Envelope, Opcode},
    traits::TelemetryDecoder,
};
use dslink_session::SessionManager;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::{error::TransportError, uplink::{MAX_DATAGRAM, Uplink}};

/// Listens for telemetry frames and relays them over the uplink.
///
/// Frames are relayed as they arrive; nothing is queued.
pub struct TelemetryIngest {
    socket: UdpSocket,
    decoder: Arc<dyn TelemetryDecoder>,
}

impl TelemetryIngest {
    /// Bind the local telemetry listener.
    ///
    /// # Errors
    /// Returns error if the address cannot be bound.
    pub async fn bind(addr: &str, decoder: Arc<dyn TelemetryDecoder>) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        tracing::info!(local = ?socket.local_addr().ok(), "Telemetry ingest listening");
        Ok(Self { socket, decoder })
    }

    /// Local socket address.
    ///
    /// # Errors
    /// Returns error if the socket has no local address.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Relay frames until cancelled.
    ///
    /// Undecodable frames and unencodable messages are logged and dropped.
    ///
    /// # Errors
    /// Returns error on a receive or send socket failure.
    pub async fn run(
        self,
        uplink: Arc<Uplink>,
        session: Arc<SessionManager>,
        cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let len = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                result = self.socket.recv_from(&mut buf) => result.map_err(TransportError::Recv)?.0,
            };

            let messages = match self.decoder.decode(&buf[..len]) {
                Ok(messages) => messages,
                Err(e) => {
                    tracing::warn!(len, "Dropping telemetry frame: {e}");
                    continue;
                }
            };

            for message in messages {
                let token = session.token().await;
                let envelope = match Envelope::from_payload(Opcode::Telemetry, token, &message) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        tracing::warn!(header = %message.header, "Dropping telemetry message: {e}");
                        continue;
                    }
                };
                match uplink.send(&envelope).await {
                    Ok(()) => {}
                    Err(e) if e.is_socket_fault() => return Err(e),
                    Err(e) => tracing::warn!(header = %message.header, "Dropping telemetry message: {e}"),
                }
            }
        }
    }
}
