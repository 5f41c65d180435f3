//! UDP transport for filter protocol messages.
//!
//! A single socket carries all peer traffic; there are no sessions. The
//! receive loop runs as a spawned task and hands raw datagrams to the
//! daemon over a channel, so message decoding and protocol decisions stay
//! out of the socket path.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::protocol::{FilterMessage, ProtocolError, MAX_DATAGRAM};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("bind failed: {0}")]
    Bind(std::io::Error),

    #[error("send failed: {0}")]
    Send(std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// One raw datagram off the wire.
#[derive(Debug)]
pub struct ReceivedDatagram {
    pub from: SocketAddr,
    pub data: Vec<u8>,
}

/// Bound UDP endpoint for the filter protocol.
pub struct FilterTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    port: u16,
    recv_task: JoinHandle<()>,
}

impl FilterTransport {
    /// Bind `addr` and start the receive loop, delivering datagrams to
    /// the returned channel. The loop exits when the receiver is dropped.
    pub async fn bind(
        addr: SocketAddr,
        channel_capacity: usize,
    ) -> Result<(Self, mpsc::Receiver<ReceivedDatagram>), TransportError> {
        let socket = UdpSocket::bind(addr).await.map_err(TransportError::Bind)?;
        let local_addr = socket.local_addr().map_err(TransportError::Bind)?;
        let socket = Arc::new(socket);

        let (tx, rx) = mpsc::channel(channel_capacity);
        let recv_task = tokio::spawn(receive_loop(socket.clone(), tx));

        info!(%local_addr, "filter transport started");
        Ok((
            Self {
                socket,
                local_addr,
                port: local_addr.port(),
                recv_task,
            },
            rx,
        ))
    }

    /// The address the socket actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Encode and send one message to an explicit socket address.
    pub async fn send_message(
        &self,
        msg: &FilterMessage,
        to: SocketAddr,
    ) -> Result<(), TransportError> {
        let data = msg.encode()?;
        self.socket
            .send_to(&data, to)
            .await
            .map_err(TransportError::Send)?;

        debug!(%to, kind = %msg.message_type(), bytes = data.len(), "message sent");
        Ok(())
    }

    /// Send to a bare host address on the port this endpoint is bound to.
    /// All nodes listen on the same well-known port, so the peer address
    /// alone identifies the destination.
    pub async fn send_to_host(
        &self,
        msg: &FilterMessage,
        host: Ipv4Addr,
    ) -> Result<(), TransportError> {
        self.send_message(msg, SocketAddr::from((host, self.port))).await
    }
}

impl Drop for FilterTransport {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}

async fn receive_loop(socket: Arc<UdpSocket>, tx: mpsc::Sender<ReceivedDatagram>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                debug!(%from, bytes = len, "datagram received");
                let datagram = ReceivedDatagram {
                    from,
                    data: buf[..len].to_vec(),
                };
                if tx.send(datagram).await.is_err() {
                    info!("datagram channel closed, stopping receive loop");
                    break;
                }
            }
            // Transient; ICMP unreachables surface here on some platforms.
            Err(e) => warn!(error = %e, "receive error"),
        }
    }
}
