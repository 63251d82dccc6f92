//! Network connections
//!
//! - `tcp:<host>:<port>` connects to a TCP server
//! - `udp:<bind-host>:<port>` listens for datagrams and replies to the peer
//!   that sent the most recent one

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, info, trace, warn};

use crate::error::ConnectError;
use crate::{BoxFuture, Connection, ConnectionIo};

/// Largest datagram accepted on a UDP connection
const MAX_DATAGRAM_LEN: usize = 65_507;

/// Buffer size of the in-process pipe behind a UDP connection
const UDP_PIPE_CAPACITY: usize = 64 * 1024;

/// Outbound TCP connection
#[derive(Debug)]
pub struct TcpConnection {
    spec: String,
    address: String,
}

impl TcpConnection {
    /// Create a connection to `address` (`host:port`)
    pub fn new(spec: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            spec: spec.into(),
            address: address.into(),
        }
    }
}

impl Connection for TcpConnection {
    fn spec(&self) -> &str {
        &self.spec
    }

    fn open(&self) -> BoxFuture<'_, Result<ConnectionIo, ConnectError>> {
        Box::pin(async move {
            debug!("Connecting to {}", self.address);
            let stream = TcpStream::connect(&self.address).await?;
            stream.set_nodelay(true)?;
            info!("Connected to {}", self.address);
            let (reader, writer) = stream.into_split();
            Ok(ConnectionIo::new(reader, writer))
        })
    }
}

/// Listening UDP connection
///
/// Datagrams are exposed as a byte stream. Writes are sent to the most
/// recent sender; writes before any datagram arrived are discarded.
#[derive(Debug)]
pub struct UdpConnection {
    spec: String,
    bind_address: String,
}

impl UdpConnection {
    /// Create a connection listening on `bind_address` (`host:port`)
    pub fn new(spec: impl Into<String>, bind_address: impl Into<String>) -> Self {
        Self {
            spec: spec.into(),
            bind_address: bind_address.into(),
        }
    }
}

impl Connection for UdpConnection {
    fn spec(&self) -> &str {
        &self.spec
    }

    fn open(&self) -> BoxFuture<'_, Result<ConnectionIo, ConnectError>> {
        Box::pin(async move {
            let socket = UdpSocket::bind(&self.bind_address).await?;
            info!("Listening for datagrams on {}", socket.local_addr()?);

            let (local, remote) = tokio::io::duplex(UDP_PIPE_CAPACITY);
            tokio::spawn(pump_datagrams(socket, remote));

            let (reader, writer) = tokio::io::split(local);
            Ok(ConnectionIo::new(reader, writer))
        })
    }
}

/// Shuttle datagrams between the socket and the pipe until either side closes
async fn pump_datagrams(socket: UdpSocket, mut pipe: DuplexStream) {
    let mut datagram = vec![0u8; MAX_DATAGRAM_LEN];
    let mut outbound = vec![0u8; UDP_PIPE_CAPACITY];
    let mut peer: Option<SocketAddr> = None;

    loop {
        tokio::select! {
            result = socket.recv_from(&mut datagram) => match result {
                Ok((n, from)) => {
                    if peer != Some(from) {
                        debug!("UDP peer is now {}", from);
                        peer = Some(from);
                    }
                    if pipe.write_all(&datagram[..n]).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    // ICMP port unreachable surfaces here on some platforms
                    trace!("UDP receive error: {}", e);
                }
            },
            result = pipe.read(&mut outbound) => match result {
                Ok(0) | Err(_) => break,
                Ok(n) => match peer {
                    Some(to) => {
                        if let Err(e) = socket.send_to(&outbound[..n], to).await {
                            warn!("UDP send to {} failed: {}", to, e);
                        }
                    }
                    None => trace!("Dropping {} bytes, no UDP peer yet", n),
                },
            },
        }
    }
    debug!("UDP pump stopped");
}
