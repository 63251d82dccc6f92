//! Fleet Connection Library
//!
//! This crate provides the byte-stream connections that fleet links and
//! correction sources run over:
//!
//! - **Serial ports** via `tokio-serial`
//! - **TCP** client connections
//! - **UDP** listeners that reply to the most recent peer
//! - **Replay** of captured streams from files
//! - **In-memory** duplex pipes for tests and simulations
//!
//! Connections are described by spec strings (see [`spec`]) and created with
//! [`create_connection`]. A [`Connection`] is only a description; every call
//! to [`Connection::open`] yields a fresh pair of stream halves, so that a
//! supervisor can reopen a link after a failure.
//!
//! # Example
//!
//! ```rust,no_run
//! use fleet_connect::create_connection;
//!
//! # async fn demo() -> Result<(), fleet_connect::ConnectError> {
//! let conn = create_connection("tcp:127.0.0.1:5760")?;
//! let io = conn.open().await?;
//! # drop(io);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncWrite};

pub mod error;
pub mod memory;
pub mod net;
pub mod ports;
pub mod replay;
pub mod serial;
pub mod spec;

pub use error::ConnectError;
pub use memory::MemoryConnection;
pub use net::{TcpConnection, UdpConnection};
pub use ports::{PortScanner, SerialPortInfo};
pub use replay::ReplayConnection;
pub use serial::{SerialConnection, SerialSettings};
pub use spec::{format_spec, ConnectionSpec};

/// Boxed future returned by [`Connection::open`]
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Read half of an open connection
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
/// Write half of an open connection
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The two halves of an open connection
///
/// Dropping both halves closes the connection.
pub struct ConnectionIo {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
}

impl ConnectionIo {
    /// Bundle a reader and a writer
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

impl fmt::Debug for ConnectionIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionIo").finish_non_exhaustive()
    }
}

/// A reopenable byte-stream connection
pub trait Connection: Send + Sync + fmt::Debug {
    /// The spec this connection was created from
    fn spec(&self) -> &str;

    /// Open the connection
    fn open(&self) -> BoxFuture<'_, Result<ConnectionIo, ConnectError>>;
}

/// Create a connection from a spec string
///
/// Supported schemes: `serial`, `tcp`, `udp`, `file` and `serial+replay`.
pub fn create_connection(spec: &str) -> Result<Box<dyn Connection>, ConnectError> {
    let parsed = ConnectionSpec::parse(spec)?;
    let conn: Box<dyn Connection> = match parsed.scheme() {
        "serial" => Box::new(SerialConnection::from_spec(&parsed)?),
        "tcp" => Box::new(TcpConnection::new(spec, parsed.target())),
        "udp" => Box::new(UdpConnection::new(spec, parsed.target())),
        "file" | "serial+replay" => Box::new(ReplayConnection::from_spec(&parsed)),
        other => return Err(ConnectError::UnsupportedScheme(other.to_string())),
    };
    tracing::debug!("Created connection for {}", spec);
    Ok(conn)
}

/// Creates connections from spec strings
///
/// Lets callers that open many connections (such as correction sources)
/// substitute their own constructor in tests.
pub trait ConnectionFactory: Send + Sync {
    /// Create a connection for `spec`
    fn create(&self, spec: &str) -> Result<Box<dyn Connection>, ConnectError>;
}

/// Factory backed by [`create_connection`]
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConnectionFactory;

impl ConnectionFactory for DefaultConnectionFactory {
    fn create(&self, spec: &str) -> Result<Box<dyn Connection>, ConnectError> {
        create_connection(spec)
    }
}

impl<F> ConnectionFactory for F
where
    F: Fn(&str) -> Result<Box<dyn Connection>, ConnectError> + Send + Sync,
{
    fn create(&self, spec: &str) -> Result<Box<dyn Connection>, ConnectError> {
        self(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_known_schemes() {
        for spec in [
            "serial:/dev/ttyUSB0?baud=115200",
            "tcp:127.0.0.1:5760",
            "udp:0.0.0.0:14550",
            "file:/tmp/capture.bin?autoclose=1",
            "serial+replay:/tmp/capture.bin",
        ] {
            let conn = create_connection(spec).unwrap();
            assert_eq!(conn.spec(), spec);
        }
    }

    #[test]
    fn test_unsupported_scheme() {
        assert!(matches!(
            create_connection("bluetooth:00:11:22:33:44:55"),
            Err(ConnectError::UnsupportedScheme(s)) if s == "bluetooth"
        ));
    }

    #[test]
    fn test_invalid_serial_parameters_fail_early() {
        assert!(matches!(
            create_connection("serial:/dev/ttyUSB0?baud=abc"),
            Err(ConnectError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_closure_factory() {
        let factory = |spec: &str| -> Result<Box<dyn Connection>, ConnectError> {
            Ok(Box::new(MemoryConnection::new(spec)))
        };
        let conn = factory.create("mem:test").unwrap();
        assert_eq!(conn.spec(), "mem:test");
    }
}
