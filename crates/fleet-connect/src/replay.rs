//! Replay of captured streams
//!
//! `file:<path>` and `serial+replay:<path>` read a capture file as if it
//! were a live link. Writes are discarded. Unless `autoclose=1` is given the
//! connection stays open after the end of the file, like an idle radio.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tracing::info;

use crate::error::ConnectError;
use crate::spec::ConnectionSpec;
use crate::{BoxFuture, Connection, ConnectionIo};

/// Connection replaying a capture file
#[derive(Debug)]
pub struct ReplayConnection {
    spec: String,
    path: String,
    autoclose: bool,
}

impl ReplayConnection {
    /// Create a replay connection from a parsed `file:` or `serial+replay:` spec
    pub fn from_spec(spec: &ConnectionSpec) -> Self {
        Self {
            spec: spec.as_str().to_string(),
            path: spec.target().to_string(),
            autoclose: spec.flag("autoclose"),
        }
    }

    /// Whether the connection closes at the end of the file
    pub fn autoclose(&self) -> bool {
        self.autoclose
    }
}

impl Connection for ReplayConnection {
    fn spec(&self) -> &str {
        &self.spec
    }

    fn open(&self) -> BoxFuture<'_, Result<ConnectionIo, ConnectError>> {
        Box::pin(async move {
            let file = File::open(&self.path).await?;
            info!("Replaying {}", self.path);
            let writer = tokio::io::sink();
            if self.autoclose {
                Ok(ConnectionIo::new(file, writer))
            } else {
                Ok(ConnectionIo::new(file.chain(Idle), writer))
            }
        })
    }
}

/// Reader that never yields any data and never reaches end of stream
#[derive(Debug, Clone, Copy, Default)]
pub struct Idle;

impl AsyncRead for Idle {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn capture(name: &str, contents: &[u8]) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("fleet-connect-{}-{}", std::process::id(), name));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[tokio::test]
    async fn test_replay_with_autoclose() {
        let path = capture("autoclose", b"\xfe\x09abc");
        let spec = ConnectionSpec::parse(&format!("file:{}?autoclose=1", path.display())).unwrap();
        let conn = ReplayConnection::from_spec(&spec);
        assert!(conn.autoclose());

        let mut io = conn.open().await.unwrap();
        let mut data = Vec::new();
        io.reader.read_to_end(&mut data).await.unwrap();
        assert_eq!(data, b"\xfe\x09abc");
        std::fs::remove_file(path).ok();
    }

    #[tokio::test]
    async fn test_replay_stays_open() {
        let path = capture("idle", b"xyz");
        let spec = ConnectionSpec::parse(&format!("serial+replay:{}", path.display())).unwrap();
        let mut io = ReplayConnection::from_spec(&spec).open().await.unwrap();

        let mut buf = [0u8; 3];
        io.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"xyz");

        let mut more = [0u8; 1];
        let result = tokio::time::timeout(Duration::from_millis(50), io.reader.read(&mut more)).await;
        assert!(result.is_err(), "reader should stay pending after end of file");
        std::fs::remove_file(path).ok();
    }
}
