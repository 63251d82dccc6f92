//! In-process connections backed by `tokio::io::duplex`
//!
//! Used wherever a link has to be driven without hardware, most notably in
//! tests. Every [`MemoryConnection::attach`] queues one stream for a future
//! `open()` and hands back the far end of it.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::io::DuplexStream;

use crate::error::ConnectError;
use crate::{BoxFuture, Connection, ConnectionIo};

const DEFAULT_CAPACITY: usize = 4096;

/// Connection backed by in-memory pipes
#[derive(Debug)]
pub struct MemoryConnection {
    spec: String,
    capacity: usize,
    pending: Mutex<VecDeque<DuplexStream>>,
}

impl MemoryConnection {
    /// Create a connection with no streams attached
    pub fn new(spec: impl Into<String>) -> Self {
        Self::with_capacity(spec, DEFAULT_CAPACITY)
    }

    /// Create a connection whose pipes buffer up to `capacity` bytes
    pub fn with_capacity(spec: impl Into<String>, capacity: usize) -> Self {
        Self {
            spec: spec.into(),
            capacity,
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Create a connection with one stream attached, returning the far end
    pub fn pair(spec: impl Into<String>) -> (Self, DuplexStream) {
        let conn = Self::new(spec);
        let remote = conn.attach();
        (conn, remote)
    }

    /// Queue a stream for the next `open()` and return its far end
    pub fn attach(&self) -> DuplexStream {
        let (local, remote) = tokio::io::duplex(self.capacity);
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(local);
        remote
    }

    /// Number of streams waiting to be opened
    pub fn pending(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Connection for MemoryConnection {
    fn spec(&self) -> &str {
        &self.spec
    }

    fn open(&self) -> BoxFuture<'_, Result<ConnectionIo, ConnectError>> {
        let next = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        Box::pin(async move {
            let stream = next.ok_or_else(|| ConnectError::Unavailable(self.spec.clone()))?;
            let (reader, writer) = tokio::io::split(stream);
            Ok(ConnectionIo::new(reader, writer))
        })
    }
}
