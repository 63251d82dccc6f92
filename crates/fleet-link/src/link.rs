//! A single named link
//!
//! Each connection attempt runs two loops side by side in the same task:
//! - the read loop feeds bytes through a fresh parser and publishes every
//!   decoded message on the shared inbound stream
//! - the write loop drains the link's outbound queue into the connection
//!
//! Every attempt owns its outbound queue. When the attempt ends, however it
//! ends, the queue is dropped with it and every frame still waiting in it is
//! answered as not sent.

use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use fleet_connect::{BoxedReader, BoxedWriter, Connection};
use fleet_protocol::{CodecFactory, Encoder, Parser};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace};

use crate::envelope::InboundEnvelope;
use crate::error::{LinkError, LinkFailure};

const READ_BUFFER_SIZE: usize = 4096;
const OUTBOUND_QUEUE_SIZE: usize = 64;

/// Role of a link within its manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    /// The first registered link; the only one used for sending
    Primary,
    Secondary,
}

/// An encoded frame waiting to be written, with the channel for the result
struct OutboundFrame {
    bytes: Vec<u8>,
    ack: oneshot::Sender<Result<(), LinkFailure>>,
}

pub(crate) struct Link<C: CodecFactory> {
    name: Arc<str>,
    role: LinkRole,
    connection: Box<dyn Connection>,
    encoder: Mutex<C::Encoder>,
    /// Outbound queue of the current attempt, present while connected
    outbound: Mutex<Option<mpsc::Sender<OutboundFrame>>>,
}

/// Publishes an attempt's outbound queue and withdraws it when dropped
struct AttemptGuard<'a>(&'a Mutex<Option<mpsc::Sender<OutboundFrame>>>);

impl<'a> AttemptGuard<'a> {
    fn publish(
        slot: &'a Mutex<Option<mpsc::Sender<OutboundFrame>>>,
        sender: mpsc::Sender<OutboundFrame>,
    ) -> Self {
        *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(sender);
        Self(slot)
    }
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl<C: CodecFactory> Link<C> {
    pub(crate) fn new(
        name: &str,
        role: LinkRole,
        connection: Box<dyn Connection>,
        encoder: C::Encoder,
    ) -> Self {
        Self {
            name: Arc::from(name),
            role,
            connection,
            encoder: Mutex::new(encoder),
            outbound: Mutex::new(None),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn role(&self) -> LinkRole {
        self.role
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.outbound_queue().is_some()
    }

    fn outbound_queue(&self) -> Option<mpsc::Sender<OutboundFrame>> {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Encode `message` and write it to the open connection
    pub(crate) async fn send(&self, message: &C::Outbound) -> Result<(), LinkError> {
        let Some(queue) = self.outbound_queue() else {
            return Err(LinkError::LinkNotConnected(self.name.to_string()));
        };

        let bytes = self
            .encoder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .encode(message)
            .map_err(|e| self.failure(LinkFailure::Encode(e)))?;

        let (ack, done) = oneshot::channel();
        queue
            .send(OutboundFrame { bytes, ack })
            .await
            .map_err(|_| LinkError::LinkNotConnected(self.name.to_string()))?;

        match done.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(failure)) => Err(self.failure(failure)),
            // The attempt ended before the frame was written
            Err(_) => Err(LinkError::LinkNotConnected(self.name.to_string())),
        }
    }

    fn failure(&self, failure: LinkFailure) -> LinkError {
        LinkError::Failure {
            link: self.name.to_string(),
            failure,
        }
    }

    /// Run one connection attempt until it fails
    pub(crate) async fn run_once(
        self: Arc<Self>,
        codec: Arc<C>,
        inbound: mpsc::Sender<InboundEnvelope<C::Inbound>>,
    ) -> Result<(), LinkFailure> {
        let io = self.connection.open().await?;
        let (queue, mut outbound) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
        let attempt = AttemptGuard::publish(&self.outbound, queue);
        info!(link = %self.name, "Link connected via {}", self.connection.spec());

        let result = tokio::try_join!(
            self.read_loop(io.reader, codec.create_parser(), inbound),
            self.write_loop(io.writer, &mut outbound),
        );

        // Withdraw the queue first so no new frame lands in it, then close it.
        // Dropping a pending frame drops its ack, which the sender sees as
        // `LinkNotConnected`.
        drop(attempt);
        outbound.close();
        while outbound.try_recv().is_ok() {}

        info!(link = %self.name, "Link disconnected");
        result.map(|_| ())
    }

    async fn read_loop(
        &self,
        mut reader: BoxedReader,
        mut parser: C::Parser,
        inbound: mpsc::Sender<InboundEnvelope<C::Inbound>>,
    ) -> Result<(), LinkFailure> {
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let n = reader.read(&mut buffer).await?;
            if n == 0 {
                return Err(LinkFailure::Closed);
            }
            trace!(link = %self.name, "Read {} bytes: {:02X?}", n, &buffer[..n]);

            for message in parser.parse(&buffer[..n]) {
                let envelope = InboundEnvelope::new(self.name.clone(), message);
                inbound
                    .send(envelope)
                    .await
                    .map_err(|_| LinkFailure::InboundClosed)?;
            }
        }
    }

    async fn write_loop(
        &self,
        mut writer: BoxedWriter,
        outbound: &mut mpsc::Receiver<OutboundFrame>,
    ) -> Result<(), LinkFailure> {
        while let Some(frame) = outbound.recv().await {
            match write_frame(&mut writer, &frame.bytes).await {
                Ok(()) => {
                    debug!(link = %self.name, "Sent {} bytes", frame.bytes.len());
                    let _ = frame.ack.send(Ok(()));
                }
                Err(e) => {
                    let copy = io::Error::new(e.kind(), e.to_string());
                    let _ = frame.ack.send(Err(LinkFailure::Io(copy)));
                    return Err(LinkFailure::Io(e));
                }
            }
        }
        Ok(())
    }
}

async fn write_frame(writer: &mut BoxedWriter, bytes: &[u8]) -> io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}
