//! Error types for the communication manager

use fleet_connect::ConnectError;
use fleet_protocol::{EncodeError, MessageTypeKey};
use thiserror::Error;

/// Runtime failure of a single link, handed to its supervisor
#[derive(Debug, Error)]
pub enum LinkFailure {
    /// The connection could not be opened
    #[error("failed to open connection: {0}")]
    Connect(#[from] ConnectError),

    /// Read or write error on an open connection
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The remote end closed the connection
    #[error("connection closed")]
    Closed,

    /// An outbound message could not be encoded
    #[error("failed to encode message: {0}")]
    Encode(#[from] EncodeError),

    /// Nobody is consuming inbound messages any more
    #[error("inbound stream closed")]
    InboundClosed,
}

impl LinkFailure {
    /// Whether restarting the link could make the failure go away
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, LinkFailure::InboundClosed)
    }
}

/// Errors reported by the communication manager
#[derive(Debug, Error)]
pub enum LinkError {
    /// A link with this name is already registered
    #[error("link already registered: {0}")]
    DuplicateLink(String),

    /// No link has been registered yet
    #[error("no primary link registered")]
    NoPrimaryLink,

    /// The manager is running and its link set is frozen
    #[error("communication manager is already running")]
    AlreadyRunning,

    /// The link exists but its connection is not open
    #[error("link {0} is not connected")]
    LinkNotConnected(String),

    /// No matching reply arrived in time
    #[error("no {0} reply received in time")]
    ResponseTimeout(MessageTypeKey),

    /// The inbound stream stopped while a reply was awaited
    #[error("stopped waiting for {0} reply")]
    ResponseAbandoned(MessageTypeKey),

    /// A link failed and its supervisor did not absorb the failure
    #[error("link {link} failed: {failure}")]
    Failure {
        link: String,
        #[source]
        failure: LinkFailure,
    },
}
