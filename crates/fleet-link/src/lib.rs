//! Fleet Link Library
//!
//! This crate multiplexes the links between a ground station and its fleet:
//!
//! - [`CommunicationManager`] registers named connections, runs one
//!   supervised task per link and merges everything they decode into a
//!   single inbound stream of [`InboundEnvelope`]s
//! - [`Dispatcher`] routes envelopes to handlers by message type and mutes
//!   unknown types after warning about them once
//! - [`Expectations`] lets a caller wait for the reply to a request
//! - [`Supervisor`] implementations decide what happens when a link fails
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use fleet_connect::create_connection;
//! use fleet_link::{CommunicationManager, Dispatcher, RestartWithBackoff};
//! use fleet_protocol::mavlink::MavlinkCodec;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = CommunicationManager::new(MavlinkCodec::default());
//! manager.add(create_connection("udp:0.0.0.0:14550")?, "wifi")?;
//!
//! let dispatcher = Arc::new(Dispatcher::new());
//! dispatcher.ignore("ATTITUDE");
//!
//! manager
//!     .run(
//!         move |inbound| async move { dispatcher.run(inbound).await },
//!         &RestartWithBackoff::default(),
//!         CancellationToken::new(),
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod expect;
mod link;
pub mod manager;
pub mod supervisor;

pub use dispatch::{Dispatcher, HandlerResult};
pub use envelope::InboundEnvelope;
pub use error::{LinkError, LinkFailure};
pub use expect::{Expectation, Expectations};
pub use link::LinkRole;
pub use manager::{CommunicationManager, InboundReceiver};
pub use supervisor::{LogAndStop, RestartWithBackoff, StopOnFailure, Supervisor, TaskFactory, TaskFuture};
