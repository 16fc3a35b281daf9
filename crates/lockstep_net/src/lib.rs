//! # Lockstep Net
//!
//! Packet transport and the session runtime for lock-step peers.
//!
//! Packets travel as length-prefixed frames over any tokio byte stream.
//! [`AsyncChannel`](async_channel::AsyncChannel) queues outgoing packets
//! for a single sender task; [`Session`](session::Session) drives a
//! simulation context with them.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

pub mod async_channel;
pub mod channel;
pub mod codec;
pub mod error;
pub mod packet;
pub mod session;

pub use async_channel::{AsyncChannel, PacketReceiver};
pub use channel::Channel;
pub use error::{NetError, Result};
pub use packet::{Message, NetworkKey, Packet};
pub use session::{EndReason, Session, SessionHandle, SessionSummary, CHECKPOINT_INTERVAL};
