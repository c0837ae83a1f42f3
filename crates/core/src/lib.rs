//! `courier-core`: message primitives shared by every courier crate.
//!
//! This crate contains **pure data** (no IO, no async): identifiers, header names,
//! message shapes and the bus-wide error type.

pub mod error;
pub mod headers;
pub mod id;
pub mod message;

pub use error::{BusError, BusResult};
pub use headers::Headers;
pub use id::MessageId;
pub use message::{FailedMessage, LogicalMessage, Message, TransportMessage};
