//! Channel registry for producer/consumer routing
//!
//! The registry binds at most one producer per channel to a set of consumers.
//! Each connection is represented by a [`Link`]; the connection task owns the
//! matching [`LinkReceiver`] and drains it onto the socket.
//!
//! # Architecture
//!
//! ```text
//!                          Arc<ChannelRegistry>
//!                     ┌─────────────────────────┐
//!                     │ channels: HashMap<Id,   │
//!                     │   ChannelEntry {        │
//!                     │     producer,           │
//!                     │     consumers,          │
//!                     │     latest frame,       │
//!                     │   }                     │
//!                     │ >                       │
//!                     └───────────┬─────────────┘
//!                                 │
//!         ┌───────────────────────┼───────────────────────┐
//!         │                       │                       │
//!         ▼                       ▼                       ▼
//!     [Producer]              [Consumer]              [Consumer]
//!     socket.recv()           outbound.recv()         outbound.recv()
//!         │                       │                       │
//!         └──► relay.publish() ──► try_send() ──────────► socket
//! ```
//!
//! # Zero-Copy Design
//!
//! Frames are `bytes::Bytes`, so every consumer queue holds a reference to the
//! same allocation. Queues are bounded; a consumer whose queue is full simply
//! misses that frame.

pub mod config;
pub mod entry;
pub mod error;
pub mod frame;
pub mod link;
pub mod store;

pub use config::RegistryConfig;
pub use entry::{ChannelEntry, ChannelSnapshot};
pub use error::RegistryError;
pub use frame::{ChannelId, DecodedFrame, Frame, PixelFormat, Resolution, MAX_CHANNEL_ID_LEN};
pub use link::{
    CloseReason, Delivery, Link, LinkEvent, LinkId, LinkReceiver, Liveness, Notice, Outbound,
    Role, SendFailure,
};
pub use store::{ChannelRegistry, ConsumerRegistration, ProducerRegistration, Removal, RemovalCause};
