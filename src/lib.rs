//! # headlink
//!
//! Packet framing and session multiplexing for mobile ↔ head-unit RPC links.
//!
//! A single unreliable byte stream (Bluetooth SPP, USB accessory, TCP) is
//! shared by multiple logical sessions, one per client application and
//! further split by service type. This crate owns the byte-level packet
//! state machine, the outgoing packet codec with MTU fragmentation, the
//! reader/writer pump bound to the stream, and the session router that keeps
//! ordering and single-writer discipline across sessions.
//!
//! ## Architecture
//!
//! - **Inbound**: raw bytes → [`PacketStateMachine`](protocol::PacketStateMachine)
//!   → [`Packet`](protocol::Packet) → [`SessionRouter`](router::SessionRouter)
//!   → the owning session's event channel
//! - **Outbound**: `send` → [`PacketCodec`](protocol::PacketCodec) → router
//!   write FIFO → writer task → raw bytes
//!
//! RPC message schemas and their serialization live above this layer;
//! physical transports live below it and appear here only as
//! `AsyncRead + AsyncWrite` streams.

pub mod error;
pub mod link;
pub mod protocol;
pub mod pump;
pub mod router;
pub mod transport;

pub use error::{LinkError, Result};
pub use link::{Link, LinkBuilder, LinkConfig, LinkStats};
pub use protocol::{FrameType, ProtocolVersion, ServiceType};
pub use router::{EndReason, PendingRegistration, SessionEvent, SessionHandle};
