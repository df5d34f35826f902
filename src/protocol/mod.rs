//! Protocol module - wire format, packet framing, and fragmentation.
//!
//! This module implements the byte-level protocol of the link:
//! - per-version header layout table and field constants
//! - [`Packet`] with typed accessors and byte-exact encoding
//! - [`PacketStateMachine`], the byte-at-a-time stream parser
//! - [`PacketCodec`], the outgoing packet builder with MTU fragmentation

mod codec;
mod packet;
mod psm;
mod wire;

pub use codec::{first_frame_payload, parse_first_frame_payload, PacketCodec};
pub use packet::{Packet, PacketHeader};
pub use psm::{PacketStateMachine, PsmState};
pub use wire::{
    control, next_consecutive_info, pack_frame_byte, unpack_frame_byte, FrameType, HeaderLayout,
    ProtocolVersion, ServiceType, ABSOLUTE_MAX_DATA_LENGTH, DEFAULT_V3_MAX_PAYLOAD,
    FIRST_FRAME_DATA_LENGTH, FRAME_INFO_FINAL_CONSECUTIVE, FRAME_INFO_INITIAL_CONSECUTIVE,
    FRAME_INFO_RESERVED, LEGACY_FRAME_SIZE, MAX_HEADER_SIZE,
};
