//! Wire format constants and the per-version header layout table.
//!
//! Packet header layout (versions 2..=5, 12 bytes):
//! ```text
//! ┌─────────────────────┬─────────┬────────┬─────────┬──────────┬──────────┐
//! │ ver(4) res(1) ft(3) │ Service │ Info   │ Session │ Length   │ Msg ID   │
//! │ 1 byte              │ 1 byte  │ 1 byte │ 1 byte  │ 4 bytes  │ 4 bytes  │
//! │                     │         │        │         │ uint32 BE│ uint32 BE│
//! └─────────────────────┴─────────┴────────┴─────────┴──────────┴──────────┘
//! ```
//!
//! Version 1 uses the same layout without the trailing message id (8 bytes).
//! The layout is looked up through [`ProtocolVersion::layout`] rather than
//! hard-coded, since header widths differ per negotiated version.

/// Largest header across all supported versions.
pub const MAX_HEADER_SIZE: usize = 12;

/// Mandatory data length of a FIRST frame payload: total size + frame count.
pub const FIRST_FRAME_DATA_LENGTH: u32 = 8;

/// Upper bound on a single frame's declared data length. Anything larger is
/// treated as framing noise, not a real packet.
pub const ABSOLUTE_MAX_DATA_LENGTH: u32 = 2 * 1024 * 1024;

/// Frame payload budget for versions 1 and 2 (fixed 1500-byte frames).
pub const LEGACY_FRAME_SIZE: usize = 1500;

/// Default negotiated payload budget for versions 3 and up.
pub const DEFAULT_V3_MAX_PAYLOAD: usize = 131_072;

/// How a packet relates to the logical message it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Session control traffic (start/ack/nack/end/heartbeat).
    Control = 0x00,
    /// A complete message in one frame.
    Single = 0x01,
    /// Opens a fragmented transfer; payload declares total size + frame count.
    First = 0x02,
    /// One chunk of a fragmented transfer.
    Consecutive = 0x03,
}

impl FrameType {
    /// Decode the 3-bit frame type field. Values 4..=7 are unassigned.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(FrameType::Control),
            0x01 => Some(FrameType::Single),
            0x02 => Some(FrameType::First),
            0x03 => Some(FrameType::Consecutive),
            _ => None,
        }
    }
}

/// The purpose of a session's traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ServiceType {
    /// Link-level control. Only valid with [`FrameType::Control`].
    Control = 0x00,
    /// RPC request/response traffic.
    Rpc = 0x07,
    /// Streaming audio.
    Audio = 0x0A,
    /// Streaming video.
    Video = 0x0B,
    /// Bulk file data.
    BulkData = 0x0F,
}

impl ServiceType {
    /// Decode the service type byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(ServiceType::Control),
            0x07 => Some(ServiceType::Rpc),
            0x0A => Some(ServiceType::Audio),
            0x0B => Some(ServiceType::Video),
            0x0F => Some(ServiceType::BulkData),
            _ => None,
        }
    }
}

/// Frame info values for control frames.
///
/// These are the values spoken by current peers; a renegotiated protocol
/// revision may remap them, which is why they live in one table here instead
/// of being scattered through the router.
pub mod control {
    /// Request a new session (session id 0) or a new service on an existing one.
    pub const START_SESSION: u8 = 0x01;
    /// Peer accepted; the packet's session id field carries the assignment.
    pub const START_SESSION_ACK: u8 = 0x02;
    /// Peer refused the registration.
    pub const START_SESSION_NACK: u8 = 0x03;
    /// Ask to end a service on a session.
    pub const END_SESSION: u8 = 0x04;
    /// Peer confirmed the end; the session id may be reused after this.
    pub const END_SESSION_ACK: u8 = 0x05;
    /// Answer to a HEARTBEAT, sent without client visibility.
    pub const HEARTBEAT_ACK: u8 = 0xFE;
    /// Liveness probe from the peer.
    pub const HEARTBEAT: u8 = 0xFF;

    /// Whether `info` is a control frame info value current peers emit.
    pub fn is_known(info: u8) -> bool {
        matches!(
            info,
            START_SESSION
                | START_SESSION_ACK
                | START_SESSION_NACK
                | END_SESSION
                | END_SESSION_ACK
                | HEARTBEAT_ACK
                | HEARTBEAT
        )
    }
}

/// Frame info carried by SINGLE and FIRST frames.
pub const FRAME_INFO_RESERVED: u8 = 0x00;

/// Frame info marking the final CONSECUTIVE frame of a transfer.
pub const FRAME_INFO_FINAL_CONSECUTIVE: u8 = 0x00;

/// Frame info of the first CONSECUTIVE frame after a FIRST frame.
pub const FRAME_INFO_INITIAL_CONSECUTIVE: u8 = 0x01;

/// Advance the CONSECUTIVE frame counter: 1..=255 cycling, skipping 0, which
/// is reserved for the final frame.
pub fn next_consecutive_info(info: u8) -> u8 {
    if info == u8::MAX {
        FRAME_INFO_INITIAL_CONSECUTIVE
    } else {
        info + 1
    }
}

/// Header geometry for one protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderLayout {
    /// Total header bytes before the payload.
    pub header_size: usize,
    /// Whether the trailing 4-byte message id is present.
    pub has_message_id: bool,
}

/// A negotiated protocol version (1..=5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion(u8);

impl ProtocolVersion {
    pub const V1: ProtocolVersion = ProtocolVersion(1);
    pub const V2: ProtocolVersion = ProtocolVersion(2);
    pub const V3: ProtocolVersion = ProtocolVersion(3);
    pub const V4: ProtocolVersion = ProtocolVersion(4);
    pub const V5: ProtocolVersion = ProtocolVersion(5);

    /// Construct from a negotiated version number. Returns `None` outside 1..=5.
    pub fn new(version: u8) -> Option<Self> {
        if (1..=5).contains(&version) {
            Some(ProtocolVersion(version))
        } else {
            None
        }
    }

    /// The raw version number as it appears on the wire.
    #[inline]
    pub fn as_u8(self) -> u8 {
        self.0
    }

    /// Header geometry for this version. Version 1 predates message ids.
    pub fn layout(self) -> HeaderLayout {
        match self.0 {
            1 => HeaderLayout {
                header_size: 8,
                has_message_id: false,
            },
            _ => HeaderLayout {
                header_size: 12,
                has_message_id: true,
            },
        }
    }

    /// Default per-frame payload budget before fragmentation kicks in.
    ///
    /// Versions 1 and 2 are pinned to 1500-byte frames; later versions default
    /// to the commonly negotiated 128 KiB and may be overridden by the value
    /// the peer actually negotiated.
    pub fn default_max_payload(self) -> usize {
        if self.0 <= 2 {
            LEGACY_FRAME_SIZE - self.layout().header_size
        } else {
            DEFAULT_V3_MAX_PAYLOAD
        }
    }
}

/// Pack version and frame type into the leading header byte.
///
/// Bit 3 is reserved and always written as 0.
#[inline]
pub fn pack_frame_byte(version: ProtocolVersion, frame_type: FrameType) -> u8 {
    (version.as_u8() << 4) | (frame_type as u8)
}

/// Unpack the leading header byte into (version, reserved bit, frame type bits).
#[inline]
pub fn unpack_frame_byte(byte: u8) -> (u8, bool, u8) {
    (byte >> 4, byte & 0x08 != 0, byte & 0x07)
}
