//! Packet struct with typed accessors.
//!
//! A [`Packet`] pairs a decoded [`PacketHeader`] with its payload bytes.
//! Uses `bytes::Bytes` for zero-copy payload sharing between the parser,
//! the router, and session owners.

use bytes::Bytes;

use super::wire::{self, control, FrameType, ProtocolVersion, ServiceType};

/// Decoded header fields of one wire packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Negotiated protocol version this packet was framed with.
    pub version: ProtocolVersion,
    /// Control / single / first / consecutive.
    pub frame_type: FrameType,
    /// Which logical service the packet belongs to.
    pub service_type: ServiceType,
    /// Control opcode, or the consecutive-frame counter, or 0.
    pub frame_info: u8,
    /// Peer-assigned session id; 0 means "unassigned / requesting".
    pub session_id: u8,
    /// Declared payload length in bytes.
    pub data_length: u32,
    /// Monotonic per-session message id; 0 on the wire for version 1.
    pub message_id: u32,
}

impl PacketHeader {
    /// Header size in bytes for this packet's version.
    #[inline]
    pub fn header_size(&self) -> usize {
        self.version.layout().header_size
    }

    /// Encode the header per the version-specific layout table.
    pub fn encode(&self) -> Vec<u8> {
        let layout = self.version.layout();
        let mut buf = Vec::with_capacity(layout.header_size);
        buf.push(wire::pack_frame_byte(self.version, self.frame_type));
        buf.push(self.service_type as u8);
        buf.push(self.frame_info);
        buf.push(self.session_id);
        buf.extend_from_slice(&self.data_length.to_be_bytes());
        if layout.has_message_id {
            buf.extend_from_slice(&self.message_id.to_be_bytes());
        }
        buf
    }
}

/// A complete wire packet: header plus exactly `data_length` payload bytes.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Decoded header.
    pub header: PacketHeader,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Packet {
    /// Create a packet from header fields and payload.
    ///
    /// The header's `data_length` is derived from the payload so the two can
    /// never disagree.
    pub fn new(
        version: ProtocolVersion,
        frame_type: FrameType,
        service_type: ServiceType,
        frame_info: u8,
        session_id: u8,
        message_id: u32,
        payload: Bytes,
    ) -> Self {
        let header = PacketHeader {
            version,
            frame_type,
            service_type,
            frame_info,
            session_id,
            data_length: payload.len() as u32,
            message_id,
        };
        Self { header, payload }
    }

    /// Serialize header and payload into one contiguous buffer.
    pub fn encode_bytes(&self) -> Vec<u8> {
        let mut buf = self.header.encode();
        buf.reserve(self.payload.len());
        buf.extend_from_slice(&self.payload);
        buf
    }

    #[inline]
    pub fn frame_type(&self) -> FrameType {
        self.header.frame_type
    }

    #[inline]
    pub fn service_type(&self) -> ServiceType {
        self.header.service_type
    }

    #[inline]
    pub fn frame_info(&self) -> u8 {
        self.header.frame_info
    }

    #[inline]
    pub fn session_id(&self) -> u8 {
        self.header.session_id
    }

    #[inline]
    pub fn message_id(&self) -> u32 {
        self.header.message_id
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Get a clone of the payload as Bytes (cheap, zero-copy).
    #[inline]
    pub fn payload_bytes(&self) -> Bytes {
        self.payload.clone()
    }

    #[inline]
    pub fn is_control(&self) -> bool {
        self.header.frame_type == FrameType::Control
    }

    #[inline]
    pub fn is_single(&self) -> bool {
        self.header.frame_type == FrameType::Single
    }

    #[inline]
    pub fn is_first(&self) -> bool {
        self.header.frame_type == FrameType::First
    }

    #[inline]
    pub fn is_consecutive(&self) -> bool {
        self.header.frame_type == FrameType::Consecutive
    }

    /// Whether this is a control frame carrying the given opcode.
    #[inline]
    pub fn is_control_info(&self, info: u8) -> bool {
        self.is_control() && self.header.frame_info == info
    }

    /// Whether this is a heartbeat probe that must be answered immediately.
    #[inline]
    pub fn is_heartbeat(&self) -> bool {
        self.is_control_info(control::HEARTBEAT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_v5_byte_exact() {
        let packet = Packet::new(
            ProtocolVersion::V5,
            FrameType::Single,
            ServiceType::Rpc,
            0x00,
            0x0C,
            0x01020304,
            Bytes::from_static(b"hi"),
        );
        let bytes = packet.encode_bytes();

        assert_eq!(bytes.len(), 12 + 2);
        assert_eq!(bytes[0], 0x51); // version 5 << 4 | SINGLE
        assert_eq!(bytes[1], 0x07); // RPC
        assert_eq!(bytes[2], 0x00); // frame info
        assert_eq!(bytes[3], 0x0C); // session id
        assert_eq!(&bytes[4..8], &[0x00, 0x00, 0x00, 0x02]); // data length BE
        assert_eq!(&bytes[8..12], &[0x01, 0x02, 0x03, 0x04]); // message id BE
        assert_eq!(&bytes[12..], b"hi");
    }

    #[test]
    fn test_header_encode_v1_omits_message_id() {
        let packet = Packet::new(
            ProtocolVersion::V1,
            FrameType::Single,
            ServiceType::Rpc,
            0x00,
            0x01,
            0xDEADBEEF,
            Bytes::from_static(b"x"),
        );
        let bytes = packet.encode_bytes();

        assert_eq!(packet.header.header_size(), 8);
        assert_eq!(bytes.len(), 8 + 1);
        assert_eq!(bytes[8], b'x');
    }

    #[test]
    fn test_data_length_derived_from_payload() {
        let packet = Packet::new(
            ProtocolVersion::V3,
            FrameType::Single,
            ServiceType::BulkData,
            0x00,
            1,
            1,
            Bytes::from(vec![0u8; 777]),
        );
        assert_eq!(packet.header.data_length, 777);
    }

    #[test]
    fn test_control_accessors() {
        let heartbeat = Packet::new(
            ProtocolVersion::V5,
            FrameType::Control,
            ServiceType::Control,
            control::HEARTBEAT,
            0,
            0,
            Bytes::new(),
        );
        assert!(heartbeat.is_control());
        assert!(heartbeat.is_heartbeat());
        assert!(heartbeat.is_control_info(control::HEARTBEAT));
        assert!(!heartbeat.is_control_info(control::START_SESSION));
        assert!(!heartbeat.is_single());
    }

    #[test]
    fn test_payload_bytes_zero_copy() {
        let original = Bytes::from_static(b"payload data");
        let packet = Packet::new(
            ProtocolVersion::V5,
            FrameType::Single,
            ServiceType::Rpc,
            0,
            1,
            1,
            original.clone(),
        );
        let cloned = packet.payload_bytes();
        assert_eq!(cloned.as_ptr(), original.as_ptr());
    }
}
