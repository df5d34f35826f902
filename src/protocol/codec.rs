//! Outgoing packet construction, including MTU fragmentation.
//!
//! The codec turns a logical message into the packet sequence the peer's
//! parser consumes: one SINGLE frame when the payload fits the negotiated
//! maximum, otherwise a FIRST frame declaring the transfer followed by
//! CONSECUTIVE chunks. Frame count and final-chunk length are derived here,
//! never supplied by callers. The codec performs no interpretation of the
//! payload bytes.

use bytes::Bytes;

use super::packet::Packet;
use super::wire::{
    next_consecutive_info, FrameType, ProtocolVersion, ServiceType, FIRST_FRAME_DATA_LENGTH,
    FRAME_INFO_FINAL_CONSECUTIVE, FRAME_INFO_INITIAL_CONSECUTIVE, FRAME_INFO_RESERVED,
};

/// Builds wire packets for one negotiated (version, MTU) pair.
#[derive(Debug, Clone, Copy)]
pub struct PacketCodec {
    version: ProtocolVersion,
    max_payload: usize,
}

impl PacketCodec {
    /// Codec with the version's default payload budget.
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            version,
            max_payload: version.default_max_payload(),
        }
    }

    /// Codec with a peer-negotiated payload budget.
    pub fn with_max_payload(version: ProtocolVersion, max_payload: usize) -> Self {
        Self {
            version,
            max_payload,
        }
    }

    #[inline]
    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Largest payload carried by one frame before fragmentation.
    #[inline]
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Encode a logical message into its wire packet sequence.
    ///
    /// Returns a single SINGLE frame, or FIRST + N CONSECUTIVE frames whose
    /// frame info counters cycle 1..=255 with 0 marking the final chunk.
    pub fn encode_message(
        &self,
        session_id: u8,
        service_type: ServiceType,
        message_id: u32,
        payload: Bytes,
    ) -> Vec<Packet> {
        if payload.len() <= self.max_payload {
            return vec![Packet::new(
                self.version,
                FrameType::Single,
                service_type,
                FRAME_INFO_RESERVED,
                session_id,
                message_id,
                payload,
            )];
        }

        let total = payload.len();
        let count = total.div_ceil(self.max_payload);
        let mut packets = Vec::with_capacity(count + 1);

        packets.push(Packet::new(
            self.version,
            FrameType::First,
            service_type,
            FRAME_INFO_RESERVED,
            session_id,
            message_id,
            first_frame_payload(total as u32, count as u32),
        ));

        let mut counter = FRAME_INFO_INITIAL_CONSECUTIVE;
        let mut offset = 0;
        for index in 0..count {
            let end = (offset + self.max_payload).min(total);
            let frame_info = if index == count - 1 {
                FRAME_INFO_FINAL_CONSECUTIVE
            } else {
                counter
            };
            packets.push(Packet::new(
                self.version,
                FrameType::Consecutive,
                service_type,
                frame_info,
                session_id,
                message_id,
                payload.slice(offset..end),
            ));
            counter = next_consecutive_info(counter);
            offset = end;
        }

        packets
    }

    /// Build a control packet with an empty payload.
    pub fn control(&self, session_id: u8, service_type: ServiceType, frame_info: u8) -> Packet {
        Packet::new(
            self.version,
            FrameType::Control,
            service_type,
            frame_info,
            session_id,
            0,
            Bytes::new(),
        )
    }
}

/// The 8-byte FIRST frame payload: total transfer size, then frame count,
/// both big-endian.
pub fn first_frame_payload(total_size: u32, frame_count: u32) -> Bytes {
    let mut buf = Vec::with_capacity(FIRST_FRAME_DATA_LENGTH as usize);
    buf.extend_from_slice(&total_size.to_be_bytes());
    buf.extend_from_slice(&frame_count.to_be_bytes());
    Bytes::from(buf)
}

/// Read (total size, frame count) back out of a FIRST frame payload.
pub fn parse_first_frame_payload(payload: &[u8]) -> Option<(u32, u32)> {
    if payload.len() != FIRST_FRAME_DATA_LENGTH as usize {
        return None;
    }
    let total = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let count = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
    Some((total, count))
}
