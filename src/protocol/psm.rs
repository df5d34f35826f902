//! Byte-at-a-time packet state machine.
//!
//! One [`PacketStateMachine`] exists per physical transport: framing is a
//! property of the wire, not of the logical session. The reader loop feeds it
//! one byte at a time; a byte that cannot progress the current state returns
//! `false`, and the caller resets the machine and keeps scanning from the next
//! byte. There is no resynchronization heuristic beyond that restart.
//!
//! State order: `Start → ServiceType → ControlFrameInfo → SessionId →
//! DataLength → MessageId (versions ≥ 2) → DataPump → Finished`.

use bytes::BytesMut;

use super::packet::{Packet, PacketHeader};
use super::wire::{
    self, control, FrameType, ProtocolVersion, ServiceType, ABSOLUTE_MAX_DATA_LENGTH,
    FIRST_FRAME_DATA_LENGTH, FRAME_INFO_RESERVED,
};

/// Parser state, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PsmState {
    /// Expecting the version/frame-type byte.
    Start,
    /// Expecting the service type byte.
    ServiceType,
    /// Expecting the frame info byte.
    ControlFrameInfo,
    /// Expecting the session id byte.
    SessionId,
    /// Accumulating the 4-byte big-endian data length.
    DataLength,
    /// Accumulating the 4-byte big-endian message id (versions ≥ 2).
    MessageId,
    /// Copying `data_length` payload bytes.
    DataPump,
    /// A complete packet is available via [`PacketStateMachine::take_packet`].
    Finished,
    /// A malformed byte was seen; only `reset` leaves this state.
    Error,
}

/// Reconstructs framed packets from a raw byte stream.
#[derive(Debug)]
pub struct PacketStateMachine {
    state: PsmState,
    version: Option<ProtocolVersion>,
    frame_type: FrameType,
    service_type: ServiceType,
    frame_info: u8,
    session_id: u8,
    data_length: u32,
    length_bytes: u8,
    message_id: u32,
    message_bytes: u8,
    payload: BytesMut,
    finished: Option<Packet>,
}

impl PacketStateMachine {
    pub fn new() -> Self {
        Self {
            state: PsmState::Start,
            version: None,
            frame_type: FrameType::Control,
            service_type: ServiceType::Control,
            frame_info: 0,
            session_id: 0,
            data_length: 0,
            length_bytes: 0,
            message_id: 0,
            message_bytes: 0,
            payload: BytesMut::new(),
            finished: None,
        }
    }

    /// Current parser state.
    #[inline]
    pub fn state(&self) -> PsmState {
        self.state
    }

    /// Feed one byte. Returns `false` if the byte cannot progress the machine;
    /// the caller must [`reset`](Self::reset) before feeding more bytes.
    pub fn handle_byte(&mut self, byte: u8) -> bool {
        match self.state {
            PsmState::Start => self.on_start(byte),
            PsmState::ServiceType => self.on_service_type(byte),
            PsmState::ControlFrameInfo => self.on_frame_info(byte),
            PsmState::SessionId => {
                self.session_id = byte;
                self.state = PsmState::DataLength;
                true
            }
            PsmState::DataLength => self.on_length_byte(byte),
            PsmState::MessageId => self.on_message_byte(byte),
            PsmState::DataPump => self.on_payload_byte(byte),
            // A finished machine must be drained and reset before reuse; an
            // errored one must be reset. Either way the byte is refused.
            PsmState::Finished | PsmState::Error => false,
        }
    }

    /// Take the completed packet. Available exactly once after reaching
    /// [`PsmState::Finished`]; a `reset` is required before parsing resumes.
    pub fn take_packet(&mut self) -> Option<Packet> {
        self.finished.take()
    }

    /// Return to [`PsmState::Start`], discarding any partial parse.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    fn fail(&mut self) -> bool {
        self.state = PsmState::Error;
        false
    }

    fn on_start(&mut self, byte: u8) -> bool {
        let (version, reserved, frame_type_bits) = wire::unpack_frame_byte(byte);
        if reserved {
            return self.fail();
        }
        let version = match ProtocolVersion::new(version) {
            Some(v) => v,
            None => return self.fail(),
        };
        let frame_type = match FrameType::from_u8(frame_type_bits) {
            Some(ft) => ft,
            None => return self.fail(),
        };
        self.version = Some(version);
        self.frame_type = frame_type;
        self.state = PsmState::ServiceType;
        true
    }

    fn on_service_type(&mut self, byte: u8) -> bool {
        let service_type = match ServiceType::from_u8(byte) {
            Some(st) => st,
            None => return self.fail(),
        };
        // The control service never carries data frames.
        if service_type == ServiceType::Control && self.frame_type != FrameType::Control {
            return self.fail();
        }
        self.service_type = service_type;
        self.state = PsmState::ControlFrameInfo;
        true
    }

    fn on_frame_info(&mut self, byte: u8) -> bool {
        let valid = match self.frame_type {
            FrameType::Control => control::is_known(byte),
            FrameType::Single | FrameType::First => byte == FRAME_INFO_RESERVED,
            // The consecutive counter may be any value; 0 marks the final frame.
            FrameType::Consecutive => true,
        };
        if !valid {
            return self.fail();
        }
        self.frame_info = byte;
        self.state = PsmState::SessionId;
        true
    }

    fn on_length_byte(&mut self, byte: u8) -> bool {
        self.data_length = (self.data_length << 8) | u32::from(byte);
        self.length_bytes += 1;
        if self.length_bytes < 4 {
            return true;
        }

        if self.data_length > ABSOLUTE_MAX_DATA_LENGTH {
            return self.fail();
        }
        if self.frame_type == FrameType::First && self.data_length != FIRST_FRAME_DATA_LENGTH {
            return self.fail();
        }

        let version = self.version.expect("set in Start state");
        if version.layout().has_message_id {
            self.state = PsmState::MessageId;
        } else if self.data_length == 0 {
            self.finish();
        } else {
            self.begin_data_pump();
        }
        true
    }

    fn on_message_byte(&mut self, byte: u8) -> bool {
        self.message_id = (self.message_id << 8) | u32::from(byte);
        self.message_bytes += 1;
        if self.message_bytes < 4 {
            return true;
        }
        if self.data_length == 0 {
            self.finish();
        } else {
            self.begin_data_pump();
        }
        true
    }

    fn on_payload_byte(&mut self, byte: u8) -> bool {
        self.payload.extend_from_slice(&[byte]);
        if self.payload.len() as u32 == self.data_length {
            self.finish();
        }
        true
    }

    fn begin_data_pump(&mut self) {
        self.payload = BytesMut::with_capacity(self.data_length as usize);
        self.state = PsmState::DataPump;
    }

    fn finish(&mut self) {
        let header = PacketHeader {
            version: self.version.expect("set in Start state"),
            frame_type: self.frame_type,
            service_type: self.service_type,
            frame_info: self.frame_info,
            session_id: self.session_id,
            data_length: self.data_length,
            message_id: self.message_id,
        };
        self.finished = Some(Packet {
            header,
            payload: std::mem::take(&mut self.payload).freeze(),
        });
        self.state = PsmState::Finished;
    }
}

impl Default for PacketStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    /// Drive a byte slice through the machine the way the reader loop does:
    /// reset on non-progress, collect finished packets.
    fn scan(bytes: &[u8]) -> Vec<Packet> {
        let mut psm = PacketStateMachine::new();
        let mut packets = Vec::new();
        for &b in bytes {
            if !psm.handle_byte(b) {
                psm.reset();
                continue;
            }
            if psm.state() == PsmState::Finished {
                packets.push(psm.take_packet().expect("finished packet available"));
                psm.reset();
            }
        }
        packets
    }

    fn sample_packet(version: ProtocolVersion) -> Packet {
        Packet::new(
            version,
            FrameType::Single,
            ServiceType::Rpc,
            0x00,
            0x07,
            0x00000021,
            Bytes::from_static(b"sample payload"),
        )
    }

    #[test]
    fn test_parse_v5_packet_byte_at_a_time() {
        let packet = sample_packet(ProtocolVersion::V5);
        let bytes = packet.encode_bytes();

        let mut psm = PacketStateMachine::new();
        for &b in &bytes {
            assert!(psm.handle_byte(b), "every byte of a valid packet progresses");
        }
        assert_eq!(psm.state(), PsmState::Finished);

        let parsed = psm.take_packet().unwrap();
        assert_eq!(parsed.header, packet.header);
        assert_eq!(parsed.payload, packet.payload);
    }

    #[test]
    fn test_parse_v1_packet_has_no_message_id() {
        let packet = Packet::new(
            ProtocolVersion::V1,
            FrameType::Single,
            ServiceType::Rpc,
            0x00,
            0x01,
            0,
            Bytes::from_static(b"legacy"),
        );
        let bytes = packet.encode_bytes();
        assert_eq!(bytes.len(), 8 + 6);

        let parsed = scan(&bytes);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].message_id(), 0);
        assert_eq!(parsed[0].payload(), b"legacy");
    }

    #[test]
    fn test_zero_length_payload_finishes_after_header() {
        let packet = Packet::new(
            ProtocolVersion::V5,
            FrameType::Control,
            ServiceType::Control,
            control::HEARTBEAT,
            0,
            0,
            Bytes::new(),
        );
        let parsed = scan(&packet.encode_bytes());
        assert_eq!(parsed.len(), 1);
        assert!(parsed[0].is_heartbeat());
        assert!(parsed[0].payload().is_empty());
    }

    #[test]
    fn test_resynchronization_after_garbage() {
        // Bytes that fail in the Start state: version 0 and version 15.
        let mut stream = vec![0x00, 0xF1, 0x00, 0xFF, 0x01];
        let packet = sample_packet(ProtocolVersion::V5);
        stream.extend_from_slice(&packet.encode_bytes());

        let parsed = scan(&stream);
        assert_eq!(parsed.len(), 1, "exactly one packet, no false completions");
        assert_eq!(parsed[0].header, packet.header);
        assert_eq!(parsed[0].payload, packet.payload);
    }

    #[test]
    fn test_reserved_bit_rejected() {
        let mut psm = PacketStateMachine::new();
        let byte = wire::pack_frame_byte(ProtocolVersion::V5, FrameType::Single) | 0x08;
        assert!(!psm.handle_byte(byte));
        assert_eq!(psm.state(), PsmState::Error);
    }

    #[test]
    fn test_unknown_service_type_rejected() {
        let mut psm = PacketStateMachine::new();
        assert!(psm.handle_byte(wire::pack_frame_byte(
            ProtocolVersion::V5,
            FrameType::Single
        )));
        assert!(!psm.handle_byte(0x42));
        assert_eq!(psm.state(), PsmState::Error);
    }

    #[test]
    fn test_data_frame_on_control_service_rejected() {
        let mut psm = PacketStateMachine::new();
        assert!(psm.handle_byte(wire::pack_frame_byte(
            ProtocolVersion::V5,
            FrameType::Single
        )));
        assert!(!psm.handle_byte(ServiceType::Control as u8));
    }

    #[test]
    fn test_unknown_control_info_rejected() {
        let mut psm = PacketStateMachine::new();
        assert!(psm.handle_byte(wire::pack_frame_byte(
            ProtocolVersion::V5,
            FrameType::Control
        )));
        assert!(psm.handle_byte(ServiceType::Control as u8));
        assert!(!psm.handle_byte(0x6B));
    }

    #[test]
    fn test_single_frame_with_nonzero_info_rejected() {
        let mut psm = PacketStateMachine::new();
        assert!(psm.handle_byte(wire::pack_frame_byte(
            ProtocolVersion::V5,
            FrameType::Single
        )));
        assert!(psm.handle_byte(ServiceType::Rpc as u8));
        assert!(!psm.handle_byte(0x01));
    }

    #[test]
    fn test_first_frame_length_must_be_eight() {
        let mut bad = Packet::new(
            ProtocolVersion::V5,
            FrameType::First,
            ServiceType::Rpc,
            0x00,
            1,
            1,
            Bytes::from_static(&[0u8; 8]),
        )
        .encode_bytes();
        // Corrupt the declared length to 9.
        bad[7] = 9;

        let mut psm = PacketStateMachine::new();
        let mut progressed = true;
        for &b in &bad {
            progressed = psm.handle_byte(b);
            if !progressed {
                break;
            }
        }
        assert!(!progressed);
        assert_eq!(psm.state(), PsmState::Error);
    }

    #[test]
    fn test_oversized_data_length_rejected() {
        let mut bytes = sample_packet(ProtocolVersion::V5).encode_bytes();
        let oversize = (ABSOLUTE_MAX_DATA_LENGTH + 1).to_be_bytes();
        bytes[4..8].copy_from_slice(&oversize);

        let mut psm = PacketStateMachine::new();
        let mut progressed = true;
        for &b in &bytes[..8] {
            progressed = psm.handle_byte(b);
        }
        assert!(!progressed, "final length byte must not progress");
    }

    #[test]
    fn test_finished_packet_taken_exactly_once() {
        let mut psm = PacketStateMachine::new();
        for &b in &sample_packet(ProtocolVersion::V5).encode_bytes() {
            assert!(psm.handle_byte(b));
        }
        assert!(psm.take_packet().is_some());
        assert!(psm.take_packet().is_none());
        // Finished machine refuses bytes until reset.
        assert!(!psm.handle_byte(0x51));
        psm.reset();
        assert_eq!(psm.state(), PsmState::Start);
    }

    #[test]
    fn test_back_to_back_packets() {
        let a = sample_packet(ProtocolVersion::V5);
        let b = Packet::new(
            ProtocolVersion::V5,
            FrameType::Single,
            ServiceType::BulkData,
            0x00,
            0x09,
            7,
            Bytes::from_static(b"second"),
        );
        let mut stream = a.encode_bytes();
        stream.extend_from_slice(&b.encode_bytes());

        let parsed = scan(&stream);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].payload(), a.payload());
        assert_eq!(parsed[1].payload(), b"second");
        assert_eq!(parsed[1].service_type(), ServiceType::BulkData);
    }
}
