//! Reassembly of FIRST + CONSECUTIVE fragment trains.
//!
//! Buffers are keyed by (session id, service type, message id) and live only
//! for the duration of one transfer. Any out-of-order counter, byte overrun,
//! or short final frame discards the buffer; a corrupt transfer is never
//! delivered partially.

use bytes::{Bytes, BytesMut};

use crate::protocol::{
    next_consecutive_info, ServiceType, FRAME_INFO_FINAL_CONSECUTIVE,
    FRAME_INFO_INITIAL_CONSECUTIVE,
};

/// Upper bound on a reassembled message. FIRST frames declaring more are
/// rejected outright.
pub(crate) const MAX_REASSEMBLED_SIZE: usize = 64 * 1024 * 1024;

/// Identity of one in-progress fragmented transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ReassemblyKey {
    pub session_id: u8,
    pub service_type: ServiceType,
    pub message_id: u32,
}

/// Accumulates CONSECUTIVE frames until the total declared by the FIRST
/// frame is reached.
#[derive(Debug)]
pub(crate) struct ReassemblyBuffer {
    total: usize,
    remaining_frames: u32,
    next_info: u8,
    data: BytesMut,
}

impl ReassemblyBuffer {
    /// Start a transfer from a FIRST frame's declared (total, frame count).
    pub fn start(total: u32, frame_count: u32) -> Result<Self, &'static str> {
        if total == 0 || frame_count == 0 {
            return Err("FIRST frame declares an empty transfer");
        }
        if total as usize > MAX_REASSEMBLED_SIZE {
            return Err("FIRST frame declares an oversized transfer");
        }
        Ok(Self {
            total: total as usize,
            remaining_frames: frame_count,
            next_info: FRAME_INFO_INITIAL_CONSECUTIVE,
            data: BytesMut::with_capacity(total as usize),
        })
    }

    /// Feed one CONSECUTIVE frame. Returns the reassembled payload when the
    /// final frame lands, `None` while more frames are expected, or an error
    /// that invalidates the whole buffer.
    pub fn push(&mut self, frame_info: u8, chunk: &[u8]) -> Result<Option<Bytes>, &'static str> {
        let expected = if self.remaining_frames == 1 {
            FRAME_INFO_FINAL_CONSECUTIVE
        } else {
            self.next_info
        };
        if frame_info != expected {
            return Err("out-of-order consecutive frame");
        }
        if self.data.len() + chunk.len() > self.total {
            return Err("reassembly exceeds declared total");
        }

        self.data.extend_from_slice(chunk);
        self.remaining_frames -= 1;
        self.next_info = next_consecutive_info(self.next_info);

        if self.remaining_frames > 0 {
            return Ok(None);
        }
        if self.data.len() != self.total {
            return Err("reassembly short of declared total");
        }
        Ok(Some(std::mem::take(&mut self.data).freeze()))
    }
}
