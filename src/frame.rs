use crate::{
    error::{MuxError, Result},
    socket_id::SocketId,
};
use bytes::{Buf, BufMut, Bytes};

/// `[version:1][destination:4 BE][length:2 BE]`
pub const HEADER_SIZE: usize = 7;

pub const PROTOCOL_VERSION: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub destination: SocketId,
    pub length: u16,
}

impl FrameHeader {
    pub fn new(destination: SocketId, length: u16) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            destination,
            length,
        }
    }

    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        dst.put_u8(self.version);
        dst.put_i32(self.destination.value());
        dst.put_u16(self.length);
    }

    /// Reads a header from exactly [`HEADER_SIZE`] bytes and validates it
    /// against the largest payload the reader accepts.
    pub fn decode(mut src: &[u8], max_length: usize) -> Result<Self> {
        if src.len() < HEADER_SIZE {
            return Err(MuxError::ProtocolViolation(format!(
                "Truncated frame header: {} bytes",
                src.len()
            )));
        }

        let version = src.get_u8();
        let destination = SocketId::new(src.get_i32());
        let length = src.get_u16();

        if version != PROTOCOL_VERSION {
            return Err(MuxError::InvalidProtocol(version));
        }

        if length as usize > max_length {
            return Err(MuxError::FrameTooLarge {
                size: length as usize,
                max: max_length,
            });
        }

        Ok(Self {
            version,
            destination,
            length,
        })
    }
}

/// One complete frame as written by the output multiplexor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub destination: SocketId,
    pub data: Bytes,
}

impl Frame {
    pub fn new(destination: SocketId, data: Bytes) -> Self {
        Self { destination, data }
    }

    pub fn total_size(&self) -> usize {
        HEADER_SIZE + self.data.len()
    }
}

/// A run of payload bytes decoded from the wire.
///
/// A frame's payload may arrive as several segments when the transport
/// delivers it in pieces; `end_of_frame` marks the last one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub destination: SocketId,
    pub data: Bytes,
    pub end_of_frame: bool,
}
