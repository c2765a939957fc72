use crate::{
    config::{Config, MAX_FRAME_PAYLOAD},
    error::{MuxError, Result},
    frame::{Frame, FrameHeader, HEADER_SIZE, Segment},
    socket_id::SocketId,
};
use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Header,
    Payload {
        destination: SocketId,
        remaining: usize,
    },
}

/// Streaming codec for the multiplexed wire format.
///
/// Decoding never waits for a whole payload: once the 7-byte header is in,
/// every available payload byte is handed out as a [`Segment`] so the
/// destination stream sees data as soon as it arrives.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_payload: usize,
    max_chunk: usize,
    state: DecodeState,
}

impl FrameCodec {
    pub fn new(config: &Config) -> Self {
        Self {
            max_payload: config.input_buffer_size,
            max_chunk: config.output_max_chunk_size,
            state: DecodeState::Header,
        }
    }

    /// True while a frame's payload has been announced but not fully read.
    pub fn in_frame(&self) -> bool {
        self.state != DecodeState::Header
    }

    /// Writes one frame carrying `payload` to `dst`.
    pub fn encode_chunk(destination: SocketId, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
        if payload.len() > MAX_FRAME_PAYLOAD {
            return Err(MuxError::FrameTooLarge {
                size: payload.len(),
                max: MAX_FRAME_PAYLOAD,
            });
        }

        dst.reserve(HEADER_SIZE + payload.len());
        FrameHeader::new(destination, payload.len() as u16).encode(dst);
        dst.put_slice(payload);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Segment;
    type Error = MuxError;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> std::result::Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                DecodeState::Header => {
                    if src.len() < HEADER_SIZE {
                        src.reserve(HEADER_SIZE - src.len());
                        return Ok(None);
                    }

                    let header = FrameHeader::decode(&src[..HEADER_SIZE], self.max_payload)?;
                    let _ = src.split_to(HEADER_SIZE);

                    // Empty frames carry nothing to route
                    if header.length == 0 {
                        continue;
                    }

                    self.state = DecodeState::Payload {
                        destination: header.destination,
                        remaining: header.length as usize,
                    };
                }
                DecodeState::Payload {
                    destination,
                    remaining,
                } => {
                    if src.is_empty() {
                        return Ok(None);
                    }

                    let take = remaining.min(src.len());
                    let data = src.split_to(take).freeze();
                    let left = remaining - take;

                    self.state = if left == 0 {
                        DecodeState::Header
                    } else {
                        DecodeState::Payload {
                            destination,
                            remaining: left,
                        }
                    };

                    return Ok(Some(Segment {
                        destination,
                        data,
                        end_of_frame: left == 0,
                    }));
                }
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = MuxError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> std::result::Result<(), Self::Error> {
        if frame.data.len() > self.max_chunk {
            return Err(MuxError::FrameTooLarge {
                size: frame.data.len(),
                max: self.max_chunk,
            });
        }

        Self::encode_chunk(frame.destination, &frame.data, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn test_codec() -> FrameCodec {
        FrameCodec::new(&Config::default())
    }

    fn collect(codec: &mut FrameCodec, buf: &mut BytesMut) -> Vec<Segment> {
        let mut segments = Vec::new();
        while let Some(segment) = codec.decode(buf).unwrap() {
            segments.push(segment);
        }
        segments
    }

    #[test]
    fn test_codec_round_trip() {
        let mut codec = test_codec();
        let frame = Frame::new(SocketId::new(5), Bytes::from("hello world"));

        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();
        assert_eq!(buf.len(), frame.total_size());

        let segment = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(segment.destination, SocketId::new(5));
        assert_eq!(segment.data, frame.data);
        assert!(segment.end_of_frame);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_decode_partial_header() {
        let mut codec = test_codec();
        let mut buf = BytesMut::new();
        FrameCodec::encode_chunk(SocketId::new(3), b"abc", &mut buf).unwrap();

        let mut partial = BytesMut::from(&buf[..4]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        assert!(!codec.in_frame());

        partial.extend_from_slice(&buf[4..]);
        let segment = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(&segment.data[..], b"abc");
    }

    #[test]
    fn test_decode_partial_payload_yields_segments() {
        let mut codec = test_codec();
        let mut buf = BytesMut::new();
        FrameCodec::encode_chunk(SocketId::new(8), b"hello world", &mut buf).unwrap();

        let mut wire = BytesMut::from(&buf[..HEADER_SIZE + 5]);
        let first = codec.decode(&mut wire).unwrap().unwrap();
        assert_eq!(&first.data[..], b"hello");
        assert!(!first.end_of_frame);
        assert!(codec.in_frame());

        wire.extend_from_slice(&buf[HEADER_SIZE + 5..]);
        let second = codec.decode(&mut wire).unwrap().unwrap();
        assert_eq!(second.destination, SocketId::new(8));
        assert_eq!(&second.data[..], b" world");
        assert!(second.end_of_frame);
        assert!(!codec.in_frame());
    }

    #[test]
    fn test_decode_multiple_frames() {
        let mut codec = test_codec();
        let mut buf = BytesMut::new();
        FrameCodec::encode_chunk(SocketId::new(1), b"one", &mut buf).unwrap();
        FrameCodec::encode_chunk(SocketId::new(2), b"", &mut buf).unwrap();
        FrameCodec::encode_chunk(SocketId::BACK_CHANNEL, b"two", &mut buf).unwrap();

        let segments = collect(&mut codec, &mut buf);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].destination, SocketId::new(1));
        assert_eq!(segments[1].destination, SocketId::BACK_CHANNEL);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_byte_at_a_time() {
        let mut codec = test_codec();
        let mut wire = BytesMut::new();
        FrameCodec::encode_chunk(SocketId::new(4), b"xyz", &mut wire).unwrap();
        FrameCodec::encode_chunk(SocketId::new(6), b"q", &mut wire).unwrap();

        let mut buf = BytesMut::new();
        let mut received: Vec<(SocketId, u8)> = Vec::new();
        for byte in wire.iter() {
            buf.put_u8(*byte);
            for segment in collect(&mut codec, &mut buf) {
                for b in segment.data.iter() {
                    received.push((segment.destination, *b));
                }
            }
        }

        assert_eq!(
            received,
            vec![
                (SocketId::new(4), b'x'),
                (SocketId::new(4), b'y'),
                (SocketId::new(4), b'z'),
                (SocketId::new(6), b'q'),
            ]
        );
    }

    #[test]
    fn test_decode_invalid_protocol_version() {
        let mut codec = test_codec();

        let mut buf = BytesMut::new();
        buf.put_u8(1); // Invalid version
        buf.put_i32(5); // Destination
        buf.put_u16(0); // Length

        let result = codec.decode(&mut buf);
        assert!(matches!(result, Err(MuxError::InvalidProtocol(1))));
    }

    #[test]
    fn test_decode_oversized_frame() {
        let config = Config {
            input_buffer_size: 100,
            output_max_chunk_size: 100,
            ..Default::default()
        };
        let mut codec = FrameCodec::new(&config);

        let mut buf = BytesMut::new();
        buf.put_u8(0);
        buf.put_i32(5);
        buf.put_u16(101);

        let result = codec.decode(&mut buf);
        assert!(matches!(result, Err(MuxError::FrameTooLarge { .. })));
    }

    #[test]
    fn test_encode_rejects_over_chunk_frame() {
        let config = Config {
            input_buffer_size: 100,
            output_max_chunk_size: 100,
            ..Default::default()
        };
        let mut codec = FrameCodec::new(&config);
        let frame = Frame::new(SocketId::new(1), Bytes::from(vec![0u8; 200]));

        let mut buf = BytesMut::new();
        assert!(codec.encode(frame, &mut buf).is_err());
        assert!(buf.is_empty());
    }
}
