use crate::{
    error::{MuxError, Result},
    socket_id::SocketId,
};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Messages exchanged on the reserved system channels.
///
/// Each message is a one-byte tag followed by its arguments as 4-byte
/// big-endian integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// Client socket `client` asks the peer's acceptor for a connection.
    Connect { client: SocketId },
    /// The acceptor registered `assigned` for `client`.
    Connected { client: SocketId, assigned: SocketId },
    ConnectRefused { client: SocketId },
    /// The client registered its side of `assigned`.
    ConnectVerified { assigned: SocketId },
    /// The peer will write nothing more to `id`.
    OutputShutdown { id: SocketId },
    /// The peer's socket writing to `id` closed.
    Disconnect { id: SocketId },
    RegisterRemoteServer { request: u32 },
    UnregisterRemoteServer { request: u32 },
    RequestManagerShutdown { request: u32 },
    Response { request: u32, accepted: bool },
}

impl ControlMessage {
    pub const CONNECT: u8 = 1;
    pub const CONNECTED: u8 = 2;
    pub const CONNECT_REFUSED: u8 = 3;
    pub const CONNECT_VERIFIED: u8 = 4;
    pub const OUTPUT_SHUTDOWN: u8 = 5;
    pub const DISCONNECT: u8 = 6;
    pub const REGISTER_REMOTE_SERVER: u8 = 7;
    pub const UNREGISTER_REMOTE_SERVER: u8 = 8;
    pub const REQUEST_MANAGER_SHUTDOWN: u8 = 9;
    pub const RESPONSE_TRUE: u8 = 10;
    pub const RESPONSE_FALSE: u8 = 11;

    /// Largest encoded message.
    pub const MAX_ENCODED_LEN: usize = 9;

    pub fn tag(&self) -> u8 {
        match self {
            ControlMessage::Connect { .. } => Self::CONNECT,
            ControlMessage::Connected { .. } => Self::CONNECTED,
            ControlMessage::ConnectRefused { .. } => Self::CONNECT_REFUSED,
            ControlMessage::ConnectVerified { .. } => Self::CONNECT_VERIFIED,
            ControlMessage::OutputShutdown { .. } => Self::OUTPUT_SHUTDOWN,
            ControlMessage::Disconnect { .. } => Self::DISCONNECT,
            ControlMessage::RegisterRemoteServer { .. } => Self::REGISTER_REMOTE_SERVER,
            ControlMessage::UnregisterRemoteServer { .. } => Self::UNREGISTER_REMOTE_SERVER,
            ControlMessage::RequestManagerShutdown { .. } => Self::REQUEST_MANAGER_SHUTDOWN,
            ControlMessage::Response { accepted: true, .. } => Self::RESPONSE_TRUE,
            ControlMessage::Response { accepted: false, .. } => Self::RESPONSE_FALSE,
        }
    }

    /// Number of integer arguments following `tag`.
    fn arity(tag: u8) -> Result<usize> {
        match tag {
            Self::CONNECTED => Ok(2),
            Self::CONNECT..=Self::RESPONSE_FALSE => Ok(1),
            other => Err(MuxError::UnknownControlMessage(other)),
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            ControlMessage::Connected { .. } => 9,
            _ => 5,
        }
    }

    /// The reserved channel this message travels on.
    pub fn channel(&self) -> SocketId {
        match self {
            ControlMessage::Connect { .. } => SocketId::SERVER_ACCEPT,
            ControlMessage::Connected { .. } | ControlMessage::ConnectRefused { .. } => {
                SocketId::ACCEPT_ANSWER
            }
            ControlMessage::ConnectVerified { .. } => SocketId::ACCEPT_VERIFY,
            ControlMessage::Response { .. } => SocketId::CONTROL,
            ControlMessage::OutputShutdown { .. }
            | ControlMessage::Disconnect { .. }
            | ControlMessage::RegisterRemoteServer { .. }
            | ControlMessage::UnregisterRemoteServer { .. }
            | ControlMessage::RequestManagerShutdown { .. } => SocketId::BACK_CHANNEL,
        }
    }

    /// Back-channel requests that expect a `Response`.
    pub fn request_id(&self) -> Option<u32> {
        match self {
            ControlMessage::RegisterRemoteServer { request }
            | ControlMessage::UnregisterRemoteServer { request }
            | ControlMessage::RequestManagerShutdown { request } => Some(*request),
            _ => None,
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_u8(self.tag());
        match *self {
            ControlMessage::Connect { client } | ControlMessage::ConnectRefused { client } => {
                dst.put_i32(client.value());
            }
            ControlMessage::Connected { client, assigned } => {
                dst.put_i32(client.value());
                dst.put_i32(assigned.value());
            }
            ControlMessage::ConnectVerified { assigned } => dst.put_i32(assigned.value()),
            ControlMessage::OutputShutdown { id } | ControlMessage::Disconnect { id } => {
                dst.put_i32(id.value());
            }
            ControlMessage::RegisterRemoteServer { request }
            | ControlMessage::UnregisterRemoteServer { request }
            | ControlMessage::RequestManagerShutdown { request }
            | ControlMessage::Response { request, .. } => dst.put_u32(request),
        }
    }

    fn decode_body(tag: u8, src: &mut BytesMut) -> Self {
        let mut next = || SocketId::new(src.get_i32());
        match tag {
            Self::CONNECT => ControlMessage::Connect { client: next() },
            Self::CONNECTED => {
                let client = next();
                let assigned = next();
                ControlMessage::Connected { client, assigned }
            }
            Self::CONNECT_REFUSED => ControlMessage::ConnectRefused { client: next() },
            Self::CONNECT_VERIFIED => ControlMessage::ConnectVerified { assigned: next() },
            Self::OUTPUT_SHUTDOWN => ControlMessage::OutputShutdown { id: next() },
            Self::DISCONNECT => ControlMessage::Disconnect { id: next() },
            _ => {
                let request = next().value() as u32;
                match tag {
                    Self::REGISTER_REMOTE_SERVER => ControlMessage::RegisterRemoteServer { request },
                    Self::UNREGISTER_REMOTE_SERVER => {
                        ControlMessage::UnregisterRemoteServer { request }
                    }
                    Self::REQUEST_MANAGER_SHUTDOWN => {
                        ControlMessage::RequestManagerShutdown { request }
                    }
                    _ => ControlMessage::Response {
                        request,
                        accepted: tag == Self::RESPONSE_TRUE,
                    },
                }
            }
        }
    }
}

/// Decodes control messages from a system channel's byte stream.
///
/// Messages may be coalesced into one frame or split across frames, so the
/// channel keeps a buffer and this codec cuts complete messages out of it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ControlCodec;

impl Decoder for ControlCodec {
    type Item = ControlMessage;
    type Error = MuxError;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> std::result::Result<Option<Self::Item>, Self::Error> {
        let Some(&tag) = src.first() else {
            return Ok(None);
        };

        let needed = 1 + 4 * ControlMessage::arity(tag)?;
        if src.len() < needed {
            src.reserve(needed - src.len());
            return Ok(None);
        }

        src.advance(1);
        Ok(Some(ControlMessage::decode_body(tag, src)))
    }
}

impl Encoder<ControlMessage> for ControlCodec {
    type Error = MuxError;

    fn encode(
        &mut self,
        message: ControlMessage,
        dst: &mut BytesMut,
    ) -> std::result::Result<(), Self::Error> {
        message.encode(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_messages() -> Vec<ControlMessage> {
        vec![
            ControlMessage::Connect {
                client: SocketId::new(12),
            },
            ControlMessage::Connected {
                client: SocketId::new(12),
                assigned: SocketId::new(40),
            },
            ControlMessage::ConnectRefused {
                client: SocketId::new(12),
            },
            ControlMessage::ConnectVerified {
                assigned: SocketId::new(40),
            },
            ControlMessage::OutputShutdown {
                id: SocketId::new(3),
            },
            ControlMessage::Disconnect {
                id: SocketId::new(3),
            },
            ControlMessage::RegisterRemoteServer { request: 1 },
            ControlMessage::UnregisterRemoteServer { request: 2 },
            ControlMessage::RequestManagerShutdown {
                request: u32::MAX,
            },
            ControlMessage::Response {
                request: 9,
                accepted: true,
            },
            ControlMessage::Response {
                request: 9,
                accepted: false,
            },
        ]
    }

    #[test]
    fn test_encoded_layout() {
        let mut buf = BytesMut::new();
        ControlMessage::Disconnect {
            id: SocketId::new(0x0A0B_0C0D),
        }
        .encode(&mut buf);
        assert_eq!(&buf[..], &[ControlMessage::DISCONNECT, 0x0A, 0x0B, 0x0C, 0x0D]);

        let mut buf = BytesMut::new();
        ControlMessage::Response {
            request: 7,
            accepted: false,
        }
        .encode(&mut buf);
        assert_eq!(&buf[..], &[ControlMessage::RESPONSE_FALSE, 0, 0, 0, 7]);
    }

    #[test]
    fn test_coalesced_stream_decodes_in_order() {
        let mut codec = ControlCodec;
        let mut buf = BytesMut::new();
        for message in all_messages() {
            assert!(message.encoded_len() <= ControlMessage::MAX_ENCODED_LEN);
            codec.encode(message, &mut buf).unwrap();
        }

        let mut decoded = Vec::new();
        while let Some(message) = codec.decode(&mut buf).unwrap() {
            decoded.push(message);
        }
        assert_eq!(decoded, all_messages());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_split_message_waits_for_rest() {
        let mut codec = ControlCodec;
        let mut whole = BytesMut::new();
        ControlMessage::Connected {
            client: SocketId::new(1),
            assigned: SocketId::new(2),
        }
        .encode(&mut whole);

        let mut buf = BytesMut::from(&whole[..6]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 6);

        buf.extend_from_slice(&whole[6..]);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(ControlMessage::Connected {
                client: SocketId::new(1),
                assigned: SocketId::new(2),
            })
        );
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let mut codec = ControlCodec;
        let mut buf = BytesMut::from(&[200u8, 0, 0, 0, 1][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(MuxError::UnknownControlMessage(200))
        ));

        let mut buf = BytesMut::from(&[0u8][..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_channels() {
        assert_eq!(
            ControlMessage::Connect {
                client: SocketId::new(1)
            }
            .channel(),
            SocketId::SERVER_ACCEPT
        );
        assert_eq!(
            ControlMessage::ConnectRefused {
                client: SocketId::new(1)
            }
            .channel(),
            SocketId::ACCEPT_ANSWER
        );
        assert_eq!(
            ControlMessage::Response {
                request: 1,
                accepted: true
            }
            .channel(),
            SocketId::CONTROL
        );
        assert_eq!(
            ControlMessage::RequestManagerShutdown { request: 1 }.channel(),
            SocketId::BACK_CHANNEL
        );
    }

    #[test]
    fn test_request_ids() {
        assert_eq!(
            ControlMessage::RegisterRemoteServer { request: 5 }.request_id(),
            Some(5)
        );
        assert_eq!(
            ControlMessage::Disconnect {
                id: SocketId::new(5)
            }
            .request_id(),
            None
        );
    }
}
