//! The handshake and peer message wire codecs.
//!
//! A connection starts out framed by [`HandshakeCodec`] and is switched over
//! to [`PeerCodec`] once the handshakes are exchanged, carrying over the read
//! and write buffers of the first codec.

use std::{convert::TryFrom, io};

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{error::*, Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash};

/// The protocol string of BitTorrent v1, preceding the handshake fields.
pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The handshake is the first exchange on a connection, identifying the
/// torrent and the peers to each other.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Handshake {
    /// The protocol string, always [`PROTOCOL_STRING`].
    pub prot: [u8; 19],
    /// Reserved for extensions, all zeroes as we support none.
    pub reserved: [u8; 8],
    /// The torrent's SHA-1 info hash.
    pub info_hash: Sha1Hash,
    /// The sending peer's arbitrary id.
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Self {
            prot,
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }
}

pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(&mut self, handshake: Handshake, buf: &mut BytesMut) -> Result<()> {
        let Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        } = handshake;
        buf.reserve(68);
        buf.put_u8(prot.len() as u8);
        buf.put_slice(&prot);
        buf.put_slice(&reserved);
        buf.put_slice(&info_hash);
        buf.put_slice(&peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Handshake>> {
        if buf.is_empty() {
            return Ok(None);
        }

        // the length of the protocol string is sent first, in the clear even
        // on ciphered connections, and pins down the rest of the frame
        let prot_len = buf[0] as usize;
        if prot_len == 0 || prot_len != PROTOCOL_STRING.len() {
            return Err(Error::InvalidProtocol);
        }
        let payload_len = 48 + prot_len;
        if buf.len() < 1 + payload_len {
            buf.reserve(1 + payload_len - buf.len());
            return Ok(None);
        }
        buf.advance(1);

        let mut prot = [0; 19];
        buf.copy_to_slice(&mut prot);
        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            prot,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

/// The id byte of each peer message, sent right after the length prefix.
#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(u8)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Block = 7,
    Cancel = 8,
}

impl TryFrom<u8> for MessageId {
    type Error = u8;

    fn try_from(id: u8) -> Result<Self, u8> {
        use MessageId::*;
        match id {
            0 => Ok(Choke),
            1 => Ok(Unchoke),
            2 => Ok(Interested),
            3 => Ok(NotInterested),
            4 => Ok(Have),
            5 => Ok(Bitfield),
            6 => Ok(Request),
            7 => Ok(Block),
            8 => Ok(Cancel),
            id => Err(id),
        }
    }
}

/// A peer protocol message.
///
/// A zero length frame, carrying neither id nor payload, is a keep-alive.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece_index: PieceIndex,
    },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Block {
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    },
    Cancel(BlockInfo),
}

impl Message {
    /// Returns the message's wire id, or none for a keep-alive.
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield(_) => Some(MessageId::Bitfield),
            Message::Request(_) => Some(MessageId::Request),
            Message::Block { .. } => Some(MessageId::Block),
            Message::Cancel(_) => Some(MessageId::Cancel),
        }
    }
}

pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> Result<()> {
        use Message::*;
        match msg {
            KeepAlive => {
                buf.put_u32(0);
            }
            Choke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            Unchoke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            Interested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            NotInterested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            Have { piece_index } => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index as u32);
            }
            Bitfield(bitfield) => {
                buf.put_u32(1 + bitfield.as_slice().len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(bitfield.as_slice());
            }
            Request(block) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Request as u8);
                put_block_info(buf, block);
            }
            Block {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Block as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.put_slice(&data);
            }
            Cancel(block) => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Cancel as u8);
                put_block_info(buf, block);
            }
        }
        Ok(())
    }
}

fn put_block_info(buf: &mut BytesMut, block: BlockInfo) {
    buf.put_u32(block.piece_index as u32);
    buf.put_u32(block.offset);
    buf.put_u32(block.len);
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>> {
        // messages with ids we don't know are consumed and skipped, so keep
        // framing until a known message or the end of the buffer
        loop {
            if buf.len() < 4 {
                return Ok(None);
            }
            let msg_len = {
                let mut prefix = &buf[..4];
                prefix.get_u32() as usize
            };
            if msg_len == 0 {
                buf.advance(4);
                return Ok(Some(Message::KeepAlive));
            }
            if buf.len() < 4 + msg_len {
                buf.reserve(4 + msg_len - buf.len());
                return Ok(None);
            }
            buf.advance(4);
            let id = buf.get_u8();
            let payload_len = msg_len - 1;
            let id = match MessageId::try_from(id) {
                Ok(id) => id,
                Err(id) => {
                    log::debug!("skipping unknown message id {}", id);
                    buf.advance(payload_len);
                    continue;
                }
            };

            let msg = match id {
                MessageId::Choke => {
                    expect_payload_len(payload_len, 0)?;
                    Message::Choke
                }
                MessageId::Unchoke => {
                    expect_payload_len(payload_len, 0)?;
                    Message::Unchoke
                }
                MessageId::Interested => {
                    expect_payload_len(payload_len, 0)?;
                    Message::Interested
                }
                MessageId::NotInterested => {
                    expect_payload_len(payload_len, 0)?;
                    Message::NotInterested
                }
                MessageId::Have => {
                    expect_payload_len(payload_len, 4)?;
                    Message::Have {
                        piece_index: buf.get_u32() as PieceIndex,
                    }
                }
                MessageId::Bitfield => {
                    let bytes = buf.split_to(payload_len);
                    Message::Bitfield(Bitfield::from_vec(bytes.to_vec()))
                }
                MessageId::Request => {
                    expect_payload_len(payload_len, 12)?;
                    Message::Request(get_block_info(buf))
                }
                MessageId::Block => {
                    if payload_len < 8 {
                        return Err(Error::InvalidMessage);
                    }
                    let piece_index = buf.get_u32() as PieceIndex;
                    let offset = buf.get_u32();
                    let data = buf.split_to(payload_len - 8).to_vec();
                    Message::Block {
                        piece_index,
                        offset,
                        data,
                    }
                }
                MessageId::Cancel => {
                    expect_payload_len(payload_len, 12)?;
                    Message::Cancel(get_block_info(buf))
                }
            };
            return Ok(Some(msg));
        }
    }
}

fn expect_payload_len(actual: usize, expected: usize) -> Result<()> {
    if actual == expected {
        Ok(())
    } else {
        Err(Error::InvalidMessage)
    }
}

fn get_block_info(buf: &mut BytesMut) -> BlockInfo {
    BlockInfo {
        piece_index: buf.get_u32() as PieceIndex,
        offset: buf.get_u32(),
        len: buf.get_u32(),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn encode_handshake(handshake: Handshake) -> BytesMut {
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut buf).unwrap();
        buf
    }

    fn encode(msg: Message) -> BytesMut {
        let mut buf = BytesMut::new();
        PeerCodec.encode(msg, &mut buf).unwrap();
        buf
    }

    fn decode(buf: &mut BytesMut) -> Option<Message> {
        PeerCodec.decode(buf).unwrap()
    }

    #[test]
    fn test_handshake_wire_format() {
        let buf = encode_handshake(Handshake::new([0xAA; 20], [0xBB; 20]));
        assert_eq!(buf.len(), 68);
        assert_eq!(buf[0], 19);
        assert_eq!(&buf[1..20], PROTOCOL_STRING.as_bytes());
        assert_eq!(&buf[20..28], &[0; 8]);
        assert_eq!(&buf[28..48], &[0xAA; 20]);
        assert_eq!(&buf[48..68], &[0xBB; 20]);
    }

    #[test]
    fn test_handshake_roundtrip() {
        let handshake = Handshake::new([0x1F; 20], *b"-GT001-0123456789012");
        let mut buf = encode_handshake(handshake.clone());
        assert_eq!(HandshakeCodec.decode(&mut buf).unwrap(), Some(handshake));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_handshake_needs_whole_frame() {
        let mut buf = encode_handshake(Handshake::new([0xAA; 20], [0xBB; 20]));
        let mut partial = buf.split_to(20);
        assert_eq!(HandshakeCodec.decode(&mut partial).unwrap(), None);
        partial.unsplit(buf);
        assert!(HandshakeCodec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn test_handshake_zero_pstrlen_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(0);
        buf.put_slice(&[0; 67]);
        assert!(matches!(
            HandshakeCodec.decode(&mut buf),
            Err(Error::InvalidProtocol)
        ));
    }

    #[test]
    fn test_request_wire_format() {
        let buf = encode(Message::Request(BlockInfo {
            piece_index: 12,
            offset: 16384,
            len: 16384,
        }));
        assert_eq!(
            buf.as_ref(),
            [
                0x00, 0x00, 0x00, 0x0D, 0x06, 0x00, 0x00, 0x00, 0x0C, 0x00,
                0x00, 0x40, 0x00, 0x00, 0x00, 0x40, 0x00
            ]
        );
    }

    #[test]
    fn test_keep_alive_wire_format() {
        let buf = encode(Message::KeepAlive);
        assert_eq!(buf.as_ref(), [0, 0, 0, 0]);
        let mut buf = BytesMut::from(&[0u8, 0, 0, 0][..]);
        assert_eq!(decode(&mut buf), Some(Message::KeepAlive));
    }

    #[test]
    fn test_message_roundtrips() {
        let msgs = vec![
            Message::KeepAlive,
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have { piece_index: 42 },
            // a bitfield with a bit count divisible by 8 survives unchanged
            Message::Bitfield(Bitfield::from_vec(vec![0b1010_0001, 0xFF])),
            Message::Request(BlockInfo {
                piece_index: 1,
                offset: 0x4000,
                len: 0x4000,
            }),
            Message::Block {
                piece_index: 3,
                offset: 0x8000,
                data: vec![0xFE; 100],
            },
            Message::Cancel(BlockInfo {
                piece_index: 9,
                offset: 0,
                len: 0x4000,
            }),
        ];
        for msg in msgs {
            let mut buf = encode(msg.clone());
            assert_eq!(decode(&mut buf), Some(msg));
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_partial_frame_is_not_consumed() {
        let mut full = encode(Message::Have { piece_index: 7 });
        let mut partial = full.split_to(5);
        assert_eq!(decode(&mut partial), None);
        assert_eq!(partial.len(), 5);
        partial.unsplit(full);
        assert_eq!(decode(&mut partial), Some(Message::Have { piece_index: 7 }));
    }

    #[test]
    fn test_unknown_message_id_is_skipped() {
        let mut buf = BytesMut::new();
        // an extension-protocol style message with id 20 and a 3 byte payload
        buf.put_u32(4);
        buf.put_u8(20);
        buf.put_slice(&[1, 2, 3]);
        // followed by a message we do understand
        buf.put_u32(1);
        buf.put_u8(MessageId::Unchoke as u8);
        assert_eq!(decode(&mut buf), Some(Message::Unchoke));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_malformed_have_is_an_error() {
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_u8(MessageId::Have as u8);
        buf.put_slice(&[0, 1]);
        assert!(matches!(
            PeerCodec.decode(&mut buf),
            Err(Error::InvalidMessage)
        ));
    }
}
