//! The peer wire message set: the 10 core message types exchanged after the
//! handshake, their length-prefixed binary encoding, and tolerance for
//! extension messages (BEP 10 and friends) we don't implement.
use super::{PeerError, PeerResult};

/// Guards against a hostile or corrupt length prefix claiming gigabytes;
/// the largest real message is a `Piece` carrying one block, well under
/// this.
pub const MAX_MESSAGE_LEN: u32 = 1 << 20;

/// Message IDs at or above this are extension protocol messages we don't
/// implement; they're parsed as [`Message::Unknown`] and ignored rather than
/// rejected, as long as the length prefix stays under `MAX_MESSAGE_LEN`.
const FIRST_EXTENSION_ID: u8 = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield(Vec<u8>),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    Port(u16),
    /// A bounded-size message with an id we don't recognize (extension
    /// protocol and beyond); kept around only so the wire stays in sync,
    /// never acted on.
    Unknown { id: u8, payload: Vec<u8> },
}

fn require_len(payload: &[u8], expected: usize, what: &'static str) -> PeerResult<()> {
    if payload.len() != expected {
        return Err(PeerError::MalformedMessage(format!(
            "{what}: expected {expected} payload bytes, got {}",
            payload.len()
        )));
    }
    Ok(())
}

fn read_u32(payload: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes(payload[offset..offset + 4].try_into().unwrap())
}

impl Message {
    pub fn id(&self) -> Option<u8> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(0),
            Message::Unchoke => Some(1),
            Message::Interested => Some(2),
            Message::NotInterested => Some(3),
            Message::Have { .. } => Some(4),
            Message::Bitfield(_) => Some(5),
            Message::Request { .. } => Some(6),
            Message::Piece { .. } => Some(7),
            Message::Cancel { .. } => Some(8),
            Message::Port(_) => Some(9),
            Message::Unknown { id, .. } => Some(*id),
        }
    }

    /// Parses the payload that follows the 1-byte message id (the 4-byte
    /// length prefix has already been consumed by the caller).
    pub fn parse(id: u8, payload: &[u8]) -> PeerResult<Message> {
        match id {
            0 => {
                require_len(payload, 0, "choke")?;
                Ok(Message::Choke)
            }
            1 => {
                require_len(payload, 0, "unchoke")?;
                Ok(Message::Unchoke)
            }
            2 => {
                require_len(payload, 0, "interested")?;
                Ok(Message::Interested)
            }
            3 => {
                require_len(payload, 0, "not_interested")?;
                Ok(Message::NotInterested)
            }
            4 => {
                require_len(payload, 4, "have")?;
                Ok(Message::Have { piece_index: read_u32(payload, 0) })
            }
            5 => Ok(Message::Bitfield(payload.to_vec())),
            6 => {
                require_len(payload, 12, "request")?;
                Ok(Message::Request {
                    index: read_u32(payload, 0),
                    begin: read_u32(payload, 4),
                    length: read_u32(payload, 8),
                })
            }
            7 => {
                if payload.len() < 8 {
                    return Err(PeerError::MalformedMessage("piece: payload shorter than header".into()));
                }
                Ok(Message::Piece {
                    index: read_u32(payload, 0),
                    begin: read_u32(payload, 4),
                    block: payload[8..].to_vec(),
                })
            }
            8 => {
                require_len(payload, 12, "cancel")?;
                Ok(Message::Cancel {
                    index: read_u32(payload, 0),
                    begin: read_u32(payload, 4),
                    length: read_u32(payload, 8),
                })
            }
            9 => {
                require_len(payload, 2, "port")?;
                Ok(Message::Port(u16::from_be_bytes([payload[0], payload[1]])))
            }
            id if id >= FIRST_EXTENSION_ID => Ok(Message::Unknown { id, payload: payload.to_vec() }),
            other => Err(PeerError::MalformedMessage(format!("unknown core message id {other}"))),
        }
    }

    /// Encodes the payload that follows the message id (callers prepend the
    /// 4-byte length prefix and 1-byte id).
    pub fn encode_payload(&self) -> Vec<u8> {
        match self {
            Message::KeepAlive | Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => {
                Vec::new()
            }
            Message::Have { piece_index } => piece_index.to_be_bytes().to_vec(),
            Message::Bitfield(bits) => bits.clone(),
            Message::Request { index, begin, length } | Message::Cancel { index, begin, length } => {
                let mut buf = Vec::with_capacity(12);
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(&length.to_be_bytes());
                buf
            }
            Message::Piece { index, begin, block } => {
                let mut buf = Vec::with_capacity(8 + block.len());
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(block);
                buf
            }
            Message::Port(port) => port.to_be_bytes().to_vec(),
            Message::Unknown { payload, .. } => payload.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn have_round_trips() {
        let msg = Message::Have { piece_index: 42 };
        let payload = msg.encode_payload();
        let parsed = Message::parse(4, &payload).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn request_round_trips() {
        let msg = Message::Request { index: 1, begin: 16384, length: 16384 };
        let payload = msg.encode_payload();
        let parsed = Message::parse(6, &payload).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn piece_round_trips_with_arbitrary_block_length() {
        let msg = Message::Piece { index: 2, begin: 0, block: vec![1, 2, 3, 4, 5] };
        let payload = msg.encode_payload();
        let parsed = Message::parse(7, &payload).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn rejects_wrong_length_payload_for_fixed_size_messages() {
        let err = Message::parse(4, &[0u8; 3]).unwrap_err();
        assert!(matches!(err, PeerError::MalformedMessage(_)));
    }

    #[test]
    fn rejects_reserved_fast_extension_id() {
        let err = Message::parse(14, &[]).unwrap_err();
        assert!(matches!(err, PeerError::MalformedMessage(_)));
    }

    #[test]
    fn tolerates_bounded_extension_protocol_messages() {
        let parsed = Message::parse(20, &[1, 2, 3]).unwrap();
        assert_eq!(parsed, Message::Unknown { id: 20, payload: vec![1, 2, 3] });
        let parsed = Message::parse(200, &[]).unwrap();
        assert_eq!(parsed, Message::Unknown { id: 200, payload: vec![] });
    }
}
