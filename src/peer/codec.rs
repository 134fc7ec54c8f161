//! Length-prefixed framing for [`Message`] over a `tokio_util::codec::Framed`
//! transport.
use super::message::{Message, MAX_MESSAGE_LEN};
use super::PeerError;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

#[derive(Debug, Default)]
pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {
    type Error = PeerError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item.id() {
            None => dst.put_u32(0),
            Some(id) => {
                let payload = item.encode_payload();
                dst.put_u32(1 + payload.len() as u32);
                dst.put_u8(id);
                dst.put_slice(&payload);
            }
        }
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let length = u32::from_be_bytes(src[0..4].try_into().unwrap());
        if length == 0 {
            src.advance(4);
            return Ok(Some(Message::KeepAlive));
        }
        if length > MAX_MESSAGE_LEN {
            return Err(PeerError::MessageTooLarge(length));
        }
        let total = 4 + length as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        src.advance(4);
        let id = src[0];
        let payload = src[1..length as usize].to_vec();
        src.advance(length as usize);
        Message::parse(id, &payload).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn decoder_waits_for_a_complete_frame() {
        let mut codec = MessageCodec;
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&13u32.to_be_bytes());
        buf.extend_from_slice(&[6]); // request id, but missing its 12-byte payload
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn round_trips_an_interested_message() {
        let mut codec = MessageCodec;
        let mut buf = BytesMut::new();
        codec.encode(Message::Interested, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::Interested);
        assert!(buf.is_empty());
    }

    #[test]
    fn round_trips_a_keep_alive() {
        let mut codec = MessageCodec;
        let mut buf = BytesMut::new();
        codec.encode(Message::KeepAlive, &mut buf).unwrap();
        assert_eq!(buf.len(), 4);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::KeepAlive);
    }

    #[test]
    fn rejects_a_length_prefix_above_the_hard_cap() {
        let mut codec = MessageCodec;
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&(MAX_MESSAGE_LEN + 1).to_be_bytes());
        assert!(codec.decode(&mut buf).is_err());
    }
}
