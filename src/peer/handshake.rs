//! The BitTorrent handshake: the first 68 bytes exchanged on every peer
//! connection, verifying both sides are talking about the same torrent.
use super::{PeerError, PeerResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::instrument;

const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self { reserved: [0u8; 8], info_hash, peer_id }
    }

    pub fn serialize(&self) -> [u8; 68] {
        let mut buf = [0u8; 68];
        buf[0] = 19;
        buf[1..20].copy_from_slice(PROTOCOL);
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Reads and validates a handshake from any async byte stream. Used for
    /// both the dialing and accepting sides; `dial` below builds on top of
    /// this single read path instead of duplicating it.
    #[instrument(level = "trace", skip(stream))]
    pub async fn read<S: AsyncRead + Unpin>(stream: &mut S) -> PeerResult<Self> {
        let mut buf = [0u8; 68];
        stream.read_exact(&mut buf).await?;
        if buf[0] != 19 || &buf[1..20] != PROTOCOL.as_slice() {
            return Err(PeerError::InvalidProtocol);
        }
        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);
        Ok(Self { reserved, info_hash, peer_id })
    }

    pub async fn write<S: AsyncWrite + Unpin>(&self, stream: &mut S) -> PeerResult<()> {
        stream.write_all(&self.serialize()).await?;
        Ok(())
    }

    pub fn validate_info_hash(&self, expected: &[u8; 20]) -> PeerResult<()> {
        if &self.info_hash != expected {
            return Err(PeerError::InfoHashMismatch);
        }
        Ok(())
    }

    /// Rejects a handshake that names our own peer id, which can only mean
    /// we've connected back to ourselves (a loopback listen port, a NAT
    /// reflection, or a malicious peer replaying our id).
    pub fn validate_not_self(&self, our_peer_id: &[u8; 20]) -> PeerResult<()> {
        if &self.peer_id == our_peer_id {
            return Err(PeerError::SelfConnection);
        }
        Ok(())
    }

    /// Performs the outbound half of a handshake: connect, send ours, read
    /// and validate theirs. The accepting side instead reads first (its
    /// info_hash isn't known until the peer's handshake arrives) and calls
    /// [`Handshake::write`] in response; both paths share `read`/`write`.
    #[instrument(level = "debug", skip(info_hash, peer_id))]
    pub async fn dial(
        addr: std::net::SocketAddr,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
    ) -> PeerResult<(TcpStream, Handshake)> {
        let mut stream = TcpStream::connect(addr).await?;
        let ours = Handshake::new(info_hash, peer_id);
        ours.write(&mut stream).await?;
        let theirs = Handshake::read(&mut stream).await?;
        theirs.validate_info_hash(&info_hash)?;
        theirs.validate_not_self(&peer_id)?;
        Ok((stream, theirs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_produces_the_68_byte_wire_layout() {
        let hs = Handshake::new([1u8; 20], [2u8; 20]);
        let buf = hs.serialize();
        assert_eq!(buf.len(), 68);
        assert_eq!(buf[0], 19);
        assert_eq!(&buf[1..20], PROTOCOL.as_slice());
        assert_eq!(&buf[28..48], [1u8; 20].as_slice());
        assert_eq!(&buf[48..68], [2u8; 20].as_slice());
    }

    #[tokio::test]
    async fn read_round_trips_through_serialize() {
        let hs = Handshake::new([3u8; 20], [4u8; 20]);
        let mut buf = std::io::Cursor::new(hs.serialize().to_vec());
        let parsed = Handshake::read(&mut buf).await.unwrap();
        assert_eq!(parsed, hs);
    }

    #[tokio::test]
    async fn read_rejects_wrong_protocol_string() {
        let mut bytes = Handshake::new([0u8; 20], [0u8; 20]).serialize();
        bytes[1] = b'X';
        let mut buf = std::io::Cursor::new(bytes.to_vec());
        let err = Handshake::read(&mut buf).await.unwrap_err();
        assert!(matches!(err, PeerError::InvalidProtocol));
    }

    #[test]
    fn validate_info_hash_rejects_mismatch() {
        let hs = Handshake::new([1u8; 20], [2u8; 20]);
        assert!(hs.validate_info_hash(&[9u8; 20]).is_err());
        assert!(hs.validate_info_hash(&[1u8; 20]).is_ok());
    }

    #[test]
    fn validate_not_self_rejects_our_own_peer_id() {
        let hs = Handshake::new([1u8; 20], [2u8; 20]);
        assert!(matches!(hs.validate_not_self(&[2u8; 20]), Err(PeerError::SelfConnection)));
        assert!(hs.validate_not_self(&[3u8; 20]).is_ok());
    }
}
