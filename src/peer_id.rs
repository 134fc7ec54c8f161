//! The locally-generated client identifier sent in every handshake and
//! tracker announce.
use rand::Rng;
use std::fmt;

const CLIENT_PREFIX: &[u8; 8] = b"-RE0100-";

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; 20]);

impl PeerId {
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// `-`, a two-letter client tag, four version digits, `-`, then 12
    /// random bytes, per the usual Azureus-style convention.
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        id[..CLIENT_PREFIX.len()].copy_from_slice(CLIENT_PREFIX);
        let mut rng = rand::rng();
        rng.fill(&mut id[CLIENT_PREFIX.len()..]);
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn url_encode(&self) -> String {
        crate::util::percent_encode_bytes(&self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_id_carries_client_prefix() {
        let id = PeerId::generate();
        assert_eq!(&id.as_bytes()[..8], CLIENT_PREFIX);
    }

    #[test]
    fn two_generated_ids_differ() {
        assert_ne!(PeerId::generate(), PeerId::generate());
    }
}
