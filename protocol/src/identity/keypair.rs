//! Node keypair and the peer id derived from it.

use libp2p::identity::{Keypair, PublicKey};
use libp2p::PeerId;
use std::fmt;

/// Errors raised while loading or using a node key.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("invalid key encoding: {0}")]
    Decoding(#[from] libp2p::identity::DecodingError),
}

/// A node's long-lived identity: the signing keypair plus its derived
/// [`PeerId`].
///
/// Cloning is cheap enough to hand a copy to the transport; both copies
/// refer to the same key material.
#[derive(Clone)]
pub struct NodeIdentity {
    keypair: Keypair,
    peer_id: PeerId,
}

impl NodeIdentity {
    /// Generate a fresh ed25519 identity.
    pub fn generate() -> Self {
        Self::from_keypair(Keypair::generate_ed25519())
    }

    /// Wrap an existing keypair.
    pub fn from_keypair(keypair: Keypair) -> Self {
        let peer_id = keypair.public().to_peer_id();
        Self { keypair, peer_id }
    }

    /// Decode a keypair from its protobuf encoding (the key file format).
    pub fn from_protobuf_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        let keypair = Keypair::from_protobuf_encoding(bytes)?;
        Ok(Self::from_keypair(keypair))
    }

    /// Encode the keypair for storage. The output contains secret material.
    pub fn to_protobuf_bytes(&self) -> Result<Vec<u8>, IdentityError> {
        Ok(self.keypair.to_protobuf_encoding()?)
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public()
    }

    /// The key the swarm authenticates connections with.
    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }
}

// Key bytes never reach logs; only the peer id is printed.
impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("peer_id", &self.peer_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_derives_peer_id() {
        let id = NodeIdentity::generate();
        assert_eq!(id.peer_id(), id.public_key().to_peer_id());
    }

    #[test]
    fn test_distinct_identities() {
        assert_ne!(
            NodeIdentity::generate().peer_id(),
            NodeIdentity::generate().peer_id()
        );
    }

    #[test]
    fn test_protobuf_roundtrip_keeps_peer_id() {
        let id = NodeIdentity::generate();
        let bytes = id.to_protobuf_bytes().unwrap();
        let restored = NodeIdentity::from_protobuf_bytes(&bytes).unwrap();
        assert_eq!(id.peer_id(), restored.peer_id());
    }

    #[test]
    fn test_garbage_key_rejected() {
        assert!(NodeIdentity::from_protobuf_bytes(b"not a key").is_err());
    }

    #[test]
    fn test_keypair_matches_peer_id() {
        let id = NodeIdentity::generate();
        assert_eq!(id.keypair().public().to_peer_id(), id.peer_id());
    }

    #[test]
    fn test_debug_hides_key_material() {
        let id = NodeIdentity::generate();
        let dbg = format!("{id:?}");
        assert!(dbg.contains(&id.peer_id().to_string()));
    }
}
