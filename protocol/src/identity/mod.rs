//! # Identity Module
//!
//! Node identity for the peer-to-peer layer. Every node is identified by an
//! ed25519 keypair, from which the libp2p [`PeerId`](libp2p::PeerId) is
//! derived. The peer id is what other nodes see in addresses
//! (`/ip4/.../tcp/.../p2p/<id>`) and in the `from` field of every message.
//!
//! The keypair is supplied at node construction (generated fresh, or loaded
//! from a key file by the node binary) and never changes afterwards. The
//! transport hands it to the noise handshake, so every connection is bound
//! to the peer id on both ends.

pub mod keypair;

pub use keypair::{IdentityError, NodeIdentity};
