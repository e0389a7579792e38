//! Transaction construction via the builder pattern.
//!
//! [`TransactionBuilder::build`] seals the hash, so a built transaction is
//! always self-consistent. Changing fields afterwards requires calling
//! [`Transaction::seal`] again.

use serde::{Deserialize, Serialize};

use super::types::{Address, TxHash};

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// A value transfer as admitted by the pool.
///
/// # Canonical Byte Format
///
/// [`Transaction::signable_bytes`] lays out: from (20), to (20), value
/// (u64 LE), nonce (u64 LE), then `data` and `computation_proof`, each as a
/// u32 LE length followed by the bytes. `hash` and `signature` are excluded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: TxHash,
    pub from: Address,
    pub to: Address,
    pub value: u64,
    /// Per-sender sequence number.
    pub nonce: u64,
    #[serde(with = "hex::serde", default)]
    pub data: Vec<u8>,
    #[serde(with = "hex::serde", default)]
    pub signature: Vec<u8>,
    #[serde(with = "hex::serde", default)]
    pub computation_proof: Vec<u8>,
}

/// Fixed part of the encoding: hash, from, to, value, nonce and three
/// length prefixes.
const FIXED_ENCODED_LEN: usize = 32 + 20 + 20 + 8 + 8 + 3 * 4;

fn push_blob(buf: &mut Vec<u8>, blob: &[u8]) {
    buf.extend_from_slice(&(blob.len() as u32).to_le_bytes());
    buf.extend_from_slice(blob);
}

impl Transaction {
    /// Bytes covered by the hash and by signatures.
    pub fn signable_bytes(&self) -> Vec<u8> {
        let mut buf =
            Vec::with_capacity(56 + 8 + self.data.len() + self.computation_proof.len());
        buf.extend_from_slice(self.from.as_bytes());
        buf.extend_from_slice(self.to.as_bytes());
        buf.extend_from_slice(&self.value.to_le_bytes());
        buf.extend_from_slice(&self.nonce.to_le_bytes());
        push_blob(&mut buf, &self.data);
        push_blob(&mut buf, &self.computation_proof);
        buf
    }

    /// `blake3(signable_bytes)`.
    pub fn compute_hash(&self) -> TxHash {
        TxHash(*blake3::hash(&self.signable_bytes()).as_bytes())
    }

    /// Recompute and store the hash.
    pub fn seal(&mut self) {
        self.hash = self.compute_hash();
    }

    /// `true` if the stored hash matches the content.
    pub fn is_sealed(&self) -> bool {
        self.hash == self.compute_hash()
    }

    /// Size of the full canonical encoding, signature and hash included.
    /// This is the size the pool's `max_transaction_size` limit applies to.
    pub fn size(&self) -> usize {
        FIXED_ENCODED_LEN + self.data.len() + self.signature.len() + self.computation_proof.len()
    }

    /// `true` if every field holds its zero value.
    pub fn is_empty(&self) -> bool {
        *self == Transaction::default()
    }
}

// ---------------------------------------------------------------------------
// TransactionBuilder
// ---------------------------------------------------------------------------

/// Fluent builder for [`Transaction`].
///
/// ```
/// use aporia_protocol::transaction::{Address, TransactionBuilder};
///
/// let tx = TransactionBuilder::new(Address([1; 20]), Address([2; 20]))
///     .value(500)
///     .nonce(0)
///     .proof(vec![0xaa; 8])
///     .signature(vec![0x01; 64])
///     .build();
/// assert!(tx.is_sealed());
/// ```
#[derive(Debug, Clone)]
pub struct TransactionBuilder {
    tx: Transaction,
}

impl TransactionBuilder {
    pub fn new(from: Address, to: Address) -> Self {
        Self {
            tx: Transaction {
                from,
                to,
                ..Transaction::default()
            },
        }
    }

    pub fn value(mut self, value: u64) -> Self {
        self.tx.value = value;
        self
    }

    pub fn nonce(mut self, nonce: u64) -> Self {
        self.tx.nonce = nonce;
        self
    }

    pub fn data(mut self, data: Vec<u8>) -> Self {
        self.tx.data = data;
        self
    }

    pub fn proof(mut self, proof: Vec<u8>) -> Self {
        self.tx.computation_proof = proof;
        self
    }

    pub fn signature(mut self, signature: Vec<u8>) -> Self {
        self.tx.signature = signature;
        self
    }

    /// Finish and seal the hash.
    pub fn build(self) -> Transaction {
        let mut tx = self.tx;
        tx.seal();
        tx
    }
}
