//! Transaction admission rules.
//!
//! [`Validator::validate_transaction`] runs four check groups in a fixed
//! order and stops at the first failure:
//!
//! 1. **Basics**: non-empty transaction, non-zero sender, non-zero value.
//! 2. **Nonce**: a sender without history must start at nonce 0; a known
//!    sender must present exactly `highest + 1`.
//! 3. **Computation proof**: present, cost inside
//!    `[min_computation_cost, max_computation_cost]`, accepted by the
//!    [`ProofVerifier`].
//! 4. **Signature**: present and accepted by the [`SignatureVerifier`].
//!
//! Validation never mutates state. The per-sender nonce only moves through
//! [`Validator::update_nonce`], which the transaction handler calls once a
//! transaction is confirmed. Together with the pool refusing a second
//! pending transaction at the same nonce, a sender has at most one
//! admission outstanding at a time.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::config::{
    MAX_COMPUTATION_COST, MIN_COMPUTATION_COST, SIGNATURE_MAX_LEN, SIGNATURE_MIN_LEN,
};
use crate::transaction::{Address, Transaction};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ValidationConfig {
    /// Proofs cheaper than this are rejected as insufficient work.
    pub min_computation_cost: u64,
    /// Proofs costlier than this are rejected as excessive.
    pub max_computation_cost: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_computation_cost: MIN_COMPUTATION_COST,
            max_computation_cost: MAX_COMPUTATION_COST,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("empty transaction")]
    EmptyTransaction,

    #[error("missing sender address")]
    MissingSender,

    #[error("zero transaction value")]
    ZeroValue,

    #[error("invalid nonce: expected {expected}, got {got}")]
    InvalidNonce { expected: u64, got: u64 },

    #[error("missing computation proof")]
    MissingProof,

    #[error("insufficient computation: cost {cost} below minimum {min}")]
    InsufficientComputation { cost: u64, min: u64 },

    #[error("excessive computation: cost {cost} above maximum {max}")]
    ExcessiveComputation { cost: u64, max: u64 },

    #[error("invalid computation proof")]
    InvalidProof,

    #[error("missing signature")]
    MissingSignature,

    #[error("invalid signature")]
    InvalidSignature,
}

// ---------------------------------------------------------------------------
// Verifier seams
// ---------------------------------------------------------------------------

/// External computation-proof service.
pub trait ProofVerifier: Send + Sync {
    /// Cost the proof claims to represent.
    fn computation_cost(&self, proof: &[u8]) -> u64;

    /// Pass/fail check of the proof itself.
    fn verify(&self, proof: &[u8]) -> bool;
}

/// External signature check over a whole transaction.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, tx: &Transaction) -> bool;
}

impl<F> SignatureVerifier for F
where
    F: Fn(&Transaction) -> bool + Send + Sync,
{
    fn verify(&self, tx: &Transaction) -> bool {
        self(tx)
    }
}

/// Placeholder for the external signature service: accepts any signature
/// whose length falls in `[min_len, max_len]`.
///
/// It checks shape only and authenticates nothing. Deployments that need
/// real authentication pass their own [`SignatureVerifier`] to
/// [`Validator::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureShapeVerifier {
    pub min_len: usize,
    pub max_len: usize,
}

impl Default for SignatureShapeVerifier {
    fn default() -> Self {
        Self {
            min_len: SIGNATURE_MIN_LEN,
            max_len: SIGNATURE_MAX_LEN,
        }
    }
}

impl SignatureVerifier for SignatureShapeVerifier {
    fn verify(&self, tx: &Transaction) -> bool {
        (self.min_len..=self.max_len).contains(&tx.signature.len())
    }
}

/// Hashcash-style proof: the cost of a proof blob is `2^z`, where `z` is
/// the number of leading zero bits of `blake3(proof)`.
///
/// Finding a blob with `z` leading zeros takes about `2^z` hash attempts,
/// so the default `[1000, 1_000_000]` window asks for 10 to 19 zero bits.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkProofVerifier;

impl WorkProofVerifier {
    /// Upper bound on the proof blob length.
    pub const MAX_PROOF_LEN: usize = 256;

    fn leading_zero_bits(proof: &[u8]) -> u32 {
        let digest = blake3::hash(proof);
        let mut zeros = 0;
        for byte in digest.as_bytes() {
            if *byte == 0 {
                zeros += 8;
            } else {
                zeros += byte.leading_zeros();
                break;
            }
        }
        zeros
    }
}

impl ProofVerifier for WorkProofVerifier {
    fn computation_cost(&self, proof: &[u8]) -> u64 {
        1u64 << Self::leading_zero_bits(proof).min(63)
    }

    fn verify(&self, proof: &[u8]) -> bool {
        !proof.is_empty() && proof.len() <= Self::MAX_PROOF_LEN
    }
}

// ---------------------------------------------------------------------------
// Validator
// ---------------------------------------------------------------------------

pub struct Validator {
    config: ValidationConfig,
    /// Highest confirmed nonce per sender.
    nonces: RwLock<HashMap<Address, u64>>,
    proofs: Arc<dyn ProofVerifier>,
    signatures: Arc<dyn SignatureVerifier>,
}

impl fmt::Debug for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Validator")
            .field("config", &self.config)
            .field("tracked_senders", &self.nonces.read().len())
            .finish()
    }
}

impl Validator {
    pub fn new(
        config: ValidationConfig,
        proofs: Arc<dyn ProofVerifier>,
        signatures: Arc<dyn SignatureVerifier>,
    ) -> Self {
        Self {
            config,
            nonces: RwLock::new(HashMap::new()),
            proofs,
            signatures,
        }
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    /// Run every admission check. Returns the proof's computation cost.
    pub fn validate_transaction(&self, tx: &Transaction) -> Result<u64, ValidationError> {
        self.validate_basics(tx)?;
        self.validate_nonce(tx)?;
        let cost = self.validate_proof(tx)?;
        self.validate_signature(tx)?;

        debug!(hash = %tx.hash, from = %tx.from, nonce = tx.nonce, cost, "transaction validated");
        Ok(cost)
    }

    /// Record `nonce` as the highest confirmed nonce of `address`. Lower
    /// values are ignored, so the recorded nonce never goes backwards.
    pub fn update_nonce(&self, address: Address, nonce: u64) {
        let mut nonces = self.nonces.write();
        let entry = nonces.entry(address).or_insert(nonce);
        if nonce > *entry {
            *entry = nonce;
        }
    }

    /// Highest confirmed nonce, if the sender has any history.
    pub fn highest_nonce(&self, address: &Address) -> Option<u64> {
        self.nonces.read().get(address).copied()
    }

    /// The only nonce the next transaction from `address` may carry.
    pub fn expected_nonce(&self, address: &Address) -> u64 {
        self.highest_nonce(address)
            .map_or(0, |highest| highest.saturating_add(1))
    }

    fn validate_basics(&self, tx: &Transaction) -> Result<(), ValidationError> {
        if tx.is_empty() {
            return Err(ValidationError::EmptyTransaction);
        }
        if tx.from.is_zero() {
            return Err(ValidationError::MissingSender);
        }
        if tx.value == 0 {
            return Err(ValidationError::ZeroValue);
        }
        Ok(())
    }

    fn validate_nonce(&self, tx: &Transaction) -> Result<(), ValidationError> {
        let expected = self.expected_nonce(&tx.from);
        if tx.nonce != expected {
            return Err(ValidationError::InvalidNonce {
                expected,
                got: tx.nonce,
            });
        }
        Ok(())
    }

    fn validate_proof(&self, tx: &Transaction) -> Result<u64, ValidationError> {
        let proof = &tx.computation_proof;
        if proof.is_empty() {
            return Err(ValidationError::MissingProof);
        }

        let cost = self.proofs.computation_cost(proof);
        if cost < self.config.min_computation_cost {
            return Err(ValidationError::InsufficientComputation {
                cost,
                min: self.config.min_computation_cost,
            });
        }
        if cost > self.config.max_computation_cost {
            return Err(ValidationError::ExcessiveComputation {
                cost,
                max: self.config.max_computation_cost,
            });
        }

        if !self.proofs.verify(proof) {
            return Err(ValidationError::InvalidProof);
        }
        Ok(cost)
    }

    fn validate_signature(&self, tx: &Transaction) -> Result<(), ValidationError> {
        if tx.signature.is_empty() {
            return Err(ValidationError::MissingSignature);
        }
        if !self.signatures.verify(tx) {
            return Err(ValidationError::InvalidSignature);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TransactionBuilder;

    /// Proof verifier with a fixed answer, independent of the blob.
    struct FixedProof {
        cost: u64,
        valid: bool,
    }

    impl ProofVerifier for FixedProof {
        fn computation_cost(&self, _proof: &[u8]) -> u64 {
            self.cost
        }

        fn verify(&self, _proof: &[u8]) -> bool {
            self.valid
        }
    }

    fn validator_with(cost: u64, proof_ok: bool, sig_ok: bool) -> Validator {
        Validator::new(
            ValidationConfig::default(),
            Arc::new(FixedProof {
                cost,
                valid: proof_ok,
            }),
            Arc::new(move |_: &Transaction| sig_ok),
        )
    }

    fn validator() -> Validator {
        validator_with(5_000, true, true)
    }

    fn make_tx(sender: u8, nonce: u64) -> Transaction {
        TransactionBuilder::new(Address([sender; 20]), Address([0xee; 20]))
            .value(100)
            .nonce(nonce)
            .proof(vec![1, 2, 3])
            .signature(vec![4; 64])
            .build()
    }

    // -- Basics -------------------------------------------------------------

    #[test]
    fn accepts_well_formed_transaction() {
        assert_eq!(validator().validate_transaction(&make_tx(1, 0)), Ok(5_000));
    }

    #[test]
    fn rejects_empty_transaction() {
        assert_eq!(
            validator().validate_transaction(&Transaction::default()),
            Err(ValidationError::EmptyTransaction)
        );
    }

    #[test]
    fn rejects_zero_sender() {
        let tx = make_tx(0, 0);
        assert_eq!(
            validator().validate_transaction(&tx),
            Err(ValidationError::MissingSender)
        );
    }

    #[test]
    fn rejects_zero_value() {
        let mut tx = make_tx(1, 0);
        tx.value = 0;
        assert_eq!(
            validator().validate_transaction(&tx),
            Err(ValidationError::ZeroValue)
        );
    }

    // -- Nonce --------------------------------------------------------------

    #[test]
    fn new_sender_must_start_at_zero() {
        assert_eq!(
            validator().validate_transaction(&make_tx(1, 1)),
            Err(ValidationError::InvalidNonce {
                expected: 0,
                got: 1
            })
        );
    }

    #[test]
    fn known_sender_must_present_next_nonce() {
        let v = validator();
        v.update_nonce(Address([1; 20]), 4);

        assert!(v.validate_transaction(&make_tx(1, 5)).is_ok());
        assert_eq!(
            v.validate_transaction(&make_tx(1, 4)),
            Err(ValidationError::InvalidNonce {
                expected: 5,
                got: 4
            })
        );
        assert_eq!(
            v.validate_transaction(&make_tx(1, 7)),
            Err(ValidationError::InvalidNonce {
                expected: 5,
                got: 7
            })
        );
    }

    #[test]
    fn update_nonce_never_moves_backwards() {
        let v = validator();
        let addr = Address([3; 20]);
        assert_eq!(v.highest_nonce(&addr), None);

        v.update_nonce(addr, 0);
        assert_eq!(v.expected_nonce(&addr), 1);
        v.update_nonce(addr, 9);
        v.update_nonce(addr, 2);
        assert_eq!(v.highest_nonce(&addr), Some(9));
        assert_eq!(v.expected_nonce(&addr), 10);
    }

    #[test]
    fn validation_does_not_record_nonce() {
        let v = validator();
        v.validate_transaction(&make_tx(1, 0)).unwrap();
        assert_eq!(v.highest_nonce(&Address([1; 20])), None);
        // The same nonce stays admissible until confirmed.
        assert!(v.validate_transaction(&make_tx(1, 0)).is_ok());
    }

    // -- Proof --------------------------------------------------------------

    #[test]
    fn rejects_missing_proof() {
        let mut tx = make_tx(1, 0);
        tx.computation_proof.clear();
        assert_eq!(
            validator().validate_transaction(&tx),
            Err(ValidationError::MissingProof)
        );
    }

    #[test]
    fn rejects_cost_outside_window() {
        assert_eq!(
            validator_with(999, true, true).validate_transaction(&make_tx(1, 0)),
            Err(ValidationError::InsufficientComputation {
                cost: 999,
                min: 1000
            })
        );
        assert_eq!(
            validator_with(1_000_001, true, true).validate_transaction(&make_tx(1, 0)),
            Err(ValidationError::ExcessiveComputation {
                cost: 1_000_001,
                max: 1_000_000
            })
        );
    }

    #[test]
    fn cost_bounds_are_inclusive() {
        assert!(validator_with(1000, true, true)
            .validate_transaction(&make_tx(1, 0))
            .is_ok());
        assert!(validator_with(1_000_000, true, true)
            .validate_transaction(&make_tx(1, 0))
            .is_ok());
    }

    #[test]
    fn rejects_unverifiable_proof() {
        assert_eq!(
            validator_with(5_000, false, true).validate_transaction(&make_tx(1, 0)),
            Err(ValidationError::InvalidProof)
        );
    }

    // -- Signature ----------------------------------------------------------

    #[test]
    fn rejects_missing_signature() {
        let mut tx = make_tx(1, 0);
        tx.signature.clear();
        assert_eq!(
            validator().validate_transaction(&tx),
            Err(ValidationError::MissingSignature)
        );
    }

    #[test]
    fn rejects_invalid_signature() {
        assert_eq!(
            validator_with(5_000, true, false).validate_transaction(&make_tx(1, 0)),
            Err(ValidationError::InvalidSignature)
        );
    }

    #[test]
    fn checks_run_in_order() {
        // Bad nonce and bad signature: the nonce error wins.
        let v = validator_with(5_000, true, false);
        assert!(matches!(
            v.validate_transaction(&make_tx(1, 3)),
            Err(ValidationError::InvalidNonce { .. })
        ));
    }

    // -- SignatureShapeVerifier ----------------------------------------------

    #[test]
    fn shape_verifier_checks_length_window() {
        let verifier = SignatureShapeVerifier::default();
        let mut tx = make_tx(1, 0);
        for (len, accepted) in [(0, false), (63, false), (64, true), (65, true), (66, false)] {
            tx.signature = vec![9; len];
            assert_eq!(verifier.verify(&tx), accepted, "length {len}");
        }
    }

    #[test]
    fn shape_verifier_plugs_into_validator() {
        let v = Validator::new(
            ValidationConfig::default(),
            Arc::new(FixedProof {
                cost: 5_000,
                valid: true,
            }),
            Arc::new(SignatureShapeVerifier {
                min_len: 32,
                max_len: 32,
            }),
        );
        let mut tx = make_tx(1, 0);
        tx.signature = vec![1; 32];
        assert!(v.validate_transaction(&tx).is_ok());
        tx.signature = vec![1; 64];
        assert!(matches!(
            v.validate_transaction(&tx),
            Err(ValidationError::InvalidSignature)
        ));
    }

    // -- WorkProofVerifier --------------------------------------------------

    #[test]
    fn work_proof_cost_is_power_of_two() {
        let verifier = WorkProofVerifier;
        for seed in 0u32..64 {
            let cost = verifier.computation_cost(&seed.to_le_bytes());
            assert!(cost.is_power_of_two());
        }
    }

    #[test]
    fn work_proof_search_meets_minimum() {
        let verifier = WorkProofVerifier;
        let proof = (0u64..)
            .map(|n| n.to_le_bytes().to_vec())
            .find(|p| verifier.computation_cost(p) >= 1024)
            .unwrap();
        assert!(verifier.verify(&proof));
        assert!(verifier.computation_cost(&proof) >= 1024);
    }

    #[test]
    fn work_proof_rejects_oversized_blob() {
        let verifier = WorkProofVerifier;
        assert!(!verifier.verify(&[]));
        assert!(!verifier.verify(&vec![0; WorkProofVerifier::MAX_PROOF_LEN + 1]));
    }
}
