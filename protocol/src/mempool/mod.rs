//! # Mempool
//!
//! Admission control for pending transactions.
//!
//! ```text
//! validator.rs: admission rules and per-sender nonce state
//! pool.rs:      bounded, indexed TransactionPool with expiry sweep
//! handler.rs:   transaction-protocol handler: decode, validate, admit
//! ```
//!
//! The pool itself only enforces capacity, size and uniqueness. Semantic
//! checks live in the [`Validator`], and the [`TransactionHandler`] runs
//! both in order for every transaction arriving from the network.

pub mod handler;
pub mod pool;
pub mod validator;

pub use handler::{TransactionHandler, TxHandlerError};
pub use pool::{PoolConfig, PoolError, PoolStatus, PooledTransaction, TransactionPool};
pub use validator::{
    ProofVerifier, SignatureShapeVerifier, SignatureVerifier, ValidationConfig,
    ValidationError, Validator, WorkProofVerifier,
};
