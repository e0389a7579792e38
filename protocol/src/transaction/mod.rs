//! # Transaction Module
//!
//! The transaction model shared by the pool, the validator and the wire
//! handler. Transactions are plain value transfers between 20-byte
//! addresses, carrying an opaque data blob, a signature and a computation
//! proof. Both cryptographic blobs are interpreted by pluggable verifiers
//! (see [`crate::mempool::validator`]), never by this module.
//!
//! ```text
//! types.rs:    Address, TxHash, TxStatus
//! builder.rs:  Transaction and its fluent TransactionBuilder
//! ```
//!
//! ## Hashing
//!
//! The hash is BLAKE3 over a fixed-layout canonical encoding of every field
//! except `hash` and `signature`, so it can be computed before signing and
//! does not change afterwards.

pub mod builder;
pub mod types;

pub use builder::{Transaction, TransactionBuilder};
pub use types::{Address, ParseBytesError, TxHash, TxStatus};
