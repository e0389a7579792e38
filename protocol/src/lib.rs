// Copyright (c) 2026 Aporia Zero Developers. MIT License.
// See LICENSE for details.

//! # Aporia Zero: Protocol Core
//!
//! Transport and transaction-admission core of an Aporia Zero node: it
//! connects to other nodes, frames and dispatches protocol messages over
//! those connections, discovers new peers, and keeps a bounded pool of
//! pending transactions with ordering and expiry guarantees.
//!
//! ## Architecture
//!
//! - **config**: Protocol constants: ids, limits, intervals, pool defaults.
//! - **identity**: The node keypair and the peer id derived from it.
//! - **transaction**: Transaction model, canonical hashing, builder.
//! - **mempool**: Validator, TransactionPool and the transaction handler.
//! - **network**: Transport, peers, protocol dispatch, discovery, Node.
//!
//! ## Design Philosophy
//!
//! 1. Bounded everything: peers, pool, queues, frames.
//! 2. Producers of notifications never block on their consumers.
//! 3. One cancellation token per node; shutdown is ordered and bounded.
//! 4. Cryptographic checks on transactions are injected, never hardcoded.

pub mod config;
pub mod identity;
pub mod mempool;
pub mod network;
pub mod transaction;
