//! Glue between the transaction protocol and the pool.
//!
//! Inbound messages on `/aporia-zero/tx/1.0.0` carry a JSON-encoded
//! [`Transaction`]. The handler decodes it, checks the hash, runs the
//! [`Validator`] and only then offers it to the [`TransactionPool`].
//! Confirmation advances the sender's nonce, which unlocks the next
//! transaction from that sender.

use std::sync::Arc;

use tracing::{debug, info};

use super::pool::{PoolError, TransactionPool};
use super::validator::{ValidationError, Validator};
use crate::network::message::{Message, MessageType};
use crate::network::protocol::{HandlerError, MessageHandler};
use crate::transaction::{Transaction, TxHash};

#[derive(Debug, thiserror::Error)]
pub enum TxHandlerError {
    #[error("malformed transaction payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("transaction hash mismatch: claimed {claimed}, computed {computed}")]
    HashMismatch { claimed: TxHash, computed: TxHash },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

#[derive(Debug, Clone)]
pub struct TransactionHandler {
    pool: Arc<TransactionPool>,
    validator: Arc<Validator>,
}

impl TransactionHandler {
    pub fn new(pool: Arc<TransactionPool>, validator: Arc<Validator>) -> Self {
        Self { pool, validator }
    }

    pub fn pool(&self) -> &Arc<TransactionPool> {
        &self.pool
    }

    pub fn validator(&self) -> &Arc<Validator> {
        &self.validator
    }

    /// Validate and admit a transaction. Nothing is stored on failure.
    pub fn submit(&self, tx: Transaction) -> Result<(), TxHandlerError> {
        let computed = tx.compute_hash();
        if computed != tx.hash {
            return Err(TxHandlerError::HashMismatch {
                claimed: tx.hash,
                computed,
            });
        }
        self.validator.validate_transaction(&tx)?;
        self.pool.add_transaction(tx)?;
        Ok(())
    }

    /// Mark a pooled transaction as included and advance its sender's
    /// nonce.
    pub fn confirm(&self, hash: &TxHash) -> Result<(), TxHandlerError> {
        let tx = self.pool.mark_confirmed(hash)?;
        self.validator.update_nonce(tx.from, tx.nonce);
        info!(%hash, from = %tx.from, nonce = tx.nonce, "transaction confirmed");
        Ok(())
    }

    /// Mark a pooled transaction as failed.
    pub fn reject(&self, hash: &TxHash) -> Result<(), TxHandlerError> {
        self.pool.mark_failed(hash)?;
        debug!(%hash, "transaction marked failed");
        Ok(())
    }

    /// Wrap a transaction in a message for the transaction protocol.
    pub fn encode(tx: &Transaction) -> Result<Message, serde_json::Error> {
        Ok(Message::new(MessageType::Transaction, serde_json::to_vec(tx)?))
    }
}

impl MessageHandler for TransactionHandler {
    fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        let tx: Transaction =
            serde_json::from_slice(&message.payload).map_err(TxHandlerError::from)?;
        let hash = tx.hash;
        self.submit(tx)?;
        debug!(%hash, from = %message.from, "transaction received from peer");
        Ok(())
    }
}
