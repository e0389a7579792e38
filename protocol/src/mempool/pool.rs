//! Bounded, indexed pool of admitted transactions.
//!
//! The pool holds transactions that passed validation and are waiting for
//! downstream processing. Each entry is reachable three ways:
//!
//! - by hash (primary map),
//! - by arrival order (FIFO view behind [`TransactionPool::get_pending_transactions`]),
//! - by sender and nonce (behind [`TransactionPool::get_transactions_by_address`]).
//!
//! ## Design
//!
//! - All three indexes and the status counters sit behind one
//!   `parking_lot::RwLock`. Every mutation happens in a single write
//!   section, so readers never observe an entry in one index but not
//!   another.
//! - Arrival order is a monotonically increasing sequence number, not a
//!   wall-clock timestamp, so two transactions admitted in the same
//!   instant still have a strict order.
//! - Age is measured with `tokio::time::Instant`, which follows the paused
//!   clock in tests.
//! - Admission pushes the transaction onto a bounded notification queue
//!   with `try_send`. A full queue drops the notification; admission never
//!   waits on a consumer.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace};

use crate::config::{
    MAX_TX_SIZE_BYTES, MEMPOOL_CLEANUP_INTERVAL, MEMPOOL_MAX_SIZE, TX_EXPIRATION,
    TX_NOTIFICATION_CAPACITY,
};
use crate::transaction::{Address, Transaction, TxHash, TxStatus};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of transactions held, whatever their status.
    pub max_size: usize,

    /// Maximum [`Transaction::size`] accepted.
    pub max_transaction_size: usize,

    /// Entries older than this are removed by the sweep.
    pub expiration: Duration,

    /// Period of the background sweep started by [`TransactionPool::start`].
    pub cleanup_interval: Duration,

    /// Capacity of the post-admission notification queue.
    pub notification_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: MEMPOOL_MAX_SIZE,
            max_transaction_size: MAX_TX_SIZE_BYTES,
            expiration: TX_EXPIRATION,
            cleanup_interval: MEMPOOL_CLEANUP_INTERVAL,
            notification_capacity: TX_NOTIFICATION_CAPACITY,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("transaction pool is full ({max_size} transactions)")]
    Full { max_size: usize },

    #[error("transaction too large: {size} bytes exceeds limit of {max}")]
    TooLarge { size: usize, max: usize },

    #[error("transaction {0} already exists in pool")]
    AlreadyExists(TxHash),

    #[error("sender {from} already has {existing} pending at nonce {nonce}")]
    NonceInUse {
        from: Address,
        nonce: u64,
        existing: TxHash,
    },

    #[error("transaction {0} not found")]
    NotFound(TxHash),
}

// ---------------------------------------------------------------------------
// Entries & status
// ---------------------------------------------------------------------------

/// A transaction together with pool bookkeeping.
#[derive(Debug, Clone)]
pub struct PooledTransaction {
    pub transaction: Transaction,
    pub status: TxStatus,
    /// Wall-clock admission time, for display.
    pub received_at: DateTime<Utc>,
    added_at: Instant,
    sequence: u64,
}

impl PooledTransaction {
    /// Time spent in the pool so far.
    pub fn age(&self) -> Duration {
        Instant::now().saturating_duration_since(self.added_at)
    }
}

/// Snapshot of the pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub current_size: usize,
    pub pending_count: usize,
    /// Rejected admissions plus transactions marked failed.
    pub rejected_count: u64,
    /// Transactions removed by the expiry sweep.
    pub expired_count: u64,
}

#[derive(Default)]
struct PoolInner {
    entries: HashMap<TxHash, PooledTransaction>,
    by_arrival: BTreeMap<u64, TxHash>,
    by_sender: HashMap<Address, BTreeMap<(u64, u64), TxHash>>,
    next_sequence: u64,
    pending: usize,
    rejected: u64,
    expired: u64,
}

impl PoolInner {
    fn insert(&mut self, transaction: Transaction) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let hash = transaction.hash;
        self.by_arrival.insert(sequence, hash);
        self.by_sender
            .entry(transaction.from)
            .or_default()
            .insert((transaction.nonce, sequence), hash);
        self.entries.insert(
            hash,
            PooledTransaction {
                transaction,
                status: TxStatus::Pending,
                received_at: Utc::now(),
                added_at: Instant::now(),
                sequence,
            },
        );
        self.pending += 1;
    }

    /// Pending transaction occupying `nonce` for `sender`, if any.
    fn pending_at(&self, sender: &Address, nonce: u64) -> Option<TxHash> {
        self.by_sender
            .get(sender)?
            .range((nonce, 0)..=(nonce, u64::MAX))
            .map(|(_, hash)| *hash)
            .find(|hash| {
                self.entries
                    .get(hash)
                    .is_some_and(|e| e.status == TxStatus::Pending)
            })
    }

    fn remove(&mut self, hash: &TxHash) -> Option<PooledTransaction> {
        let entry = self.entries.remove(hash)?;
        self.by_arrival.remove(&entry.sequence);

        let sender = entry.transaction.from;
        if let Some(nonces) = self.by_sender.get_mut(&sender) {
            nonces.remove(&(entry.transaction.nonce, entry.sequence));
            if nonces.is_empty() {
                self.by_sender.remove(&sender);
            }
        }
        if entry.status == TxStatus::Pending {
            self.pending -= 1;
        }
        Some(entry)
    }

    fn set_status(&mut self, hash: &TxHash, status: TxStatus) -> Result<Transaction, PoolError> {
        let entry = self
            .entries
            .get_mut(hash)
            .ok_or(PoolError::NotFound(*hash))?;

        let previous = entry.status;
        entry.status = status;
        let transaction = entry.transaction.clone();

        match (previous == TxStatus::Pending, status == TxStatus::Pending) {
            (true, false) => self.pending -= 1,
            (false, true) => self.pending += 1,
            _ => {}
        }
        if status == TxStatus::Failed && previous != TxStatus::Failed {
            self.rejected += 1;
        }
        Ok(transaction)
    }
}

// ---------------------------------------------------------------------------
// TransactionPool
// ---------------------------------------------------------------------------

pub struct TransactionPool {
    config: PoolConfig,
    inner: RwLock<PoolInner>,
    notify_tx: mpsc::Sender<Transaction>,
    notify_rx: Mutex<Option<mpsc::Receiver<Transaction>>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl fmt::Debug for TransactionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionPool")
            .field("size", &self.size())
            .field("config", &self.config)
            .finish()
    }
}

impl Default for TransactionPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl TransactionPool {
    pub fn new(config: PoolConfig) -> Self {
        let (notify_tx, notify_rx) = mpsc::channel(config.notification_capacity.max(1));
        Self {
            config,
            inner: RwLock::new(PoolInner::default()),
            notify_tx,
            notify_rx: Mutex::new(Some(notify_rx)),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Admit a transaction.
    ///
    /// Checks, in order: capacity ([`PoolError::Full`]), encoded size
    /// ([`PoolError::TooLarge`]), duplicate hash
    /// ([`PoolError::AlreadyExists`]). The transaction is expected to have
    /// passed the [`Validator`](super::Validator) already.
    pub fn add_transaction(&self, tx: Transaction) -> Result<(), PoolError> {
        let hash = tx.hash;
        {
            let mut inner = self.inner.write();

            let rejection = if inner.entries.len() >= self.config.max_size {
                Some(PoolError::Full {
                    max_size: self.config.max_size,
                })
            } else if tx.size() > self.config.max_transaction_size {
                Some(PoolError::TooLarge {
                    size: tx.size(),
                    max: self.config.max_transaction_size,
                })
            } else if inner.entries.contains_key(&hash) {
                Some(PoolError::AlreadyExists(hash))
            } else if let Some(existing) = inner.pending_at(&tx.from, tx.nonce) {
                Some(PoolError::NonceInUse {
                    from: tx.from,
                    nonce: tx.nonce,
                    existing,
                })
            } else {
                None
            };

            if let Some(err) = rejection {
                inner.rejected += 1;
                debug!(%hash, error = %err, "transaction rejected");
                return Err(err);
            }

            inner.insert(tx.clone());
        }

        trace!(%hash, "transaction admitted");
        if let Err(err) = self.notify_tx.try_send(tx) {
            trace!(%hash, reason = %err, "admission notification dropped");
        }
        Ok(())
    }

    pub fn get_transaction(&self, hash: &TxHash) -> Result<Transaction, PoolError> {
        self.inner
            .read()
            .entries
            .get(hash)
            .map(|e| e.transaction.clone())
            .ok_or(PoolError::NotFound(*hash))
    }

    /// Full pool entry, bookkeeping included.
    pub fn get_entry(&self, hash: &TxHash) -> Option<PooledTransaction> {
        self.inner.read().entries.get(hash).cloned()
    }

    pub fn get_transaction_status(&self, hash: &TxHash) -> Result<TxStatus, PoolError> {
        self.inner
            .read()
            .entries
            .get(hash)
            .map(|e| e.status)
            .ok_or(PoolError::NotFound(*hash))
    }

    pub fn has_transaction(&self, hash: &TxHash) -> bool {
        self.inner.read().entries.contains_key(hash)
    }

    /// Every `Pending` transaction, oldest admission first.
    pub fn get_pending_transactions(&self) -> Vec<Transaction> {
        let inner = self.inner.read();
        inner
            .by_arrival
            .values()
            .filter_map(|hash| inner.entries.get(hash))
            .filter(|e| e.status == TxStatus::Pending)
            .map(|e| e.transaction.clone())
            .collect()
    }

    /// Every transaction from `address`, whatever its status, in nonce
    /// order. Equal nonces keep arrival order.
    pub fn get_transactions_by_address(&self, address: &Address) -> Vec<Transaction> {
        let inner = self.inner.read();
        inner
            .by_sender
            .get(address)
            .map(|nonces| {
                nonces
                    .values()
                    .filter_map(|hash| inner.entries.get(hash))
                    .map(|e| e.transaction.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn remove_transaction(&self, hash: &TxHash) -> Option<Transaction> {
        let removed = self.inner.write().remove(hash)?;
        debug!(%hash, "transaction removed");
        Some(removed.transaction)
    }

    /// Mark a pooled transaction as included. Returns the transaction so the
    /// caller can advance the sender's nonce.
    pub fn mark_confirmed(&self, hash: &TxHash) -> Result<Transaction, PoolError> {
        self.inner.write().set_status(hash, TxStatus::Confirmed)
    }

    /// Mark a pooled transaction as failed after admission.
    pub fn mark_failed(&self, hash: &TxHash) -> Result<Transaction, PoolError> {
        self.inner.write().set_status(hash, TxStatus::Failed)
    }

    /// Drop every entry. Rejected and expired counters are kept.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.entries.clear();
        inner.by_arrival.clear();
        inner.by_sender.clear();
        inner.pending = 0;
    }

    pub fn size(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn get_status(&self) -> PoolStatus {
        let inner = self.inner.read();
        PoolStatus {
            current_size: inner.entries.len(),
            pending_count: inner.pending,
            rejected_count: inner.rejected,
            expired_count: inner.expired,
        }
    }

    /// Remove every entry older than `config.expiration`. Returns how many
    /// were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expiration = self.config.expiration;

        let mut inner = self.inner.write();
        let stale: Vec<TxHash> = inner
            .entries
            .values()
            .filter(|e| now.saturating_duration_since(e.added_at) > expiration)
            .map(|e| e.transaction.hash)
            .collect();

        for hash in &stale {
            inner.remove(hash);
        }
        inner.expired += stale.len() as u64;
        drop(inner);

        if !stale.is_empty() {
            debug!(count = stale.len(), "expired transactions swept");
        }
        stale.len()
    }

    /// Hand out the receiving end of the admission notifications. Only the
    /// first caller gets it.
    pub fn take_notifications(&self) -> Option<mpsc::Receiver<Transaction>> {
        self.notify_rx.lock().take()
    }

    /// Spawn the periodic expiry sweep. Must be called inside a tokio
    /// runtime.
    pub fn start(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        let period = self.config.cleanup_interval;

        self.tasks.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        pool.sweep_expired();
                    }
                }
            }
            trace!("mempool sweep stopped");
        });
        info!(
            max_size = self.config.max_size,
            interval_secs = period.as_secs(),
            "transaction pool started"
        );
    }

    /// Cancel the sweep and wait for it to finish.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        info!("transaction pool stopped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
