//! The consumed-payment ledger: a set of payment identifiers that have
//! already unlocked a resource.
//!
//! The only write is [`ConsumedPaymentLedger::try_consume`], an atomic
//! insert-if-absent. Two concurrent calls with the same identifier yield
//! exactly one [`ConsumeOutcome::Consumed`]. Entries are never removed.
//!
//! Two backends are provided:
//!
//! - [`MemoryLedger`] - process-local, lost on restart
//! - [`SledLedger`] - durable, backed by an embedded sled tree
//!
//! | Tree                | Key                   | Value                     |
//! |---------------------|-----------------------|---------------------------|
//! | `consumed_payments` | `payment_id` (UTF-8)  | `bincode(StoredRecord)`   |

use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};

use crate::timestamp::UnixTimestamp;

/// Name of the sled tree holding consumed payments.
pub const CONSUMED_TREE: &str = "consumed_payments";

/// A consumed payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumedPaymentRecord {
    /// The consumed payment identifier.
    pub payment_id: String,
    /// The payer that consumed it.
    pub consumer: String,
    /// When it was consumed.
    pub consumed_at: UnixTimestamp,
}

/// Result of an atomic consume attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// The identifier was absent and is now recorded.
    Consumed,
    /// The identifier was already recorded; nothing changed.
    AlreadyConsumed,
}

/// Errors from a ledger backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    /// The backend could not be read or written.
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
    /// A stored record could not be decoded.
    #[error("ledger record corrupt: {0}")]
    Corrupt(String),
}

impl From<sled::Error> for LedgerError {
    fn from(err: sled::Error) -> Self {
        Self::Unavailable(err.to_string())
    }
}

/// Durable set of consumed payment identifiers.
pub trait ConsumedPaymentLedger: Send + Sync {
    /// Returns `true` if `payment_id` was consumed.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the backend cannot answer.
    fn is_consumed(&self, payment_id: &str) -> Result<bool, LedgerError>;

    /// Records `record` if its identifier is absent.
    ///
    /// Check and insert happen as one atomic step.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the backend cannot answer. No record is
    /// assumed written in that case.
    fn try_consume(&self, record: ConsumedPaymentRecord) -> Result<ConsumeOutcome, LedgerError>;

    /// Returns the record for `payment_id`, if consumed.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the backend cannot answer.
    fn get(&self, payment_id: &str) -> Result<Option<ConsumedPaymentRecord>, LedgerError>;

    /// Number of consumed payments.
    ///
    /// Intended for observability; backends may answer with a full scan.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the backend cannot answer.
    fn count(&self) -> Result<u64, LedgerError>;
}

impl<T: ConsumedPaymentLedger + ?Sized> ConsumedPaymentLedger for Arc<T> {
    fn is_consumed(&self, payment_id: &str) -> Result<bool, LedgerError> {
        (**self).is_consumed(payment_id)
    }

    fn try_consume(&self, record: ConsumedPaymentRecord) -> Result<ConsumeOutcome, LedgerError> {
        (**self).try_consume(record)
    }

    fn get(&self, payment_id: &str) -> Result<Option<ConsumedPaymentRecord>, LedgerError> {
        (**self).get(payment_id)
    }

    fn count(&self) -> Result<u64, LedgerError> {
        (**self).count()
    }
}

/// In-memory ledger. Infallible; lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    consumed: DashMap<String, ConsumedPaymentRecord>,
}

impl MemoryLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConsumedPaymentLedger for MemoryLedger {
    fn is_consumed(&self, payment_id: &str) -> Result<bool, LedgerError> {
        Ok(self.consumed.contains_key(payment_id))
    }

    fn try_consume(&self, record: ConsumedPaymentRecord) -> Result<ConsumeOutcome, LedgerError> {
        match self.consumed.entry(record.payment_id.clone()) {
            Entry::Occupied(_) => Ok(ConsumeOutcome::AlreadyConsumed),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(ConsumeOutcome::Consumed)
            }
        }
    }

    fn get(&self, payment_id: &str) -> Result<Option<ConsumedPaymentRecord>, LedgerError> {
        Ok(self.consumed.get(payment_id).map(|entry| entry.value().clone()))
    }

    fn count(&self) -> Result<u64, LedgerError> {
        Ok(self.consumed.len() as u64)
    }
}

/// On-disk value. `consumed_at` is kept as raw seconds so the bincode
/// encoding stays self-contained.
#[derive(Serialize, Deserialize)]
struct StoredRecord {
    consumer: String,
    consumed_at: u64,
}

/// Durable ledger on an embedded sled database.
///
/// Consumption uses sled's compare-and-swap against an absent key, so
/// concurrent writers across threads race safely. Each successful consume
/// is flushed before it is reported, so `try_consume` blocks on disk I/O;
/// async callers should invoke it from a blocking thread.
///
/// [`count`](ConsumedPaymentLedger::count) scans the whole tree and is
/// linear in the number of consumed payments.
#[derive(Debug, Clone)]
pub struct SledLedger {
    tree: sled::Tree,
}

impl SledLedger {
    /// Opens or creates a ledger at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Unavailable`] if the database cannot be opened.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LedgerError> {
        Self::from_db(&sled::open(path)?)
    }

    /// Creates a ledger that is deleted when dropped.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Unavailable`] if the database cannot be created.
    pub fn open_temporary() -> Result<Self, LedgerError> {
        Self::from_db(&sled::Config::new().temporary(true).open()?)
    }

    /// Uses the consumed-payments tree of an already open database.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Unavailable`] if the tree cannot be opened.
    pub fn from_db(db: &sled::Db) -> Result<Self, LedgerError> {
        Ok(Self {
            tree: db.open_tree(CONSUMED_TREE)?,
        })
    }

    fn decode(payment_id: &str, bytes: &[u8]) -> Result<ConsumedPaymentRecord, LedgerError> {
        let stored: StoredRecord = bincode::deserialize(bytes)
            .map_err(|e| LedgerError::Corrupt(format!("{payment_id}: {e}")))?;
        Ok(ConsumedPaymentRecord {
            payment_id: payment_id.to_owned(),
            consumer: stored.consumer,
            consumed_at: UnixTimestamp::from_secs(stored.consumed_at),
        })
    }
}

impl ConsumedPaymentLedger for SledLedger {
    fn is_consumed(&self, payment_id: &str) -> Result<bool, LedgerError> {
        Ok(self.tree.contains_key(payment_id.as_bytes())?)
    }

    fn try_consume(&self, record: ConsumedPaymentRecord) -> Result<ConsumeOutcome, LedgerError> {
        let value = bincode::serialize(&StoredRecord {
            consumer: record.consumer,
            consumed_at: record.consumed_at.as_secs(),
        })
        .map_err(|e| LedgerError::Corrupt(e.to_string()))?;

        let swapped = self.tree.compare_and_swap(
            record.payment_id.as_bytes(),
            None::<&[u8]>,
            Some(value),
        )?;
        if swapped.is_err() {
            return Ok(ConsumeOutcome::AlreadyConsumed);
        }
        self.tree.flush()?;
        Ok(ConsumeOutcome::Consumed)
    }

    fn get(&self, payment_id: &str) -> Result<Option<ConsumedPaymentRecord>, LedgerError> {
        self.tree
            .get(payment_id.as_bytes())?
            .map(|bytes| Self::decode(payment_id, &bytes))
            .transpose()
    }

    fn count(&self) -> Result<u64, LedgerError> {
        Ok(self.tree.len() as u64)
    }
}
