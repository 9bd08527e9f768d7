//! Durable Storage
//!
//! Storage traits the integrity layer sits on, with an in-memory
//! implementation and a SQLite implementation.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::event::{AuditEvent, Category};
use crate::audit::merkle::MerkleRoot;
use crate::error::LedgerResult;
use crate::ots::proof::{AnchorProof, ProofStatus};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// What remains at a chain position after its event body was purged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub event_id: String,
    pub chain_id: String,
    pub sequence: u64,
    pub category: Category,
    pub timestamp: DateTime<Utc>,
    pub previous_hash: String,
    pub hash: String,
    pub purged_at: DateTime<Utc>,
}

impl Tombstone {
    pub fn of(event: &AuditEvent, purged_at: DateTime<Utc>) -> Self {
        Self {
            event_id: event.id.clone(),
            chain_id: event.chain_id.clone(),
            sequence: event.sequence,
            category: event.category,
            timestamp: event.timestamp,
            previous_hash: event.previous_hash.clone(),
            hash: event.hash.clone(),
            purged_at,
        }
    }
}

/// A chain position whose stored record no longer decodes into an event.
/// Carries what the indexed columns still say about it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorruptEntry {
    pub event_id: String,
    pub chain_id: String,
    pub sequence: u64,
    pub previous_hash: String,
    pub hash: String,
    pub timestamp: DateTime<Utc>,
    pub error: String,
}

/// A chain position: the full event, its tombstone, or an undecodable record
#[derive(Debug, Clone, PartialEq)]
pub enum StoredEntry {
    Event(AuditEvent),
    Tombstone(Tombstone),
    Corrupt(CorruptEntry),
}

impl StoredEntry {
    pub fn id(&self) -> &str {
        match self {
            Self::Event(e) => &e.id,
            Self::Tombstone(t) => &t.event_id,
            Self::Corrupt(c) => &c.event_id,
        }
    }

    pub fn chain_id(&self) -> &str {
        match self {
            Self::Event(e) => &e.chain_id,
            Self::Tombstone(t) => &t.chain_id,
            Self::Corrupt(c) => &c.chain_id,
        }
    }

    pub fn sequence(&self) -> u64 {
        match self {
            Self::Event(e) => e.sequence,
            Self::Tombstone(t) => t.sequence,
            Self::Corrupt(c) => c.sequence,
        }
    }

    pub fn hash(&self) -> &str {
        match self {
            Self::Event(e) => &e.hash,
            Self::Tombstone(t) => &t.hash,
            Self::Corrupt(c) => &c.hash,
        }
    }

    pub fn previous_hash(&self) -> &str {
        match self {
            Self::Event(e) => &e.previous_hash,
            Self::Tombstone(t) => &t.previous_hash,
            Self::Corrupt(c) => &c.previous_hash,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Event(e) => e.timestamp,
            Self::Tombstone(t) => t.timestamp,
            Self::Corrupt(c) => c.timestamp,
        }
    }

    pub fn as_event(&self) -> Option<&AuditEvent> {
        match self {
            Self::Event(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, Self::Tombstone(_))
    }

    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt(_))
    }
}

/// Last committed position of a chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainHead {
    pub sequence: u64,
    pub hash: String,
    pub timestamp: DateTime<Utc>,
}

impl From<&StoredEntry> for ChainHead {
    fn from(entry: &StoredEntry) -> Self {
        Self {
            sequence: entry.sequence(),
            hash: entry.hash().to_string(),
            timestamp: entry.timestamp(),
        }
    }
}

/// Append-only event storage
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append iff `event.previous_hash` equals the stored head hash of the
    /// chain (or the genesis sentinel for an empty chain) and
    /// `event.sequence` is the next slot. Any mismatch is a
    /// `PersistenceFailure` and nothing is written.
    async fn append(&self, event: &AuditEvent) -> LedgerResult<()>;

    async fn head(&self, chain_id: &str) -> LedgerResult<Option<ChainHead>>;

    async fn get(&self, event_id: &str) -> LedgerResult<Option<StoredEntry>>;

    /// Entries with `first <= sequence <= last`, in sequence order.
    /// Missing positions are simply absent from the result.
    async fn range(&self, chain_id: &str, first: u64, last: u64) -> LedgerResult<Vec<StoredEntry>>;

    /// Drop the event body, keeping a tombstone at its position
    async fn purge(&self, event_id: &str, purged_at: DateTime<Utc>) -> LedgerResult<Tombstone>;
}

/// Merkle batch storage
#[async_trait]
pub trait BatchStore: Send + Sync {
    async fn save_root(&self, root: &MerkleRoot) -> LedgerResult<()>;

    async fn get_root(&self, batch_id: &str) -> LedgerResult<Option<MerkleRoot>>;

    async fn find_root(&self, chain_id: &str, first: u64, last: u64) -> LedgerResult<Option<MerkleRoot>>;

    async fn root_containing(&self, chain_id: &str, sequence: u64) -> LedgerResult<Option<MerkleRoot>>;

    /// All roots of a chain ordered by first sequence
    async fn list_roots(&self, chain_id: &str) -> LedgerResult<Vec<MerkleRoot>>;
}

/// Anchor proof storage. Status writes are monotonic.
#[async_trait]
pub trait ProofStore: Send + Sync {
    /// Insert or replace a proof. Replacing refuses a status regression.
    async fn save_proof(&self, proof: &AnchorProof) -> LedgerResult<()>;

    async fn get_proof(&self, proof_id: &str) -> LedgerResult<Option<AnchorProof>>;

    async fn proofs_for_root(&self, batch_id: &str) -> LedgerResult<Vec<AnchorProof>>;

    async fn proofs_with_status(&self, statuses: &[ProofStatus]) -> LedgerResult<Vec<AnchorProof>>;
}

/// A store that holds events, batches and proofs together
pub trait LedgerStore: EventStore + BatchStore + ProofStore {}

impl<T: EventStore + BatchStore + ProofStore> LedgerStore for T {}
