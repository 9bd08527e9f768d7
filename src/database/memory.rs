//! In-memory store
//!
//! Thread-safe store backed by maps behind a `tokio::sync::RwLock`.
//! Used by tests and by deployments that only need a process-local ledger.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::RwLock;

use super::{BatchStore, ChainHead, EventStore, ProofStore, StoredEntry, Tombstone};
use crate::audit::event::{AuditEvent, GENESIS_HASH};
use crate::audit::merkle::MerkleRoot;
use crate::error::{LedgerError, LedgerResult};
use crate::ots::proof::{AnchorProof, ProofStatus};

#[derive(Default)]
struct Inner {
    /// chain_id -> sequence -> entry
    chains: HashMap<String, BTreeMap<u64, StoredEntry>>,
    /// event_id -> (chain_id, sequence)
    index: HashMap<String, (String, u64)>,
    batches: HashMap<String, MerkleRoot>,
    proofs: HashMap<String, AnchorProof>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    failing_appends: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` appends fail as if the disk were unavailable
    pub fn fail_next_appends(&self, count: u32) {
        self.failing_appends.store(count, Ordering::SeqCst);
    }

    /// Rewrite a stored event in place without touching any hash.
    /// Simulates an attacker with direct storage access.
    pub async fn tamper<F>(&self, event_id: &str, edit: F) -> LedgerResult<()>
    where
        F: FnOnce(&mut AuditEvent),
    {
        let mut inner = self.inner.write().await;
        let (chain_id, sequence) = inner
            .index
            .get(event_id)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("event {}", event_id)))?;
        match inner.chains.get_mut(&chain_id).and_then(|c| c.get_mut(&sequence)) {
            Some(StoredEntry::Event(event)) => {
                edit(event);
                Ok(())
            }
            _ => Err(LedgerError::NotFound(format!("event body {}", event_id))),
        }
    }

    /// Remove a position entirely, leaving a hole in the chain
    pub async fn erase(&self, event_id: &str) -> LedgerResult<()> {
        let mut inner = self.inner.write().await;
        let (chain_id, sequence) = inner
            .index
            .remove(event_id)
            .ok_or_else(|| LedgerError::NotFound(format!("event {}", event_id)))?;
        if let Some(chain) = inner.chains.get_mut(&chain_id) {
            chain.remove(&sequence);
        }
        Ok(())
    }

    fn take_failure(&self) -> bool {
        self.failing_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn append(&self, event: &AuditEvent) -> LedgerResult<()> {
        if self.take_failure() {
            return Err(LedgerError::PersistenceFailure(
                "Injected storage failure".to_string(),
            ));
        }

        let mut inner = self.inner.write().await;
        if inner.index.contains_key(&event.id) {
            return Err(LedgerError::PersistenceFailure(format!(
                "Duplicate event id {}",
                event.id
            )));
        }

        let chain = inner.chains.entry(event.chain_id.clone()).or_default();
        let (expected_sequence, expected_hash) = match chain.values().next_back() {
            Some(last) => (last.sequence() + 1, last.hash().to_string()),
            None => (0, GENESIS_HASH.to_string()),
        };

        if event.sequence != expected_sequence || event.previous_hash != expected_hash {
            return Err(LedgerError::PersistenceFailure(format!(
                "Chain head moved: expected sequence {} after {}, got {} after {}",
                expected_sequence, expected_hash, event.sequence, event.previous_hash
            )));
        }

        chain.insert(event.sequence, StoredEntry::Event(event.clone()));
        inner
            .index
            .insert(event.id.clone(), (event.chain_id.clone(), event.sequence));
        Ok(())
    }

    async fn head(&self, chain_id: &str) -> LedgerResult<Option<ChainHead>> {
        let inner = self.inner.read().await;
        Ok(inner
            .chains
            .get(chain_id)
            .and_then(|c| c.values().next_back())
            .map(ChainHead::from))
    }

    async fn get(&self, event_id: &str) -> LedgerResult<Option<StoredEntry>> {
        let inner = self.inner.read().await;
        Ok(inner.index.get(event_id).and_then(|(chain_id, sequence)| {
            inner
                .chains
                .get(chain_id)
                .and_then(|c| c.get(sequence))
                .cloned()
        }))
    }

    async fn range(&self, chain_id: &str, first: u64, last: u64) -> LedgerResult<Vec<StoredEntry>> {
        if first > last {
            return Ok(Vec::new());
        }
        let inner = self.inner.read().await;
        Ok(inner
            .chains
            .get(chain_id)
            .map(|c| c.range(first..=last).map(|(_, e)| e.clone()).collect())
            .unwrap_or_default())
    }

    async fn purge(&self, event_id: &str, purged_at: DateTime<Utc>) -> LedgerResult<Tombstone> {
        let mut inner = self.inner.write().await;
        let (chain_id, sequence) = inner
            .index
            .get(event_id)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("event {}", event_id)))?;
        let slot = inner
            .chains
            .get_mut(&chain_id)
            .and_then(|c| c.get_mut(&sequence))
            .ok_or_else(|| LedgerError::NotFound(format!("event {}", event_id)))?;

        match slot {
            StoredEntry::Event(event) => {
                let tombstone = Tombstone::of(event, purged_at);
                *slot = StoredEntry::Tombstone(tombstone.clone());
                Ok(tombstone)
            }
            StoredEntry::Tombstone(t) => Err(LedgerError::NotFound(format!(
                "event {} was already purged at {}",
                event_id, t.purged_at
            ))),
            StoredEntry::Corrupt(c) => Err(LedgerError::IntegrityViolation(format!(
                "event {} cannot be purged, its record is corrupt: {}",
                event_id, c.error
            ))),
        }
    }
}

#[async_trait]
impl BatchStore for MemoryStore {
    async fn save_root(&self, root: &MerkleRoot) -> LedgerResult<()> {
        let mut inner = self.inner.write().await;
        let duplicate = inner.batches.values().any(|b| {
            b.batch_id != root.batch_id
                && b.chain_id == root.chain_id
                && b.batch_range.overlaps(root.batch_range.first_sequence, root.batch_range.last_sequence)
        });
        if duplicate {
            return Err(LedgerError::InvalidRange(format!(
                "Batch {} overlaps an existing batch",
                root.batch_id
            )));
        }
        inner.batches.insert(root.batch_id.clone(), root.clone());
        Ok(())
    }

    async fn get_root(&self, batch_id: &str) -> LedgerResult<Option<MerkleRoot>> {
        Ok(self.inner.read().await.batches.get(batch_id).cloned())
    }

    async fn find_root(&self, chain_id: &str, first: u64, last: u64) -> LedgerResult<Option<MerkleRoot>> {
        let inner = self.inner.read().await;
        Ok(inner
            .batches
            .values()
            .find(|b| {
                b.chain_id == chain_id
                    && b.batch_range.first_sequence == first
                    && b.batch_range.last_sequence == last
            })
            .cloned())
    }

    async fn root_containing(&self, chain_id: &str, sequence: u64) -> LedgerResult<Option<MerkleRoot>> {
        let inner = self.inner.read().await;
        Ok(inner
            .batches
            .values()
            .find(|b| b.chain_id == chain_id && b.batch_range.contains(sequence))
            .cloned())
    }

    async fn list_roots(&self, chain_id: &str) -> LedgerResult<Vec<MerkleRoot>> {
        let inner = self.inner.read().await;
        let mut roots: Vec<MerkleRoot> = inner
            .batches
            .values()
            .filter(|b| b.chain_id == chain_id)
            .cloned()
            .collect();
        roots.sort_by_key(|b| b.batch_range.first_sequence);
        Ok(roots)
    }
}

#[async_trait]
impl ProofStore for MemoryStore {
    async fn save_proof(&self, proof: &AnchorProof) -> LedgerResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.proofs.get(&proof.proof_id) {
            if !existing.status.can_transition_to(proof.status) {
                return Err(LedgerError::IntegrityViolation(format!(
                    "Proof {} cannot regress from {} to {}",
                    proof.proof_id, existing.status, proof.status
                )));
            }
        }
        inner.proofs.insert(proof.proof_id.clone(), proof.clone());
        Ok(())
    }

    async fn get_proof(&self, proof_id: &str) -> LedgerResult<Option<AnchorProof>> {
        Ok(self.inner.read().await.proofs.get(proof_id).cloned())
    }

    async fn proofs_for_root(&self, batch_id: &str) -> LedgerResult<Vec<AnchorProof>> {
        let inner = self.inner.read().await;
        let mut proofs: Vec<AnchorProof> = inner
            .proofs
            .values()
            .filter(|p| p.merkle_root_ref == batch_id)
            .cloned()
            .collect();
        proofs.sort_by_key(|p| p.submitted_at);
        Ok(proofs)
    }

    async fn proofs_with_status(&self, statuses: &[ProofStatus]) -> LedgerResult<Vec<AnchorProof>> {
        let inner = self.inner.read().await;
        let mut proofs: Vec<AnchorProof> = inner
            .proofs
            .values()
            .filter(|p| statuses.contains(&p.status))
            .cloned()
            .collect();
        proofs.sort_by_key(|p| p.submitted_at);
        Ok(proofs)
    }
}
