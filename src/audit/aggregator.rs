//! Batch Aggregator
//!
//! Folds contiguous runs of committed events into Merkle roots. Only reads
//! committed history, so it never contends with the recorder.

use std::ops::RangeInclusive;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::audit::merkle::{BatchRange, MerkleRoot};
use crate::database::{BatchStore, EventStore, StoredEntry};
use crate::error::{LedgerError, LedgerResult};

pub struct BatchAggregator {
    events: Arc<dyn EventStore>,
    batches: Arc<dyn BatchStore>,
    batch_max_events: usize,
}

impl BatchAggregator {
    pub fn new(
        events: Arc<dyn EventStore>,
        batches: Arc<dyn BatchStore>,
        batch_max_events: usize,
    ) -> Self {
        Self {
            events,
            batches,
            batch_max_events: batch_max_events.max(1),
        }
    }

    /// Build and persist the root for `range` (inclusive chain sequences).
    ///
    /// Returns `None` when the range is empty or nothing in it has been
    /// committed yet. Re-aggregating a stored range returns the stored root.
    pub async fn aggregate(
        &self,
        chain_id: &str,
        range: RangeInclusive<u64>,
    ) -> LedgerResult<Option<MerkleRoot>> {
        if range.is_empty() {
            debug!("Empty aggregation range for {}", chain_id);
            return Ok(None);
        }
        let (first, last) = (*range.start(), *range.end());

        let Some(head) = self.events.head(chain_id).await? else {
            return Ok(None);
        };
        if first > head.sequence {
            return Ok(None);
        }
        if last > head.sequence {
            return Err(LedgerError::missing(chain_id, head.sequence + 1));
        }

        if let Some(existing) = self.batches.find_root(chain_id, first, last).await? {
            return self.confirm_existing(existing).map(Some);
        }

        let entries = self.events.range(chain_id, first, last).await?;
        let leaves = Self::contiguous_leaves(chain_id, first, last, &entries)?;

        let (Some(first_entry), Some(last_entry)) = (entries.first(), entries.last()) else {
            return Ok(None);
        };
        let batch_range = BatchRange {
            first_event_id: first_entry.id().to_string(),
            last_event_id: last_entry.id().to_string(),
            first_sequence: first,
            last_sequence: last,
        };

        let root = MerkleRoot::new(chain_id, leaves, batch_range)?;
        self.batches.save_root(&root).await?;
        info!("Aggregated {}", root.summary());
        Ok(Some(root))
    }

    /// Aggregate the batch bounded by two event ids of the same chain
    pub async fn aggregate_events(
        &self,
        first_event_id: &str,
        last_event_id: &str,
    ) -> LedgerResult<Option<MerkleRoot>> {
        let first = self.lookup(first_event_id).await?;
        let last = self.lookup(last_event_id).await?;
        if first.chain_id() != last.chain_id() {
            return Err(LedgerError::InvalidRange(format!(
                "{} and {} belong to different chains",
                first_event_id, last_event_id
            )));
        }
        self.aggregate(first.chain_id(), first.sequence()..=last.sequence())
            .await
    }

    /// Aggregate every committed event after the last stored batch,
    /// closing a batch every `batch_max_events` events.
    pub async fn aggregate_pending(&self, chain_id: &str) -> LedgerResult<Vec<MerkleRoot>> {
        let Some(head) = self.events.head(chain_id).await? else {
            return Ok(Vec::new());
        };

        let mut next = self
            .batches
            .list_roots(chain_id)
            .await?
            .last()
            .map(|r| r.batch_range.last_sequence + 1)
            .unwrap_or(0);

        let mut created = Vec::new();
        while next <= head.sequence {
            let last = head
                .sequence
                .min(next + self.batch_max_events as u64 - 1);
            if let Some(root) = self.aggregate(chain_id, next..=last).await? {
                created.push(root);
            }
            next = last + 1;
        }

        if !created.is_empty() {
            info!("Closed {} batch(es) on chain {}", created.len(), chain_id);
        }
        Ok(created)
    }

    async fn lookup(&self, event_id: &str) -> LedgerResult<StoredEntry> {
        self.events
            .get(event_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("event {}", event_id)))
    }

    fn confirm_existing(&self, existing: MerkleRoot) -> LedgerResult<MerkleRoot> {
        if !existing.is_consistent() {
            warn!("Stored root no longer matches its leaves: {}", existing.summary());
            return Err(LedgerError::IntegrityViolation(format!(
                "batch {} root does not match its stored leaves",
                existing.batch_id
            )));
        }
        debug!("Range already aggregated as batch {}", existing.batch_id);
        Ok(existing)
    }

    /// Leaf hashes of `first..=last` in commit order, failing on any hole
    fn contiguous_leaves(
        chain_id: &str,
        first: u64,
        last: u64,
        entries: &[StoredEntry],
    ) -> LedgerResult<Vec<String>> {
        let mut leaves = Vec::with_capacity(entries.len());
        let mut expected = first;
        for entry in entries {
            if entry.sequence() != expected {
                return Err(LedgerError::missing(chain_id, expected));
            }
            if entry.is_corrupt() {
                return Err(LedgerError::IntegrityViolation(format!(
                    "event {} on chain {} has a corrupt record",
                    entry.id(),
                    chain_id
                )));
            }
            leaves.push(entry.hash().to_string());
            expected += 1;
        }
        if expected <= last {
            return Err(LedgerError::missing(chain_id, expected));
        }
        Ok(leaves)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::event::{Category, EventDraft};
    use crate::audit::recorder::EventRecorder;
    use crate::database::MemoryStore;
    use chrono::Utc;

    async fn seeded(count: usize) -> (Arc<MemoryStore>, Vec<crate::audit::event::AuditEvent>) {
        let store = Arc::new(MemoryStore::new());
        let recorder = EventRecorder::open("main", store.clone()).await.unwrap();
        let mut events = Vec::new();
        for i in 0..count {
            let draft = EventDraft::new("login", Category::Security, "auth", "authenticate")
                .message(format!("attempt {}", i));
            events.push(recorder.record(draft).await.unwrap());
        }
        (store, events)
    }

    fn aggregator(store: &Arc<MemoryStore>, max: usize) -> BatchAggregator {
        BatchAggregator::new(store.clone(), store.clone(), max)
    }

    #[tokio::test]
    async fn test_aggregate_range() {
        let (store, events) = seeded(5).await;
        let root = aggregator(&store, 100)
            .aggregate("main", 0..=4)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(root.entry_count, 5);
        assert_eq!(root.leaves[2], events[2].hash);
        assert_eq!(root.batch_range.first_event_id, events[0].id);
        assert_eq!(root.batch_range.last_event_id, events[4].id);
        assert!(root.is_consistent());
    }

    #[tokio::test]
    async fn test_empty_range_is_noop() {
        let (store, _) = seeded(2).await;
        let agg = aggregator(&store, 100);
        #[allow(clippy::reversed_empty_ranges)]
        let none = agg.aggregate("main", 3..=1).await.unwrap();
        assert!(none.is_none());
        assert!(agg.aggregate("other", 0..=3).await.unwrap().is_none());
        assert!(agg.aggregate("main", 10..=12).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reaggregation_is_idempotent() {
        let (store, _) = seeded(4).await;
        let agg = aggregator(&store, 100);
        let first = agg.aggregate("main", 0..=3).await.unwrap().unwrap();
        let again = agg.aggregate("main", 0..=3).await.unwrap().unwrap();
        assert_eq!(first, again);
        assert_eq!(store.list_roots("main").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_leaf_fails_closed() {
        let (store, events) = seeded(5).await;
        store.erase(&events[2].id).await.unwrap();

        let result = aggregator(&store, 100).aggregate("main", 0..=4).await;
        match result {
            Err(LedgerError::IncompleteRange { missing, .. }) => assert_eq!(missing, 2),
            other => panic!("expected IncompleteRange, got {:?}", other),
        }
        assert!(store.list_roots("main").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_range_past_head_fails_closed() {
        let (store, _) = seeded(3).await;
        let result = aggregator(&store, 100).aggregate("main", 1..=5).await;
        assert!(matches!(result, Err(LedgerError::IncompleteRange { missing: 3, .. })));
    }

    #[tokio::test]
    async fn test_overlapping_batch_rejected() {
        let (store, _) = seeded(6).await;
        let agg = aggregator(&store, 100);
        agg.aggregate("main", 0..=3).await.unwrap();
        assert!(matches!(
            agg.aggregate("main", 2..=5).await,
            Err(LedgerError::InvalidRange(_))
        ));
    }

    #[tokio::test]
    async fn test_aggregate_pending_chunks_batches() {
        let (store, _) = seeded(7).await;
        let agg = aggregator(&store, 3);

        let roots = agg.aggregate_pending("main").await.unwrap();
        let ranges: Vec<(u64, u64)> = roots
            .iter()
            .map(|r| (r.batch_range.first_sequence, r.batch_range.last_sequence))
            .collect();
        assert_eq!(ranges, vec![(0, 2), (3, 5), (6, 6)]);
        assert!(agg.aggregate_pending("main").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_aggregate_by_event_ids() {
        let (store, events) = seeded(4).await;
        let root = aggregator(&store, 100)
            .aggregate_events(&events[1].id, &events[3].id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(root.batch_range.first_sequence, 1);
        assert_eq!(root.entry_count, 3);
    }

    #[tokio::test]
    async fn test_tombstone_keeps_leaf() {
        let (store, events) = seeded(3).await;
        store.purge(&events[1].id, Utc::now()).await.unwrap();
        let root = aggregator(&store, 100)
            .aggregate("main", 0..=2)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(root.leaves[1], events[1].hash);
    }
}
