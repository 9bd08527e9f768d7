//! Retention Manager
//!
//! Enforces per-category retention windows. A raw event may only be purged
//! once its window has elapsed AND its batch carries a verified anchor
//! proof, so the leaf hash plus proof still evidence the event afterwards.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::alert::{dispatch, Alert, AlertSink};
use crate::audit::event::{AuditEvent, Category, Severity};
use crate::database::{BatchStore, EventStore, ProofStore, StoredEntry, Tombstone};
use crate::error::{LedgerError, LedgerResult};
use crate::ots::proof::ProofStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageClass {
    Hot,
    Warm,
    Cold,
    Archive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub category: Category,
    pub min_days: u32,
    pub storage_class: StorageClass,
}

impl RetentionPolicy {
    pub fn expires_at(&self, recorded_at: DateTime<Utc>) -> DateTime<Utc> {
        recorded_at + Duration::days(i64::from(self.min_days))
    }
}

pub struct RetentionManager {
    policies: HashMap<Category, RetentionPolicy>,
    events: Arc<dyn EventStore>,
    batches: Arc<dyn BatchStore>,
    proofs: Arc<dyn ProofStore>,
    alerts: Arc<dyn AlertSink>,
}

impl RetentionManager {
    pub fn new(
        policies: HashMap<Category, RetentionPolicy>,
        events: Arc<dyn EventStore>,
        batches: Arc<dyn BatchStore>,
        proofs: Arc<dyn ProofStore>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            policies,
            events,
            batches,
            proofs,
            alerts,
        }
    }

    pub fn policy(&self, category: Category) -> Option<&RetentionPolicy> {
        self.policies.get(&category)
    }

    /// Whether the event's retention window has elapsed at `now`.
    /// Categories without a policy are never reapable.
    pub fn reapable_at(&self, event: &AuditEvent, now: DateTime<Utc>) -> bool {
        self.policy(event.category)
            .map(|policy| now >= policy.expires_at(event.timestamp))
            .unwrap_or(false)
    }

    pub fn reapable(&self, event: &AuditEvent) -> bool {
        self.reapable_at(event, Utc::now())
    }

    /// True when the batch holding `sequence` has a verified anchor proof
    async fn anchored_and_verified(&self, event: &AuditEvent) -> LedgerResult<bool> {
        let Some(root) = self
            .batches
            .root_containing(&event.chain_id, event.sequence)
            .await?
        else {
            return Ok(false);
        };
        let proofs = self.proofs.proofs_for_root(&root.batch_id).await?;
        Ok(proofs.iter().any(|p| p.status == ProofStatus::Verified))
    }

    pub async fn purge(&self, event_id: &str) -> LedgerResult<Tombstone> {
        self.purge_at(event_id, Utc::now()).await
    }

    /// Purge the raw event, keeping its hash and position as a tombstone
    pub async fn purge_at(&self, event_id: &str, now: DateTime<Utc>) -> LedgerResult<Tombstone> {
        let event = match self.events.get(event_id).await? {
            Some(StoredEntry::Event(event)) => event,
            Some(StoredEntry::Tombstone(t)) => {
                return Err(LedgerError::NotFound(format!(
                    "event {} was already purged at {}",
                    event_id, t.purged_at
                )))
            }
            Some(StoredEntry::Corrupt(c)) => {
                return Err(LedgerError::IntegrityViolation(format!(
                    "event {} has a corrupt record: {}",
                    event_id, c.error
                )))
            }
            None => return Err(LedgerError::NotFound(format!("event {}", event_id))),
        };

        if !self.reapable_at(&event, now) {
            let until = self
                .policy(event.category)
                .map(|p| p.expires_at(event.timestamp).to_rfc3339())
                .unwrap_or_else(|| "indefinitely".to_string());
            return Err(self.refuse(&event, format!("retained until {}", until)));
        }

        if !self.anchored_and_verified(&event).await? {
            return Err(self.refuse(&event, "batch has no verified anchor proof".to_string()));
        }

        let tombstone = self.events.purge(event_id, now).await?;
        info!(
            "Purged event {} ({} #{}), tombstone keeps {}",
            event_id, event.chain_id, event.sequence, tombstone.hash
        );
        Ok(tombstone)
    }

    fn refuse(&self, event: &AuditEvent, reason: String) -> LedgerError {
        warn!("Premature purge of event {} blocked: {}", event.id, reason);
        dispatch(
            &self.alerts,
            Alert::new(
                Severity::High,
                format!("Blocked purge of {} event {}: {}", event.category, event.id, reason),
            ),
        );
        LedgerError::RetentionViolation(format!("event {}: {}", event.id, reason))
    }

    /// Event ids of a chain that could be purged at `now`. Deletes nothing.
    pub async fn sweep(&self, chain_id: &str, now: DateTime<Utc>) -> LedgerResult<Vec<String>> {
        let Some(head) = self.events.head(chain_id).await? else {
            return Ok(Vec::new());
        };

        let mut candidates = Vec::new();
        for root in self.batches.list_roots(chain_id).await? {
            let verified = self
                .proofs
                .proofs_for_root(&root.batch_id)
                .await?
                .iter()
                .any(|p| p.status == ProofStatus::Verified);
            if !verified {
                continue;
            }
            let last = root.batch_range.last_sequence.min(head.sequence);
            for entry in self
                .events
                .range(chain_id, root.batch_range.first_sequence, last)
                .await?
            {
                if let StoredEntry::Event(event) = entry {
                    if self.reapable_at(&event, now) {
                        candidates.push(event.id);
                    }
                }
            }
        }
        Ok(candidates)
    }
}
