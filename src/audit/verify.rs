//! Ledger Verification
//!
//! Pure chain walking plus the on-demand `Verifier`, which checks an event
//! against its batch root, the surrounding chain and the anchor proof.
//! Nothing in this module writes to a store.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::alert::{dispatch, Alert, AlertSink};
use crate::audit::event::{decode_hash, Severity, GENESIS_HASH};
use crate::audit::merkle::{verify_inclusion, MerkleRoot};
use crate::database::{BatchStore, EventStore, ProofStore, StoredEntry};
use crate::error::{LedgerError, LedgerResult};
use crate::ots::proof::{AnchorProof, ProofStatus};
use crate::ots::{Attestation, ServiceSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakReason {
    /// Stored hash does not match the event's content
    ContentMismatch,
    /// `previous_hash` does not match the predecessor's hash
    LinkMismatch,
    /// A position before this entry is missing from the store
    MissingPredecessor,
    /// Timestamp earlier than the predecessor's
    TimestampRegression,
    /// Stored hash disagrees with the batch's Merkle leaf
    LeafMismatch,
    /// A position the batch covers is gone and nothing after it remains
    MissingEntry,
    /// The stored record could not be decoded into an event
    Undecodable,
}

impl fmt::Display for BreakReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ContentMismatch => "content hash mismatch",
            Self::LinkMismatch => "previous hash mismatch",
            Self::MissingPredecessor => "missing predecessor",
            Self::TimestampRegression => "timestamp regression",
            Self::LeafMismatch => "merkle leaf mismatch",
            Self::MissingEntry => "missing entry",
            Self::Undecodable => "undecodable record",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainBreak {
    pub event_id: String,
    pub sequence: u64,
    pub reason: BreakReason,
}

/// Result of walking a slice of chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainReport {
    pub entry_count: usize,
    pub tombstones: usize,
    pub broken_at: Option<ChainBreak>,
}

impl ChainReport {
    pub fn is_valid(&self) -> bool {
        self.broken_at.is_none()
    }

    pub fn summary(&self) -> String {
        match &self.broken_at {
            None => format!(
                "Chain is valid ({} entries, {} purged)",
                self.entry_count, self.tombstones
            ),
            Some(b) => format!(
                "Chain broken at event {} (#{}): {}",
                b.event_id, b.sequence, b.reason
            ),
        }
    }
}

/// Walk `entries` in order and report the first broken position.
///
/// `expected_previous` is the hash the first entry must link to; when it is
/// `None` only a sequence-0 entry is held to the genesis sentinel. Purged
/// positions are checked for linkage only.
pub fn verify_chain(entries: &[StoredEntry], expected_previous: Option<&str>) -> ChainReport {
    let mut report = ChainReport {
        entry_count: entries.len(),
        tombstones: 0,
        broken_at: None,
    };

    let mut previous: Option<&StoredEntry> = None;
    for entry in entries {
        if entry.is_tombstone() {
            report.tombstones += 1;
        }

        let reason = match previous {
            _ if entry.is_corrupt() => Some(BreakReason::Undecodable),
            Some(prev) if entry.sequence() != prev.sequence() + 1 => {
                Some(BreakReason::MissingPredecessor)
            }
            Some(prev) if entry.previous_hash() != prev.hash() => Some(BreakReason::LinkMismatch),
            Some(prev) if entry.timestamp() < prev.timestamp() => {
                Some(BreakReason::TimestampRegression)
            }
            Some(_) => None,
            None => match expected_previous {
                Some(expected) if entry.previous_hash() != expected => {
                    Some(BreakReason::LinkMismatch)
                }
                None if entry.sequence() == 0 && entry.previous_hash() != GENESIS_HASH => {
                    Some(BreakReason::LinkMismatch)
                }
                _ => None,
            },
        };

        let reason = reason.or_else(|| match entry.as_event() {
            Some(event) if !event.verify_hash() => Some(BreakReason::ContentMismatch),
            _ => None,
        });

        if let Some(reason) = reason {
            report.broken_at = Some(ChainBreak {
                event_id: entry.id().to_string(),
                sequence: entry.sequence(),
                reason,
            });
            break;
        }
        previous = Some(entry);
    }

    report
}

/// Ids of events whose stored hash no longer matches their content,
/// including records that no longer decode at all
pub fn find_tampered_events(entries: &[StoredEntry]) -> Vec<String> {
    entries
        .iter()
        .filter(|entry| match entry {
            StoredEntry::Event(event) => !event.verify_hash(),
            StoredEntry::Corrupt(_) => true,
            StoredEntry::Tombstone(_) => false,
        })
        .map(|entry| entry.id().to_string())
        .collect()
}

/// First entry of `entries` whose hash differs from the batch's leaf
fn first_leaf_mismatch(root: &MerkleRoot, entries: &[StoredEntry]) -> Option<ChainBreak> {
    entries.iter().find_map(|entry| {
        let index = root.leaf_index(entry.sequence())?;
        (root.leaves.get(index).map(String::as_str) != Some(entry.hash())).then(|| ChainBreak {
            event_id: entry.id().to_string(),
            sequence: entry.sequence(),
            reason: BreakReason::LeafMismatch,
        })
    })
}

/// First position of `root`'s range absent from `entries` (sorted by
/// sequence). Reported at the next entry present, or at the batch's last
/// event when nothing follows the hole.
pub fn first_missing(root: &MerkleRoot, entries: &[StoredEntry]) -> Option<ChainBreak> {
    let range = &root.batch_range;
    let missing = (range.first_sequence..=range.last_sequence).find(|seq| {
        entries
            .binary_search_by_key(seq, StoredEntry::sequence)
            .is_err()
    })?;

    Some(match entries.iter().find(|e| e.sequence() > missing) {
        Some(next) => ChainBreak {
            event_id: next.id().to_string(),
            sequence: next.sequence(),
            reason: BreakReason::MissingPredecessor,
        },
        None => ChainBreak {
            event_id: range.last_event_id.clone(),
            sequence: missing,
            reason: BreakReason::MissingEntry,
        },
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    Verified,
    ChainBroken(String),
    ProofInvalid(String),
    /// Nothing contradicts the claim but the anchor is not confirmed yet
    Inconclusive(String),
}

impl VerificationOutcome {
    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Verified)
    }

    /// Outcomes that mean the stored history or its proof was tampered with
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::ChainBroken(_) | Self::ProofInvalid(_))
    }

    /// Process exit status for the CLI
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Verified => 0,
            Self::ChainBroken(_) | Self::ProofInvalid(_) => 1,
            Self::Inconclusive(_) => 2,
        }
    }
}

impl fmt::Display for VerificationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Verified => write!(f, "verified"),
            Self::ChainBroken(id) => write!(f, "chain broken at event {}", id),
            Self::ProofInvalid(reason) => write!(f, "proof invalid: {}", reason),
            Self::Inconclusive(reason) => write!(f, "inconclusive: {}", reason),
        }
    }
}

pub struct Verifier {
    events: Arc<dyn EventStore>,
    batches: Arc<dyn BatchStore>,
    proofs: Arc<dyn ProofStore>,
    services: ServiceSet,
    alerts: Arc<dyn AlertSink>,
    request_timeout: Duration,
}

impl Verifier {
    pub fn new(
        events: Arc<dyn EventStore>,
        batches: Arc<dyn BatchStore>,
        proofs: Arc<dyn ProofStore>,
        services: ServiceSet,
        alerts: Arc<dyn AlertSink>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            events,
            batches,
            proofs,
            services,
            alerts,
            request_timeout,
        }
    }

    /// Check that `event_id` is included in the batch `proof_id` anchors,
    /// that the chain around that batch is intact, and that the proof
    /// attests the batch root. Broken chains and invalid proofs raise a
    /// critical alert.
    pub async fn verify_event(
        &self,
        event_id: &str,
        proof_id: &str,
    ) -> LedgerResult<VerificationOutcome> {
        let outcome = self.evaluate(event_id, proof_id).await?;
        if outcome.is_failure() {
            dispatch(
                &self.alerts,
                Alert::new(
                    Severity::Critical,
                    format!(
                        "Verification of event {} against proof {} failed: {}",
                        event_id, proof_id, outcome
                    ),
                ),
            );
        }
        Ok(outcome)
    }

    async fn evaluate(&self, event_id: &str, proof_id: &str) -> LedgerResult<VerificationOutcome> {
        let entry = self
            .events
            .get(event_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("event {}", event_id)))?;
        let proof = self
            .proofs
            .get_proof(proof_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("proof {}", proof_id)))?;
        let root = self
            .batches
            .get_root(&proof.merkle_root_ref)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("batch {}", proof.merkle_root_ref)))?;

        // (a) inclusion
        if root.chain_id != entry.chain_id() || !root.batch_range.contains(entry.sequence()) {
            return Ok(self.invalid(format!(
                "event {} is not part of batch {}",
                event_id, root.batch_id
            )));
        }
        if !root.is_consistent() || proof.root != root.root {
            return Ok(self.invalid(format!(
                "batch {} root does not match its leaves or its proof",
                root.batch_id
            )));
        }

        // (b) chain walk through the batch and one position past each boundary
        let first = root.batch_range.first_sequence.saturating_sub(1);
        let last = root.batch_range.last_sequence + 1;
        let window = self.events.range(&root.chain_id, first, last).await?;
        if let Some(broken) = Self::first_break(&root, &window) {
            error!(
                "Chain {} broken at event {} (#{}): {}",
                root.chain_id, broken.event_id, broken.sequence, broken.reason
            );
            return Ok(VerificationOutcome::ChainBroken(broken.event_id));
        }

        let inclusion = root.inclusion_proof(entry.sequence())?;
        if !verify_inclusion(entry.hash(), &inclusion.path, &root.root) {
            return Ok(VerificationOutcome::ChainBroken(event_id.to_string()));
        }
        debug!("{}", inclusion.summary());

        // (c) external attestation
        self.check_attestation(&root, &proof).await
    }

    /// The earliest break in `window`, counting disagreement with the root
    fn first_break(root: &MerkleRoot, window: &[StoredEntry]) -> Option<ChainBreak> {
        let walked = verify_chain(window, None).broken_at;
        let leaf = first_leaf_mismatch(root, window);
        let hole = first_missing(root, window);

        [walked, leaf, hole]
            .into_iter()
            .flatten()
            .min_by_key(|b| b.sequence)
    }

    async fn check_attestation(
        &self,
        root: &MerkleRoot,
        proof: &AnchorProof,
    ) -> LedgerResult<VerificationOutcome> {
        if proof.status == ProofStatus::Failed {
            return Ok(VerificationOutcome::Inconclusive(format!(
                "anchoring of batch {} failed; re-anchor it",
                root.batch_id
            )));
        }

        let envelope = match proof.envelope() {
            Ok(envelope) => envelope,
            Err(e) => return Ok(self.invalid(e.to_string())),
        };
        if envelope.digest != root.root {
            return Ok(self.invalid("proof attests a different root".to_string()));
        }
        let digest = decode_hash(&envelope.digest)?;

        let mut confirmed = 0u32;
        let mut unreachable = Vec::new();
        for stamp in &envelope.stamps {
            let Some(service) = self.services.find(&stamp.service) else {
                unreachable.push(format!("{} is not configured", stamp.service));
                continue;
            };
            match tokio::time::timeout(self.request_timeout, service.verify(&digest, &stamp.artifact)).await {
                Ok(Ok(Attestation::Confirmed { block_height })) => {
                    debug!("{} confirms {} at block {}", stamp.service, root.root, block_height);
                    confirmed += 1;
                }
                Ok(Ok(Attestation::Pending)) => {}
                Ok(Ok(Attestation::Invalid(reason))) => {
                    return Ok(self.invalid(format!("{}: {}", stamp.service, reason)));
                }
                Ok(Err(e)) => unreachable.push(format!("{}: {}", stamp.service, e)),
                Err(_) => unreachable.push(format!("{}: timed out", stamp.service)),
            }
        }

        if confirmed >= proof.confirmation_target {
            info!("Batch {} verified against proof {}", root.batch_id, proof.proof_id);
            return Ok(VerificationOutcome::Verified);
        }

        let mut reason = format!(
            "pending upgrade: {}/{} confirmations",
            confirmed, proof.confirmation_target
        );
        if !unreachable.is_empty() {
            reason.push_str(&format!(" ({})", unreachable.join("; ")));
        }
        Ok(VerificationOutcome::Inconclusive(reason))
    }

    fn invalid(&self, reason: String) -> VerificationOutcome {
        warn!("Proof invalid: {}", reason);
        VerificationOutcome::ProofInvalid(reason)
    }

    /// Re-walk a whole chain from genesis to its head
    pub async fn verify_chain(&self, chain_id: &str) -> LedgerResult<ChainReport> {
        let Some(head) = self.events.head(chain_id).await? else {
            return Ok(ChainReport {
                entry_count: 0,
                tombstones: 0,
                broken_at: None,
            });
        };
        let entries = self.events.range(chain_id, 0, head.sequence).await?;

        let mut report = verify_chain(&entries, Some(GENESIS_HASH));
        if report.broken_at.is_none() {
            if let Some(first) = entries.first().filter(|e| e.sequence() != 0) {
                report.broken_at = Some(ChainBreak {
                    event_id: first.id().to_string(),
                    sequence: first.sequence(),
                    reason: BreakReason::MissingPredecessor,
                });
            }
        }

        // every batch must still be backed by all of its positions
        if report.is_valid() {
            for root in self.batches.list_roots(chain_id).await? {
                let broken = first_missing(&root, &entries)
                    .into_iter()
                    .chain(first_leaf_mismatch(&root, &entries))
                    .min_by_key(|b| b.sequence);
                if broken.is_some() {
                    report.broken_at = broken;
                    break;
                }
            }
        }

        match &report.broken_at {
            None => info!("Chain {}: {}", chain_id, report.summary()),
            Some(_) => {
                error!("Chain {}: {}", chain_id, report.summary());
                dispatch(
                    &self.alerts,
                    Alert::new(Severity::Critical, format!("Chain {}: {}", chain_id, report.summary())),
                );
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::event::{AuditEvent, Category, EventDraft};
    use crate::database::{CorruptEntry, Tombstone};
    use chrono::{Duration as ChronoDuration, Utc};

    fn chain(len: u64) -> Vec<StoredEntry> {
        let start = Utc::now();
        let mut previous = GENESIS_HASH.to_string();
        (0..len)
            .map(|seq| {
                let draft = EventDraft::new("deploy", Category::System, "ci", "release")
                    .message(format!("release {}", seq));
                let event = AuditEvent::seal(
                    draft,
                    "main",
                    seq,
                    &previous,
                    start + ChronoDuration::seconds(seq as i64),
                )
                .unwrap();
                previous = event.hash.clone();
                StoredEntry::Event(event)
            })
            .collect()
    }

    fn event_mut(entry: &mut StoredEntry) -> &mut AuditEvent {
        match entry {
            StoredEntry::Event(event) => event,
            _ => panic!("expected event"),
        }
    }

    fn root_over(entries: &[StoredEntry]) -> MerkleRoot {
        let (first, last) = (&entries[0], &entries[entries.len() - 1]);
        MerkleRoot::new(
            "main",
            entries.iter().map(|e| e.hash().to_string()).collect(),
            crate::audit::merkle::BatchRange {
                first_event_id: first.id().to_string(),
                last_event_id: last.id().to_string(),
                first_sequence: first.sequence(),
                last_sequence: last.sequence(),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_valid_chain() {
        let entries = chain(5);
        let report = verify_chain(&entries, Some(GENESIS_HASH));
        assert!(report.is_valid());
        assert_eq!(report.entry_count, 5);
        assert!(report.summary().contains("valid"));
    }

    #[test]
    fn test_content_tamper_detected_at_event() {
        let mut entries = chain(5);
        event_mut(&mut entries[2]).message.push('!');
        let report = verify_chain(&entries, None);
        let broken = report.broken_at.unwrap();
        assert_eq!(broken.sequence, 2);
        assert_eq!(broken.reason, BreakReason::ContentMismatch);
        assert_eq!(find_tampered_events(&entries), vec![entries[2].id().to_string()]);
    }

    #[test]
    fn test_rehashed_tamper_breaks_successor_link() {
        let mut entries = chain(4);
        let event = event_mut(&mut entries[1]);
        event.message = "rewritten".to_string();
        event.hash = event.calculate_hash().unwrap();

        let broken = verify_chain(&entries, None).broken_at.unwrap();
        assert_eq!(broken.sequence, 2);
        assert_eq!(broken.reason, BreakReason::LinkMismatch);
    }

    #[test]
    fn test_gap_and_tombstone() {
        let mut entries = chain(4);
        let purged = Tombstone::of(entries[1].as_event().unwrap(), Utc::now());
        entries[1] = StoredEntry::Tombstone(purged);
        let report = verify_chain(&entries, None);
        assert!(report.is_valid());
        assert_eq!(report.tombstones, 1);

        entries.remove(2);
        let broken = verify_chain(&entries, None).broken_at.unwrap();
        assert_eq!(broken.reason, BreakReason::MissingPredecessor);
        assert_eq!(broken.sequence, 3);
    }

    #[test]
    fn test_missing_batch_tail_is_reported() {
        let mut entries = chain(5);
        let root = root_over(&entries);
        assert_eq!(first_missing(&root, &entries), None);

        // nothing follows the erased last event of the batch
        let erased = entries.pop().unwrap();
        assert!(verify_chain(&entries, None).is_valid());
        let broken = first_missing(&root, &entries).unwrap();
        assert_eq!(broken.event_id, erased.id());
        assert_eq!(broken.sequence, 4);
        assert_eq!(broken.reason, BreakReason::MissingEntry);

        // a hole in the middle is pinned on its successor
        let mut entries = chain(5);
        entries.remove(2);
        let broken = first_missing(&root, &entries).unwrap();
        assert_eq!(broken.sequence, 3);
        assert_eq!(broken.reason, BreakReason::MissingPredecessor);
    }

    #[test]
    fn test_undecodable_entry_breaks_chain() {
        let mut entries = chain(3);
        let original = entries[1].clone();
        entries[1] = StoredEntry::Corrupt(CorruptEntry {
            event_id: original.id().to_string(),
            chain_id: "main".to_string(),
            sequence: original.sequence(),
            previous_hash: original.previous_hash().to_string(),
            hash: original.hash().to_string(),
            timestamp: original.timestamp(),
            error: "expected `,` or `}`".to_string(),
        });

        let broken = verify_chain(&entries, None).broken_at.unwrap();
        assert_eq!(broken.event_id, original.id());
        assert_eq!(broken.reason, BreakReason::Undecodable);
        assert_eq!(find_tampered_events(&entries), vec![original.id().to_string()]);
    }

    #[test]
    fn test_expected_previous_checked() {
        let entries = chain(3);
        let tail = &entries[1..];
        assert!(verify_chain(tail, Some(entries[0].hash())).is_valid());
        assert!(!verify_chain(tail, Some(GENESIS_HASH)).is_valid());
    }

    #[test]
    fn test_outcome_exit_codes() {
        assert_eq!(VerificationOutcome::Verified.exit_code(), 0);
        assert_eq!(VerificationOutcome::ChainBroken("e".into()).exit_code(), 1);
        assert_eq!(VerificationOutcome::ProofInvalid("p".into()).exit_code(), 1);
        assert_eq!(VerificationOutcome::Inconclusive("i".into()).exit_code(), 2);
    }
}
