//! Anchor Client
//!
//! Submits batch roots to every configured timestamping service with
//! bounded, backed-off retries. Runs off the recording path entirely.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use super::proof::{AnchorProof, ProofEnvelope, ProofStatus, ServiceStamp};
use super::ServiceSet;
use crate::alert::{dispatch, Alert, AlertSink};
use crate::audit::event::{decode_hash, Severity};
use crate::audit::merkle::MerkleRoot;
use crate::config::AnchoringConfig;
use crate::database::{BatchStore, ProofStore};
use crate::error::{LedgerError, LedgerResult};

/// Retry and confirmation settings for anchoring
#[derive(Debug, Clone)]
pub struct AnchorPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub request_timeout: Duration,
    pub confirmation_target: u32,
    pub jitter: bool,
}

impl Default for AnchorPolicy {
    fn default() -> Self {
        Self::from(&AnchoringConfig::default())
    }
}

impl From<&AnchoringConfig> for AnchorPolicy {
    fn from(config: &AnchoringConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            confirmation_target: config.confirmation_target.max(1),
            jitter: true,
        }
    }
}

impl AnchorPolicy {
    /// Delay before retry `attempt` (0-based): doubling, capped, plus up to 25% jitter
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff.as_millis() as f64;
        let doubled = base * 2f64.powi(attempt.min(32) as i32);
        let capped = doubled.min(self.max_backoff.as_millis() as f64) as u64;
        let jitter = if self.jitter && capped > 0 {
            rand::thread_rng().gen_range(0..=capped / 4)
        } else {
            0
        };
        Duration::from_millis(capped + jitter)
    }
}

/// Marks the root's proof failed if the submission future is dropped
/// before it settles.
struct SubmissionGuard {
    proofs: Arc<dyn ProofStore>,
    root: MerkleRoot,
    confirmation_target: u32,
    attempts: u32,
    armed: bool,
}

impl SubmissionGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for SubmissionGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let proof = AnchorProof::failed(
            &self.root,
            self.attempts,
            self.confirmation_target,
            "submission cancelled".to_string(),
        );
        warn!("Anchoring of batch {} cancelled", self.root.batch_id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let proofs = Arc::clone(&self.proofs);
                handle.spawn(async move {
                    if let Err(e) = proofs.save_proof(&proof).await {
                        error!("Failed to record cancelled anchoring: {}", e);
                    }
                });
            }
            Err(_) => error!(
                "No runtime to record cancelled anchoring of batch {}",
                self.root.batch_id
            ),
        }
    }
}

pub struct AnchorClient {
    services: ServiceSet,
    batches: Arc<dyn BatchStore>,
    proofs: Arc<dyn ProofStore>,
    alerts: Arc<dyn AlertSink>,
    policy: AnchorPolicy,
}

impl AnchorClient {
    pub fn new(
        services: ServiceSet,
        batches: Arc<dyn BatchStore>,
        proofs: Arc<dyn ProofStore>,
        alerts: Arc<dyn AlertSink>,
        policy: AnchorPolicy,
    ) -> Self {
        Self {
            services,
            batches,
            proofs,
            alerts,
            policy,
        }
    }

    pub fn policy(&self) -> &AnchorPolicy {
        &self.policy
    }

    /// Anchor `root`, returning the stored proof.
    ///
    /// Retry exhaustion is not an error: the returned proof is `failed`, an
    /// alert is raised, and the root can be anchored again later.
    pub async fn anchor(&self, root: &MerkleRoot) -> LedgerResult<AnchorProof> {
        if self.services.is_empty() {
            return Err(LedgerError::ConfigError(
                "no timestamp services configured".to_string(),
            ));
        }
        if !root.is_consistent() {
            return Err(LedgerError::IntegrityViolation(format!(
                "refusing to anchor batch {}: root does not match its leaves",
                root.batch_id
            )));
        }
        let digest = decode_hash(&root.root)?;

        let mut guard = SubmissionGuard {
            proofs: Arc::clone(&self.proofs),
            root: root.clone(),
            confirmation_target: self.policy.confirmation_target,
            attempts: 0,
            armed: true,
        };

        let mut last_error = String::new();
        for attempt in 0..self.policy.max_attempts {
            guard.attempts = attempt + 1;
            match self.submit_once(&digest).await {
                Ok(stamps) => {
                    let envelope = ProofEnvelope {
                        digest: root.root.clone(),
                        stamps,
                    };
                    let proof = AnchorProof::pending(
                        root,
                        &envelope,
                        guard.attempts,
                        self.policy.confirmation_target,
                    )?;
                    self.proofs.save_proof(&proof).await?;
                    guard.disarm();
                    info!("Anchored {}", proof.summary());
                    return Ok(proof);
                }
                Err(e) => {
                    last_error = e.to_string();
                    if attempt + 1 < self.policy.max_attempts {
                        let delay = self.policy.backoff_for_attempt(attempt);
                        warn!(
                            "Anchoring batch {} failed (attempt {}/{}), retrying in {:?}: {}",
                            root.batch_id,
                            attempt + 1,
                            self.policy.max_attempts,
                            delay,
                            e
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        let failure = LedgerError::AnchorSubmissionFailure {
            attempts: guard.attempts,
            reason: last_error,
        };
        let proof = AnchorProof::failed(
            root,
            guard.attempts,
            self.policy.confirmation_target,
            failure.to_string(),
        );
        self.proofs.save_proof(&proof).await?;
        guard.disarm();

        error!("Anchoring batch {} gave up: {}", root.batch_id, failure);
        dispatch(
            &self.alerts,
            Alert::new(
                Severity::High,
                format!("Anchoring of batch {} failed: {}", root.batch_id, failure),
            ),
        );
        Ok(proof)
    }

    /// Anchor a stored batch by id
    pub async fn anchor_batch(&self, batch_id: &str) -> LedgerResult<AnchorProof> {
        let root = self
            .batches
            .get_root(batch_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("batch {}", batch_id)))?;
        self.anchor(&root).await
    }

    /// Anchor every batch of the chain that has no live proof yet.
    /// Batches whose only proofs failed are anchored afresh.
    pub async fn anchor_pending(&self, chain_id: &str) -> LedgerResult<Vec<AnchorProof>> {
        let mut anchored = Vec::new();
        for root in self.batches.list_roots(chain_id).await? {
            let live = self
                .proofs
                .proofs_for_root(&root.batch_id)
                .await?
                .iter()
                .any(|p| p.status != ProofStatus::Failed);
            if !live {
                anchored.push(self.anchor(&root).await?);
            }
        }
        Ok(anchored)
    }

    /// One round against every service; succeeds if any service accepted
    async fn submit_once(&self, digest: &[u8; 32]) -> LedgerResult<Vec<ServiceStamp>> {
        let mut stamps = Vec::new();
        let mut failures = Vec::new();

        for service in self.services.iter() {
            match tokio::time::timeout(self.policy.request_timeout, service.submit(digest)).await {
                Ok(Ok(artifact)) => stamps.push(ServiceStamp {
                    service: service.name().to_string(),
                    artifact,
                }),
                Ok(Err(e)) => failures.push(format!("{}: {}", service.name(), e)),
                Err(_) => failures.push(format!(
                    "{}: timed out after {:?}",
                    service.name(),
                    self.policy.request_timeout
                )),
            }
        }

        if stamps.is_empty() {
            return Err(LedgerError::ServiceError(failures.join("; ")));
        }
        for failure in &failures {
            warn!("Timestamp service skipped: {}", failure);
        }
        Ok(stamps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::MemoryAlertSink;
    use crate::audit::event::sha256_tagged;
    use crate::audit::merkle::BatchRange;
    use crate::database::MemoryStore;
    use crate::ots::{LocalNotary, TimestampService};

    const SECRET: &str = "anchor-test-secret-0001";

    fn fast_policy(max_attempts: u32) -> AnchorPolicy {
        AnchorPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            request_timeout: Duration::from_secs(2),
            confirmation_target: 1,
            jitter: false,
        }
    }

    async fn stored_root(store: &MemoryStore) -> MerkleRoot {
        let root = MerkleRoot::new(
            "main",
            vec![sha256_tagged(b"e0"), sha256_tagged(b"e1")],
            BatchRange {
                first_event_id: "e0".to_string(),
                last_event_id: "e1".to_string(),
                first_sequence: 0,
                last_sequence: 1,
            },
        )
        .unwrap();
        store.save_root(&root).await.unwrap();
        root
    }

    fn client(
        store: &Arc<MemoryStore>,
        notary: Arc<LocalNotary>,
        alerts: Arc<MemoryAlertSink>,
        policy: AnchorPolicy,
    ) -> AnchorClient {
        AnchorClient::new(
            ServiceSet::single(notary),
            store.clone(),
            store.clone(),
            alerts,
            policy,
        )
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = AnchorPolicy {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1_000),
            jitter: false,
            ..AnchorPolicy::default()
        };
        assert_eq!(policy.backoff_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_for_attempt(3), Duration::from_millis(800));
        assert_eq!(policy.backoff_for_attempt(10), Duration::from_millis(1_000));

        let jittered = AnchorPolicy { jitter: true, ..policy };
        let delay = jittered.backoff_for_attempt(1);
        assert!(delay >= Duration::from_millis(200) && delay <= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_anchor_creates_pending_proof() {
        let store = Arc::new(MemoryStore::new());
        let root = stored_root(&store).await;
        let notary = Arc::new(LocalNotary::new("notary", SECRET));
        let anchor = client(&store, notary, Arc::new(MemoryAlertSink::new()), fast_policy(3));

        let proof = anchor.anchor(&root).await.unwrap();
        assert_eq!(proof.status, ProofStatus::Pending);
        assert_eq!(proof.attempts, 1);
        assert_eq!(proof.envelope().unwrap().digest, root.root);
        assert_eq!(store.get_proof(&proof.proof_id).await.unwrap(), Some(proof));
    }

    #[tokio::test]
    async fn test_anchor_retries_transient_failures() {
        let store = Arc::new(MemoryStore::new());
        let root = stored_root(&store).await;
        let notary = Arc::new(LocalNotary::new("notary", SECRET));
        notary.fail_next(2);
        let anchor = client(&store, notary, Arc::new(MemoryAlertSink::new()), fast_policy(3));

        let proof = anchor.anchor(&root).await.unwrap();
        assert_eq!(proof.status, ProofStatus::Pending);
        assert_eq!(proof.attempts, 3);
    }

    #[tokio::test]
    async fn test_exhaustion_marks_failed_and_alerts() {
        let store = Arc::new(MemoryStore::new());
        let root = stored_root(&store).await;
        let notary = Arc::new(LocalNotary::new("notary", SECRET));
        notary.fail_next(10);
        let alerts = Arc::new(MemoryAlertSink::new());
        let anchor = client(&store, notary.clone(), alerts.clone(), fast_policy(3));

        let proof = anchor.anchor(&root).await.unwrap();
        assert_eq!(proof.status, ProofStatus::Failed);
        assert_eq!(proof.attempts, 3);
        assert!(proof.last_error.is_some());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(alerts.alerts().await.len(), 1);

        // the root itself is untouched and can be anchored again
        notary.fail_next(0);
        let retried = anchor.anchor_pending("main").await.unwrap();
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].status, ProofStatus::Pending);
        assert!(anchor.anchor_pending("main").await.unwrap().is_empty());
    }

    struct StalledService;

    #[async_trait::async_trait]
    impl TimestampService for StalledService {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn submit(&self, _digest: &[u8; 32]) -> LedgerResult<Vec<u8>> {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
            Ok(Vec::new())
        }

        async fn upgrade(&self, _digest: &[u8; 32], _artifact: &[u8]) -> LedgerResult<crate::ots::UpgradeOutcome> {
            Ok(crate::ots::UpgradeOutcome::Unchanged)
        }

        async fn verify(&self, _digest: &[u8; 32], _artifact: &[u8]) -> LedgerResult<crate::ots::Attestation> {
            Ok(crate::ots::Attestation::Pending)
        }
    }

    #[tokio::test]
    async fn test_cancelled_submission_is_marked_failed() {
        let store = Arc::new(MemoryStore::new());
        let root = stored_root(&store).await;
        let anchor = Arc::new(AnchorClient::new(
            ServiceSet::single(Arc::new(StalledService)),
            store.clone(),
            store.clone(),
            Arc::new(MemoryAlertSink::new()),
            AnchorPolicy {
                request_timeout: Duration::from_secs(3_600),
                ..fast_policy(1)
            },
        ));

        let task = {
            let anchor = anchor.clone();
            let root = root.clone();
            tokio::spawn(async move { anchor.anchor(&root).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        task.abort();
        let _ = task.await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let proofs = store.proofs_for_root(&root.batch_id).await.unwrap();
        assert_eq!(proofs.len(), 1);
        assert_eq!(proofs[0].status, ProofStatus::Failed);
    }

    #[tokio::test]
    async fn test_request_timeout_counts_as_failure() {
        let store = Arc::new(MemoryStore::new());
        let root = stored_root(&store).await;
        let anchor = AnchorClient::new(
            ServiceSet::single(Arc::new(StalledService)),
            store.clone(),
            store.clone(),
            Arc::new(MemoryAlertSink::new()),
            AnchorPolicy {
                request_timeout: Duration::from_millis(10),
                ..fast_policy(2)
            },
        );

        let proof = anchor.anchor(&root).await.unwrap();
        assert_eq!(proof.status, ProofStatus::Failed);
        assert!(proof.last_error.unwrap().contains("timed out"));
    }
}
