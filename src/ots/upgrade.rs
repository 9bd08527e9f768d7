//! Proof Upgrader
//!
//! Periodically exchanges provisional artifacts for confirmed ones and
//! moves proofs forward along `pending -> upgraded -> verified`.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::proof::{AnchorProof, ProofStatus};
use super::{Attestation, ServiceSet, UpgradeOutcome};
use crate::alert::{dispatch, Alert, AlertSink};
use crate::audit::event::{decode_hash, Severity};
use crate::database::ProofStore;
use crate::error::LedgerResult;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradeReport {
    pub checked: usize,
    pub upgraded: usize,
    pub verified: usize,
    pub failed: usize,
    pub unchanged: usize,
}

impl UpgradeReport {
    pub fn summary(&self) -> String {
        format!(
            "{} checked: {} upgraded, {} verified, {} failed, {} unchanged",
            self.checked, self.upgraded, self.verified, self.failed, self.unchanged
        )
    }
}

pub struct ProofUpgrader {
    services: ServiceSet,
    proofs: Arc<dyn ProofStore>,
    alerts: Arc<dyn AlertSink>,
    request_timeout: Duration,
}

impl ProofUpgrader {
    pub fn new(
        services: ServiceSet,
        proofs: Arc<dyn ProofStore>,
        alerts: Arc<dyn AlertSink>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            services,
            proofs,
            alerts,
            request_timeout,
        }
    }

    /// Poll every pending or upgraded proof once
    pub async fn upgrade_all(&self) -> LedgerResult<UpgradeReport> {
        let open = self
            .proofs
            .proofs_with_status(&[ProofStatus::Pending, ProofStatus::Upgraded])
            .await?;

        let mut report = UpgradeReport::default();
        for proof in open {
            report.checked += 1;
            let before = proof.status;
            let proof_id = proof.proof_id.clone();
            match self.upgrade_proof(proof).await {
                Ok(updated) if updated.status == before => report.unchanged += 1,
                Ok(updated) => match updated.status {
                    ProofStatus::Verified => report.verified += 1,
                    ProofStatus::Failed => report.failed += 1,
                    _ => report.upgraded += 1,
                },
                Err(e) => {
                    warn!("Could not upgrade proof {}: {}", proof_id, e);
                    report.unchanged += 1;
                }
            }
        }

        if report.checked > 0 {
            info!("Proof upgrade pass: {}", report.summary());
        }
        Ok(report)
    }

    /// Upgrade one proof and persist it if anything changed.
    /// Verified and failed proofs are returned untouched.
    pub async fn upgrade_proof(&self, mut proof: AnchorProof) -> LedgerResult<AnchorProof> {
        if proof.status.is_terminal() {
            return Ok(proof);
        }

        let mut envelope = proof.envelope()?;
        let digest = decode_hash(&envelope.digest)?;
        if envelope.digest != proof.root {
            return self
                .fail(proof, "proof envelope digest does not match the batch root".to_string())
                .await;
        }

        let mut artifacts_changed = false;
        for stamp in envelope.stamps.iter_mut() {
            let Some(service) = self.services.find(&stamp.service) else {
                debug!("No configured service named {}", stamp.service);
                continue;
            };
            match tokio::time::timeout(self.request_timeout, service.upgrade(&digest, &stamp.artifact)).await {
                Ok(Ok(UpgradeOutcome::Upgraded(artifact))) => {
                    stamp.artifact = artifact;
                    artifacts_changed = true;
                }
                Ok(Ok(UpgradeOutcome::Unchanged)) => {}
                Ok(Err(e)) => warn!("Upgrade from {} failed: {}", stamp.service, e),
                Err(_) => warn!("Upgrade from {} timed out", stamp.service),
            }
        }

        let mut confirmed_heights = Vec::new();
        for stamp in &envelope.stamps {
            let Some(service) = self.services.find(&stamp.service) else {
                continue;
            };
            match tokio::time::timeout(self.request_timeout, service.verify(&digest, &stamp.artifact)).await {
                Ok(Ok(Attestation::Confirmed { block_height })) => confirmed_heights.push(block_height),
                Ok(Ok(Attestation::Pending)) => {}
                Ok(Ok(Attestation::Invalid(reason))) => {
                    return self
                        .fail(proof, format!("{} rejected its artifact: {}", stamp.service, reason))
                        .await;
                }
                Ok(Err(e)) => warn!("Verification by {} failed: {}", stamp.service, e),
                Err(_) => warn!("Verification by {} timed out", stamp.service),
            }
        }

        let next = if confirmed_heights.len() >= proof.confirmation_target as usize {
            ProofStatus::Verified
        } else if artifacts_changed || !confirmed_heights.is_empty() {
            ProofStatus::Upgraded
        } else {
            proof.status
        };

        if !artifacts_changed && next == proof.status {
            return Ok(proof);
        }

        if artifacts_changed {
            proof.proof_blob = envelope.to_bytes()?;
            proof.updated_at = Utc::now();
        }
        proof.transition(next)?;
        if next == ProofStatus::Verified {
            proof.block_height = confirmed_heights.iter().copied().min();
        }
        self.proofs.save_proof(&proof).await?;

        info!("Proof {}", proof.summary());
        Ok(proof)
    }

    async fn fail(&self, mut proof: AnchorProof, reason: String) -> LedgerResult<AnchorProof> {
        error!("Proof {} is invalid: {}", proof.proof_id, reason);
        proof.transition(ProofStatus::Failed)?;
        proof.last_error = Some(reason.clone());
        self.proofs.save_proof(&proof).await?;
        dispatch(
            &self.alerts,
            Alert::new(
                Severity::Critical,
                format!("Anchor proof {} failed upgrade: {}", proof.proof_id, reason),
            ),
        );
        Ok(proof)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::MemoryAlertSink;
    use crate::audit::event::sha256_tagged;
    use crate::audit::merkle::{BatchRange, MerkleRoot};
    use crate::database::{BatchStore, MemoryStore};
    use crate::ots::{AnchorClient, AnchorPolicy, LocalNotary, TimestampService};

    const SECRET: &str = "upgrade-test-secret-01";

    async fn anchored(store: &Arc<MemoryStore>, notary: &Arc<LocalNotary>) -> AnchorProof {
        let root = MerkleRoot::new(
            "main",
            vec![sha256_tagged(b"only")],
            BatchRange {
                first_event_id: "e0".to_string(),
                last_event_id: "e0".to_string(),
                first_sequence: 0,
                last_sequence: 0,
            },
        )
        .unwrap();
        store.save_root(&root).await.unwrap();
        let services = ServiceSet::single(notary.clone() as Arc<dyn TimestampService>);
        let anchor = AnchorClient::new(
            services,
            store.clone(),
            store.clone(),
            Arc::new(MemoryAlertSink::new()),
            AnchorPolicy::default(),
        );
        anchor.anchor(&root).await.unwrap()
    }

    fn upgrader(store: &Arc<MemoryStore>, notary: &Arc<LocalNotary>) -> ProofUpgrader {
        ProofUpgrader::new(
            ServiceSet::single(notary.clone() as Arc<dyn TimestampService>),
            store.clone(),
            Arc::new(MemoryAlertSink::new()),
            Duration::from_secs(2),
        )
    }

    #[tokio::test]
    async fn test_unconfirmed_proof_stays_pending() {
        let store = Arc::new(MemoryStore::new());
        let notary = Arc::new(LocalNotary::new("notary", SECRET));
        let proof = anchored(&store, &notary).await;

        let report = upgrader(&store, &notary).upgrade_all().await.unwrap();
        assert_eq!(report.checked, 1);
        assert_eq!(report.unchanged, 1);
        let stored = store.get_proof(&proof.proof_id).await.unwrap().unwrap();
        assert_eq!(stored.status, ProofStatus::Pending);
    }

    #[tokio::test]
    async fn test_confirmation_verifies_proof() {
        let store = Arc::new(MemoryStore::new());
        let notary = Arc::new(LocalNotary::new("notary", SECRET));
        let proof = anchored(&store, &notary).await;

        notary.confirm(&decode_hash(&proof.root).unwrap(), 830_000).await;
        let report = upgrader(&store, &notary).upgrade_all().await.unwrap();
        assert_eq!(report.verified, 1);

        let stored = store.get_proof(&proof.proof_id).await.unwrap().unwrap();
        assert_eq!(stored.status, ProofStatus::Verified);
        assert_eq!(stored.block_height, Some(830_000));

        // verified proofs are no longer polled
        let report = upgrader(&store, &notary).upgrade_all().await.unwrap();
        assert_eq!(report.checked, 0);
    }

    #[tokio::test]
    async fn test_higher_target_stops_at_upgraded() {
        let store = Arc::new(MemoryStore::new());
        let notary = Arc::new(LocalNotary::new("notary", SECRET));
        let mut proof = anchored(&store, &notary).await;
        proof.confirmation_target = 2;
        store.save_proof(&proof).await.unwrap();

        notary.confirm(&decode_hash(&proof.root).unwrap(), 830_001).await;
        let updated = upgrader(&store, &notary).upgrade_proof(proof).await.unwrap();
        assert_eq!(updated.status, ProofStatus::Upgraded);
        assert_eq!(updated.block_height, None);
    }

    #[tokio::test]
    async fn test_foreign_artifact_fails_proof() {
        let store = Arc::new(MemoryStore::new());
        let notary = Arc::new(LocalNotary::new("notary", SECRET));
        let proof = anchored(&store, &notary).await;

        let impostor = Arc::new(LocalNotary::new("notary", "a-different-secret-xx"));
        let updated = upgrader(&store, &impostor).upgrade_proof(proof).await.unwrap();
        assert_eq!(updated.status, ProofStatus::Failed);
        assert!(updated.last_error.is_some());
    }
}
