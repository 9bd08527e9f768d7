//! Local Notary
//!
//! Deterministic in-process timestamping service keyed by a secret. Used for
//! air-gapped deployments and tests, where external confirmation is
//! simulated with `confirm` or an auto-confirm delay.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{Attestation, TimestampService, UpgradeOutcome};
use crate::audit::event::{canonical_timestamp, parse_timestamp};
use crate::error::{LedgerError, LedgerResult};

type HmacSha256 = Hmac<Sha256>;

/// Artifact issued by the notary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct NotaryReceipt {
    notary: String,
    digest: String,
    issued_at: String,
    block_height: Option<u64>,
    tag: String,
}

pub struct LocalNotary {
    name: String,
    secret: Vec<u8>,
    /// digest hex -> simulated block height
    confirmations: RwLock<HashMap<String, u64>>,
    auto_confirm: Option<Duration>,
    next_height: AtomicU64,
    failing_submits: AtomicU32,
}

impl LocalNotary {
    pub fn new(name: impl Into<String>, secret: impl AsRef<[u8]>) -> Self {
        Self {
            name: name.into(),
            secret: secret.as_ref().to_vec(),
            confirmations: RwLock::new(HashMap::new()),
            auto_confirm: None,
            next_height: AtomicU64::new(1),
            failing_submits: AtomicU32::new(0),
        }
    }

    /// Treat receipts older than `delay` as confirmed on the next upgrade
    pub fn with_auto_confirm(mut self, delay: Duration) -> Self {
        self.auto_confirm = Some(delay);
        self
    }

    /// Simulate the external ledger committing `digest` at `block_height`
    pub async fn confirm(&self, digest: &[u8; 32], block_height: u64) {
        info!("Notary {} confirms {} at block {}", self.name, hex::encode(digest), block_height);
        self.confirmations
            .write()
            .await
            .insert(hex::encode(digest), block_height);
        self.next_height.fetch_max(block_height + 1, Ordering::SeqCst);
    }

    /// Reject the next `count` submissions as if the service were down
    pub fn fail_next(&self, count: u32) {
        self.failing_submits.store(count, Ordering::SeqCst);
    }

    fn take_failure(&self) -> bool {
        self.failing_submits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Keyed MAC over the receipt fields, each one length-prefixed
    fn mac(&self, digest_hex: &str, issued_at: &str, block_height: Option<u64>) -> LedgerResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| LedgerError::ServiceError(format!("notary key rejected: {}", e)))?;
        for field in [self.name.as_bytes(), digest_hex.as_bytes(), issued_at.as_bytes()] {
            mac.update(&(field.len() as u64).to_be_bytes());
            mac.update(field);
        }
        match block_height {
            Some(height) => {
                mac.update(&[1]);
                mac.update(&height.to_be_bytes());
            }
            None => mac.update(&[0]),
        }
        Ok(mac)
    }

    fn tag(&self, digest_hex: &str, issued_at: &str, block_height: Option<u64>) -> LedgerResult<String> {
        let mac = self.mac(digest_hex, issued_at, block_height)?;
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn issue(
        &self,
        digest_hex: String,
        issued_at: String,
        block_height: Option<u64>,
    ) -> LedgerResult<NotaryReceipt> {
        let tag = self.tag(&digest_hex, &issued_at, block_height)?;
        Ok(NotaryReceipt {
            notary: self.name.clone(),
            digest: digest_hex,
            issued_at,
            block_height,
            tag,
        })
    }

    fn read_receipt(&self, digest: &[u8; 32], artifact: &[u8]) -> Result<NotaryReceipt, String> {
        let receipt: NotaryReceipt =
            serde_json::from_slice(artifact).map_err(|e| format!("unreadable receipt: {}", e))?;
        if receipt.notary != self.name {
            return Err(format!("receipt issued by {}, not {}", receipt.notary, self.name));
        }
        if receipt.digest != hex::encode(digest) {
            return Err("receipt attests a different digest".to_string());
        }
        let tag = hex::decode(&receipt.tag).map_err(|_| "receipt tag is not hex".to_string())?;
        self.mac(&receipt.digest, &receipt.issued_at, receipt.block_height)
            .map_err(|e| e.to_string())?
            .verify_slice(&tag)
            .map_err(|_| "receipt tag does not match".to_string())?;
        Ok(receipt)
    }

    fn encode(receipt: &NotaryReceipt) -> LedgerResult<Vec<u8>> {
        Ok(serde_json::to_vec(receipt)?)
    }
}

#[async_trait]
impl TimestampService for LocalNotary {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(&self, digest: &[u8; 32]) -> LedgerResult<Vec<u8>> {
        if self.take_failure() {
            return Err(LedgerError::ServiceError(format!(
                "Notary {} unavailable",
                self.name
            )));
        }
        let receipt = self.issue(hex::encode(digest), canonical_timestamp(&Utc::now()), None)?;
        debug!("Notary {} issued receipt for {}", self.name, receipt.digest);
        Self::encode(&receipt)
    }

    async fn upgrade(&self, digest: &[u8; 32], artifact: &[u8]) -> LedgerResult<UpgradeOutcome> {
        let receipt = self
            .read_receipt(digest, artifact)
            .map_err(LedgerError::ProofInvalid)?;
        if receipt.block_height.is_some() {
            return Ok(UpgradeOutcome::Unchanged);
        }

        let recorded = self.confirmations.read().await.get(&receipt.digest).copied();
        let height = match (recorded, self.auto_confirm) {
            (Some(height), _) => height,
            (None, Some(delay)) => {
                let issued: DateTime<Utc> = parse_timestamp(&receipt.issued_at)?;
                let age = Utc::now().signed_duration_since(issued);
                if age.to_std().map(|age| age < delay).unwrap_or(true) {
                    return Ok(UpgradeOutcome::Unchanged);
                }
                let height = self.next_height.fetch_add(1, Ordering::SeqCst);
                self.confirmations
                    .write()
                    .await
                    .insert(receipt.digest.clone(), height);
                height
            }
            (None, None) => return Ok(UpgradeOutcome::Unchanged),
        };

        let upgraded = self.issue(receipt.digest, receipt.issued_at, Some(height))?;
        Ok(UpgradeOutcome::Upgraded(Self::encode(&upgraded)?))
    }

    async fn verify(&self, digest: &[u8; 32], artifact: &[u8]) -> LedgerResult<Attestation> {
        Ok(match self.read_receipt(digest, artifact) {
            Ok(NotaryReceipt {
                block_height: Some(block_height),
                ..
            }) => Attestation::Confirmed { block_height },
            Ok(_) => Attestation::Pending,
            Err(reason) => Attestation::Invalid(reason),
        })
    }
}
