//! Anchor Proofs
//!
//! The persisted artifact that ties a batch's Merkle root to one or more
//! external timestamping services, plus its monotonic status machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::audit::merkle::MerkleRoot;
use crate::error::{LedgerError, LedgerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProofStatus {
    Pending,
    Upgraded,
    Verified,
    Failed,
}

impl ProofStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Upgraded => "upgraded",
            Self::Verified => "verified",
            Self::Failed => "failed",
        }
    }

    /// `pending -> upgraded -> verified`; `failed` only before verification.
    /// Verified and failed proofs never move again.
    pub fn can_transition_to(&self, next: ProofStatus) -> bool {
        use ProofStatus::*;
        match (self, next) {
            (a, b) if *a == b => true,
            (Pending, Upgraded | Verified | Failed) => true,
            (Upgraded, Verified | Failed) => true,
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Verified | Self::Failed)
    }
}

impl fmt::Display for ProofStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProofStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "upgraded" => Ok(Self::Upgraded),
            "verified" => Ok(Self::Verified),
            "failed" => Ok(Self::Failed),
            other => Err(LedgerError::SerializationError(format!(
                "Unknown proof status '{}'",
                other
            ))),
        }
    }
}

mod blob_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// One service's artifact for a digest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStamp {
    pub service: String,
    #[serde(with = "blob_base64")]
    pub artifact: Vec<u8>,
}

/// Contents of `proof_blob`: the digest and every service's artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofEnvelope {
    pub digest: String,
    pub stamps: Vec<ServiceStamp>,
}

impl ProofEnvelope {
    pub fn to_bytes(&self) -> LedgerResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> LedgerResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| LedgerError::ProofInvalid(format!("Unreadable proof envelope: {}", e)))
    }
}

/// External timestamp artifact for one Merkle root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorProof {
    pub proof_id: String,
    pub merkle_root_ref: String,
    pub root: String,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(with = "blob_base64")]
    pub proof_blob: Vec<u8>,
    pub status: ProofStatus,
    pub confirmation_target: u32,
    pub block_height: Option<u64>,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl AnchorProof {
    pub fn pending(
        root: &MerkleRoot,
        envelope: &ProofEnvelope,
        attempts: u32,
        confirmation_target: u32,
    ) -> LedgerResult<Self> {
        let now = Utc::now();
        Ok(Self {
            proof_id: Uuid::new_v4().to_string(),
            merkle_root_ref: root.batch_id.clone(),
            root: root.root.clone(),
            submitted_at: now,
            updated_at: now,
            proof_blob: envelope.to_bytes()?,
            status: ProofStatus::Pending,
            confirmation_target,
            block_height: None,
            attempts,
            last_error: None,
        })
    }

    pub fn failed(root: &MerkleRoot, attempts: u32, confirmation_target: u32, reason: String) -> Self {
        let now = Utc::now();
        Self {
            proof_id: Uuid::new_v4().to_string(),
            merkle_root_ref: root.batch_id.clone(),
            root: root.root.clone(),
            submitted_at: now,
            updated_at: now,
            proof_blob: Vec::new(),
            status: ProofStatus::Failed,
            confirmation_target,
            block_height: None,
            attempts,
            last_error: Some(reason),
        }
    }

    pub fn envelope(&self) -> LedgerResult<ProofEnvelope> {
        ProofEnvelope::from_bytes(&self.proof_blob)
    }

    /// Move to `next`, refusing any regression
    pub fn transition(&mut self, next: ProofStatus) -> LedgerResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(LedgerError::IntegrityViolation(format!(
                "Proof {} cannot move from {} to {}",
                self.proof_id, self.status, next
            )));
        }
        if self.status != next {
            self.status = next;
            self.updated_at = Utc::now();
        }
        Ok(())
    }

    pub fn summary(&self) -> String {
        format!(
            "Proof {} for batch {}: {} ({} attempt(s){})",
            self.proof_id,
            self.merkle_root_ref,
            self.status,
            self.attempts,
            self.block_height
                .map(|h| format!(", block {}", h))
                .unwrap_or_default()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::event::sha256_tagged;
    use crate::audit::merkle::BatchRange;

    fn root() -> MerkleRoot {
        MerkleRoot::new(
            "main",
            vec![sha256_tagged(b"a"), sha256_tagged(b"b")],
            BatchRange {
                first_event_id: "a".into(),
                last_event_id: "b".into(),
                first_sequence: 0,
                last_sequence: 1,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_status_is_monotonic() {
        use ProofStatus::*;
        assert!(Pending.can_transition_to(Upgraded));
        assert!(Upgraded.can_transition_to(Verified));
        assert!(Pending.can_transition_to(Failed));
        assert!(!Verified.can_transition_to(Upgraded));
        assert!(!Verified.can_transition_to(Failed));
        assert!(!Upgraded.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Pending));
        assert!(Verified.is_terminal());
    }

    #[test]
    fn test_transition_refuses_regression() {
        let envelope = ProofEnvelope {
            digest: root().root,
            stamps: vec![],
        };
        let mut proof = AnchorProof::pending(&root(), &envelope, 1, 6).unwrap();
        proof.transition(ProofStatus::Verified).unwrap();
        assert!(proof.transition(ProofStatus::Pending).is_err());
        assert_eq!(proof.status, ProofStatus::Verified);
    }

    #[test]
    fn test_proof_exports_blob_as_base64() {
        let envelope = ProofEnvelope {
            digest: root().root,
            stamps: vec![ServiceStamp {
                service: "notary".into(),
                artifact: vec![0, 159, 255],
            }],
        };
        let proof = AnchorProof::pending(&root(), &envelope, 1, 6).unwrap();
        let json = serde_json::to_value(&proof).unwrap();
        assert!(json["proof_blob"].is_string());
        assert_eq!(json["status"], "pending");

        let restored: AnchorProof = serde_json::from_value(json).unwrap();
        assert_eq!(restored.envelope().unwrap(), envelope);
    }
}
