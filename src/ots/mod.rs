//! Timestamp Anchoring
//!
//! Publishes batch roots to external timestamping services and tracks the
//! resulting proofs until they are confirmed.

pub mod anchor;
pub mod client;
pub mod notary;
pub mod proof;
pub mod timestamp;
pub mod upgrade;

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::LedgerResult;

pub use anchor::{AnchorClient, AnchorPolicy};
pub use client::{BlockExplorer, CalendarClient};
pub use notary::LocalNotary;
pub use proof::{AnchorProof, ProofEnvelope, ProofStatus, ServiceStamp};
pub use upgrade::{ProofUpgrader, UpgradeReport};

/// What a service says about a (digest, artifact) pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attestation {
    /// Accepted but not yet committed to the external ledger
    Pending,
    /// Committed to the external ledger at the given block
    Confirmed { block_height: u64 },
    /// The artifact does not attest this digest
    Invalid(String),
}

impl Attestation {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Attestation::Confirmed { .. })
    }

    pub fn block_height(&self) -> Option<u64> {
        match self {
            Attestation::Confirmed { block_height } => Some(*block_height),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeOutcome {
    Unchanged,
    Upgraded(Vec<u8>),
}

/// An independent, append-only timestamping service
#[async_trait]
pub trait TimestampService: Send + Sync {
    /// Stable name recorded next to each artifact
    fn name(&self) -> &str;

    /// Submit a digest; returns the service's (usually provisional) artifact
    async fn submit(&self, digest: &[u8; 32]) -> LedgerResult<Vec<u8>>;

    /// Ask for a more complete artifact than `artifact`
    async fn upgrade(&self, digest: &[u8; 32], artifact: &[u8]) -> LedgerResult<UpgradeOutcome>;

    /// Check `artifact` against `digest` using the service's own rule
    async fn verify(&self, digest: &[u8; 32], artifact: &[u8]) -> LedgerResult<Attestation>;
}

/// The configured services, looked up by the name stored in each stamp
#[derive(Clone, Default)]
pub struct ServiceSet {
    services: Vec<Arc<dyn TimestampService>>,
}

impl ServiceSet {
    pub fn new(services: Vec<Arc<dyn TimestampService>>) -> Self {
        Self { services }
    }

    pub fn single(service: Arc<dyn TimestampService>) -> Self {
        Self::new(vec![service])
    }

    pub fn find(&self, name: &str) -> Option<&Arc<dyn TimestampService>> {
        self.services.iter().find(|s| s.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn TimestampService>> {
        self.services.iter()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
