//! Audit Ledger Core
//!
//! Tamper-evident event chains, Merkle batching, verification and
//! retention.

pub mod aggregator;
pub mod event;
pub mod merkle;
pub mod recorder;
pub mod retention;
pub mod verify;

pub use aggregator::BatchAggregator;
pub use event::{Actor, AuditEvent, Category, EventDraft, EventRecord, Outcome, Severity, Target};
pub use merkle::{merkle_root, verify_inclusion, BatchRange, InclusionProof, MerkleRoot};
pub use recorder::EventRecorder;
pub use retention::{RetentionManager, RetentionPolicy, StorageClass};
pub use verify::{verify_chain, ChainReport, VerificationOutcome, Verifier};
