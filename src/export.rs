//! Ledger Export
//!
//! Line-delimited JSON: one flat object per line, tagged by `kind`. Events
//! use their field-stable export form so hashes can be recomputed offline.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::audit::event::{AuditEvent, GENESIS_HASH};
use crate::audit::merkle::{merkle_root, MerkleRoot};
use crate::audit::verify::{first_missing, verify_chain, ChainReport};
use crate::database::{BatchStore, CorruptEntry, EventStore, ProofStore, StoredEntry, Tombstone};
use crate::error::{LedgerError, LedgerResult};
use crate::ots::proof::AnchorProof;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ExportLine {
    Event(AuditEvent),
    Tombstone(Tombstone),
    Corrupt(CorruptEntry),
    Batch(MerkleRoot),
    Proof(AnchorProof),
}

impl From<StoredEntry> for ExportLine {
    fn from(entry: StoredEntry) -> Self {
        match entry {
            StoredEntry::Event(event) => ExportLine::Event(event),
            StoredEntry::Tombstone(tombstone) => ExportLine::Tombstone(tombstone),
            StoredEntry::Corrupt(corrupt) => ExportLine::Corrupt(corrupt),
        }
    }
}

/// Everything read back from an export file
#[derive(Debug, Clone, Default)]
pub struct LedgerExport {
    pub entries: Vec<StoredEntry>,
    pub batches: Vec<MerkleRoot>,
    pub proofs: Vec<AnchorProof>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportSummary {
    pub events: usize,
    pub tombstones: usize,
    pub corrupt: usize,
    pub batches: usize,
    pub proofs: usize,
}

fn write_line<W: Write>(writer: &mut W, line: &ExportLine) -> LedgerResult<()> {
    serde_json::to_writer(&mut *writer, line)?;
    writer
        .write_all(b"\n")
        .map_err(|e| LedgerError::SerializationError(format!("Failed to write export: {}", e)))
}

/// Write a chain, its batches and their proofs to `writer`
pub async fn export_chain<W: Write>(
    events: &dyn EventStore,
    batches: &dyn BatchStore,
    proofs: &dyn ProofStore,
    chain_id: &str,
    writer: &mut W,
) -> LedgerResult<ExportSummary> {
    let mut summary = ExportSummary::default();

    if let Some(head) = events.head(chain_id).await? {
        for entry in events.range(chain_id, 0, head.sequence).await? {
            match &entry {
                StoredEntry::Event(_) => summary.events += 1,
                StoredEntry::Tombstone(_) => summary.tombstones += 1,
                StoredEntry::Corrupt(c) => {
                    warn!("Exporting corrupt record {} (#{})", c.event_id, c.sequence);
                    summary.corrupt += 1;
                }
            }
            write_line(writer, &ExportLine::from(entry))?;
        }
    }

    for root in batches.list_roots(chain_id).await? {
        for proof in proofs.proofs_for_root(&root.batch_id).await? {
            summary.proofs += 1;
            write_line(writer, &ExportLine::Proof(proof))?;
        }
        summary.batches += 1;
        write_line(writer, &ExportLine::Batch(root))?;
    }

    writer
        .flush()
        .map_err(|e| LedgerError::SerializationError(format!("Failed to flush export: {}", e)))?;
    info!(
        "Exported chain {}: {} events, {} tombstones, {} corrupt, {} batches, {} proofs",
        chain_id, summary.events, summary.tombstones, summary.corrupt, summary.batches, summary.proofs
    );
    Ok(summary)
}

/// Read an export file back
pub fn load_export(path: &Path) -> LedgerResult<LedgerExport> {
    let file = File::open(path).map_err(|e| {
        LedgerError::NotFound(format!("Failed to open export {}: {}", path.display(), e))
    })?;

    let mut export = LedgerExport::default();
    for (line_num, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| {
            LedgerError::SerializationError(format!("Failed to read line {}: {}", line_num + 1, e))
        })?;
        if line.trim().is_empty() {
            continue;
        }

        let parsed: ExportLine = serde_json::from_str(&line).map_err(|e| {
            LedgerError::SerializationError(format!("Failed to parse line {}: {}", line_num + 1, e))
        })?;
        match parsed {
            ExportLine::Event(event) => export.entries.push(StoredEntry::Event(event)),
            ExportLine::Tombstone(t) => export.entries.push(StoredEntry::Tombstone(t)),
            ExportLine::Corrupt(c) => export.entries.push(StoredEntry::Corrupt(c)),
            ExportLine::Batch(root) => export.batches.push(root),
            ExportLine::Proof(proof) => export.proofs.push(proof),
        }
    }

    export.entries.sort_by_key(StoredEntry::sequence);
    debug!("Loaded {} entries from {}", export.entries.len(), path.display());
    Ok(export)
}

/// Offline integrity check of an export
#[derive(Debug, Clone)]
pub struct ExportReport {
    pub chain: ChainReport,
    /// Batches whose root or leaves disagree with the exported events, or
    /// that cover positions missing from the export
    pub bad_batches: Vec<String>,
    /// Root over every exported entry hash, in order
    pub merkle_root: Option<String>,
    pub expected_root_found: Option<bool>,
}

impl ExportReport {
    pub fn is_valid(&self) -> bool {
        self.chain.is_valid() && self.bad_batches.is_empty() && self.expected_root_found != Some(false)
    }
}

impl LedgerExport {
    /// Walk the exported chain, recheck every batch against it and look
    /// for `expected_root` among the batch roots or the whole-export root.
    pub fn verify(&self, expected_root: Option<&str>) -> LedgerResult<ExportReport> {
        let starts_at_genesis = self.entries.first().map(|e| e.sequence() == 0).unwrap_or(false);
        let chain = verify_chain(
            &self.entries,
            starts_at_genesis.then_some(GENESIS_HASH),
        );

        let bad_batches = self
            .batches
            .iter()
            .filter(|root| {
                !root.is_consistent()
                    || first_missing(root, &self.entries).is_some()
                    || self.entries.iter().any(|entry| {
                        root.chain_id == entry.chain_id()
                            && root
                                .leaf_index(entry.sequence())
                                .and_then(|i| root.leaves.get(i))
                                .map(|leaf| leaf != entry.hash())
                                .unwrap_or(false)
                    })
            })
            .map(|root| root.batch_id.clone())
            .collect();

        let hashes: Vec<String> = self.entries.iter().map(|e| e.hash().to_string()).collect();
        let merkle_root = if hashes.is_empty() {
            None
        } else {
            Some(merkle_root(&hashes)?)
        };

        let expected_root_found = expected_root.map(|expected| {
            merkle_root.as_deref() == Some(expected) || self.batches.iter().any(|b| b.root == expected)
        });

        Ok(ExportReport {
            chain,
            bad_batches,
            merkle_root,
            expected_root_found,
        })
    }
}
