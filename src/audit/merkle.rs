//! Merkle Tree for Audit Batches
//!
//! Builds a binary Merkle tree over the event hashes of a contiguous batch.
//! Leaves and internal nodes are hashed under distinct prefixes so a node
//! from one level can never be replayed as a node of another:
//!
//!   leaf     = SHA256(0x00 || event_hash)
//!   internal = SHA256(0x01 || left || right)
//!
//! A level with an odd number of nodes pairs its last node with itself.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use crate::audit::event::{decode_hash, encode_hash};
use crate::error::{LedgerError, LedgerResult};

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

fn hash_leaf(leaf: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(leaf);
    hasher.finalize().into()
}

fn hash_node(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([NODE_PREFIX]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

fn leaf_level(leaves: &[String]) -> LedgerResult<Vec<[u8; 32]>> {
    if leaves.is_empty() {
        return Err(LedgerError::InvalidRange(
            "Cannot build Merkle tree from empty leaves".to_string(),
        ));
    }
    leaves
        .iter()
        .map(|leaf| decode_hash(leaf).map(|raw| hash_leaf(&raw)))
        .collect()
}

fn next_level(level: &[[u8; 32]]) -> Vec<[u8; 32]> {
    level
        .chunks(2)
        .map(|pair| match pair {
            [left, right] => hash_node(left, right),
            [single] => hash_node(single, single),
            _ => unreachable!("chunks(2) yields one or two nodes"),
        })
        .collect()
}

/// Compute the Merkle root over ordered leaf hashes
pub fn merkle_root(leaves: &[String]) -> LedgerResult<String> {
    let mut level = leaf_level(leaves)?;
    while level.len() > 1 {
        level = next_level(&level);
    }
    Ok(encode_hash(&level[0]))
}

/// Which side the sibling sits on when folding a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathStep {
    pub sibling: String,
    pub side: Side,
}

/// Inclusion proof for one leaf
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InclusionProof {
    pub leaf_hash: String,
    pub leaf_index: usize,
    pub path: Vec<PathStep>,
    pub root_hash: String,
}

impl InclusionProof {
    pub fn verify(&self) -> bool {
        verify_inclusion(&self.leaf_hash, &self.path, &self.root_hash)
    }

    pub fn size(&self) -> usize {
        self.path.len()
    }

    pub fn summary(&self) -> String {
        format!(
            "Inclusion proof for leaf {}: {} hashes, root: {}",
            self.leaf_index,
            self.path.len(),
            self.root_hash
        )
    }
}

/// Build the sibling path from leaf `index` up to the root
pub fn merkle_path(leaves: &[String], index: usize) -> LedgerResult<InclusionProof> {
    if index >= leaves.len() {
        return Err(LedgerError::InvalidRange(format!(
            "Leaf index {} out of range for {} leaves",
            index,
            leaves.len()
        )));
    }

    let mut level = leaf_level(leaves)?;
    let mut position = index;
    let mut path = Vec::new();

    while level.len() > 1 {
        let (sibling, side) = if position % 2 == 0 {
            // odd tail pairs with itself
            let sibling = level.get(position + 1).unwrap_or(&level[position]);
            (*sibling, Side::Right)
        } else {
            (level[position - 1], Side::Left)
        };
        path.push(PathStep {
            sibling: encode_hash(&sibling),
            side,
        });
        level = next_level(&level);
        position /= 2;
    }

    Ok(InclusionProof {
        leaf_hash: leaves[index].clone(),
        leaf_index: index,
        path,
        root_hash: encode_hash(&level[0]),
    })
}

/// Fold an inclusion path and compare against the claimed root
pub fn verify_inclusion(leaf_hash: &str, path: &[PathStep], root_hash: &str) -> bool {
    let Ok(leaf) = decode_hash(leaf_hash) else {
        return false;
    };
    let mut current = hash_leaf(&leaf);

    for step in path {
        let Ok(sibling) = decode_hash(&step.sibling) else {
            return false;
        };
        current = match step.side {
            Side::Left => hash_node(&sibling, &current),
            Side::Right => hash_node(&current, &sibling),
        };
    }

    encode_hash(&current) == root_hash
}

/// First/last event of a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRange {
    pub first_event_id: String,
    pub last_event_id: String,
    pub first_sequence: u64,
    pub last_sequence: u64,
}

impl BatchRange {
    pub fn contains(&self, sequence: u64) -> bool {
        (self.first_sequence..=self.last_sequence).contains(&sequence)
    }

    pub fn overlaps(&self, first: u64, last: u64) -> bool {
        self.first_sequence <= last && first <= self.last_sequence
    }
}

/// Summary of a contiguous batch of committed events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleRoot {
    pub batch_id: String,
    pub chain_id: String,
    pub root: String,
    pub entry_count: usize,
    pub leaves: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub batch_range: BatchRange,
}

impl MerkleRoot {
    pub fn new(chain_id: &str, leaves: Vec<String>, batch_range: BatchRange) -> LedgerResult<Self> {
        if batch_range.last_sequence < batch_range.first_sequence {
            return Err(LedgerError::InvalidRange(format!(
                "Batch range {}..={} is inverted",
                batch_range.first_sequence, batch_range.last_sequence
            )));
        }
        let expected = batch_range.last_sequence - batch_range.first_sequence + 1;
        if leaves.len() as u64 != expected {
            return Err(LedgerError::InvalidRange(format!(
                "Batch range covers {} events but {} leaves were supplied",
                expected,
                leaves.len()
            )));
        }

        let root = merkle_root(&leaves)?;
        debug!("Merkle root for {} leaves: {}", leaves.len(), root);

        Ok(Self {
            batch_id: Uuid::new_v4().to_string(),
            chain_id: chain_id.to_string(),
            root,
            entry_count: leaves.len(),
            leaves,
            created_at: Utc::now().trunc_subsecs(6),
            batch_range,
        })
    }

    /// Recompute the root from the stored leaves
    pub fn recompute(&self) -> LedgerResult<String> {
        merkle_root(&self.leaves)
    }

    pub fn is_consistent(&self) -> bool {
        self.entry_count == self.leaves.len()
            && matches!(self.recompute(), Ok(root) if root == self.root)
    }

    /// Position of a chain sequence inside this batch's leaf list
    pub fn leaf_index(&self, sequence: u64) -> Option<usize> {
        if !self.batch_range.contains(sequence) {
            return None;
        }
        Some((sequence - self.batch_range.first_sequence) as usize)
    }

    pub fn inclusion_proof(&self, sequence: u64) -> LedgerResult<InclusionProof> {
        let index = self.leaf_index(sequence).ok_or_else(|| {
            LedgerError::InvalidRange(format!(
                "Sequence {} outside batch {}",
                sequence, self.batch_id
            ))
        })?;
        merkle_path(&self.leaves, index)
    }

    pub fn summary(&self) -> String {
        format!(
            "Batch {} [{}..={}]: {} entries, root: {}",
            self.batch_id,
            self.batch_range.first_sequence,
            self.batch_range.last_sequence,
            self.entry_count,
            self.root
        )
    }
}
