//! SQLite store
//!
//! Durable store on `sqlx`. The append compare-and-swap runs inside a
//! transaction and the `UNIQUE (chain_id, sequence)` constraint rejects a
//! competing writer from another process.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info, warn};

use super::{BatchStore, ChainHead, CorruptEntry, EventStore, ProofStore, StoredEntry, Tombstone};
use crate::audit::event::{
    canonical_timestamp, parse_timestamp, AuditEvent, Category, EventRecord, GENESIS_HASH,
};
use crate::audit::merkle::{BatchRange, MerkleRoot};
use crate::error::{LedgerError, LedgerResult};
use crate::ots::proof::{AnchorProof, ProofStatus};

pub const LEDGER_SCHEMA: &str = include_str!("../../migrations/001_ledger.sql");

fn to_i64(value: u64) -> LedgerResult<i64> {
    i64::try_from(value)
        .map_err(|_| LedgerError::DatabaseError(format!("Value {} exceeds SQLite integer range", value)))
}

fn to_u64(value: i64) -> LedgerResult<u64> {
    u64::try_from(value)
        .map_err(|_| LedgerError::DatabaseError(format!("Negative value {} in unsigned column", value)))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect to a SQLite database URL, creating the file if needed
    pub async fn connect(database_url: &str) -> LedgerResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.run_migrations().await?;
        info!("Connected to ledger database {}", database_url);
        Ok(store)
    }

    /// Private in-memory database; one connection so every query sees it
    pub async fn in_memory() -> LedgerResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    pub async fn run_migrations(&self) -> LedgerResult<()> {
        sqlx::raw_sql(LEDGER_SCHEMA).execute(&self.pool).await?;
        debug!("Ledger schema applied");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn try_append(&self, event: &AuditEvent) -> LedgerResult<()> {
        let mut tx = self.pool.begin().await?;

        let head = sqlx::query(
            "SELECT sequence, hash FROM audit_events WHERE chain_id = ? ORDER BY sequence DESC LIMIT 1",
        )
        .bind(&event.chain_id)
        .fetch_optional(&mut *tx)
        .await?;

        let (expected_sequence, expected_hash) = match head {
            Some(row) => (
                to_u64(row.try_get("sequence")?)? + 1,
                row.try_get::<String, _>("hash")?,
            ),
            None => (0, GENESIS_HASH.to_string()),
        };

        if event.sequence != expected_sequence || event.previous_hash != expected_hash {
            return Err(LedgerError::PersistenceFailure(format!(
                "Chain head moved: expected sequence {} after {}, got {} after {}",
                expected_sequence, expected_hash, event.sequence, event.previous_hash
            )));
        }

        let body = serde_json::to_string(&EventRecord::from(event.clone()))?;
        sqlx::query(
            r#"
            INSERT INTO audit_events
            (id, chain_id, sequence, category, timestamp, previous_hash, hash, body)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.id)
        .bind(&event.chain_id)
        .bind(to_i64(event.sequence)?)
        .bind(event.category.as_str())
        .bind(canonical_timestamp(&event.timestamp))
        .bind(&event.previous_hash)
        .bind(&event.hash)
        .bind(body)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                LedgerError::PersistenceFailure(format!(
                    "Concurrent writer claimed sequence {} on chain {}",
                    event.sequence, event.chain_id
                ))
            } else {
                LedgerError::from(e)
            }
        })?;

        tx.commit().await?;
        Ok(())
    }

    /// Decode an event row. A row whose body or columns do not decode, or
    /// disagree with each other, comes back as `StoredEntry::Corrupt` so the
    /// verifier can name the position instead of failing the whole read.
    fn entry_from_row(row: &SqliteRow) -> LedgerResult<StoredEntry> {
        match Self::decode_entry(row) {
            Ok(entry) => Ok(entry),
            Err(e) => {
                let corrupt = Self::corrupt_from_row(row, e.to_string())?;
                warn!(
                    "Undecodable event row {} ({} #{}): {}",
                    corrupt.event_id, corrupt.chain_id, corrupt.sequence, corrupt.error
                );
                Ok(StoredEntry::Corrupt(corrupt))
            }
        }
    }

    fn decode_entry(row: &SqliteRow) -> LedgerResult<StoredEntry> {
        let body: Option<String> = row.try_get("body")?;
        let purged_at: Option<String> = row.try_get("purged_at")?;

        match (body, purged_at) {
            (Some(body), None) => {
                let record: EventRecord = serde_json::from_str(&body)?;
                let event = AuditEvent::try_from(record)?;
                // indexed columns must agree with the body they were written from
                let id: String = row.try_get("id")?;
                let chain_id: String = row.try_get("chain_id")?;
                let sequence = to_u64(row.try_get("sequence")?)?;
                let hash: String = row.try_get("hash")?;
                let previous_hash: String = row.try_get("previous_hash")?;
                if event.id != id
                    || event.chain_id != chain_id
                    || event.sequence != sequence
                    || event.hash != hash
                    || event.previous_hash != previous_hash
                {
                    return Err(LedgerError::IntegrityViolation(format!(
                        "Stored columns disagree with body of event {}",
                        id
                    )));
                }
                Ok(StoredEntry::Event(event))
            }
            (_, Some(purged_at)) => {
                let category: String = row.try_get("category")?;
                let timestamp: String = row.try_get("timestamp")?;
                Ok(StoredEntry::Tombstone(Tombstone {
                    event_id: row.try_get("id")?,
                    chain_id: row.try_get("chain_id")?,
                    sequence: to_u64(row.try_get("sequence")?)?,
                    category: Category::from_str(&category)?,
                    timestamp: parse_timestamp(&timestamp)?,
                    previous_hash: row.try_get("previous_hash")?,
                    hash: row.try_get("hash")?,
                    purged_at: parse_timestamp(&purged_at)?,
                }))
            }
            (None, None) => Err(LedgerError::IntegrityViolation(
                "row has neither body nor tombstone".to_string(),
            )),
        }
    }

    /// Whatever the indexed columns still say about an undecodable row
    fn corrupt_from_row(row: &SqliteRow, error: String) -> LedgerResult<CorruptEntry> {
        let timestamp: String = row.try_get("timestamp")?;
        Ok(CorruptEntry {
            event_id: row.try_get("id")?,
            chain_id: row.try_get("chain_id")?,
            sequence: to_u64(row.try_get("sequence")?)?,
            previous_hash: row.try_get("previous_hash")?,
            hash: row.try_get("hash")?,
            timestamp: parse_timestamp(&timestamp).unwrap_or(DateTime::<Utc>::MIN_UTC),
            error,
        })
    }

    fn root_from_row(row: &SqliteRow) -> LedgerResult<MerkleRoot> {
        let leaves: String = row.try_get("leaves")?;
        let created_at: String = row.try_get("created_at")?;
        Ok(MerkleRoot {
            batch_id: row.try_get("batch_id")?,
            chain_id: row.try_get("chain_id")?,
            root: row.try_get("root")?,
            entry_count: to_u64(row.try_get("entry_count")?)? as usize,
            leaves: serde_json::from_str(&leaves)?,
            created_at: parse_timestamp(&created_at)?,
            batch_range: BatchRange {
                first_event_id: row.try_get("first_event_id")?,
                last_event_id: row.try_get("last_event_id")?,
                first_sequence: to_u64(row.try_get("first_sequence")?)?,
                last_sequence: to_u64(row.try_get("last_sequence")?)?,
            },
        })
    }

    fn proof_from_row(row: &SqliteRow) -> LedgerResult<AnchorProof> {
        let status: String = row.try_get("status")?;
        let submitted_at: String = row.try_get("submitted_at")?;
        let updated_at: String = row.try_get("updated_at")?;
        let block_height: Option<i64> = row.try_get("block_height")?;
        Ok(AnchorProof {
            proof_id: row.try_get("proof_id")?,
            merkle_root_ref: row.try_get("batch_id")?,
            root: row.try_get("root")?,
            submitted_at: parse_timestamp(&submitted_at)?,
            updated_at: parse_timestamp(&updated_at)?,
            proof_blob: row.try_get("proof_blob")?,
            status: ProofStatus::from_str(&status)?,
            confirmation_target: to_u64(row.try_get("confirmation_target")?)? as u32,
            block_height: block_height.map(to_u64).transpose()?,
            attempts: to_u64(row.try_get("attempts")?)? as u32,
            last_error: row.try_get("last_error")?,
        })
    }
}

const EVENT_COLUMNS: &str =
    "id, chain_id, sequence, category, timestamp, previous_hash, hash, body, purged_at";

#[async_trait]
impl EventStore for SqliteStore {
    async fn append(&self, event: &AuditEvent) -> LedgerResult<()> {
        self.try_append(event).await.map_err(|e| match e {
            LedgerError::PersistenceFailure(_) => e,
            other => LedgerError::PersistenceFailure(other.to_string()),
        })
    }

    async fn head(&self, chain_id: &str) -> LedgerResult<Option<ChainHead>> {
        let row = sqlx::query(
            "SELECT sequence, hash, timestamp FROM audit_events WHERE chain_id = ? ORDER BY sequence DESC LIMIT 1",
        )
        .bind(chain_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let timestamp: String = row.try_get("timestamp")?;
            Ok(ChainHead {
                sequence: to_u64(row.try_get("sequence")?)?,
                hash: row.try_get("hash")?,
                timestamp: parse_timestamp(&timestamp)?,
            })
        })
        .transpose()
    }

    async fn get(&self, event_id: &str) -> LedgerResult<Option<StoredEntry>> {
        let row = sqlx::query(&format!("SELECT {} FROM audit_events WHERE id = ?", EVENT_COLUMNS))
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::entry_from_row).transpose()
    }

    async fn range(&self, chain_id: &str, first: u64, last: u64) -> LedgerResult<Vec<StoredEntry>> {
        if first > last {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            "SELECT {} FROM audit_events WHERE chain_id = ? AND sequence BETWEEN ? AND ? ORDER BY sequence",
            EVENT_COLUMNS
        ))
        .bind(chain_id)
        .bind(to_i64(first)?)
        .bind(to_i64(last)?)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::entry_from_row).collect()
    }

    async fn purge(&self, event_id: &str, purged_at: DateTime<Utc>) -> LedgerResult<Tombstone> {
        let entry = self
            .get(event_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("event {}", event_id)))?;
        let event = match entry {
            StoredEntry::Event(event) => event,
            StoredEntry::Tombstone(t) => {
                return Err(LedgerError::NotFound(format!(
                    "event {} was already purged at {}",
                    event_id, t.purged_at
                )))
            }
            StoredEntry::Corrupt(c) => {
                return Err(LedgerError::IntegrityViolation(format!(
                    "event {} cannot be purged, its record is corrupt: {}",
                    event_id, c.error
                )))
            }
        };

        let result = sqlx::query(
            "UPDATE audit_events SET body = NULL, purged_at = ? WHERE id = ? AND purged_at IS NULL",
        )
        .bind(canonical_timestamp(&purged_at))
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() != 1 {
            return Err(LedgerError::NotFound(format!("event {} changed during purge", event_id)));
        }

        Ok(Tombstone::of(&event, purged_at))
    }
}

const ROOT_COLUMNS: &str = "batch_id, chain_id, first_sequence, last_sequence, first_event_id, last_event_id, root, entry_count, leaves, created_at";

#[async_trait]
impl BatchStore for SqliteStore {
    async fn save_root(&self, root: &MerkleRoot) -> LedgerResult<()> {
        let range = &root.batch_range;
        let overlapping: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM merkle_roots WHERE chain_id = ? AND batch_id != ? AND first_sequence <= ? AND ? <= last_sequence",
        )
        .bind(&root.chain_id)
        .bind(&root.batch_id)
        .bind(to_i64(range.last_sequence)?)
        .bind(to_i64(range.first_sequence)?)
        .fetch_one(&self.pool)
        .await?;
        if overlapping > 0 {
            return Err(LedgerError::InvalidRange(format!(
                "Batch {} overlaps an existing batch",
                root.batch_id
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO merkle_roots
            (batch_id, chain_id, first_sequence, last_sequence, first_event_id, last_event_id,
             root, entry_count, leaves, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&root.batch_id)
        .bind(&root.chain_id)
        .bind(to_i64(range.first_sequence)?)
        .bind(to_i64(range.last_sequence)?)
        .bind(&range.first_event_id)
        .bind(&range.last_event_id)
        .bind(&root.root)
        .bind(to_i64(root.entry_count as u64)?)
        .bind(serde_json::to_string(&root.leaves)?)
        .bind(canonical_timestamp(&root.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_root(&self, batch_id: &str) -> LedgerResult<Option<MerkleRoot>> {
        let row = sqlx::query(&format!("SELECT {} FROM merkle_roots WHERE batch_id = ?", ROOT_COLUMNS))
            .bind(batch_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::root_from_row).transpose()
    }

    async fn find_root(&self, chain_id: &str, first: u64, last: u64) -> LedgerResult<Option<MerkleRoot>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM merkle_roots WHERE chain_id = ? AND first_sequence = ? AND last_sequence = ?",
            ROOT_COLUMNS
        ))
        .bind(chain_id)
        .bind(to_i64(first)?)
        .bind(to_i64(last)?)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::root_from_row).transpose()
    }

    async fn root_containing(&self, chain_id: &str, sequence: u64) -> LedgerResult<Option<MerkleRoot>> {
        let sequence = to_i64(sequence)?;
        let row = sqlx::query(&format!(
            "SELECT {} FROM merkle_roots WHERE chain_id = ? AND first_sequence <= ? AND ? <= last_sequence",
            ROOT_COLUMNS
        ))
        .bind(chain_id)
        .bind(sequence)
        .bind(sequence)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::root_from_row).transpose()
    }

    async fn list_roots(&self, chain_id: &str) -> LedgerResult<Vec<MerkleRoot>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM merkle_roots WHERE chain_id = ? ORDER BY first_sequence",
            ROOT_COLUMNS
        ))
        .bind(chain_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::root_from_row).collect()
    }
}

const PROOF_COLUMNS: &str = "proof_id, batch_id, root, submitted_at, updated_at, status, proof_blob, confirmation_target, block_height, attempts, last_error";

#[async_trait]
impl ProofStore for SqliteStore {
    async fn save_proof(&self, proof: &AnchorProof) -> LedgerResult<()> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<String> =
            sqlx::query_scalar("SELECT status FROM anchor_proofs WHERE proof_id = ?")
                .bind(&proof.proof_id)
                .fetch_optional(&mut *tx)
                .await?;
        if let Some(existing) = existing {
            let existing = ProofStatus::from_str(&existing)?;
            if !existing.can_transition_to(proof.status) {
                return Err(LedgerError::IntegrityViolation(format!(
                    "Proof {} cannot regress from {} to {}",
                    proof.proof_id, existing, proof.status
                )));
            }
        }

        sqlx::query(
            r#"
            INSERT INTO anchor_proofs
            (proof_id, batch_id, root, submitted_at, updated_at, status, proof_blob,
             confirmation_target, block_height, attempts, last_error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (proof_id) DO UPDATE SET
                updated_at = excluded.updated_at,
                status = excluded.status,
                proof_blob = excluded.proof_blob,
                block_height = excluded.block_height,
                attempts = excluded.attempts,
                last_error = excluded.last_error
            "#,
        )
        .bind(&proof.proof_id)
        .bind(&proof.merkle_root_ref)
        .bind(&proof.root)
        .bind(canonical_timestamp(&proof.submitted_at))
        .bind(canonical_timestamp(&proof.updated_at))
        .bind(proof.status.as_str())
        .bind(&proof.proof_blob)
        .bind(i64::from(proof.confirmation_target))
        .bind(proof.block_height.map(to_i64).transpose()?)
        .bind(i64::from(proof.attempts))
        .bind(&proof.last_error)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_proof(&self, proof_id: &str) -> LedgerResult<Option<AnchorProof>> {
        let row = sqlx::query(&format!("SELECT {} FROM anchor_proofs WHERE proof_id = ?", PROOF_COLUMNS))
            .bind(proof_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::proof_from_row).transpose()
    }

    async fn proofs_for_root(&self, batch_id: &str) -> LedgerResult<Vec<AnchorProof>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM anchor_proofs WHERE batch_id = ? ORDER BY submitted_at",
            PROOF_COLUMNS
        ))
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::proof_from_row).collect()
    }

    async fn proofs_with_status(&self, statuses: &[ProofStatus]) -> LedgerResult<Vec<AnchorProof>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT {} FROM anchor_proofs WHERE status IN ({}) ORDER BY submitted_at",
            PROOF_COLUMNS, placeholders
        );
        let mut query = sqlx::query(&sql);
        for status in statuses {
            query = query.bind(status.as_str());
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(Self::proof_from_row).collect()
    }
}
