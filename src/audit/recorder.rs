//! Event Recorder
//!
//! Single writer for a chain. The head (last committed hash and sequence)
//! lives behind a mutex owned by the recorder, and `record` holds that lock
//! from reading the head until the durable append has returned. Concurrent
//! callers therefore queue, each seeing the head its predecessor committed.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::alert::{dispatch, Alert, AlertSink};
use crate::audit::event::{AuditEvent, EventDraft, GENESIS_HASH};
use crate::database::EventStore;
use crate::error::{LedgerError, LedgerResult};

#[derive(Debug, Clone)]
struct ChainState {
    next_sequence: u64,
    head_hash: String,
    head_timestamp: Option<DateTime<Utc>>,
}

impl ChainState {
    fn genesis() -> Self {
        Self {
            next_sequence: 0,
            head_hash: GENESIS_HASH.to_string(),
            head_timestamp: None,
        }
    }

    fn advance(&mut self, event: &AuditEvent) {
        self.next_sequence = event.sequence + 1;
        self.head_hash = event.hash.clone();
        self.head_timestamp = Some(event.timestamp);
    }
}

/// Default bound on how far an explicit timestamp may trail the clock
pub const DEFAULT_MAX_BACKDATE_SECS: i64 = 300;

pub struct EventRecorder {
    chain_id: String,
    store: Arc<dyn EventStore>,
    state: Mutex<ChainState>,
    intake: RwLock<Option<mpsc::Sender<AuditEvent>>>,
    alerts: Option<Arc<dyn AlertSink>>,
    max_backdate: Duration,
}

impl EventRecorder {
    /// Open the recorder for `chain_id`, restoring the head from the store
    pub async fn open(chain_id: impl Into<String>, store: Arc<dyn EventStore>) -> LedgerResult<Self> {
        let chain_id = chain_id.into();
        let state = Self::load_state(&chain_id, store.as_ref()).await?;
        info!(
            "Opened chain {} at sequence {} (head {})",
            chain_id, state.next_sequence, state.head_hash
        );
        Ok(Self {
            chain_id,
            store,
            state: Mutex::new(state),
            intake: RwLock::new(None),
            alerts: None,
            max_backdate: Duration::seconds(DEFAULT_MAX_BACKDATE_SECS),
        })
    }

    /// Forward committed events to an aggregator's intake from now on.
    /// Events are dropped, not queued, while the intake is full.
    pub async fn attach_intake(&self, intake: mpsc::Sender<AuditEvent>) {
        *self.intake.write().await = Some(intake);
    }

    /// Reject explicit timestamps further than `max_backdate` behind the clock
    pub fn with_max_backdate(mut self, max_backdate: Duration) -> Self {
        self.max_backdate = max_backdate;
        self
    }

    /// Forward high and critical events to the alert channel
    pub fn with_alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    async fn load_state(chain_id: &str, store: &dyn EventStore) -> LedgerResult<ChainState> {
        Ok(match store.head(chain_id).await? {
            Some(head) => ChainState {
                next_sequence: head.sequence + 1,
                head_hash: head.hash,
                head_timestamp: Some(head.timestamp),
            },
            None => ChainState::genesis(),
        })
    }

    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    /// Hash of the last committed event, or the genesis sentinel
    pub async fn head_hash(&self) -> String {
        self.state.lock().await.head_hash.clone()
    }

    /// Number of committed positions in the chain
    pub async fn len(&self) -> u64 {
        self.state.lock().await.next_sequence
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Commit a draft as the new chain head.
    ///
    /// The head only advances after the store acknowledges the append. On
    /// `PersistenceFailure` nothing is linked into the chain and the caller
    /// should retry with a fresh draft.
    pub async fn record(&self, draft: EventDraft) -> LedgerResult<AuditEvent> {
        draft.validate()?;

        let mut state = self.state.lock().await;

        let now = Utc::now();
        let timestamp = match (draft.timestamp, state.head_timestamp) {
            (Some(ts), Some(head)) if ts < head => {
                return Err(LedgerError::InvalidEvent(format!(
                    "timestamp {} precedes chain head {}",
                    ts, head
                )));
            }
            (Some(ts), _)
                if now
                    .checked_sub_signed(self.max_backdate)
                    .map_or(false, |floor| ts < floor) =>
            {
                return Err(LedgerError::InvalidEvent(format!(
                    "timestamp {} is more than {}s behind the recorder clock",
                    ts,
                    self.max_backdate.num_seconds()
                )));
            }
            (Some(ts), _) => ts,
            (None, Some(head)) => now.max(head),
            (None, None) => now,
        };

        let event = AuditEvent::seal(
            draft,
            &self.chain_id,
            state.next_sequence,
            &state.head_hash,
            timestamp,
        )?;

        if let Err(e) = self.store.append(&event).await {
            warn!(
                "Failed to persist event at {} #{}: {}",
                self.chain_id, event.sequence, e
            );
            // another writer may own the store's head; pick it up for the next caller
            match Self::load_state(&self.chain_id, self.store.as_ref()).await {
                Ok(fresh) => *state = fresh,
                Err(reload) => warn!("Could not reload head of {}: {}", self.chain_id, reload),
            }
            return Err(match e {
                LedgerError::PersistenceFailure(_) => e,
                other => LedgerError::PersistenceFailure(other.to_string()),
            });
        }

        state.advance(&event);
        drop(state);

        debug!("Committed {} -> {}", event.summary(), event.hash);

        if let Some(intake) = self.intake.read().await.as_ref() {
            match intake.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    debug!("Aggregator intake full; event {} left to the next sweep", event.id)
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Aggregator intake closed; event {} not forwarded", event.id)
                }
            }
        }

        if event.severity.is_alertable() {
            if let Some(alerts) = &self.alerts {
                dispatch(alerts, Alert::new(event.severity, event.summary()));
            }
        }

        Ok(event)
    }
}
