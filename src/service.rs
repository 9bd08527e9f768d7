//! Ledger Service
//!
//! Wires the recorder, aggregator, anchor client, upgrader, verifier and
//! retention manager over one store, and runs the periodic background
//! tasks. Recording never waits on any of the background work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::alert::{dispatch, Alert, AlertSink, TracingAlertSink, WebhookAlertSink};
use crate::audit::event::{AuditEvent, Severity};
use crate::audit::{BatchAggregator, EventRecorder, RetentionManager, Verifier};
use crate::config::{AnchorMode, AnchoringConfig, AppConfig};
use crate::database::{BatchStore, EventStore, LedgerStore, MemoryStore, ProofStore, SqliteStore};
use crate::error::{LedgerError, LedgerResult};
use crate::ots::{
    AnchorClient, AnchorPolicy, BlockExplorer, CalendarClient, LocalNotary, ProofUpgrader,
    ServiceSet, TimestampService,
};

pub const NOTARY_NAME: &str = "local-notary";

/// Committed events the aggregation loop may lag behind before drops
const INTAKE_CAPACITY: usize = 1_024;

/// Timestamp services described by the anchoring configuration
pub fn build_services(config: &AnchoringConfig) -> ServiceSet {
    let timeout = Duration::from_secs(config.request_timeout_secs);
    match config.mode {
        AnchorMode::Calendar => {
            let explorer_url = config
                .block_explorer_url
                .as_deref()
                .filter(|url| !url.trim().is_empty());
            if explorer_url.is_none() {
                warn!("No block explorer configured; Bitcoin attestations are not checked against block headers");
            }
            ServiceSet::new(
                config
                    .calendars
                    .iter()
                    .map(|url| {
                        let mut client = CalendarClient::new(url.clone(), timeout);
                        if let Some(explorer) = explorer_url {
                            client = client.with_explorer(BlockExplorer::new(explorer, timeout));
                        }
                        Arc::new(client) as Arc<dyn TimestampService>
                    })
                    .collect(),
            )
        }
        AnchorMode::Notary => {
            let mut notary = LocalNotary::new(NOTARY_NAME, config.notary_secret.as_bytes());
            if let Some(secs) = config.notary_auto_confirm_secs {
                notary = notary.with_auto_confirm(Duration::from_secs(secs));
            }
            ServiceSet::single(Arc::new(notary))
        }
    }
}

/// Alert sink described by the alert configuration
pub fn build_alerts(config: &AppConfig) -> Arc<dyn AlertSink> {
    match &config.alerts.webhook_url {
        Some(url) => Arc::new(WebhookAlertSink::new(
            url.clone(),
            config.alerts.min_severity,
            Duration::from_secs(config.alerts.timeout_secs),
        )),
        None => Arc::new(TracingAlertSink),
    }
}

pub struct Ledger {
    config: AppConfig,
    events: Arc<dyn EventStore>,
    batches: Arc<dyn BatchStore>,
    proofs: Arc<dyn ProofStore>,
    recorder: EventRecorder,
    aggregator: BatchAggregator,
    anchor: AnchorClient,
    upgrader: ProofUpgrader,
    verifier: Verifier,
    retention: RetentionManager,
    alerts: Arc<dyn AlertSink>,
    background_started: AtomicBool,
}

impl Ledger {
    /// Open the store named by `database_url` and assemble the ledger
    pub async fn open(config: AppConfig) -> LedgerResult<Self> {
        config.validate()?;
        let services = build_services(&config.anchoring);
        let alerts = build_alerts(&config);

        if config.database_url == "memory" {
            Self::with_store(config, Arc::new(MemoryStore::new()), services, alerts).await
        } else {
            let store = SqliteStore::connect(&config.database_url).await?;
            Self::with_store(config, Arc::new(store), services, alerts).await
        }
    }

    /// Assemble the ledger over an existing store
    pub async fn with_store<S: LedgerStore + 'static>(
        config: AppConfig,
        store: Arc<S>,
        services: ServiceSet,
        alerts: Arc<dyn AlertSink>,
    ) -> LedgerResult<Self> {
        let events: Arc<dyn EventStore> = store.clone();
        let batches: Arc<dyn BatchStore> = store.clone();
        let proofs: Arc<dyn ProofStore> = store;

        let max_backdate = i64::try_from(config.recording.max_backdate_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX);
        let recorder = EventRecorder::open(config.chain_id.clone(), events.clone())
            .await?
            .with_alerts(alerts.clone())
            .with_max_backdate(max_backdate);

        let aggregator = BatchAggregator::new(
            events.clone(),
            batches.clone(),
            config.aggregation.batch_max_events,
        );
        let anchor = AnchorClient::new(
            services.clone(),
            batches.clone(),
            proofs.clone(),
            alerts.clone(),
            AnchorPolicy::from(&config.anchoring),
        );
        let request_timeout = Duration::from_secs(config.anchoring.request_timeout_secs);
        let upgrader = ProofUpgrader::new(
            services.clone(),
            proofs.clone(),
            alerts.clone(),
            request_timeout,
        );
        let verifier = Verifier::new(
            events.clone(),
            batches.clone(),
            proofs.clone(),
            services,
            alerts.clone(),
            request_timeout,
        );
        let retention = RetentionManager::new(
            config.retention.policies(),
            events.clone(),
            batches.clone(),
            proofs.clone(),
            alerts.clone(),
        );

        Ok(Self {
            config,
            events,
            batches,
            proofs,
            recorder,
            aggregator,
            anchor,
            upgrader,
            verifier,
            retention,
            alerts,
            background_started: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn chain_id(&self) -> &str {
        &self.config.chain_id
    }

    pub fn recorder(&self) -> &EventRecorder {
        &self.recorder
    }

    pub fn aggregator(&self) -> &BatchAggregator {
        &self.aggregator
    }

    pub fn anchor(&self) -> &AnchorClient {
        &self.anchor
    }

    pub fn upgrader(&self) -> &ProofUpgrader {
        &self.upgrader
    }

    pub fn verifier(&self) -> &Verifier {
        &self.verifier
    }

    pub fn retention(&self) -> &RetentionManager {
        &self.retention
    }

    pub fn events(&self) -> &Arc<dyn EventStore> {
        &self.events
    }

    pub fn batches(&self) -> &Arc<dyn BatchStore> {
        &self.batches
    }

    pub fn proofs(&self) -> &Arc<dyn ProofStore> {
        &self.proofs
    }

    /// Surface a background failure; tamper evidence is critical
    fn report(&self, task: &str, err: &LedgerError) {
        error!("{} failed: {}", task, err);
        let severity = if err.is_tamper_evidence() {
            Severity::Critical
        } else {
            Severity::High
        };
        dispatch(&self.alerts, Alert::new(severity, format!("{} failed: {}", task, err)));
    }

    /// Start aggregation, anchoring and upgrade loops until `shutdown` flips
    pub async fn spawn_background(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> LedgerResult<Vec<JoinHandle<()>>> {
        if self.background_started.swap(true, Ordering::SeqCst) {
            return Err(LedgerError::ConfigError(
                "background tasks already started".to_string(),
            ));
        }
        let (intake_tx, intake) = mpsc::channel(INTAKE_CAPACITY);
        self.recorder.attach_intake(intake_tx).await;

        let mut handles = vec![tokio::spawn(Arc::clone(self).aggregation_loop(intake, shutdown.clone()))];

        if self.config.anchoring.enabled {
            handles.push(tokio::spawn(Arc::clone(self).anchor_loop(shutdown.clone())));
            handles.push(tokio::spawn(Arc::clone(self).upgrade_loop(shutdown)));
        } else {
            info!("Anchoring disabled; batches will not be timestamped");
        }

        info!("Started {} background task(s)", handles.len());
        Ok(handles)
    }

    /// Close a batch every `batch_max_events` committed events or every
    /// `interval_secs`, whichever comes first.
    async fn aggregation_loop(
        self: Arc<Self>,
        mut intake: mpsc::Receiver<AuditEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.aggregation.interval_secs));
        interval.tick().await;
        let mut since_last = 0usize;

        loop {
            let close = tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => true,
                received = intake.recv() => match received {
                    Some(event) => {
                        debug!("Intake received #{}", event.sequence);
                        since_last += 1;
                        since_last >= self.config.aggregation.batch_max_events
                    }
                    None => {
                        warn!("Recorder intake closed");
                        break;
                    }
                },
            };

            if close {
                since_last = 0;
                if let Err(e) = self.aggregator.aggregate_pending(self.chain_id()).await {
                    self.report("Aggregation", &e);
                }
            }
        }
        info!("Aggregation task stopped");
    }

    async fn anchor_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.anchoring.anchor_interval_secs));
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.anchor.anchor_pending(self.chain_id()).await {
                        self.report("Anchoring", &e);
                    }
                }
            }
        }
        info!("Anchor task stopped");
    }

    async fn upgrade_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.anchoring.upgrade_interval_secs));
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.upgrader.upgrade_all().await {
                        self.report("Proof upgrade", &e);
                    }
                }
            }
        }
        info!("Upgrade task stopped");
    }
}
