#![allow(dead_code)]

use audit_ledger::alert::MemoryAlertSink;
use audit_ledger::audit::event::{Actor, Category, EventDraft, Severity, Target};
use audit_ledger::config::{AnchorMode, AppConfig};
use audit_ledger::database::LedgerStore;
use audit_ledger::ots::{LocalNotary, ServiceSet};
use audit_ledger::Ledger;
use std::sync::Arc;

pub const NOTARY: &str = "test-notary";

/// Config for a process-local ledger anchored by a local notary
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.database_url = "memory".to_string();
    config.chain_id = "main".to_string();
    config.anchoring.mode = AnchorMode::Notary;
    config.anchoring.notary_secret = "integration-test-secret".to_string();
    config.anchoring.max_attempts = 2;
    config.anchoring.initial_backoff_ms = 1;
    config.anchoring.max_backoff_ms = 5;
    config.anchoring.request_timeout_secs = 2;
    config
}

pub struct TestLedger {
    pub ledger: Ledger,
    pub notary: Arc<LocalNotary>,
    pub alerts: Arc<MemoryAlertSink>,
}

/// Assemble a ledger over `store`, keeping handles to the notary and alerts
pub async fn setup_ledger<S: LedgerStore + 'static>(store: Arc<S>) -> TestLedger {
    setup_ledger_with(test_config(), store).await
}

pub async fn setup_ledger_with<S: LedgerStore + 'static>(config: AppConfig, store: Arc<S>) -> TestLedger {
    let notary = Arc::new(LocalNotary::new(NOTARY, "integration-test-secret"));
    let alerts = Arc::new(MemoryAlertSink::new());
    let ledger = Ledger::with_store(config, store, ServiceSet::single(notary.clone()), alerts.clone())
        .await
        .expect("Failed to assemble test ledger");
    TestLedger {
        ledger,
        notary,
        alerts,
    }
}

pub fn login_event(user: &str) -> EventDraft {
    EventDraft::new("user.login", Category::Security, "auth-service", "login")
        .severity(Severity::Low)
        .actor(Actor::new(user, user, "user").with_origin("10.0.0.7"))
        .target(Target::new("portal", "Customer Portal", "application"))
        .message(format!("{} signed in", user))
}

pub fn payment_event(amount_cents: u64) -> EventDraft {
    EventDraft::new("payment.captured", Category::Financial, "billing", "capture")
        .severity(Severity::Medium)
        .actor(Actor::system())
        .target(Target::new("inv-1001", "Invoice 1001", "invoice"))
        .message(format!("captured {} cents", amount_cents))
        .meta("amount_cents", amount_cents.to_string())
        .meta("currency", "EUR")
}

pub fn system_event(n: usize) -> EventDraft {
    EventDraft::new("job.finished", Category::System, "scheduler", "run")
        .message(format!("nightly job {}", n))
}
