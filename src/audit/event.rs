//! Audit Event
//!
//! Defines the immutable audit event, the draft callers submit to the
//! recorder, and the canonical serialization that feeds the hash chain.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};

/// Hash sentinel used as `previous_hash` of the first event in a chain
pub const GENESIS_HASH: &str =
    "sha256:0000000000000000000000000000000000000000000000000000000000000000";

const HASH_PREFIX: &str = "sha256:";

/// Hash arbitrary bytes into the `sha256:<hex>` form used across the ledger
pub fn sha256_tagged(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{}{}", HASH_PREFIX, hex::encode(hasher.finalize()))
}

/// Decode a `sha256:<hex>` string into its raw digest
pub fn decode_hash(hash: &str) -> LedgerResult<[u8; 32]> {
    let hex_part = hash
        .strip_prefix(HASH_PREFIX)
        .ok_or_else(|| LedgerError::SerializationError(format!("Hash without sha256 prefix: {}", hash)))?;
    let bytes = hex::decode(hex_part)
        .map_err(|e| LedgerError::SerializationError(format!("Invalid hash hex {}: {}", hash, e)))?;
    bytes
        .try_into()
        .map_err(|_| LedgerError::SerializationError(format!("Hash is not 32 bytes: {}", hash)))
}

pub fn encode_hash(digest: &[u8; 32]) -> String {
    format!("{}{}", HASH_PREFIX, hex::encode(digest))
}

/// Canonical timestamp rendering: RFC 3339, UTC, microsecond precision
pub fn canonical_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(value: &str) -> LedgerResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| LedgerError::SerializationError(format!("Invalid timestamp {}: {}", value, e)))
}

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = LedgerError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.to_ascii_lowercase().as_str() {
                    $($text => Ok(Self::$variant),)+
                    other => Err(LedgerError::InvalidEvent(format!(
                        "Unknown {} '{}'",
                        stringify!($name).to_ascii_lowercase(),
                        other
                    ))),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Security,
    Financial,
    System,
    Data,
}

string_enum!(Category {
    Security => "security",
    Financial => "financial",
    System => "system",
    Data => "data",
});

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Security,
        Category::Financial,
        Category::System,
        Category::Data,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

string_enum!(Severity {
    Low => "low",
    Medium => "medium",
    High => "high",
    Critical => "critical",
});

impl Severity {
    /// High and critical events are forwarded to the alert channel
    pub fn is_alertable(&self) -> bool {
        *self >= Severity::High
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
    Pending,
}

string_enum!(Outcome {
    Success => "success",
    Failure => "failure",
    Pending => "pending",
});

/// Who performed the action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub actor_type: String,
    pub origin: Option<String>,
}

impl Actor {
    pub fn new(id: impl Into<String>, name: impl Into<String>, actor_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            actor_type: actor_type.into(),
            origin: None,
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn system() -> Self {
        Self::new("system", "system", "service")
    }
}

/// What the action was performed on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub target_type: String,
}

impl Target {
    pub fn new(id: impl Into<String>, name: impl Into<String>, target_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            target_type: target_type.into(),
        }
    }

    pub fn none() -> Self {
        Self::new("", "", "")
    }
}

/// Everything the caller supplies for an event; the recorder adds chain fields
#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    pub event_type: String,
    pub category: Category,
    pub severity: Severity,
    pub source: String,
    pub actor: Actor,
    pub target: Target,
    pub action: String,
    pub outcome: Outcome,
    pub message: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub metadata: BTreeMap<String, String>,
}

impl EventDraft {
    pub fn new(
        event_type: impl Into<String>,
        category: Category,
        source: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            category,
            severity: Severity::Low,
            source: source.into(),
            actor: Actor::system(),
            target: Target::none(),
            action: action.into(),
            outcome: Outcome::Success,
            message: String::new(),
            timestamp: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn actor(mut self, actor: Actor) -> Self {
        self.actor = actor;
        self
    }

    pub fn target(mut self, target: Target) -> Self {
        self.target = target;
        self
    }

    pub fn outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Reject drafts missing the fields every audit record needs
    pub fn validate(&self) -> LedgerResult<()> {
        for (field, value) in [
            ("event_type", &self.event_type),
            ("source", &self.source),
            ("action", &self.action),
        ] {
            if value.trim().is_empty() {
                return Err(LedgerError::InvalidEvent(format!("{} must not be empty", field)));
            }
        }
        Ok(())
    }
}

/// One committed, immutable audit fact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "EventRecord", try_from = "EventRecord")]
pub struct AuditEvent {
    pub id: String,
    pub chain_id: String,
    pub sequence: u64,
    pub event_type: String,
    pub category: Category,
    pub severity: Severity,
    pub source: String,
    pub actor: Actor,
    pub target: Target,
    pub action: String,
    pub outcome: Outcome,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: BTreeMap<String, String>,
    pub previous_hash: String,
    pub hash: String,
}

/// Hash input: every event field except `hash`, in a fixed order
#[derive(Serialize)]
struct CanonicalEvent<'a> {
    id: &'a str,
    chain_id: &'a str,
    sequence: u64,
    event_type: &'a str,
    category: Category,
    severity: Severity,
    source: &'a str,
    actor_id: &'a str,
    actor_name: &'a str,
    actor_type: &'a str,
    actor_origin: Option<&'a str>,
    target_id: &'a str,
    target_name: &'a str,
    target_type: &'a str,
    action: &'a str,
    outcome: Outcome,
    message: &'a str,
    timestamp: String,
    metadata: &'a BTreeMap<String, String>,
    previous_hash: &'a str,
}

/// Flat, field-stable export form of an event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: String,
    pub chain_id: String,
    pub sequence: u64,
    pub event_type: String,
    pub category: Category,
    pub severity: Severity,
    pub source: String,
    pub actor_id: String,
    pub actor_name: String,
    pub actor_type: String,
    pub actor_origin: Option<String>,
    pub target_id: String,
    pub target_name: String,
    pub target_type: String,
    pub action: String,
    pub outcome: Outcome,
    pub message: String,
    pub timestamp: String,
    pub metadata: BTreeMap<String, String>,
    pub previous_hash: String,
    pub hash: String,
}

impl From<AuditEvent> for EventRecord {
    fn from(event: AuditEvent) -> Self {
        Self {
            timestamp: canonical_timestamp(&event.timestamp),
            id: event.id,
            chain_id: event.chain_id,
            sequence: event.sequence,
            event_type: event.event_type,
            category: event.category,
            severity: event.severity,
            source: event.source,
            actor_id: event.actor.id,
            actor_name: event.actor.name,
            actor_type: event.actor.actor_type,
            actor_origin: event.actor.origin,
            target_id: event.target.id,
            target_name: event.target.name,
            target_type: event.target.target_type,
            action: event.action,
            outcome: event.outcome,
            message: event.message,
            metadata: event.metadata,
            previous_hash: event.previous_hash,
            hash: event.hash,
        }
    }
}

impl TryFrom<EventRecord> for AuditEvent {
    type Error = LedgerError;

    fn try_from(record: EventRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            timestamp: parse_timestamp(&record.timestamp)?,
            id: record.id,
            chain_id: record.chain_id,
            sequence: record.sequence,
            event_type: record.event_type,
            category: record.category,
            severity: record.severity,
            source: record.source,
            actor: Actor {
                id: record.actor_id,
                name: record.actor_name,
                actor_type: record.actor_type,
                origin: record.actor_origin,
            },
            target: Target {
                id: record.target_id,
                name: record.target_name,
                target_type: record.target_type,
            },
            action: record.action,
            outcome: record.outcome,
            message: record.message,
            metadata: record.metadata,
            previous_hash: record.previous_hash,
            hash: record.hash,
        })
    }
}

impl AuditEvent {
    /// Seal a draft at a chain position. Only the recorder calls this.
    pub(crate) fn seal(
        draft: EventDraft,
        chain_id: &str,
        sequence: u64,
        previous_hash: &str,
        timestamp: DateTime<Utc>,
    ) -> LedgerResult<Self> {
        let mut event = Self {
            id: Uuid::new_v4().to_string(),
            chain_id: chain_id.to_string(),
            sequence,
            event_type: draft.event_type,
            category: draft.category,
            severity: draft.severity,
            source: draft.source,
            actor: draft.actor,
            target: draft.target,
            action: draft.action,
            outcome: draft.outcome,
            message: draft.message,
            timestamp: timestamp.trunc_subsecs(6),
            metadata: draft.metadata,
            previous_hash: previous_hash.to_string(),
            hash: String::new(),
        };
        event.hash = event.calculate_hash()?;
        Ok(event)
    }

    /// Deterministic bytes covered by the content hash
    pub fn canonical_bytes(&self) -> LedgerResult<Vec<u8>> {
        let canonical = CanonicalEvent {
            id: &self.id,
            chain_id: &self.chain_id,
            sequence: self.sequence,
            event_type: &self.event_type,
            category: self.category,
            severity: self.severity,
            source: &self.source,
            actor_id: &self.actor.id,
            actor_name: &self.actor.name,
            actor_type: &self.actor.actor_type,
            actor_origin: self.actor.origin.as_deref(),
            target_id: &self.target.id,
            target_name: &self.target.name,
            target_type: &self.target.target_type,
            action: &self.action,
            outcome: self.outcome,
            message: &self.message,
            timestamp: canonical_timestamp(&self.timestamp),
            metadata: &self.metadata,
            previous_hash: &self.previous_hash,
        };
        Ok(serde_json::to_vec(&canonical)?)
    }

    pub fn calculate_hash(&self) -> LedgerResult<String> {
        Ok(sha256_tagged(&self.canonical_bytes()?))
    }

    /// True when the stored hash matches the event's content
    pub fn verify_hash(&self) -> bool {
        matches!(self.calculate_hash(), Ok(hash) if hash == self.hash)
    }

    pub fn summary(&self) -> String {
        format!(
            "{} #{} {}/{}: {} by {} ({})",
            self.chain_id,
            self.sequence,
            self.category,
            self.event_type,
            self.action,
            self.actor.id,
            self.outcome
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_event() -> AuditEvent {
        let draft = EventDraft::new("login", Category::Security, "auth-service", "authenticate")
            .severity(Severity::Medium)
            .actor(Actor::new("u-42", "alice", "user").with_origin("10.0.0.7"))
            .target(Target::new("acct-1", "treasury", "account"))
            .message("interactive login")
            .meta("mfa", "totp")
            .meta("client", "cli");
        let ts = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        AuditEvent::seal(draft, "main", 0, GENESIS_HASH, ts).unwrap()
    }

    #[test]
    fn test_sealed_event_verifies() {
        let event = sample_event();
        assert!(event.verify_hash());
        assert!(event.hash.starts_with("sha256:"));
        assert_eq!(event.hash.len(), 71);
        assert_eq!(event.previous_hash, GENESIS_HASH);
    }

    #[test]
    fn test_hash_covers_message_and_previous_hash() {
        let event = sample_event();

        let mut edited = event.clone();
        edited.message.push('!');
        assert!(!edited.verify_hash());

        let mut relinked = event.clone();
        relinked.previous_hash = sha256_tagged(b"elsewhere");
        assert!(!relinked.verify_hash());
    }

    #[test]
    fn test_canonical_form_is_stable() {
        let event = sample_event();
        let bytes = event.canonical_bytes().unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();

        assert!(text.starts_with("{\"id\":"));
        assert!(text.contains("\"timestamp\":\"2025-03-01T12:00:00.000000Z\""));
        assert!(text.contains("\"metadata\":{\"client\":\"cli\",\"mfa\":\"totp\"}"));
        assert!(!text.contains("\"hash\""));
        assert_eq!(bytes, event.canonical_bytes().unwrap());
    }

    #[test]
    fn test_export_record_is_flat_and_round_trips() {
        let event = sample_event();
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["actor_origin"], "10.0.0.7");
        assert_eq!(json["category"], "security");
        assert!(json.get("actor").is_none());

        let restored: AuditEvent = serde_json::from_value(json).unwrap();
        assert_eq!(restored, event);
        assert!(restored.verify_hash());
    }

    #[test]
    fn test_subsecond_precision_is_truncated() {
        let ts = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        let draft = EventDraft::new("x", Category::System, "svc", "act");
        let event = AuditEvent::seal(draft, "main", 0, GENESIS_HASH, ts).unwrap();
        assert_eq!(event.timestamp.timestamp_subsec_nanos(), 123_456_000);
    }

    #[test]
    fn test_draft_validation() {
        assert!(EventDraft::new("login", Category::Security, "auth", "authenticate")
            .validate()
            .is_ok());
        assert!(EventDraft::new("", Category::Security, "auth", "authenticate")
            .validate()
            .is_err());
        assert!(EventDraft::new("login", Category::Security, "auth", "  ")
            .validate()
            .is_err());
    }

    #[test]
    fn test_enum_parsing() {
        assert_eq!("Financial".parse::<Category>().unwrap(), Category::Financial);
        assert_eq!("critical".parse::<Severity>().unwrap(), Severity::Critical);
        assert!("sometimes".parse::<Outcome>().is_err());
        assert!(Severity::High.is_alertable());
        assert!(!Severity::Medium.is_alertable());
    }

    #[test]
    fn test_decode_hash() {
        let hash = sha256_tagged(b"abc");
        let raw = decode_hash(&hash).unwrap();
        assert_eq!(encode_hash(&raw), hash);
        assert!(decode_hash("md5:abcd").is_err());
        assert!(decode_hash("sha256:abcd").is_err());
    }
}
