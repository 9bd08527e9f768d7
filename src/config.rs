use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use crate::audit::event::{Category, Severity};
use crate::audit::retention::{RetentionPolicy, StorageClass};
use crate::error::{LedgerError, LedgerResult};

pub const ENV_PREFIX: &str = "AUDIT_LEDGER";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// SQLite URL, or `memory` for a process-local ledger
    pub database_url: String,
    pub chain_id: String,
    pub recording: RecordingConfig,
    pub aggregation: AggregationConfig,
    pub anchoring: AnchoringConfig,
    pub retention: RetentionConfig,
    pub alerts: AlertConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// How far an explicit event timestamp may lag the recorder's clock
    pub max_backdate_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub interval_secs: u64,
    pub batch_max_events: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnchorMode {
    /// OpenTimestamps calendar servers
    Calendar,
    /// In-process notary keyed by `notary_secret`
    Notary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnchoringConfig {
    pub enabled: bool,
    pub mode: AnchorMode,
    pub calendars: Vec<String>,
    /// Esplora API used to check Bitcoin attestations; empty disables it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_explorer_url: Option<String>,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub request_timeout_secs: u64,
    pub anchor_interval_secs: u64,
    pub upgrade_interval_secs: u64,
    pub confirmation_target: u32,
    pub notary_secret: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notary_auto_confirm_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryRetention {
    pub min_days: u32,
    pub storage_class: StorageClass,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub security: CategoryRetention,
    pub financial: CategoryRetention,
    pub system: CategoryRetention,
    pub data: CategoryRetention,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    pub min_severity: Severity,
    pub timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://audit-ledger.db".to_string(),
            chain_id: "main".to_string(),
            recording: RecordingConfig::default(),
            aggregation: AggregationConfig::default(),
            anchoring: AnchoringConfig::default(),
            retention: RetentionConfig::default(),
            alerts: AlertConfig::default(),
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            max_backdate_secs: 300,
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            interval_secs: 86_400,
            batch_max_events: 10_000,
        }
    }
}

impl Default for AnchoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: AnchorMode::Calendar,
            calendars: vec![
                "https://alice.btc.calendar.opentimestamps.org".to_string(),
                "https://bob.btc.calendar.opentimestamps.org".to_string(),
                "https://finney.calendar.eternitywall.com".to_string(),
            ],
            block_explorer_url: Some("https://blockstream.info/api".to_string()),
            max_attempts: 5,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            request_timeout_secs: 30,
            anchor_interval_secs: 3_600,
            upgrade_interval_secs: 3_600,
            confirmation_target: 1,
            notary_secret: String::new(),
            notary_auto_confirm_secs: None,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        // seven years for security and financial records
        Self {
            security: CategoryRetention {
                min_days: 2_555,
                storage_class: StorageClass::Cold,
            },
            financial: CategoryRetention {
                min_days: 2_555,
                storage_class: StorageClass::Cold,
            },
            system: CategoryRetention {
                min_days: 365,
                storage_class: StorageClass::Warm,
            },
            data: CategoryRetention {
                min_days: 1_095,
                storage_class: StorageClass::Warm,
            },
        }
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            min_severity: Severity::High,
            timeout_secs: 10,
        }
    }
}

impl RetentionConfig {
    pub fn for_category(&self, category: Category) -> &CategoryRetention {
        match category {
            Category::Security => &self.security,
            Category::Financial => &self.financial,
            Category::System => &self.system,
            Category::Data => &self.data,
        }
    }

    pub fn policies(&self) -> HashMap<Category, RetentionPolicy> {
        Category::ALL
            .iter()
            .map(|category| {
                let entry = self.for_category(*category);
                (
                    *category,
                    RetentionPolicy {
                        category: *category,
                        min_days: entry.min_days,
                        storage_class: entry.storage_class,
                    },
                )
            })
            .collect()
    }
}

impl AppConfig {
    /// Load defaults, then an optional TOML file, then `AUDIT_LEDGER__*` env vars
    pub fn load(path: Option<&Path>) -> LedgerResult<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!("Loading configuration from {}", path.display());
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("anchoring.calendars")
                .try_parsing(true),
        );

        let config: AppConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> LedgerResult<()> {
        if self.chain_id.trim().is_empty() {
            return Err(LedgerError::ConfigError("chain_id must not be empty".to_string()));
        }
        if self.aggregation.batch_max_events == 0 {
            return Err(LedgerError::ConfigError(
                "aggregation.batch_max_events must be > 0".to_string(),
            ));
        }
        if self.aggregation.interval_secs == 0 {
            return Err(LedgerError::ConfigError(
                "aggregation.interval_secs must be > 0".to_string(),
            ));
        }

        let anchoring = &self.anchoring;
        if anchoring.request_timeout_secs == 0 {
            return Err(LedgerError::ConfigError(
                "anchoring.request_timeout_secs must be > 0".to_string(),
            ));
        }
        if anchoring.enabled {
            if anchoring.max_attempts == 0 {
                return Err(LedgerError::ConfigError(
                    "anchoring.max_attempts must be > 0".to_string(),
                ));
            }
            if anchoring.initial_backoff_ms > anchoring.max_backoff_ms {
                return Err(LedgerError::ConfigError(
                    "anchoring.initial_backoff_ms exceeds max_backoff_ms".to_string(),
                ));
            }
            if anchoring.anchor_interval_secs == 0 || anchoring.upgrade_interval_secs == 0 {
                return Err(LedgerError::ConfigError(
                    "anchoring intervals must be > 0".to_string(),
                ));
            }
            match anchoring.mode {
                AnchorMode::Calendar if anchoring.calendars.is_empty() => {
                    return Err(LedgerError::ConfigError(
                        "anchoring.calendars must list at least one calendar".to_string(),
                    ));
                }
                AnchorMode::Notary if anchoring.notary_secret.len() < 16 => {
                    return Err(LedgerError::ConfigError(
                        "anchoring.notary_secret must be at least 16 characters".to_string(),
                    ));
                }
                _ => {}
            }
        }

        for category in Category::ALL {
            if self.retention.for_category(category).min_days == 0 {
                return Err(LedgerError::ConfigError(format!(
                    "retention.{}.min_days must be > 0",
                    category
                )));
            }
        }

        Ok(())
    }

    pub fn to_toml(&self) -> LedgerResult<String> {
        toml::to_string_pretty(self).map_err(|e| LedgerError::SerializationError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retention.policies().len(), 4);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
chain_id = "payments"

[aggregation]
batch_max_events = 50

[anchoring]
mode = "notary"
notary_secret = "0123456789abcdef0123"

[retention.system]
min_days = 30
storage_class = "hot"
"#
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.chain_id, "payments");
        assert_eq!(config.aggregation.batch_max_events, 50);
        assert_eq!(config.aggregation.interval_secs, 86_400);
        assert_eq!(config.anchoring.mode, AnchorMode::Notary);
        assert_eq!(config.retention.system.min_days, 30);
        assert_eq!(config.retention.security.min_days, 2_555);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.aggregation.batch_max_events = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.anchoring.calendars.clear();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.anchoring.mode = AnchorMode::Notary;
        config.anchoring.notary_secret = "short".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.retention.data.min_days = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_request_timeout_rejected() {
        let mut config = AppConfig::default();
        config.anchoring.request_timeout_secs = 0;
        assert!(matches!(config.validate(), Err(LedgerError::ConfigError(_))));

        // the verifier still makes requests with anchoring switched off
        config.anchoring.enabled = false;
        assert!(config.validate().is_err());

        config.anchoring.request_timeout_secs = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_renders_as_toml() {
        let rendered = AppConfig::default().to_toml().unwrap();
        assert!(rendered.contains("chain_id = \"main\""));
        assert!(rendered.contains("[anchoring]"));
    }
}
