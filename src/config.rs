//! Run configuration.
//!
//! Loaded from `~/Sandcastle.json` unless a path is given. Keys from older
//! config files (`source_prod_alias`, `Accounts`, ...) are accepted as aliases.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{is_record_id, RecordKind};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found at {0}")]
    NotFound(PathBuf),

    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Missing required setting `{0}`")]
    Missing(&'static str),

    #[error("Invalid value for `{key}`: {message}")]
    Invalid { key: String, message: String },

    #[error("Could not find home directory")]
    NoHome,
}

impl ConfigError {
    fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.into(),
            message: message.into(),
        }
    }
}

// =============================================================================
// Limits
// =============================================================================

/// Per-parent record cap for one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindLimit {
    Unlimited,
    Skip,
    AtMost(usize),
}

impl KindLimit {
    pub fn from_setting(key: &str, value: i64) -> Result<Self, ConfigError> {
        match value {
            -1 => Ok(KindLimit::Unlimited),
            0 => Ok(KindLimit::Skip),
            n if n > 0 => Ok(KindLimit::AtMost(n as usize)),
            n => Err(ConfigError::invalid(
                key,
                format!("{n} is not a limit (use -1 for unlimited, 0 to skip)"),
            )),
        }
    }

    pub fn is_skip(self) -> bool {
        self == KindLimit::Skip
    }

    /// Truncate an already deterministically ordered candidate list.
    pub fn apply<T>(self, mut items: Vec<T>) -> Vec<T> {
        match self {
            KindLimit::Unlimited => items,
            KindLimit::Skip => Vec::new(),
            KindLimit::AtMost(n) => {
                items.truncate(n);
                items
            }
        }
    }
}

// =============================================================================
// Config
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeleteScope {
    /// Only records the previous run's ledger says it created.
    #[default]
    Ledger,
    /// Every record of each migrated kind in the target.
    All,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkSettings {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: usize,
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    #[serde(default = "default_poll_initial_ms")]
    pub poll_initial_ms: u64,
    #[serde(default = "default_poll_max_ms")]
    pub poll_max_ms: u64,
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    /// Repeats of a REST call after a transient failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_initial_ms")]
    pub retry_initial_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
}

impl Default for BulkSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_batch_bytes: default_max_batch_bytes(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            poll_initial_ms: default_poll_initial_ms(),
            poll_max_ms: default_poll_max_ms(),
            job_timeout_secs: default_job_timeout_secs(),
            max_retries: default_max_retries(),
            retry_initial_ms: default_retry_initial_ms(),
            retry_max_ms: default_retry_max_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default, alias = "source_prod_alias")]
    pub source_alias: Option<String>,
    #[serde(default, alias = "target_sandbox_alias")]
    pub target_alias: Option<String>,
    #[serde(default, alias = "Accounts")]
    pub accounts: Vec<String>,
    #[serde(default = "default_true")]
    pub delete_existing_records: bool,
    #[serde(default)]
    pub delete_scope: DeleteScope,

    #[serde(default = "default_ten")]
    pub contact_limit: i64,
    #[serde(default = "default_ten")]
    pub opportunity_limit: i64,
    #[serde(default = "default_ten")]
    pub quote_limit: i64,
    #[serde(default = "default_case_limit")]
    pub case_limit: i64,
    #[serde(default = "default_ten")]
    pub order_limit: i64,
    #[serde(default = "default_ten")]
    pub locations_limit: i64,
    #[serde(default = "default_quote_line_item_limit")]
    pub quote_line_item_limit: i64,
    #[serde(default = "default_order_item_limit")]
    pub order_item_limit: i64,

    #[serde(default)]
    pub opportunity_bypass_record_type_id: Option<String>,
    #[serde(default = "default_true")]
    pub defer_optional_references: bool,
    /// `Object.Field` entries never copied.
    #[serde(default)]
    pub excluded_fields: BTreeSet<String>,

    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: u64,
    #[serde(default)]
    pub bulk: BulkSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source_alias: None,
            target_alias: None,
            accounts: Vec::new(),
            delete_existing_records: true,
            delete_scope: DeleteScope::default(),
            contact_limit: default_ten(),
            opportunity_limit: default_ten(),
            quote_limit: default_ten(),
            case_limit: default_case_limit(),
            order_limit: default_ten(),
            locations_limit: default_ten(),
            quote_line_item_limit: default_quote_line_item_limit(),
            order_item_limit: default_order_item_limit(),
            opportunity_bypass_record_type_id: None,
            defer_optional_references: true,
            excluded_fields: BTreeSet::new(),
            api_version: default_api_version(),
            work_dir: None,
            log_retention_days: default_log_retention_days(),
            bulk: BulkSettings::default(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_ten() -> i64 {
    10
}
fn default_case_limit() -> i64 {
    5
}
fn default_quote_line_item_limit() -> i64 {
    100
}
fn default_order_item_limit() -> i64 {
    20
}
fn default_api_version() -> String {
    "60.0".to_string()
}
fn default_log_retention_days() -> u64 {
    30
}
fn default_batch_size() -> usize {
    10_000
}
fn default_max_batch_bytes() -> usize {
    100 * 1024 * 1024
}
fn default_max_concurrent_jobs() -> usize {
    4
}
fn default_poll_initial_ms() -> u64 {
    1_000
}
fn default_poll_max_ms() -> u64 {
    15_000
}
fn default_job_timeout_secs() -> u64 {
    600
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_initial_ms() -> u64 {
    500
}
fn default_retry_max_ms() -> u64 {
    30_000
}

/// Overrides supplied on the command line; applied before validation.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub source_alias: Option<String>,
    pub target_alias: Option<String>,
    pub no_delete: bool,
    pub work_dir: Option<PathBuf>,
}

/// `~/Sandcastle.json`
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    let home = dirs::home_dir().ok_or(ConfigError::NoHome)?;
    Ok(home.join("Sandcastle.json"))
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_str(&content)?)
}

impl Config {
    pub fn apply_overrides(&mut self, overrides: Overrides) {
        if let Some(alias) = overrides.source_alias {
            self.source_alias = Some(alias);
        }
        if let Some(alias) = overrides.target_alias {
            self.target_alias = Some(alias);
        }
        if overrides.no_delete {
            self.delete_existing_records = false;
        }
        if let Some(dir) = overrides.work_dir {
            self.work_dir = Some(dir);
        }
    }

    /// Checks everything that can be checked without a store.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.source_alias()?;
        self.target_alias()?;

        if self.accounts.is_empty() {
            return Err(ConfigError::Missing("accounts"));
        }
        let mut seen = BTreeSet::new();
        for id in &self.accounts {
            if !is_record_id(id) {
                return Err(ConfigError::invalid(
                    "accounts",
                    format!("`{id}` is not a 15 or 18 character record id"),
                ));
            }
            if !seen.insert(id.as_str()) {
                return Err(ConfigError::invalid(
                    "accounts",
                    format!("`{id}` is listed twice"),
                ));
            }
        }

        for kind in RecordKind::CREATION_ORDER {
            self.limit_for(kind)?;
        }
        self.locations_limit()?;

        if let Some(id) = &self.opportunity_bypass_record_type_id {
            if !is_record_id(id) {
                return Err(ConfigError::invalid(
                    "opportunity_bypass_record_type_id",
                    format!("`{id}` is not a record id"),
                ));
            }
        }
        for entry in &self.excluded_fields {
            if entry.split_once('.').map_or(true, |(o, f)| o.is_empty() || f.is_empty()) {
                return Err(ConfigError::invalid(
                    "excluded_fields",
                    format!("`{entry}` is not Object.Field"),
                ));
            }
        }

        let bulk = &self.bulk;
        for (key, value) in [
            ("bulk.batch_size", bulk.batch_size as u64),
            ("bulk.max_batch_bytes", bulk.max_batch_bytes as u64),
            ("bulk.max_concurrent_jobs", bulk.max_concurrent_jobs as u64),
            ("bulk.poll_initial_ms", bulk.poll_initial_ms),
            ("bulk.job_timeout_secs", bulk.job_timeout_secs),
            ("bulk.retry_initial_ms", bulk.retry_initial_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(key, "must be greater than zero"));
            }
        }
        if bulk.poll_max_ms < bulk.poll_initial_ms {
            return Err(ConfigError::invalid(
                "bulk.poll_max_ms",
                "must not be below bulk.poll_initial_ms",
            ));
        }
        if bulk.retry_max_ms < bulk.retry_initial_ms {
            return Err(ConfigError::invalid(
                "bulk.retry_max_ms",
                "must not be below bulk.retry_initial_ms",
            ));
        }
        Ok(())
    }

    pub fn source_alias(&self) -> Result<&str, ConfigError> {
        non_empty(self.source_alias.as_deref()).ok_or(ConfigError::Missing("source_alias"))
    }

    pub fn target_alias(&self) -> Result<&str, ConfigError> {
        non_empty(self.target_alias.as_deref()).ok_or(ConfigError::Missing("target_alias"))
    }

    /// Limit applied per parent record for one kind. Accounts are limited
    /// through `locations_limit` instead, since roots are always copied.
    pub fn limit_for(&self, kind: RecordKind) -> Result<KindLimit, ConfigError> {
        let (key, value) = match kind {
            RecordKind::Account => return Ok(KindLimit::Unlimited),
            RecordKind::Contact => ("contact_limit", self.contact_limit),
            RecordKind::Opportunity => ("opportunity_limit", self.opportunity_limit),
            RecordKind::Quote => ("quote_limit", self.quote_limit),
            RecordKind::QuoteLine => ("quote_line_item_limit", self.quote_line_item_limit),
            RecordKind::Order => ("order_limit", self.order_limit),
            RecordKind::OrderItem => ("order_item_limit", self.order_item_limit),
            RecordKind::Case => ("case_limit", self.case_limit),
        };
        KindLimit::from_setting(key, value)
    }

    /// Related (non-root) accounts kept per root.
    pub fn locations_limit(&self) -> Result<KindLimit, ConfigError> {
        KindLimit::from_setting("locations_limit", self.locations_limit)
    }

    pub fn is_excluded(&self, kind: RecordKind, field: &str) -> bool {
        self.excluded_fields
            .contains(&format!("{}.{}", kind.api_name(), field))
    }

    pub fn work_dir(&self) -> PathBuf {
        self.work_dir.clone().unwrap_or_else(|| PathBuf::from("."))
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
