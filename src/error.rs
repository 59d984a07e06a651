//! Run-level errors.
//!
//! Every error here ends the run. They are classified by what stopped it:
//! - FatalConfig: bad or missing settings, raised before any store is touched
//! - FatalSafety: the target could not be shown to be a sandbox
//! - FatalBatch: a bulk job failed wholesale or the session lapsed
//!
//! Row-level problems are not errors; they are [`crate::types::RowIssue`]s.

use thiserror::Error;

use crate::config::ConfigError;
use crate::dispatch::BatchFailure;
use crate::id_map::AlreadyMapped;
use crate::schema::SchemaError;
use crate::store::StoreError;
use crate::types::RecordKind;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Unsafe target: {0}")]
    UnsafeTarget(String),

    #[error("{kind} {operation} batch {} failed: {source}", .batch + 1)]
    BatchFailed {
        kind: RecordKind,
        operation: &'static str,
        batch: usize,
        source: StoreError,
    },

    #[error("Fetching {kind} records failed: {source}")]
    Fetch { kind: RecordKind, source: StoreError },

    #[error("{context}: {source}")]
    Store {
        context: String,
        source: StoreError,
    },

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("Placeholder {kind} could not be prepared: {reason}")]
    Placeholder { kind: RecordKind, reason: String },

    #[error("{count} {kind} record(s) still reference a placeholder after the update phase")]
    PlaceholderLeak { kind: RecordKind, count: usize },

    #[error(transparent)]
    IdentifierConflict(#[from] AlreadyMapped),

    #[error("Audit trail write failed: {0}")]
    Audit(#[from] csv::Error),
}

/// How a failed run is reported to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    FatalConfig,
    FatalSafety,
    FatalBatch,
    Fatal,
}

impl MigrationError {
    pub fn store(context: impl Into<String>, source: StoreError) -> Self {
        MigrationError::Store {
            context: context.into(),
            source,
        }
    }

    fn store_error(&self) -> Option<&StoreError> {
        match self {
            MigrationError::BatchFailed { source, .. }
            | MigrationError::Fetch { source, .. }
            | MigrationError::Store { source, .. } => Some(source),
            MigrationError::Schema(SchemaError::Describe { source, .. }) => Some(source),
            _ => None,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            MigrationError::Config(_) => ErrorClass::FatalConfig,
            MigrationError::UnsafeTarget(_) => ErrorClass::FatalSafety,
            MigrationError::BatchFailed { .. }
            | MigrationError::Placeholder { .. }
            | MigrationError::PlaceholderLeak { .. } => ErrorClass::FatalBatch,
            _ if self
                .store_error()
                .is_some_and(|e| e.is_auth_lapse() || e.is_job_failure()) =>
            {
                ErrorClass::FatalBatch
            }
            _ => ErrorClass::Fatal,
        }
    }

    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self.class() {
            ErrorClass::FatalConfig => 2,
            ErrorClass::FatalSafety => 3,
            ErrorClass::FatalBatch => 4,
            ErrorClass::Fatal => 1,
        }
    }

    pub fn recovery_suggestion(&self) -> &'static str {
        if self.store_error().is_some_and(StoreError::is_auth_lapse) {
            return "Re-authenticate with `sf org login web --alias <alias>` and rerun.";
        }
        match self {
            MigrationError::Config(_) => "Fix the setting named above in Sandcastle.json.",
            MigrationError::UnsafeTarget(_) => {
                "Point target_alias at a sandbox org. Production orgs are never written to."
            }
            MigrationError::BatchFailed { .. } => {
                "Check the run log and the bulk job in Setup, then rerun with deletion enabled."
            }
            MigrationError::Fetch { .. } | MigrationError::Store { .. } => {
                "Check connectivity and org permissions, then rerun."
            }
            MigrationError::Schema(_) => "Compare the object schemas of both orgs.",
            MigrationError::Placeholder { .. } => {
                "Check validation rules on the target object; placeholder records must be insertable."
            }
            MigrationError::PlaceholderLeak { .. } => {
                "Rerun with deletion enabled to clear the partially migrated records."
            }
            MigrationError::IdentifierConflict(_) => "Rerun against a cleaned target.",
            MigrationError::Audit(_) => "Check permissions and free space in the working directory.",
        }
    }
}

impl From<BatchFailure> for MigrationError {
    fn from(failure: BatchFailure) -> Self {
        MigrationError::BatchFailed {
            kind: failure.kind,
            operation: failure.operation,
            batch: failure.batch,
            source: failure.error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_distinct_exit_codes() {
        let config: MigrationError = ConfigError::Missing("source_alias").into();
        assert_eq!(config.class(), ErrorClass::FatalConfig);
        assert_eq!(config.exit_code(), 2);

        let unsafe_target = MigrationError::UnsafeTarget("production org".into());
        assert_eq!(unsafe_target.class(), ErrorClass::FatalSafety);
        assert_eq!(unsafe_target.exit_code(), 3);

        let batch: MigrationError = BatchFailure {
            kind: RecordKind::Contact,
            operation: "create",
            batch: 1,
            error: StoreError::Unexpected("boom".into()),
        }
        .into();
        assert_eq!(batch.class(), ErrorClass::FatalBatch);
        assert_eq!(batch.exit_code(), 4);
        assert_eq!(batch.to_string(), "Contact create batch 2 failed: Unexpected response: boom");
    }

    #[test]
    fn auth_lapse_anywhere_is_a_batch_failure() {
        let err = MigrationError::Fetch {
            kind: RecordKind::Quote,
            source: StoreError::AuthExpired("prod".into()),
        };
        assert_eq!(err.class(), ErrorClass::FatalBatch);
        assert!(err.recovery_suggestion().contains("sf org login"));

        let other = MigrationError::store("Loading portal users", StoreError::Unexpected("x".into()));
        assert_eq!(other.class(), ErrorClass::Fatal);
        assert_eq!(other.exit_code(), 1);
    }
}
