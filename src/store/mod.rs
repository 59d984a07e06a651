//! Remote record stores.
//!
//! Everything the engine does to an org goes through [`RecordStore`]: typed
//! queries, describes, and the three bulk write operations. `SalesforceStore`
//! talks REST + Bulk API 2.0; `MemoryStore` (test builds only) backs tests; `LoggedStore` wraps
//! either and appends each request to the query log.

pub mod bulk;
pub mod logged;
#[cfg(test)]
pub mod memory;
pub mod query;
pub mod salesforce;
pub mod session;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Row;

pub use logged::LoggedStore;
#[cfg(test)]
pub use memory::MemoryStore;
pub use query::{Filter, Query};
pub use salesforce::SalesforceStore;
pub use session::OrgSession;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Session for {0} expired or is invalid")]
    AuthExpired(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Bulk job {job_id} ended in state {state}: {message}")]
    JobFailed {
        job_id: String,
        state: String,
        message: String,
    },

    #[error("Bulk job {job_id} did not finish within {seconds}s")]
    JobTimeout { job_id: String, seconds: u64 },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Session lookup for `{alias}` failed: {message}")]
    Session { alias: String, message: String },

    #[error("Unexpected response: {0}")]
    Unexpected(String),
}

impl StoreError {
    /// The session lapsed mid-run; nothing later in the run can succeed.
    pub fn is_auth_lapse(&self) -> bool {
        matches!(self, StoreError::AuthExpired(_))
    }

    /// A bulk job failed as a whole rather than row by row.
    pub fn is_job_failure(&self) -> bool {
        matches!(
            self,
            StoreError::JobFailed { .. } | StoreError::JobTimeout { .. }
        )
    }
}

// =============================================================================
// Bulk outcomes
// =============================================================================

/// Result of one submitted create row, keyed by its position in the submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOutcome {
    pub row_index: usize,
    pub result: Result<String, String>,
}

/// Result of one update or delete row, keyed by the target id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub id: String,
    pub result: Result<(), String>,
}

// =============================================================================
// Describe payloads
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectDescribe {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<FieldDescribe>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDescribe {
    pub name: String,
    #[serde(rename = "type", default)]
    pub field_type: String,
    #[serde(default)]
    pub reference_to: Vec<String>,
    #[serde(default)]
    pub createable: bool,
    #[serde(default)]
    pub updateable: bool,
    #[serde(default)]
    pub nillable: bool,
    #[serde(default)]
    pub defaulted_on_create: bool,
    #[serde(default)]
    pub length: u32,
    #[serde(default)]
    pub relationship_name: Option<String>,
    #[serde(default)]
    pub picklist_values: Vec<PicklistEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PicklistEntry {
    pub value: String,
    #[serde(default)]
    pub active: bool,
}

// =============================================================================
// Store trait
// =============================================================================

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Short name used in logs (usually the org alias).
    fn label(&self) -> &str;

    /// Instance the store talks to; two stores with the same endpoint are the same org.
    fn endpoint(&self) -> &str;

    async fn query(&self, query: &Query) -> Result<Vec<Row>, StoreError>;

    async fn describe(&self, object: &str) -> Result<ObjectDescribe, StoreError>;

    /// One outcome per submitted row, in any order.
    async fn bulk_create(&self, object: &str, rows: &[Row])
        -> Result<Vec<CreateOutcome>, StoreError>;

    /// Every row carries an `Id`.
    async fn bulk_update(&self, object: &str, rows: &[Row]) -> Result<Vec<WriteOutcome>, StoreError>;

    async fn bulk_delete(&self, object: &str, ids: &[String])
        -> Result<Vec<WriteOutcome>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_payload_parses_salesforce_shape() {
        let describe: ObjectDescribe = serde_json::from_value(serde_json::json!({
            "name": "Opportunity",
            "fields": [
                {
                    "name": "AccountId",
                    "type": "reference",
                    "referenceTo": ["Account"],
                    "createable": true,
                    "updateable": true,
                    "nillable": true,
                    "defaultedOnCreate": false,
                    "relationshipName": "Account",
                    "length": 18,
                    "picklistValues": []
                },
                {
                    "name": "StageName",
                    "type": "picklist",
                    "createable": true,
                    "updateable": true,
                    "nillable": false,
                    "picklistValues": [
                        {"value": "Prospecting", "active": true, "label": "Prospecting"},
                        {"value": "Legacy", "active": false}
                    ]
                }
            ]
        }))
        .unwrap();

        assert_eq!(describe.fields.len(), 2);
        assert_eq!(describe.fields[0].reference_to, vec!["Account"]);
        assert_eq!(describe.fields[1].picklist_values.len(), 2);
        assert!(!describe.fields[1].picklist_values[1].active);
    }

    #[test]
    fn auth_lapse_and_job_failure_are_distinguished() {
        assert!(StoreError::AuthExpired("qa".into()).is_auth_lapse());
        let failed = StoreError::JobFailed {
            job_id: "750".into(),
            state: "Failed".into(),
            message: "InvalidBatch".into(),
        };
        assert!(failed.is_job_failure());
        assert!(!failed.is_auth_lapse());
    }
}
