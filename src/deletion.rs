//! Pre-migration cleanup of the target.
//!
//! Nothing is written to a target that has not identified itself as a
//! sandbox. Deletion then runs children first over either the previous
//! run's ledger or every record of each kind. Portal users' contacts and
//! their accounts cannot be deleted; they are kept and, when the ledger
//! knows their source record, reused by the create phase.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

use serde_json::Value;

use crate::audit::{read_ledger, LedgerEntry};
use crate::config::DeleteScope;
use crate::dispatch::Dispatcher;
use crate::error::MigrationError;
use crate::graph::FETCH_CHUNK;
use crate::store::{Filter, Query, RecordStore};
use crate::types::{IssueReason, RecordKind, Row, RowIssue};

// =============================================================================
// Safety checks
// =============================================================================

/// Fail closed unless the target reports `IsSandbox = true`.
pub async fn verify_sandbox(target: &dyn RecordStore) -> Result<(), MigrationError> {
    let query = Query::select("Organization", ["Id", "Name", "IsSandbox", "OrganizationType"]).limit(1);
    let rows = target.query(&query).await.map_err(|e| {
        MigrationError::UnsafeTarget(format!("could not classify {}: {}", target.label(), e))
    })?;
    let Some(org) = rows.first() else {
        return Err(MigrationError::UnsafeTarget(format!(
            "{} returned no organization record",
            target.label()
        )));
    };
    let name = org.get("Name").and_then(Value::as_str).unwrap_or("unknown");
    match org.get("IsSandbox") {
        Some(Value::Bool(true)) => {
            log::info!("Target {} ({}) is a sandbox", target.label(), name);
            Ok(())
        }
        Some(Value::Bool(false)) => Err(MigrationError::UnsafeTarget(format!(
            "{} ({}) is a production org",
            target.label(),
            name
        ))),
        _ => Err(MigrationError::UnsafeTarget(format!(
            "{} did not report whether it is a sandbox",
            target.label()
        ))),
    }
}

fn normalise_endpoint(endpoint: &str) -> String {
    endpoint.trim().trim_end_matches('/').to_ascii_lowercase()
}

pub fn ensure_distinct(source: &dyn RecordStore, target: &dyn RecordStore) -> Result<(), MigrationError> {
    if normalise_endpoint(source.endpoint()) == normalise_endpoint(target.endpoint()) {
        return Err(MigrationError::UnsafeTarget(format!(
            "source {} and target {} are the same org ({})",
            source.label(),
            target.label(),
            target.endpoint()
        )));
    }
    Ok(())
}

// =============================================================================
// Portal protection
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct PortalGuard {
    contacts: HashSet<String>,
    accounts: HashSet<String>,
}

fn ids_of(rows: &[Row], field: &str) -> HashSet<String> {
    rows.iter()
        .filter_map(|r| r.get(field).and_then(Value::as_str))
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

impl PortalGuard {
    pub async fn load(target: &dyn RecordStore) -> Result<Self, MigrationError> {
        let users = target
            .query(&Query::select("User", ["Id", "ContactId"]).filter(Filter::not_null("ContactId")))
            .await
            .map_err(|e| MigrationError::store("Loading portal users", e))?;
        let contacts = ids_of(&users, "ContactId");

        let mut accounts = HashSet::new();
        let contact_ids: Vec<String> = contacts.iter().cloned().collect();
        for chunk in contact_ids.chunks(FETCH_CHUNK) {
            let rows = target
                .query(
                    &Query::select("Contact", ["Id", "AccountId"])
                        .filter(Filter::is_in("Id", chunk.iter().cloned())),
                )
                .await
                .map_err(|e| MigrationError::store("Loading portal contacts", e))?;
            accounts.extend(ids_of(&rows, "AccountId"));
        }
        if !contacts.is_empty() {
            log::info!(
                "{} portal contact(s) and {} account(s) are protected from deletion",
                contacts.len(),
                accounts.len()
            );
        }
        Ok(Self { contacts, accounts })
    }

    pub fn is_protected(&self, kind: RecordKind, target_id: &str) -> bool {
        match kind {
            RecordKind::Contact => self.contacts.contains(target_id),
            RecordKind::Account => self.accounts.contains(target_id),
            _ => false,
        }
    }
}

// =============================================================================
// Deletion
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct DeletionReport {
    pub deleted: BTreeMap<RecordKind, usize>,
    pub protected: usize,
    pub issues: Vec<RowIssue>,
    /// Kept records the ledger correlates to a source id, for reuse.
    pub retained: BTreeMap<RecordKind, Vec<LedgerEntry>>,
}

impl DeletionReport {
    pub fn total_deleted(&self) -> usize {
        self.deleted.values().sum()
    }
}

pub struct DeletionGuard<'a> {
    target: &'a dyn RecordStore,
    dispatcher: &'a Dispatcher,
    scope: DeleteScope,
    work_dir: &'a Path,
}

impl<'a> DeletionGuard<'a> {
    pub fn new(target: &'a dyn RecordStore, dispatcher: &'a Dispatcher, scope: DeleteScope, work_dir: &'a Path) -> Self {
        Self {
            target,
            dispatcher,
            scope,
            work_dir,
        }
    }

    /// Ids from `candidates` that still exist in the target.
    async fn present(&self, kind: RecordKind, candidates: &[String]) -> Result<BTreeSet<String>, MigrationError> {
        let mut present = BTreeSet::new();
        for chunk in candidates.chunks(FETCH_CHUNK) {
            let rows = self
                .target
                .query(&Query::select(kind.api_name(), ["Id"]).filter(Filter::is_in("Id", chunk.iter().cloned())))
                .await
                .map_err(|e| MigrationError::store(format!("Checking ledger {}", kind.plural()), e))?;
            present.extend(ids_of(&rows, "Id"));
        }
        Ok(present)
    }

    async fn every(&self, kind: RecordKind) -> Result<BTreeSet<String>, MigrationError> {
        let rows = self
            .target
            .query(&Query::select(kind.api_name(), ["Id"]).order_by("Id"))
            .await
            .map_err(|e| MigrationError::store(format!("Listing target {}", kind.plural()), e))?;
        Ok(ids_of(&rows, "Id").into_iter().collect())
    }

    /// Delete the previous migration's data, children first. The sandbox
    /// check must already have passed.
    pub async fn run(&self) -> Result<DeletionReport, MigrationError> {
        let guard = PortalGuard::load(self.target).await?;
        let mut report = DeletionReport::default();

        for kind in RecordKind::deletion_order() {
            let ledger = read_ledger(self.work_dir, kind)?;
            let ledger_ids: Vec<String> = ledger.iter().map(|e| e.target_id.clone()).collect();
            let present = match self.scope {
                DeleteScope::Ledger => self.present(kind, &ledger_ids).await?,
                DeleteScope::All => self.every(kind).await?,
            };

            let (kept, doomed): (Vec<String>, Vec<String>) =
                present.into_iter().partition(|id| guard.is_protected(kind, id));
            if !kept.is_empty() {
                report.protected += kept.len();
                let kept: HashSet<&String> = kept.iter().collect();
                let retained: Vec<LedgerEntry> = ledger
                    .iter()
                    .filter(|e| kept.contains(&e.target_id))
                    .cloned()
                    .collect();
                for id in kept {
                    report.issues.push(
                        RowIssue::new(kind, IssueReason::PortalProtected, format!("target record {} kept", id)).logged(),
                    );
                }
                if !retained.is_empty() {
                    report.retained.insert(kind, retained);
                }
            }
            if doomed.is_empty() {
                continue;
            }

            log::info!("Deleting {} {} from {}", doomed.len(), kind.plural(), self.target.label());
            let dispatched = self.dispatcher.delete(kind, doomed).await;
            for outcome in dispatched.outcomes {
                match outcome.result {
                    Ok(()) => *report.deleted.entry(kind).or_default() += 1,
                    Err(error) => report.issues.push(
                        RowIssue::new(kind, IssueReason::DeleteFailed, error)
                            .record(outcome.id)
                            .logged(),
                    ),
                }
            }
            if let Some(failure) = dispatched.failure {
                return Err(failure.into());
            }
        }
        log::info!("Deletion complete: {} record(s) removed", report.total_deleted());
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::write_ledger;
    use crate::config::BulkSettings;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn entry(source: &str, target: &str) -> LedgerEntry {
        LedgerEntry {
            source_id: source.into(),
            target_id: target.into(),
            record_data: String::new(),
        }
    }

    #[tokio::test]
    async fn sandbox_check_fails_closed() {
        let sandbox = MemoryStore::new("qa", "https://qa");
        sandbox.seed("Organization", row(json!({"Name": "QA", "IsSandbox": true})));
        assert!(verify_sandbox(&sandbox).await.is_ok());

        let production = MemoryStore::new("prod", "https://prod");
        production.seed("Organization", row(json!({"Name": "Prod", "IsSandbox": false})));
        let err = verify_sandbox(&production).await.unwrap_err();
        assert!(err.to_string().contains("production"));
        assert_eq!(err.exit_code(), 3);

        let unknown = MemoryStore::new("odd", "https://odd");
        unknown.seed("Organization", row(json!({"Name": "Odd", "IsSandbox": "yes"})));
        assert!(verify_sandbox(&unknown).await.is_err());

        let empty = MemoryStore::new("none", "https://none");
        assert!(verify_sandbox(&empty).await.is_err());

        let failing = MemoryStore::new("down", "https://down");
        failing.fail_queries("Organization");
        assert!(matches!(
            verify_sandbox(&failing).await,
            Err(MigrationError::UnsafeTarget(_))
        ));
    }

    #[test]
    fn same_org_is_refused() {
        let a = MemoryStore::new("prod", "https://acme.my.salesforce.com/");
        let b = MemoryStore::new("copy", "https://ACME.my.salesforce.com");
        assert!(ensure_distinct(&a, &b).is_err());
        let c = MemoryStore::new("qa", "https://acme--qa.sandbox.my.salesforce.com");
        assert!(ensure_distinct(&a, &c).is_ok());
    }

    #[tokio::test]
    async fn ledger_scope_deletes_children_first_and_keeps_portal_records() {
        let dir = tempfile::tempdir().unwrap();
        let target = Arc::new(MemoryStore::new("qa", "https://qa"));
        let account = target.seed("Account", row(json!({"Name": "Acme"})));
        let portal = target.seed("Contact", row(json!({"LastName": "Portal", "AccountId": account})));
        let plain = target.seed("Contact", row(json!({"LastName": "Plain", "AccountId": account})));
        let unrelated = target.seed("Contact", row(json!({"LastName": "Manual"})));
        target.seed("User", row(json!({"ContactId": portal})));

        write_ledger(dir.path(), RecordKind::Account, &[entry("001S", &account)]).unwrap();
        write_ledger(
            dir.path(),
            RecordKind::Contact,
            &[entry("003S1", &portal), entry("003S2", &plain), entry("003S3", "003000000000999AAA")],
        )
        .unwrap();

        let dispatcher = Dispatcher::new(target.clone(), &BulkSettings::default());
        let report = DeletionGuard::new(target.as_ref(), &dispatcher, DeleteScope::Ledger, dir.path())
            .run()
            .await
            .unwrap();

        assert_eq!(report.total_deleted(), 1);
        assert!(target.record("Contact", &plain).is_none());
        assert!(target.record("Contact", &portal).is_some());
        assert!(target.record("Contact", &unrelated).is_some());
        assert!(target.record("Account", &account).is_some());
        assert_eq!(report.protected, 2);
        assert_eq!(report.retained[&RecordKind::Contact], vec![entry("003S1", &portal)]);
        assert_eq!(report.retained[&RecordKind::Account], vec![entry("001S", &account)]);
        assert!(report.issues.iter().all(|i| i.reason == IssueReason::PortalProtected));
    }

    #[tokio::test]
    async fn rerunning_against_a_clean_target_deletes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let target = Arc::new(MemoryStore::new("qa", "https://qa"));
        let account = target.seed("Account", row(json!({"Name": "Acme"})));
        write_ledger(dir.path(), RecordKind::Account, &[entry("001S", &account)]).unwrap();
        let dispatcher = Dispatcher::new(target.clone(), &BulkSettings::default());
        let guard = DeletionGuard::new(target.as_ref(), &dispatcher, DeleteScope::Ledger, dir.path());

        let first = guard.run().await.unwrap();
        assert_eq!(first.total_deleted(), 1);
        let writes = target.write_count();

        let second = guard.run().await.unwrap();
        assert_eq!(second.total_deleted(), 0);
        assert!(second.issues.is_empty());
        assert_eq!(target.write_count(), writes);
    }

    #[tokio::test]
    async fn all_scope_clears_every_record_of_each_kind() {
        let dir = tempfile::tempdir().unwrap();
        let target = Arc::new(MemoryStore::new("qa", "https://qa"));
        target.seed("Account", row(json!({"Name": "A"})));
        target.seed("Account", row(json!({"Name": "B"})));
        target.seed("Case", row(json!({"Subject": "C"})));
        let dispatcher = Dispatcher::new(target.clone(), &BulkSettings::default());

        let report = DeletionGuard::new(target.as_ref(), &dispatcher, DeleteScope::All, dir.path())
            .run()
            .await
            .unwrap();
        assert_eq!(report.deleted[&RecordKind::Account], 2);
        assert_eq!(report.deleted[&RecordKind::Case], 1);
        assert!(target.records("Account").is_empty());
    }

    #[tokio::test]
    async fn wholesale_delete_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let target = Arc::new(MemoryStore::new("qa", "https://qa"));
        target.seed("Case", row(json!({"Subject": "C"})));
        target.fail_jobs("delete", "Case");
        let dispatcher = Dispatcher::new(target.clone(), &BulkSettings::default());

        let err = DeletionGuard::new(target.as_ref(), &dispatcher, DeleteScope::All, dir.path())
            .run()
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 4);
    }
}
