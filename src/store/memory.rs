//! In-memory record store.
//!
//! Evaluates typed queries over plain tables and applies bulk writes with the
//! same validation a real org would enforce for this engine's purposes:
//! required references must be present and every reference must point at an
//! existing record. Used to run whole migrations in tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use super::{CreateOutcome, ObjectDescribe, Query, RecordStore, StoreError, WriteOutcome};
use crate::types::Row;

#[derive(Debug, Clone)]
struct RejectRule {
    object: String,
    field: String,
    value: Value,
    message: String,
}

#[derive(Default)]
struct Tables {
    rows: BTreeMap<String, BTreeMap<String, Row>>,
    describes: HashMap<String, ObjectDescribe>,
    next_id: u64,
    rejects: Vec<RejectRule>,
    failing_jobs: HashSet<(String, String)>,
    failing_queries: HashSet<String>,
}

pub struct MemoryStore {
    label: String,
    endpoint: String,
    tables: Mutex<Tables>,
    queries: AtomicUsize,
    writes: AtomicUsize,
}

fn id_prefix(object: &str) -> &'static str {
    match object {
        "Account" => "001",
        "Contact" => "003",
        "User" => "005",
        "Opportunity" => "006",
        "RecordType" => "012",
        "Organization" => "00D",
        "Product2" => "01t",
        "PricebookEntry" => "01u",
        "Quote" => "0Q0",
        "QuoteLineItem" => "0QL",
        "Case" => "500",
        "Order" => "801",
        "OrderItem" => "802",
        _ => "a00",
    }
}

impl MemoryStore {
    pub fn new(label: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            endpoint: endpoint.into(),
            tables: Mutex::new(Tables {
                next_id: 1,
                ..Tables::default()
            }),
            queries: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn with_describe(self, describe: ObjectDescribe) -> Self {
        self.tables
            .lock()
            .describes
            .insert(describe.name.clone(), describe);
        self
    }

    /// Seed a record directly, bypassing validation. Returns its id.
    pub fn seed(&self, object: &str, mut row: Row) -> String {
        let mut tables = self.tables.lock();
        let id = match row.get("Id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => {
                let id = next_id(&mut tables, object);
                row.insert("Id".to_string(), Value::String(id.clone()));
                id
            }
        };
        tables
            .rows
            .entry(object.to_string())
            .or_default()
            .insert(id.clone(), row);
        id
    }

    /// Make creates/updates of `object` fail per row when `field == value`.
    pub fn reject_when(&self, object: &str, field: &str, value: Value, message: &str) {
        self.tables.lock().rejects.push(RejectRule {
            object: object.to_string(),
            field: field.to_string(),
            value,
            message: message.to_string(),
        });
    }

    /// Make every `operation` job on `object` fail wholesale.
    pub fn fail_jobs(&self, operation: &str, object: &str) {
        self.tables
            .lock()
            .failing_jobs
            .insert((operation.to_string(), object.to_string()));
    }

    pub fn fail_queries(&self, object: &str) {
        self.tables.lock().failing_queries.insert(object.to_string());
    }

    pub fn records(&self, object: &str) -> Vec<Row> {
        self.tables
            .lock()
            .rows
            .get(object)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn record(&self, object: &str, id: &str) -> Option<Row> {
        self.tables
            .lock()
            .rows
            .get(object)
            .and_then(|t| t.get(id).cloned())
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    /// Number of bulk jobs submitted (create, update or delete).
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_job(&self, tables: &Tables, operation: &str, object: &str) -> Result<(), StoreError> {
        if tables
            .failing_jobs
            .contains(&(operation.to_string(), object.to_string()))
        {
            return Err(StoreError::JobFailed {
                job_id: format!("mem-{operation}-{object}"),
                state: "Failed".to_string(),
                message: "simulated job failure".to_string(),
            });
        }
        Ok(())
    }
}

fn next_id(tables: &mut Tables, object: &str) -> String {
    let n = tables.next_id;
    tables.next_id += 1;
    format!("{}{:012}AAA", id_prefix(object), n)
}

fn exists(tables: &Tables, id: &str) -> bool {
    tables.rows.values().any(|t| t.contains_key(id))
}

/// Per-row validation shared by create and update.
fn validate(tables: &Tables, object: &str, row: &Row, creating: bool) -> Result<(), String> {
    for rule in tables.rejects.iter().filter(|r| r.object == object) {
        if row.get(&rule.field) == Some(&rule.value) {
            return Err(rule.message.clone());
        }
    }
    let Some(describe) = tables.describes.get(object) else {
        return Ok(());
    };
    for field in &describe.fields {
        let value = row.get(&field.name).filter(|v| !v.is_null());
        if field.field_type == "reference" {
            if let Some(id) = value.and_then(Value::as_str) {
                if !exists(tables, id) {
                    return Err(format!(
                        "INVALID_CROSS_REFERENCE_KEY: {} points at missing record {}",
                        field.name, id
                    ));
                }
            }
            if creating
                && value.is_none()
                && field.createable
                && !field.nillable
                && !field.defaulted_on_create
            {
                return Err(format!("REQUIRED_FIELD_MISSING: {}", field.name));
            }
            if !creating && value.is_some() && !field.updateable {
                return Err(format!(
                    "INVALID_FIELD_FOR_INSERT_UPDATE: {} is not updateable",
                    field.name
                ));
            }
        }
    }
    Ok(())
}

fn compare(a: &Row, b: &Row, fields: &[String]) -> std::cmp::Ordering {
    for field in fields {
        let left = a.get(field).map(|v| v.to_string()).unwrap_or_default();
        let right = b.get(field).map(|v| v.to_string()).unwrap_or_default();
        match left.cmp(&right) {
            std::cmp::Ordering::Equal => continue,
            other => return other,
        }
    }
    std::cmp::Ordering::Equal
}

#[async_trait]
impl RecordStore for MemoryStore {
    fn label(&self) -> &str {
        &self.label
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn query(&self, query: &Query) -> Result<Vec<Row>, StoreError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let tables = self.tables.lock();
        if tables.failing_queries.contains(&query.object) {
            return Err(StoreError::Api {
                status: 500,
                message: format!("simulated failure querying {}", query.object),
            });
        }

        let mut matched: Vec<&Row> = tables
            .rows
            .get(&query.object)
            .map(|t| {
                t.values()
                    .filter(|row| query.filter.as_ref().map_or(true, |f| f.matches(row)))
                    .collect()
            })
            .unwrap_or_default();
        if !query.order_by.is_empty() {
            matched.sort_by(|a, b| compare(a, b, &query.order_by));
        }
        if let Some(limit) = query.limit {
            matched.truncate(limit);
        }

        Ok(matched
            .into_iter()
            .map(|row| {
                query
                    .fields
                    .iter()
                    .map(|f| (f.clone(), row.get(f).cloned().unwrap_or(Value::Null)))
                    .collect()
            })
            .collect())
    }

    async fn describe(&self, object: &str) -> Result<ObjectDescribe, StoreError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.tables
            .lock()
            .describes
            .get(object)
            .cloned()
            .ok_or_else(|| StoreError::Api {
                status: 404,
                message: format!("NOT_FOUND: The requested resource does not exist: {object}"),
            })
    }

    async fn bulk_create(
        &self,
        object: &str,
        rows: &[Row],
    ) -> Result<Vec<CreateOutcome>, StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut tables = self.tables.lock();
        self.check_job(&tables, "insert", object)?;

        let mut outcomes = Vec::with_capacity(rows.len());
        for (row_index, row) in rows.iter().enumerate() {
            if let Err(message) = validate(&tables, object, row, true) {
                outcomes.push(CreateOutcome {
                    row_index,
                    result: Err(message),
                });
                continue;
            }
            let id = next_id(&mut tables, object);
            let mut stored: Row = row
                .iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            stored.insert("Id".to_string(), Value::String(id.clone()));
            tables
                .rows
                .entry(object.to_string())
                .or_default()
                .insert(id.clone(), stored);
            outcomes.push(CreateOutcome {
                row_index,
                result: Ok(id),
            });
        }
        Ok(outcomes)
    }

    async fn bulk_update(&self, object: &str, rows: &[Row]) -> Result<Vec<WriteOutcome>, StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut tables = self.tables.lock();
        self.check_job(&tables, "update", object)?;

        let mut outcomes = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row
                .get("Id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let mut changes = row.clone();
            changes.remove("Id");
            let result = if !tables.rows.get(object).is_some_and(|t| t.contains_key(&id)) {
                Err(format!("ENTITY_IS_DELETED: {id}"))
            } else {
                validate(&tables, object, &changes, false)
            };
            if result.is_ok() {
                if let Some(existing) = tables.rows.get_mut(object).and_then(|t| t.get_mut(&id)) {
                    for (field, value) in changes {
                        if value.is_null() {
                            existing.remove(&field);
                        } else {
                            existing.insert(field, value);
                        }
                    }
                }
            }
            outcomes.push(WriteOutcome { id, result });
        }
        Ok(outcomes)
    }

    async fn bulk_delete(
        &self,
        object: &str,
        ids: &[String],
    ) -> Result<Vec<WriteOutcome>, StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut tables = self.tables.lock();
        self.check_job(&tables, "delete", object)?;

        let mut outcomes = Vec::with_capacity(ids.len());
        for id in ids {
            let removed = tables.rows.get_mut(object).and_then(|t| t.remove(id));
            let result = match removed {
                Some(_) => Ok(()),
                None => Err(format!("ENTITY_IS_DELETED: {id}")),
            };
            outcomes.push(WriteOutcome {
                id: id.clone(),
                result,
            });
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FieldDescribe, Filter};
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn contact_describe() -> ObjectDescribe {
        ObjectDescribe {
            name: "Contact".into(),
            fields: vec![FieldDescribe {
                name: "AccountId".into(),
                field_type: "reference".into(),
                reference_to: vec!["Account".into()],
                createable: true,
                updateable: true,
                nillable: false,
                ..FieldDescribe::default()
            }],
        }
    }

    #[tokio::test]
    async fn query_filters_orders_limits_and_projects() {
        let store = MemoryStore::new("src", "https://src");
        store.seed("Contact", row(json!({"Id": "003B", "AccountId": "001A", "LastName": "B"})));
        store.seed("Contact", row(json!({"Id": "003A", "AccountId": "001A", "LastName": "A"})));
        store.seed("Contact", row(json!({"Id": "003C", "AccountId": "001Z", "LastName": "C"})));

        let rows = store
            .query(
                &Query::select("Contact", ["Id", "Email"])
                    .filter(Filter::is_in("AccountId", ["001A"]))
                    .order_by("Id")
                    .limit(1),
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["Id"], "003A");
        assert_eq!(rows[0]["Email"], Value::Null);
        assert_eq!(store.query_count(), 1);
    }

    #[tokio::test]
    async fn creates_enforce_required_and_existing_references() {
        let store = MemoryStore::new("tgt", "https://tgt").with_describe(contact_describe());
        let account = store.seed("Account", row(json!({"Name": "Acme"})));

        let outcomes = store
            .bulk_create(
                "Contact",
                &[
                    row(json!({"LastName": "Ok", "AccountId": account})),
                    row(json!({"LastName": "Missing"})),
                    row(json!({"LastName": "Dangling", "AccountId": "001000000000999AAA"})),
                ],
            )
            .await
            .unwrap();
        assert!(outcomes[0].result.is_ok());
        assert!(outcomes[1].result.as_ref().unwrap_err().starts_with("REQUIRED_FIELD_MISSING"));
        assert!(outcomes[2].result.as_ref().unwrap_err().starts_with("INVALID_CROSS_REFERENCE_KEY"));
        assert_eq!(store.records("Contact").len(), 1);
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn updates_merge_and_deletes_report_missing_ids() {
        let store = MemoryStore::new("tgt", "https://tgt");
        let id = store.seed("Account", row(json!({"Name": "Acme", "Phone": "1"})));

        let updated = store
            .bulk_update("Account", &[row(json!({"Id": id, "Phone": "2"}))])
            .await
            .unwrap();
        assert!(updated[0].result.is_ok());
        assert_eq!(store.record("Account", &id).unwrap()["Phone"], "2");
        assert_eq!(store.record("Account", &id).unwrap()["Name"], "Acme");

        let deleted = store
            .bulk_delete("Account", &[id.clone(), id.clone()])
            .await
            .unwrap();
        assert!(deleted[0].result.is_ok());
        assert!(deleted[1].result.is_err());
    }

    #[tokio::test]
    async fn simulated_job_failure_is_wholesale() {
        let store = MemoryStore::new("tgt", "https://tgt");
        store.fail_jobs("insert", "Account");
        let err = store
            .bulk_create("Account", &[row(json!({"Name": "Acme"}))])
            .await
            .unwrap_err();
        assert!(err.is_job_failure());
        assert!(store.records("Account").is_empty());
    }
}
