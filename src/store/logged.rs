//! Query-log decorator for any [`RecordStore`].

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use super::{CreateOutcome, ObjectDescribe, Query, RecordStore, StoreError, WriteOutcome};
use crate::audit::{QueryLog, QueryLogEntry};
use crate::types::Row;

pub struct LoggedStore {
    inner: Arc<dyn RecordStore>,
    log: Arc<QueryLog>,
}

impl LoggedStore {
    pub fn new(inner: Arc<dyn RecordStore>, log: Arc<QueryLog>) -> Self {
        Self { inner, log }
    }

    fn record<T>(
        &self,
        operation: &str,
        object: &str,
        detail: String,
        rows: usize,
        started: Instant,
        result: &Result<T, StoreError>,
    ) {
        let outcome = match result {
            Ok(_) => "ok".to_string(),
            Err(e) => format!("error: {}", e),
        };
        self.log.record(QueryLogEntry {
            timestamp: String::new(),
            store: self.inner.label().to_string(),
            operation: operation.to_string(),
            object: object.to_string(),
            detail,
            rows,
            elapsed_ms: started.elapsed().as_millis(),
            outcome,
        });
    }
}

fn failures<T>(outcomes: &[T], failed: impl Fn(&T) -> bool) -> String {
    let count = outcomes.iter().filter(|o| failed(o)).count();
    if count == 0 {
        String::new()
    } else {
        format!("{} row failure(s)", count)
    }
}

#[async_trait]
impl RecordStore for LoggedStore {
    fn label(&self) -> &str {
        self.inner.label()
    }

    fn endpoint(&self) -> &str {
        self.inner.endpoint()
    }

    async fn query(&self, query: &Query) -> Result<Vec<Row>, StoreError> {
        let started = Instant::now();
        let result = self.inner.query(query).await;
        let rows = result.as_ref().map(Vec::len).unwrap_or(0);
        self.record("query", &query.object, query.to_soql(), rows, started, &result);
        result
    }

    async fn describe(&self, object: &str) -> Result<ObjectDescribe, StoreError> {
        let started = Instant::now();
        let result = self.inner.describe(object).await;
        let rows = result.as_ref().map(|d| d.fields.len()).unwrap_or(0);
        self.record("describe", object, String::new(), rows, started, &result);
        result
    }

    async fn bulk_create(
        &self,
        object: &str,
        rows: &[Row],
    ) -> Result<Vec<CreateOutcome>, StoreError> {
        let started = Instant::now();
        let result = self.inner.bulk_create(object, rows).await;
        let detail = result
            .as_ref()
            .map(|o| failures(o, |c| c.result.is_err()))
            .unwrap_or_default();
        self.record("bulk_create", object, detail, rows.len(), started, &result);
        result
    }

    async fn bulk_update(&self, object: &str, rows: &[Row]) -> Result<Vec<WriteOutcome>, StoreError> {
        let started = Instant::now();
        let result = self.inner.bulk_update(object, rows).await;
        let detail = result
            .as_ref()
            .map(|o| failures(o, |w| w.result.is_err()))
            .unwrap_or_default();
        self.record("bulk_update", object, detail, rows.len(), started, &result);
        result
    }

    async fn bulk_delete(
        &self,
        object: &str,
        ids: &[String],
    ) -> Result<Vec<WriteOutcome>, StoreError> {
        let started = Instant::now();
        let result = self.inner.bulk_delete(object, ids).await;
        let detail = result
            .as_ref()
            .map(|o| failures(o, |w| w.result.is_err()))
            .unwrap_or_default();
        self.record("bulk_delete", object, detail, ids.len(), started, &result);
        result
    }
}
