//! Bulk API 2.0 ingest jobs.
//!
//! One call is one job: open, upload CSV, mark `UploadComplete`, poll until a
//! terminal state, then read the success and failure result sets. Bulk 2.0
//! results carry no row number, so created rows are matched back to their
//! submission index by the echoed column values.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};

use super::salesforce::SalesforceStore;
use super::{CreateOutcome, StoreError, WriteOutcome};
use crate::config::BulkSettings;
use crate::types::Row;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOperation {
    Insert,
    Update,
    Delete,
}

impl IngestOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            IngestOperation::Insert => "insert",
            IngestOperation::Update => "update",
            IngestOperation::Delete => "delete",
        }
    }
}

// =============================================================================
// Polling
// =============================================================================

/// Bounded exponential backoff between job-status checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub timeout: Duration,
}

impl PollPolicy {
    pub fn from_settings(settings: &BulkSettings) -> Self {
        Self {
            initial: Duration::from_millis(settings.poll_initial_ms),
            max: Duration::from_millis(settings.poll_max_ms),
            timeout: Duration::from_secs(settings.job_timeout_secs),
        }
    }

    pub fn next_interval(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max)
    }
}

// =============================================================================
// CSV encoding
// =============================================================================

/// A CSV upload plus the cells it was built from, kept for result matching.
#[derive(Debug, Clone)]
pub struct EncodedUpload {
    pub columns: Vec<String>,
    pub records: Vec<Vec<String>>,
    pub body: String,
}

/// Render one value as a Bulk API cell. Line breaks become spaces.
pub fn cell(value: &Value) -> String {
    let text = match value {
        Value::Null => return String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    };
    text.replace("\r\n", " ").replace(['\n', '\r'], " ")
}

/// Rough CSV size of a row, used to keep uploads under the byte cap.
pub fn estimated_row_bytes(row: &Row) -> usize {
    row.values().map(|v| cell(v).len() + 3).sum::<usize>() + 2
}

/// Header is the union of row fields in first-seen order; absent fields are
/// empty cells, which Bulk API leaves untouched.
pub fn encode_rows(rows: &[Row]) -> Result<EncodedUpload, StoreError> {
    let mut columns: Vec<String> = Vec::new();
    for row in rows {
        for key in row.keys() {
            if !columns.iter().any(|c| c == key) {
                columns.push(key.clone());
            }
        }
    }

    let records: Vec<Vec<String>> = rows
        .iter()
        .map(|row| {
            columns
                .iter()
                .map(|c| row.get(c).map(cell).unwrap_or_default())
                .collect()
        })
        .collect();

    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::CRLF)
        .from_writer(Vec::new());
    writer.write_record(&columns)?;
    for record in &records {
        writer.write_record(record)?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| StoreError::Io(e.into_error()))?;
    let body = String::from_utf8(bytes)
        .map_err(|e| StoreError::Unexpected(format!("non-UTF-8 CSV: {e}")))?;

    Ok(EncodedUpload {
        columns,
        records,
        body,
    })
}

// =============================================================================
// Results
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultRow {
    pub id: Option<String>,
    pub error: Option<String>,
    pub values: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct JobResults {
    pub succeeded: Vec<ResultRow>,
    pub failed: Vec<ResultRow>,
}

/// Parse a `successfulResults` / `failedResults` CSV body.
pub fn parse_results(text: &str) -> Result<Vec<ResultRow>, StoreError> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(text.as_bytes());
    let headers = reader.headers()?.clone();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let mut row = ResultRow::default();
        for (name, value) in headers.iter().zip(record.iter()) {
            match name {
                "sf__Id" => row.id = Some(value.to_string()).filter(|v| !v.is_empty()),
                "sf__Error" => row.error = Some(value.to_string()),
                "sf__Created" => {}
                _ => {
                    row.values.insert(name.to_string(), value.to_string());
                }
            }
        }
        rows.push(row);
    }
    Ok(rows)
}

fn row_key(columns: &[String], cells: impl Fn(&str) -> String) -> String {
    columns
        .iter()
        .map(|c| cells(c))
        .collect::<Vec<_>>()
        .join("\u{1f}")
}

/// Match create results to submission indices by their echoed cells.
pub fn correlate_creates(upload: &EncodedUpload, results: &JobResults) -> Vec<CreateOutcome> {
    let mut pending: HashMap<String, VecDeque<usize>> = HashMap::new();
    for (index, record) in upload.records.iter().enumerate() {
        let key = record.join("\u{1f}");
        pending.entry(key).or_default().push_back(index);
    }

    let mut outcomes = Vec::with_capacity(upload.records.len());
    let mut take = |row: &ResultRow, result: Result<String, String>| {
        let key = row_key(&upload.columns, |c| {
            row.values.get(c).cloned().unwrap_or_default()
        });
        match pending.get_mut(&key).and_then(VecDeque::pop_front) {
            Some(row_index) => outcomes.push(CreateOutcome { row_index, result }),
            None => log::warn!("Bulk result row did not match any submitted row"),
        }
    };

    for row in &results.succeeded {
        let result = row
            .id
            .clone()
            .ok_or_else(|| "created without an id".to_string());
        take(row, result);
    }
    for row in &results.failed {
        let error = row
            .error
            .clone()
            .unwrap_or_else(|| "unknown error".to_string());
        take(row, Err(error));
    }

    for row_index in pending.into_values().flatten() {
        outcomes.push(CreateOutcome {
            row_index,
            result: Err("row was not processed by the bulk job".to_string()),
        });
    }
    outcomes.sort_by_key(|o| o.row_index);
    outcomes
}

/// Update and delete results are keyed by the `Id` column.
pub fn correlate_writes(upload: &EncodedUpload, results: &JobResults) -> Vec<WriteOutcome> {
    let id_column = upload.columns.iter().position(|c| c == "Id");
    let mut remaining: Vec<String> = match id_column {
        Some(pos) => upload.records.iter().map(|r| r[pos].clone()).collect(),
        None => Vec::new(),
    };

    let mut outcomes = Vec::new();
    let mut settle = |row: &ResultRow, result: Result<(), String>| {
        let id = row
            .values
            .get("Id")
            .filter(|v| !v.is_empty())
            .cloned()
            .or_else(|| row.id.clone());
        if let Some(id) = id {
            if let Some(pos) = remaining.iter().position(|r| *r == id) {
                remaining.swap_remove(pos);
            }
            outcomes.push(WriteOutcome { id, result });
        }
    };

    for row in &results.succeeded {
        settle(row, Ok(()));
    }
    for row in &results.failed {
        let error = row
            .error
            .clone()
            .unwrap_or_else(|| "unknown error".to_string());
        settle(row, Err(error));
    }

    outcomes.extend(remaining.into_iter().map(|id| WriteOutcome {
        id,
        result: Err("row was not processed by the bulk job".to_string()),
    }));
    outcomes
}

// =============================================================================
// Job lifecycle
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobInfo {
    id: String,
    state: String,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    number_records_processed: Option<u64>,
    #[serde(default)]
    number_records_failed: Option<u64>,
}

pub(super) async fn run_ingest_job(
    store: &SalesforceStore,
    object: &str,
    operation: IngestOperation,
    upload: &EncodedUpload,
) -> Result<JobResults, StoreError> {
    let base = format!("{}/jobs/ingest", store.data_url());
    let job: JobInfo = store
        .send(store.request(Method::POST, &base).json(&json!({
            "object": object,
            "operation": operation.as_str(),
            "contentType": "CSV",
            "lineEnding": "CRLF",
        })))
        .await?
        .json()
        .await?;
    log::info!(
        "Bulk {} job {} opened for {} ({} rows)",
        operation.as_str(),
        job.id,
        object,
        upload.records.len()
    );

    let job_url = format!("{}/{}", base, job.id);
    store
        .send(
            store
                .request(Method::PUT, &format!("{}/batches", job_url))
                .header(reqwest::header::CONTENT_TYPE, "text/csv")
                .body(upload.body.clone()),
        )
        .await?;
    store
        .send(
            store
                .request(Method::PATCH, &job_url)
                .json(&json!({ "state": "UploadComplete" })),
        )
        .await?;

    let info = wait_for_job(store, &job_url, &job.id).await?;
    log::info!(
        "Bulk job {} complete: {} processed, {} failed",
        info.id,
        info.number_records_processed.unwrap_or(0),
        info.number_records_failed.unwrap_or(0)
    );

    let succeeded = fetch_results(store, &format!("{}/successfulResults/", job_url)).await?;
    let failed = fetch_results(store, &format!("{}/failedResults/", job_url)).await?;
    Ok(JobResults { succeeded, failed })
}

async fn fetch_results(store: &SalesforceStore, url: &str) -> Result<Vec<ResultRow>, StoreError> {
    let text = store
        .send(store.request(Method::GET, url))
        .await?
        .text()
        .await?;
    parse_results(&text)
}

async fn wait_for_job(
    store: &SalesforceStore,
    job_url: &str,
    job_id: &str,
) -> Result<JobInfo, StoreError> {
    let policy = store.poll;
    let started = Instant::now();
    let mut interval = policy.initial;

    loop {
        let info: JobInfo = store
            .send(store.request(Method::GET, job_url))
            .await?
            .json()
            .await?;
        match info.state.as_str() {
            "JobComplete" => return Ok(info),
            "Failed" | "Aborted" => {
                return Err(StoreError::JobFailed {
                    job_id: job_id.to_string(),
                    state: info.state,
                    message: info.error_message.unwrap_or_default(),
                })
            }
            _ => {}
        }

        let elapsed = started.elapsed();
        if elapsed >= policy.timeout {
            abort_job(store, job_url, job_id).await;
            return Err(StoreError::JobTimeout {
                job_id: job_id.to_string(),
                seconds: policy.timeout.as_secs(),
            });
        }
        log::debug!("Bulk job {} is {}; next check in {:?}", job_id, info.state, interval);
        tokio::time::sleep(interval.min(policy.timeout - elapsed)).await;
        interval = policy.next_interval(interval);
    }
}

async fn abort_job(store: &SalesforceStore, job_url: &str, job_id: &str) {
    let request = store
        .request(Method::PATCH, job_url)
        .json(&json!({ "state": "Aborted" }));
    if let Err(e) = store.send(request).await {
        log::warn!("Could not abort timed-out bulk job {}: {}", job_id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{OrgSession, RecordStore};
    use wiremock::matchers::{body_string, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn rows(values: Vec<Value>) -> Vec<Row> {
        values
            .into_iter()
            .map(|v| v.as_object().cloned().unwrap())
            .collect()
    }

    #[test]
    fn encode_uses_crlf_union_header_and_flattens_newlines() {
        let upload = encode_rows(&rows(vec![
            json!({"Name": "Acme", "Description": "line one\nline two"}),
            json!({"Name": "Globex", "Phone": "555", "Active__c": true}),
        ]))
        .unwrap();
        assert_eq!(upload.columns, vec!["Name", "Description", "Phone", "Active__c"]);
        assert_eq!(
            upload.body,
            "Name,Description,Phone,Active__c\r\nAcme,line one line two,,\r\nGlobex,,555,true\r\n"
        );
    }

    #[test]
    fn poll_interval_doubles_up_to_max() {
        let policy = PollPolicy {
            initial: Duration::from_millis(500),
            max: Duration::from_millis(1500),
            timeout: Duration::from_secs(10),
        };
        assert_eq!(policy.next_interval(policy.initial), Duration::from_millis(1000));
        assert_eq!(
            policy.next_interval(Duration::from_millis(1000)),
            Duration::from_millis(1500)
        );
    }

    #[test]
    fn creates_are_matched_back_to_submission_order() {
        let upload = encode_rows(&rows(vec![
            json!({"LastName": "Ng"}),
            json!({"LastName": "Ortiz"}),
            json!({"LastName": "Ng"}),
        ]))
        .unwrap();
        let results = JobResults {
            succeeded: parse_results(
                "\"sf__Id\",\"sf__Created\",LastName\n003B,true,Ortiz\n003A,true,Ng\n",
            )
            .unwrap(),
            failed: parse_results("\"sf__Id\",\"sf__Error\",LastName\n,DUPLICATES_DETECTED:dupe,Ng\n")
                .unwrap(),
        };

        let outcomes = correlate_creates(&upload, &results);
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].result, Ok("003A".to_string()));
        assert_eq!(outcomes[1].result, Ok("003B".to_string()));
        assert_eq!(
            outcomes[2].result,
            Err("DUPLICATES_DETECTED:dupe".to_string())
        );
    }

    #[test]
    fn unreported_rows_become_failures() {
        let upload = encode_rows(&rows(vec![
            json!({"Id": "001A", "ParentId": "001B"}),
            json!({"Id": "001C", "ParentId": "001B"}),
        ]))
        .unwrap();
        let results = JobResults {
            succeeded: parse_results("sf__Id,sf__Created,Id,ParentId\n001A,false,001A,001B\n").unwrap(),
            failed: Vec::new(),
        };
        let outcomes = correlate_writes(&upload, &results);
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().any(|o| o.id == "001A" && o.result.is_ok()));
        assert!(outcomes.iter().any(|o| o.id == "001C" && o.result.is_err()));
    }

    fn store_for(server: &MockServer, timeout_secs: u64) -> SalesforceStore {
        let session = OrgSession {
            alias: "qa".into(),
            instance_url: server.uri(),
            access_token: "token".into(),
            api_version: "60.0".into(),
        };
        let settings = BulkSettings {
            poll_initial_ms: 5,
            poll_max_ms: 10,
            job_timeout_secs: timeout_secs,
            ..BulkSettings::default()
        };
        SalesforceStore::new(session, &settings).unwrap()
    }

    async fn mount_job_shell(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/services/data/v60.0/jobs/ingest"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"id": "750J", "state": "Open"})),
            )
            .mount(server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/services/data/v60.0/jobs/ingest/750J/batches"))
            .and(body_string("LastName\r\nNg\r\nOrtiz\r\n"))
            .respond_with(ResponseTemplate::new(201))
            .mount(server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/services/data/v60.0/jobs/ingest/750J"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"id": "750J", "state": "UploadComplete"}),
            ))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn bulk_create_runs_full_job_lifecycle() {
        let server = MockServer::start().await;
        mount_job_shell(&server).await;
        Mock::given(method("GET"))
            .and(path("/services/data/v60.0/jobs/ingest/750J"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"id": "750J", "state": "InProgress"})),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/services/data/v60.0/jobs/ingest/750J"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "750J",
                "state": "JobComplete",
                "numberRecordsProcessed": 2,
                "numberRecordsFailed": 1
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/services/data/v60.0/jobs/ingest/750J/successfulResults/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("\"sf__Id\",\"sf__Created\",\"LastName\"\n\"003N\",\"true\",\"Ng\"\n"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/services/data/v60.0/jobs/ingest/750J/failedResults/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "\"sf__Id\",\"sf__Error\",\"LastName\"\n\"\",\"REQUIRED_FIELD_MISSING:AccountId\",\"Ortiz\"\n",
            ))
            .mount(&server)
            .await;

        let store = store_for(&server, 30);
        let outcomes = store
            .bulk_create("Contact", &rows(vec![json!({"LastName": "Ng"}), json!({"LastName": "Ortiz"})]))
            .await
            .unwrap();
        assert_eq!(outcomes[0].result, Ok("003N".to_string()));
        assert!(outcomes[1].result.as_ref().unwrap_err().starts_with("REQUIRED_FIELD_MISSING"));
    }

    #[tokio::test]
    async fn failed_job_is_a_job_failure() {
        let server = MockServer::start().await;
        mount_job_shell(&server).await;
        Mock::given(method("GET"))
            .and(path("/services/data/v60.0/jobs/ingest/750J"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "750J",
                "state": "Failed",
                "errorMessage": "InvalidBatch : Field name not found : Foo__c"
            })))
            .mount(&server)
            .await;

        let err = store_for(&server, 30)
            .bulk_create("Contact", &rows(vec![json!({"LastName": "Ng"}), json!({"LastName": "Ortiz"})]))
            .await
            .unwrap_err();
        assert!(err.is_job_failure());
        assert!(err.to_string().contains("Foo__c"));
    }

    #[tokio::test]
    async fn job_that_never_finishes_times_out() {
        let server = MockServer::start().await;
        mount_job_shell(&server).await;
        Mock::given(method("GET"))
            .and(path("/services/data/v60.0/jobs/ingest/750J"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"id": "750J", "state": "InProgress"})),
            )
            .mount(&server)
            .await;

        let mut store = store_for(&server, 1);
        store.poll.timeout = Duration::from_millis(40);
        let err = store
            .bulk_create("Contact", &rows(vec![json!({"LastName": "Ng"}), json!({"LastName": "Ortiz"})]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::JobTimeout { .. }));
    }
}
