//! Salesforce REST client.
//!
//! Queries page through `nextRecordsUrl`; bulk writes go through Bulk API 2.0
//! ingest jobs (see [`super::bulk`]). Transient HTTP failures are retried with
//! exponential backoff; an expired session is surfaced as `AuthExpired`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use url::Url;

use super::bulk::{self, IngestOperation, PollPolicy};
use super::{
    CreateOutcome, ObjectDescribe, OrgSession, Query, RecordStore, StoreError, WriteOutcome,
};
use crate::config::BulkSettings;
use crate::types::Row;

// =============================================================================
// Retry
// =============================================================================

/// Error codes Salesforce returns for conditions that clear on their own:
/// org-wide concurrency limits, record lock contention, and instance
/// maintenance.
const TRANSIENT_ERROR_CODES: &[&str] = &[
    "REQUEST_LIMIT_EXCEEDED",
    "UNABLE_TO_LOCK_ROW",
    "SERVER_UNAVAILABLE",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &BulkSettings) -> Self {
        Self {
            max_attempts: settings.max_retries.saturating_add(1),
            initial_backoff: Duration::from_millis(settings.retry_initial_ms),
            max_backoff: Duration::from_millis(settings.retry_max_ms),
        }
    }

    /// Delay before attempt `attempt + 1`. A server-supplied `Retry-After`
    /// wins but never exceeds `max_backoff`.
    pub fn delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(wait) = retry_after {
            return wait.min(self.max_backoff);
        }
        let base = self
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .min(self.max_backoff);
        let spread = (base.as_millis() as u64 / 4).max(1);
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| u64::from(d.subsec_nanos()))
            .unwrap_or(0);
        base + Duration::from_millis(nanos % spread)
    }
}

/// Whether a failed reply is worth repeating, judged by status and the
/// `errorCode`s in its body.
pub fn is_transient(status: StatusCode, error_codes: &[&str]) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
        || error_codes.iter().any(|c| TRANSIENT_ERROR_CODES.contains(c))
}

fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    error_code: String,
}

/// A non-2xx reply, read once so it can be both classified and reported.
struct FailedReply {
    status: StatusCode,
    retry_after: Option<Duration>,
    errors: Vec<ApiErrorBody>,
    text: String,
}

impl FailedReply {
    async fn read(response: reqwest::Response) -> Self {
        let status = response.status();
        let retry_after = retry_after(response.headers());
        let text = response.text().await.unwrap_or_default();
        let errors = serde_json::from_str(&text).unwrap_or_default();
        Self {
            status,
            retry_after,
            errors,
            text,
        }
    }

    fn codes(&self) -> Vec<&str> {
        self.errors.iter().map(|e| e.error_code.as_str()).collect()
    }

    fn is_auth_lapse(&self) -> bool {
        self.status == StatusCode::UNAUTHORIZED || self.codes().contains(&"INVALID_SESSION_ID")
    }

    fn into_error(self, alias: &str) -> StoreError {
        if self.is_auth_lapse() {
            return StoreError::AuthExpired(alias.to_string());
        }
        let message = if self.errors.is_empty() {
            self.text
        } else {
            self.errors
                .iter()
                .map(|e| format!("{}: {}", e.error_code, e.message))
                .collect::<Vec<_>>()
                .join("; ")
        };
        StoreError::Api {
            status: self.status.as_u16(),
            message,
        }
    }
}

// =============================================================================
// Client
// =============================================================================

pub struct SalesforceStore {
    session: OrgSession,
    http: reqwest::Client,
    retry: RetryPolicy,
    pub(super) poll: PollPolicy,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryPage {
    #[serde(default)]
    records: Vec<Row>,
    #[serde(default)]
    done: bool,
    next_records_url: Option<String>,
}

impl SalesforceStore {
    pub fn new(session: OrgSession, settings: &BulkSettings) -> Result<Self, StoreError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            session,
            http,
            retry: RetryPolicy::from_settings(settings),
            poll: PollPolicy::from_settings(settings),
        })
    }

    pub(super) fn data_url(&self) -> String {
        self.session.data_url()
    }

    fn instance_url(&self) -> &str {
        self.session.instance_url.trim_end_matches('/')
    }

    pub(super) fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .bearer_auth(&self.session.access_token)
    }

    /// Send with retry and turn non-2xx replies into typed errors.
    ///
    /// Transient replies and connect or timeout failures are repeated up to
    /// the policy's attempt limit. An expired session is never repeated.
    pub(super) async fn send(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, StoreError> {
        let attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let Some(cloned) = request.try_clone() else {
                let response = request.send().await?;
                return self.accept(response).await;
            };
            let last = attempt >= attempts;

            let wait = match cloned.send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let reply = FailedReply::read(response).await;
                    if last || reply.is_auth_lapse() || !is_transient(reply.status, &reply.codes()) {
                        return Err(reply.into_error(&self.session.alias));
                    }
                    let wait = self.retry.delay(attempt, reply.retry_after);
                    log::warn!(
                        "{}: attempt {}/{} got {} {:?}; retrying in {:?}",
                        self.session.alias,
                        attempt,
                        attempts,
                        reply.status,
                        reply.codes(),
                        wait
                    );
                    wait
                }
                Err(err) if !last && (err.is_timeout() || err.is_connect()) => {
                    let wait = self.retry.delay(attempt, None);
                    log::warn!(
                        "{}: attempt {}/{} failed in transport ({}); retrying in {:?}",
                        self.session.alias,
                        attempt,
                        attempts,
                        err,
                        wait
                    );
                    wait
                }
                Err(err) => return Err(StoreError::Http(err)),
            };
            tokio::time::sleep(wait).await;
            attempt += 1;
        }
    }

    async fn accept(&self, response: reqwest::Response) -> Result<reqwest::Response, StoreError> {
        if response.status().is_success() {
            return Ok(response);
        }
        Err(FailedReply::read(response).await.into_error(&self.session.alias))
    }
}

#[async_trait]
impl RecordStore for SalesforceStore {
    fn label(&self) -> &str {
        &self.session.alias
    }

    fn endpoint(&self) -> &str {
        self.instance_url()
    }

    async fn query(&self, query: &Query) -> Result<Vec<Row>, StoreError> {
        let soql = query.to_soql();
        let first = format!("{}/query", self.data_url());
        let mut page: QueryPage = self
            .send(self.request(reqwest::Method::GET, &first).query(&[("q", soql.as_str())]))
            .await?
            .json()
            .await?;

        let mut rows = Vec::new();
        loop {
            rows.extend(page.records.drain(..).map(strip_attributes));
            match page.next_records_url.take() {
                Some(next) if !page.done => {
                    let url = Url::parse(self.instance_url())?.join(&next)?;
                    page = self
                        .send(self.request(reqwest::Method::GET, url.as_str()))
                        .await?
                        .json()
                        .await?;
                }
                _ => break,
            }
        }
        Ok(rows)
    }

    async fn describe(&self, object: &str) -> Result<ObjectDescribe, StoreError> {
        let url = format!("{}/sobjects/{}/describe", self.data_url(), object);
        Ok(self
            .send(self.request(reqwest::Method::GET, &url))
            .await?
            .json()
            .await?)
    }

    async fn bulk_create(
        &self,
        object: &str,
        rows: &[Row],
    ) -> Result<Vec<CreateOutcome>, StoreError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let upload = bulk::encode_rows(rows)?;
        let results = bulk::run_ingest_job(self, object, IngestOperation::Insert, &upload).await?;
        Ok(bulk::correlate_creates(&upload, &results))
    }

    async fn bulk_update(&self, object: &str, rows: &[Row]) -> Result<Vec<WriteOutcome>, StoreError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let upload = bulk::encode_rows(rows)?;
        let results = bulk::run_ingest_job(self, object, IngestOperation::Update, &upload).await?;
        Ok(bulk::correlate_writes(&upload, &results))
    }

    async fn bulk_delete(
        &self,
        object: &str,
        ids: &[String],
    ) -> Result<Vec<WriteOutcome>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<Row> = ids
            .iter()
            .map(|id| {
                let mut row = Row::new();
                row.insert("Id".to_string(), Value::String(id.clone()));
                row
            })
            .collect();
        let upload = bulk::encode_rows(&rows)?;
        let results = bulk::run_ingest_job(self, object, IngestOperation::Delete, &upload).await?;
        Ok(bulk::correlate_writes(&upload, &results))
    }
}

fn strip_attributes(mut row: Row) -> Row {
    row.remove("attributes");
    row
}
