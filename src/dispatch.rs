//! Bulk batching.
//!
//! Rows for one kind are split into batches bounded by row count and encoded
//! size, then submitted as concurrent bulk jobs up to a worker limit. Results
//! come back with global row indices; applying them is left to the caller so
//! that a single task owns the identifier map.

use std::future::Future;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::BulkSettings;
use crate::store::bulk::estimated_row_bytes;
use crate::store::{CreateOutcome, RecordStore, StoreError, WriteOutcome};
use crate::types::{RecordKind, Row};

/// A bulk job that failed as a whole.
#[derive(Debug)]
pub struct BatchFailure {
    pub kind: RecordKind,
    pub operation: &'static str,
    pub batch: usize,
    pub error: StoreError,
}

#[derive(Debug)]
pub struct Dispatched<T> {
    pub outcomes: Vec<T>,
    pub failure: Option<BatchFailure>,
}

/// Contiguous ranges of `sizes`, each within `max_rows` items and `max_bytes`.
/// A single oversized item still gets a batch of its own.
pub fn plan_batches(sizes: &[usize], max_rows: usize, max_bytes: usize) -> Vec<Range<usize>> {
    let max_rows = max_rows.max(1);
    let mut ranges = Vec::new();
    let mut start = 0;
    let mut bytes = 0;
    for (i, size) in sizes.iter().enumerate() {
        let count = i - start;
        if count > 0 && (count >= max_rows || bytes + size > max_bytes) {
            ranges.push(start..i);
            start = i;
            bytes = 0;
        }
        bytes += size;
    }
    if start < sizes.len() {
        ranges.push(start..sizes.len());
    }
    ranges
}

fn split<I>(items: Vec<I>, ranges: &[Range<usize>]) -> Vec<Vec<I>> {
    let mut items = items.into_iter();
    ranges
        .iter()
        .map(|r| items.by_ref().take(r.len()).collect())
        .collect()
}

#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn RecordStore>,
    max_rows: usize,
    max_bytes: usize,
    workers: usize,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn RecordStore>, settings: &BulkSettings) -> Self {
        Self {
            store,
            max_rows: settings.batch_size,
            max_bytes: settings.max_batch_bytes,
            workers: settings.max_concurrent_jobs.max(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub async fn create(&self, kind: RecordKind, rows: Vec<Row>) -> Dispatched<CreateOutcome> {
        let sizes: Vec<usize> = rows.iter().map(estimated_row_bytes).collect();
        let ranges = plan_batches(&sizes, self.max_rows, self.max_bytes);
        let starts: Vec<usize> = ranges.iter().map(|r| r.start).collect();
        let batches = split(rows, &ranges);

        let (done, failure) = self
            .run(kind, "create", batches, |store, object, rows: Vec<Row>| async move {
                store.bulk_create(object, &rows).await
            })
            .await;

        let outcomes = done
            .into_iter()
            .flat_map(|(batch, outcomes)| {
                let offset = starts[batch];
                outcomes.into_iter().map(move |o| CreateOutcome {
                    row_index: o.row_index + offset,
                    result: o.result,
                })
            })
            .collect();
        Dispatched { outcomes, failure }
    }

    pub async fn update(&self, kind: RecordKind, rows: Vec<Row>) -> Dispatched<WriteOutcome> {
        let sizes: Vec<usize> = rows.iter().map(estimated_row_bytes).collect();
        let ranges = plan_batches(&sizes, self.max_rows, self.max_bytes);
        let batches = split(rows, &ranges);

        let (done, failure) = self
            .run(kind, "update", batches, |store, object, rows: Vec<Row>| async move {
                store.bulk_update(object, &rows).await
            })
            .await;
        Dispatched {
            outcomes: done.into_iter().flat_map(|(_, o)| o).collect(),
            failure,
        }
    }

    pub async fn delete(&self, kind: RecordKind, ids: Vec<String>) -> Dispatched<WriteOutcome> {
        let sizes: Vec<usize> = ids.iter().map(|id| id.len() + 2).collect();
        let ranges = plan_batches(&sizes, self.max_rows, self.max_bytes);
        let batches = split(ids, &ranges);

        let (done, failure) = self
            .run(kind, "delete", batches, |store, object, ids: Vec<String>| async move {
                store.bulk_delete(object, &ids).await
            })
            .await;
        Dispatched {
            outcomes: done.into_iter().flat_map(|(_, o)| o).collect(),
            failure,
        }
    }

    /// Once a batch fails, batches not yet started are skipped; batches
    /// already in flight finish and their outcomes are kept.
    async fn run<I, T, F, Fut>(
        &self,
        kind: RecordKind,
        operation: &'static str,
        batches: Vec<Vec<I>>,
        call: F,
    ) -> (Vec<(usize, Vec<T>)>, Option<BatchFailure>)
    where
        I: Send + 'static,
        T: Send + 'static,
        F: Fn(Arc<dyn RecordStore>, &'static str, Vec<I>) -> Fut + Copy + Send + 'static,
        Fut: Future<Output = Result<Vec<T>, StoreError>> + Send + 'static,
    {
        let total = batches.len();
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut set = JoinSet::new();

        for (index, batch) in batches.into_iter().enumerate() {
            let store = self.store.clone();
            let semaphore = semaphore.clone();
            let cancelled = cancelled.clone();
            set.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (index, None);
                };
                if cancelled.load(Ordering::SeqCst) {
                    return (index, None);
                }
                log::info!(
                    "{} {} batch {}/{} ({} rows)",
                    kind,
                    operation,
                    index + 1,
                    total,
                    batch.len()
                );
                let result = call(store, kind.api_name(), batch).await;
                if result.is_err() {
                    cancelled.store(true, Ordering::SeqCst);
                }
                (index, Some(result))
            });
        }

        let mut done = Vec::with_capacity(total);
        let mut failure: Option<BatchFailure> = None;
        while let Some(joined) = set.join_next().await {
            let (batch, error) = match joined {
                Ok((index, Some(Ok(outcomes)))) => {
                    done.push((index, outcomes));
                    continue;
                }
                Ok((_, None)) => continue,
                Ok((index, Some(Err(error)))) => (index, error),
                Err(join_error) => (
                    usize::MAX,
                    StoreError::Unexpected(format!("batch task failed: {join_error}")),
                ),
            };
            log::error!("{} {} batch {} failed: {}", kind, operation, batch.saturating_add(1), error);
            if failure.as_ref().map_or(true, |f| batch < f.batch) {
                failure = Some(BatchFailure {
                    kind,
                    operation,
                    batch,
                    error,
                });
            }
        }
        done.sort_by_key(|(index, _)| *index);
        (done, failure)
    }
}
