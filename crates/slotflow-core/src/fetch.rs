//! Bounded-concurrency fetch-and-normalize pool.
//!
//! One batch fans out over up to `workers` concurrent tasks. Each task
//! downloads a file and normalizes it; any single task's failure is
//! collected and never cancels its siblings. The stream collect acts as
//! the join barrier: no merge starts until every fetch in the batch is
//! done. Network reads only, no writes.

use futures::{stream, StreamExt};
use tracing::debug;

use slotflow_drive::RemoteStore;

use crate::error::PipelineError;
use crate::normalize::{normalize_csv, CanonicalRow};
use crate::registry::SchemaRegistry;
use crate::retry::{retry, RetryPolicy};
use crate::schedule::PlannedFile;

#[derive(Debug)]
pub struct FetchedFile {
    pub planned: PlannedFile,
    pub rows: Vec<CanonicalRow>,
}

#[derive(Debug)]
pub struct FetchFailure {
    pub planned: PlannedFile,
    pub error: PipelineError,
}

#[derive(Debug, Default)]
pub struct FetchBatchOutcome {
    pub fetched: Vec<FetchedFile>,
    pub failures: Vec<FetchFailure>,
}

pub async fn fetch_batch(
    remote: &dyn RemoteStore,
    registry: &SchemaRegistry,
    batch: Vec<PlannedFile>,
    workers: usize,
    policy: RetryPolicy,
) -> FetchBatchOutcome {
    let results: Vec<Result<FetchedFile, FetchFailure>> = stream::iter(batch)
        .map(|planned| async move {
            match fetch_one(remote, registry, &planned, policy).await {
                Ok(rows) => Ok(FetchedFile { planned, rows }),
                Err(error) => Err(FetchFailure { planned, error }),
            }
        })
        .buffer_unordered(workers.max(1))
        .collect()
        .await;

    let mut outcome = FetchBatchOutcome::default();
    for result in results {
        match result {
            Ok(fetched) => outcome.fetched.push(fetched),
            Err(failure) => outcome.failures.push(failure),
        }
    }
    debug!(
        fetched = outcome.fetched.len(),
        failed = outcome.failures.len(),
        "batch fetch complete"
    );
    outcome
}

async fn fetch_one(
    remote: &dyn RemoteStore,
    registry: &SchemaRegistry,
    planned: &PlannedFile,
    policy: RetryPolicy,
) -> Result<Vec<CanonicalRow>, PipelineError> {
    let schema = registry.get(&planned.meta.group_key)?;

    let file_id = planned.descriptor.id.clone();
    let bytes = retry(policy, "file download", || {
        let id = file_id.clone();
        async move { remote.download(&id).await }
    })
    .await
    .map_err(|err| PipelineError::Download {
        file_id: planned.descriptor.id.clone(),
        message: err.to_string(),
    })?;

    normalize_csv(&bytes, schema).map_err(|err| PipelineError::Normalize {
        path: planned.descriptor.path.clone(),
        message: err.to_string(),
    })
}
