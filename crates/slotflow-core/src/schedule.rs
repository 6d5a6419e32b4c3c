//! Batch planning over the delta set.
//!
//! The delta is sorted by snapshot date ascending before slicing so that
//! when two files touch the same destination key, the later snapshot is
//! merged later and wins the conflict. The scheduler holds no state;
//! resumability falls out of the ledger diff on the next run.

use crate::metadata::ParsedMeta;
use crate::scanner::FileDescriptor;

/// A delta file together with its parsed path metadata.
#[derive(Debug, Clone)]
pub struct PlannedFile {
    pub descriptor: FileDescriptor,
    pub meta: ParsedMeta,
}

#[derive(Debug, Default)]
pub struct BatchPlan {
    pub batches: Vec<Vec<PlannedFile>>,
    /// Chunks beyond `max_batches` that this invocation will not run.
    pub pending_batches: usize,
}

/// Partition the delta set into date-ordered chunks of at most
/// `max_files_per_batch` files, exposing at most `max_batches` of them
/// (zero means no cap).
pub fn plan_batches(
    mut delta: Vec<PlannedFile>,
    max_files_per_batch: usize,
    max_batches: usize,
) -> BatchPlan {
    if delta.is_empty() {
        return BatchPlan::default();
    }

    delta.sort_by(|a, b| {
        a.meta
            .date
            .cmp(&b.meta.date)
            .then_with(|| a.descriptor.path.cmp(&b.descriptor.path))
    });

    let chunk = max_files_per_batch.max(1);
    let mut batches: Vec<Vec<PlannedFile>> = Vec::new();
    for file in delta {
        match batches.last_mut() {
            Some(last) if last.len() < chunk => last.push(file),
            _ => batches.push(vec![file]),
        }
    }

    let total = batches.len();
    let run_now = if max_batches == 0 {
        total
    } else {
        max_batches.min(total)
    };
    batches.truncate(run_now);

    BatchPlan {
        batches,
        pending_batches: total - run_now,
    }
}
