//! Orchestration of one pull-based import invocation.
//!
//! Per batch the flow is: scanned candidates are diffed against the
//! ledger, scheduled into date-ordered chunks, fetched and normalized in
//! parallel, grouped by destination relation, provisioned, merged
//! (fast path with per-row fallback), and only then committed to the
//! ledger. Files that fail at any stage never reach the ledger, so the
//! next invocation retries them automatically.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{info, warn};

use slotflow_drive::RemoteStore;

use crate::db::DbPool;
use crate::error::Result;
use crate::fetch::{fetch_batch, FetchedFile};
use crate::ledger::ImportLedger;
use crate::metadata::parse_path;
use crate::provision::TableProvisioner;
use crate::registry::SchemaRegistry;
use crate::retry::RetryPolicy;
use crate::scanner::scan_tree;
use crate::schedule::{plan_batches, PlannedFile};
use crate::upsert::MergeEngine;

/// Inbound configuration, supplied by the CLI layer.
#[derive(Debug, Clone)]
pub struct ImportConfig {
    pub root_folder_id: String,
    /// Inclusive candidate date range.
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub workers: usize,
    pub max_files_per_batch: usize,
    /// Zero means run every planned batch.
    pub max_batches: usize,
    /// Skip the bulk path and upsert row by row from the start.
    pub safe_merge_only: bool,
    /// Scan, diff and plan, but download and write nothing.
    pub dry_run: bool,
    pub retry: RetryPolicy,
}

impl ImportConfig {
    pub fn new(root_folder_id: impl Into<String>, start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            root_folder_id: root_folder_id.into(),
            start_date: start,
            end_date: end,
            workers: 4,
            max_files_per_batch: 50,
            max_batches: 0,
            safe_merge_only: false,
            dry_run: false,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedFile {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedFile {
    pub path: String,
    pub error: String,
}

#[derive(Debug, Default, Serialize)]
pub struct RunReport {
    pub dry_run: bool,
    pub scanned: usize,
    pub in_range: usize,
    pub delta: usize,
    pub batches_run: usize,
    pub batches_pending: usize,
    pub files_imported: usize,
    pub rows_merged: usize,
    pub skipped: Vec<SkippedFile>,
    pub failed: Vec<FailedFile>,
}

impl RunReport {
    /// Failures capped for display; the full list stays serializable.
    pub fn failures_preview(&self, limit: usize) -> (&[FailedFile], usize) {
        let shown = self.failed.len().min(limit);
        (&self.failed[..shown], self.failed.len() - shown)
    }
}

pub async fn run_import(
    pool: &DbPool,
    remote: &dyn RemoteStore,
    registry: &SchemaRegistry,
    config: &ImportConfig,
) -> Result<RunReport> {
    let mut report = RunReport {
        dry_run: config.dry_run,
        ..RunReport::default()
    };

    let scan = scan_tree(remote, &config.root_folder_id, config.retry).await?;
    report.scanned = scan.files.len();
    for failure in scan.failed_subtrees {
        report.failed.push(FailedFile {
            path: failure.path,
            error: format!("enumeration failed: {}", failure.message),
        });
    }

    // Parse metadata, drop unknown groups and bad paths with reasons, then
    // apply the inclusive date window.
    let mut candidates: Vec<PlannedFile> = Vec::new();
    for descriptor in scan.files {
        let meta = match parse_path(&descriptor.path) {
            Ok(meta) => meta,
            Err(err) => {
                report.skipped.push(SkippedFile {
                    path: descriptor.path.clone(),
                    reason: err.to_string(),
                });
                continue;
            }
        };
        if !registry.contains(&meta.group_key) {
            report.skipped.push(SkippedFile {
                path: descriptor.path.clone(),
                reason: format!("group key '{}' has no schema registry entry", meta.group_key),
            });
            continue;
        }
        if meta.date < config.start_date || meta.date > config.end_date {
            continue;
        }
        candidates.push(PlannedFile { descriptor, meta });
    }
    report.in_range = candidates.len();

    let ledger = ImportLedger::new(pool);
    ledger.ensure().await?;
    let delta = ledger
        .diff(candidates.into_iter().map(|c| c.descriptor).collect())
        .await?;
    // re-attach metadata; every delta descriptor parsed successfully above
    let delta: Vec<PlannedFile> = delta
        .into_iter()
        .filter_map(|descriptor| {
            parse_path(&descriptor.path)
                .ok()
                .map(|meta| PlannedFile { descriptor, meta })
        })
        .collect();
    report.delta = delta.len();

    let plan = plan_batches(delta, config.max_files_per_batch, config.max_batches);
    report.batches_pending = plan.pending_batches;

    if config.dry_run {
        report.batches_pending += plan.batches.len();
        info!(
            scanned = report.scanned,
            delta = report.delta,
            planned_batches = plan.batches.len(),
            "dry run complete"
        );
        return Ok(report);
    }

    let provisioner = TableProvisioner::new(pool, registry);
    let engine = MergeEngine::new(pool, config.safe_merge_only);

    for batch in plan.batches {
        report.batches_run += 1;
        let outcome = fetch_batch(remote, registry, batch, config.workers, config.retry).await;
        for failure in outcome.failures {
            report.failed.push(FailedFile {
                path: failure.planned.descriptor.path.clone(),
                error: failure.error.to_string(),
            });
        }

        // One relation group at a time: merges are transactional and
        // contend on the same table, so cross-group parallelism buys
        // nothing here.
        let mut groups: BTreeMap<String, Vec<FetchedFile>> = BTreeMap::new();
        for fetched in outcome.fetched {
            groups
                .entry(fetched.planned.meta.group_key.clone())
                .or_default()
                .push(fetched);
        }

        for (group_key, files) in groups {
            let relation = match provisioner.ensure(&group_key).await {
                Ok(relation) => relation,
                Err(err) => {
                    warn!(group_key = %group_key, %err, "provisioning failed for group");
                    for file in &files {
                        report.failed.push(FailedFile {
                            path: file.planned.descriptor.path.clone(),
                            error: err.to_string(),
                        });
                    }
                    continue;
                }
            };

            let merge = match engine.merge(&relation, &files).await {
                Ok(merge) => merge,
                Err(err) => {
                    warn!(table = %relation.table, %err, "merge failed for relation group");
                    for file in &files {
                        report.failed.push(FailedFile {
                            path: file.planned.descriptor.path.clone(),
                            error: err.to_string(),
                        });
                    }
                    continue;
                }
            };

            report.rows_merged += merge.rows_merged;
            for (idx, err) in &merge.failed_files {
                report.failed.push(FailedFile {
                    path: files[*idx].planned.descriptor.path.clone(),
                    error: err.to_string(),
                });
            }

            // Ledger commit strictly after the merge: a file's ledger hash
            // always matches bytes that are durably in the relation.
            for idx in merge.merged_files {
                let file = &files[idx];
                let committed = ledger
                    .commit(
                        &file.planned.descriptor.id,
                        &file.planned.descriptor.content_hash,
                        &file.planned.descriptor.path,
                        &file.planned.meta.group_key,
                        &file.planned.meta.sub_key,
                        file.planned.meta.date,
                        file.rows.len() as i64,
                    )
                    .await;
                match committed {
                    Ok(()) => report.files_imported += 1,
                    Err(err) => {
                        // rows are merged; the file will re-run next time,
                        // converging to the same values
                        warn!(path = %file.planned.descriptor.path, %err, "ledger commit failed");
                        report.failed.push(FailedFile {
                            path: file.planned.descriptor.path.clone(),
                            error: format!("ledger commit failed: {err}"),
                        });
                    }
                }
            }
        }
    }

    info!(
        scanned = report.scanned,
        imported = report.files_imported,
        rows = report.rows_merged,
        failed = report.failed.len(),
        skipped = report.skipped.len(),
        pending_batches = report.batches_pending,
        "import invocation finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_preview_is_bounded() {
        let report = RunReport {
            failed: (0..10)
                .map(|i| FailedFile {
                    path: format!("p{i}"),
                    error: "x".to_string(),
                })
                .collect(),
            ..RunReport::default()
        };
        let (shown, hidden) = report.failures_preview(3);
        assert_eq!(shown.len(), 3);
        assert_eq!(hidden, 7);

        let (all, none) = report.failures_preview(50);
        assert_eq!(all.len(), 10);
        assert_eq!(none, 0);
    }
}
