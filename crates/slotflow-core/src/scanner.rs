//! Remote tree enumeration.
//!
//! Walks every descendant of a root folder through the paginated listing
//! API, using an explicit work queue rather than recursion, and collects
//! every `.csv` file with its full relative path and content hash. Listing
//! calls are retried with backoff; a subtree whose listing keeps failing is
//! reported and skipped without discarding what sibling folders produced.
//! Only the root folder failing is fatal.

use tracing::{debug, warn};

use slotflow_drive::RemoteStore;

use crate::error::{PipelineError, Result};
use crate::retry::{retry, RetryPolicy};

/// A candidate snapshot file found during enumeration. Recomputed on every
/// run, never persisted; identity is `id`.
#[derive(Debug, Clone)]
pub struct FileDescriptor {
    pub id: String,
    pub path: String,
    pub content_hash: String,
    pub mime: String,
}

#[derive(Debug, Clone)]
pub struct SubtreeFailure {
    pub folder_id: String,
    pub path: String,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub files: Vec<FileDescriptor>,
    /// Folders whose listing exhausted retries. Their descendants are
    /// missing from `files`; the next invocation will see them again.
    pub failed_subtrees: Vec<SubtreeFailure>,
}

const TABULAR_EXTENSION: &str = ".csv";

/// Enumerate every descendant `.csv` file of `root_folder_id`. No ordering
/// guarantee; callers needing determinism must sort.
pub async fn scan_tree(
    remote: &dyn RemoteStore,
    root_folder_id: &str,
    policy: RetryPolicy,
) -> Result<ScanOutcome> {
    let mut outcome = ScanOutcome::default();
    let mut queue: Vec<(String, String)> = vec![(root_folder_id.to_string(), String::new())];

    while let Some((folder_id, prefix)) = queue.pop() {
        let mut page_token: Option<String> = None;
        loop {
            let listed = retry(policy, "folder listing", || {
                let token = page_token.clone();
                let fid = folder_id.as_str();
                async move { remote.list_children(fid, token.as_deref()).await }
            })
            .await;

            let page = match listed {
                Ok(page) => page,
                Err(err) => {
                    if folder_id == root_folder_id {
                        return Err(PipelineError::Enumeration {
                            folder_id,
                            message: err.to_string(),
                        });
                    }
                    warn!(%folder_id, path = %prefix, %err, "subtree listing failed, skipping");
                    outcome.failed_subtrees.push(SubtreeFailure {
                        folder_id: folder_id.clone(),
                        path: prefix.clone(),
                        message: err.to_string(),
                    });
                    break;
                }
            };

            for entry in page.entries {
                let path = if prefix.is_empty() {
                    entry.name.clone()
                } else {
                    format!("{prefix}/{}", entry.name)
                };
                if entry.is_folder() {
                    queue.push((entry.id, path));
                } else if entry.name.to_lowercase().ends_with(TABULAR_EXTENSION) {
                    match entry.content_hash {
                        Some(content_hash) => outcome.files.push(FileDescriptor {
                            id: entry.id,
                            path,
                            content_hash,
                            mime: entry.mime,
                        }),
                        None => {
                            warn!(%path, "file has no content hash in listing, skipping")
                        }
                    }
                }
            }

            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
            }
        }
    }

    debug!(
        files = outcome.files.len(),
        failed_subtrees = outcome.failed_subtrees.len(),
        "scan complete"
    );
    Ok(outcome)
}
