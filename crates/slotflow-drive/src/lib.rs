//! Abstractions over the remote file store that daily snapshot CSVs land in.
//!
//! The pipeline only needs two operations: list the children of a folder
//! (paginated) and download a file by id. `DriveClient` implements them
//! against the Google Drive v3 REST API; `MemoryRemote` is an in-memory
//! backend for tests and offline runs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Mime type the remote uses to mark folders.
pub const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("listing folder {folder_id} failed: {message}")]
    List { folder_id: String, message: String },
    #[error("downloading file {file_id} failed: {message}")]
    Download { file_id: String, message: String },
    #[error("object not found: {0}")]
    NotFound(String),
}

/// One child of a folder, as reported by a single listing page.
#[derive(Debug, Clone)]
pub struct ChildEntry {
    pub id: String,
    pub name: String,
    pub mime: String,
    /// Content checksum reported by the store, when it reports one.
    pub content_hash: Option<String>,
}

impl ChildEntry {
    pub fn is_folder(&self) -> bool {
        self.mime == FOLDER_MIME
    }
}

/// One page of a folder listing.
#[derive(Debug, Clone)]
pub struct ChildPage {
    pub entries: Vec<ChildEntry>,
    pub next_page_token: Option<String>,
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// List one page of the direct children of `folder_id`. Pass the token
    /// returned in [`ChildPage::next_page_token`] to fetch the next page;
    /// a `None` token in the response means the listing is complete.
    async fn list_children(
        &self,
        folder_id: &str,
        page_token: Option<&str>,
    ) -> Result<ChildPage, RemoteError>;

    /// Download the full contents of a file by id.
    async fn download(&self, file_id: &str) -> Result<Bytes, RemoteError>;
}

#[derive(Debug, Clone)]
pub struct DriveConfig {
    /// OAuth bearer token with read-only Drive scope. Credential refresh is
    /// the caller's concern; the client treats it as an opaque string.
    pub access_token: String,
    pub timeout_secs: u64,
    pub page_size: u32,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            access_token: String::new(),
            timeout_secs: 30,
            page_size: 1000,
        }
    }
}

/// Google Drive v3 client speaking the REST API directly.
#[derive(Clone)]
pub struct DriveClient {
    http: Arc<reqwest::Client>,
    access_token: String,
    page_size: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    mime_type: String,
    md5_checksum: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFileList {
    next_page_token: Option<String>,
    #[serde(default)]
    files: Vec<DriveFile>,
}

impl DriveClient {
    pub fn new(config: DriveConfig) -> Result<Self, RemoteError> {
        if config.access_token.is_empty() {
            return Err(RemoteError::Configuration(
                "drive access token cannot be empty".into(),
            ));
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|err| RemoteError::Configuration(err.to_string()))?;

        Ok(Self {
            http: Arc::new(http),
            access_token: config.access_token,
            page_size: config.page_size.clamp(1, 1000),
        })
    }
}

#[async_trait]
impl RemoteStore for DriveClient {
    async fn list_children(
        &self,
        folder_id: &str,
        page_token: Option<&str>,
    ) -> Result<ChildPage, RemoteError> {
        let query = format!("'{}' in parents and trashed=false", folder_id);
        let mut params = vec![
            ("q", query),
            (
                "fields",
                "nextPageToken, files(id,name,mimeType,md5Checksum)".to_string(),
            ),
            ("pageSize", self.page_size.to_string()),
            ("supportsAllDrives", "true".to_string()),
        ];
        if let Some(token) = page_token {
            params.push(("pageToken", token.to_string()));
        }

        let response = self
            .http
            .get("https://www.googleapis.com/drive/v3/files")
            .bearer_auth(&self.access_token)
            .query(&params)
            .send()
            .await
            .map_err(|err| RemoteError::List {
                folder_id: folder_id.to_string(),
                message: err.to_string(),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::List {
                folder_id: folder_id.to_string(),
                message: format!("HTTP {status}: {body}"),
            });
        }

        let listing: DriveFileList = response.json().await.map_err(|err| RemoteError::List {
            folder_id: folder_id.to_string(),
            message: format!("invalid listing payload: {err}"),
        })?;

        debug!(
            folder_id,
            entries = listing.files.len(),
            has_next = listing.next_page_token.is_some(),
            "listed folder page"
        );

        Ok(ChildPage {
            entries: listing
                .files
                .into_iter()
                .map(|f| ChildEntry {
                    id: f.id,
                    name: f.name,
                    mime: f.mime_type,
                    content_hash: f.md5_checksum,
                })
                .collect(),
            next_page_token: listing.next_page_token,
        })
    }

    async fn download(&self, file_id: &str) -> Result<Bytes, RemoteError> {
        let url = format!("https://www.googleapis.com/drive/v3/files/{file_id}");
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.access_token)
            .query(&[("alt", "media"), ("supportsAllDrives", "true")])
            .send()
            .await
            .map_err(|err| RemoteError::Download {
                file_id: file_id.to_string(),
                message: err.to_string(),
            })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(RemoteError::NotFound(file_id.to_string()));
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::Download {
                file_id: file_id.to_string(),
                message: format!("HTTP {status}: {body}"),
            });
        }

        response.bytes().await.map_err(|err| RemoteError::Download {
            file_id: file_id.to_string(),
            message: err.to_string(),
        })
    }
}

/// In-memory remote store. Folder and file ids are caller-chosen strings;
/// content hashes are blake3 hex digests of the stored bytes.
#[derive(Debug, Clone)]
pub struct MemoryRemote {
    folders: HashMap<String, Vec<MemoryNode>>,
    contents: HashMap<String, Bytes>,
    page_size: usize,
}

#[derive(Debug, Clone)]
struct MemoryNode {
    id: String,
    name: String,
    mime: String,
    content_hash: Option<String>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self {
            folders: HashMap::new(),
            contents: HashMap::new(),
            page_size: usize::MAX,
        }
    }

    /// Force listings to paginate with at most `size` entries per page.
    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = size.max(1);
        self
    }

    pub fn add_folder(&mut self, parent_id: &str, folder_id: &str, name: &str) {
        self.folders
            .entry(parent_id.to_string())
            .or_default()
            .push(MemoryNode {
                id: folder_id.to_string(),
                name: name.to_string(),
                mime: FOLDER_MIME.to_string(),
                content_hash: None,
            });
        self.folders.entry(folder_id.to_string()).or_default();
    }

    pub fn add_file(&mut self, parent_id: &str, file_id: &str, name: &str, contents: &[u8]) {
        let hash = blake3::hash(contents).to_hex().to_string();
        self.folders
            .entry(parent_id.to_string())
            .or_default()
            .push(MemoryNode {
                id: file_id.to_string(),
                name: name.to_string(),
                mime: "text/csv".to_string(),
                content_hash: Some(hash),
            });
        self.contents
            .insert(file_id.to_string(), Bytes::copy_from_slice(contents));
    }

    /// Replace a file's bytes in place, recomputing its content hash.
    pub fn update_file(&mut self, file_id: &str, contents: &[u8]) {
        let hash = blake3::hash(contents).to_hex().to_string();
        for nodes in self.folders.values_mut() {
            for node in nodes.iter_mut() {
                if node.id == file_id {
                    node.content_hash = Some(hash.clone());
                }
            }
        }
        self.contents
            .insert(file_id.to_string(), Bytes::copy_from_slice(contents));
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn list_children(
        &self,
        folder_id: &str,
        page_token: Option<&str>,
    ) -> Result<ChildPage, RemoteError> {
        let nodes = self
            .folders
            .get(folder_id)
            .ok_or_else(|| RemoteError::NotFound(folder_id.to_string()))?;

        let offset: usize = match page_token {
            Some(token) => token.parse().map_err(|_| RemoteError::List {
                folder_id: folder_id.to_string(),
                message: format!("bad page token '{token}'"),
            })?,
            None => 0,
        };

        let end = (offset + self.page_size).min(nodes.len());
        let entries = nodes[offset..end]
            .iter()
            .map(|n| ChildEntry {
                id: n.id.clone(),
                name: n.name.clone(),
                mime: n.mime.clone(),
                content_hash: n.content_hash.clone(),
            })
            .collect();

        let next_page_token = if end < nodes.len() {
            Some(end.to_string())
        } else {
            None
        };

        Ok(ChildPage {
            entries,
            next_page_token,
        })
    }

    async fn download(&self, file_id: &str) -> Result<Bytes, RemoteError> {
        self.contents
            .get(file_id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(file_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_remote_paginates_listings() {
        let mut remote = MemoryRemote::new().with_page_size(2);
        remote.add_file("root", "f1", "a.csv", b"a");
        remote.add_file("root", "f2", "b.csv", b"b");
        remote.add_file("root", "f3", "c.csv", b"c");

        let first = remote.list_children("root", None).await.expect("page 1");
        assert_eq!(first.entries.len(), 2);
        let token = first.next_page_token.expect("continuation token");

        let second = remote
            .list_children("root", Some(&token))
            .await
            .expect("page 2");
        assert_eq!(second.entries.len(), 1);
        assert!(second.next_page_token.is_none());
    }

    #[tokio::test]
    async fn memory_remote_hash_tracks_contents() {
        let mut remote = MemoryRemote::new();
        remote.add_file("root", "f1", "a.csv", b"v1");
        let before = remote.list_children("root", None).await.unwrap().entries[0]
            .content_hash
            .clone();

        remote.update_file("f1", b"v2");
        let after = remote.list_children("root", None).await.unwrap().entries[0]
            .content_hash
            .clone();

        assert_ne!(before, after);
        let bytes = remote.download("f1").await.unwrap();
        assert_eq!(&bytes[..], b"v2");
    }

    #[tokio::test]
    async fn memory_remote_missing_folder_is_not_found() {
        let remote = MemoryRemote::new();
        let err = remote.list_children("nope", None).await.unwrap_err();
        assert!(matches!(err, RemoteError::NotFound(_)));
    }
}
