use thiserror::Error;

use crate::metadata::ParseError;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Remote listing failed after exhausting retries. Fatal for the whole
    /// invocation only when it hits the root folder.
    #[error("enumeration of folder {folder_id} failed: {message}")]
    Enumeration { folder_id: String, message: String },

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("group key '{group_key}' has no schema registry entry")]
    UnknownGroup { group_key: String },

    #[error("download of file {file_id} failed: {message}")]
    Download { file_id: String, message: String },

    #[error("normalization failed for {path}: {message}")]
    Normalize { path: String, message: String },

    #[error("bulk merge into {table} failed: {message}")]
    BulkMerge { table: String, message: String },

    #[error("row merge into {table} failed for {path}: {message}")]
    RowMerge {
        table: String,
        path: String,
        message: String,
    },

    #[error("database query failed: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Remote(#[from] slotflow_drive::RemoteError),

    #[error("invalid SQL identifier: {0}")]
    Identifier(String),

    #[error("registry error: {0}")]
    Registry(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
