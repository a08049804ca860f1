use std::path::{Path, PathBuf};

use crate::drive::{DriveError, NodeKind};

/// Why a single upload step failed.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("(remote) {0} not found")]
    NotFound(String),

    #[error("(remote) {path} is a {found}")]
    TypeCollision { path: String, found: NodeKind },

    #[error("(remote) {path} has a different hash ({local}, {remote})")]
    IntegrityMismatch {
        path: String,
        local: String,
        remote: String,
    },

    #[error("cannot upload non-existent path {}", .0.display())]
    LocalMissing(PathBuf),

    #[error("(remote) cannot create {path}: {source:#}")]
    FolderCreate {
        path: String,
        #[source]
        source: DriveError,
    },

    #[error("(remote) folder {0} never became visible")]
    FolderNotVisible(String),

    #[error("remote call failed: {0:#}")]
    Remote(#[from] DriveError),

    #[error("transfer of {} failed: {source:#}", .path.display())]
    Transfer {
        path: PathBuf,
        #[source]
        source: DriveError,
    },

    #[error("cannot read local file: {0:#}")]
    LocalIo(#[source] anyhow::Error),
}

impl UploadError {
    /// Classify a local read failure. A file that vanished is final.
    pub fn local(path: &Path, err: anyhow::Error) -> Self {
        let vanished = err.chain().any(|e| {
            e.downcast_ref::<std::io::Error>()
                .is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound)
        });
        if vanished {
            UploadError::LocalMissing(path.to_path_buf())
        } else {
            UploadError::LocalIo(err)
        }
    }

    /// Transient failures are retried after a resync; the rest are final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UploadError::Remote(_) | UploadError::Transfer { .. } | UploadError::LocalIo(_)
        )
    }
}
