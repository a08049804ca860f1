//! Upload orchestration.
//!
//! `UploadEngine` mirrors a local file or directory tree into a remote
//! folder. It suppresses duplicate jobs per key, serializes remote syncs,
//! retries transient failures and verifies every file by content hash.

mod error;
mod jobs;

use error::UploadError;
use jobs::JobRegistry;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::config::GeneralConfig;
use crate::drive::{DriveError, DriveResult, NodeKind, RemoteDrive, RemoteNode, join_path};
use crate::exclude::ExclusionFilter;
use crate::hasher::HashPool;
use crate::media;

/// Attempts per file before giving up.
const RETRY_TIMES: u32 = 3;

/// Upper bound for the folder visibility backoff.
const MAX_POLL_BACKOFF: Duration = Duration::from_secs(8);

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Pause before each sync so recent remote writes reach the change feed.
    pub sync_settle: Duration,
    pub folder_poll_attempts: u32,
    pub folder_poll_backoff: Duration,
}

impl EngineOptions {
    pub fn from_config(general: &GeneralConfig) -> Self {
        Self {
            sync_settle: Duration::from_millis(general.sync_settle_ms),
            folder_poll_attempts: general.folder_poll_attempts,
            folder_poll_backoff: Duration::from_millis(general.folder_poll_backoff_ms),
        }
    }
}

type UploadFuture<'a> = Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

pub struct UploadEngine {
    drive: Arc<dyn RemoteDrive>,
    filter: ExclusionFilter,
    hashes: HashPool,
    jobs: JobRegistry,
    sync_lock: Mutex<()>,
    options: EngineOptions,
}

impl UploadEngine {
    pub fn new(
        drive: Arc<dyn RemoteDrive>,
        filter: ExclusionFilter,
        hashes: HashPool,
        options: EngineOptions,
    ) -> Self {
        Self {
            drive,
            filter,
            hashes,
            jobs: JobRegistry::default(),
            sync_lock: Mutex::new(()),
            options,
        }
    }

    /// Number of uploads currently in flight.
    pub fn active_jobs(&self) -> usize {
        self.jobs.len()
    }

    /// Upload `local_path` (file or directory) into the remote folder at
    /// `remote_path`. The local path is the job key.
    pub async fn upload_path(&self, remote_path: &str, local_path: &Path) -> bool {
        let key = local_path.to_string_lossy();
        let Some(_job) = self.jobs.try_acquire(&key) else {
            tracing::warn!(path = %local_path.display(), "still uploading");
            return false;
        };

        let Some(target) = self.resolve_target(remote_path).await else {
            return false;
        };

        let ok = self.upload(&target, local_path).await;
        if !ok {
            tracing::error!(path = %local_path.display(), "upload failed");
        }
        ok
    }

    /// Upload the named items of a finished download, keyed by `item_id`.
    /// Every item is attempted even if an earlier one fails.
    pub async fn upload_torrent(
        &self,
        remote_path: &str,
        item_id: &str,
        local_root: &Path,
        items: &[String],
    ) -> bool {
        let Some(_job) = self.jobs.try_acquire(item_id) else {
            tracing::warn!(item_id, "still uploading");
            return false;
        };

        let Some(target) = self.resolve_target(remote_path).await else {
            return false;
        };

        let mut all_ok = true;
        for item in items {
            let local = local_root.join(item);
            if !self.upload(&target, &local).await {
                tracing::error!(item_id, path = %local.display(), "upload failed");
                all_ok = false;
            }
        }
        if all_ok {
            tracing::info!(item_id, count = items.len(), "download uploaded");
        }
        all_ok
    }

    /// Pull remote changes into the drive's metadata view. Only one sync
    /// runs at a time; concurrent callers queue on the lock.
    pub async fn sync(&self) -> DriveResult<u64> {
        let _guard = self.sync_lock.lock().await;
        if !self.options.sync_settle.is_zero() {
            tokio::time::sleep(self.options.sync_settle).await;
        }
        let changes = self.drive.sync().await?;
        tracing::info!(changes, "sync");
        Ok(changes)
    }

    async fn resync(&self) {
        if let Err(e) = self.sync().await {
            tracing::warn!(error = %e, "sync failed");
        }
    }

    async fn resolve_target(&self, remote_path: &str) -> Option<RemoteNode> {
        self.resync().await;
        match self.drive.get_node_by_path(remote_path).await {
            Ok(Some(node)) => Some(node),
            Ok(None) => {
                let e = UploadError::NotFound(remote_path.to_string());
                tracing::error!(error = %e, "upload target missing");
                None
            }
            Err(e) => {
                tracing::error!(remote_path, error = %e, "cannot resolve upload target");
                None
            }
        }
    }

    fn upload<'a>(&'a self, parent: &'a RemoteNode, local: &'a Path) -> UploadFuture<'a> {
        Box::pin(async move {
            let Some(name) = entry_name(local) else {
                tracing::error!(path = %local.display(), "path has no file name");
                return false;
            };

            if self.filter.should_exclude(&name).await {
                tracing::info!(path = %local.display(), "excluded");
                return true;
            }

            let is_dir = match tokio::fs::metadata(local).await {
                Ok(meta) => meta.is_dir(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    let e = UploadError::LocalMissing(local.to_path_buf());
                    tracing::warn!(error = %e, "skipping");
                    return false;
                }
                Err(e) => {
                    let e = UploadError::LocalIo(e.into());
                    tracing::error!(path = %local.display(), error = %e, "cannot stat");
                    return false;
                }
            };

            if is_dir {
                self.upload_directory(parent, local, &name).await
            } else {
                self.upload_file_retry(parent, local).await
            }
        })
    }

    async fn upload_directory(&self, parent: &RemoteNode, local: &Path, name: &str) -> bool {
        let folder = match self.ensure_folder(parent, name).await {
            Ok(folder) => folder,
            Err(e) => {
                tracing::error!(path = %local.display(), error = %e, "cannot prepare remote folder");
                return false;
            }
        };

        let entries = match sorted_entries(local).await {
            Ok(entries) => entries,
            Err(e) => {
                let e = UploadError::LocalIo(e.into());
                tracing::error!(path = %local.display(), error = %e, "cannot list directory");
                return false;
            }
        };

        let mut all_ok = true;
        for child in &entries {
            if !self.upload(&folder, child).await {
                tracing::error!(path = %child.display(), "(remote) cannot upload");
                all_ok = false;
            }
        }
        all_ok
    }

    /// Find the remote folder for `name` under `parent`, creating it when
    /// there is no live one.
    async fn ensure_folder(&self, parent: &RemoteNode, name: &str) -> Result<RemoteNode, UploadError> {
        let existing = self.drive.get_node_by_name_from_parent(name, parent).await?;
        match existing {
            Some(child) if !child.trashed && child.is_file() => Err(UploadError::TypeCollision {
                path: self.display_path(parent, name).await,
                found: NodeKind::File,
            }),
            Some(child) if !child.trashed && !parent.trashed => Ok(child),
            _ => {
                let folder = match self.drive.create_folder(parent, name).await {
                    Ok(folder) => folder,
                    Err(source) => {
                        return Err(UploadError::FolderCreate {
                            path: self.display_path(parent, name).await,
                            source,
                        });
                    }
                };
                tracing::info!(name, id = %folder.id, "created remote folder");
                self.wait_until_visible(&folder).await?;
                Ok(folder)
            }
        }
    }

    /// Poll until a freshly created folder resolves to a path, syncing
    /// between checks. Only "not visible yet" is tolerated, and the last
    /// sync is followed by one more check.
    async fn wait_until_visible(&self, folder: &RemoteNode) -> Result<(), UploadError> {
        let mut delay = self.options.folder_poll_backoff;
        let mut syncs = 0;
        loop {
            match self.drive.get_path(folder).await {
                Ok(_) => return Ok(()),
                Err(DriveError::NotVisible(_)) => {
                    tracing::debug!(id = %folder.id, syncs, "folder not visible yet");
                }
                Err(e) => return Err(e.into()),
            }
            if syncs == self.options.folder_poll_attempts {
                return Err(UploadError::FolderNotVisible(folder.name.clone()));
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(MAX_POLL_BACKOFF);
            self.sync().await?;
            syncs += 1;
        }
    }

    async fn upload_file_retry(&self, parent: &RemoteNode, local: &Path) -> bool {
        for attempt in 1..=RETRY_TIMES {
            let e = match self.upload_file(parent, local).await {
                Ok(()) => return true,
                Err(e) => e,
            };
            if !e.is_retryable() {
                tracing::error!(error = %e, "upload failed");
                return false;
            }

            tracing::warn!(path = %local.display(), attempt, error = %e, "retry upload file");
            self.resync().await;
            if matches!(e, UploadError::Transfer { .. }) {
                self.resolve_name_conflict(parent, local).await;
            }
        }
        tracing::error!(path = %local.display(), "tried upload {RETRY_TIMES} times");
        false
    }

    async fn upload_file(&self, parent: &RemoteNode, local: &Path) -> Result<(), UploadError> {
        let name = entry_name(local)
            .ok_or_else(|| UploadError::LocalIo(anyhow::anyhow!("path has no file name")))?;
        let parent_path = self.drive.get_path(parent).await?;
        let remote_path = join_path(&parent_path, &name);

        let existing = self.drive.get_node_by_name_from_parent(&name, parent).await?;
        if let Some(child) = existing.filter(|c| !c.trashed) {
            if child.is_folder() {
                return Err(UploadError::TypeCollision {
                    path: remote_path,
                    found: NodeKind::Folder,
                });
            }
            self.verify(local, &remote_path, child.hash.as_deref()).await?;
            tracing::info!(path = %remote_path, "already exists");
            return Ok(());
        }

        tracing::info!(path = %remote_path, "uploading");
        let metadata = media::extract_metadata(local)
            .await
            .map_err(|e| UploadError::local(local, e))?;
        let uploaded = self
            .drive
            .upload_file(parent, local, &metadata)
            .await
            .map_err(|source| UploadError::Transfer {
                path: local.to_path_buf(),
                source,
            })?;
        self.verify(local, &remote_path, uploaded.hash.as_deref()).await?;
        tracing::info!(path = %remote_path, size = metadata.size, "uploaded");
        Ok(())
    }

    /// Compare the local file's digest with the one the drive reports.
    async fn verify(
        &self,
        local: &Path,
        remote_path: &str,
        remote_hash: Option<&str>,
    ) -> Result<(), UploadError> {
        let local_hash = self.local_digest(local).await?;
        if remote_hash == Some(local_hash.as_str()) {
            return Ok(());
        }
        Err(UploadError::IntegrityMismatch {
            path: remote_path.to_string(),
            local: local_hash,
            remote: remote_hash.unwrap_or("none").to_string(),
        })
    }

    async fn local_digest(&self, local: &Path) -> Result<String, UploadError> {
        self.hashes
            .digest(self.drive.hasher(), local)
            .await
            .map_err(|e| UploadError::local(local, e))
    }

    /// After a failed transfer, trash a same-name remote file that does not
    /// hold our content so the next attempt starts clean. Never fails.
    async fn resolve_name_conflict(&self, parent: &RemoteNode, local: &Path) {
        match self.trash_conflicting(parent, local).await {
            Ok(true) => tracing::info!(path = %local.display(), "trashed conflicting remote file"),
            Ok(false) => {}
            Err(e) => tracing::warn!(path = %local.display(), error = %e, "cannot resolve name conflict"),
        }
    }

    async fn trash_conflicting(&self, parent: &RemoteNode, local: &Path) -> Result<bool, UploadError> {
        let Some(name) = entry_name(local) else {
            return Ok(false);
        };
        let Some(child) = self.drive.get_node_by_name_from_parent(&name, parent).await? else {
            return Ok(false);
        };
        if child.trashed || child.is_folder() {
            return Ok(false);
        }
        let local_hash = self.local_digest(local).await?;
        if child.hash.as_deref() == Some(local_hash.as_str()) {
            return Ok(false);
        }
        self.drive.trash_node_by_id(&child.id).await?;
        Ok(true)
    }

    async fn display_path(&self, parent: &RemoteNode, name: &str) -> String {
        match self.drive.get_path(parent).await {
            Ok(path) => join_path(&path, name),
            Err(_) => name.to_string(),
        }
    }
}

fn entry_name(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}

async fn sorted_entries(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut reader = tokio::fs::read_dir(dir).await?;
    let mut entries = Vec::new();
    while let Some(entry) = reader.next_entry().await? {
        entries.push(entry.path());
    }
    entries.sort();
    Ok(entries)
}
