//! The remote drive as seen by the upload engine.
//!
//! `RemoteDrive` is the query/command surface the engine needs; `BoxDrive`
//! implements it over the Box REST API and a local node cache.

mod box_drive;
pub mod cache;
#[cfg(test)]
pub mod fake;

pub use box_drive::BoxDrive;

use std::fmt;
use std::path::Path;

use async_trait::async_trait;

use crate::hasher::HashKind;
use crate::media::LocalMetadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Folder,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::File => f.write_str("file"),
            NodeKind::Folder => f.write_str("directory"),
        }
    }
}

/// A file or folder in the remote tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteNode {
    pub id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub kind: NodeKind,
    pub trashed: bool,
    /// Content digest, files only.
    pub hash: Option<String>,
    pub size: Option<u64>,
}

impl RemoteNode {
    pub fn is_file(&self) -> bool {
        self.kind == NodeKind::File
    }

    pub fn is_folder(&self) -> bool {
        self.kind == NodeKind::Folder
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DriveError {
    /// The node exists remotely but the local metadata view has not caught up yet.
    #[error("node {0} is not visible in the metadata cache yet")]
    NotVisible(String),
    #[error(transparent)]
    Remote(#[from] anyhow::Error),
}

pub type DriveResult<T> = Result<T, DriveError>;

#[async_trait]
pub trait RemoteDrive: Send + Sync {
    /// Pull pending remote changes into the metadata view.
    /// Returns the number of changes applied.
    async fn sync(&self) -> DriveResult<u64>;

    async fn get_node_by_path(&self, path: &str) -> DriveResult<Option<RemoteNode>>;

    /// Look up a child by name. A live child wins over a trashed one with
    /// the same name; a trashed child is still returned when it is the only match.
    async fn get_node_by_name_from_parent(
        &self,
        name: &str,
        parent: &RemoteNode,
    ) -> DriveResult<Option<RemoteNode>>;

    async fn create_folder(&self, parent: &RemoteNode, name: &str) -> DriveResult<RemoteNode>;

    async fn trash_node_by_id(&self, id: &str) -> DriveResult<()>;

    /// Canonical absolute path of `node`, e.g. `/incoming/show`.
    async fn get_path(&self, node: &RemoteNode) -> DriveResult<String>;

    async fn upload_file(
        &self,
        parent: &RemoteNode,
        local_path: &Path,
        metadata: &LocalMetadata,
    ) -> DriveResult<RemoteNode>;

    /// Digest algorithm the drive reports in `RemoteNode::hash`.
    fn hasher(&self) -> HashKind;
}

/// Join a parent's canonical path and a child name.
pub fn join_path(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{parent}{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Split an absolute remote path into its non-empty components.
pub fn path_components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty() && *c != ".")
}
