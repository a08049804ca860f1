//! In-memory `RemoteDrive` with call counters and failure injection.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::hasher::{self, HashKind};
use crate::media::LocalMetadata;

use super::{DriveError, DriveResult, NodeKind, RemoteDrive, RemoteNode, join_path, path_components};

pub const ROOT_ID: &str = "root";

const GATE_PERMITS: usize = 1 << 20;

#[derive(Default)]
pub struct Calls {
    pub sync: AtomicUsize,
    pub get_by_path: AtomicUsize,
    pub get_by_name: AtomicUsize,
    pub create_folder: AtomicUsize,
    pub trash: AtomicUsize,
    pub get_path: AtomicUsize,
    pub upload: AtomicUsize,
}

impl Calls {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

pub struct FakeDrive {
    nodes: Mutex<HashMap<String, RemoteNode>>,
    next_id: AtomicUsize,
    pub calls: Calls,
    /// Upload calls that fail before anything reaches the drive.
    fail_uploads: AtomicUsize,
    /// Upload calls that leave a corrupt node behind and then fail.
    partial_uploads: AtomicUsize,
    /// File names whose uploaded content is stored with a wrong hash.
    corrupt_names: Mutex<HashSet<String>>,
    /// Created folders stay invisible to `get_path` for this many calls.
    hidden_path_calls: AtomicUsize,
    hidden: Mutex<HashSet<String>>,
    /// Permits gate `sync`; closed gates hold sync callers until opened.
    sync_gate: Semaphore,
}

impl FakeDrive {
    pub fn new() -> Self {
        let root = RemoteNode {
            id: ROOT_ID.into(),
            parent_id: None,
            name: String::new(),
            kind: NodeKind::Folder,
            trashed: false,
            hash: None,
            size: None,
        };
        Self {
            nodes: Mutex::new(HashMap::from([(ROOT_ID.to_string(), root)])),
            next_id: AtomicUsize::new(1),
            calls: Calls::default(),
            fail_uploads: AtomicUsize::new(0),
            partial_uploads: AtomicUsize::new(0),
            corrupt_names: Mutex::new(HashSet::new()),
            hidden_path_calls: AtomicUsize::new(0),
            hidden: Mutex::new(HashSet::new()),
            sync_gate: Semaphore::new(GATE_PERMITS),
        }
    }

    fn alloc_id(&self) -> String {
        format!("n{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn insert(&self, parent_id: &str, name: &str, kind: NodeKind, hash: Option<String>) -> RemoteNode {
        let node = RemoteNode {
            id: self.alloc_id(),
            parent_id: Some(parent_id.to_string()),
            name: name.to_string(),
            kind,
            trashed: false,
            hash,
            size: None,
        };
        self.nodes
            .lock()
            .unwrap()
            .insert(node.id.clone(), node.clone());
        node
    }

    /// Create (or return) a folder at an absolute path, creating parents.
    pub fn seed_folder(&self, path: &str) -> RemoteNode {
        let mut current = self.node(ROOT_ID).unwrap();
        for name in path_components(path) {
            current = match self.live_child(&current.id, name) {
                Some(child) => child,
                None => self.insert(&current.id, name, NodeKind::Folder, None),
            };
        }
        current
    }

    pub fn seed_file(&self, parent: &RemoteNode, name: &str, hash: &str) -> RemoteNode {
        self.insert(&parent.id, name, NodeKind::File, Some(hash.to_string()))
    }

    pub fn trash(&self, id: &str) {
        if let Some(n) = self.nodes.lock().unwrap().get_mut(id) {
            n.trashed = true;
        }
    }

    pub fn node(&self, id: &str) -> Option<RemoteNode> {
        self.nodes.lock().unwrap().get(id).cloned()
    }

    pub fn live_child(&self, parent_id: &str, name: &str) -> Option<RemoteNode> {
        self.nodes
            .lock()
            .unwrap()
            .values()
            .find(|n| n.parent_id.as_deref() == Some(parent_id) && n.name == name && !n.trashed)
            .cloned()
    }

    pub fn fail_next_uploads(&self, n: usize) {
        self.fail_uploads.store(n, Ordering::SeqCst);
    }

    pub fn partial_next_uploads(&self, n: usize) {
        self.partial_uploads.store(n, Ordering::SeqCst);
    }

    pub fn corrupt_uploads_of(&self, name: &str) {
        self.corrupt_names.lock().unwrap().insert(name.to_string());
    }

    pub fn hide_new_folders_for(&self, get_path_calls: usize) {
        self.hidden_path_calls.store(get_path_calls, Ordering::SeqCst);
    }

    /// Make `sync` block until `open_sync` is called.
    pub async fn close_sync(&self) {
        let held = self
            .sync_gate
            .acquire_many(GATE_PERMITS as u32)
            .await
            .unwrap();
        held.forget();
    }

    pub fn open_sync(&self) {
        self.sync_gate.add_permits(GATE_PERMITS);
    }

    fn take_one(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl RemoteDrive for FakeDrive {
    async fn sync(&self) -> DriveResult<u64> {
        self.calls.sync.fetch_add(1, Ordering::SeqCst);
        let _permit = self.sync_gate.acquire().await.map_err(anyhow::Error::from)?;
        Ok(0)
    }

    async fn get_node_by_path(&self, path: &str) -> DriveResult<Option<RemoteNode>> {
        self.calls.get_by_path.fetch_add(1, Ordering::SeqCst);
        let mut current = self.node(ROOT_ID).unwrap();
        for name in path_components(path) {
            match self.live_child(&current.id, name) {
                Some(child) => current = child,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    async fn get_node_by_name_from_parent(
        &self,
        name: &str,
        parent: &RemoteNode,
    ) -> DriveResult<Option<RemoteNode>> {
        self.calls.get_by_name.fetch_add(1, Ordering::SeqCst);
        if let Some(live) = self.live_child(&parent.id, name) {
            return Ok(Some(live));
        }
        Ok(self
            .nodes
            .lock()
            .unwrap()
            .values()
            .find(|n| n.parent_id.as_deref() == Some(parent.id.as_str()) && n.name == name)
            .cloned())
    }

    async fn create_folder(&self, parent: &RemoteNode, name: &str) -> DriveResult<RemoteNode> {
        self.calls.create_folder.fetch_add(1, Ordering::SeqCst);
        let node = self.insert(&parent.id, name, NodeKind::Folder, None);
        if self.hidden_path_calls.load(Ordering::SeqCst) > 0 {
            self.hidden.lock().unwrap().insert(node.id.clone());
        }
        Ok(node)
    }

    async fn trash_node_by_id(&self, id: &str) -> DriveResult<()> {
        self.calls.trash.fetch_add(1, Ordering::SeqCst);
        self.trash(id);
        Ok(())
    }

    async fn get_path(&self, node: &RemoteNode) -> DriveResult<String> {
        self.calls.get_path.fetch_add(1, Ordering::SeqCst);
        if self.hidden.lock().unwrap().contains(&node.id) {
            if Self::take_one(&self.hidden_path_calls) {
                return Err(DriveError::NotVisible(node.id.clone()));
            }
            self.hidden.lock().unwrap().remove(&node.id);
        }

        let mut names = Vec::new();
        let mut current = self
            .node(&node.id)
            .ok_or_else(|| DriveError::NotVisible(node.id.clone()))?;
        while let Some(parent) = current.parent_id.clone() {
            names.push(current.name.clone());
            current = self
                .node(&parent)
                .ok_or_else(|| DriveError::NotVisible(parent.clone()))?;
        }
        let mut path = String::from("/");
        for name in names.iter().rev() {
            path = join_path(&path, name);
        }
        Ok(path)
    }

    async fn upload_file(
        &self,
        parent: &RemoteNode,
        local_path: &Path,
        _metadata: &LocalMetadata,
    ) -> DriveResult<RemoteNode> {
        self.calls.upload.fetch_add(1, Ordering::SeqCst);
        let name = local_path.file_name().unwrap().to_string_lossy().to_string();

        if Self::take_one(&self.fail_uploads) {
            return Err(anyhow::anyhow!("simulated transfer failure for {name}").into());
        }
        if Self::take_one(&self.partial_uploads) {
            self.insert(&parent.id, &name, NodeKind::File, Some("partial".into()));
            return Err(anyhow::anyhow!("simulated interrupted transfer for {name}").into());
        }

        let hash = if self.corrupt_names.lock().unwrap().contains(&name) {
            "corrupted".to_string()
        } else {
            hasher::hash_file(HashKind::Sha1, local_path)?
        };
        Ok(self.insert(&parent.id, &name, NodeKind::File, Some(hash)))
    }

    fn hasher(&self) -> HashKind {
        HashKind::Sha1
    }
}
