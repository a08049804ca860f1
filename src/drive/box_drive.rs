use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::box_api::types::{BoxEvent, is_not_found};
use crate::box_api::{BoxClient, BoxItem};
use crate::hasher::HashKind;
use crate::media::LocalMetadata;

use super::{
    DriveError, DriveResult, NodeKind, RemoteDrive, RemoteNode, cache, path_components,
};

/// `RemoteDrive` backed by the Box API, with a SQLite node cache kept
/// current through the Box change feed.
pub struct BoxDrive {
    client: Arc<BoxClient>,
    pool: SqlitePool,
    root_id: String,
}

impl BoxDrive {
    pub fn new(client: Arc<BoxClient>, pool: SqlitePool, root_id: String) -> Self {
        Self {
            client,
            pool,
            root_id,
        }
    }

    /// First sync: remember "now" in the event stream, then crawl the tree.
    /// Changes made during the crawl are replayed by the next sync.
    async fn snapshot(&self) -> Result<u64> {
        let position = self.client.get_stream_position().await?;
        tracing::info!(root = %self.root_id, "no checkpoint, crawling remote tree");

        let root = self.client.get_folder(&self.root_id).await?;
        let mut root_node = node_from_item(root);
        // The root anchors every path; its own parent is irrelevant.
        root_node.parent_id = None;
        cache::upsert_node(&self.pool, &root_node).await?;

        let mut count = 1u64;
        let mut queue = VecDeque::from([self.root_id.clone()]);
        while let Some(folder_id) = queue.pop_front() {
            for item in self.client.list_folder_items(&folder_id).await? {
                if !item.is_file() && !item.is_folder() {
                    continue;
                }
                let mut node = node_from_item(item);
                node.parent_id = Some(folder_id.clone());
                if node.is_folder() {
                    queue.push_back(node.id.clone());
                }
                cache::upsert_node(&self.pool, &node).await?;
                count += 1;
            }
        }

        cache::set_stream_position(&self.pool, &position).await?;
        tracing::info!(nodes = count, "remote tree cached");
        Ok(count)
    }

    async fn apply_events(&self, mut position: String) -> Result<u64> {
        let mut applied = 0u64;
        loop {
            let (events, next, more) = self.client.get_sync_events(&position).await?;
            for event in &events {
                if self.apply_event(event).await? {
                    applied += 1;
                }
            }
            if next != position {
                cache::set_stream_position(&self.pool, &next).await?;
                position = next;
            }
            if !more {
                return Ok(applied);
            }
        }
    }

    /// Apply one change event to the cache. Returns whether the cache changed.
    async fn apply_event(&self, event: &BoxEvent) -> Result<bool> {
        let Some(source) = &event.source else {
            return Ok(false);
        };
        let (Some(id), Some(kind)) = (source.id.as_deref(), source.source_type.as_deref()) else {
            return Ok(false);
        };
        if id == self.root_id {
            return Ok(false);
        }

        tracing::trace!(event_type = %event.event_type, id, name = ?source.name, "remote event");

        if event.event_type == "ITEM_TRASH" {
            return cache::mark_trashed(&self.pool, id).await;
        }

        let fetched = match kind {
            "file" => self.client.get_file(id).await,
            "folder" => self.client.get_folder(id).await,
            _ => return Ok(false),
        };
        let item = match fetched {
            Ok(item) => item,
            Err(e) if is_not_found(&e) => return cache::mark_trashed(&self.pool, id).await,
            Err(e) => return Err(e),
        };

        let node = node_from_item(item);
        let in_tree = match node.parent_id.as_deref() {
            Some(parent) => {
                parent == self.root_id || cache::get_node(&self.pool, parent).await?.is_some()
            }
            None => false,
        };
        if !in_tree {
            // Moved out of (or never inside) the mirrored tree.
            return cache::mark_trashed(&self.pool, &node.id).await;
        }

        cache::upsert_node(&self.pool, &node).await?;
        Ok(true)
    }

    async fn cached_node(&self, id: &str) -> Result<RemoteNode> {
        cache::get_node(&self.pool, id)
            .await?
            .with_context(|| format!("Node {id} is not cached"))
    }
}

#[async_trait]
impl RemoteDrive for BoxDrive {
    async fn sync(&self) -> DriveResult<u64> {
        let count = match cache::get_stream_position(&self.pool).await? {
            None => self.snapshot().await?,
            Some(position) => self.apply_events(position).await?,
        };
        Ok(count)
    }

    async fn get_node_by_path(&self, path: &str) -> DriveResult<Option<RemoteNode>> {
        let Some(mut node) = cache::get_node(&self.pool, &self.root_id).await? else {
            return Ok(None);
        };
        for name in path_components(path) {
            match cache::get_child_by_name(&self.pool, &node.id, name).await? {
                Some(child) if !child.trashed => node = child,
                _ => return Ok(None),
            }
        }
        Ok(Some(node))
    }

    async fn get_node_by_name_from_parent(
        &self,
        name: &str,
        parent: &RemoteNode,
    ) -> DriveResult<Option<RemoteNode>> {
        Ok(cache::get_child_by_name(&self.pool, &parent.id, name).await?)
    }

    async fn create_folder(&self, parent: &RemoteNode, name: &str) -> DriveResult<RemoteNode> {
        let item = self.client.create_folder(name, &parent.id).await?;
        let node = node_from_item(item);
        cache::upsert_node(&self.pool, &node).await?;
        Ok(node)
    }

    async fn trash_node_by_id(&self, id: &str) -> DriveResult<()> {
        let node = self.cached_node(id).await?;
        match node.kind {
            NodeKind::File => self.client.trash_file(id).await?,
            NodeKind::Folder => self.client.trash_folder(id).await?,
        }
        cache::mark_trashed(&self.pool, id).await?;
        Ok(())
    }

    async fn get_path(&self, node: &RemoteNode) -> DriveResult<String> {
        cache::node_path(&self.pool, &self.root_id, &node.id)
            .await?
            .ok_or_else(|| DriveError::NotVisible(node.id.clone()))
    }

    async fn upload_file(
        &self,
        parent: &RemoteNode,
        local_path: &Path,
        metadata: &LocalMetadata,
    ) -> DriveResult<RemoteNode> {
        let name = local_path
            .file_name()
            .and_then(|n| n.to_str())
            .context("Invalid file name")?;

        tracing::debug!(
            name,
            size = metadata.size,
            media_type = %metadata.media_type,
            "sending file to Box"
        );
        let item = self
            .client
            .upload_file(
                local_path,
                &parent.id,
                name,
                metadata.size,
                &metadata.media_type,
                Some(&metadata.content_modified_at),
            )
            .await?;

        let mut node = node_from_item(item);
        node.parent_id.get_or_insert_with(|| parent.id.clone());
        cache::upsert_node(&self.pool, &node).await?;
        Ok(node)
    }

    fn hasher(&self) -> HashKind {
        HashKind::Sha1
    }
}

fn node_from_item(item: BoxItem) -> RemoteNode {
    let kind = if item.is_folder() {
        NodeKind::Folder
    } else {
        NodeKind::File
    };
    let trashed = item.is_trashed();
    RemoteNode {
        id: item.id,
        parent_id: item.parent.map(|p| p.id),
        name: item.name,
        kind,
        trashed,
        hash: item.sha1,
        size: item.size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_conversion_keeps_parent_and_hash() {
        let item: BoxItem = serde_json::from_str(
            r#"{"type":"file","id":"7","name":"a.txt","size":3,"sha1":"abc",
                "parent":{"type":"folder","id":"5","name":"inbox"},"item_status":"active"}"#,
        )
        .unwrap();
        let node = node_from_item(item);
        assert_eq!(node.parent_id.as_deref(), Some("5"));
        assert_eq!(node.hash.as_deref(), Some("abc"));
        assert!(node.is_file());
        assert!(!node.trashed);
    }

    #[test]
    fn folder_conversion() {
        let item: BoxItem =
            serde_json::from_str(r#"{"type":"folder","id":"9","name":"show"}"#).unwrap();
        let node = node_from_item(item);
        assert!(node.is_folder());
        assert_eq!(node.parent_id, None);
    }

    mod stub {
        use std::collections::HashMap;

        use axum::extract::{Path as UrlPath, Query};
        use axum::http::StatusCode;
        use axum::routing::get;
        use axum::{Json, Router};
        use serde_json::{Value, json};

        use super::*;
        use crate::auth::TokenManager;
        use crate::config::AuthConfig;

        async fn events(Query(q): Query<HashMap<String, String>>) -> Json<Value> {
            let page = match q.get("stream_position").map(String::as_str) {
                Some("now") => json!({"chunk_size": 0, "next_stream_position": "10", "entries": []}),
                Some("10") => json!({"chunk_size": 4, "next_stream_position": "20", "entries": [
                    {"event_type": "ITEM_UPLOAD", "source": {"type": "file", "id": "f2", "name": "c.txt"}},
                    {"event_type": "ITEM_TRASH", "source": {"type": "file", "id": "f1", "name": "a.txt"}},
                    {"event_type": "ITEM_CREATE", "source": {"type": "folder", "id": "x9", "name": "elsewhere"}},
                    {"event_type": "ITEM_PREVIEW", "source": {"type": "file", "id": "f3"}}
                ]}),
                Some("20") => json!({"chunk_size": 1, "next_stream_position": 30, "entries": [
                    {"event_type": "ITEM_MODIFY", "source": {"type": "file", "id": "f404", "name": "b.txt"}}
                ]}),
                _ => json!({"chunk_size": 0, "next_stream_position": "30", "entries": []}),
            };
            Json(page)
        }

        fn not_found() -> (StatusCode, Json<Value>) {
            (
                StatusCode::NOT_FOUND,
                Json(json!({"type": "error", "status": 404, "code": "not_found", "message": "gone"})),
            )
        }

        async fn folder(UrlPath(id): UrlPath<String>) -> (StatusCode, Json<Value>) {
            let item = match id.as_str() {
                "0" => json!({"type": "folder", "id": "0", "name": "All Files"}),
                "5" => json!({"type": "folder", "id": "5", "name": "in", "parent": {"id": "0"}}),
                "x9" => json!({"type": "folder", "id": "x9", "name": "elsewhere", "parent": {"id": "999"}}),
                _ => return not_found(),
            };
            (StatusCode::OK, Json(item))
        }

        async fn folder_items(UrlPath(id): UrlPath<String>) -> Json<Value> {
            let entries = match id.as_str() {
                "0" => json!([
                    {"type": "folder", "id": "5", "name": "in"},
                    {"type": "file", "id": "f1", "name": "a.txt", "sha1": "aa"}
                ]),
                "5" => json!([{"type": "file", "id": "f404", "name": "b.txt", "sha1": "bb"}]),
                _ => json!([]),
            };
            Json(json!({"entries": entries}))
        }

        async fn file(UrlPath(id): UrlPath<String>) -> (StatusCode, Json<Value>) {
            match id.as_str() {
                "f2" => (
                    StatusCode::OK,
                    Json(json!({"type": "file", "id": "f2", "name": "c.txt", "sha1": "cc", "parent": {"id": "5"}})),
                ),
                _ => not_found(),
            }
        }

        async fn trash_file(UrlPath(id): UrlPath<String>) -> StatusCode {
            if id == "f1" {
                StatusCode::CONFLICT
            } else {
                StatusCode::NO_CONTENT
            }
        }

        /// A `BoxDrive` rooted at folder "0" of a local fake Box API:
        /// `/in/b.txt` and `/a.txt` exist, and the change feed holds two
        /// pages of events after the initial checkpoint.
        pub async fn drive() -> BoxDrive {
            let app = Router::new()
                .route("/events", get(events))
                .route("/folders/{id}", get(folder))
                .route("/folders/{id}/items", get(folder_items))
                .route("/files/{id}", get(file).delete(trash_file));
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                axum::serve(listener, app).await.unwrap();
            });

            let auth = AuthConfig {
                client_id: String::new(),
                client_secret: String::new(),
                token_path: None,
                developer_token: Some("test-token".into()),
            };
            let tokens = Arc::new(TokenManager::new(&auth).unwrap());
            let client = BoxClient::with_base_url(tokens, &format!("http://{addr}")).unwrap();
            let pool = crate::db::init_memory_db().await.unwrap();
            BoxDrive::new(Arc::new(client), pool, "0".into())
        }
    }

    #[tokio::test]
    async fn first_sync_crawls_then_replays_change_feed() {
        let drive = stub::drive().await;

        assert_eq!(drive.sync().await.unwrap(), 4);
        assert_eq!(cache::get_stream_position(&drive.pool).await.unwrap().as_deref(), Some("10"));
        assert!(drive.get_node_by_path("/in/b.txt").await.unwrap().is_some());
        assert!(drive.get_node_by_path("/in/c.txt").await.unwrap().is_none());

        // upload of c.txt, trash of a.txt, and b.txt gone on refetch;
        // the folder created outside the tree is not counted
        assert_eq!(drive.sync().await.unwrap(), 3);
        let added = drive.get_node_by_path("/in/c.txt").await.unwrap().unwrap();
        assert_eq!(added.hash.as_deref(), Some("cc"));
        assert!(drive.get_node_by_path("/a.txt").await.unwrap().is_none());
        assert!(cache::get_node(&drive.pool, "f1").await.unwrap().unwrap().trashed);
        assert!(cache::get_node(&drive.pool, "f404").await.unwrap().unwrap().trashed);
        assert!(cache::get_node(&drive.pool, "x9").await.unwrap().is_none());
        assert_eq!(cache::get_stream_position(&drive.pool).await.unwrap().as_deref(), Some("30"));

        assert_eq!(drive.sync().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn refused_trash_leaves_cache_untouched() {
        let drive = stub::drive().await;
        drive.sync().await.unwrap();

        assert!(drive.trash_node_by_id("f1").await.is_err());
        assert!(!cache::get_node(&drive.pool, "f1").await.unwrap().unwrap().trashed);

        drive.trash_node_by_id("f404").await.unwrap();
        assert!(cache::get_node(&drive.pool, "f404").await.unwrap().unwrap().trashed);
    }
}
