use anyhow::{Context, Result};
use sqlx::{Row, SqlitePool};

use super::{NodeKind, RemoteNode};

/// Deeper parent chains than this are treated as corrupt (cycles).
const MAX_DEPTH: usize = 1024;

fn node_from_row(row: &sqlx::sqlite::SqliteRow) -> RemoteNode {
    let is_folder: bool = row.get("is_folder");
    let size: Option<i64> = row.get("size");
    RemoteNode {
        id: row.get("id"),
        parent_id: row.get("parent_id"),
        name: row.get("name"),
        kind: if is_folder {
            NodeKind::Folder
        } else {
            NodeKind::File
        },
        trashed: row.get("trashed"),
        hash: row.get("hash"),
        size: size.map(|s| s as u64),
    }
}

/// Insert or replace a node.
pub async fn upsert_node(pool: &SqlitePool, node: &RemoteNode) -> Result<()> {
    let now = chrono::Utc::now().to_rfc3339();

    sqlx::query(
        r#"INSERT INTO nodes (id, parent_id, name, is_folder, trashed, hash, size, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            parent_id = excluded.parent_id,
            name = excluded.name,
            is_folder = excluded.is_folder,
            trashed = excluded.trashed,
            hash = excluded.hash,
            size = excluded.size,
            updated_at = excluded.updated_at"#,
    )
    .bind(&node.id)
    .bind(&node.parent_id)
    .bind(&node.name)
    .bind(node.is_folder())
    .bind(node.trashed)
    .bind(&node.hash)
    .bind(node.size.map(|s| s as i64))
    .bind(&now)
    .execute(pool)
    .await
    .with_context(|| format!("Failed to upsert node {}", node.id))?;

    Ok(())
}

pub async fn get_node(pool: &SqlitePool, id: &str) -> Result<Option<RemoteNode>> {
    let row = sqlx::query("SELECT * FROM nodes WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch node")?;

    Ok(row.as_ref().map(node_from_row))
}

/// Child of `parent_id` named `name`, preferring a live node over a trashed one.
pub async fn get_child_by_name(
    pool: &SqlitePool,
    parent_id: &str,
    name: &str,
) -> Result<Option<RemoteNode>> {
    let row = sqlx::query(
        "SELECT * FROM nodes WHERE parent_id = ? AND name = ? \
         ORDER BY trashed ASC, updated_at DESC LIMIT 1",
    )
    .bind(parent_id)
    .bind(name)
    .fetch_optional(pool)
    .await
    .context("Failed to fetch child node")?;

    Ok(row.as_ref().map(node_from_row))
}

/// Mark a node trashed. Returns false if the node was not cached.
pub async fn mark_trashed(pool: &SqlitePool, id: &str) -> Result<bool> {
    let now = chrono::Utc::now().to_rfc3339();
    let result = sqlx::query("UPDATE nodes SET trashed = 1, updated_at = ? WHERE id = ?")
        .bind(&now)
        .bind(id)
        .execute(pool)
        .await
        .context("Failed to mark node trashed")?;
    Ok(result.rows_affected() > 0)
}

/// Absolute path of `node_id` relative to `root_id` (which maps to `/`).
/// Returns `None` when some ancestor is missing from the cache.
pub async fn node_path(pool: &SqlitePool, root_id: &str, node_id: &str) -> Result<Option<String>> {
    let mut names = Vec::new();
    let mut current = node_id.to_string();

    for _ in 0..MAX_DEPTH {
        if current == root_id {
            names.reverse();
            return Ok(Some(format!("/{}", names.join("/"))));
        }
        let Some(node) = get_node(pool, &current).await? else {
            return Ok(None);
        };
        let Some(parent) = node.parent_id else {
            // Reached a top-level node that is not our root.
            return Ok(None);
        };
        names.push(node.name);
        current = parent;
    }

    anyhow::bail!("Parent chain of node {node_id} exceeds {MAX_DEPTH} levels");
}

pub async fn get_stream_position(pool: &SqlitePool) -> Result<Option<String>> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT stream_position FROM checkpoint WHERE id = 1")
            .fetch_optional(pool)
            .await?;
    Ok(row.map(|r| r.0))
}

pub async fn set_stream_position(pool: &SqlitePool, position: &str) -> Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    sqlx::query(
        r#"INSERT INTO checkpoint (id, stream_position, updated_at)
        VALUES (1, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            stream_position = excluded.stream_position,
            updated_at = excluded.updated_at"#,
    )
    .bind(position)
    .bind(&now)
    .execute(pool)
    .await
    .context("Failed to update stream position")?;
    Ok(())
}

/// Node counts for status output.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub files: i64,
    pub folders: i64,
    pub trashed: i64,
}

pub async fn stats(pool: &SqlitePool) -> Result<CacheStats> {
    let row = sqlx::query(
        "SELECT \
           COALESCE(SUM(CASE WHEN is_folder = 0 AND trashed = 0 THEN 1 ELSE 0 END), 0) AS files, \
           COALESCE(SUM(CASE WHEN is_folder = 1 AND trashed = 0 THEN 1 ELSE 0 END), 0) AS folders, \
           COALESCE(SUM(trashed), 0) AS trashed \
         FROM nodes",
    )
    .fetch_one(pool)
    .await
    .context("Failed to count cached nodes")?;

    Ok(CacheStats {
        files: row.get("files"),
        folders: row.get("folders"),
        trashed: row.get("trashed"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn folder(id: &str, parent: Option<&str>, name: &str) -> RemoteNode {
        RemoteNode {
            id: id.into(),
            parent_id: parent.map(String::from),
            name: name.into(),
            kind: NodeKind::Folder,
            trashed: false,
            hash: None,
            size: None,
        }
    }

    fn file(id: &str, parent: &str, name: &str, hash: &str) -> RemoteNode {
        RemoteNode {
            id: id.into(),
            parent_id: Some(parent.into()),
            name: name.into(),
            kind: NodeKind::File,
            trashed: false,
            hash: Some(hash.into()),
            size: Some(3),
        }
    }

    #[tokio::test]
    async fn path_walks_up_to_root() {
        let pool = db::init_memory_db().await.unwrap();
        upsert_node(&pool, &folder("0", None, "")).await.unwrap();
        upsert_node(&pool, &folder("10", Some("0"), "incoming")).await.unwrap();
        upsert_node(&pool, &file("11", "10", "a.txt", "abc")).await.unwrap();

        assert_eq!(node_path(&pool, "0", "0").await.unwrap().as_deref(), Some("/"));
        assert_eq!(
            node_path(&pool, "0", "11").await.unwrap().as_deref(),
            Some("/incoming/a.txt")
        );
        assert_eq!(node_path(&pool, "0", "99").await.unwrap(), None);
    }

    #[tokio::test]
    async fn path_outside_root_is_unresolved() {
        let pool = db::init_memory_db().await.unwrap();
        upsert_node(&pool, &folder("0", None, "")).await.unwrap();
        upsert_node(&pool, &folder("10", Some("0"), "scoped")).await.unwrap();
        upsert_node(&pool, &folder("20", Some("0"), "elsewhere")).await.unwrap();

        assert_eq!(node_path(&pool, "10", "10").await.unwrap().as_deref(), Some("/"));
        assert_eq!(node_path(&pool, "10", "20").await.unwrap(), None);
    }

    #[tokio::test]
    async fn live_child_preferred_over_trashed() {
        let pool = db::init_memory_db().await.unwrap();
        upsert_node(&pool, &folder("0", None, "")).await.unwrap();
        upsert_node(&pool, &file("1", "0", "a.txt", "old")).await.unwrap();
        assert!(mark_trashed(&pool, "1").await.unwrap());

        let only = get_child_by_name(&pool, "0", "a.txt").await.unwrap().unwrap();
        assert!(only.trashed);

        upsert_node(&pool, &file("2", "0", "a.txt", "new")).await.unwrap();
        let live = get_child_by_name(&pool, "0", "a.txt").await.unwrap().unwrap();
        assert_eq!(live.id, "2");
        assert!(!live.trashed);
    }

    #[tokio::test]
    async fn checkpoint_roundtrip_and_stats() {
        let pool = db::init_memory_db().await.unwrap();
        assert_eq!(get_stream_position(&pool).await.unwrap(), None);
        set_stream_position(&pool, "100").await.unwrap();
        set_stream_position(&pool, "200").await.unwrap();
        assert_eq!(get_stream_position(&pool).await.unwrap().as_deref(), Some("200"));

        upsert_node(&pool, &folder("0", None, "")).await.unwrap();
        upsert_node(&pool, &file("1", "0", "a", "h")).await.unwrap();
        upsert_node(&pool, &file("2", "0", "b", "h")).await.unwrap();
        mark_trashed(&pool, "2").await.unwrap();

        let s = stats(&pool).await.unwrap();
        assert_eq!(
            s,
            CacheStats {
                files: 1,
                folders: 1,
                trashed: 1
            }
        );
        assert!(!mark_trashed(&pool, "missing").await.unwrap());
    }
}
