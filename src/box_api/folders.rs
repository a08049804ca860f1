use anyhow::{Context, Result};
use reqwest::Method;

use super::client::BoxClient;
use super::types::{BoxItem, CreateFolderRequest, FolderItems, ParentRef};

/// Fields requested for every item the node cache stores.
pub(super) const ITEM_FIELDS: &str = "type,id,name,size,sha1,parent,item_status";

impl BoxClient {
    /// List all items in a folder, handling pagination automatically.
    /// Returns all files and subfolders (not recursive, one level only).
    pub async fn list_folder_items(&self, folder_id: &str) -> Result<Vec<BoxItem>> {
        let mut all_items = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let mut params = vec![
                ("fields", ITEM_FIELDS),
                ("limit", "1000"),
                ("usemarker", "true"),
            ];
            if let Some(ref m) = marker {
                params.push(("marker", m.as_str()));
            }

            let resp = self
                .api_request(Method::GET, &format!("/folders/{folder_id}/items"))
                .query(&params)
                .send()
                .await
                .with_context(|| format!("Failed to list folder {folder_id}"))?;

            let page: FolderItems = resp
                .json()
                .await
                .context("Failed to parse folder items response")?;

            all_items.extend(page.entries);

            match page.next_marker {
                Some(m) if !m.is_empty() => marker = Some(m),
                _ => break,
            }
        }

        Ok(all_items)
    }

    pub async fn get_folder(&self, folder_id: &str) -> Result<BoxItem> {
        let resp = self
            .api_request(Method::GET, &format!("/folders/{folder_id}"))
            .query(&[("fields", ITEM_FIELDS)])
            .send()
            .await
            .with_context(|| format!("Failed to get folder {folder_id}"))?;

        resp.json().await.context("Failed to parse folder response")
    }

    pub async fn create_folder(&self, name: &str, parent_id: &str) -> Result<BoxItem> {
        let body = CreateFolderRequest {
            name: name.to_string(),
            parent: ParentRef {
                id: parent_id.to_string(),
            },
        };

        let resp = self
            .api_request(Method::POST, "/folders")
            .query(&[("fields", ITEM_FIELDS)])
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Failed to create folder {name} in {parent_id}"))?;

        if resp.status() == reqwest::StatusCode::CONFLICT {
            anyhow::bail!("Folder '{name}' already exists in parent {parent_id}");
        }

        resp.json()
            .await
            .context("Failed to parse create folder response")
    }

    /// Move a folder and its contents to the trash.
    pub async fn trash_folder(&self, folder_id: &str) -> Result<()> {
        let resp = self
            .api_request(Method::DELETE, &format!("/folders/{folder_id}"))
            .query(&[("recursive", "true")])
            .send()
            .await
            .with_context(|| format!("Failed to trash folder {folder_id}"))?;

        if resp.status() == reqwest::StatusCode::CONFLICT {
            anyhow::bail!("Folder {folder_id} could not be trashed (conflict)");
        }
        Ok(())
    }
}
