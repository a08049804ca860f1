use std::path::Path;

use anyhow::{Context, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::Method;
use sha1::{Digest, Sha1};
use tokio::io::AsyncReadExt;

use super::client::BoxClient;
use super::folders::ITEM_FIELDS;
use super::types::{
    BoxItem, CommitAttributes, CommitRequest, ParentRef, UploadAttributes, UploadPart,
    UploadPartResponse, UploadResponse, UploadSession,
};

/// Threshold for switching to chunked upload (20 MB).
pub const CHUNKED_UPLOAD_THRESHOLD: u64 = 20 * 1024 * 1024;

impl BoxClient {
    pub async fn get_file(&self, file_id: &str) -> Result<BoxItem> {
        let resp = self
            .api_request(Method::GET, &format!("/files/{file_id}"))
            .query(&[("fields", ITEM_FIELDS)])
            .send()
            .await
            .with_context(|| format!("Failed to get file {file_id}"))?;

        resp.json().await.context("Failed to parse file response")
    }

    /// Move a file to the trash.
    pub async fn trash_file(&self, file_id: &str) -> Result<()> {
        let resp = self
            .api_request(Method::DELETE, &format!("/files/{file_id}"))
            .send()
            .await
            .with_context(|| format!("Failed to trash file {file_id}"))?;

        if resp.status() == reqwest::StatusCode::CONFLICT {
            anyhow::bail!("File {file_id} could not be trashed (conflict)");
        }
        Ok(())
    }

    /// Upload a new file to Box. Chooses direct or chunked upload by `size`.
    pub async fn upload_file(
        &self,
        local_path: &Path,
        parent_id: &str,
        remote_name: &str,
        size: u64,
        content_type: &str,
        content_modified_at: Option<&str>,
    ) -> Result<BoxItem> {
        if size >= CHUNKED_UPLOAD_THRESHOLD {
            return self
                .chunked_upload(local_path, parent_id, remote_name, size, content_modified_at)
                .await;
        }

        let attrs = UploadAttributes {
            name: remote_name.to_string(),
            parent: ParentRef {
                id: parent_id.to_string(),
            },
            content_modified_at: content_modified_at.map(String::from),
        };
        let attrs_json = serde_json::to_string(&attrs)?;

        let file_bytes = tokio::fs::read(local_path)
            .await
            .with_context(|| format!("Failed to read {}", local_path.display()))?;

        let file_part = reqwest::multipart::Part::bytes(file_bytes)
            .file_name(remote_name.to_string())
            .mime_str(content_type)
            .with_context(|| format!("Invalid content type {content_type}"))?;
        let form = reqwest::multipart::Form::new()
            .text("attributes", attrs_json)
            .part("file", file_part);

        let resp = self
            .upload_request(Method::POST, "/files/content")
            .query(&[("fields", ITEM_FIELDS)])
            .multipart(form)
            .send()
            .await
            .context("Failed to upload file")?;

        if resp.status() == reqwest::StatusCode::CONFLICT {
            anyhow::bail!("File '{remote_name}' already exists in folder {parent_id}");
        }

        first_entry(resp).await
    }

    // --- Chunked upload ---

    async fn chunked_upload(
        &self,
        local_path: &Path,
        parent_id: &str,
        remote_name: &str,
        size: u64,
        content_modified_at: Option<&str>,
    ) -> Result<BoxItem> {
        let session = self
            .create_upload_session(parent_id, remote_name, size)
            .await?;
        tracing::debug!(
            session_id = %session.id,
            total_parts = session.total_parts,
            part_size = session.part_size,
            "upload session created"
        );

        let mut file = tokio::fs::File::open(local_path)
            .await
            .with_context(|| format!("Failed to open {}", local_path.display()))?;

        let mut file_hasher = Sha1::new();
        let mut parts = Vec::with_capacity(session.total_parts as usize);
        let mut offset = 0u64;
        let mut buf = vec![0u8; session.part_size as usize];

        while offset < size {
            let want = (size - offset).min(session.part_size) as usize;
            file.read_exact(&mut buf[..want])
                .await
                .with_context(|| format!("Failed to read {}", local_path.display()))?;
            let chunk = &buf[..want];
            file_hasher.update(chunk);

            tracing::debug!(
                session_id = %session.id,
                part = parts.len() + 1,
                total_parts = session.total_parts,
                "uploading part"
            );
            let part = self
                .upload_part(&session.id, chunk.to_vec(), offset, size)
                .await?;
            parts.push(part);
            offset += want as u64;
        }

        self.commit_upload(
            &session.id,
            parts,
            &file_hasher.finalize(),
            content_modified_at,
        )
        .await
    }

    async fn create_upload_session(
        &self,
        folder_id: &str,
        file_name: &str,
        file_size: u64,
    ) -> Result<UploadSession> {
        #[derive(serde::Serialize)]
        struct Req<'a> {
            folder_id: &'a str,
            file_size: u64,
            file_name: &'a str,
        }
        let resp = self
            .upload_request(Method::POST, "/files/upload_sessions")
            .json(&Req {
                folder_id,
                file_size,
                file_name,
            })
            .send()
            .await
            .context("Failed to create upload session")?;

        if resp.status() == reqwest::StatusCode::CONFLICT {
            anyhow::bail!("File '{file_name}' already exists in folder {folder_id}");
        }

        resp.json()
            .await
            .context("Failed to parse upload session response")
    }

    async fn upload_part(
        &self,
        session_id: &str,
        part_data: Vec<u8>,
        offset: u64,
        total_size: u64,
    ) -> Result<UploadPart> {
        let part_size = part_data.len() as u64;
        let content_range = format!("bytes {}-{}/{}", offset, offset + part_size - 1, total_size);
        let digest_header = format!("sha={}", BASE64.encode(Sha1::digest(&part_data)));

        let resp = self
            .upload_request(Method::PUT, &format!("/files/upload_sessions/{session_id}"))
            .header("content-range", &content_range)
            .header("digest", &digest_header)
            .header("content-type", "application/octet-stream")
            .body(reqwest::Body::from(part_data))
            .send()
            .await
            .context("Failed to upload part")?;

        let part_resp: UploadPartResponse =
            resp.json().await.context("Failed to parse part response")?;
        Ok(part_resp.part)
    }

    async fn commit_upload(
        &self,
        session_id: &str,
        parts: Vec<UploadPart>,
        file_sha1: &[u8],
        content_modified_at: Option<&str>,
    ) -> Result<BoxItem> {
        let digest_header = format!("sha={}", BASE64.encode(file_sha1));
        let commit = CommitRequest {
            parts,
            attributes: CommitAttributes {
                content_modified_at: content_modified_at.map(String::from),
            },
        };
        let path = format!("/files/upload_sessions/{session_id}/commit");

        // Box answers 202 while it is still assembling the parts.
        for _ in 0..10 {
            let resp = self
                .upload_request(Method::POST, &path)
                .header("digest", &digest_header)
                .json(&commit)
                .send()
                .await
                .context("Failed to commit upload")?;

            if resp.status() != reqwest::StatusCode::ACCEPTED {
                return first_entry(resp).await;
            }

            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(2);
            tracing::debug!(session_id, retry_after, "commit not ready yet");
            tokio::time::sleep(std::time::Duration::from_secs(retry_after)).await;
        }

        anyhow::bail!("Upload session {session_id} was never committed")
    }
}

async fn first_entry(resp: reqwest::Response) -> Result<BoxItem> {
    let upload_resp: UploadResponse = resp
        .json()
        .await
        .context("Failed to parse upload response")?;
    upload_resp
        .entries
        .into_iter()
        .next()
        .context("Upload response contained no file entries")
}
