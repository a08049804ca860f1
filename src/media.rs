use std::path::Path;

use anyhow::{Context, Result};
use chrono::SecondsFormat;

/// Metadata describing a local file, handed to the drive alongside its content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalMetadata {
    pub size: u64,
    /// RFC 3339, second precision, UTC.
    pub content_modified_at: String,
    /// MIME type by extension, sent as the content type of the file part.
    pub media_type: String,
}

pub async fn extract_metadata(path: &Path) -> Result<LocalMetadata> {
    let meta = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("Cannot stat {}", path.display()))?;

    Ok(LocalMetadata {
        size: meta.len(),
        content_modified_at: file_mtime_rfc3339(&meta)?,
        media_type: guess_media_type(path),
    })
}

/// File mtime as RFC 3339 in whole seconds, UTC. Box rejects more than
/// three fractional digits.
fn file_mtime_rfc3339(meta: &std::fs::Metadata) -> Result<String> {
    use std::time::UNIX_EPOCH;
    let dur = meta
        .modified()?
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let dt = chrono::DateTime::from_timestamp(dur.as_secs() as i64, 0).unwrap_or_default();
    Ok(dt.to_rfc3339_opts(SecondsFormat::Secs, true))
}

fn guess_media_type(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}
