use serde::{Deserialize, Serialize};

/// Parent reference embedded in an item.
#[derive(Debug, Clone, Deserialize)]
pub struct FolderMini {
    pub id: String,
}

/// An item in a folder listing, or a single file/folder fetched by id.
#[derive(Debug, Clone, Deserialize)]
pub struct BoxItem {
    #[serde(rename = "type")]
    pub item_type: String,
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub sha1: Option<String>,
    #[serde(default)]
    pub parent: Option<FolderMini>,
    /// `active`, `trashed` or `deleted`.
    #[serde(default)]
    pub item_status: Option<String>,
}

impl BoxItem {
    pub fn is_file(&self) -> bool {
        self.item_type == "file"
    }
    pub fn is_folder(&self) -> bool {
        self.item_type == "folder"
    }
    pub fn is_trashed(&self) -> bool {
        matches!(self.item_status.as_deref(), Some("trashed" | "deleted"))
    }
}

/// Paginated response from GET /folders/{id}/items.
#[derive(Debug, Clone, Deserialize)]
pub struct FolderItems {
    pub entries: Vec<BoxItem>,
    #[serde(default)]
    pub next_marker: Option<String>,
}

/// Response from POST /files/content and the upload session commit.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadResponse {
    pub entries: Vec<BoxItem>,
}

/// Attributes JSON for file upload.
#[derive(Debug, Serialize)]
pub struct UploadAttributes {
    pub name: String,
    pub parent: ParentRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_modified_at: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ParentRef {
    pub id: String,
}

/// Chunked upload session from POST /files/upload_sessions.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadSession {
    pub id: String,
    pub part_size: u64,
    pub total_parts: u32,
}

/// A single uploaded part (returned by upload_part, needed for commit).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadPart {
    pub part_id: String,
    pub offset: u64,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha1: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadPartResponse {
    pub part: UploadPart,
}

#[derive(Debug, Serialize)]
pub struct CommitRequest {
    pub parts: Vec<UploadPart>,
    pub attributes: CommitAttributes,
}

#[derive(Debug, Serialize)]
pub struct CommitAttributes {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_modified_at: Option<String>,
}

/// Event stream response from GET /events.
#[derive(Debug, Clone, Deserialize)]
pub struct EventStream {
    #[serde(default)]
    pub chunk_size: u64,
    /// Box returns this as either a JSON string or a JSON number.
    #[serde(deserialize_with = "string_or_number")]
    pub next_stream_position: String,
    #[serde(default)]
    pub entries: Vec<BoxEvent>,
}

/// Deserialize a value that may be a JSON string or a JSON number into a String.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de;

    struct StringOrNumber;

    impl<'de> de::Visitor<'de> for StringOrNumber {
        type Value = String;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.write_str("a string or a number")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<String, E> {
            Ok(v.to_string())
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<String, E> {
            Ok(v.to_string())
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<String, E> {
            Ok(v.to_string())
        }
    }

    deserializer.deserialize_any(StringOrNumber)
}

/// A single event from the event stream.
#[derive(Debug, Clone, Deserialize)]
pub struct BoxEvent {
    pub event_type: String,
    #[serde(default)]
    pub source: Option<EventSource>,
}

/// The source object attached to an event (file or folder).
#[derive(Debug, Clone, Deserialize)]
pub struct EventSource {
    #[serde(rename = "type")]
    pub source_type: Option<String>,
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Request body for creating a folder.
#[derive(Debug, Serialize)]
pub struct CreateFolderRequest {
    pub name: String,
    pub parent: ParentRef,
}

/// Box API error response.
#[derive(Debug, Clone, Deserialize)]
pub struct BoxApiError {
    pub status: Option<u16>,
    pub code: Option<String>,
    pub message: Option<String>,
    pub request_id: Option<String>,
}

impl BoxApiError {
    /// Build an error from a non-JSON error body.
    pub fn from_status(status: u16, body: String) -> Self {
        Self {
            status: Some(status),
            code: None,
            message: Some(body),
            request_id: None,
        }
    }
}

impl std::fmt::Display for BoxApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Box API error {}: {} (code: {})",
            self.status.unwrap_or(0),
            self.message.as_deref().unwrap_or("unknown"),
            self.code.as_deref().unwrap_or("none"),
        )?;
        if let Some(id) = &self.request_id {
            write!(f, " [request {id}]")?;
        }
        Ok(())
    }
}

impl std::error::Error for BoxApiError {}

/// Whether `err` (or anything it wraps) is a Box 404.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.chain().any(|e| {
        e.downcast_ref::<BoxApiError>()
            .is_some_and(|b| b.status == Some(404))
    })
}
