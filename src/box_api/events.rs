use anyhow::{Context, Result};
use reqwest::Method;

use super::client::BoxClient;
use super::types::{BoxEvent, EventStream};

/// Event types that change the shape or content of the tree.
pub const SYNC_EVENT_TYPES: &[&str] = &[
    "ITEM_UPLOAD",
    "ITEM_CREATE",
    "ITEM_MODIFY",
    "ITEM_COPY",
    "ITEM_MOVE",
    "ITEM_RENAME",
    "ITEM_TRASH",
    "ITEM_UNDELETE_VIA_TRASH",
];

const EVENT_PAGE_LIMIT: &str = "500";

impl BoxClient {
    /// Get the current stream position (use "now" to get latest without events).
    pub async fn get_stream_position(&self) -> Result<String> {
        let resp = self
            .api_request(Method::GET, "/events")
            .query(&[("stream_position", "now"), ("stream_type", "changes")])
            .send()
            .await
            .context("Failed to get stream position")?;

        let stream: EventStream = resp
            .json()
            .await
            .context("Failed to parse events response")?;

        Ok(stream.next_stream_position)
    }

    /// Fetch one page of sync-relevant events after `stream_position`.
    /// Returns the events, the next position and whether the page was full.
    pub async fn get_sync_events(
        &self,
        stream_position: &str,
    ) -> Result<(Vec<BoxEvent>, String, bool)> {
        let resp = self
            .api_request(Method::GET, "/events")
            .query(&[
                ("stream_type", "changes"),
                ("stream_position", stream_position),
                ("limit", EVENT_PAGE_LIMIT),
            ])
            .send()
            .await
            .context("Failed to get events")?;

        let stream: EventStream = resp
            .json()
            .await
            .context("Failed to parse events response")?;

        let more = stream.chunk_size > 0 && stream.next_stream_position != stream_position;
        let filtered = stream
            .entries
            .into_iter()
            .filter(|e| SYNC_EVENT_TYPES.contains(&e.event_type.as_str()))
            .collect();

        Ok((filtered, stream.next_stream_position, more))
    }
}
