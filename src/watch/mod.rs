mod log_tail;

use log_tail::{CompletionMatcher, LogTail};

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use notify_debouncer_mini::{DebouncedEventKind, new_debouncer};
use tokio::sync::mpsc;

use crate::config::WatchConfig;

/// A download the external downloader reported as finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedItem {
    /// Item name; also its directory under the download path.
    pub name: String,
}

/// Watch the downloader log for completion lines.
///
/// The log's directory is watched (the file itself may be rotated or
/// recreated). Every debounced change to the log file triggers a tail
/// read, and each matching line yields a `CompletedItem`.
///
/// The watcher runs until the returned `WatcherHandle` is dropped.
pub fn start_log_watcher(
    config: &WatchConfig,
) -> Result<(mpsc::UnboundedReceiver<CompletedItem>, WatcherHandle)> {
    let (tx, rx) = mpsc::unbounded_channel();

    let matcher = CompletionMatcher::new(&config.finished_pattern)?;
    let log_path = resolve_log_path(&config.log_path)?;
    let log_dir = log_path
        .parent()
        .map(|p| p.to_path_buf())
        .context("Log path has no parent directory")?;
    let mut tail = LogTail::open_at_end(&log_path)?;

    let watched = log_path.clone();
    let mut debouncer = new_debouncer(
        Duration::from_millis(config.debounce_ms),
        move |result: Result<Vec<notify_debouncer_mini::DebouncedEvent>, notify::Error>| {
            let events = match result {
                Ok(events) => events,
                Err(e) => {
                    tracing::error!(error = %e, "log watcher error");
                    return;
                }
            };
            let touched = events.iter().any(|event| {
                event.path == watched
                    && matches!(
                        event.kind,
                        DebouncedEventKind::Any | DebouncedEventKind::AnyContinuous
                    )
            });
            if !touched {
                return;
            }

            let lines = match tail.read_new_lines() {
                Ok(lines) => lines,
                Err(e) => {
                    tracing::warn!(error = %format!("{e:#}"), "cannot read downloader log");
                    return;
                }
            };
            for line in lines {
                if let Some(name) = matcher.completed_item(&line) {
                    tracing::info!(name = %name, "download finished");
                    let _ = tx.send(CompletedItem { name });
                }
            }
        },
    )
    .context("Failed to create log watcher")?;

    debouncer
        .watcher()
        .watch(&log_dir, notify::RecursiveMode::NonRecursive)
        .with_context(|| format!("Failed to watch {}", log_dir.display()))?;
    tracing::info!(log = %log_path.display(), "watching downloader log");

    Ok((
        rx,
        WatcherHandle {
            _debouncer: debouncer,
        },
    ))
}

/// Handle that keeps the watcher alive. Drop to stop watching.
pub struct WatcherHandle {
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
}

/// Absolute log path with a canonical directory, matching the paths the
/// watcher reports.
fn resolve_log_path(path: &std::path::Path) -> Result<PathBuf> {
    let name = path
        .file_name()
        .with_context(|| format!("Log path has no file name: {}", path.display()))?;
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let dir = dir
        .canonicalize()
        .with_context(|| format!("Log directory does not exist: {}", dir.display()))?;
    Ok(dir.join(name))
}
