use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;

/// Splits a byte stream into complete lines, holding back a trailing
/// fragment until its newline arrives.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let Some(end) = self.pending.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };

        let rest = self.pending.split_off(end + 1);
        let complete = std::mem::replace(&mut self.pending, rest);
        complete[..end]
            .split(|&b| b == b'\n')
            .map(|line| {
                let line = line.strip_suffix(b"\r").unwrap_or(line);
                String::from_utf8_lossy(line).into_owned()
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Follows a growing log file from a byte offset.
pub struct LogTail {
    path: PathBuf,
    offset: u64,
    buffer: LineBuffer,
}

impl LogTail {
    /// Start at the current end of the file; existing lines are not replayed.
    pub fn open_at_end(path: &Path) -> Result<Self> {
        let offset = match std::fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => {
                return Err(e).with_context(|| format!("Cannot stat {}", path.display()));
            }
        };
        Ok(Self {
            path: path.to_path_buf(),
            offset,
            buffer: LineBuffer::default(),
        })
    }

    /// Read whatever was appended since the last call.
    pub fn read_new_lines(&mut self) -> Result<Vec<String>> {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("Cannot open {}", self.path.display()));
            }
        };

        let len = file.metadata()?.len();
        if len < self.offset {
            tracing::debug!(path = %self.path.display(), "log truncated, reading from start");
            self.offset = 0;
            self.buffer.clear();
        }

        file.seek(SeekFrom::Start(self.offset))?;
        let mut chunk = Vec::new();
        file.read_to_end(&mut chunk)
            .with_context(|| format!("Cannot read {}", self.path.display()))?;
        self.offset += chunk.len() as u64;
        Ok(self.buffer.push(&chunk))
    }
}

/// Extracts the finished item name from a downloader log line.
pub struct CompletionMatcher {
    re: Regex,
}

impl CompletionMatcher {
    pub fn new(pattern: &str) -> Result<Self> {
        let re = Regex::new(pattern).with_context(|| format!("Invalid finished pattern: {pattern}"))?;
        if re.captures_len() < 2 {
            anyhow::bail!("finished pattern must have a capture group for the item name");
        }
        Ok(Self { re })
    }

    pub fn completed_item(&self, line: &str) -> Option<String> {
        let name = self.re.captures(line)?.get(1)?.as_str();
        (!name.is_empty()).then(|| name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::config::default_finished_pattern;

    #[test]
    fn partial_line_waits_for_newline() {
        let mut buf = LineBuffer::default();
        assert!(buf.push(b"[info] first").is_empty());
        assert_eq!(buf.push(b" half\n[info] sec"), ["[info] first half"]);
        assert_eq!(buf.push(b"ond\r\nthird\n"), ["[info] second", "third"]);
        assert!(buf.push(b"").is_empty());
    }

    #[test]
    fn tail_skips_existing_content_and_follows_appends() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("log_out");
        std::fs::write(&path, "old line\n").unwrap();

        let mut tail = LogTail::open_at_end(&path).unwrap();
        assert!(tail.read_new_lines().unwrap().is_empty());

        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        write!(f, "new line\npart").unwrap();
        assert_eq!(tail.read_new_lines().unwrap(), ["new line"]);
        write!(f, "ial\n").unwrap();
        assert_eq!(tail.read_new_lines().unwrap(), ["partial"]);
    }

    #[test]
    fn tail_restarts_after_truncation() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("log_out");
        std::fs::write(&path, "a fairly long line that was here before\n").unwrap();

        let mut tail = LogTail::open_at_end(&path).unwrap();
        std::fs::write(&path, "fresh\n").unwrap();
        assert_eq!(tail.read_new_lines().unwrap(), ["fresh"]);
    }

    #[test]
    fn tail_of_missing_file_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("not_yet");
        let mut tail = LogTail::open_at_end(&path).unwrap();
        assert!(tail.read_new_lines().unwrap().is_empty());

        std::fs::write(&path, "hello\n").unwrap();
        assert_eq!(tail.read_new_lines().unwrap(), ["hello"]);
    }

    #[test]
    fn matcher_extracts_gallery_name() {
        let matcher = CompletionMatcher::new(&default_finished_pattern()).unwrap();
        assert_eq!(
            matcher
                .completed_item("[info] GalleryDownloader: Finished download of gallery: Some Title [123]")
                .as_deref(),
            Some("Some Title [123]")
        );
        assert!(matcher.completed_item("[info] GalleryDownloader: Started download").is_none());
        assert!(
            matcher
                .completed_item("[info] GalleryDownloader: Finished download of gallery: ")
                .is_none()
        );
    }

    #[test]
    fn matcher_requires_capture_group() {
        assert!(CompletionMatcher::new(r"^done$").is_err());
        assert!(CompletionMatcher::new(r"(unclosed").is_err());
    }
}
