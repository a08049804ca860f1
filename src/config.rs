use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub drive: DriveConfig,
    pub upload: UploadConfig,
    #[serde(default)]
    pub watch: Option<WatchConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    /// Width of the blocking pool used for content hashing.
    #[serde(default = "default_hash_workers")]
    pub hash_workers: usize,
    /// How many upload jobs the daemon admits at once.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// Delay before pulling remote changes, giving the remote time to settle.
    #[serde(default = "default_sync_settle_ms")]
    pub sync_settle_ms: u64,
    #[serde(default = "default_folder_poll_attempts")]
    pub folder_poll_attempts: u32,
    #[serde(default = "default_folder_poll_backoff_ms")]
    pub folder_poll_backoff_ms: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            hash_workers: default_hash_workers(),
            queue_depth: default_queue_depth(),
            sync_settle_ms: default_sync_settle_ms(),
            folder_poll_attempts: default_folder_poll_attempts(),
            folder_poll_backoff_ms: default_folder_poll_backoff_ms(),
        }
    }
}

fn default_hash_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
fn default_queue_depth() -> usize {
    8
}
fn default_sync_settle_ms() -> u64 {
    1000
}
fn default_folder_poll_attempts() -> u32 {
    10
}
fn default_folder_poll_backoff_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    /// Custom path for token storage
    pub token_path: Option<PathBuf>,
    /// Short-lived developer token; bypasses the token file when set.
    #[serde(default)]
    pub developer_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DriveConfig {
    /// Box folder that the remote path `/` refers to.
    #[serde(default = "default_root_folder_id")]
    pub root_folder_id: String,
    /// Custom path for the node cache database
    pub db_path: Option<PathBuf>,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            root_folder_id: default_root_folder_id(),
            db_path: None,
        }
    }
}

fn default_root_folder_id() -> String {
    "0".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Remote folder that completed downloads are uploaded into.
    pub upload_to: String,
    /// Regular expressions matched (case-insensitively, from the start) against entry names.
    #[serde(default)]
    pub exclude_pattern: Vec<String>,
    /// URL serving a JSON object of `name -> pattern`, fetched on every check.
    #[serde(default)]
    pub exclude_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchConfig {
    /// Downloader log file to tail.
    pub log_path: PathBuf,
    /// Directory the downloader places finished items in.
    pub download_path: PathBuf,
    /// Regex with one capture group yielding the finished item name.
    #[serde(default = "default_finished_pattern")]
    pub finished_pattern: String,
    #[serde(default = "default_watch_debounce_ms")]
    pub debounce_ms: u64,
}

pub fn default_finished_pattern() -> String {
    r"^\[info\] GalleryDownloader: Finished download of gallery: (.*)$".into()
}
fn default_watch_debounce_ms() -> u64 {
    500
}

pub fn default_config_path() -> Result<PathBuf> {
    let dir = dirs::config_dir().context("Could not determine config directory")?;
    Ok(dir.join("driveup").join("config.toml"))
}

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => default_config_path()?,
    };

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config = parse_config(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    Ok(config)
}

pub(crate) fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content)?;

    if config.auth.developer_token.is_none() {
        if config.auth.client_id.is_empty() {
            anyhow::bail!("auth.client_id must not be empty");
        }
        if config.auth.client_secret.is_empty() {
            anyhow::bail!("auth.client_secret must not be empty");
        }
    }
    if !config.upload.upload_to.starts_with('/') {
        anyhow::bail!("upload.upload_to must be an absolute remote path");
    }
    if config.general.hash_workers == 0 || config.general.queue_depth == 0 {
        anyhow::bail!("general.hash_workers and general.queue_depth must be at least 1");
    }

    Ok(config)
}
