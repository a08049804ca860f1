use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenData {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl TokenData {
    pub fn expires_within(&self, margin: Duration) -> bool {
        self.expires_at <= Utc::now() + margin
    }
}

/// The on-disk token pair, readable by the owner only.
pub struct TokenFile {
    path: PathBuf,
}

impl TokenFile {
    /// Use `custom`, or `$XDG_DATA_HOME/driveup/tokens.json`.
    pub fn locate(custom: Option<&Path>) -> Result<Self> {
        let path = match custom {
            Some(p) => p.to_path_buf(),
            None => dirs::data_dir()
                .context("Could not determine data directory")?
                .join("driveup")
                .join("tokens.json"),
        };
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> Result<TokenData> {
        let raw = std::fs::read(&self.path)
            .with_context(|| format!("Failed to read token file: {}", self.path.display()))?;
        serde_json::from_slice(&raw)
            .with_context(|| format!("Failed to parse token file: {}", self.path.display()))
    }

    /// Replace the file atomically via a 0600 staging file.
    pub fn write(&self, tokens: &TokenData) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }

        let staging = self.path.with_extension("json.tmp");
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options
            .open(&staging)
            .with_context(|| format!("Failed to write token file: {}", staging.display()))?;
        serde_json::to_writer_pretty(&mut file, tokens)?;
        file.flush()?;
        drop(file);

        std::fs::rename(&staging, &self.path)
            .with_context(|| format!("Failed to save token file: {}", self.path.display()))
    }
}
