use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use sha1::{Digest, Sha1};
use tokio::sync::Semaphore;

const BUF_SIZE: usize = 64 * 1024;

/// Digest algorithm the remote drive reports for file content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashKind {
    Sha1,
}

/// Bounded pool for CPU-bound hashing, kept off the async worker threads.
#[derive(Clone)]
pub struct HashPool {
    permits: Arc<Semaphore>,
}

impl HashPool {
    pub fn new(workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Hash a local file on the blocking pool, returning a lowercase hex digest.
    pub async fn digest(&self, kind: HashKind, path: &Path) -> Result<String> {
        let _permit = self.permits.acquire().await?;
        let path: PathBuf = path.to_path_buf();
        tokio::task::spawn_blocking(move || hash_file(kind, &path))
            .await
            .context("hash worker panicked")?
    }

    /// Stop admitting new hash jobs.
    pub fn close(&self) {
        self.permits.close();
    }
}

/// Stream a file through `kind`, reading in 64 KB chunks.
pub fn hash_file(kind: HashKind, path: &Path) -> Result<String> {
    let file =
        std::fs::File::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
    match kind {
        HashKind::Sha1 => stream_digest::<Sha1>(file, path),
    }
}

fn stream_digest<D: Digest>(mut file: std::fs::File, path: &Path) -> Result<String> {
    let mut hasher = D::new();
    let mut buf = vec![0u8; BUF_SIZE];

    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("Cannot read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex_encode(&hasher.finalize()))
}

pub fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn sha1_of_known_content() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(b"hello world").unwrap();
        f.flush().unwrap();

        let pool = HashPool::new(2);
        let hash = pool.digest(HashKind::Sha1, f.path()).await.unwrap();
        assert_eq!(hash, "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed");
    }

    #[tokio::test]
    async fn empty_file_digest() {
        let f = NamedTempFile::new().unwrap();
        let pool = HashPool::new(1);
        let hash = pool.digest(HashKind::Sha1, f.path()).await.unwrap();
        assert_eq!(hash, "da39a3ee5e6b4b0d3255bfef95601890afd80709");
    }

    #[test]
    fn multi_chunk_file_matches_one_shot_digest() {
        let mut f = NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..(BUF_SIZE * 3 + 17)).map(|i| (i % 251) as u8).collect();
        f.write_all(&data).unwrap();
        f.flush().unwrap();

        let expected = hex_encode(&Sha1::digest(&data));
        assert_eq!(hash_file(HashKind::Sha1, f.path()).unwrap(), expected);
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let pool = HashPool::new(1);
        let result = pool
            .digest(HashKind::Sha1, Path::new("/nonexistent/driveup/file"))
            .await;
        assert!(result.is_err());
    }
}
