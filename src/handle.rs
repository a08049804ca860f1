use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::auth::TokenManager;
use crate::box_api::BoxClient;
use crate::config::Config;
use crate::db;
use crate::drive::BoxDrive;
use crate::engine::{EngineOptions, UploadEngine};
use crate::exclude::ExclusionFilter;
use crate::hasher::HashPool;

/// Everything an upload session holds: the drive session and its node
/// cache, the admission queue, the HTTP client for exclusion lists and
/// the hash pool. Built by `open`, torn down by `close` in reverse order.
pub struct Uploader {
    pool: SqlitePool,
    queue: Arc<Semaphore>,
    queue_depth: u32,
    http: reqwest::Client,
    hashes: HashPool,
    engine: Arc<UploadEngine>,
}

impl Uploader {
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::init_db(config.drive.db_path.as_deref()).await?;
        match Self::assemble(config, pool.clone()) {
            Ok(uploader) => Ok(uploader),
            Err(e) => {
                pool.close().await;
                Err(e)
            }
        }
    }

    fn assemble(config: &Config, pool: SqlitePool) -> Result<Self> {
        let tokens = Arc::new(TokenManager::new(&config.auth)?);
        let client = Arc::new(BoxClient::new(tokens)?);
        let drive = Arc::new(BoxDrive::new(
            client,
            pool.clone(),
            config.drive.root_folder_id.clone(),
        ));

        let queue_depth = u32::try_from(config.general.queue_depth)
            .context("general.queue_depth is too large")?;
        let queue = Arc::new(Semaphore::new(queue_depth as usize));

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;

        let hashes = HashPool::new(config.general.hash_workers);

        let filter = ExclusionFilter::new(&config.upload, http.clone())?;
        let engine = Arc::new(UploadEngine::new(
            drive,
            filter,
            hashes.clone(),
            EngineOptions::from_config(&config.general),
        ));

        tracing::debug!(
            queue_depth,
            hash_workers = config.general.hash_workers,
            "uploader ready"
        );
        Ok(Self {
            pool,
            queue,
            queue_depth,
            http,
            hashes,
            engine,
        })
    }

    pub fn engine(&self) -> &UploadEngine {
        &self.engine
    }

    /// Wait for a free queue slot, then run the upload in the background.
    /// The slot is held until the upload finishes.
    pub async fn submit_torrent(
        &self,
        remote_path: String,
        item_id: String,
        local_root: PathBuf,
        items: Vec<String>,
    ) -> Result<JoinHandle<bool>> {
        let permit = self
            .queue
            .clone()
            .acquire_owned()
            .await
            .context("Upload queue is closed")?;
        let engine = self.engine.clone();
        Ok(tokio::spawn(async move {
            let _permit = permit;
            engine
                .upload_torrent(&remote_path, &item_id, &local_root, &items)
                .await
        }))
    }

    /// Wait until every submitted upload has finished.
    pub async fn drain(&self) {
        let in_flight = self.queue_depth as usize - self.queue.available_permits();
        if in_flight > 0 {
            tracing::info!(in_flight, "waiting for uploads to finish");
        }
        if let Ok(all) = self.queue.acquire_many(self.queue_depth).await {
            drop(all);
        }
    }

    pub async fn close(self) {
        let Self {
            pool,
            queue,
            http,
            hashes,
            engine,
            ..
        } = self;

        if engine.active_jobs() > 0 {
            tracing::warn!(active = engine.active_jobs(), "closing with uploads in flight");
        }
        hashes.close();
        drop(http);
        queue.close();
        drop(engine);
        pool.close().await;
        tracing::debug!("uploader closed");
    }
}
