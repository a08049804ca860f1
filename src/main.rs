use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

mod auth;
mod box_api;
mod config;
mod db;
mod drive;
mod engine;
mod exclude;
mod handle;
mod hasher;
mod media;
mod watch;

use handle::Uploader;

#[derive(Parser)]
#[command(
    name = "driveup",
    version,
    about = "Upload finished downloads to Box with hash verification"
)]
struct Cli {
    /// Path to config file [default: ~/.config/driveup/config.toml]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Upload local files or directories into a remote folder
    Upload {
        /// Remote folder, e.g. /incoming
        remote: String,
        /// Local files or directories
        #[arg(required = true)]
        locals: Vec<PathBuf>,
    },
    /// Watch the downloader log and upload finished items (foreground)
    Start,
    /// Pull remote changes into the node cache
    Sync,
    /// Show node cache summary
    Status,
}

fn init_tracing(verbosity: u8) {
    let default_filter = match verbosity {
        0 => "driveup=info",
        1 => "driveup=debug",
        2 => "driveup=trace",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cfg = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Upload { remote, locals } => {
            let uploader = Uploader::open(&cfg).await?;
            let mut all_ok = true;
            for local in &locals {
                if !uploader.engine().upload_path(&remote, local).await {
                    all_ok = false;
                }
            }
            uploader.close().await;
            if !all_ok {
                std::process::exit(1);
            }
        }
        Command::Start => {
            let watch_cfg = cfg
                .watch
                .clone()
                .context("`start` needs a [watch] section in the config")?;
            let uploader = Uploader::open(&cfg).await?;
            let result = run_daemon(&uploader, &watch_cfg, &cfg.upload.upload_to).await;
            uploader.drain().await;
            uploader.close().await;
            result?;
            tracing::info!("driveup stopped");
        }
        Command::Sync => {
            let uploader = Uploader::open(&cfg).await?;
            let result = uploader.engine().sync().await;
            uploader.close().await;
            let changes = result.context("Sync failed")?;
            println!("sync complete: {changes} changes applied");
        }
        Command::Status => {
            let db_path = db::resolve_db_path(cfg.drive.db_path.as_deref())?;
            let pool = if db_path.exists() {
                db::init_db(Some(&db_path)).await?
            } else {
                db::init_memory_db().await?
            };
            print_status(&pool, &db_path, &cfg).await?;
            pool.close().await;
        }
    }

    Ok(())
}

/// Feed finished downloads into the uploader until SIGINT or SIGTERM.
async fn run_daemon(
    uploader: &Uploader,
    watch_cfg: &config::WatchConfig,
    upload_to: &str,
) -> Result<()> {
    let cancel = CancellationToken::new();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT, shutting down"),
                _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
            }
            cancel.cancel();
        }
    });

    tracing::info!("driveup daemon ready, running initial sync");
    if let Err(e) = uploader.engine().sync().await {
        tracing::error!(error = %e, "initial sync failed");
    }

    let (mut completed, watcher) = watch::start_log_watcher(watch_cfg)?;

    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => break,
            item = completed.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        let submitted = tokio::select! {
            _ = cancel.cancelled() => break,
            submitted = uploader.submit_torrent(
                upload_to.to_string(),
                item.name.clone(),
                watch_cfg.download_path.clone(),
                vec![item.name.clone()],
            ) => submitted,
        };
        if let Err(e) = submitted {
            tracing::error!(name = %item.name, error = %e, "cannot queue upload");
        }
    }

    drop(watcher);
    tracing::info!("log watcher stopped");
    Ok(())
}

async fn print_status(
    pool: &sqlx::SqlitePool,
    db_path: &std::path::Path,
    cfg: &config::Config,
) -> Result<()> {
    let stats = drive::cache::stats(pool).await?;
    let position = drive::cache::get_stream_position(pool).await?;

    println!("driveup status");
    println!("==============");
    println!("Cache:    {}", db_path.display());
    println!("Root:     box:{}", cfg.drive.root_folder_id);
    println!("Target:   {}", cfg.upload.upload_to);
    println!(
        "Nodes:    {} files, {} folders ({} trashed)",
        stats.files, stats.folders, stats.trashed
    );
    match position {
        Some(pos) => println!("Checkpoint: {pos}"),
        None => println!("Checkpoint: never synced"),
    }
    if let Some(watch) = &cfg.watch {
        println!();
        println!("Watching: {}", watch.log_path.display());
        println!("Downloads: {}", watch.download_path.display());
    }
    Ok(())
}
