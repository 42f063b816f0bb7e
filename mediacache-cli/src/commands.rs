//! CLI command implementations

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use clap::Subcommand;
use mediacache_core::cache::calculate_cache_id;
use mediacache_core::config::{MediaCacheConfig, StorageConfig};
use mediacache_core::storage::{
    MediaCacheSave, SaveDataStore, StorageError, list_metadata_files, metadata_path, read_save,
};
use tracing::debug;

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// List every cache recorded in a storage directory
    List {
        /// Storage directory
        #[arg(short, long)]
        dir: PathBuf,
    },
    /// Print one cache's saved origin and metadata as JSON
    Show {
        /// Storage directory
        #[arg(short, long)]
        dir: PathBuf,
        /// Cache id, as printed by `list`
        cache_id: String,
    },
}

/// Handle the CLI command
///
/// # Errors
///
/// Returns the error of the command that failed.
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    let config = MediaCacheConfig::from_env().storage;
    match command {
        Commands::List { dir } => list_caches(&dir, &config).await,
        Commands::Show { dir, cache_id } => show_cache(&dir, &cache_id, &config).await,
    }
}

async fn list_caches(dir: &Path, config: &StorageConfig) -> anyhow::Result<()> {
    let files = list_metadata_files(dir, &config.metadata_extension)
        .await
        .with_context(|| format!("cannot list {}", dir.display()))?;

    if files.is_empty() {
        println!("No caches in {}", dir.display());
    }

    let mut corrupt = 0;
    for path in &files {
        match read_save(path).await {
            Ok(save) => print_summary(&save),
            Err(StorageError::Serialization { source, .. }) => {
                corrupt += 1;
                println!("{:<40} corrupt: {source}", file_label(path));
            }
            Err(e) => return Err(e).with_context(|| format!("cannot read {}", path.display())),
        }
    }

    let save_data = SaveDataStore::load(dir.join(&config.save_data_file)).await;
    println!("{:-<72}", "");
    println!(
        "{} caches, {corrupt} corrupt, {:.2} MB uploaded",
        files.len() - corrupt,
        save_data.get().total_uploaded_bytes as f64 / 1_048_576.0
    );
    Ok(())
}

async fn show_cache(dir: &Path, cache_id: &str, config: &StorageConfig) -> anyhow::Result<()> {
    let canonical = metadata_path(dir, cache_id, &config.metadata_extension);
    let save = match read_save(&canonical).await {
        Ok(save) => save,
        Err(StorageError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(cache_id, "No canonical file, scanning directory");
            find_by_cache_id(dir, cache_id, config).await?
        }
        Err(e) => return Err(e).with_context(|| format!("cannot read {}", canonical.display())),
    };

    println!("{}", serde_json::to_string_pretty(&save)?);
    Ok(())
}

/// Finds a cache saved under a non-canonical file name.
async fn find_by_cache_id(
    dir: &Path,
    cache_id: &str,
    config: &StorageConfig,
) -> anyhow::Result<MediaCacheSave> {
    for path in list_metadata_files(dir, &config.metadata_extension).await? {
        let Ok(save) = read_save(&path).await else {
            continue;
        };
        if calculate_cache_id(&save.origin.media_id, &save.metadata) == cache_id {
            return Ok(save);
        }
    }
    bail!("no cache {cache_id} in {}", dir.display())
}

fn print_summary(save: &MediaCacheSave) {
    let cache_id = calculate_cache_id(&save.origin.media_id, &save.metadata);
    println!(
        "{cache_id:<40} subject={} episode={} ({}) media={}",
        save.metadata.subject_id,
        save.metadata.episode_id,
        save.metadata.episode_sort,
        save.origin.media_id
    );
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
