//! Executor configuration on disk
//!
//! The config lives at `<root>/config.json` and is replaced atomically:
//! written to a temp file, synced, then renamed over the old one.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::ExecutorConfig;

/// Path of the config file under `root`
pub fn config_path(root: &Path) -> PathBuf {
    root.join("config.json")
}

/// Create `root` if needed and write `config` into it
pub fn write_config(root: &Path, config: &ExecutorConfig) -> Result<PathBuf> {
    fs::create_dir_all(root)
        .with_context(|| format!("Failed to create directory: {:?}", root))?;

    let path = config_path(root);
    let json = serde_json::to_vec_pretty(config).context("Failed to serialize config")?;
    write_atomic(&path, &json)?;

    tracing::debug!(path = ?path, "wrote executor config");
    Ok(path)
}

/// Load the config stored under `root`
pub fn load_config(root: &Path) -> Result<ExecutorConfig> {
    let path = config_path(root);
    let data = fs::read(&path).with_context(|| format!("Failed to read file: {:?}", path))?;
    let config: ExecutorConfig =
        serde_json::from_slice(&data).context("Failed to deserialize config")?;
    Ok(config)
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("tmp");

    let mut file = File::create(&temp_path)
        .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;
    file.write_all(data).context("Failed to write data")?;
    file.sync_all().context("Failed to sync file")?;
    drop(file);

    fs::rename(&temp_path, path)
        .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, path))?;

    if let Some(parent) = path.parent() {
        let dir = OpenOptions::new()
            .read(true)
            .open(parent)
            .with_context(|| format!("Failed to open directory: {:?}", parent))?;
        dir.sync_all().context("Failed to sync directory")?;
    }

    Ok(())
}
