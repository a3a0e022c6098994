use anyhow::Context;
use archiver_core::config::{ArchiverConfig, DEFAULT_CONFIG_FILE};
use std::path::{Path, PathBuf};

/// Resolve which config file to read.
///
/// Priority:
/// 1. `--config` flag / `ATARCHIVER_CONFIG` env var (passed in as `explicit`)
/// 2. `atarchiver.yaml` in the current directory
/// 3. None: built-in defaults
pub fn resolve_config(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = explicit {
        return Some(p.to_path_buf());
    }
    let local = std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(DEFAULT_CONFIG_FILE);
    local.is_file().then_some(local)
}

pub fn load(path: Option<&Path>) -> anyhow::Result<ArchiverConfig> {
    match path {
        Some(p) => ArchiverConfig::load(p)
            .with_context(|| format!("failed to load config from {}", p.display())),
        None => Ok(ArchiverConfig::default()),
    }
}
