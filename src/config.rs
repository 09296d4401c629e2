//! Scan options and cache location resolution.
//!
//! Explicit values win, then the environment, then the platform data
//! directory.

use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};

pub const CACHE_ENV: &str = "ANNO_INDEX_CACHE";
pub const THREADS_ENV: &str = "ANNO_INDEX_THREADS";
pub const LOG_ENV: &str = "ANNO_INDEX_LOG";

/// Hard upper bound on scan workers.
pub const MAX_SCAN_THREADS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheOptions {
    pub enabled: bool,
    /// Treat every cached entry as stale. Results are still written.
    pub always_invalid: bool,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            always_invalid: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanOptions {
    pub threads: usize,
    /// Keep annotation value text.
    pub detail: bool,
    pub cache: CacheOptions,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            threads: 1,
            detail: false,
            cache: CacheOptions::default(),
        }
    }
}

impl ScanOptions {
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_detail(mut self, detail: bool) -> Self {
        self.detail = detail;
        self
    }

    pub fn with_cache(mut self, cache: CacheOptions) -> Self {
        self.cache = cache;
        self
    }

    /// Worker count for `layers` internal layers; 1 means sequential.
    pub fn workers_for(&self, layers: usize) -> usize {
        self.threads.min(layers).clamp(1, MAX_SCAN_THREADS)
    }
}

pub fn resolve_cache_dir(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(p) = explicit {
        return Ok(p.to_path_buf());
    }

    if let Ok(p) = env::var(CACHE_ENV)
        && !p.trim().is_empty()
    {
        return Ok(PathBuf::from(p));
    }

    anno_index_home()
}

pub fn resolve_threads(explicit: Option<usize>) -> Result<usize> {
    if let Some(n) = explicit {
        return Ok(n.max(1));
    }

    match env::var(THREADS_ENV) {
        Ok(raw) => {
            let n = raw
                .trim()
                .parse::<usize>()
                .with_context(|| format!("{THREADS_ENV} is not a thread count: {raw}"))?;
            Ok(n.max(1))
        }
        Err(_) => Ok(std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)),
    }
}

/// Removes the cache file and its lock file.
pub fn clear_cache(dir: &Path) -> Result<()> {
    let db_path = dir.join(crate::cache::DB_FILE);
    remove_file_if_exists(&db_path, "cache")?;
    remove_file_if_exists(&lmdb_lock_path(&db_path), "cache lock")?;
    Ok(())
}

fn anno_index_home() -> Result<PathBuf> {
    let base = dirs::data_local_dir()
        .or_else(dirs::cache_dir)
        .or_else(dirs::home_dir)
        .ok_or_else(|| anyhow::anyhow!("Failed to resolve data directory"))?;
    Ok(base.join("anno-index"))
}

fn lmdb_lock_path(db_path: &Path) -> PathBuf {
    let mut os = db_path.as_os_str().to_os_string();
    os.push("-lock");
    PathBuf::from(os)
}

fn remove_file_if_exists(path: &Path, kind: &str) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove {kind} file: {}", path.display()))?;
    }
    Ok(())
}
