mod blob;
mod db;

pub use db::{IndexStore, ShrinkReport, StoreOptions};

use crate::errors::{store_err, EngineError, EngineResult};
use chrono::{TimeZone, Utc};
use std::collections::HashMap;
use std::env;
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// One open store per user. Reopening a user hands back the same store, so
/// the single-permit gate holds across every caller in the process.
pub struct IndexStores {
    dir: PathBuf,
    options: StoreOptions,
    open: Mutex<HashMap<String, Arc<IndexStore>>>,
}

impl IndexStores {
    pub fn new(dir: PathBuf, options: StoreOptions) -> Self {
        Self {
            dir,
            options,
            open: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn open(&self, user_id: &str) -> EngineResult<Arc<IndexStore>> {
        let mut open = self.open.lock().await;
        if let Some(store) = open.get(user_id) {
            return Ok(store.clone());
        }
        let store = Arc::new(IndexStore::open(&self.dir, user_id, self.options.clone()).await?);
        open.insert(user_id.to_string(), store.clone());
        Ok(store)
    }

    /// Closes the user's connection, if any, then removes every index file.
    pub async fn delete_index(&self, user_id: &str) -> EngineResult<bool> {
        let mut open = self.open.lock().await;
        if let Some(store) = open.remove(user_id) {
            store.close().await;
        }
        delete_index(&self.dir, user_id)
    }

    pub async fn close_all(&self) {
        let mut open = self.open.lock().await;
        for (_, store) in open.drain() {
            store.close().await;
        }
    }
}

/// Removes the database, its WAL/SHM sidecars and the blob directory.
/// Returns whether anything existed; calling it again is a no-op.
pub fn delete_index(dir: &Path, user_id: &str) -> EngineResult<bool> {
    let db_path = dir.join(index_file_name(user_id));
    let mut removed = false;

    for path in [
        db_path.clone(),
        sidecar_path(&db_path, "-wal"),
        sidecar_path(&db_path, "-shm"),
    ] {
        match std::fs::remove_file(&path) {
            Ok(()) => removed = true,
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(store_err("removing index file")(e)),
        }
    }

    match std::fs::remove_dir_all(dir.join(blob_dir_name(user_id))) {
        Ok(()) => removed = true,
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(store_err("removing blob directory")(e)),
    }

    if removed {
        info!(user = %user_id, dir = %dir.display(), "Deleted search index");
    }
    Ok(removed)
}

pub fn index_file_name(user_id: &str) -> String {
    format!("index_{}.db", file_safe(user_id))
}

pub(crate) fn blob_dir_name(user_id: &str) -> String {
    format!("index_{}_blobs", file_safe(user_id))
}

pub(crate) fn sidecar_path(db_path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(db_path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

fn file_safe(user_id: &str) -> String {
    user_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// `1536` -> `"1.5 KB"`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

/// Renders an index timestamp as e.g. `"Mar 04, 2021"`.
pub fn format_index_date(timestamp: i64) -> Option<String> {
    Utc.timestamp_opt(timestamp, 0)
        .single()
        .map(|dt| dt.format("%b %d, %Y").to_string())
}

pub(crate) fn default_data_dir() -> EngineResult<PathBuf> {
    if let Ok(custom) = env::var("SEALSEARCH_DATA_DIR") {
        let path = PathBuf::from(custom);
        std::fs::create_dir_all(&path).map_err(|e| {
            EngineError::Config(format!("creating SEALSEARCH_DATA_DIR at {}: {e}", path.display()))
        })?;
        return Ok(path);
    }

    if let Some(base) = dirs::data_dir() {
        let path = base.join("sealsearch");
        if std::fs::create_dir_all(&path).is_ok() {
            return Ok(path);
        } else {
            warn!(
                "Unable to create {}/sealsearch; falling back to workspace-local storage",
                base.display()
            );
        }
    }

    let cwd = env::current_dir()
        .map_err(|e| EngineError::Config(format!("determining current directory: {e}")))?;
    let path = cwd.join("sealsearch-data");
    std::fs::create_dir_all(&path).map_err(|e| {
        EngineError::Config(format!("creating fallback data directory at {}: {e}", path.display()))
    })?;
    Ok(path)
}
