use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const DATA_DIR: &str = ".docbridge";
pub const CONFIG_FILE: &str = ".docbridge/config.yaml";
pub const CACHE_FILE: &str = ".docbridge/cache.redb";
pub const LOG_FILE: &str = ".docbridge/processing.log";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn data_dir(root: &Path) -> PathBuf {
    root.join(DATA_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn cache_path(root: &Path) -> PathBuf {
    root.join(CACHE_FILE)
}

pub fn log_path(root: &Path) -> PathBuf {
    root.join(LOG_FILE)
}
