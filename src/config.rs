use serde::Deserialize;
use std::path::PathBuf;

/// Engine options. Everything is optional in the source document; defaults
/// mirror a small standalone deployment.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Catalog and data root. `meta.sqlite`, `wal/` and `tables/` live here.
    pub path: PathBuf,
    pub wal_enable: bool,
    /// Insert buffer bytes per table before an automatic flush.
    pub buffer_size: u64,
    /// Preferred segment size in bytes for newly created tables.
    pub index_file_size: u64,
    /// Row count at which a RAW file is promoted to TO_INDEX.
    pub build_index_threshold: u64,
    /// Soft-deleted files older than this are garbage collected.
    pub ttl_seconds: u64,
    /// Archive policy: soft-delete files older than N days.
    pub archive_days: Option<u64>,
    /// Archive policy: soft-delete oldest files until total size fits (GB).
    pub archive_disk_gb: Option<u64>,
    pub auto_flush_interval_secs: u64,
    pub merge_interval_secs: u64,
    pub build_index_interval_secs: u64,
    pub archive_interval_secs: u64,
    pub compact_threads: usize,
    pub build_index_threads: usize,
    pub wal_file_max_bytes: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./strata_data"),
            wal_enable: true,
            buffer_size: 128 * 1024 * 1024,
            index_file_size: 1024 * 1024 * 1024,
            build_index_threshold: 4096,
            ttl_seconds: 60,
            archive_days: None,
            archive_disk_gb: None,
            auto_flush_interval_secs: 1,
            merge_interval_secs: 10,
            build_index_interval_secs: 30,
            archive_interval_secs: 600,
            compact_threads: 2,
            build_index_threads: 2,
            wal_file_max_bytes: 256 * 1024 * 1024,
        }
    }
}

impl Config {
    /// Convenience for tests and embedded use: everything default except the
    /// data root.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }
}
