mod paths;
mod sqlite;

pub use paths::{
    date_from_micros, file_location, index_location, segment_dir, table_path, today_date,
};
pub use sqlite::SqliteMeta;

use crate::ids::now_micros;
use crate::status::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const CURRENT_VERSION: &str = "0.1";

/// States a table row moves through. Deletes are soft; the GC loop removes
/// the row once its files are gone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableState {
    Normal = 0,
    ToDelete = 1,
}

impl TableState {
    pub fn from_i64(v: i64) -> Result<Self> {
        match v {
            0 => Ok(TableState::Normal),
            1 => Ok(TableState::ToDelete),
            other => Err(Error::DbError(format!("unknown table state {other}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MetricType {
    #[default]
    L2 = 1,
    Ip = 2,
}

impl MetricType {
    pub fn from_i64(v: i64) -> Result<Self> {
        match v {
            1 => Ok(MetricType::L2),
            2 => Ok(MetricType::Ip),
            other => Err(Error::DbError(format!("unknown metric type {other}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineType {
    #[default]
    Flat = 1,
    IvfFlat = 2,
    IvfSq8 = 3,
}

pub const DEFAULT_ENGINE_TYPE: EngineType = EngineType::Flat;

impl EngineType {
    pub fn from_i64(v: i64) -> Result<Self> {
        match v {
            1 => Ok(EngineType::Flat),
            2 => Ok(EngineType::IvfFlat),
            3 => Ok(EngineType::IvfSq8),
            other => Err(Error::DbError(format!("unknown engine type {other}"))),
        }
    }

}

/// Segment file lifecycle. `New*` states are in-flight allocations that a
/// crash leaves behind for startup cleanup; `Raw`, `ToIndex` and `Index`
/// serve queries; `Backup` keeps the raw source alive while its replacement
/// index settles; `ToDelete` waits for the TTL collector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FileType {
    New = 0,
    Raw = 1,
    ToIndex = 2,
    Index = 3,
    ToDelete = 4,
    NewMerge = 5,
    NewIndex = 6,
    Backup = 7,
}

impl FileType {
    pub const SEARCHABLE: [FileType; 3] = [FileType::Raw, FileType::ToIndex, FileType::Index];

    pub fn from_i64(v: i64) -> Result<Self> {
        match v {
            0 => Ok(FileType::New),
            1 => Ok(FileType::Raw),
            2 => Ok(FileType::ToIndex),
            3 => Ok(FileType::Index),
            4 => Ok(FileType::ToDelete),
            5 => Ok(FileType::NewMerge),
            6 => Ok(FileType::NewIndex),
            7 => Ok(FileType::Backup),
            other => Err(Error::DbError(format!("unknown file type {other}"))),
        }
    }

    pub fn is_searchable(self) -> bool {
        Self::SEARCHABLE.contains(&self)
    }
}

#[derive(Clone, Debug)]
pub struct TableSchema {
    pub id: i64,
    pub table_id: String,
    pub state: TableState,
    pub dimension: u16,
    pub created_on: i64,
    pub flag: i64,
    pub index_file_size: u64,
    pub engine_type: EngineType,
    pub index_params: serde_json::Value,
    pub metric_type: MetricType,
    pub owner_table: String,
    pub partition_tag: String,
    pub version: String,
    pub flush_lsn: u64,
}

impl TableSchema {
    pub fn new(table_id: impl Into<String>, dimension: u16, metric_type: MetricType) -> Self {
        Self {
            id: -1,
            table_id: table_id.into(),
            state: TableState::Normal,
            dimension,
            created_on: now_micros(),
            flag: 0,
            index_file_size: 1024 * 1024 * 1024,
            engine_type: DEFAULT_ENGINE_TYPE,
            index_params: serde_json::json!({}),
            metric_type,
            owner_table: String::new(),
            partition_tag: String::new(),
            version: CURRENT_VERSION.to_string(),
            flush_lsn: 0,
        }
    }

    pub fn is_partition(&self) -> bool {
        !self.owner_table.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct FileSchema {
    pub id: i64,
    pub table_id: String,
    pub segment_id: String,
    pub file_id: String,
    pub file_type: FileType,
    pub file_size: u64,
    pub row_count: u64,
    pub date: i32,
    pub engine_type: EngineType,
    pub created_on: i64,
    pub updated_time: i64,
    pub flush_lsn: u64,
    // Denormalized from the owning table on every read.
    pub dimension: u16,
    pub index_file_size: u64,
    pub index_params: serde_json::Value,
    pub metric_type: MetricType,
    /// Absolute path of the `.vec` payload for this file.
    pub location: PathBuf,
}

impl FileSchema {
    pub fn for_table(table: &TableSchema) -> Self {
        let now = now_micros();
        Self {
            id: -1,
            table_id: table.table_id.clone(),
            segment_id: String::new(),
            file_id: String::new(),
            file_type: FileType::New,
            file_size: 0,
            row_count: 0,
            date: date_from_micros(now),
            engine_type: table.engine_type,
            created_on: now,
            updated_time: now,
            flush_lsn: 0,
            dimension: table.dimension,
            index_file_size: table.index_file_size,
            index_params: table.index_params.clone(),
            metric_type: table.metric_type,
            location: PathBuf::new(),
        }
    }
}

/// Catalog-side archive policy, mapped from `Config`.
#[derive(Clone, Copy, Debug, Default)]
pub struct ArchiveConf {
    pub days: Option<u64>,
    pub disk_gb: Option<u64>,
}
