use super::paths;
use super::{
    ArchiveConf, EngineType, FileSchema, FileType, MetricType, TableSchema, TableState,
    CURRENT_VERSION, DEFAULT_ENGINE_TYPE,
};
use crate::ids::{now_micros, SafeIdGenerator};
use crate::ongoing::OngoingFiles;
use crate::status::{Error, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

const MICROS_PER_SECOND: i64 = 1_000_000;
const MICROS_PER_DAY: i64 = 86_400 * MICROS_PER_SECOND;
const DISCARD_BATCH: usize = 10;

const CREATE_ENVIRONMENT: &str =
    "CREATE TABLE environment (global_lsn INTEGER NOT NULL DEFAULT 0)";
const CREATE_TABLES: &str = "CREATE TABLE tables (\
     id INTEGER PRIMARY KEY AUTOINCREMENT, \
     table_id TEXT UNIQUE NOT NULL, \
     state INTEGER NOT NULL, \
     dimension INTEGER NOT NULL, \
     created_on INTEGER NOT NULL, \
     flag INTEGER NOT NULL DEFAULT 0, \
     index_file_size INTEGER NOT NULL, \
     engine_type INTEGER NOT NULL, \
     index_params TEXT NOT NULL, \
     metric_type INTEGER NOT NULL, \
     owner_table TEXT NOT NULL DEFAULT '', \
     partition_tag TEXT NOT NULL DEFAULT '', \
     version TEXT NOT NULL, \
     flush_lsn INTEGER NOT NULL DEFAULT 0)";
const CREATE_TABLE_FILES: &str = "CREATE TABLE table_files (\
     id INTEGER PRIMARY KEY AUTOINCREMENT, \
     table_id TEXT NOT NULL, \
     segment_id TEXT NOT NULL DEFAULT '', \
     engine_type INTEGER NOT NULL, \
     file_id TEXT NOT NULL, \
     file_type INTEGER NOT NULL, \
     file_size INTEGER NOT NULL DEFAULT 0, \
     row_count INTEGER NOT NULL DEFAULT 0, \
     updated_time INTEGER NOT NULL, \
     created_on INTEGER NOT NULL, \
     date INTEGER NOT NULL, \
     flush_lsn INTEGER NOT NULL DEFAULT 0)";

const FILE_COLUMNS: &str = "id, table_id, segment_id, engine_type, file_id, file_type, \
     file_size, row_count, updated_time, created_on, date, flush_lsn";
const TABLE_COLUMNS: &str = "id, table_id, state, dimension, created_on, flag, \
     index_file_size, engine_type, index_params, metric_type, owner_table, partition_tag, \
     version, flush_lsn";

/// The single source of truth for table schemas and file states, backed by
/// an embedded sqlite database in WAL journal mode.
///
/// Every mutating operation serializes behind one coarse mutex; sqlite's
/// multi-statement consistency under concurrent writers is fragile, and
/// serializing writes is simpler than reasoning about savepoints.
#[derive(Debug)]
pub struct SqliteMeta {
    root: PathBuf,
    archive: ArchiveConf,
    conn: Mutex<Connection>,
    id_gen: SafeIdGenerator,
    ongoing: Arc<OngoingFiles>,
}

impl SqliteMeta {
    pub fn open(root: &Path, archive: ArchiveConf, ongoing: Arc<OngoingFiles>) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        let conn = Connection::open(root.join("meta.sqlite"))?;
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        validate_schema(&conn)?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS environment (global_lsn INTEGER NOT NULL DEFAULT 0);\n\
             {};\n{};",
            CREATE_TABLES.replace("CREATE TABLE ", "CREATE TABLE IF NOT EXISTS "),
            CREATE_TABLE_FILES.replace("CREATE TABLE ", "CREATE TABLE IF NOT EXISTS "),
        ))?;
        Ok(Self {
            root: root.to_path_buf(),
            archive,
            conn: Mutex::new(conn),
            id_gen: SafeIdGenerator::new(),
            ongoing,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn next_id(&self) -> String {
        self.id_gen.next().to_string()
    }

    // ------------------------------------------------------------------
    // tables

    pub fn create_table(&self, schema: &mut TableSchema) -> Result<()> {
        schema.table_id = schema.table_id.trim().to_string();
        let conn = self.conn.lock();

        if schema.table_id.is_empty() {
            schema.table_id = self.next_id();
        } else {
            let existing: Option<i64> = conn
                .query_row(
                    "SELECT state FROM tables WHERE table_id = ?1",
                    params![schema.table_id],
                    |row| row.get(0),
                )
                .map(Some)
                .or_else(ignore_no_rows)?;
            match existing.map(TableState::from_i64).transpose()? {
                Some(TableState::ToDelete) => {
                    return Err(Error::PendingDelete(format!(
                        "table {} is awaiting garbage collection",
                        schema.table_id
                    )))
                }
                Some(_) => {
                    return Err(Error::AlreadyExist(format!(
                        "table {} already exists",
                        schema.table_id
                    )))
                }
                None => {}
            }
        }

        schema.created_on = now_micros();
        conn.execute(
            "INSERT INTO tables (table_id, state, dimension, created_on, flag, index_file_size, \
             engine_type, index_params, metric_type, owner_table, partition_tag, version, flush_lsn) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                schema.table_id,
                schema.state as i64,
                schema.dimension as i64,
                schema.created_on,
                schema.flag,
                schema.index_file_size as i64,
                schema.engine_type as i64,
                schema.index_params.to_string(),
                schema.metric_type as i64,
                schema.owner_table,
                schema.partition_tag,
                schema.version,
                schema.flush_lsn as i64,
            ],
        )?;
        schema.id = conn.last_insert_rowid();
        drop(conn);

        debug!(table_id = %schema.table_id, "created table");
        paths::create_table_path(&self.root, &schema.table_id)
    }

    pub fn describe_table(&self, table_id: &str) -> Result<TableSchema> {
        let conn = self.conn.lock();
        describe_table_conn(&conn, table_id)
    }

    pub fn has_table(&self, table_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM tables WHERE table_id = ?1 AND state != ?2",
            params![table_id.trim(), TableState::ToDelete as i64],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn all_tables(&self) -> Result<Vec<TableSchema>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TABLE_COLUMNS} FROM tables WHERE state != ?1 AND owner_table = ''"
        ))?;
        let rows = stmt.query_map(params![TableState::ToDelete as i64], table_row_tuple)?;
        rows.map(|r| table_from_tuple(r?)).collect()
    }

    /// Soft delete; idempotent against rows already marked.
    pub fn drop_table(&self, table_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE tables SET state = ?1 WHERE table_id = ?2 AND state != ?1",
            params![TableState::ToDelete as i64, table_id.trim()],
        )?;
        debug!(table_id, "soft-deleted table");
        Ok(())
    }

    /// Soft delete every live file of a table.
    pub fn delete_table_files(&self, table_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE table_files SET file_type = ?1, updated_time = ?2 \
             WHERE table_id = ?3 AND file_type != ?1",
            params![FileType::ToDelete as i64, now_micros(), table_id],
        )?;
        debug!(table_id, "soft-deleted table files");
        Ok(())
    }

    pub fn update_table_flag(&self, table_id: &str, flag: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE tables SET flag = ?1 WHERE table_id = ?2",
            params![flag, table_id],
        )?;
        Ok(())
    }

    /// Advance a table's flush horizon. The LSN never moves backwards.
    pub fn update_table_flush_lsn(&self, table_id: &str, flush_lsn: u64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE tables SET flush_lsn = ?1 WHERE table_id = ?2 AND flush_lsn < ?1",
            params![flush_lsn as i64, table_id],
        )?;
        Ok(())
    }

    pub fn get_table_flush_lsn(&self, table_id: &str) -> Result<u64> {
        let conn = self.conn.lock();
        let lsn: i64 = conn
            .query_row(
                "SELECT flush_lsn FROM tables WHERE table_id = ?1",
                params![table_id],
                |row| row.get(0),
            )
            .map_err(|_| Error::not_found(format!("table {table_id}")))?;
        Ok(lsn as u64)
    }

    // ------------------------------------------------------------------
    // index descriptors

    pub fn update_table_index(
        &self,
        table_id: &str,
        engine_type: EngineType,
        index_params: &serde_json::Value,
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE tables SET engine_type = ?1, index_params = ?2 \
             WHERE table_id = ?3 AND state != ?4",
            params![
                engine_type as i64,
                index_params.to_string(),
                table_id,
                TableState::ToDelete as i64
            ],
        )?;
        if changed == 0 {
            return Err(Error::not_found(format!("table {table_id}")));
        }
        // Backup files fall back to raw so the new index is rebuilt from them.
        tx.execute(
            "UPDATE table_files SET file_type = ?1, updated_time = ?2 \
             WHERE table_id = ?3 AND file_type = ?4",
            params![
                FileType::Raw as i64,
                now_micros(),
                table_id,
                FileType::Backup as i64
            ],
        )?;
        tx.commit()?;
        debug!(table_id, ?engine_type, "updated table index");
        Ok(())
    }

    pub fn describe_table_index(&self, table_id: &str) -> Result<(EngineType, serde_json::Value)> {
        let conn = self.conn.lock();
        let (engine, raw_params): (i64, String) = conn
            .query_row(
                "SELECT engine_type, index_params FROM tables \
                 WHERE table_id = ?1 AND state != ?2",
                params![table_id, TableState::ToDelete as i64],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(|_| Error::not_found(format!("table {table_id}")))?;
        let params_value =
            serde_json::from_str(&raw_params).unwrap_or_else(|_| serde_json::json!({}));
        Ok((EngineType::from_i64(engine)?, params_value))
    }

    pub fn drop_table_index(&self, table_id: &str) -> Result<()> {
        // Indexed segments carry their raw payload alongside the blob, so
        // the fallback re-types them RAW and discards only the `.idx` file.
        // It must not lean on BACKUP rows: the collector may already have
        // reclaimed them.
        let index_files = self.files_by_type(table_id, &[FileType::Index])?;
        let mut converted = Vec::with_capacity(index_files.len());
        for file in &index_files {
            let vec_bytes = std::fs::metadata(&file.location)
                .map(|meta| meta.len())
                .unwrap_or(file.file_size);
            converted.push((file.id, vec_bytes));
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for (id, vec_bytes) in &converted {
            tx.execute(
                "UPDATE table_files SET file_type = ?1, engine_type = ?2, file_size = ?3, \
                 updated_time = ?4 WHERE id = ?5",
                params![
                    FileType::Raw as i64,
                    DEFAULT_ENGINE_TYPE as i64,
                    *vec_bytes as i64,
                    now_micros(),
                    id
                ],
            )?;
        }
        // Any backup source still around duplicates a converted file now.
        tx.execute(
            "UPDATE table_files SET file_type = ?1, updated_time = ?2 \
             WHERE table_id = ?3 AND file_type = ?4",
            params![
                FileType::ToDelete as i64,
                now_micros(),
                table_id,
                FileType::Backup as i64
            ],
        )?;
        tx.execute(
            "UPDATE tables SET engine_type = ?1, index_params = '{}' WHERE table_id = ?2",
            params![DEFAULT_ENGINE_TYPE as i64, table_id],
        )?;
        tx.commit()?;
        drop(conn);

        for file in &index_files {
            let _ = std::fs::remove_file(paths::index_location(&file.location));
        }
        debug!(table_id, converted = index_files.len(), "dropped table index");
        Ok(())
    }

    /// Promote raw files that grew past the build threshold.
    pub fn update_files_to_index(&self, table_id: &str, threshold: u64) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE table_files SET file_type = ?1 \
             WHERE table_id = ?2 AND row_count >= ?3 AND file_type = ?4",
            params![
                FileType::ToIndex as i64,
                table_id,
                threshold as i64,
                FileType::Raw as i64
            ],
        )?;
        if changed > 0 {
            debug!(table_id, changed, "marked raw files to_index");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // partitions

    pub fn create_partition(
        &self,
        table_id: &str,
        partition_name: Option<&str>,
        tag: &str,
        lsn: u64,
    ) -> Result<TableSchema> {
        let mut schema = self.describe_table(table_id)?;
        if schema.is_partition() {
            return Err(Error::invalid("nested partition is not allowed"));
        }

        // Tags compare on trimmed characters: " a " and "a" are duplicates.
        let valid_tag = tag.trim().to_string();
        if valid_tag.is_empty() {
            return Err(Error::invalid("partition tag must not be blank"));
        }
        if self.get_partition_name(table_id, &valid_tag).is_ok() {
            return Err(Error::AlreadyExist(format!(
                "partition {valid_tag} of table {table_id} already exists"
            )));
        }

        schema.table_id = match partition_name {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => String::new(),
        };
        schema.id = -1;
        schema.state = TableState::Normal;
        schema.flag = 0;
        schema.created_on = now_micros();
        schema.owner_table = table_id.trim().to_string();
        schema.partition_tag = valid_tag;
        schema.flush_lsn = lsn;
        self.create_table(&mut schema)?;
        Ok(schema)
    }

    pub fn get_partition_name(&self, table_id: &str, tag: &str) -> Result<String> {
        let valid_tag = tag.trim();
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT table_id FROM tables \
             WHERE owner_table = ?1 AND partition_tag = ?2 AND state != ?3",
            params![table_id.trim(), valid_tag, TableState::ToDelete as i64],
            |row| row.get(0),
        )
        .map_err(|_| Error::not_found(format!("partition {valid_tag} of table {table_id}")))
    }

    pub fn show_partitions(&self, table_id: &str) -> Result<Vec<TableSchema>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TABLE_COLUMNS} FROM tables WHERE owner_table = ?1 AND state != ?2"
        ))?;
        let rows = stmt.query_map(
            params![table_id.trim(), TableState::ToDelete as i64],
            table_row_tuple,
        )?;
        rows.map(|r| table_from_tuple(r?)).collect()
    }

    // ------------------------------------------------------------------
    // files

    /// Allocate a catalog row in state NEW and create its segment directory.
    /// Dimension, engine and metric are inherited from the owning table.
    pub fn create_file(&self, file: &mut FileSchema) -> Result<()> {
        let table = self.describe_table(&file.table_id)?;

        file.file_id = self.next_id();
        if file.segment_id.is_empty() {
            file.segment_id = file.file_id.clone();
        }
        if file.date == 0 {
            file.date = paths::today_date();
        }
        file.dimension = table.dimension;
        file.file_size = 0;
        file.row_count = 0;
        file.created_on = now_micros();
        file.updated_time = file.created_on;
        file.index_file_size = table.index_file_size;
        file.index_params = table.index_params.clone();
        file.engine_type = table.engine_type;
        file.metric_type = table.metric_type;
        file.location = paths::file_location(&self.root, file);

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO table_files (table_id, segment_id, engine_type, file_id, file_type, \
             file_size, row_count, updated_time, created_on, date, flush_lsn) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                file.table_id,
                file.segment_id,
                file.engine_type as i64,
                file.file_id,
                file.file_type as i64,
                file.file_size as i64,
                file.row_count as i64,
                file.updated_time,
                file.created_on,
                file.date,
                file.flush_lsn as i64,
            ],
        )?;
        file.id = conn.last_insert_rowid();
        drop(conn);

        debug!(file_id = %file.file_id, table_id = %file.table_id, "created table file");
        paths::create_segment_dir(&self.root, file)
    }

    pub fn get_files(&self, table_id: &str, ids: &[i64]) -> Result<Vec<FileSchema>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let table = self.describe_table(table_id)?;
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {FILE_COLUMNS} FROM table_files \
             WHERE table_id = ?1 AND file_type != ?2 AND id IN ({})",
            id_list(ids)
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![table_id, FileType::ToDelete as i64],
            file_row_tuple,
        )?;
        rows.map(|r| self.file_from_tuple(r?, &table)).collect()
    }

    pub fn get_files_by_segment(&self, segment_id: &str) -> Result<Vec<FileSchema>> {
        let raw: Vec<FileRow> = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(&format!(
                "SELECT {FILE_COLUMNS} FROM table_files \
                 WHERE segment_id = ?1 AND file_type != ?2"
            ))?;
            let rows = stmt.query_map(
                params![segment_id, FileType::ToDelete as i64],
                file_row_tuple,
            )?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        let mut out = Vec::with_capacity(raw.len());
        let mut tables: HashMap<String, TableSchema> = HashMap::new();
        for row in raw {
            let table_id = row.1.clone();
            let table = match tables.get(&table_id) {
                Some(t) => t.clone(),
                None => {
                    let t = self.describe_table(&table_id)?;
                    tables.insert(table_id, t.clone());
                    t
                }
            };
            out.push(self.file_from_tuple(row, &table)?);
        }
        Ok(out)
    }

    /// Persist one file row. If the owning table is missing or soft-deleted
    /// the file is forced to TO_DELETE so the collector picks it up.
    pub fn update_file(&self, file: &mut FileSchema) -> Result<()> {
        file.updated_time = now_micros();
        let conn = self.conn.lock();
        if !table_is_live(&conn, &file.table_id)? {
            file.file_type = FileType::ToDelete;
        }
        update_file_row(&conn, file)?;
        debug!(file_id = %file.file_id, file_type = ?file.file_type, "updated table file");
        Ok(())
    }

    /// Batched variant of [`update_file`]: all rows move in one transaction.
    pub fn update_files(&self, files: &mut [FileSchema]) -> Result<()> {
        let mut conn = self.conn.lock();
        let mut live_tables: HashMap<String, bool> = HashMap::new();
        for file in files.iter() {
            if !live_tables.contains_key(&file.table_id) {
                let live = table_is_live(&conn, &file.table_id)?;
                live_tables.insert(file.table_id.clone(), live);
            }
        }
        let tx = conn.transaction()?;
        for file in files.iter_mut() {
            if !live_tables[&file.table_id] {
                file.file_type = FileType::ToDelete;
            }
            file.updated_time = now_micros();
            update_file_row(&tx, file)?;
        }
        tx.commit()?;
        debug!(count = files.len(), "updated table files");
        Ok(())
    }

    pub fn update_files_row_count(&self, files: &[FileSchema]) -> Result<()> {
        let conn = self.conn.lock();
        for file in files {
            conn.execute(
                "UPDATE table_files SET row_count = ?1, updated_time = ?2 WHERE file_id = ?3",
                params![file.row_count as i64, now_micros(), file.file_id],
            )?;
        }
        Ok(())
    }

    /// Files eligible to serve a query: RAW, TO_INDEX and INDEX. An empty id
    /// list means every file of the table.
    pub fn files_to_search(&self, table_id: &str, ids: &[i64]) -> Result<Vec<FileSchema>> {
        let table = self.describe_table(table_id)?;
        let conn = self.conn.lock();
        let base = format!(
            "SELECT {FILE_COLUMNS} FROM table_files \
             WHERE table_id = ?1 AND file_type IN (?2, ?3, ?4)"
        );
        let sql = if ids.is_empty() {
            base
        } else {
            format!("{base} AND id IN ({})", id_list(ids))
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![
                table_id,
                FileType::Raw as i64,
                FileType::ToIndex as i64,
                FileType::Index as i64
            ],
            file_row_tuple,
        )?;
        rows.map(|r| self.file_from_tuple(r?, &table)).collect()
    }

    /// Raw files strictly smaller than the table's preferred segment size,
    /// largest first to minimize write amplification.
    pub fn files_to_merge(&self, table_id: &str) -> Result<Vec<FileSchema>> {
        let table = self.describe_table(table_id)?;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {FILE_COLUMNS} FROM table_files \
             WHERE table_id = ?1 AND file_type = ?2 AND file_size < ?3 \
             ORDER BY file_size DESC"
        ))?;
        let rows = stmt.query_map(
            params![
                table_id,
                FileType::Raw as i64,
                table.index_file_size as i64
            ],
            file_row_tuple,
        )?;
        rows.map(|r| self.file_from_tuple(r?, &table)).collect()
    }

    /// Every TO_INDEX file across all tables.
    pub fn files_to_index(&self) -> Result<Vec<FileSchema>> {
        let raw: Vec<FileRow> = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(&format!(
                "SELECT {FILE_COLUMNS} FROM table_files WHERE file_type = ?1"
            ))?;
            let rows = stmt.query_map(params![FileType::ToIndex as i64], file_row_tuple)?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        let mut out = Vec::with_capacity(raw.len());
        let mut tables: HashMap<String, TableSchema> = HashMap::new();
        for row in raw {
            let table_id = row.1.clone();
            let table = match tables.get(&table_id) {
                Some(t) => t.clone(),
                None => {
                    let t = self.describe_table(&table_id)?;
                    tables.insert(table_id, t.clone());
                    t
                }
            };
            out.push(self.file_from_tuple(row, &table)?);
        }
        if !out.is_empty() {
            debug!(count = out.len(), "collected to-index files");
        }
        Ok(out)
    }

    pub fn files_by_type(&self, table_id: &str, types: &[FileType]) -> Result<Vec<FileSchema>> {
        if types.is_empty() {
            return Err(Error::invalid("file types array is empty"));
        }
        let table = self.describe_table(table_id)?;
        let conn = self.conn.lock();
        let type_list = types
            .iter()
            .map(|t| (*t as i64).to_string())
            .collect::<Vec<_>>()
            .join(",");
        let mut stmt = conn.prepare(&format!(
            "SELECT {FILE_COLUMNS} FROM table_files \
             WHERE table_id = ?1 AND file_type IN ({type_list})"
        ))?;
        let rows = stmt.query_map(params![table_id], file_row_tuple)?;
        rows.map(|r| self.file_from_tuple(r?, &table)).collect()
    }

    // ------------------------------------------------------------------
    // maintenance

    /// Apply the configured retention policies.
    pub fn archive(&self) -> Result<()> {
        if let Some(days) = self.archive.days {
            let cutoff = now_micros() - days as i64 * MICROS_PER_DAY;
            let conn = self.conn.lock();
            let changed = conn.execute(
                "UPDATE table_files SET file_type = ?1, updated_time = ?2 \
                 WHERE created_on < ?3 AND file_type != ?1",
                params![FileType::ToDelete as i64, now_micros(), cutoff],
            )?;
            drop(conn);
            if changed > 0 {
                debug!(changed, days, "archived files older than retention window");
            }
        }
        if let Some(disk_gb) = self.archive.disk_gb {
            let total = self.size()?;
            let limit = disk_gb * 1024 * 1024 * 1024;
            let to_discard = total as i64 - limit as i64;
            self.discard_files(to_discard)?;
        }
        Ok(())
    }

    /// Soft-delete the oldest files until `to_discard` bytes are covered,
    /// in batches of ten.
    pub fn discard_files(&self, mut to_discard: i64) -> Result<()> {
        while to_discard > 0 {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;
            let batch: Vec<(i64, i64)> = {
                let mut stmt = tx.prepare(
                    "SELECT id, file_size FROM table_files WHERE file_type != ?1 \
                     ORDER BY id LIMIT ?2",
                )?;
                let rows = stmt.query_map(
                    params![FileType::ToDelete as i64, DISCARD_BATCH as i64],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                rows.collect::<rusqlite::Result<_>>()?
            };
            if batch.is_empty() {
                tx.commit()?;
                return Ok(());
            }
            let mut marked = Vec::new();
            for (id, file_size) in batch {
                if to_discard <= 0 {
                    break;
                }
                marked.push(id.to_string());
                to_discard -= file_size;
            }
            tx.execute(
                &format!(
                    "UPDATE table_files SET file_type = ?1, updated_time = ?2 \
                     WHERE id IN ({})",
                    marked.join(",")
                ),
                params![FileType::ToDelete as i64, now_micros()],
            )?;
            tx.commit()?;
            debug!(marked = marked.len(), "discarded files for disk pressure");
        }
        Ok(())
    }

    /// Startup-only: physically remove every NEW/NEW_MERGE/NEW_INDEX row.
    /// Those are in-flight allocations of a previous process that crashed
    /// before the durable transition.
    pub fn clean_up_shadow_files(&self) -> Result<()> {
        let shadows: Vec<FileSchema> = {
            let raw: Vec<FileRow> = {
                let conn = self.conn.lock();
                let mut stmt = conn.prepare(&format!(
                    "SELECT {FILE_COLUMNS} FROM table_files WHERE file_type IN (?1, ?2, ?3)"
                ))?;
                let rows = stmt.query_map(
                    params![
                        FileType::New as i64,
                        FileType::NewMerge as i64,
                        FileType::NewIndex as i64
                    ],
                    file_row_tuple,
                )?;
                rows.collect::<rusqlite::Result<_>>()?
            };
            raw.into_iter()
                .map(|row| self.file_from_tuple_orphan(row))
                .collect::<Result<_>>()?
        };

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for file in &shadows {
            tx.execute("DELETE FROM table_files WHERE id = ?1", params![file.id])?;
        }
        tx.commit()?;
        drop(conn);

        for file in &shadows {
            paths::remove_file_payloads(file);
        }
        if !shadows.is_empty() {
            debug!(count = shadows.len(), "cleaned shadow files");
        }
        Ok(())
    }

    /// Three-phase garbage collection of soft-deleted entities older than
    /// `seconds`. Files still referenced by a query or builder are skipped
    /// until released.
    pub fn clean_up_files_with_ttl(&self, seconds: u64) -> Result<()> {
        let cutoff = now_micros() - seconds as i64 * MICROS_PER_SECOND;

        // Phase 1: expired TO_DELETE / BACKUP files.
        let candidates: Vec<FileSchema> = {
            let raw: Vec<FileRow> = {
                let conn = self.conn.lock();
                let mut stmt = conn.prepare(&format!(
                    "SELECT {FILE_COLUMNS} FROM table_files \
                     WHERE file_type IN (?1, ?2) AND updated_time < ?3"
                ))?;
                let rows = stmt.query_map(
                    params![
                        FileType::ToDelete as i64,
                        FileType::Backup as i64,
                        cutoff
                    ],
                    file_row_tuple,
                )?;
                rows.collect::<rusqlite::Result<_>>()?
            };
            raw.into_iter()
                .map(|row| self.file_from_tuple_orphan(row))
                .collect::<Result<_>>()?
        };

        let mut touched_tables: HashSet<String> = HashSet::new();
        let mut touched_segments: HashMap<String, FileSchema> = HashMap::new();
        let mut removed = Vec::new();
        {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;
            for file in candidates {
                if self.ongoing.contains(file.id) {
                    debug!(file_id = %file.file_id, "file in use, deferring gc");
                    continue;
                }
                tx.execute("DELETE FROM table_files WHERE id = ?1", params![file.id])?;
                touched_tables.insert(file.table_id.clone());
                touched_segments.insert(file.segment_id.clone(), file.clone());
                removed.push(file);
            }
            tx.commit()?;
        }
        for file in &removed {
            paths::remove_file_payloads(file);
        }
        if !removed.is_empty() {
            debug!(count = removed.len(), ttl = seconds, "gc removed expired files");
        }

        // Phase 2: soft-deleted tables whose directory emptied out.
        let dead_tables: Vec<(i64, String)> = {
            let conn = self.conn.lock();
            let mut stmt =
                conn.prepare("SELECT id, table_id FROM tables WHERE state = ?1")?;
            let rows = stmt.query_map(params![TableState::ToDelete as i64], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;
            for (id, table_id) in &dead_tables {
                paths::remove_table_path(&self.root, table_id, true);
                tx.execute("DELETE FROM tables WHERE id = ?1", params![id])?;
            }
            tx.commit()?;
        }
        if !dead_tables.is_empty() {
            debug!(count = dead_tables.len(), "gc removed soft-deleted tables");
        }

        // Phase 3: directories emptied by phase 1.
        for table_id in &touched_tables {
            let conn = self.conn.lock();
            let remaining: i64 = conn.query_row(
                "SELECT COUNT(*) FROM table_files WHERE table_id = ?1",
                params![table_id],
                |row| row.get(0),
            )?;
            drop(conn);
            if remaining == 0 {
                paths::remove_table_path(&self.root, table_id, false);
            }
        }
        for (segment_id, file) in &touched_segments {
            let conn = self.conn.lock();
            let remaining: i64 = conn.query_row(
                "SELECT COUNT(*) FROM table_files WHERE segment_id = ?1",
                params![segment_id],
                |row| row.get(0),
            )?;
            drop(conn);
            if remaining == 0 {
                paths::remove_segment_dir(&self.root, file);
            }
        }
        Ok(())
    }

    /// Total row count over the serving states of a table.
    pub fn count(&self, table_id: &str) -> Result<u64> {
        self.describe_table(table_id)?;
        let conn = self.conn.lock();
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(row_count), 0) FROM table_files \
             WHERE table_id = ?1 AND file_type IN (?2, ?3, ?4)",
            params![
                table_id,
                FileType::Raw as i64,
                FileType::ToIndex as i64,
                FileType::Index as i64
            ],
            |row| row.get(0),
        )?;
        Ok(total as u64)
    }

    /// Total on-disk bytes over everything not yet soft-deleted.
    pub fn size(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(file_size), 0) FROM table_files WHERE file_type != ?1",
            params![FileType::ToDelete as i64],
            |row| row.get(0),
        )?;
        Ok(total as u64)
    }

    pub fn set_global_lsn(&self, lsn: u64) -> Result<()> {
        let conn = self.conn.lock();
        let existing: Option<i64> = conn
            .query_row("SELECT global_lsn FROM environment", [], |row| row.get(0))
            .map(Some)
            .or_else(ignore_no_rows)?;
        match existing {
            None => {
                conn.execute(
                    "INSERT INTO environment (global_lsn) VALUES (?1)",
                    params![lsn as i64],
                )?;
            }
            Some(last) if last as u64 == lsn => {}
            Some(_) => {
                conn.execute("UPDATE environment SET global_lsn = ?1", params![lsn as i64])?;
            }
        }
        Ok(())
    }

    pub fn get_global_lsn(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let lsn: Option<i64> = conn
            .query_row("SELECT global_lsn FROM environment", [], |row| row.get(0))
            .map(Some)
            .or_else(ignore_no_rows)?;
        Ok(lsn.unwrap_or(0) as u64)
    }

    pub fn drop_all(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "DROP TABLE IF EXISTS tables; DROP TABLE IF EXISTS table_files; \
             DROP TABLE IF EXISTS environment;",
        )?;
        warn!("dropped all catalog tables");
        Ok(())
    }

    // ------------------------------------------------------------------

    fn file_from_tuple(&self, row: FileRow, table: &TableSchema) -> Result<FileSchema> {
        let mut file = file_from_row(row)?;
        file.dimension = table.dimension;
        file.index_file_size = table.index_file_size;
        file.index_params = table.index_params.clone();
        file.metric_type = table.metric_type;
        file.location = paths::file_location(&self.root, &file);
        Ok(file)
    }

    /// For cleanup paths the owning table may itself be gone; fall back to
    /// defaults for the denormalized fields.
    fn file_from_tuple_orphan(&self, row: FileRow) -> Result<FileSchema> {
        let table_id = row.1.clone();
        match self.describe_table(&table_id) {
            Ok(table) => self.file_from_tuple(row, &table),
            Err(_) => {
                let mut file = file_from_row(row)?;
                file.location = paths::file_location(&self.root, &file);
                Ok(file)
            }
        }
    }
}

fn describe_table_conn(conn: &Connection, table_id: &str) -> Result<TableSchema> {
    let table_id = table_id.trim();
    let row = conn
        .query_row(
            &format!(
                "SELECT {TABLE_COLUMNS} FROM tables WHERE table_id = ?1 AND state != ?2"
            ),
            params![table_id, TableState::ToDelete as i64],
            table_row_tuple,
        )
        .map_err(|_| Error::not_found(format!("table {table_id}")))?;
    table_from_tuple(row)
}

fn table_is_live(conn: &Connection, table_id: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM tables WHERE table_id = ?1 AND state != ?2",
        params![table_id, TableState::ToDelete as i64],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn update_file_row(conn: &Connection, file: &FileSchema) -> Result<()> {
    conn.execute(
        "UPDATE table_files SET table_id = ?1, segment_id = ?2, engine_type = ?3, \
         file_id = ?4, file_type = ?5, file_size = ?6, row_count = ?7, updated_time = ?8, \
         created_on = ?9, date = ?10, flush_lsn = ?11 WHERE id = ?12",
        params![
            file.table_id,
            file.segment_id,
            file.engine_type as i64,
            file.file_id,
            file.file_type as i64,
            file.file_size as i64,
            file.row_count as i64,
            file.updated_time,
            file.created_on,
            file.date,
            file.flush_lsn as i64,
            file.id,
        ],
    )?;
    Ok(())
}

type TableRow = (
    i64,
    String,
    i64,
    i64,
    i64,
    i64,
    i64,
    i64,
    String,
    i64,
    String,
    String,
    String,
    i64,
);

fn table_row_tuple(row: &rusqlite::Row<'_>) -> rusqlite::Result<TableRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
        row.get(13)?,
    ))
}

fn table_from_tuple(row: TableRow) -> Result<TableSchema> {
    Ok(TableSchema {
        id: row.0,
        table_id: row.1,
        state: TableState::from_i64(row.2)?,
        dimension: row.3 as u16,
        created_on: row.4,
        flag: row.5,
        index_file_size: row.6 as u64,
        engine_type: EngineType::from_i64(row.7)?,
        index_params: serde_json::from_str(&row.8).unwrap_or_else(|_| serde_json::json!({})),
        metric_type: MetricType::from_i64(row.9)?,
        owner_table: row.10,
        partition_tag: row.11,
        version: row.12,
        flush_lsn: row.13 as u64,
    })
}

type FileRow = (
    i64,
    String,
    String,
    i64,
    String,
    i64,
    i64,
    i64,
    i64,
    i64,
    i64,
    i64,
);

fn file_row_tuple(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
    ))
}

fn file_from_row(row: FileRow) -> Result<FileSchema> {
    Ok(FileSchema {
        id: row.0,
        table_id: row.1,
        segment_id: row.2,
        engine_type: EngineType::from_i64(row.3)?,
        file_id: row.4,
        file_type: FileType::from_i64(row.5)?,
        file_size: row.6 as u64,
        row_count: row.7 as u64,
        updated_time: row.8,
        created_on: row.9,
        date: row.10 as i32,
        flush_lsn: row.11 as u64,
        dimension: 0,
        index_file_size: 0,
        index_params: serde_json::json!({}),
        metric_type: MetricType::L2,
        location: PathBuf::new(),
    })
}

fn id_list(ids: &[i64]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn ignore_no_rows<T>(err: rusqlite::Error) -> rusqlite::Result<Option<T>> {
    match err {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(other),
    }
}

/// An older process may have created these tables with a different shape;
/// recreating them would silently lose catalog state, so refuse to open.
fn validate_schema(conn: &Connection) -> Result<()> {
    for (name, expected) in [
        ("environment", CREATE_ENVIRONMENT),
        ("tables", CREATE_TABLES),
        ("table_files", CREATE_TABLE_FILES),
    ] {
        let existing: Option<String> = conn
            .query_row(
                "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![name],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(ignore_no_rows)?;
        if let Some(sql) = existing {
            if normalize_sql(&sql) != normalize_sql(expected) {
                return Err(Error::IncompatibleMeta(format!(
                    "catalog table {name} was created by an incompatible version"
                )));
            }
        }
    }
    Ok(())
}

fn normalize_sql(sql: &str) -> String {
    sql.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace('"', "")
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusCode;

    fn open_meta(dir: &Path) -> SqliteMeta {
        SqliteMeta::open(dir, ArchiveConf::default(), Arc::new(OngoingFiles::new())).unwrap()
    }

    fn make_table(meta: &SqliteMeta, table_id: &str, dim: u16) -> TableSchema {
        let mut schema = TableSchema::new(table_id, dim, MetricType::L2);
        meta.create_table(&mut schema).unwrap();
        schema
    }

    fn make_file(meta: &SqliteMeta, table_id: &str, file_type: FileType, size: u64) -> FileSchema {
        let table = meta.describe_table(table_id).unwrap();
        let mut file = FileSchema::for_table(&table);
        meta.create_file(&mut file).unwrap();
        file.file_type = file_type;
        file.file_size = size;
        meta.update_file(&mut file).unwrap();
        file
    }

    #[test]
    fn create_table_rejects_duplicates_and_pending_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let meta = open_meta(dir.path());
        make_table(&meta, "t1", 8);

        let mut dup = TableSchema::new("t1", 8, MetricType::L2);
        assert_eq!(
            meta.create_table(&mut dup).unwrap_err().code(),
            StatusCode::AlreadyExist
        );

        meta.drop_table("t1").unwrap();
        let mut pending = TableSchema::new("t1", 8, MetricType::L2);
        assert_eq!(
            meta.create_table(&mut pending).unwrap_err().code(),
            StatusCode::PendingDelete
        );
    }

    #[test]
    fn reads_exclude_soft_deleted_rows() {
        let dir = tempfile::tempdir().unwrap();
        let meta = open_meta(dir.path());
        make_table(&meta, "t1", 8);
        assert!(meta.has_table("t1").unwrap());
        meta.drop_table("t1").unwrap();
        assert!(!meta.has_table("t1").unwrap());
        assert!(meta.all_tables().unwrap().is_empty());
        assert_eq!(
            meta.describe_table("t1").unwrap_err().code(),
            StatusCode::NotFound
        );
        // drop is idempotent
        meta.drop_table("t1").unwrap();
    }

    #[test]
    fn file_ids_and_row_ids_stay_unique() {
        let dir = tempfile::tempdir().unwrap();
        let meta = open_meta(dir.path());
        make_table(&meta, "t1", 8);
        let mut seen_row_ids = HashSet::new();
        let mut seen_file_ids = HashSet::new();
        for _ in 0..64 {
            let file = make_file(&meta, "t1", FileType::Raw, 10);
            assert!(seen_row_ids.insert(file.id));
            assert!(seen_file_ids.insert(file.file_id.clone()));
        }
    }

    #[test]
    fn create_file_inherits_table_attributes() {
        let dir = tempfile::tempdir().unwrap();
        let meta = open_meta(dir.path());
        let mut schema = TableSchema::new("t1", 128, MetricType::Ip);
        schema.index_file_size = 4096;
        meta.create_table(&mut schema).unwrap();

        let mut file = FileSchema::for_table(&schema);
        meta.create_file(&mut file).unwrap();
        assert_eq!(file.dimension, 128);
        assert_eq!(file.metric_type, MetricType::Ip);
        assert_eq!(file.index_file_size, 4096);
        assert_eq!(file.segment_id, file.file_id);
        assert!(file.location.ends_with(format!("{}.vec", file.file_id)));
        assert!(file.location.parent().unwrap().exists());
    }

    #[test]
    fn update_file_on_dead_table_forces_to_delete() {
        let dir = tempfile::tempdir().unwrap();
        let meta = open_meta(dir.path());
        make_table(&meta, "t1", 8);
        let mut file = make_file(&meta, "t1", FileType::Raw, 10);
        meta.drop_table("t1").unwrap();
        file.file_type = FileType::Raw;
        meta.update_file(&mut file).unwrap();
        assert_eq!(file.file_type, FileType::ToDelete);
    }

    #[test]
    fn files_to_merge_filters_and_orders() {
        let dir = tempfile::tempdir().unwrap();
        let meta = open_meta(dir.path());
        let mut schema = TableSchema::new("t1", 8, MetricType::L2);
        schema.index_file_size = 1000;
        meta.create_table(&mut schema).unwrap();

        make_file(&meta, "t1", FileType::Raw, 10);
        make_file(&meta, "t1", FileType::Raw, 500);
        make_file(&meta, "t1", FileType::Raw, 2000); // too large to merge
        make_file(&meta, "t1", FileType::Index, 20); // wrong state

        let to_merge = meta.files_to_merge("t1").unwrap();
        let sizes: Vec<u64> = to_merge.iter().map(|f| f.file_size).collect();
        assert_eq!(sizes, vec![500, 10]);
    }

    #[test]
    fn files_to_search_returns_serving_states_only() {
        let dir = tempfile::tempdir().unwrap();
        let meta = open_meta(dir.path());
        make_table(&meta, "t1", 8);
        make_file(&meta, "t1", FileType::Raw, 10);
        make_file(&meta, "t1", FileType::ToIndex, 10);
        make_file(&meta, "t1", FileType::Index, 10);
        make_file(&meta, "t1", FileType::New, 10);
        make_file(&meta, "t1", FileType::ToDelete, 10);

        let files = meta.files_to_search("t1", &[]).unwrap();
        assert_eq!(files.len(), 3);
        assert!(files.iter().all(|f| f.file_type.is_searchable()));
        assert!(files.iter().all(|f| f.dimension == 8));
    }

    #[test]
    fn partitions_trim_tags_and_reject_nesting() {
        let dir = tempfile::tempdir().unwrap();
        let meta = open_meta(dir.path());
        make_table(&meta, "t1", 8);

        let p1 = meta.create_partition("t1", None, " a ", 0).unwrap();
        assert_eq!(p1.partition_tag, "a");
        assert_eq!(p1.dimension, 8);

        let err = meta.create_partition("t1", None, "a", 0).unwrap_err();
        assert_eq!(err.code(), StatusCode::AlreadyExist);

        let err = meta
            .create_partition(&p1.table_id, None, "sub", 0)
            .unwrap_err();
        assert_eq!(err.code(), StatusCode::InvalidArgument);

        assert_eq!(meta.show_partitions("t1").unwrap().len(), 1);
        assert_eq!(meta.get_partition_name("t1", "  a").unwrap(), p1.table_id);
    }

    #[test]
    fn shadow_cleanup_removes_in_flight_rows() {
        let dir = tempfile::tempdir().unwrap();
        let meta = open_meta(dir.path());
        make_table(&meta, "t1", 8);
        make_file(&meta, "t1", FileType::New, 0);
        make_file(&meta, "t1", FileType::NewMerge, 0);
        make_file(&meta, "t1", FileType::NewIndex, 0);
        let keep = make_file(&meta, "t1", FileType::Raw, 10);

        meta.clean_up_shadow_files().unwrap();
        let remaining = meta
            .files_by_type(
                "t1",
                &[
                    FileType::New,
                    FileType::NewMerge,
                    FileType::NewIndex,
                    FileType::Raw,
                ],
            )
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].file_id, keep.file_id);
    }

    #[test]
    fn ttl_gc_skips_ongoing_files() {
        let dir = tempfile::tempdir().unwrap();
        let ongoing = Arc::new(OngoingFiles::new());
        let meta =
            SqliteMeta::open(dir.path(), ArchiveConf::default(), ongoing.clone()).unwrap();
        make_table(&meta, "t1", 8);
        let held = make_file(&meta, "t1", FileType::ToDelete, 10);
        let free = make_file(&meta, "t1", FileType::ToDelete, 10);

        let guard = ongoing.guard([held.id]);
        std::thread::sleep(std::time::Duration::from_millis(2));
        meta.clean_up_files_with_ttl(0).unwrap();
        let remaining = meta.files_by_type("t1", &[FileType::ToDelete]).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, held.id);
        assert_ne!(remaining[0].id, free.id);

        drop(guard);
        std::thread::sleep(std::time::Duration::from_millis(2));
        meta.clean_up_files_with_ttl(0).unwrap();
        assert!(meta
            .files_by_type("t1", &[FileType::ToDelete])
            .unwrap()
            .is_empty());
    }

    #[test]
    fn ttl_gc_removes_dead_table_and_directory() {
        let dir = tempfile::tempdir().unwrap();
        let meta = open_meta(dir.path());
        make_table(&meta, "t1", 8);
        let file = make_file(&meta, "t1", FileType::Raw, 10);
        std::fs::write(&file.location, b"payload").unwrap();

        meta.drop_table("t1").unwrap();
        meta.delete_table_files("t1").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        meta.clean_up_files_with_ttl(0).unwrap();

        assert!(!meta.has_table("t1").unwrap());
        assert!(!paths::table_path(dir.path(), "t1").exists());
        assert!(!file.location.exists());
    }

    #[test]
    fn count_sums_serving_rows() {
        let dir = tempfile::tempdir().unwrap();
        let meta = open_meta(dir.path());
        make_table(&meta, "t1", 8);
        for (file_type, rows) in [
            (FileType::Raw, 10),
            (FileType::Index, 20),
            (FileType::ToDelete, 500),
        ] {
            let table = meta.describe_table("t1").unwrap();
            let mut file = FileSchema::for_table(&table);
            meta.create_file(&mut file).unwrap();
            file.file_type = file_type;
            file.row_count = rows;
            meta.update_file(&mut file).unwrap();
        }
        assert_eq!(meta.count("t1").unwrap(), 30);
    }

    #[test]
    fn drop_table_index_converts_index_files_to_raw() {
        let dir = tempfile::tempdir().unwrap();
        let meta = open_meta(dir.path());
        make_table(&meta, "t1", 8);
        let index_file = make_file(&meta, "t1", FileType::Index, 40);
        let backup = make_file(&meta, "t1", FileType::Backup, 30);

        meta.drop_table_index("t1").unwrap();

        // The indexed segment itself falls back to raw serving.
        let raw = meta.files_by_type("t1", &[FileType::Raw]).unwrap();
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].id, index_file.id);
        assert_eq!(raw[0].engine_type, EngineType::Flat);
        let dead = meta.files_by_type("t1", &[FileType::ToDelete]).unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, backup.id);
        assert_eq!(
            meta.describe_table("t1").unwrap().engine_type,
            EngineType::Flat
        );
    }

    #[test]
    fn table_flag_and_row_count_updates_persist() {
        let dir = tempfile::tempdir().unwrap();
        let meta = open_meta(dir.path());
        make_table(&meta, "t1", 8);
        meta.update_table_flag("t1", 3).unwrap();
        assert_eq!(meta.describe_table("t1").unwrap().flag, 3);

        let mut file = make_file(&meta, "t1", FileType::Raw, 10);
        file.row_count = 77;
        meta.update_files_row_count(std::slice::from_ref(&file))
            .unwrap();
        assert_eq!(meta.count("t1").unwrap(), 77);
    }

    #[test]
    fn files_fetch_by_id_and_segment() {
        let dir = tempfile::tempdir().unwrap();
        let meta = open_meta(dir.path());
        make_table(&meta, "t1", 8);
        let a = make_file(&meta, "t1", FileType::Raw, 10);
        let b = make_file(&meta, "t1", FileType::Raw, 20);

        let fetched = meta.get_files("t1", &[a.id]).unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].file_id, a.file_id);
        assert!(meta.get_files("t1", &[]).unwrap().is_empty());

        let by_segment = meta.get_files_by_segment(&b.segment_id).unwrap();
        assert_eq!(by_segment.len(), 1);
        assert_eq!(by_segment[0].id, b.id);
        assert_eq!(by_segment[0].dimension, 8);
    }

    #[test]
    fn global_lsn_upserts() {
        let dir = tempfile::tempdir().unwrap();
        let meta = open_meta(dir.path());
        assert_eq!(meta.get_global_lsn().unwrap(), 0);
        meta.set_global_lsn(7).unwrap();
        meta.set_global_lsn(7).unwrap();
        meta.set_global_lsn(9).unwrap();
        assert_eq!(meta.get_global_lsn().unwrap(), 9);
    }

    #[test]
    fn incompatible_schema_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let conn = Connection::open(dir.path().join("meta.sqlite")).unwrap();
            conn.execute_batch("CREATE TABLE tables (id INTEGER PRIMARY KEY, junk TEXT)")
                .unwrap();
        }
        let err = SqliteMeta::open(
            dir.path(),
            ArchiveConf::default(),
            Arc::new(OngoingFiles::new()),
        )
        .unwrap_err();
        assert_eq!(err.code(), StatusCode::IncompatibleMeta);
    }

    #[test]
    fn archive_days_marks_old_files() {
        let dir = tempfile::tempdir().unwrap();
        let meta = SqliteMeta::open(
            dir.path(),
            ArchiveConf {
                days: Some(1),
                disk_gb: None,
            },
            Arc::new(OngoingFiles::new()),
        )
        .unwrap();
        make_table(&meta, "t1", 8);
        let mut old = make_file(&meta, "t1", FileType::Raw, 10);
        old.created_on = now_micros() - 2 * MICROS_PER_DAY;
        meta.update_file(&mut old).unwrap();
        let fresh = make_file(&meta, "t1", FileType::Raw, 10);

        meta.archive().unwrap();
        let to_delete = meta.files_by_type("t1", &[FileType::ToDelete]).unwrap();
        assert_eq!(to_delete.len(), 1);
        assert_eq!(to_delete[0].id, old.id);
        let raw = meta.files_by_type("t1", &[FileType::Raw]).unwrap();
        assert_eq!(raw[0].id, fresh.id);
    }

    #[test]
    fn discard_files_frees_requested_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let meta = open_meta(dir.path());
        make_table(&meta, "t1", 8);
        for _ in 0..25 {
            make_file(&meta, "t1", FileType::Raw, 100);
        }
        meta.discard_files(1500).unwrap();
        let remaining = meta.files_by_type("t1", &[FileType::Raw]).unwrap();
        assert!(remaining.len() <= 10, "remaining {}", remaining.len());
        assert_eq!(meta.size().unwrap(), remaining.len() as u64 * 100);
    }
}
