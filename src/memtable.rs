use crate::kernel;
use crate::meta::MetricType;
use crate::status::{Error, Result};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

const BLACKLIST_FILE: &str = "deleted.bin";

/// One table's unflushed inserts plus its deleted-id blacklist. Buffered
/// rows keep WAL order; the id set makes replay idempotent.
#[derive(Default)]
struct TableMem {
    dim: u16,
    ids: Vec<u64>,
    id_set: HashSet<u64>,
    vectors: Vec<f32>,
    max_lsn: u64,
    deleted: HashSet<u64>,
}

impl TableMem {
    fn bytes(&self) -> u64 {
        (self.vectors.len() * 4 + self.ids.len() * 8) as u64
    }
}

/// A buffer consumed by a flush: the rows, the highest LSN they cover and
/// the dimension they were validated against.
pub struct ConsumedBuffer {
    pub dim: u16,
    pub ids: Vec<u64>,
    pub vectors: Vec<f32>,
    pub max_lsn: u64,
}

pub struct MemManager {
    root: PathBuf,
    tables: RwLock<HashMap<String, TableMem>>,
}

impl MemManager {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            tables: RwLock::new(HashMap::new()),
        }
    }

    /// Buffer rows that have already been WAL-acknowledged. Rows whose id is
    /// already buffered are skipped, so replaying a record twice is a no-op.
    pub fn insert(
        &self,
        table_id: &str,
        dim: u16,
        lsn: u64,
        ids: &[u64],
        vectors: &[f32],
    ) -> Result<()> {
        if vectors.len() != ids.len() * dim as usize {
            return Err(Error::invalid(format!(
                "insert payload shape mismatch for table {table_id}"
            )));
        }
        let mut tables = self.tables.write();
        let mem = tables.entry(table_id.to_string()).or_default();
        if mem.dim == 0 {
            mem.dim = dim;
        } else if mem.dim != dim {
            return Err(Error::invalid(format!(
                "table {table_id} buffer dimension changed from {} to {dim}",
                mem.dim
            )));
        }
        for (row, &id) in ids.iter().enumerate() {
            if !mem.id_set.insert(id) {
                continue;
            }
            mem.ids.push(id);
            mem.vectors
                .extend_from_slice(&vectors[row * dim as usize..(row + 1) * dim as usize]);
            mem.deleted.remove(&id);
        }
        mem.max_lsn = mem.max_lsn.max(lsn);
        Ok(())
    }

    /// Apply deletes: remove buffered rows and blacklist ids that may live
    /// in flushed segment files.
    pub fn delete(&self, table_id: &str, lsn: u64, ids: &[u64]) {
        let mut tables = self.tables.write();
        let mem = tables.entry(table_id.to_string()).or_default();
        let to_remove: HashSet<u64> = ids.iter().copied().collect();
        if ids.iter().any(|id| mem.id_set.contains(id)) {
            let dim = mem.dim as usize;
            let mut kept_ids = Vec::with_capacity(mem.ids.len());
            let mut kept_vectors = Vec::with_capacity(mem.vectors.len());
            for (row, &id) in mem.ids.iter().enumerate() {
                if to_remove.contains(&id) {
                    mem.id_set.remove(&id);
                    continue;
                }
                kept_ids.push(id);
                kept_vectors.extend_from_slice(&mem.vectors[row * dim..(row + 1) * dim]);
            }
            mem.ids = kept_ids;
            mem.vectors = kept_vectors;
        }
        mem.deleted.extend(ids.iter().copied());
        mem.max_lsn = mem.max_lsn.max(lsn);
    }

    pub fn buffer_bytes(&self, table_id: &str) -> u64 {
        self.tables
            .read()
            .get(table_id)
            .map(|mem| mem.bytes())
            .unwrap_or(0)
    }

    /// Tables currently holding unflushed rows.
    pub fn dirty_tables(&self) -> Vec<String> {
        self.tables
            .read()
            .iter()
            .filter(|(_, mem)| !mem.ids.is_empty())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Consume a table's buffer for a flush. The deleted set stays.
    pub fn consume(&self, table_id: &str) -> Option<ConsumedBuffer> {
        let mut tables = self.tables.write();
        let mem = tables.get_mut(table_id)?;
        if mem.ids.is_empty() {
            return None;
        }
        mem.id_set.clear();
        Some(ConsumedBuffer {
            dim: mem.dim,
            ids: std::mem::take(&mut mem.ids),
            vectors: std::mem::take(&mut mem.vectors),
            max_lsn: mem.max_lsn,
        })
    }

    /// Return a consumed buffer after a failed flush so the rows are not
    /// lost; replayed ids merge back idempotently.
    pub fn restore(&self, table_id: &str, buffer: ConsumedBuffer) {
        let _ = self.insert(
            table_id,
            buffer.dim,
            buffer.max_lsn,
            &buffer.ids,
            &buffer.vectors,
        );
    }

    pub fn blacklist(&self, table_id: &str) -> HashSet<u64> {
        self.tables
            .read()
            .get(table_id)
            .map(|mem| mem.deleted.clone())
            .unwrap_or_default()
    }

    pub fn get_vector(&self, table_id: &str, id: u64) -> Option<Vec<f32>> {
        let tables = self.tables.read();
        let mem = tables.get(table_id)?;
        let dim = mem.dim as usize;
        mem.ids
            .iter()
            .position(|&row_id| row_id == id)
            .map(|row| mem.vectors[row * dim..(row + 1) * dim].to_vec())
    }

    /// Brute-force the buffer with the same kernel dispatch the segment
    /// scans use.
    pub fn search(
        &self,
        table_id: &str,
        metric: MetricType,
        query: &[f32],
        k: usize,
    ) -> Vec<(u64, f32)> {
        let tables = self.tables.read();
        let Some(mem) = tables.get(table_id) else {
            return Vec::new();
        };
        let dim = mem.dim as usize;
        if dim == 0 || query.len() != dim || mem.ids.is_empty() {
            return Vec::new();
        }
        let kern = kernel::select_kernel(metric, dim);
        let mut scored: Vec<(u64, f32)> = mem
            .ids
            .iter()
            .zip(mem.vectors.chunks_exact(dim))
            .map(|(&id, row)| (id, kern(query, row)))
            .collect();
        crate::index::sort_by_metric(metric, &mut scored);
        scored.truncate(k);
        scored
    }

    pub fn drop_table(&self, table_id: &str) {
        self.tables.write().remove(table_id);
        let _ = std::fs::remove_file(self.blacklist_path(table_id));
    }

    /// Persist the table's deleted-id set; called at flush so deletes of
    /// already-flushed rows survive a restart.
    pub fn store_blacklist(&self, table_id: &str) -> Result<()> {
        let deleted = self.blacklist(table_id);
        let mut ids: Vec<u64> = deleted.into_iter().collect();
        ids.sort_unstable();
        let body = bincode::serialize(&ids)
            .map_err(|err| Error::DbError(format!("blacklist encode: {err}")))?;
        let path = self.blacklist_path(table_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&crc32fast::hash(&body).to_le_bytes())?;
            file.write_all(&body)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Load the persisted deleted-id set for a table, if any. A corrupt
    /// sidecar is ignored: the blacklist only widens results it hides.
    pub fn load_blacklist(&self, table_id: &str) {
        let path = self.blacklist_path(table_id);
        let Ok(bytes) = std::fs::read(&path) else {
            return;
        };
        if bytes.len() < 4 {
            return;
        }
        let crc = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let body = &bytes[4..];
        if crc32fast::hash(body) != crc {
            debug!(table_id, "ignoring corrupt blacklist sidecar");
            return;
        }
        let Ok(ids) = bincode::deserialize::<Vec<u64>>(body) else {
            return;
        };
        let mut tables = self.tables.write();
        let mem = tables.entry(table_id.to_string()).or_default();
        mem.deleted.extend(ids);
    }

    fn blacklist_path(&self, table_id: &str) -> PathBuf {
        crate::meta::table_path(&self.root, table_id).join(BLACKLIST_FILE)
    }
}
