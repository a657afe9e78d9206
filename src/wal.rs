use crate::status::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const HEADER_BYTES: usize = 8; // u32 length + u32 crc32
const WRITER_POLL: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalOp {
    Insert = 0,
    Delete = 1,
    FlushMark = 2,
}

impl WalOp {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(WalOp::Insert),
            1 => Ok(WalOp::Delete),
            2 => Ok(WalOp::FlushMark),
            other => Err(Error::CorruptFile(format!("unknown wal op {other}"))),
        }
    }
}

/// One log record. For inserts `vectors` holds `ids.len() * dim` values;
/// deletes carry ids only; flush marks carry neither.
#[derive(Clone, Debug, PartialEq)]
pub struct WalRecord {
    pub op: WalOp,
    pub lsn: u64,
    pub table_id: String,
    pub dim: u32,
    pub ids: Vec<u64>,
    pub vectors: Vec<f32>,
}

/// Frame layout (little-endian):
/// `u32 length | u32 crc32 | u8 op | u64 lsn | u64 table_id_len | table_id |
///  u64 row_count | (u64 id, f32[dim] vec)*`
/// `length` counts the body after the crc field; the crc covers the body.
pub fn encode_record(record: &WalRecord) -> Vec<u8> {
    let dim = record.dim as usize;
    let row_bytes = match record.op {
        WalOp::Insert => 8 + dim * 4,
        _ => 8,
    };
    let body_len = 1 + 8 + 8 + record.table_id.len() + 8 + record.ids.len() * row_bytes;
    let mut body = Vec::with_capacity(body_len);
    body.push(record.op as u8);
    body.extend_from_slice(&record.lsn.to_le_bytes());
    body.extend_from_slice(&(record.table_id.len() as u64).to_le_bytes());
    body.extend_from_slice(record.table_id.as_bytes());
    body.extend_from_slice(&(record.ids.len() as u64).to_le_bytes());
    for (row, &id) in record.ids.iter().enumerate() {
        body.extend_from_slice(&id.to_le_bytes());
        if record.op == WalOp::Insert {
            for &value in &record.vectors[row * dim..(row + 1) * dim] {
                body.extend_from_slice(&value.to_le_bytes());
            }
        }
    }

    let mut framed = Vec::with_capacity(HEADER_BYTES + body.len());
    framed.extend_from_slice(&(body.len() as u32).to_le_bytes());
    framed.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    framed.extend_from_slice(&body);
    framed
}

/// Decode one record starting at `buf[offset..]`. Returns the record and the
/// offset past it, or `None` when the remaining bytes are a truncated or
/// corrupt tail.
pub fn decode_record(buf: &[u8], offset: usize) -> Option<(WalRecord, usize)> {
    let rest = &buf[offset..];
    if rest.len() < HEADER_BYTES {
        return None;
    }
    let len = u32::from_le_bytes(rest[0..4].try_into().unwrap()) as usize;
    let crc = u32::from_le_bytes(rest[4..8].try_into().unwrap());
    if rest.len() < HEADER_BYTES + len {
        return None;
    }
    let body = &rest[HEADER_BYTES..HEADER_BYTES + len];
    if crc32fast::hash(body) != crc {
        return None;
    }
    let record = parse_body(body)?;
    Some((record, offset + HEADER_BYTES + len))
}

fn parse_body(body: &[u8]) -> Option<WalRecord> {
    if body.len() < 1 + 8 + 8 {
        return None;
    }
    let op = WalOp::from_u8(body[0]).ok()?;
    let lsn = u64::from_le_bytes(body[1..9].try_into().unwrap());
    let tid_len = u64::from_le_bytes(body[9..17].try_into().unwrap()) as usize;
    if body.len() < 17 + tid_len + 8 {
        return None;
    }
    let table_id = String::from_utf8(body[17..17 + tid_len].to_vec()).ok()?;
    let mut pos = 17 + tid_len;
    let row_count = u64::from_le_bytes(body[pos..pos + 8].try_into().unwrap()) as usize;
    pos += 8;

    let payload = &body[pos..];
    let (dim, row_bytes) = if row_count == 0 || op != WalOp::Insert {
        if payload.len() != row_count * 8 {
            return None;
        }
        (0u32, 8usize)
    } else {
        if payload.len() % row_count != 0 {
            return None;
        }
        let row_bytes = payload.len() / row_count;
        if row_bytes < 8 || (row_bytes - 8) % 4 != 0 {
            return None;
        }
        (((row_bytes - 8) / 4) as u32, row_bytes)
    };

    let mut ids = Vec::with_capacity(row_count);
    let mut vectors = Vec::with_capacity(row_count * dim as usize);
    for row in payload.chunks_exact(row_bytes) {
        ids.push(u64::from_le_bytes(row[0..8].try_into().unwrap()));
        for chunk in row[8..].chunks_exact(4) {
            vectors.push(f32::from_le_bytes(chunk.try_into().unwrap()));
        }
    }
    Some(WalRecord {
        op,
        lsn,
        table_id,
        dim,
        ids,
        vectors,
    })
}

struct WalState {
    next_lsn: u64,
    durable_lsn: u64,
    pending: Vec<(u64, Vec<u8>)>,
}

/// Owned by the writer thread; never touched under the state lock.
struct WalOutput {
    file: Option<File>,
    bytes: u64,
}

/// Appends are acknowledged only after the group-commit batch containing
/// them has been fsync'd by the writer thread. LSNs are assigned under the
/// state lock: strictly monotonic and gap-free.
pub struct WalManager {
    dir: PathBuf,
    enabled: bool,
    file_max_bytes: u64,
    state: Mutex<WalState>,
    writer_cv: Condvar,
    durable_cv: Condvar,
    running: AtomicBool,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl WalManager {
    pub fn open(dir: &Path, enabled: bool, file_max_bytes: u64, floor_lsn: u64) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let mut max_lsn = floor_lsn;
        if enabled {
            for path in wal_files(dir)? {
                let buf = std::fs::read(&path)?;
                let mut offset = 0usize;
                while let Some((record, next)) = decode_record(&buf, offset) {
                    max_lsn = max_lsn.max(record.lsn);
                    offset = next;
                }
            }
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            enabled,
            file_max_bytes,
            state: Mutex::new(WalState {
                next_lsn: max_lsn + 1,
                durable_lsn: max_lsn,
                pending: Vec::new(),
            }),
            writer_cv: Condvar::new(),
            durable_cv: Condvar::new(),
            running: AtomicBool::new(false),
            handle: Mutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>) {
        if !self.enabled || self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let manager = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("wal-writer".into())
            .spawn(move || manager.writer_loop())
            .expect("spawn wal writer thread");
        *self.handle.lock() = Some(handle);
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.writer_cv.notify_all();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
        self.durable_cv.notify_all();
    }

    /// Append one record and block until it is durable. Returns the LSN.
    pub fn append(
        &self,
        op: WalOp,
        table_id: &str,
        dim: u32,
        ids: &[u64],
        vectors: &[f32],
    ) -> Result<u64> {
        let mut state = self.state.lock();
        let lsn = state.next_lsn;
        state.next_lsn += 1;

        if !self.enabled {
            state.durable_lsn = lsn;
            return Ok(lsn);
        }
        if !self.running.load(Ordering::SeqCst) {
            return Err(Error::DbError("wal writer is not running".into()));
        }

        let record = WalRecord {
            op,
            lsn,
            table_id: table_id.to_string(),
            dim,
            ids: ids.to_vec(),
            vectors: vectors.to_vec(),
        };
        state.pending.push((lsn, encode_record(&record)));
        self.writer_cv.notify_one();

        while state.durable_lsn < lsn {
            if !self.running.load(Ordering::SeqCst) && state.pending.is_empty() {
                return Err(Error::DbError("wal writer stopped before fsync".into()));
            }
            self.durable_cv.wait_for(&mut state, WRITER_POLL);
        }
        Ok(lsn)
    }

    fn writer_loop(self: Arc<Self>) {
        let mut out = WalOutput {
            file: None,
            bytes: 0,
        };
        loop {
            let batch = {
                let mut state = self.state.lock();
                while state.pending.is_empty() && self.running.load(Ordering::SeqCst) {
                    self.writer_cv.wait_for(&mut state, WRITER_POLL);
                }
                if state.pending.is_empty() {
                    break; // stopped and fully drained
                }
                std::mem::take(&mut state.pending)
            };
            match self.write_batch(&mut out, &batch) {
                Ok(()) => {
                    let last = batch.last().map(|(lsn, _)| *lsn).unwrap_or(0);
                    let mut state = self.state.lock();
                    state.durable_lsn = state.durable_lsn.max(last);
                    drop(state);
                    self.durable_cv.notify_all();
                }
                Err(err) => {
                    // Keep the batch; waiters stay blocked on durable_lsn
                    // until a later round fsyncs it.
                    warn!(error = %err, "wal batch write failed");
                    let mut state = self.state.lock();
                    let mut restored = batch;
                    restored.extend(std::mem::take(&mut state.pending));
                    state.pending = restored;
                    drop(state);
                    std::thread::sleep(WRITER_POLL);
                }
            }
        }
    }

    fn write_batch(&self, out: &mut WalOutput, batch: &[(u64, Vec<u8>)]) -> Result<()> {
        if out.file.is_none() || out.bytes >= self.file_max_bytes {
            let first_lsn = batch.first().map(|(lsn, _)| *lsn).unwrap_or(0);
            let path = self.dir.join(format!("{first_lsn:020}.log"));
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            debug!(path = %path.display(), "rotated wal file");
            out.file = Some(file);
            out.bytes = 0;
        }
        let file = out.file.as_mut().expect("wal file just opened");
        for (_, framed) in batch {
            file.write_all(framed)?;
            out.bytes += framed.len() as u64;
        }
        file.flush()?;
        file.sync_data()?;
        Ok(())
    }

    /// Replay every decodable record in LSN order. A malformed tail is
    /// truncated in place; everything before it is delivered.
    pub fn replay(&self, mut apply: impl FnMut(&WalRecord) -> Result<()>) -> Result<u64> {
        if !self.enabled {
            return Ok(0);
        }
        let mut max_lsn = 0u64;
        let mut applied = 0usize;
        for path in wal_files(&self.dir)? {
            let buf = read_file(&path)?;
            let mut offset = 0usize;
            while let Some((record, next)) = decode_record(&buf, offset) {
                max_lsn = max_lsn.max(record.lsn);
                apply(&record)?;
                applied += 1;
                offset = next;
            }
            if offset < buf.len() {
                warn!(
                    path = %path.display(),
                    at = offset,
                    "truncating malformed wal tail"
                );
                let file = OpenOptions::new().write(true).open(&path)?;
                file.set_len(offset as u64)?;
                file.sync_data()?;
            }
        }
        if applied > 0 {
            debug!(applied, max_lsn, "replayed wal records");
        }
        Ok(max_lsn)
    }

    /// Remove whole log files that only contain records at or below `lsn`.
    /// A file is reclaimable when the next file starts at or below `lsn + 1`.
    pub fn purge(&self, lsn: u64) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let files = wal_files(&self.dir)?;
        let mut removed = 0usize;
        for pair in files.windows(2) {
            let next_start = file_start_lsn(&pair[1]).unwrap_or(u64::MAX);
            if next_start <= lsn + 1 {
                std::fs::remove_file(&pair[0])?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, lsn, "purged wal files");
        }
        Ok(())
    }

    #[cfg(test)]
    fn durable_lsn(&self) -> u64 {
        self.state.lock().durable_lsn
    }
}

fn wal_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.extension().map(|ext| ext == "log").unwrap_or(false))
        .collect();
    files.sort();
    Ok(files)
}

fn file_start_lsn(path: &Path) -> Option<u64> {
    path.file_stem()?.to_str()?.parse().ok()
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    File::open(path)?.read_to_end(&mut buf)?;
    Ok(buf)
}
