use crate::meta::{EngineType, MetricType};
use crate::status::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

const SEGMENT_MAGIC: u32 = 0x5354_5647; // "STVG"
const INDEX_MAGIC: u32 = 0x5354_4958; // "STIX"
const FORMAT_VERSION: u16 = 1;
const SEGMENT_HEADER_BYTES: usize = 36;
const INDEX_HEADER_BYTES: usize = 20;

/// In-memory image of a `.vec` payload: `row_count * dim` little-endian
/// f32 values followed by `row_count` u64 ids.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SegmentData {
    pub dim: u16,
    pub metric: MetricType,
    pub engine_type: EngineType,
    pub flush_lsn: u64,
    pub ids: Vec<u64>,
    pub vectors: Vec<f32>,
}

impl SegmentData {
    pub fn new(dim: u16, metric: MetricType, engine_type: EngineType) -> Self {
        Self {
            dim,
            metric,
            engine_type,
            flush_lsn: 0,
            ids: Vec::new(),
            vectors: Vec::new(),
        }
    }

    pub fn row_count(&self) -> u64 {
        self.ids.len() as u64
    }

    pub fn vector(&self, row: usize) -> &[f32] {
        let dim = self.dim as usize;
        &self.vectors[row * dim..(row + 1) * dim]
    }

    pub fn push(&mut self, id: u64, vector: &[f32]) {
        debug_assert_eq!(vector.len(), self.dim as usize);
        self.ids.push(id);
        self.vectors.extend_from_slice(vector);
    }
}

pub fn write_segment(path: &Path, data: &SegmentData) -> Result<u64> {
    let dim = data.dim as usize;
    if data.vectors.len() != data.ids.len() * dim {
        return Err(Error::invalid(format!(
            "segment payload shape mismatch: {} values for {} rows of dim {dim}",
            data.vectors.len(),
            data.ids.len()
        )));
    }

    let mut payload = Vec::with_capacity(data.vectors.len() * 4 + data.ids.len() * 8);
    for value in &data.vectors {
        payload.extend_from_slice(&value.to_le_bytes());
    }
    for id in &data.ids {
        payload.extend_from_slice(&id.to_le_bytes());
    }
    let crc = crc32fast::hash(&payload);

    let mut out = Vec::with_capacity(SEGMENT_HEADER_BYTES + payload.len());
    out.extend_from_slice(&SEGMENT_MAGIC.to_le_bytes());
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.push(data.metric as u8);
    out.push(0u8);
    out.extend_from_slice(&(data.dim as u32).to_le_bytes());
    out.extend_from_slice(&data.row_count().to_le_bytes());
    out.extend_from_slice(&(data.engine_type as i32).to_le_bytes());
    out.extend_from_slice(&data.flush_lsn.to_le_bytes());
    out.extend_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(&payload);

    atomic_write(path, &out)?;
    Ok(out.len() as u64)
}

pub fn read_segment(path: &Path) -> Result<SegmentData> {
    let mut file = File::open(path)?;
    let mut header = [0u8; SEGMENT_HEADER_BYTES];
    file.read_exact(&mut header)
        .map_err(|_| corrupt(path, "truncated header"))?;

    if u32::from_le_bytes(header[0..4].try_into().unwrap()) != SEGMENT_MAGIC {
        return Err(corrupt(path, "bad magic"));
    }
    if u16::from_le_bytes(header[4..6].try_into().unwrap()) != FORMAT_VERSION {
        return Err(corrupt(path, "unsupported version"));
    }
    let metric = MetricType::from_i64(header[6] as i64).map_err(|_| corrupt(path, "bad metric"))?;
    let dim = u32::from_le_bytes(header[8..12].try_into().unwrap()) as usize;
    let row_count = u64::from_le_bytes(header[12..20].try_into().unwrap()) as usize;
    let engine = i32::from_le_bytes(header[20..24].try_into().unwrap());
    let engine_type =
        EngineType::from_i64(engine as i64).map_err(|_| corrupt(path, "bad engine type"))?;
    let flush_lsn = u64::from_le_bytes(header[24..32].try_into().unwrap());
    let expected_crc = u32::from_le_bytes(header[32..36].try_into().unwrap());

    let mut payload = Vec::new();
    file.read_to_end(&mut payload)?;
    if payload.len() != row_count * dim * 4 + row_count * 8 {
        return Err(corrupt(path, "payload length mismatch"));
    }
    if crc32fast::hash(&payload) != expected_crc {
        return Err(corrupt(path, "payload checksum mismatch"));
    }

    let mut vectors = Vec::with_capacity(row_count * dim);
    let (vec_bytes, id_bytes) = payload.split_at(row_count * dim * 4);
    for chunk in vec_bytes.chunks_exact(4) {
        vectors.push(f32::from_le_bytes(chunk.try_into().unwrap()));
    }
    let mut ids = Vec::with_capacity(row_count);
    for chunk in id_bytes.chunks_exact(8) {
        ids.push(u64::from_le_bytes(chunk.try_into().unwrap()));
    }

    Ok(SegmentData {
        dim: dim as u16,
        metric,
        engine_type,
        flush_lsn,
        ids,
        vectors,
    })
}

/// The index payload is opaque to this layer; only framing and checksum are
/// enforced here.
pub fn write_index_blob(path: &Path, blob: &[u8]) -> Result<u64> {
    let mut out = Vec::with_capacity(INDEX_HEADER_BYTES + blob.len());
    out.extend_from_slice(&INDEX_MAGIC.to_le_bytes());
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&(blob.len() as u64).to_le_bytes());
    out.extend_from_slice(&crc32fast::hash(blob).to_le_bytes());
    out.extend_from_slice(blob);
    atomic_write(path, &out)?;
    Ok(out.len() as u64)
}

pub fn read_index_blob(path: &Path) -> Result<Vec<u8>> {
    let mut file = File::open(path)?;
    let mut header = [0u8; INDEX_HEADER_BYTES];
    file.read_exact(&mut header)
        .map_err(|_| corrupt(path, "truncated index header"))?;
    if u32::from_le_bytes(header[0..4].try_into().unwrap()) != INDEX_MAGIC {
        return Err(corrupt(path, "bad index magic"));
    }
    let len = u64::from_le_bytes(header[8..16].try_into().unwrap()) as usize;
    let expected_crc = u32::from_le_bytes(header[16..20].try_into().unwrap());
    let mut blob = Vec::new();
    file.read_to_end(&mut blob)?;
    if blob.len() != len || crc32fast::hash(&blob) != expected_crc {
        return Err(corrupt(path, "index blob checksum mismatch"));
    }
    Ok(blob)
}

/// Write-through-temp discipline: write a `.tmp` sibling, fsync it, rename
/// over the final name, fsync the directory.
fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::invalid(format!("no parent directory for {}", path.display())))?;
    std::fs::create_dir_all(parent)?;
    let tmp = path.with_extension("tmp");
    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(bytes)?;
        file.flush()?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    fsync_dir(parent)?;
    Ok(())
}

#[cfg(unix)]
fn fsync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn fsync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

fn corrupt(path: &Path, what: &str) -> Error {
    Error::CorruptFile(format!("{}: {what}", path.display()))
}
