use crate::kernel;
use crate::meta::{EngineType, MetricType};
use crate::status::{Error, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

const DEFAULT_NLIST: usize = 64;
const KMEANS_ITERS: usize = 10;
const KMEANS_TRAINING_SAMPLE: usize = 100_000;

/// Builds a serialized ANN structure over one segment's rows. The returned
/// bytes are opaque to the catalog and segment layers.
pub trait IndexBuilder: Send + Sync {
    fn engine_type(&self) -> EngineType;
    fn build(
        &self,
        dim: usize,
        metric: MetricType,
        ids: &[u64],
        vectors: &[f32],
        params: &serde_json::Value,
    ) -> Result<Vec<u8>>;
}

/// Scalar quantizer seam: trains per-dimension decode tables and encodes
/// vectors against them.
pub trait Quantizer: Send + Sync {
    fn train(&self, dim: usize, vectors: &[f32]) -> SqTrained;
    fn encode(&self, trained: &SqTrained, vector: &[f32]) -> Vec<u8>;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SqTrained {
    pub vmin: Vec<f32>,
    pub vdiff: Vec<f32>,
}

impl SqTrained {
    pub fn decode_into(&self, code: &[u8], out: &mut [f32]) {
        for (d, &byte) in code.iter().enumerate() {
            out[d] = self.vmin[d] + (byte as f32 / 255.0) * self.vdiff[d];
        }
    }
}

pub struct ScalarQuantizer;

impl Quantizer for ScalarQuantizer {
    fn train(&self, dim: usize, vectors: &[f32]) -> SqTrained {
        let mut vmin = vec![f32::MAX; dim];
        let mut vmax = vec![f32::MIN; dim];
        for row in vectors.chunks_exact(dim) {
            for (d, &v) in row.iter().enumerate() {
                vmin[d] = vmin[d].min(v);
                vmax[d] = vmax[d].max(v);
            }
        }
        if vectors.is_empty() {
            vmin.fill(0.0);
            vmax.fill(0.0);
        }
        let vdiff = vmin
            .iter()
            .zip(vmax.iter())
            .map(|(lo, hi)| hi - lo)
            .collect();
        SqTrained { vmin, vdiff }
    }

    fn encode(&self, trained: &SqTrained, vector: &[f32]) -> Vec<u8> {
        vector
            .iter()
            .enumerate()
            .map(|(d, &v)| {
                let diff = trained.vdiff[d];
                if diff <= f32::EPSILON {
                    return 0u8;
                }
                (((v - trained.vmin[d]) / diff * 255.0).round()).clamp(0.0, 255.0) as u8
            })
            .collect()
    }
}

#[derive(Serialize, Deserialize)]
enum IndexBlob {
    Flat {
        ids: Vec<u64>,
        vectors: Vec<f32>,
    },
    IvfFlat {
        centroids: Vec<f32>,
        lists: Vec<Vec<u32>>,
        ids: Vec<u64>,
        vectors: Vec<f32>,
    },
    IvfSq8 {
        centroids: Vec<f32>,
        lists: Vec<Vec<u32>>,
        ids: Vec<u64>,
        codes: Vec<u8>,
        trained: SqTrained,
    },
}

/// A deserialized index ready to answer top-K probes for one segment file.
pub struct AnnIndex {
    dim: usize,
    metric: MetricType,
    blob: IndexBlob,
}

pub fn builder_for(engine: EngineType) -> Box<dyn IndexBuilder> {
    match engine {
        EngineType::Flat => Box::new(FlatBuilder),
        EngineType::IvfFlat => Box::new(IvfFlatBuilder),
        EngineType::IvfSq8 => Box::new(IvfSq8Builder),
    }
}

pub fn load_index(dim: usize, metric: MetricType, bytes: &[u8]) -> Result<AnnIndex> {
    let blob: IndexBlob = bincode::deserialize(bytes)
        .map_err(|err| Error::CorruptFile(format!("index blob decode: {err}")))?;
    Ok(AnnIndex { dim, metric, blob })
}

impl AnnIndex {
    pub fn row_count(&self) -> usize {
        match &self.blob {
            IndexBlob::Flat { ids, .. }
            | IndexBlob::IvfFlat { ids, .. }
            | IndexBlob::IvfSq8 { ids, .. } => ids.len(),
        }
    }

    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        nprobe: usize,
        blacklist: Option<&HashSet<u64>>,
    ) -> Vec<(u64, f32)> {
        let kern = kernel::select_kernel(self.metric, self.dim);
        let mut scored = match &self.blob {
            IndexBlob::Flat { ids, vectors } => {
                score_rows(kern, query, self.dim, ids, vectors, blacklist)
            }
            IndexBlob::IvfFlat {
                centroids,
                lists,
                ids,
                vectors,
            } => {
                let probes = self.probe_lists(query, centroids, lists.len(), nprobe);
                let mut scored = Vec::new();
                for list in probes {
                    for &row in &lists[list] {
                        let row = row as usize;
                        let id = ids[row];
                        if blacklisted(blacklist, id) {
                            continue;
                        }
                        let vec = &vectors[row * self.dim..(row + 1) * self.dim];
                        scored.push((id, kern(query, vec)));
                    }
                }
                scored
            }
            IndexBlob::IvfSq8 {
                centroids,
                lists,
                ids,
                codes,
                trained,
            } => {
                let probes = self.probe_lists(query, centroids, lists.len(), nprobe);
                let mut decoded = vec![0.0f32; self.dim];
                let mut scored = Vec::new();
                for list in probes {
                    for &row in &lists[list] {
                        let row = row as usize;
                        let id = ids[row];
                        if blacklisted(blacklist, id) {
                            continue;
                        }
                        let code = &codes[row * self.dim..(row + 1) * self.dim];
                        trained.decode_into(code, &mut decoded);
                        scored.push((id, kern(query, &decoded)));
                    }
                }
                scored
            }
        };
        sort_by_metric(self.metric, &mut scored);
        scored.truncate(k);
        scored
    }

    fn probe_lists(
        &self,
        query: &[f32],
        centroids: &[f32],
        nlist: usize,
        nprobe: usize,
    ) -> Vec<usize> {
        // Coarse quantizer assignment is always L2, independent of the
        // search metric.
        let kern = kernel::select_kernel(MetricType::L2, self.dim);
        let mut scored: Vec<(usize, f32)> = centroids
            .chunks_exact(self.dim)
            .enumerate()
            .map(|(list, centroid)| (list, kern(query, centroid)))
            .collect();
        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        scored
            .into_iter()
            .take(nprobe.clamp(1, nlist.max(1)))
            .map(|(list, _)| list)
            .collect()
    }
}

fn blacklisted(blacklist: Option<&HashSet<u64>>, id: u64) -> bool {
    blacklist.map(|set| set.contains(&id)).unwrap_or(false)
}

fn score_rows(
    kern: kernel::Kernel,
    query: &[f32],
    dim: usize,
    ids: &[u64],
    vectors: &[f32],
    blacklist: Option<&HashSet<u64>>,
) -> Vec<(u64, f32)> {
    ids.iter()
        .zip(vectors.chunks_exact(dim))
        .filter(|(id, _)| !blacklisted(blacklist, **id))
        .map(|(id, row)| (*id, kern(query, row)))
        .collect()
}

/// Sort by distance in the metric's preference order (ascending L2,
/// descending inner product), ties broken by lower id.
pub fn sort_by_metric(metric: MetricType, scored: &mut [(u64, f32)]) {
    scored.sort_by(|a, b| {
        let ord = match metric {
            MetricType::L2 => a.1.partial_cmp(&b.1),
            MetricType::Ip => b.1.partial_cmp(&a.1),
        };
        ord.unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
}

struct FlatBuilder;

impl IndexBuilder for FlatBuilder {
    fn engine_type(&self) -> EngineType {
        EngineType::Flat
    }

    fn build(
        &self,
        dim: usize,
        _metric: MetricType,
        ids: &[u64],
        vectors: &[f32],
        _params: &serde_json::Value,
    ) -> Result<Vec<u8>> {
        check_shape(dim, ids, vectors)?;
        let blob = IndexBlob::Flat {
            ids: ids.to_vec(),
            vectors: vectors.to_vec(),
        };
        encode(&blob)
    }
}

struct IvfFlatBuilder;

impl IndexBuilder for IvfFlatBuilder {
    fn engine_type(&self) -> EngineType {
        EngineType::IvfFlat
    }

    fn build(
        &self,
        dim: usize,
        _metric: MetricType,
        ids: &[u64],
        vectors: &[f32],
        params: &serde_json::Value,
    ) -> Result<Vec<u8>> {
        check_shape(dim, ids, vectors)?;
        let nlist = nlist_from(params, ids.len());
        let centroids = train_centroids(dim, vectors, nlist);
        let lists = assign_lists(dim, vectors, &centroids);
        let blob = IndexBlob::IvfFlat {
            centroids,
            lists,
            ids: ids.to_vec(),
            vectors: vectors.to_vec(),
        };
        encode(&blob)
    }
}

struct IvfSq8Builder;

impl IndexBuilder for IvfSq8Builder {
    fn engine_type(&self) -> EngineType {
        EngineType::IvfSq8
    }

    fn build(
        &self,
        dim: usize,
        _metric: MetricType,
        ids: &[u64],
        vectors: &[f32],
        params: &serde_json::Value,
    ) -> Result<Vec<u8>> {
        check_shape(dim, ids, vectors)?;
        let nlist = nlist_from(params, ids.len());
        let centroids = train_centroids(dim, vectors, nlist);
        let lists = assign_lists(dim, vectors, &centroids);
        let quantizer = ScalarQuantizer;
        let trained = quantizer.train(dim, vectors);
        let mut codes = Vec::with_capacity(vectors.len());
        for row in vectors.chunks_exact(dim) {
            codes.extend_from_slice(&quantizer.encode(&trained, row));
        }
        let blob = IndexBlob::IvfSq8 {
            centroids,
            lists,
            ids: ids.to_vec(),
            codes,
            trained,
        };
        encode(&blob)
    }
}

fn check_shape(dim: usize, ids: &[u64], vectors: &[f32]) -> Result<()> {
    if dim == 0 || vectors.len() != ids.len() * dim {
        return Err(Error::invalid(format!(
            "index input shape mismatch: {} values for {} rows of dim {dim}",
            vectors.len(),
            ids.len()
        )));
    }
    Ok(())
}

fn encode(blob: &IndexBlob) -> Result<Vec<u8>> {
    bincode::serialize(blob).map_err(|err| Error::DbError(format!("index blob encode: {err}")))
}

fn nlist_from(params: &serde_json::Value, rows: usize) -> usize {
    let requested = params
        .get("nlist")
        .and_then(|v| v.as_u64())
        .map(|v| v as usize)
        .unwrap_or(DEFAULT_NLIST);
    requested.clamp(1, rows.max(1))
}

/// Plain Lloyd iterations over an L2 objective, seeded deterministically so
/// rebuilding the same segment yields the same index.
fn train_centroids(dim: usize, vectors: &[f32], nlist: usize) -> Vec<f32> {
    let rows: Vec<&[f32]> = vectors.chunks_exact(dim).collect();
    if rows.is_empty() {
        return Vec::new();
    }
    let mut rng = StdRng::seed_from_u64(rows.len() as u64 ^ 0x5EED);
    let mut sample: Vec<&[f32]> = rows.clone();
    if sample.len() > KMEANS_TRAINING_SAMPLE {
        sample.shuffle(&mut rng);
        sample.truncate(KMEANS_TRAINING_SAMPLE);
    }
    let k = nlist.min(sample.len());
    let mut seeds = sample.clone();
    seeds.shuffle(&mut rng);
    let mut centroids: Vec<f32> = seeds
        .into_iter()
        .take(k)
        .flat_map(|row| row.iter().copied())
        .collect();

    let kern = kernel::select_kernel(MetricType::L2, dim);
    for _ in 0..KMEANS_ITERS {
        let mut sums = vec![0.0f64; k * dim];
        let mut counts = vec![0u64; k];
        for row in &sample {
            let best = nearest_centroid(kern, row, &centroids, dim);
            counts[best] += 1;
            for (d, &v) in row.iter().enumerate() {
                sums[best * dim + d] += v as f64;
            }
        }
        for list in 0..k {
            if counts[list] == 0 {
                continue;
            }
            let inv = 1.0 / counts[list] as f64;
            for d in 0..dim {
                centroids[list * dim + d] = (sums[list * dim + d] * inv) as f32;
            }
        }
    }
    centroids
}

fn assign_lists(dim: usize, vectors: &[f32], centroids: &[f32]) -> Vec<Vec<u32>> {
    let k = centroids.len() / dim.max(1);
    let mut lists = vec![Vec::new(); k.max(1)];
    if k == 0 {
        return lists;
    }
    let kern = kernel::select_kernel(MetricType::L2, dim);
    for (row, vec) in vectors.chunks_exact(dim).enumerate() {
        let best = nearest_centroid(kern, vec, centroids, dim);
        lists[best].push(row as u32);
    }
    lists
}

fn nearest_centroid(kern: kernel::Kernel, row: &[f32], centroids: &[f32], dim: usize) -> usize {
    let mut best = 0usize;
    let mut best_dist = f32::MAX;
    for (list, centroid) in centroids.chunks_exact(dim).enumerate() {
        let dist = kern(row, centroid);
        if dist < best_dist {
            best_dist = dist;
            best = list;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn dataset(dim: usize, rows: usize, seed: u64) -> (Vec<u64>, Vec<f32>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let ids: Vec<u64> = (0..rows as u64).map(|i| i + 1).collect();
        let vectors: Vec<f32> = (0..rows * dim).map(|_| rng.gen::<f32>()).collect();
        (ids, vectors)
    }

    #[test]
    fn flat_index_finds_exact_neighbour() {
        let dim = 8;
        let (ids, vectors) = dataset(dim, 200, 3);
        let builder = builder_for(EngineType::Flat);
        let blob = builder
            .build(dim, MetricType::L2, &ids, &vectors, &serde_json::json!({}))
            .unwrap();
        let index = load_index(dim, MetricType::L2, &blob).unwrap();
        let query = &vectors[50 * dim..51 * dim];
        let hits = index.search(query, 3, 1, None);
        assert_eq!(hits[0].0, ids[50]);
        assert!(hits[0].1.abs() < 1e-6);
    }

    #[test]
    fn ivf_flat_with_full_probe_matches_flat() {
        let dim = 16;
        let (ids, vectors) = dataset(dim, 500, 11);
        let params = serde_json::json!({ "nlist": 8 });
        let flat = builder_for(EngineType::Flat)
            .build(dim, MetricType::L2, &ids, &vectors, &params)
            .unwrap();
        let ivf = builder_for(EngineType::IvfFlat)
            .build(dim, MetricType::L2, &ids, &vectors, &params)
            .unwrap();
        let flat = load_index(dim, MetricType::L2, &flat).unwrap();
        let ivf = load_index(dim, MetricType::L2, &ivf).unwrap();
        let query = &vectors[123 * dim..124 * dim];
        // Probing every list makes IVF exhaustive.
        let a = flat.search(query, 10, 1, None);
        let b = ivf.search(query, 10, 8, None);
        assert_eq!(
            a.iter().map(|h| h.0).collect::<Vec<_>>(),
            b.iter().map(|h| h.0).collect::<Vec<_>>()
        );
    }

    #[test]
    fn blacklisted_ids_never_surface() {
        let dim = 8;
        let (ids, vectors) = dataset(dim, 100, 7);
        let blob = builder_for(EngineType::Flat)
            .build(dim, MetricType::L2, &ids, &vectors, &serde_json::json!({}))
            .unwrap();
        let index = load_index(dim, MetricType::L2, &blob).unwrap();
        let query = &vectors[10 * dim..11 * dim];
        let blacklist: HashSet<u64> = [ids[10]].into_iter().collect();
        let hits = index.search(query, 5, 1, Some(&blacklist));
        assert!(hits.iter().all(|h| h.0 != ids[10]));
    }

    #[test]
    fn sq8_recovers_coarse_neighbours() {
        let dim = 8;
        let (ids, vectors) = dataset(dim, 400, 19);
        let params = serde_json::json!({ "nlist": 4 });
        let blob = builder_for(EngineType::IvfSq8)
            .build(dim, MetricType::L2, &ids, &vectors, &params)
            .unwrap();
        let index = load_index(dim, MetricType::L2, &blob).unwrap();
        let query: Vec<f32> = vectors[40 * dim..41 * dim].to_vec();
        let hits = index.search(&query, 10, 4, None);
        assert!(hits.iter().any(|h| h.0 == ids[40]));
    }

    #[test]
    fn ip_ordering_is_descending() {
        let dim = 4;
        let ids = vec![1u64, 2, 3];
        let vectors = vec![
            1.0, 0.0, 0.0, 0.0, //
            2.0, 0.0, 0.0, 0.0, //
            3.0, 0.0, 0.0, 0.0,
        ];
        let blob = builder_for(EngineType::Flat)
            .build(dim, MetricType::Ip, &ids, &vectors, &serde_json::json!({}))
            .unwrap();
        let index = load_index(dim, MetricType::Ip, &blob).unwrap();
        let hits = index.search(&[1.0, 0.0, 0.0, 0.0], 3, 1, None);
        assert_eq!(hits.iter().map(|h| h.0).collect::<Vec<_>>(), vec![3, 2, 1]);
    }

    #[test]
    fn scalar_quantizer_round_trips_within_step() {
        let dim = 8;
        let (_, vectors) = dataset(dim, 50, 23);
        let q = ScalarQuantizer;
        let trained = q.train(dim, &vectors);
        let row = &vectors[0..dim];
        let code = q.encode(&trained, row);
        let mut decoded = vec![0.0f32; dim];
        trained.decode_into(&code, &mut decoded);
        for d in 0..dim {
            let step = trained.vdiff[d] / 255.0;
            assert!((decoded[d] - row[d]).abs() <= step.max(1e-6));
        }
    }
}
