use crate::index;
use crate::kernel;
use crate::memtable::MemManager;
use crate::meta::{FileSchema, FileType, MetricType, SqliteMeta};
use crate::ongoing::OngoingFiles;
use crate::segment;
use crate::status::{Error, Result};
use rayon::prelude::*;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use tracing::warn;

/// One query's answer: `(id, distance)` pairs sorted ascending for L2 and
/// descending for inner product, ties broken by lower id.
pub type TopK = Vec<(u64, f32)>;

pub struct QueryExecutor {
    meta: Arc<SqliteMeta>,
    mem: Arc<MemManager>,
    ongoing: Arc<OngoingFiles>,
}

impl QueryExecutor {
    pub fn new(meta: Arc<SqliteMeta>, mem: Arc<MemManager>, ongoing: Arc<OngoingFiles>) -> Self {
        Self { meta, mem, ongoing }
    }

    /// Top-K over the table plus the selected partitions (all of them when
    /// `partition_tags` is empty).
    pub fn query(
        &self,
        table_id: &str,
        partition_tags: &[String],
        k: usize,
        nprobe: usize,
        queries: &[Vec<f32>],
    ) -> Result<Vec<TopK>> {
        let table = self.meta.describe_table(table_id)?;
        validate_queries(queries, table.dimension)?;
        let targets = self.resolve_targets(table_id, partition_tags)?;

        let mut files = Vec::new();
        for target in &targets {
            files.extend(self.meta.files_to_search(target, &[])?);
        }
        self.search_files(table.metric_type, files, &targets, k, nprobe, queries)
    }

    /// Restrict the search to an explicit working set of file ids.
    pub fn query_by_file_id(
        &self,
        table_id: &str,
        file_ids: &[i64],
        k: usize,
        nprobe: usize,
        queries: &[Vec<f32>],
    ) -> Result<Vec<TopK>> {
        let table = self.meta.describe_table(table_id)?;
        validate_queries(queries, table.dimension)?;
        let files = self.meta.files_to_search(table_id, file_ids)?;
        if files.len() != file_ids.len() {
            return Err(Error::not_found(format!(
                "some of the requested files of table {table_id} are not serving"
            )));
        }
        let targets = vec![table_id.to_string()];
        self.search_files(table.metric_type, files, &targets, k, nprobe, queries)
    }

    fn search_files(
        &self,
        metric: MetricType,
        files: Vec<FileSchema>,
        target_tables: &[String],
        k: usize,
        nprobe: usize,
        queries: &[Vec<f32>],
    ) -> Result<Vec<TopK>> {
        if k == 0 || queries.is_empty() {
            return Ok(vec![Vec::new(); queries.len()]);
        }

        // Hold every file in the ongoing set for the duration of the search;
        // the guard releases on all exit paths, error included.
        let _guard = self.ongoing.guard(files.iter().map(|f| f.id));
        debug_assert!(files.iter().all(|f| f.file_type.is_searchable()));

        let blacklists: HashMap<String, HashSet<u64>> = target_tables
            .iter()
            .map(|t| (t.clone(), self.mem.blacklist(t)))
            .collect();

        let mut per_file: Vec<Vec<TopK>> = files
            .par_iter()
            .map(|file| {
                let blacklist = blacklists.get(&file.table_id);
                self.search_one_file(file, metric, k, nprobe, queries, blacklist)
            })
            .collect::<Result<_>>()?;

        // The in-memory buffers participate like one more file per table.
        for target in target_tables {
            let buffered: Vec<TopK> = queries
                .iter()
                .map(|query| {
                    let mut hits = self.mem.search(target, metric, query, k);
                    if let Some(blacklist) = blacklists.get(target) {
                        hits.retain(|(id, _)| !blacklist.contains(id));
                    }
                    hits
                })
                .collect();
            per_file.push(buffered);
        }

        let mut out = Vec::with_capacity(queries.len());
        for query_idx in 0..queries.len() {
            let lists: Vec<TopK> = per_file
                .iter_mut()
                .map(|file_results| std::mem::take(&mut file_results[query_idx]))
                .collect();
            out.push(merge_topk(metric, k, lists));
        }
        Ok(out)
    }

    fn search_one_file(
        &self,
        file: &FileSchema,
        metric: MetricType,
        k: usize,
        nprobe: usize,
        queries: &[Vec<f32>],
        blacklist: Option<&HashSet<u64>>,
    ) -> Result<Vec<TopK>> {
        let result = if file.file_type == FileType::Index {
            self.search_index_file(file, k, nprobe, queries, blacklist)
        } else {
            self.search_raw_file(file, metric, k, queries, blacklist)
        };
        match result {
            Err(err @ Error::CorruptFile(_)) => {
                // Quarantine so the collector reclaims it; the caller sees
                // the corruption.
                warn!(file_id = %file.file_id, error = %err, "quarantining corrupt file");
                let mut dead = file.clone();
                dead.file_type = FileType::ToDelete;
                if let Err(meta_err) = self.meta.update_file(&mut dead) {
                    warn!(error = %meta_err, "failed to quarantine corrupt file");
                }
                Err(err)
            }
            other => other,
        }
    }

    fn search_raw_file(
        &self,
        file: &FileSchema,
        metric: MetricType,
        k: usize,
        queries: &[Vec<f32>],
        blacklist: Option<&HashSet<u64>>,
    ) -> Result<Vec<TopK>> {
        let data = segment::read_segment(&file.location)?;
        let dim = data.dim as usize;
        let kern = kernel::select_kernel(metric, dim);
        let out = queries
            .iter()
            .map(|query| {
                let mut scored: TopK = data
                    .ids
                    .iter()
                    .zip(data.vectors.chunks_exact(dim))
                    .filter(|(id, _)| !blacklist.map(|b| b.contains(*id)).unwrap_or(false))
                    .map(|(&id, row)| (id, kern(query, row)))
                    .collect();
                index::sort_by_metric(metric, &mut scored);
                scored.truncate(k);
                scored
            })
            .collect();
        Ok(out)
    }

    fn search_index_file(
        &self,
        file: &FileSchema,
        k: usize,
        nprobe: usize,
        queries: &[Vec<f32>],
        blacklist: Option<&HashSet<u64>>,
    ) -> Result<Vec<TopK>> {
        let blob = segment::read_index_blob(&crate::meta::index_location(&file.location))?;
        let ann = index::load_index(file.dimension as usize, file.metric_type, &blob)?;
        Ok(queries
            .iter()
            .map(|query| ann.search(query, k, nprobe, blacklist))
            .collect())
    }

    /// The table itself plus its matching partitions. Unknown tags are an
    /// error; an empty tag list selects every partition.
    fn resolve_targets(&self, table_id: &str, partition_tags: &[String]) -> Result<Vec<String>> {
        let mut targets = vec![table_id.trim().to_string()];
        if partition_tags.is_empty() {
            for partition in self.meta.show_partitions(table_id)? {
                targets.push(partition.table_id);
            }
        } else {
            for tag in partition_tags {
                let name = self.meta.get_partition_name(table_id, tag)?;
                if !targets.contains(&name) {
                    targets.push(name);
                }
            }
        }
        Ok(targets)
    }
}

fn validate_queries(queries: &[Vec<f32>], dim: u16) -> Result<()> {
    for query in queries {
        if query.len() != dim as usize {
            return Err(Error::invalid(format!(
                "query vector has dimension {}, table expects {dim}",
                query.len()
            )));
        }
    }
    Ok(())
}

#[derive(PartialEq)]
struct Head {
    key: f32,
    id: u64,
    list: usize,
    pos: usize,
}

impl Eq for Head {}

impl PartialOrd for Head {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Head {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key
            .total_cmp(&other.key)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// N-way merge of per-file top-K lists via a priority queue of list heads.
/// Each input list is already ordered by its metric.
pub fn merge_topk(metric: MetricType, k: usize, lists: Vec<TopK>) -> TopK {
    let key_of = |dist: f32| match metric {
        MetricType::L2 => dist,
        MetricType::Ip => -dist,
    };
    let mut heap: BinaryHeap<Reverse<Head>> = BinaryHeap::with_capacity(lists.len());
    for (list_idx, list) in lists.iter().enumerate() {
        if let Some(&(id, dist)) = list.first() {
            heap.push(Reverse(Head {
                key: key_of(dist),
                id,
                list: list_idx,
                pos: 0,
            }));
        }
    }

    let mut out: TopK = Vec::with_capacity(k);
    let mut seen: HashSet<u64> = HashSet::new();
    while out.len() < k {
        let Some(Reverse(head)) = heap.pop() else {
            break;
        };
        let (id, dist) = lists[head.list][head.pos];
        // The same id can surface from several files (backup + index); the
        // best-ranked occurrence wins.
        if seen.insert(id) {
            out.push((id, dist));
        }
        if head.pos + 1 < lists[head.list].len() {
            let (next_id, next_dist) = lists[head.list][head.pos + 1];
            heap.push(Reverse(Head {
                key: key_of(next_dist),
                id: next_id,
                list: head.list,
                pos: head.pos + 1,
            }));
        }
    }
    out
}
