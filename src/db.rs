use crate::config::Config;
use crate::ids::SafeIdGenerator;
use crate::index;
use crate::memtable::MemManager;
use crate::meta::{
    ArchiveConf, EngineType, FileSchema, FileType, SqliteMeta, TableSchema,
};
use crate::ongoing::OngoingFiles;
use crate::query::{QueryExecutor, TopK};
use crate::scheduler::{
    worker_pool, BuildGuard, IndexFailedChecker, MergeQueue, TableLocks, WaitNotify,
};
use crate::segment::{self, SegmentData};
use crate::status::{Error, Result};
use crate::wal::{WalManager, WalOp, WalRecord};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const MERGE_BARRIER_TIMEOUT: Duration = Duration::from_secs(60);
const INDEX_BUILD_TIMEOUT: Duration = Duration::from_secs(300);
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-segment statistics for [`TableInfo`].
#[derive(Clone, Debug)]
pub struct SegmentStat {
    pub segment_id: String,
    pub row_count: u64,
    pub data_size: u64,
    pub engine_type: EngineType,
}

#[derive(Clone, Debug)]
pub struct PartitionStat {
    pub tag: String,
    pub table_id: String,
    pub row_count: u64,
    pub segments: Vec<SegmentStat>,
}

#[derive(Clone, Debug)]
pub struct TableInfo {
    pub total_row_count: u64,
    pub partitions: Vec<PartitionStat>,
}

/// The engine's control surface. [`DbImpl`] is the sole production
/// implementation; callers resolve the trait object once at startup and
/// keep it for the process lifetime.
pub trait Db: Send + Sync {
    fn start(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
    fn drop_all(&self) -> Result<()>;

    fn create_table(&self, schema: TableSchema) -> Result<TableSchema>;
    fn drop_table(&self, table_id: &str) -> Result<()>;
    fn describe_table(&self, table_id: &str) -> Result<TableSchema>;
    fn has_table(&self, table_id: &str) -> Result<bool>;
    fn all_tables(&self) -> Result<Vec<TableSchema>>;
    fn get_table_row_count(&self, table_id: &str) -> Result<u64>;
    fn get_table_info(&self, table_id: &str) -> Result<TableInfo>;
    fn preload_table(&self, table_id: &str) -> Result<()>;

    fn create_partition(&self, table_id: &str, name: Option<&str>, tag: &str) -> Result<()>;
    fn drop_partition(&self, partition_name: &str) -> Result<()>;
    fn drop_partition_by_tag(&self, table_id: &str, tag: &str) -> Result<()>;
    fn show_partitions(&self, table_id: &str) -> Result<Vec<TableSchema>>;

    fn insert_vectors(
        &self,
        table_id: &str,
        partition_tag: &str,
        ids: Vec<u64>,
        vectors: Vec<f32>,
    ) -> Result<Vec<u64>>;
    fn delete_vector(&self, table_id: &str, id: u64) -> Result<()>;
    fn delete_vectors(&self, table_id: &str, ids: &[u64]) -> Result<()>;
    fn get_vector_by_id(&self, table_id: &str, id: u64) -> Result<Vec<f32>>;

    fn flush_table(&self, table_id: &str) -> Result<()>;
    fn flush(&self) -> Result<()>;
    fn compact(&self, table_id: &str) -> Result<()>;

    fn create_index(
        &self,
        table_id: &str,
        engine_type: EngineType,
        index_params: serde_json::Value,
    ) -> Result<()>;
    fn describe_index(&self, table_id: &str) -> Result<(EngineType, serde_json::Value)>;
    fn drop_index(&self, table_id: &str) -> Result<()>;

    fn query(
        &self,
        table_id: &str,
        partition_tags: &[String],
        k: usize,
        nprobe: usize,
        queries: &[Vec<f32>],
    ) -> Result<Vec<TopK>>;
    fn query_by_id(
        &self,
        table_id: &str,
        partition_tags: &[String],
        k: usize,
        nprobe: usize,
        id: u64,
    ) -> Result<Vec<TopK>>;
    fn query_by_file_id(
        &self,
        table_id: &str,
        file_ids: &[i64],
        k: usize,
        nprobe: usize,
        queries: &[Vec<f32>],
    ) -> Result<Vec<TopK>>;

    fn size(&self) -> Result<u64>;
}

struct Inner {
    config: Config,
    meta: Arc<SqliteMeta>,
    mem: Arc<MemManager>,
    wal: Arc<WalManager>,
    ongoing: Arc<OngoingFiles>,
    executor: QueryExecutor,
    id_gen: SafeIdGenerator,
    initialized: AtomicBool,
    merge_queue: Arc<MergeQueue>,
    merge_swn: Arc<WaitNotify>,
    index_swn: Arc<WaitNotify>,
    timer_swn: Arc<WaitNotify>,
    index_failed: IndexFailedChecker,
    build_guard: BuildGuard,
    compact_pool: rayon::ThreadPool,
    index_pool: rayon::ThreadPool,
    flush_merge_compact: TableLocks,
    build_index_mutex: Mutex<()>,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct DbImpl(Arc<Inner>);

impl DbImpl {
    pub fn open(config: Config) -> Result<Self> {
        let ongoing = Arc::new(OngoingFiles::new());
        let archive = ArchiveConf {
            days: config.archive_days,
            disk_gb: config.archive_disk_gb,
        };
        let meta = Arc::new(SqliteMeta::open(&config.path, archive, ongoing.clone())?);
        let mem = Arc::new(MemManager::new(&config.path));
        let floor = meta.get_global_lsn()?;
        let wal = Arc::new(WalManager::open(
            &config.path.join("wal"),
            config.wal_enable,
            config.wal_file_max_bytes,
            floor,
        )?);
        let executor = QueryExecutor::new(meta.clone(), mem.clone(), ongoing.clone());
        let compact_pool = worker_pool("compact", config.compact_threads);
        let index_pool = worker_pool("build-index", config.build_index_threads);
        Ok(Self(Arc::new(Inner {
            config,
            meta,
            mem,
            wal,
            ongoing,
            executor,
            id_gen: SafeIdGenerator::new(),
            initialized: AtomicBool::new(false),
            merge_queue: Arc::new(MergeQueue::new()),
            merge_swn: Arc::new(WaitNotify::new()),
            index_swn: Arc::new(WaitNotify::new()),
            timer_swn: Arc::new(WaitNotify::new()),
            index_failed: IndexFailedChecker::new(),
            build_guard: BuildGuard::new(),
            compact_pool,
            index_pool,
            flush_merge_compact: TableLocks::new(),
            build_index_mutex: Mutex::new(()),
            threads: Mutex::new(Vec::new()),
        })))
    }

    fn inner(&self) -> &Inner {
        &self.0
    }

    fn check_running(&self) -> Result<()> {
        if !self.0.initialized.load(Ordering::SeqCst) {
            return Err(Error::DbError("engine is not started".into()));
        }
        Ok(())
    }

    /// Resolve every table the operation targets: the named table plus its
    /// live partitions.
    fn table_and_partitions(&self, table_id: &str) -> Result<Vec<TableSchema>> {
        let table = self.0.meta.describe_table(table_id)?;
        let mut out = vec![table];
        out.extend(self.0.meta.show_partitions(table_id)?);
        Ok(out)
    }

    // ------------------------------------------------------------------
    // recovery

    fn recover(&self) -> Result<()> {
        let inner = self.inner();
        inner.meta.clean_up_shadow_files()?;

        let mut tables = inner.meta.all_tables()?;
        let top_level: Vec<String> = tables.iter().map(|t| t.table_id.clone()).collect();
        for table_id in &top_level {
            tables.extend(inner.meta.show_partitions(table_id)?);
        }
        for table in &tables {
            inner.mem.load_blacklist(&table.table_id);
        }

        let mut flush_lsns: HashMap<String, u64> = tables
            .iter()
            .map(|t| (t.table_id.clone(), t.flush_lsn))
            .collect();
        let mem = inner.mem.clone();
        let max_lsn = inner.wal.replay(|record| {
            exec_wal_record(&mem, &mut flush_lsns, record);
            Ok(())
        })?;

        let global = inner.meta.get_global_lsn()?;
        if max_lsn > global {
            inner.meta.set_global_lsn(max_lsn)?;
        }
        info!(max_lsn, "recovery complete");
        Ok(())
    }

    // ------------------------------------------------------------------
    // flush

    fn flush_one_table(&self, table_id: &str) -> Result<()> {
        let inner = self.inner();
        let table = inner.meta.describe_table(table_id)?;

        if inner.config.wal_enable && inner.initialized.load(Ordering::SeqCst) {
            inner
                .wal
                .append(WalOp::FlushMark, &table.table_id, 0, &[], &[])?;
        }

        let Some(buffer) = inner.mem.consume(&table.table_id) else {
            inner.mem.store_blacklist(&table.table_id)?;
            return Ok(());
        };

        let mut file = FileSchema::for_table(&table);
        inner.meta.create_file(&mut file)?;

        let mut data = SegmentData::new(table.dimension, table.metric_type, file.engine_type);
        data.flush_lsn = buffer.max_lsn;
        data.ids = buffer.ids;
        data.vectors = buffer.vectors;

        // Segment and sidecar writes happen without any lock held; only the
        // catalog transition below is serialized against merges.
        match segment::write_segment(&file.location, &data) {
            Ok(bytes) => {
                file.file_type = FileType::Raw;
                file.file_size = bytes;
                file.row_count = data.row_count();
                file.flush_lsn = buffer.max_lsn;
            }
            Err(err) => {
                warn!(error = %err, table_id, "segment write failed, restoring buffer");
                file.file_type = FileType::ToDelete;
                let _ = inner.meta.update_file(&mut file);
                let restore = crate::memtable::ConsumedBuffer {
                    dim: data.dim,
                    ids: data.ids,
                    vectors: data.vectors,
                    max_lsn: data.flush_lsn,
                };
                inner.mem.restore(&table.table_id, restore);
                return Err(err);
            }
        }
        inner.mem.store_blacklist(&table.table_id)?;

        {
            let lock = inner.flush_merge_compact.get(&table.table_id);
            let _guard = lock.lock();
            inner.meta.update_file(&mut file)?;
            inner
                .meta
                .update_table_flush_lsn(&table.table_id, buffer.max_lsn)?;
            let global = inner.meta.get_global_lsn()?;
            if buffer.max_lsn > global {
                inner.meta.set_global_lsn(buffer.max_lsn)?;
            }
        }
        debug!(table_id, lsn = buffer.max_lsn, rows = file.row_count, "flushed table");

        inner.merge_queue.push(&table.table_id);
        inner.merge_swn.notify();
        Ok(())
    }

    // ------------------------------------------------------------------
    // background loops

    fn spawn_background_threads(&self) {
        let mut threads = self.0.threads.lock();
        for (name, entry) in [
            ("merge-loop", Self::merge_loop as fn(DbImpl)),
            ("build-index-loop", Self::build_index_loop as fn(DbImpl)),
            ("timer-loop", Self::timer_loop as fn(DbImpl)),
        ] {
            let engine = self.clone();
            let handle = std::thread::Builder::new()
                .name(name.into())
                .spawn(move || entry(engine))
                .expect("spawn background thread");
            threads.push(handle);
        }
    }

    fn merge_loop(self) {
        let interval = Duration::from_secs(self.0.config.merge_interval_secs.max(1));
        while self.0.initialized.load(Ordering::SeqCst) {
            // Tables re-triggered while their worker was busy are still
            // pending; process them before sleeping again.
            if !self.0.merge_queue.has_pending() {
                self.0.merge_swn.wait_for(interval);
            }
            if !self.0.initialized.load(Ordering::SeqCst) {
                break;
            }
            let tables = self.0.merge_queue.take_all();
            if tables.is_empty() {
                continue;
            }
            self.0.compact_pool.scope(|scope| {
                for table_id in tables {
                    let engine = &self;
                    scope.spawn(move |_| {
                        if engine.0.initialized.load(Ordering::SeqCst) {
                            if let Err(err) = engine.background_merge_files(&table_id) {
                                warn!(error = %err, table_id, "merge pass failed");
                            }
                        }
                        engine.0.merge_queue.done(&table_id);
                    });
                }
            });
        }
        // Drain so a flush blocked on the barrier is released.
        loop {
            let abandoned = self.0.merge_queue.take_all();
            if abandoned.is_empty() {
                break;
            }
            for table_id in abandoned {
                self.0.merge_queue.done(&table_id);
            }
        }
        debug!("merge loop stopped");
    }

    fn background_merge_files(&self, table_id: &str) -> Result<()> {
        let inner = self.inner();
        let files = inner.meta.files_to_merge(table_id)?;
        if files.len() < 2 {
            return Ok(());
        }
        let table = inner.meta.describe_table(table_id)?;

        // Pack the size-descending list into the fewest output segments that
        // stay at or under the table's preferred segment size.
        let mut bins: Vec<Vec<FileSchema>> = Vec::new();
        let mut current: Vec<FileSchema> = Vec::new();
        let mut current_bytes = 0u64;
        for file in files {
            if !current.is_empty() && current_bytes + file.file_size > table.index_file_size {
                bins.push(std::mem::take(&mut current));
                current_bytes = 0;
            }
            current_bytes += file.file_size;
            current.push(file);
        }
        if !current.is_empty() {
            bins.push(current);
        }

        for bin in bins {
            if !inner.initialized.load(Ordering::SeqCst) {
                break; // safepoint between output segments
            }
            if bin.len() < 2 {
                continue;
            }
            self.merge_bin(&table, bin)?;
        }
        Ok(())
    }

    fn merge_bin(&self, table: &TableSchema, inputs: Vec<FileSchema>) -> Result<()> {
        let inner = self.inner();
        let _refs = inner.ongoing.guard(inputs.iter().map(|f| f.id));

        let mut merged = SegmentData::new(table.dimension, table.metric_type, table.engine_type);
        for input in &inputs {
            let data = segment::read_segment(&input.location)?;
            merged.ids.extend_from_slice(&data.ids);
            merged.vectors.extend_from_slice(&data.vectors);
            merged.flush_lsn = merged.flush_lsn.max(data.flush_lsn);
        }

        let mut output = FileSchema::for_table(table);
        output.file_type = FileType::NewMerge;
        inner.meta.create_file(&mut output)?;

        match segment::write_segment(&output.location, &merged) {
            Ok(bytes) => {
                output.file_type = FileType::Raw;
                output.file_size = bytes;
                output.row_count = merged.row_count();
                output.flush_lsn = merged.flush_lsn;
            }
            Err(err) => {
                output.file_type = FileType::ToDelete;
                let _ = inner.meta.update_file(&mut output);
                return Err(err);
            }
        }

        // One transaction: the output starts serving exactly when the inputs
        // stop. Only this catalog transition takes the per-table lock; the
        // reads and the segment write above ran without it.
        let mut updates = Vec::with_capacity(inputs.len() + 1);
        updates.push(output);
        for mut input in inputs {
            input.file_type = FileType::ToDelete;
            updates.push(input);
        }
        {
            let lock = inner.flush_merge_compact.get(&table.table_id);
            let _guard = lock.lock();
            inner.meta.update_files(&mut updates)?;
        }
        debug!(
            table_id = %table.table_id,
            merged = updates.len() - 1,
            rows = merged.row_count(),
            "merged segment files"
        );
        Ok(())
    }

    fn build_index_loop(self) {
        let interval = Duration::from_secs(self.0.config.build_index_interval_secs.max(1));
        while self.0.initialized.load(Ordering::SeqCst) {
            self.0.index_swn.wait_for(interval);
            if !self.0.initialized.load(Ordering::SeqCst) {
                break;
            }
            if let Err(err) = self.build_index_pass() {
                warn!(error = %err, "build-index pass failed");
            }
        }
        debug!("build-index loop stopped");
    }

    fn build_index_pass(&self) -> Result<()> {
        let inner = self.inner();
        let _submit = inner.build_index_mutex.lock();

        // Promote raw files past the threshold, for tables with an ANN
        // engine configured.
        let mut tables = inner.meta.all_tables()?;
        let top_level: Vec<String> = tables.iter().map(|t| t.table_id.clone()).collect();
        for table_id in &top_level {
            tables.extend(inner.meta.show_partitions(table_id)?);
        }
        for table in &tables {
            if table.engine_type != EngineType::Flat {
                inner
                    .meta
                    .update_files_to_index(&table.table_id, inner.config.build_index_threshold)?;
            }
        }

        let files = inner.meta.files_to_index()?;
        inner.index_pool.scope(|scope| {
            for file in files {
                if !inner.initialized.load(Ordering::SeqCst) {
                    break;
                }
                if inner.index_failed.is_blacklisted(file.id) {
                    continue;
                }
                if !inner.build_guard.try_acquire(file.id) {
                    continue;
                }
                let engine = &self;
                scope.spawn(move |_| {
                    let file_id = file.id;
                    if let Err(err) = engine.build_index_for_file(&file) {
                        let strikes = engine.0.index_failed.record_failure(file_id);
                        warn!(error = %err, file_id, strikes, "index build failed");
                    } else {
                        engine.0.index_failed.record_success(file_id);
                    }
                    engine.0.build_guard.release(file_id);
                });
            }
        });
        Ok(())
    }

    fn build_index_for_file(&self, source: &FileSchema) -> Result<()> {
        let inner = self.inner();
        let _refs = inner.ongoing.guard([source.id]);

        // A dropped table turns its pending builds into garbage.
        let table = match inner.meta.describe_table(&source.table_id) {
            Ok(table) => table,
            Err(_) => {
                let mut dead = source.clone();
                dead.file_type = FileType::ToDelete;
                inner.meta.update_file(&mut dead)?;
                return Ok(());
            }
        };

        let data = segment::read_segment(&source.location)?;
        let builder = index::builder_for(table.engine_type);
        let blob = builder.build(
            data.dim as usize,
            data.metric,
            &data.ids,
            &data.vectors,
            &table.index_params,
        )?;

        let mut output = FileSchema::for_table(&table);
        output.file_type = FileType::NewIndex;
        output.segment_id = source.segment_id.clone();
        inner.meta.create_file(&mut output)?;

        let result = (|| -> Result<u64> {
            let mut indexed = data;
            indexed.engine_type = table.engine_type;
            let vec_bytes = segment::write_segment(&output.location, &indexed)?;
            let idx_bytes = segment::write_index_blob(
                &crate::meta::index_location(&output.location),
                &blob,
            )?;
            Ok(vec_bytes + idx_bytes)
        })();

        match result {
            Ok(bytes) => {
                output.file_type = FileType::Index;
                output.file_size = bytes;
                output.row_count = source.row_count;
                output.flush_lsn = source.flush_lsn;
            }
            Err(err) => {
                output.file_type = FileType::ToDelete;
                let _ = inner.meta.update_file(&mut output);
                return Err(err);
            }
        }

        // The freshly built index starts serving; the raw source becomes a
        // backup that in-flight queries finish against, and the TTL
        // collector reclaims it later.
        let mut backup = source.clone();
        backup.file_type = FileType::Backup;
        let mut updates = vec![output, backup];
        inner.meta.update_files(&mut updates)?;
        debug!(
            table_id = %table.table_id,
            file_id = %source.file_id,
            engine = ?table.engine_type,
            "built index file"
        );
        Ok(())
    }

    fn timer_loop(self) {
        let tick = Duration::from_secs(self.0.config.auto_flush_interval_secs.max(1));
        let archive_interval = Duration::from_secs(self.0.config.archive_interval_secs.max(1));
        let mut last_archive = Instant::now();
        while self.0.initialized.load(Ordering::SeqCst) {
            self.0.timer_swn.wait_for(tick);
            if !self.0.initialized.load(Ordering::SeqCst) {
                break;
            }
            for table_id in self.0.mem.dirty_tables() {
                if let Err(err) = self.flush_one_table(&table_id) {
                    warn!(error = %err, table_id, "timer flush failed");
                }
            }
            if last_archive.elapsed() >= archive_interval {
                last_archive = Instant::now();
                if let Err(err) = self.0.meta.archive() {
                    warn!(error = %err, "archive pass failed");
                }
                if let Err(err) = self
                    .0
                    .meta
                    .clean_up_files_with_ttl(self.0.config.ttl_seconds)
                {
                    warn!(error = %err, "ttl gc pass failed");
                }
            }
        }
        debug!("timer loop stopped");
    }

    /// Test/maintenance hook: run one archive + GC pass immediately.
    pub fn vacuum(&self) -> Result<()> {
        self.0.meta.archive()?;
        self.0.meta.clean_up_files_with_ttl(self.0.config.ttl_seconds)
    }
}

fn exec_wal_record(mem: &MemManager, flush_lsns: &mut HashMap<String, u64>, record: &WalRecord) {
    let flushed = flush_lsns.get(&record.table_id).copied();
    let Some(flushed) = flushed else {
        // Table no longer exists; its records are dead weight.
        return;
    };
    if record.lsn <= flushed {
        return;
    }
    match record.op {
        WalOp::Insert => {
            if let Err(err) = mem.insert(
                &record.table_id,
                record.dim as u16,
                record.lsn,
                &record.ids,
                &record.vectors,
            ) {
                warn!(error = %err, table_id = %record.table_id, "skipping bad wal record");
            }
        }
        WalOp::Delete => mem.delete(&record.table_id, record.lsn, &record.ids),
        WalOp::FlushMark => {}
    }
}

impl Db for DbImpl {
    fn start(&self) -> Result<()> {
        if self.0.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(err) = self.recover() {
            self.0.initialized.store(false, Ordering::SeqCst);
            return Err(err);
        }
        self.0.wal.start();
        self.spawn_background_threads();
        info!(path = %self.0.config.path.display(), "engine started");
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        if !self.0.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        // Graceful: push everything buffered into durable segments first.
        for table_id in self.0.mem.dirty_tables() {
            if let Err(err) = self.flush_one_table(&table_id) {
                warn!(error = %err, table_id, "flush on shutdown failed");
            }
        }
        self.0
            .merge_queue
            .wait_idle(SHUTDOWN_JOIN_TIMEOUT);

        self.0.initialized.store(false, Ordering::SeqCst);
        self.0.merge_swn.notify();
        self.0.index_swn.notify();
        self.0.timer_swn.notify();
        self.0.merge_swn.interrupt();
        self.0.index_swn.interrupt();
        self.0.timer_swn.interrupt();
        for handle in self.0.threads.lock().drain(..) {
            let _ = handle.join();
        }
        self.0.wal.stop();
        info!("engine stopped");
        Ok(())
    }

    fn drop_all(&self) -> Result<()> {
        self.0.meta.drop_all()
    }

    fn create_table(&self, mut schema: TableSchema) -> Result<TableSchema> {
        self.check_running()?;
        if schema.dimension == 0 {
            return Err(Error::invalid("table dimension must be positive"));
        }
        if schema.index_file_size == 0 {
            schema.index_file_size = self.0.config.index_file_size;
        }
        self.0.meta.create_table(&mut schema)?;
        Ok(schema)
    }

    fn drop_table(&self, table_id: &str) -> Result<()> {
        self.check_running()?;
        // Recursive: partitions go down with their owner.
        let targets = self.table_and_partitions(table_id)?;
        for target in &targets {
            self.0.meta.drop_table(&target.table_id)?;
            self.0.meta.delete_table_files(&target.table_id)?;
            self.0.mem.drop_table(&target.table_id);
        }
        debug!(table_id, "dropped table");
        Ok(())
    }

    fn describe_table(&self, table_id: &str) -> Result<TableSchema> {
        self.0.meta.describe_table(table_id)
    }

    fn has_table(&self, table_id: &str) -> Result<bool> {
        self.0.meta.has_table(table_id)
    }

    fn all_tables(&self) -> Result<Vec<TableSchema>> {
        self.0.meta.all_tables()
    }

    fn get_table_row_count(&self, table_id: &str) -> Result<u64> {
        let mut total = 0;
        for target in self.table_and_partitions(table_id)? {
            total += self.0.meta.count(&target.table_id)?;
        }
        Ok(total)
    }

    fn get_table_info(&self, table_id: &str) -> Result<TableInfo> {
        let mut info = TableInfo {
            total_row_count: 0,
            partitions: Vec::new(),
        };
        for target in self.table_and_partitions(table_id)? {
            let files = self
                .0
                .meta
                .files_by_type(&target.table_id, &FileType::SEARCHABLE)?;
            let mut stat = PartitionStat {
                tag: target.partition_tag.clone(),
                table_id: target.table_id.clone(),
                row_count: 0,
                segments: Vec::new(),
            };
            for file in files {
                stat.row_count += file.row_count;
                stat.segments.push(SegmentStat {
                    segment_id: file.segment_id,
                    row_count: file.row_count,
                    data_size: file.file_size,
                    engine_type: file.engine_type,
                });
            }
            info.total_row_count += stat.row_count;
            info.partitions.push(stat);
        }
        Ok(info)
    }

    /// Touch every serving file so the OS page cache is warm.
    fn preload_table(&self, table_id: &str) -> Result<()> {
        for target in self.table_and_partitions(table_id)? {
            let files = self.0.meta.files_to_search(&target.table_id, &[])?;
            let _refs = self.0.ongoing.guard(files.iter().map(|f| f.id));
            for file in &files {
                let _ = segment::read_segment(&file.location)?;
            }
        }
        Ok(())
    }

    fn create_partition(&self, table_id: &str, name: Option<&str>, tag: &str) -> Result<()> {
        self.check_running()?;
        let lsn = self.0.meta.get_table_flush_lsn(table_id).unwrap_or(0);
        self.0.meta.create_partition(table_id, name, tag, lsn)?;
        Ok(())
    }

    fn drop_partition(&self, partition_name: &str) -> Result<()> {
        self.check_running()?;
        self.0.meta.drop_table(partition_name)?;
        self.0.meta.delete_table_files(partition_name)?;
        self.0.mem.drop_table(partition_name);
        Ok(())
    }

    fn drop_partition_by_tag(&self, table_id: &str, tag: &str) -> Result<()> {
        let name = self.0.meta.get_partition_name(table_id, tag)?;
        self.drop_partition(&name)
    }

    fn show_partitions(&self, table_id: &str) -> Result<Vec<TableSchema>> {
        self.0.meta.describe_table(table_id)?;
        self.0.meta.show_partitions(table_id)
    }

    fn insert_vectors(
        &self,
        table_id: &str,
        partition_tag: &str,
        ids: Vec<u64>,
        vectors: Vec<f32>,
    ) -> Result<Vec<u64>> {
        self.check_running()?;
        let table = self.0.meta.describe_table(table_id)?;
        let target = if partition_tag.trim().is_empty() {
            table.table_id.clone()
        } else {
            self.0.meta.get_partition_name(table_id, partition_tag)?
        };

        let dim = table.dimension as usize;
        if dim == 0 || vectors.is_empty() || vectors.len() % dim != 0 {
            return Err(Error::invalid(format!(
                "vector payload of {} values is not a multiple of dimension {dim}",
                vectors.len()
            )));
        }
        let rows = vectors.len() / dim;
        let ids = if ids.is_empty() {
            self.0.id_gen.next_batch(rows)
        } else if ids.len() == rows {
            ids
        } else {
            return Err(Error::invalid(format!(
                "{} ids supplied for {rows} vectors",
                ids.len()
            )));
        };

        // The batch is acknowledged only once its WAL record is fsync'd;
        // after that the rows become visible to queries, all or nothing.
        let lsn = self
            .0
            .wal
            .append(WalOp::Insert, &target, table.dimension as u32, &ids, &vectors)?;
        self.0
            .mem
            .insert(&target, table.dimension, lsn, &ids, &vectors)?;

        if self.0.mem.buffer_bytes(&target) >= self.0.config.buffer_size {
            self.flush_one_table(&target)?;
        }
        Ok(ids)
    }

    fn delete_vector(&self, table_id: &str, id: u64) -> Result<()> {
        self.delete_vectors(table_id, &[id])
    }

    fn delete_vectors(&self, table_id: &str, ids: &[u64]) -> Result<()> {
        self.check_running()?;
        if ids.is_empty() {
            return Ok(());
        }
        for target in self.table_and_partitions(table_id)? {
            let lsn = self
                .0
                .wal
                .append(WalOp::Delete, &target.table_id, 0, ids, &[])?;
            self.0.mem.delete(&target.table_id, lsn, ids);
        }
        Ok(())
    }

    fn get_vector_by_id(&self, table_id: &str, id: u64) -> Result<Vec<f32>> {
        for target in self.table_and_partitions(table_id)? {
            if self.0.mem.blacklist(&target.table_id).contains(&id) {
                continue;
            }
            if let Some(vector) = self.0.mem.get_vector(&target.table_id, id) {
                return Ok(vector);
            }
            let files = self.0.meta.files_to_search(&target.table_id, &[])?;
            let _refs = self.0.ongoing.guard(files.iter().map(|f| f.id));
            for file in &files {
                let data = segment::read_segment(&file.location)?;
                if let Some(row) = data.ids.iter().position(|&row_id| row_id == id) {
                    return Ok(data.vector(row).to_vec());
                }
            }
        }
        Err(Error::not_found(format!(
            "vector {id} in table {table_id}"
        )))
    }

    fn flush_table(&self, table_id: &str) -> Result<()> {
        self.check_running()?;
        for target in self.table_and_partitions(table_id)? {
            self.flush_one_table(&target.table_id)?;
        }
        // The flush is the barrier for merges it triggered.
        self.0.merge_queue.wait_idle(MERGE_BARRIER_TIMEOUT);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.check_running()?;
        for table_id in self.0.mem.dirty_tables() {
            self.flush_one_table(&table_id)?;
        }
        self.0.merge_queue.wait_idle(MERGE_BARRIER_TIMEOUT);

        // Whole log files below every table's flush horizon are dead.
        let mut tables = self.0.meta.all_tables()?;
        let top_level: Vec<String> = tables.iter().map(|t| t.table_id.clone()).collect();
        for table_id in &top_level {
            tables.extend(self.0.meta.show_partitions(table_id)?);
        }
        if let Some(min_lsn) = tables
            .iter()
            .map(|t| self.0.meta.get_table_flush_lsn(&t.table_id).unwrap_or(0))
            .min()
        {
            self.0.wal.purge(min_lsn)?;
        }
        Ok(())
    }

    /// Asynchronous: seeds the merge trigger and returns. A following
    /// `flush` acts as the completion barrier.
    fn compact(&self, table_id: &str) -> Result<()> {
        self.check_running()?;
        for target in self.table_and_partitions(table_id)? {
            self.0.merge_queue.push(&target.table_id);
        }
        self.0.merge_swn.notify();
        Ok(())
    }

    fn create_index(
        &self,
        table_id: &str,
        engine_type: EngineType,
        index_params: serde_json::Value,
    ) -> Result<()> {
        self.check_running()?;
        // Buffered rows must be in files before they can be indexed.
        self.flush_table(table_id)?;

        for target in self.table_and_partitions(table_id)? {
            self.0
                .meta
                .update_table_index(&target.table_id, engine_type, &index_params)?;
            if engine_type != EngineType::Flat {
                self.0
                    .meta
                    .update_files_to_index(&target.table_id, self.0.config.build_index_threshold)?;
            }
        }
        self.0.index_swn.notify();

        // Wait for the background builders to drain this table's backlog.
        let deadline = Instant::now() + INDEX_BUILD_TIMEOUT;
        loop {
            let mut outstanding = 0usize;
            for target in self.table_and_partitions(table_id)? {
                outstanding += self
                    .0
                    .meta
                    .files_by_type(
                        &target.table_id,
                        &[FileType::ToIndex, FileType::NewIndex],
                    )?
                    .len();
            }
            if outstanding == 0 {
                return Ok(());
            }
            if !self.0.initialized.load(Ordering::SeqCst) {
                return Err(Error::DbError("engine stopped during index build".into()));
            }
            if Instant::now() >= deadline {
                return Err(Error::DbError(format!(
                    "index build timed out with {outstanding} files outstanding"
                )));
            }
            self.0.index_swn.notify();
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    fn describe_index(&self, table_id: &str) -> Result<(EngineType, serde_json::Value)> {
        self.0.meta.describe_table_index(table_id)
    }

    fn drop_index(&self, table_id: &str) -> Result<()> {
        self.check_running()?;
        for target in self.table_and_partitions(table_id)? {
            self.0.meta.drop_table_index(&target.table_id)?;
        }
        Ok(())
    }

    fn query(
        &self,
        table_id: &str,
        partition_tags: &[String],
        k: usize,
        nprobe: usize,
        queries: &[Vec<f32>],
    ) -> Result<Vec<TopK>> {
        self.check_running()?;
        self.0
            .executor
            .query(table_id, partition_tags, k, nprobe, queries)
    }

    fn query_by_id(
        &self,
        table_id: &str,
        partition_tags: &[String],
        k: usize,
        nprobe: usize,
        id: u64,
    ) -> Result<Vec<TopK>> {
        let vector = self.get_vector_by_id(table_id, id)?;
        self.query(table_id, partition_tags, k, nprobe, &[vector])
    }

    fn query_by_file_id(
        &self,
        table_id: &str,
        file_ids: &[i64],
        k: usize,
        nprobe: usize,
        queries: &[Vec<f32>],
    ) -> Result<Vec<TopK>> {
        self.check_running()?;
        self.0
            .executor
            .query_by_file_id(table_id, file_ids, k, nprobe, queries)
    }

    fn size(&self) -> Result<u64> {
        self.0.meta.size()
    }
}
