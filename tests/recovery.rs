use std::sync::Arc;
use strata::meta::{ArchiveConf, FileSchema, SqliteMeta};
use strata::ongoing::OngoingFiles;
use strata::wal::{WalManager, WalOp};
use strata::{Config, Db, DbImpl, FileType, MetricType, TableSchema};

fn test_config(path: &std::path::Path) -> Config {
    Config {
        path: path.to_path_buf(),
        ttl_seconds: 0,
        auto_flush_interval_secs: 3600,
        merge_interval_secs: 3600,
        build_index_interval_secs: 3600,
        archive_interval_secs: 3600,
        ..Config::default()
    }
}

fn open_meta(path: &std::path::Path) -> SqliteMeta {
    SqliteMeta::open(path, ArchiveConf::default(), Arc::new(OngoingFiles::new())).unwrap()
}

#[test]
fn acknowledged_inserts_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let engine = DbImpl::open(test_config(dir.path())).unwrap();
        engine.start().unwrap();
        engine
            .create_table(TableSchema::new("t1", 4, MetricType::L2))
            .unwrap();
        engine
            .insert_vectors(
                "t1",
                "",
                vec![1, 2],
                vec![1.0, 1.0, 1.0, 1.0, 2.0, 2.0, 2.0, 2.0],
            )
            .unwrap();
        engine.stop().unwrap();
    }

    let engine = DbImpl::open(test_config(dir.path())).unwrap();
    engine.start().unwrap();
    assert_eq!(engine.get_table_row_count("t1").unwrap(), 2);
    let stored = engine.get_vector_by_id("t1", 2).unwrap();
    assert_eq!(stored, vec![2.0, 2.0, 2.0, 2.0]);
    engine.stop().unwrap();
}

#[test]
fn crash_mid_flush_cleans_shadow_row_and_replays_wal() {
    let dir = tempfile::tempdir().unwrap();
    {
        let engine = DbImpl::open(test_config(dir.path())).unwrap();
        engine.start().unwrap();
        engine
            .create_table(TableSchema::new("t1", 4, MetricType::L2))
            .unwrap();
        engine
            .insert_vectors("t1", "", vec![1], vec![1.0, 1.0, 1.0, 1.0])
            .unwrap();
        engine.stop().unwrap();
    }

    // Simulate a process killed mid-flush: a NEW catalog row was allocated
    // but never transitioned, and two acknowledged inserts sit only in the
    // log.
    {
        let meta = open_meta(dir.path());
        let table = meta.describe_table("t1").unwrap();
        let mut shadow = FileSchema::for_table(&table);
        meta.create_file(&mut shadow).unwrap();
        assert_eq!(shadow.file_type, FileType::New);

        let floor = meta.get_global_lsn().unwrap();
        let wal = Arc::new(
            WalManager::open(&dir.path().join("wal"), true, 1 << 28, floor).unwrap(),
        );
        wal.start();
        wal.append(WalOp::Insert, "t1", 4, &[2], &[2.0, 2.0, 2.0, 2.0])
            .unwrap();
        wal.append(WalOp::Insert, "t1", 4, &[3], &[3.0, 3.0, 3.0, 3.0])
            .unwrap();
        wal.stop();
    }

    let engine = DbImpl::open(test_config(dir.path())).unwrap();
    engine.start().unwrap();

    // The half-born file is gone from the catalog.
    let info = engine.get_table_info("t1").unwrap();
    assert!(info.partitions[0]
        .segments
        .iter()
        .all(|segment| segment.row_count > 0));

    // Replayed rows become durable again on the next flush.
    engine.flush().unwrap();
    assert_eq!(engine.get_table_row_count("t1").unwrap(), 3);
    assert_eq!(
        engine.get_vector_by_id("t1", 3).unwrap(),
        vec![3.0, 3.0, 3.0, 3.0]
    );
    engine.stop().unwrap();
}

#[test]
fn replay_skips_records_already_covered_by_flush_lsn() {
    let dir = tempfile::tempdir().unwrap();
    {
        let engine = DbImpl::open(test_config(dir.path())).unwrap();
        engine.start().unwrap();
        engine
            .create_table(TableSchema::new("t1", 4, MetricType::L2))
            .unwrap();
        engine
            .insert_vectors("t1", "", vec![1], vec![1.0, 0.0, 0.0, 0.0])
            .unwrap();
        engine.flush_table("t1").unwrap();
        engine
            .insert_vectors("t1", "", vec![2], vec![2.0, 0.0, 0.0, 0.0])
            .unwrap();
        engine.stop().unwrap();
    }

    let engine = DbImpl::open(test_config(dir.path())).unwrap();
    engine.start().unwrap();
    engine.flush().unwrap();
    // Replay is idempotent: row 1 is not duplicated by its log record.
    assert_eq!(engine.get_table_row_count("t1").unwrap(), 2);
    engine.stop().unwrap();
}

#[test]
fn global_lsn_is_monotonic_across_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let mut last = 0u64;
    for round in 0..3u64 {
        let engine = DbImpl::open(test_config(dir.path())).unwrap();
        engine.start().unwrap();
        if round == 0 {
            engine
                .create_table(TableSchema::new("t1", 4, MetricType::L2))
                .unwrap();
        }
        engine
            .insert_vectors("t1", "", vec![round + 1], vec![round as f32; 4])
            .unwrap();
        engine.flush_table("t1").unwrap();
        engine.stop().unwrap();

        let meta = open_meta(dir.path());
        let lsn = meta.get_global_lsn().unwrap();
        assert!(lsn > last, "round {round}: lsn {lsn} <= {last}");
        last = lsn;
    }
}

#[test]
fn deletes_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let engine = DbImpl::open(test_config(dir.path())).unwrap();
        engine.start().unwrap();
        engine
            .create_table(TableSchema::new("t1", 4, MetricType::L2))
            .unwrap();
        engine
            .insert_vectors(
                "t1",
                "",
                vec![1, 2],
                vec![1.0, 0.0, 0.0, 0.0, 2.0, 0.0, 0.0, 0.0],
            )
            .unwrap();
        engine.flush_table("t1").unwrap();
        engine.delete_vector("t1", 1).unwrap();
        engine.stop().unwrap();
    }

    let engine = DbImpl::open(test_config(dir.path())).unwrap();
    engine.start().unwrap();
    let results = engine
        .query("t1", &[], 10, 16, &[vec![1.0, 0.0, 0.0, 0.0]])
        .unwrap();
    let ids: Vec<u64> = results[0].iter().map(|hit| hit.0).collect();
    assert_eq!(ids, vec![2]);
    engine.stop().unwrap();
}

#[test]
fn corrupt_segment_is_quarantined() {
    let dir = tempfile::tempdir().unwrap();
    let engine = DbImpl::open(test_config(dir.path())).unwrap();
    engine.start().unwrap();
    engine
        .create_table(TableSchema::new("t1", 4, MetricType::L2))
        .unwrap();
    engine
        .insert_vectors("t1", "", vec![1], vec![1.0, 0.0, 0.0, 0.0])
        .unwrap();
    engine.flush_table("t1").unwrap();

    // Flip payload bytes in the one segment file under the table directory.
    let mut vec_path = None;
    for entry in walk(dir.path().join("tables/t1")) {
        if entry.extension().map(|ext| ext == "vec").unwrap_or(false) {
            vec_path = Some(entry);
        }
    }
    let vec_path = vec_path.expect("segment file exists");
    let mut bytes = std::fs::read(&vec_path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    std::fs::write(&vec_path, &bytes).unwrap();

    let err = engine
        .query("t1", &[], 1, 16, &[vec![1.0, 0.0, 0.0, 0.0]])
        .unwrap_err();
    assert_eq!(err.code(), strata::StatusCode::CorruptFile);

    // The quarantined file no longer serves; the table answers empty.
    let results = engine
        .query("t1", &[], 1, 16, &[vec![1.0, 0.0, 0.0, 0.0]])
        .unwrap();
    assert!(results[0].is_empty());
    engine.stop().unwrap();
}

fn walk(dir: std::path::PathBuf) -> Vec<std::path::PathBuf> {
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return out;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            out.extend(walk(path));
        } else {
            out.push(path);
        }
    }
    out
}
