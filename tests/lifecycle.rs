use strata::{Config, Db, DbImpl, MetricType, TableSchema};

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

fn start_engine(path: &std::path::Path) -> DbImpl {
    let engine = DbImpl::open(test_config(path)).unwrap();
    engine.start().unwrap();
    engine
}

fn constant_vector(dim: usize, value: f32) -> Vec<f32> {
    vec![value; dim]
}

#[test]
fn insert_query_returns_nearest_with_exact_distances() {
    let dir = tempfile::tempdir().unwrap();
    let engine = start_engine(dir.path());
    engine
        .create_table(TableSchema::new("t1", 8, MetricType::L2))
        .unwrap();

    let mut vectors = Vec::new();
    for value in [0.0f32, 1.0, 2.0] {
        vectors.extend(constant_vector(8, value));
    }
    engine
        .insert_vectors("t1", "", vec![10, 11, 12], vectors)
        .unwrap();

    // Acknowledged inserts are visible before any flush.
    let results = engine
        .query("t1", &[], 2, 16, &[constant_vector(8, 0.0)])
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].len(), 2);
    assert_eq!(results[0][0], (10, 0.0));
    assert_eq!(results[0][1].0, 11);
    assert!((results[0][1].1 - 8.0).abs() < 1e-6);

    // And equally visible after the rows land in a segment file.
    engine.flush_table("t1").unwrap();
    let results = engine
        .query("t1", &[], 2, 16, &[constant_vector(8, 0.0)])
        .unwrap();
    assert_eq!(results[0][0], (10, 0.0));
    assert_eq!(results[0][1].0, 11);

    engine.stop().unwrap();
}

#[test]
fn k_larger_than_row_count_returns_all_rows() {
    let dir = tempfile::tempdir().unwrap();
    let engine = start_engine(dir.path());
    engine
        .create_table(TableSchema::new("t1", 4, MetricType::L2))
        .unwrap();
    engine
        .insert_vectors(
            "t1",
            "",
            vec![1, 2, 3],
            vec![
                0.0, 0.0, 0.0, 0.0, //
                1.0, 1.0, 1.0, 1.0, //
                2.0, 2.0, 2.0, 2.0,
            ],
        )
        .unwrap();
    let results = engine
        .query("t1", &[], 100, 16, &[vec![0.0, 0.0, 0.0, 0.0]])
        .unwrap();
    assert_eq!(results[0].len(), 3);
    engine.stop().unwrap();
}

#[test]
fn dropped_table_disappears_from_catalog_and_disk() {
    let dir = tempfile::tempdir().unwrap();
    let engine = start_engine(dir.path());
    engine
        .create_table(TableSchema::new("t1", 8, MetricType::L2))
        .unwrap();
    engine
        .insert_vectors("t1", "", vec![], constant_vector(8, 1.0))
        .unwrap();
    engine.flush_table("t1").unwrap();
    assert!(dir.path().join("tables/t1").exists());

    engine.drop_table("t1").unwrap();
    assert!(!engine.has_table("t1").unwrap());

    // Past the (zero) TTL the collector erases rows, files and directory.
    std::thread::sleep(std::time::Duration::from_millis(5));
    engine.vacuum().unwrap();
    assert!(!engine.has_table("t1").unwrap());
    assert!(!dir.path().join("tables/t1").exists());

    engine.stop().unwrap();
}

#[test]
fn multiple_flushes_merge_into_a_single_raw_file() {
    let dir = tempfile::tempdir().unwrap();
    let engine = start_engine(dir.path());
    let dim = 128usize;
    engine
        .create_table(TableSchema::new("t1", dim as u16, MetricType::L2))
        .unwrap();

    let per_flush = 5_000usize;
    let mut next_id = 0u64;
    for _ in 0..4 {
        let mut ids = Vec::with_capacity(per_flush);
        let mut vectors = Vec::with_capacity(per_flush * dim);
        for _ in 0..per_flush {
            ids.push(next_id);
            let seed = next_id as f32;
            vectors.extend((0..dim).map(|d| seed + d as f32 * 0.001));
            next_id += 1;
        }
        engine.insert_vectors("t1", "", ids, vectors).unwrap();
        engine.flush().unwrap();
    }

    assert_eq!(engine.get_table_row_count("t1").unwrap(), 20_000);
    let info = engine.get_table_info("t1").unwrap();
    assert_eq!(info.total_row_count, 20_000);
    let segments = &info.partitions[0].segments;
    assert_eq!(segments.len(), 1, "expected one merged segment: {segments:?}");
    assert_eq!(segments[0].row_count, 20_000);

    // Query correctness is unchanged by the merge.
    let probe: Vec<f32> = (0..dim).map(|d| 777.0 + d as f32 * 0.001).collect();
    let results = engine.query("t1", &[], 1, 16, &[probe]).unwrap();
    assert_eq!(results[0][0].0, 777);

    engine.stop().unwrap();
}

#[test]
fn flushed_vectors_read_back_bit_exact() {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    let dir = tempfile::tempdir().unwrap();
    let engine = start_engine(dir.path());
    engine
        .create_table(TableSchema::new("t1", 16, MetricType::L2))
        .unwrap();

    let mut rng = StdRng::seed_from_u64(99);
    let vectors: Vec<f32> = (0..16 * 10).map(|_| rng.gen::<f32>()).collect();
    let ids: Vec<u64> = (100..110).collect();
    engine
        .insert_vectors("t1", "", ids.clone(), vectors.clone())
        .unwrap();
    engine.flush_table("t1").unwrap();

    for (row, &id) in ids.iter().enumerate() {
        let stored = engine.get_vector_by_id("t1", id).unwrap();
        assert_eq!(stored, vectors[row * 16..(row + 1) * 16].to_vec());
    }
    engine.stop().unwrap();
}

#[test]
fn deleted_ids_never_appear_in_results() {
    let dir = tempfile::tempdir().unwrap();
    let engine = start_engine(dir.path());
    engine
        .create_table(TableSchema::new("t1", 4, MetricType::L2))
        .unwrap();
    engine
        .insert_vectors(
            "t1",
            "",
            vec![1, 2, 3],
            vec![
                0.0, 0.0, 0.0, 0.0, //
                0.1, 0.1, 0.1, 0.1, //
                5.0, 5.0, 5.0, 5.0,
            ],
        )
        .unwrap();
    engine.flush_table("t1").unwrap();

    engine.delete_vector("t1", 1).unwrap();
    let results = engine
        .query("t1", &[], 3, 16, &[vec![0.0, 0.0, 0.0, 0.0]])
        .unwrap();
    let ids: Vec<u64> = results[0].iter().map(|hit| hit.0).collect();
    assert!(!ids.contains(&1), "blacklisted id surfaced: {ids:?}");
    assert_eq!(ids, vec![2, 3]);

    assert!(engine.get_vector_by_id("t1", 1).is_err());
    engine.stop().unwrap();
}

#[test]
fn inner_product_orders_descending() {
    let dir = tempfile::tempdir().unwrap();
    let engine = start_engine(dir.path());
    engine
        .create_table(TableSchema::new("t1", 4, MetricType::Ip))
        .unwrap();
    engine
        .insert_vectors(
            "t1",
            "",
            vec![1, 2, 3],
            vec![
                1.0, 0.0, 0.0, 0.0, //
                2.0, 0.0, 0.0, 0.0, //
                3.0, 0.0, 0.0, 0.0,
            ],
        )
        .unwrap();
    engine.flush_table("t1").unwrap();
    let results = engine
        .query("t1", &[], 3, 16, &[vec![1.0, 0.0, 0.0, 0.0]])
        .unwrap();
    let ids: Vec<u64> = results[0].iter().map(|hit| hit.0).collect();
    assert_eq!(ids, vec![3, 2, 1]);
    engine.stop().unwrap();
}

#[test]
fn compact_is_asynchronous_with_flush_as_barrier() {
    let dir = tempfile::tempdir().unwrap();
    let engine = start_engine(dir.path());
    engine
        .create_table(TableSchema::new("t1", 8, MetricType::L2))
        .unwrap();
    for batch in 0..3u64 {
        engine
            .insert_vectors("t1", "", vec![batch], constant_vector(8, batch as f32))
            .unwrap();
        engine.flush_table("t1").unwrap();
    }
    // Several small raw files exist now; compact seeds the merge and flush
    // waits it out.
    engine.compact("t1").unwrap();
    engine.flush().unwrap();

    let info = engine.get_table_info("t1").unwrap();
    assert_eq!(info.partitions[0].segments.len(), 1);
    assert_eq!(info.total_row_count, 3);
    engine.stop().unwrap();
}
