use std::path::Path;
use std::time::Duration;

use ivf_bench::dataset::{load_dataset, open_train, read_fvecs, write_ivecs, FvecsWriter};
use ivf_bench::distance::l2_distance_sq;
use ivf_bench::engine::{centroid_table, Connector, Store};
use ivf_bench::{
    build_and_monitor, run_parallel, run_sequential, train_centroids, BenchConfig, BulkLoader,
    CancelHandle, IndexSpec, LoadConfig, LocalEngine, Metric, MonitorConfig, MonitorState,
    SearchParams, TrainConfig, VectorDataset, Workload,
};
use rand::Rng;
use rand_xoshiro::rand_core::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use tempfile::TempDir;

const DIMS: usize = 8;
const TRAIN: usize = 2_000;
const QUERIES: usize = 40;
const TOP_K: usize = 10;

fn write_fvecs(path: &Path, rows: &[Vec<f32>]) {
    let mut writer = FvecsWriter::create(path).unwrap();
    for row in rows {
        writer.write(row).unwrap();
    }
    writer.finish().unwrap();
}

/// Writes a small clustered dataset with exact ground truth
fn write_dataset(dir: &Path) -> Vec<Vec<f32>> {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(9);
    let centers: Vec<Vec<f32>> = (0..8)
        .map(|_| (0..DIMS).map(|_| rng.gen_range(-20.0..20.0)).collect())
        .collect();
    let mut point = |rng: &mut Xoshiro256PlusPlus| -> Vec<f32> {
        let c = &centers[rng.gen_range(0..centers.len())];
        c.iter().map(|x| x + rng.gen_range(-2.0..2.0)).collect()
    };
    let train: Vec<Vec<f32>> = (0..TRAIN).map(|_| point(&mut rng)).collect();
    let test: Vec<Vec<f32>> = (0..QUERIES).map(|_| point(&mut rng)).collect();

    let neighbors: Vec<Vec<u32>> = test
        .iter()
        .map(|q| {
            let mut scored: Vec<(u32, f32)> = train
                .iter()
                .enumerate()
                .map(|(i, v)| (i as u32, l2_distance_sq(q, v)))
                .collect();
            scored.sort_by(|a, b| a.1.total_cmp(&b.1));
            scored.iter().take(TOP_K).map(|&(i, _)| i).collect()
        })
        .collect();

    write_fvecs(&dir.join("train.fvecs"), &train);
    write_fvecs(&dir.join("test.fvecs"), &test);
    write_ivecs(dir.join("neighbors.ivecs"), &neighbors).unwrap();
    train
}

fn full_probe() -> SearchParams {
    SearchParams {
        probes: 1_000,
        epsilon: 1.0,
    }
}

fn monitor_config() -> MonitorConfig {
    MonitorConfig::default()
        .with_poll_interval(Duration::from_millis(5))
        .with_timeout(Some(Duration::from_secs(120)))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn external_centroids_end_to_end() {
    let data = TempDir::new().unwrap();
    let engine_dir = TempDir::new().unwrap();
    write_dataset(data.path());

    let train = open_train(data.path(), "synthetic").unwrap();
    assert_eq!(train.len(), TRAIN);
    let config = TrainConfig::default()
        .with_lists(8)
        .with_child_lists(Some(4))
        .with_iterations(10);
    let centroids = train_centroids(&train, &config).unwrap();
    assert!(centroids.is_tree());
    assert!(centroids.len() > 1 + 8);

    let mut engine = LocalEngine::open(engine_dir.path()).unwrap();
    let mut loader = BulkLoader::new(engine.connection(), LoadConfig::default().with_chunks(7));
    assert_eq!(loader.load_embeddings("synthetic", &train).await.unwrap(), TRAIN as u64);
    assert_eq!(
        loader
            .load_centroids(&centroid_table("synthetic"), &centroids)
            .await
            .unwrap(),
        centroids.len() as u64
    );

    let spec = IndexSpec::external("synthetic", Metric::L2).with_build_threads(2);
    let progress = engine.connection();
    let cancel = CancelHandle::default();
    let state = build_and_monitor(&mut engine, progress, &spec, monitor_config(), &cancel)
        .await
        .unwrap();
    assert!(matches!(state, MonitorState::Done { .. }));

    let dataset = load_dataset(data.path(), "synthetic").unwrap();
    let workload = Workload::new(&dataset.test, &dataset.neighbors).unwrap();
    let connector = engine.connector(&spec.index_name, full_probe()).unwrap();
    let mut endpoint = connector.connect().unwrap();
    let report = run_sequential(&mut endpoint, workload, &BenchConfig::default()).unwrap();

    assert_eq!(report.queries, QUERIES);
    assert!((report.recall - 1.0).abs() < 1e-9, "recall {}", report.recall);
    assert!(report.qps > 0.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn internal_build_parallel_benchmark_and_dump() {
    let data = TempDir::new().unwrap();
    let engine_dir = TempDir::new().unwrap();
    let train_rows = write_dataset(data.path());
    let train = open_train(data.path(), "synthetic").unwrap();

    let mut engine = LocalEngine::open(engine_dir.path()).unwrap();
    let mut loader = BulkLoader::new(engine.connection(), LoadConfig::default());
    loader.load_embeddings("synthetic", &train).await.unwrap();

    let spec = IndexSpec::internal("synthetic", Metric::L2, vec![16]).with_build_threads(2);
    let progress = engine.connection();
    let cancel = CancelHandle::default();
    build_and_monitor(&mut engine, progress, &spec, monitor_config(), &cancel)
        .await
        .unwrap();

    let dataset = load_dataset(data.path(), "synthetic").unwrap();
    let workload = Workload::new(&dataset.test, &dataset.neighbors).unwrap();
    let connector = engine.connector(&spec.index_name, full_probe()).unwrap();
    let config = BenchConfig::default().with_workers(3);
    let report = run_parallel(&connector, workload, &config).unwrap();

    assert_eq!(report.workers, 3);
    assert!((report.recall - 1.0).abs() < 1e-9, "recall {}", report.recall);
    assert!(report.p99_ms >= report.p50_ms);

    let out = data.path().join("dump.fvecs");
    let mut writer = FvecsWriter::create(&out).unwrap();
    let scanned = engine
        .scan("synthetic", &mut |row| writer.write(&row.vector))
        .await
        .unwrap();
    writer.finish().unwrap();
    assert_eq!(scanned, TRAIN as u64);
    assert_eq!(read_fvecs(&out).unwrap(), train_rows);
}
