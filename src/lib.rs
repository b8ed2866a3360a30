//! Train IVF codebooks, bulk-load vectors into an ANN engine, and benchmark
//! the built index for recall, throughput and latency.

pub mod centroids;
pub mod config;
pub mod dataset;
pub mod distance;
pub mod engine;
pub mod error;
pub mod harness;
pub mod kmeans;
pub mod loader;
pub mod monitor;
pub mod progress;
pub mod sampling;
pub mod trainer;

pub use centroids::{CentroidNode, CentroidSet};
pub use config::{
    BenchConfig, FailurePolicy, LoadConfig, Metric, MonitorConfig, SamplingMode, SearchParams,
    StopFlag, TrainConfig, DEFAULT_CHUNKS, DEFAULT_EPSILON, DEFAULT_ITERATIONS, DEFAULT_LISTS,
    DEFAULT_NUM_THREADS, DEFAULT_POLL_INTERVAL, DEFAULT_PROBES, DEFAULT_SEED, DEFAULT_TOP_K,
    MAX_POINTS_PER_CLUSTER,
};
pub use dataset::{BenchDataset, FvecsDataset, MemoryDataset, VectorDataset};
pub use engine::local::{LocalConnector, LocalEngine};
pub use engine::{CentroidSource, IndexSpec};
pub use error::{BenchError, Result};
pub use harness::{run_parallel, run_sequential, BenchmarkReport, Workload};
pub use loader::BulkLoader;
pub use monitor::{build_and_monitor, CancelHandle, MonitorState};
pub use trainer::train_centroids;
