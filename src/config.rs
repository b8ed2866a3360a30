//! Configuration threaded explicitly through every operation.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::distance::{dot, l2_distance_sq, norm};
use crate::error::{BenchError, Result};

/// Upper bound on training points drawn per requested centroid
pub const MAX_POINTS_PER_CLUSTER: usize = 256;
pub const DEFAULT_LISTS: usize = 4096;
pub const DEFAULT_ITERATIONS: usize = 25;
pub const DEFAULT_CHUNKS: usize = 10;
pub const DEFAULT_SEED: u64 = 42;
pub const DEFAULT_TOP_K: usize = 10;
pub const DEFAULT_PROBES: usize = 100;
pub const DEFAULT_EPSILON: f32 = 1.0;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_NUM_THREADS: usize = 0; // 0 means use all available cores

/// Resolves 0 to available parallelism
pub fn effective_threads(num_threads: usize) -> usize {
    if num_threads == 0 {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    } else {
        num_threads
    }
}

/// Distance metric of the index and of training.
///
/// Normalization table:
///
/// | metric | normalize samples | spherical centroids | residual quantization |
/// |--------|-------------------|---------------------|-----------------------|
/// | `l2`   | no                | no                  | yes                   |
/// | `cos`  | yes               | yes                 | no                    |
/// | `dot`  | no                | yes                 | no                    |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    #[default]
    L2,
    Cos,
    Dot,
}

impl Metric {
    /// Training samples are scaled to unit norm before k-means
    pub fn normalize_samples(self) -> bool {
        matches!(self, Metric::Cos)
    }

    /// Centroids are re-projected onto the unit sphere after every update
    pub fn spherical_centroids(self) -> bool {
        matches!(self, Metric::Cos | Metric::Dot)
    }

    pub fn residual_quantization(self) -> bool {
        matches!(self, Metric::L2)
    }

    /// Score used to pick the nearest centroid; lower is closer.
    ///
    /// Spherical centroids are compared by inner product.
    #[inline]
    pub fn assignment_score(self, vector: &[f32], centroid: &[f32]) -> f32 {
        if self.spherical_centroids() {
            -dot(vector, centroid)
        } else {
            l2_distance_sq(vector, centroid)
        }
    }

    /// Distance used to rank query candidates; lower is closer.
    #[inline]
    pub fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::L2 => l2_distance_sq(a, b),
            Metric::Cos => {
                let denom = norm(a) * norm(b);
                if denom == 0.0 {
                    1.0
                } else {
                    1.0 - dot(a, b) / denom
                }
            }
            Metric::Dot => -dot(a, b),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Metric::L2 => "l2",
            Metric::Cos => "cos",
            Metric::Dot => "dot",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stop request shared between a long-running job and whoever owns it.
///
/// Jobs check it between units of work and bail out with
/// [`BenchError::Cancelled`].
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_stopped() {
            Err(BenchError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// How the bounded training sample is drawn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingMode {
    /// Single sequential pass (Algorithm R)
    Streaming,
    /// Precomputed index subset read by `chunks` parallel workers
    Partitioned { chunks: usize },
}

/// Configuration for codebook training
#[derive(Debug, Clone)]
pub struct TrainConfig {
    /// Top-level centroid count (K)
    pub lists: usize,
    /// Child centroids per top-level cluster (K2)
    pub child_lists: Option<usize>,
    pub metric: Metric,
    /// Fixed number of Lloyd iterations
    pub iterations: usize,
    pub seed: u64,
    /// Requested GPU training; only the CPU path exists
    pub gpu: bool,
    pub sampling: SamplingMode,
    pub max_points_per_cluster: usize,
    pub show_progress: bool,
    pub stop: StopFlag,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            lists: DEFAULT_LISTS,
            child_lists: None,
            metric: Metric::L2,
            iterations: DEFAULT_ITERATIONS,
            seed: DEFAULT_SEED,
            gpu: false,
            sampling: SamplingMode::Streaming,
            max_points_per_cluster: MAX_POINTS_PER_CLUSTER,
            show_progress: false,
            stop: StopFlag::default(),
        }
    }
}

impl TrainConfig {
    pub fn with_lists(mut self, lists: usize) -> Self {
        self.lists = lists;
        self
    }

    pub fn with_child_lists(mut self, child_lists: Option<usize>) -> Self {
        self.child_lists = child_lists;
        self
    }

    pub fn with_metric(mut self, metric: Metric) -> Self {
        self.metric = metric;
        self
    }

    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingMode) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn with_max_points_per_cluster(mut self, points: usize) -> Self {
        self.max_points_per_cluster = points;
        self
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn with_stop(mut self, stop: StopFlag) -> Self {
        self.stop = stop;
        self
    }

    /// Number of training points drawn for the top-level k-means
    pub fn sample_size(&self) -> usize {
        self.max_points_per_cluster.saturating_mul(self.lists)
    }

    pub fn validate(&self) -> Result<()> {
        if self.lists == 0 {
            return Err(BenchError::InvalidConfig("lists must be positive".into()));
        }
        if self.child_lists == Some(0) {
            return Err(BenchError::InvalidConfig(
                "child lists must be positive when set".into(),
            ));
        }
        if self.max_points_per_cluster == 0 {
            return Err(BenchError::InvalidConfig(
                "max points per cluster must be positive".into(),
            ));
        }
        if let SamplingMode::Partitioned { chunks: 0 } = self.sampling {
            return Err(BenchError::InvalidConfig(
                "partitioned sampling needs at least one chunk".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration for the chunked bulk loader
#[derive(Debug, Clone)]
pub struct LoadConfig {
    pub chunks: usize,
    pub show_progress: bool,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            chunks: DEFAULT_CHUNKS,
            show_progress: false,
        }
    }
}

impl LoadConfig {
    pub fn with_chunks(mut self, chunks: usize) -> Self {
        self.chunks = chunks;
        self
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }
}

/// Configuration for the build progress monitor
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub poll_interval: Duration,
    /// Give up waiting for the completion signal after this long
    pub timeout: Option<Duration>,
    pub show_progress: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: None,
            show_progress: false,
        }
    }
}

impl MonitorConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }
}

/// What the benchmark orchestrator does when a worker fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Fail the whole run on the first worker error
    #[default]
    AbortAll,
    /// Drop failed workers and report over the survivors
    BestEffort,
}

/// Runtime search parameters applied to every query connection
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchParams {
    pub probes: usize,
    pub epsilon: f32,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            probes: DEFAULT_PROBES,
            epsilon: DEFAULT_EPSILON,
        }
    }
}

/// Configuration for benchmark runs
#[derive(Debug, Clone)]
pub struct BenchConfig {
    pub top_k: usize,
    pub search: SearchParams,
    /// Number of workers replaying the full workload
    pub workers: usize,
    pub policy: FailurePolicy,
    pub show_progress: bool,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            search: SearchParams::default(),
            workers: 1,
            policy: FailurePolicy::AbortAll,
            show_progress: false,
        }
    }
}

impl BenchConfig {
    pub fn with_top_k(mut self, k: usize) -> Self {
        self.top_k = k;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_search(mut self, search: SearchParams) -> Self {
        self.search = search;
        self
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }
}
