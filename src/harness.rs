//! Recall, throughput and latency measurement against a query endpoint.
//!
//! In parallel mode every worker replays the whole workload on its own
//! connection. Per-query intervals are recorded against one shared epoch and
//! throughput is computed over the union of those intervals, so overlapping
//! workers are not double counted.

use std::collections::HashSet;
use std::fmt;
use std::time::{Duration, Instant};

use rayon::ThreadPoolBuilder;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{BenchConfig, FailurePolicy};
use crate::engine::{Connector, QueryEndpoint};
use crate::error::{BenchError, Result};
use crate::progress;

/// Queries between refreshes of the running metrics line
const REFRESH_EVERY: usize = 100;

/// One query: hit count and its interval relative to the run epoch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueryResult {
    pub hits: usize,
    pub start: Duration,
    pub end: Duration,
}

impl QueryResult {
    pub fn latency(&self) -> Duration {
        self.end.saturating_sub(self.start)
    }
}

/// How total elapsed time is derived from per-query results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeAccounting {
    /// Sum of latencies; only valid for a single sequential worker
    Sum,
    /// Length of the union of all query intervals
    Coverage,
}

/// Total length covered by a set of `[start, end)` intervals.
///
/// Intervals are sorted by start, then overlapping or touching ones are
/// merged before summing.
pub fn coverage(intervals: &[(Duration, Duration)]) -> Duration {
    let mut sorted = intervals.to_vec();
    sorted.sort_by_key(|&(start, _)| start);

    let mut iter = sorted.into_iter();
    let Some((mut start, mut end)) = iter.next() else {
        return Duration::ZERO;
    };
    let mut total = Duration::ZERO;
    for (next_start, next_end) in iter {
        if next_start <= end {
            end = end.max(next_end);
        } else {
            total += end.saturating_sub(start);
            start = next_start;
            end = next_end;
        }
    }
    total + end.saturating_sub(start)
}

/// Percentile of ascending `sorted` values with linear interpolation
/// between closest ranks
pub fn percentile(sorted: &[f64], pct: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = (pct / 100.0).clamp(0.0, 1.0) * (n - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
        }
    }
}

/// Size of the intersection of the first `k` results and the first `k`
/// ground-truth ids
pub fn recall_hits(result: &[u64], truth: &[u32], k: usize) -> usize {
    let truth: HashSet<u64> = truth.iter().take(k).map(|&id| u64::from(id)).collect();
    let result: HashSet<u64> = result.iter().take(k).copied().collect();
    result.intersection(&truth).count()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkReport {
    pub top_k: usize,
    pub recall: f64,
    pub qps: f64,
    pub p50_ms: f64,
    pub p99_ms: f64,
    /// Queries per worker
    pub queries: usize,
    /// Workers whose results are included
    pub workers: usize,
    pub failed_workers: usize,
    pub elapsed_secs: f64,
}

impl fmt::Display for BenchmarkReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Top: {}", self.top_k)?;
        writeln!(f, "  Recall: {:.4}", self.recall)?;
        writeln!(f, "  QPS: {:.2}", self.qps)?;
        writeln!(f, "  P50 latency: {:.2}ms", self.p50_ms)?;
        write!(f, "  P99 latency: {:.2}ms", self.p99_ms)?;
        if self.failed_workers > 0 {
            write!(
                f,
                "\n  Workers: {} ({} failed)",
                self.workers, self.failed_workers
            )?;
        }
        Ok(())
    }
}

/// Aggregate per-query results of `workers` workers replaying `queries`
/// queries each
pub fn compute_report(
    results: &[QueryResult],
    top_k: usize,
    queries: usize,
    workers: usize,
    failed_workers: usize,
    accounting: TimeAccounting,
) -> BenchmarkReport {
    let elapsed = match accounting {
        TimeAccounting::Sum => results.iter().map(QueryResult::latency).sum(),
        TimeAccounting::Coverage => {
            let intervals: Vec<(Duration, Duration)> =
                results.iter().map(|r| (r.start, r.end)).collect();
            coverage(&intervals)
        }
    };
    let total_queries = queries * workers;
    let total_hits: usize = results.iter().map(|r| r.hits).sum();

    let recall = if total_queries == 0 || top_k == 0 {
        0.0
    } else {
        total_hits as f64 / (top_k * total_queries) as f64
    };
    let elapsed_secs = elapsed.as_secs_f64();
    let qps = if elapsed_secs > 0.0 {
        total_queries as f64 / elapsed_secs
    } else {
        0.0
    };

    let mut latencies: Vec<f64> = results
        .iter()
        .map(|r| r.latency().as_secs_f64() * 1000.0)
        .collect();
    latencies.sort_by(f64::total_cmp);

    BenchmarkReport {
        top_k,
        recall,
        qps,
        p50_ms: percentile(&latencies, 50.0),
        p99_ms: percentile(&latencies, 99.0),
        queries,
        workers,
        failed_workers,
        elapsed_secs,
    }
}

/// Queries with the ids of their true nearest neighbors
#[derive(Debug, Clone, Copy)]
pub struct Workload<'a> {
    queries: &'a [Vec<f32>],
    ground_truth: &'a [Vec<u32>],
}

impl<'a> Workload<'a> {
    pub fn new(queries: &'a [Vec<f32>], ground_truth: &'a [Vec<u32>]) -> Result<Self> {
        if queries.is_empty() {
            return Err(BenchError::EmptyDataset);
        }
        if queries.len() != ground_truth.len() {
            return Err(BenchError::InvalidConfig(format!(
                "{} queries but {} ground-truth rows",
                queries.len(),
                ground_truth.len()
            )));
        }
        Ok(Self {
            queries,
            ground_truth,
        })
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}

fn check_top_k(config: &BenchConfig) -> Result<()> {
    if config.top_k == 0 {
        return Err(BenchError::InvalidConfig("top-k must be at least 1".into()));
    }
    Ok(())
}

/// Issue every query once, in order, on one endpoint
pub fn run_sequential<E: QueryEndpoint>(
    endpoint: &mut E,
    workload: Workload<'_>,
    config: &BenchConfig,
) -> Result<BenchmarkReport> {
    check_top_k(config)?;
    let k = config.top_k;
    let bar = progress::bar(workload.len() as u64, "Benchmark", config.show_progress);
    let epoch = Instant::now();
    let mut results = Vec::with_capacity(workload.len());

    for (i, (query, truth)) in workload
        .queries
        .iter()
        .zip(workload.ground_truth)
        .enumerate()
    {
        let start = epoch.elapsed();
        let ids = endpoint.search(query, k)?;
        let end = epoch.elapsed();
        results.push(QueryResult {
            hits: recall_hits(&ids, truth, k),
            start,
            end,
        });

        bar.inc(1);
        if (i + 1) % REFRESH_EVERY == 0 {
            let running = compute_report(&results, k, i + 1, 1, 0, TimeAccounting::Sum);
            bar.set_message(format!(
                "recall: {:.4} QPS: {:.2} P50: {:.2}ms",
                running.recall, running.qps, running.p50_ms
            ));
        }
    }
    bar.finish_and_clear();

    let report = compute_report(&results, k, workload.len(), 1, 0, TimeAccounting::Sum);
    info!(recall = report.recall, qps = report.qps, "sequential benchmark finished");
    Ok(report)
}

fn run_worker<E: QueryEndpoint>(
    endpoint: &mut E,
    workload: Workload<'_>,
    k: usize,
    epoch: Instant,
    bar: &indicatif::ProgressBar,
) -> Result<Vec<QueryResult>> {
    let mut results = Vec::with_capacity(workload.len());
    for (query, truth) in workload.queries.iter().zip(workload.ground_truth) {
        let start = epoch.elapsed();
        let ids = endpoint.search(query, k)?;
        let end = epoch.elapsed();
        results.push(QueryResult {
            hits: recall_hits(&ids, truth, k),
            start,
            end,
        });
        bar.inc(1);
    }
    Ok(results)
}

/// Replay the whole workload on `config.workers` concurrent workers, each
/// on its own connection and its own pool thread
pub fn run_parallel<C: Connector>(
    connector: &C,
    workload: Workload<'_>,
    config: &BenchConfig,
) -> Result<BenchmarkReport> {
    check_top_k(config)?;
    let workers = config.workers;
    if workers == 0 {
        return Err(BenchError::InvalidConfig("at least one worker is required".into()));
    }
    let k = config.top_k;
    let pool = ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("bench-worker-{}", i))
        .build()
        .map_err(|e| BenchError::InvalidConfig(e.to_string()))?;

    let bar = progress::bar(
        (workload.len() * workers) as u64,
        "Benchmark",
        config.show_progress,
    );
    let epoch = Instant::now();
    let outcomes: Vec<Result<Vec<QueryResult>>> = pool.broadcast(|_| {
        let mut endpoint = connector.connect()?;
        run_worker(&mut endpoint, workload, k, epoch, &bar)
    });
    bar.finish_and_clear();

    let mut results = Vec::with_capacity(workload.len() * workers);
    let mut survivors = 0;
    let mut failures = Vec::new();
    for (worker, outcome) in outcomes.into_iter().enumerate() {
        match outcome {
            Ok(worker_results) => {
                survivors += 1;
                results.extend(worker_results);
            }
            Err(e) => failures.push(BenchError::WorkerFailed {
                worker,
                message: e.to_string(),
            }),
        }
    }

    if !failures.is_empty() {
        match config.policy {
            FailurePolicy::AbortAll => return Err(failures.swap_remove(0)),
            FailurePolicy::BestEffort => {
                for failure in &failures {
                    warn!(error = %failure, "dropping failed worker");
                }
                if survivors == 0 {
                    return Err(BenchError::WorkerFailed {
                        worker: 0,
                        message: format!("all {} workers failed; first: {}", workers, failures[0]),
                    });
                }
            }
        }
    }

    let report = compute_report(
        &results,
        k,
        workload.len(),
        survivors,
        failures.len(),
        TimeAccounting::Coverage,
    );
    info!(
        workers = survivors,
        failed = failures.len(),
        recall = report.recall,
        qps = report.qps,
        "parallel benchmark finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    fn intervals(pairs: &[(f64, f64)]) -> Vec<(Duration, Duration)> {
        pairs.iter().map(|&(a, b)| (secs(a), secs(b))).collect()
    }

    #[test]
    fn test_coverage() {
        assert_eq!(coverage(&intervals(&[(0.0, 2.0), (1.0, 3.0), (5.0, 6.0)])), secs(4.0));
        assert_eq!(coverage(&intervals(&[(0.0, 1.0), (2.0, 3.0)])), secs(2.0));
        assert_eq!(coverage(&intervals(&[(0.0, 10.0), (2.0, 3.0)])), secs(10.0));
        // Unsorted input and touching intervals
        assert_eq!(coverage(&intervals(&[(5.0, 6.0), (0.0, 1.0), (1.0, 2.0)])), secs(3.0));
        assert_eq!(coverage(&[]), Duration::ZERO);
    }

    #[test]
    fn test_percentile_interpolates() {
        let values = [1.0, 2.0, 3.0, 4.0];
        assert!((percentile(&values, 50.0) - 2.5).abs() < 1e-12);
        assert!((percentile(&values, 99.0) - 3.97).abs() < 1e-12);
        assert_eq!(percentile(&values, 0.0), 1.0);
        assert_eq!(percentile(&values, 100.0), 4.0);
        assert_eq!(percentile(&[7.0], 99.0), 7.0);
    }

    #[test]
    fn test_recall_hits_ignores_order() {
        assert_eq!(recall_hits(&[3, 1, 2], &[1, 2, 3], 3), 3);
        assert_eq!(recall_hits(&[9, 1], &[1, 2], 2), 1);
        // Only the first k ground-truth ids count
        assert_eq!(recall_hits(&[5], &[1, 5], 1), 0);
    }

    #[test]
    fn test_single_worker_qps() {
        // Four back-to-back queries of half a second each
        let results: Vec<QueryResult> = (0..4)
            .map(|i| QueryResult {
                hits: 10,
                start: secs(i as f64 * 0.5),
                end: secs((i + 1) as f64 * 0.5),
            })
            .collect();
        for accounting in [TimeAccounting::Sum, TimeAccounting::Coverage] {
            let report = compute_report(&results, 10, 4, 1, 0, accounting);
            assert!((report.qps - 2.0).abs() < 1e-9);
            assert!((report.recall - 1.0).abs() < 1e-12);
            assert!((report.p50_ms - 500.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_overlapping_workers_not_double_counted() {
        // Two workers running the same two queries at the same time
        let query = |start: f64, end: f64| QueryResult {
            hits: 5,
            start: secs(start),
            end: secs(end),
        };
        let results = vec![
            query(0.0, 1.0),
            query(1.0, 2.0),
            query(0.0, 1.0),
            query(1.0, 2.0),
        ];
        let report = compute_report(&results, 10, 2, 2, 0, TimeAccounting::Coverage);
        assert!((report.qps - 2.0).abs() < 1e-9);
        assert!((report.recall - 0.5).abs() < 1e-12);
        assert!((report.elapsed_secs - 2.0).abs() < 1e-9);
    }

    /// Answers every query with its exact ground truth
    struct ExactEndpoint {
        truth: Vec<Vec<u32>>,
    }

    impl QueryEndpoint for ExactEndpoint {
        fn search(&mut self, query: &[f32], k: usize) -> Result<Vec<u64>> {
            let row = &self.truth[query[0] as usize];
            Ok(row.iter().rev().take(k).map(|&id| u64::from(id)).collect())
        }
    }

    struct ExactConnector {
        truth: Vec<Vec<u32>>,
        connects: AtomicUsize,
        fail_on: Option<usize>,
    }

    impl Connector for ExactConnector {
        type Endpoint = ExactEndpoint;

        fn connect(&self) -> Result<ExactEndpoint> {
            let n = self.connects.fetch_add(1, Ordering::SeqCst);
            if Some(n) == self.fail_on {
                return Err(BenchError::Transport("connection refused".into()));
            }
            Ok(ExactEndpoint {
                truth: self.truth.clone(),
            })
        }
    }

    fn workload_data(m: usize) -> (Vec<Vec<f32>>, Vec<Vec<u32>>) {
        let queries = (0..m).map(|i| vec![i as f32, 0.0]).collect();
        let truth = (0..m)
            .map(|i| (0..10).map(|j| (i * 10 + j) as u32).collect())
            .collect();
        (queries, truth)
    }

    fn connector(truth: &[Vec<u32>], fail_on: Option<usize>) -> ExactConnector {
        ExactConnector {
            truth: truth.to_vec(),
            connects: AtomicUsize::new(0),
            fail_on,
        }
    }

    #[test]
    fn test_sequential_exact_recall() {
        let (queries, truth) = workload_data(250);
        let workload = Workload::new(&queries, &truth).unwrap();
        let mut endpoint = ExactEndpoint {
            truth: truth.clone(),
        };
        let report = run_sequential(&mut endpoint, workload, &BenchConfig::default()).unwrap();
        assert_eq!(report.queries, 250);
        assert_eq!(report.workers, 1);
        assert!((report.recall - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_parallel_exact_recall() {
        let (queries, truth) = workload_data(50);
        let workload = Workload::new(&queries, &truth).unwrap();
        let connector = connector(&truth, None);
        let config = BenchConfig::default().with_workers(4);

        let report = run_parallel(&connector, workload, &config).unwrap();
        assert_eq!(report.workers, 4);
        assert_eq!(report.failed_workers, 0);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 4);
        assert!((report.recall - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_abort_all_policy() {
        let (queries, truth) = workload_data(20);
        let workload = Workload::new(&queries, &truth).unwrap();
        let config = BenchConfig::default().with_workers(3);
        let result = run_parallel(&connector(&truth, Some(1)), workload, &config);
        assert!(matches!(result, Err(BenchError::WorkerFailed { .. })));
    }

    #[test]
    fn test_best_effort_policy() {
        let (queries, truth) = workload_data(20);
        let workload = Workload::new(&queries, &truth).unwrap();
        let config = BenchConfig::default()
            .with_workers(3)
            .with_policy(FailurePolicy::BestEffort);

        let report = run_parallel(&connector(&truth, Some(0)), workload, &config).unwrap();
        assert_eq!(report.workers, 2);
        assert_eq!(report.failed_workers, 1);
        assert!((report.recall - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_workload_validation() {
        let (queries, truth) = workload_data(3);
        assert!(Workload::new(&queries, &truth[..2]).is_err());
        assert!(matches!(Workload::new(&[], &[]), Err(BenchError::EmptyDataset)));
        let workload = Workload::new(&queries, &truth).unwrap();
        let mut endpoint = ExactEndpoint {
            truth: truth.clone(),
        };
        let config = BenchConfig::default().with_top_k(0);
        assert!(run_sequential(&mut endpoint, workload, &config).is_err());
    }
}
