//! One- and two-level codebook training over bounded samples.
//!
//! The top level always trains on at most `max_points_per_cluster * lists`
//! vectors regardless of dataset size. With child lists enabled every vector
//! of the full dataset is assigned to its nearest top-level centroid, each
//! cluster gets a training sample proportional to its population, and an
//! independent child k-means runs per cluster.

use rand_xoshiro::rand_core::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use rayon::prelude::*;
use tracing::{info, warn};

use crate::centroids::CentroidSet;
use crate::config::{SamplingMode, TrainConfig};
use crate::dataset::{VectorDataset, BLOCK_ROWS};
use crate::distance::normalize_in_place;
use crate::error::{BenchError, Result};
use crate::kmeans::{assign_all, KMeans};
use crate::progress;
use crate::sampling::{partitioned_sample, reservoir_sample, Reservoir};

/// Top-level label of every dataset vector
#[derive(Debug, Clone)]
pub struct ClusterAssignment {
    pub labels: Vec<u32>,
    pub populations: Vec<usize>,
}

impl ClusterAssignment {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Train a codebook for `dataset` as described by `config`
pub fn train_centroids<D: VectorDataset>(dataset: &D, config: &TrainConfig) -> Result<CentroidSet> {
    config.validate()?;
    let n = dataset.len();
    if n == 0 {
        return Err(BenchError::EmptyDataset);
    }
    if n < config.lists {
        return Err(BenchError::InvalidConfig(format!(
            "dataset has {} vectors, fewer than {} lists",
            n, config.lists
        )));
    }
    if config.gpu {
        warn!("GPU k-means is not available in this build, training on CPU");
    }

    let mut sample = training_sample(dataset, config)?;
    prepare_samples(&mut sample, config);
    info!(
        samples = sample.len(),
        lists = config.lists,
        metric = %config.metric,
        "training top-level k-means"
    );
    let top = KMeans::new(config.lists, config.iterations, config.metric, config.seed)
        .with_stop(config.stop.clone())
        .fit(&sample)?;
    drop(sample);

    let Some(child_lists) = config.child_lists else {
        return CentroidSet::flat(top);
    };

    let assignment = assign_dataset(dataset, &top, config)?;
    let children = train_child_layer(dataset, &assignment, child_lists, config)?;
    let produced: usize = children.iter().map(Vec::len).sum();
    info!(
        lists = config.lists,
        child_lists,
        children = produced,
        "trained child layer"
    );
    CentroidSet::hierarchical(top, children)
}

/// Bounded training sample, or the whole dataset when it is small enough
fn training_sample<D: VectorDataset>(dataset: &D, config: &TrainConfig) -> Result<Vec<Vec<f32>>> {
    let size = config.sample_size();
    if dataset.len() <= size {
        return dataset.rows().collect();
    }
    let sample = match config.sampling {
        SamplingMode::Streaming => {
            let mut rng = Xoshiro256PlusPlus::seed_from_u64(config.seed);
            reservoir_sample(dataset.rows(), size, &mut rng)?
        }
        SamplingMode::Partitioned { chunks } => {
            partitioned_sample(dataset, size, chunks, config.seed)?
        }
    };
    Ok(sample.into_vectors())
}

fn prepare_samples(samples: &mut [Vec<f32>], config: &TrainConfig) {
    if config.metric.normalize_samples() {
        samples.par_iter_mut().for_each(|v| normalize_in_place(v));
    }
}

/// Assign every vector of the dataset to its nearest top-level centroid,
/// streaming the dataset block by block
pub fn assign_dataset<D: VectorDataset>(
    dataset: &D,
    top: &[Vec<f32>],
    config: &TrainConfig,
) -> Result<ClusterAssignment> {
    let n = dataset.len();
    let bar = progress::bar(n as u64, "Assigning labels", config.show_progress);
    let mut labels = Vec::with_capacity(n);
    let mut populations = vec![0usize; top.len()];

    let mut start = 0;
    while start < n {
        config.stop.check()?;
        let end = (start + BLOCK_ROWS).min(n);
        let block = dataset.read_range(start..end)?;
        for label in assign_all(&block, top, config.metric) {
            populations[label] += 1;
            labels.push(label as u32);
        }
        bar.inc((end - start) as u64);
        start = end;
    }
    bar.finish_and_clear();

    Ok(ClusterAssignment {
        labels,
        populations,
    })
}

/// Training sample size for one child cluster.
///
/// Proportional to the cluster's share of the dataset so that child
/// centroids end up with roughly uniform density, never below the child
/// count and never above the population. Empty clusters get nothing.
pub fn child_sample_size(
    population: usize,
    total: usize,
    lists: usize,
    child_lists: usize,
    max_points_per_cluster: usize,
) -> usize {
    if population == 0 || total == 0 {
        return 0;
    }
    let budget = (lists * child_lists * max_points_per_cluster) as f64;
    let proportional = (population as f64 / total as f64 * budget).ceil() as usize;
    proportional.max(child_lists).min(population)
}

/// Train the child centroids of every top-level cluster.
///
/// One pass over the dataset feeds a reservoir per cluster. A cluster with
/// fewer vectors than `child_lists` gets one child per vector; an empty
/// cluster gets none.
pub fn train_child_layer<D: VectorDataset>(
    dataset: &D,
    assignment: &ClusterAssignment,
    child_lists: usize,
    config: &TrainConfig,
) -> Result<Vec<Vec<Vec<f32>>>> {
    if assignment.len() != dataset.len() {
        return Err(BenchError::InvalidConfig(format!(
            "{} labels for {} vectors",
            assignment.len(),
            dataset.len()
        )));
    }
    let total = dataset.len();
    let lists = assignment.populations.len();

    let mut reservoirs: Vec<Reservoir<Vec<f32>>> = assignment
        .populations
        .iter()
        .map(|&pop| {
            Reservoir::new(child_sample_size(
                pop,
                total,
                lists,
                child_lists,
                config.max_points_per_cluster,
            ))
        })
        .collect();

    let mut rng = Xoshiro256PlusPlus::seed_from_u64(config.seed ^ 0x9E37_79B9_7F4A_7C15);
    for (row, &label) in dataset.rows().zip(&assignment.labels) {
        reservoirs[label as usize].offer(row?, &mut rng);
    }

    let empty = assignment.populations.iter().filter(|&&p| p == 0).count();
    if empty > 0 {
        warn!(empty, "top-level clusters without vectors get no children");
    }

    let bar = progress::bar(lists as u64, "Training child k-means", config.show_progress);
    let children = reservoirs
        .into_par_iter()
        .enumerate()
        .map(|(cluster, reservoir)| {
            let mut samples = reservoir.into_items();
            let result = if samples.is_empty() {
                Ok(Vec::new())
            } else {
                prepare_samples(&mut samples, config);
                let k = child_lists.min(samples.len());
                let seed = config.seed.wrapping_add(cluster as u64 + 1);
                KMeans::new(k, config.iterations, config.metric, seed)
                    .with_stop(config.stop.clone())
                    .fit(&samples)
            };
            bar.inc(1);
            result
        })
        .collect::<Result<Vec<_>>>()?;
    bar.finish_and_clear();

    Ok(children)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Metric, StopFlag};
    use crate::dataset::MemoryDataset;
    use crate::distance::{mean, norm};
    use rand::Rng;

    fn clustered(per_cluster: usize, centers: &[[f32; 2]], seed: u64) -> MemoryDataset {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        let mut rows = Vec::new();
        for c in centers {
            for _ in 0..per_cluster {
                rows.push(vec![
                    c[0] + rng.gen_range(-1.0..1.0),
                    c[1] + rng.gen_range(-1.0..1.0),
                ]);
            }
        }
        MemoryDataset::new(rows).unwrap()
    }

    const CORNERS: [[f32; 2]; 4] = [[0.0, 0.0], [50.0, 0.0], [0.0, 50.0], [50.0, 50.0]];

    #[test]
    fn test_single_level_training() {
        let ds = clustered(200, &CORNERS, 1);
        let config = TrainConfig::default().with_lists(4).with_iterations(10);
        let set = train_centroids(&ds, &config).unwrap();
        assert_eq!(set.len(), 4);
        assert!(!set.is_tree());
    }

    #[test]
    fn test_sample_is_bounded_by_policy() {
        let ds = clustered(500, &CORNERS, 2);
        let config = TrainConfig::default()
            .with_lists(4)
            .with_max_points_per_cluster(16);
        assert_eq!(training_sample(&ds, &config).unwrap().len(), 64);

        let partitioned = config
            .clone()
            .with_sampling(SamplingMode::Partitioned { chunks: 3 });
        assert_eq!(training_sample(&ds, &partitioned).unwrap().len(), 64);
    }

    #[test]
    fn test_two_level_counts_and_root() {
        let ds = clustered(300, &CORNERS, 3);
        let config = TrainConfig::default()
            .with_lists(4)
            .with_child_lists(Some(3))
            .with_iterations(8)
            .with_max_points_per_cluster(32);
        let set = train_centroids(&ds, &config).unwrap();

        // root + K + K * K2
        assert_eq!(set.len(), 1 + 4 + 12);
        let top: Vec<Vec<f32>> = set.children_of(0).map(|n| n.vector.clone()).collect();
        assert_eq!(top.len(), 4);
        let child_total: usize = (1..=4).map(|id| set.children_of(id).count()).sum();
        assert_eq!(child_total, 12);

        let root = set.root().unwrap();
        let expected = mean(&top, 2);
        for (a, b) in root.vector.iter().zip(&expected) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn test_empty_cluster_gets_no_children() {
        let ds = clustered(50, &CORNERS[..2], 4);
        let assignment = ClusterAssignment {
            labels: (0..100).map(|i| if i < 50 { 0 } else { 1 }).collect(),
            populations: vec![50, 50, 0],
        };
        let config = TrainConfig::default().with_iterations(3);
        let children = train_child_layer(&ds, &assignment, 4, &config).unwrap();
        assert_eq!(children.len(), 3);
        assert_eq!(children[0].len(), 4);
        assert_eq!(children[1].len(), 4);
        assert!(children[2].is_empty());
        assert!(children.iter().flatten().flatten().all(|x| x.is_finite()));
    }

    #[test]
    fn test_child_sample_size() {
        assert_eq!(child_sample_size(0, 1000, 4, 3, 256), 0);
        // Uniform share: K2 * 256 per cluster, capped by population
        assert_eq!(child_sample_size(250, 1000, 4, 3, 256), 250);
        assert_eq!(child_sample_size(250_000, 1_000_000, 4, 3, 256), 768);
        // Tiny cluster still gets at least K2 points when it has them
        assert_eq!(child_sample_size(5, 1_000_000, 4, 3, 1), 3);
        assert_eq!(child_sample_size(2, 1_000_000, 4, 3, 1), 2);
    }

    #[test]
    fn test_cosine_training_yields_unit_centroids() {
        let ds = clustered(100, &[[10.0, 1.0], [1.0, 10.0]], 5);
        let config = TrainConfig::default()
            .with_lists(2)
            .with_metric(Metric::Cos)
            .with_iterations(5);
        let set = train_centroids(&ds, &config).unwrap();
        for node in set.nodes() {
            assert!((norm(&node.vector) - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_stopped_training_is_cancelled() {
        let ds = clustered(50, &CORNERS, 8);
        let stop = StopFlag::default();
        stop.stop();
        let config = TrainConfig::default()
            .with_lists(4)
            .with_child_lists(Some(2))
            .with_stop(stop);
        assert!(matches!(
            train_centroids(&ds, &config),
            Err(BenchError::Cancelled)
        ));
    }

    #[test]
    fn test_rejects_too_few_vectors() {
        let ds = clustered(1, &CORNERS[..2], 6);
        let config = TrainConfig::default().with_lists(3);
        assert!(matches!(
            train_centroids(&ds, &config),
            Err(BenchError::InvalidConfig(_))
        ));
    }
}
