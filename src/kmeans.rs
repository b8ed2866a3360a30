//! Lloyd k-means with a fixed iteration budget.

use rand::Rng;
use rand_xoshiro::rand_core::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use rayon::prelude::*;
use tracing::debug;

use crate::config::{Metric, StopFlag};
use crate::distance::{l2_distance_sq, normalize_in_place};
use crate::error::{BenchError, Result};

/// Relative nudge applied when an empty cluster takes over half of another
const SPLIT_DELTA: f32 = 1.0 / 1024.0;

/// Seeded k-means trainer
#[derive(Debug, Clone)]
pub struct KMeans {
    k: usize,
    iterations: usize,
    metric: Metric,
    seed: u64,
    stop: StopFlag,
}

impl KMeans {
    pub fn new(k: usize, iterations: usize, metric: Metric, seed: u64) -> Self {
        Self {
            k,
            iterations,
            metric,
            seed,
            stop: StopFlag::default(),
        }
    }

    /// Abandon training with `Cancelled` once `stop` is raised
    pub fn with_stop(mut self, stop: StopFlag) -> Self {
        self.stop = stop;
        self
    }

    /// Train `k` centroids on `samples`.
    ///
    /// Always runs the full iteration budget. Spherical metrics re-project
    /// every centroid onto the unit sphere after each update.
    pub fn fit(&self, samples: &[Vec<f32>]) -> Result<Vec<Vec<f32>>> {
        let n = samples.len();
        if n == 0 {
            return Err(BenchError::EmptyDataset);
        }
        if self.k == 0 || n < self.k {
            return Err(BenchError::InvalidConfig(format!(
                "cannot train {} centroids from {} samples",
                self.k, n
            )));
        }
        let dims = samples[0].len();
        let spherical = self.metric.spherical_centroids();
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(self.seed);

        let mut centroids = if n == self.k {
            samples.to_vec()
        } else {
            seed_plus_plus(samples, self.k, &mut rng)
        };
        if spherical {
            centroids.iter_mut().for_each(|c| normalize_in_place(c));
        }
        if n == self.k {
            return Ok(centroids);
        }

        let mut labels = assign_all(samples, &centroids, self.metric);
        for iteration in 0..self.iterations {
            self.stop.check()?;
            centroids = self.update(samples, &labels, dims, &mut rng);
            if spherical {
                centroids.par_iter_mut().for_each(|c| normalize_in_place(c));
            }

            let next = assign_all(samples, &centroids, self.metric);
            let moved = labels.iter().zip(&next).filter(|(a, b)| a != b).count();
            labels = next;
            debug!(iteration, moved, k = self.k, "k-means iteration");
        }

        Ok(centroids)
    }

    /// Recompute means; clusters left empty take over half of a populous one.
    fn update(
        &self,
        samples: &[Vec<f32>],
        labels: &[usize],
        dims: usize,
        rng: &mut Xoshiro256PlusPlus,
    ) -> Vec<Vec<f32>> {
        let k = self.k;
        let n = samples.len();
        let mut sums = vec![vec![0.0f32; dims]; k];
        let mut counts = vec![0.0f32; k];

        for (v, &label) in samples.iter().zip(labels) {
            for (s, &x) in sums[label].iter_mut().zip(v.iter()) {
                *s += x;
            }
            counts[label] += 1.0;
        }

        let mut centroids: Vec<Vec<f32>> = sums
            .into_iter()
            .zip(&counts)
            .map(|(mut sum, &count)| {
                if count > 0.0 {
                    sum.iter_mut().for_each(|s| *s /= count);
                }
                sum
            })
            .collect();

        for i in 0..k {
            if counts[i] != 0.0 {
                continue;
            }
            // Walk the clusters until one is picked with probability
            // proportional to its surplus population.
            let mut o = 0;
            loop {
                let alpha = rng.gen_range(0.0..1.0f32);
                let beta = (counts[o] - 1.0) / (n - k) as f32;
                if alpha < beta {
                    break;
                }
                o = (o + 1) % k;
            }
            centroids[i] = centroids[o].clone();
            perturb(&mut centroids[i], 1.0 + SPLIT_DELTA, 1.0 - SPLIT_DELTA);
            perturb(&mut centroids[o], 1.0 - SPLIT_DELTA, 1.0 + SPLIT_DELTA);
            counts[i] = counts[o] / 2.0;
            counts[o] -= counts[i];
        }

        centroids
    }
}

/// k-means++ seeding: first centroid uniform, each next one drawn with
/// probability proportional to its squared distance from the chosen set.
fn seed_plus_plus(samples: &[Vec<f32>], k: usize, rng: &mut Xoshiro256PlusPlus) -> Vec<Vec<f32>> {
    let n = samples.len();
    let mut centroids = Vec::with_capacity(k);
    centroids.push(samples[rng.gen_range(0..n)].clone());

    let mut min_dist: Vec<f32> = samples
        .par_iter()
        .map(|v| l2_distance_sq(v, &centroids[0]))
        .collect();

    while centroids.len() < k {
        let total: f64 = min_dist.iter().map(|&d| d as f64).sum();
        let next = if total > 0.0 {
            let threshold = rng.gen::<f64>() * total;
            let mut cumsum = 0.0;
            let mut picked = n - 1;
            for (i, &d) in min_dist.iter().enumerate() {
                cumsum += d as f64;
                if cumsum >= threshold && d > 0.0 {
                    picked = i;
                    break;
                }
            }
            picked
        } else {
            rng.gen_range(0..n)
        };

        let chosen = samples[next].clone();
        min_dist
            .par_iter_mut()
            .zip(samples.par_iter())
            .for_each(|(d, v)| *d = d.min(l2_distance_sq(v, &chosen)));
        centroids.push(chosen);
    }

    centroids
}

/// Scale even dimensions by `even` and odd dimensions by `odd`
fn perturb(v: &mut [f32], even: f32, odd: f32) {
    for (i, x) in v.iter_mut().enumerate() {
        *x *= if i % 2 == 0 { even } else { odd };
    }
}

/// Exhaustive nearest-centroid lookup
pub fn nearest_centroid(vector: &[f32], centroids: &[Vec<f32>], metric: Metric) -> usize {
    let mut best = (f32::INFINITY, 0);
    for (i, c) in centroids.iter().enumerate() {
        let score = metric.assignment_score(vector, c);
        if score < best.0 {
            best = (score, i);
        }
    }
    best.1
}

/// Nearest-centroid label for every vector, computed in parallel
pub fn assign_all(vectors: &[Vec<f32>], centroids: &[Vec<f32>], metric: Metric) -> Vec<usize> {
    vectors
        .par_iter()
        .map(|v| nearest_centroid(v, centroids, metric))
        .collect()
}
