//! Bounded uniform sampling from datasets that may not fit in memory.
//!
//! Two routes to the same distribution (a uniform size-k subset drawn without
//! replacement):
//! - [`reservoir_sample`]: one sequential pass, Algorithm R, O(k) memory.
//! - [`partitioned_sample`]: draw the index subset up front, then let rayon
//!   workers fill disjoint slices of a pre-sized buffer.

use std::ops::Range;

use rand::Rng;
use rand_xoshiro::rand_core::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use rayon::prelude::*;
use tracing::debug;

use crate::dataset::{VectorDataset, BLOCK_ROWS};
use crate::error::{BenchError, Result};

/// A bounded sample: ascending dataset positions and their vectors
#[derive(Debug, Clone, Default)]
pub struct Sample {
    pub positions: Vec<usize>,
    pub vectors: Vec<Vec<f32>>,
}

impl Sample {
    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn into_vectors(self) -> Vec<Vec<f32>> {
        self.vectors
    }
}

/// Incremental Algorithm R reservoir
#[derive(Debug, Clone)]
pub struct Reservoir<T> {
    capacity: usize,
    seen: usize,
    items: Vec<T>,
}

impl<T> Reservoir<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            seen: 0,
            items: Vec::with_capacity(capacity.min(BLOCK_ROWS)),
        }
    }

    /// Offer the next stream element.
    ///
    /// The first `capacity` elements fill the reservoir; the i-th element
    /// (1-indexed) after that replaces slot j when j, drawn uniformly from
    /// [0, i), falls inside the reservoir.
    pub fn offer<R: Rng + ?Sized>(&mut self, item: T, rng: &mut R) {
        self.seen += 1;
        if self.items.len() < self.capacity {
            self.items.push(item);
            return;
        }
        let j = rng.gen_range(0..self.seen);
        if j < self.capacity {
            self.items[j] = item;
        }
    }

    /// Number of elements offered so far
    pub fn seen(&self) -> usize {
        self.seen
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn into_items(self) -> Vec<T> {
        self.items
    }
}

/// Sequential reservoir sample of `k` vectors from a fallible stream.
///
/// A stream shorter than `k` yields all of its elements; an empty stream is
/// an error.
pub fn reservoir_sample<I, R>(iter: I, k: usize, rng: &mut R) -> Result<Sample>
where
    I: IntoIterator<Item = Result<Vec<f32>>>,
    R: Rng + ?Sized,
{
    if k == 0 {
        return Err(BenchError::InvalidConfig("sample size must be positive".into()));
    }

    let mut reservoir = Reservoir::new(k);
    for (position, row) in iter.into_iter().enumerate() {
        reservoir.offer((position, row?), rng);
    }

    if reservoir.seen() == 0 {
        return Err(BenchError::EmptyDataset);
    }
    if reservoir.seen() < k {
        debug!(requested = k, available = reservoir.seen(), "sample truncated to stream length");
    }

    let mut items = reservoir.into_items();
    items.sort_unstable_by_key(|(position, _)| *position);
    let (positions, vectors) = items.into_iter().unzip();
    Ok(Sample { positions, vectors })
}

/// Split `total` items into `parts` contiguous ranges whose lengths differ by at
/// most one. Range starts are exact prefix sums of the lengths.
pub fn split_even(total: usize, parts: usize) -> Vec<Range<usize>> {
    let parts = parts.clamp(1, total.max(1));
    let per_part = total / parts;
    let remainder = total % parts;

    (0..parts)
        .map(|idx| {
            let start = idx * per_part + idx.min(remainder);
            let count = per_part + usize::from(idx < remainder);
            start..start + count
        })
        .filter(|r| !r.is_empty())
        .collect()
}

/// Parallel sample of `k` vectors from a random-access dataset.
///
/// One uniform k-subset of row indices is drawn with a seeded generator and
/// sorted, then split into `chunks` contiguous ranges. Each rayon worker
/// reads the rows of its range block by block and writes them into its own
/// slice of a buffer sized for the whole sample before any worker starts.
pub fn partitioned_sample<D: VectorDataset>(
    dataset: &D,
    k: usize,
    chunks: usize,
    seed: u64,
) -> Result<Sample> {
    let n = dataset.len();
    let dims = dataset.dims();
    if n == 0 {
        return Err(BenchError::EmptyDataset);
    }
    if k == 0 || chunks == 0 {
        return Err(BenchError::InvalidConfig(
            "sample size and chunk count must be positive".into(),
        ));
    }
    if dims == 0 {
        return Err(BenchError::InvalidConfig("dataset has zero dimensions".into()));
    }
    let k = if k > n {
        debug!(requested = k, available = n, "sample truncated to dataset length");
        n
    } else {
        k
    };

    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    let mut positions = rand::seq::index::sample(&mut rng, n, k).into_vec();
    positions.sort_unstable();

    let ranges = split_even(k, chunks);
    let mut buffer = vec![0.0f32; k * dims];

    // Carve the buffer into disjoint slices at the prefix-sum offsets.
    let mut slices: Vec<&mut [f32]> = Vec::with_capacity(ranges.len());
    let mut rest = buffer.as_mut_slice();
    for range in &ranges {
        let (head, tail) = rest.split_at_mut(range.len() * dims);
        slices.push(head);
        rest = tail;
    }
    debug_assert!(rest.is_empty());

    ranges
        .par_iter()
        .zip(slices.into_par_iter())
        .try_for_each(|(range, out)| fill_chunk(dataset, &positions[range.clone()], out))?;

    let vectors = buffer.chunks_exact(dims).map(|v| v.to_vec()).collect();
    Ok(Sample { positions, vectors })
}

/// Copy the rows at sorted `positions` into `out`, one dataset block at a time.
fn fill_chunk<D: VectorDataset>(dataset: &D, positions: &[usize], out: &mut [f32]) -> Result<()> {
    let dims = dataset.dims();
    let mut cursor = 0;
    while cursor < positions.len() {
        let block_start = positions[cursor];
        let block_end = (block_start + BLOCK_ROWS).min(dataset.len());
        let block = dataset.read_range(block_start..block_end)?;

        while cursor < positions.len() && positions[cursor] < block_end {
            let row = &block[positions[cursor] - block_start];
            out[cursor * dims..(cursor + 1) * dims].copy_from_slice(row);
            cursor += 1;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::MemoryDataset;

    fn scalar_dataset(n: usize) -> MemoryDataset {
        MemoryDataset::new((0..n).map(|i| vec![i as f32, -(i as f32)]).collect()).unwrap()
    }

    #[test]
    fn test_reservoir_returns_exactly_k() {
        let ds = scalar_dataset(500);
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(7);
        for k in [1, 10, 250, 500] {
            let sample = reservoir_sample(ds.rows(), k, &mut rng).unwrap();
            assert_eq!(sample.len(), k);
            let mut dedup = sample.positions.clone();
            dedup.dedup();
            assert_eq!(dedup.len(), k, "positions must be distinct");
            for (pos, v) in sample.positions.iter().zip(&sample.vectors) {
                assert_eq!(v[0], *pos as f32);
            }
        }
    }

    #[test]
    fn test_reservoir_truncates_when_k_exceeds_n() {
        let ds = scalar_dataset(5);
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);
        let sample = reservoir_sample(ds.rows(), 50, &mut rng).unwrap();
        assert_eq!(sample.positions, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_empty_input_is_an_error() {
        let ds = MemoryDataset::new(Vec::new()).unwrap();
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);
        assert!(matches!(
            reservoir_sample(ds.rows(), 3, &mut rng),
            Err(BenchError::EmptyDataset)
        ));
        assert!(matches!(
            partitioned_sample(&ds, 3, 2, 1),
            Err(BenchError::EmptyDataset)
        ));
    }

    /// Chi-square test of inclusion frequency: N = 20, k = 5, 20k trials.
    /// 19 degrees of freedom; 43.8 is the 0.001 critical value.
    #[test]
    fn test_reservoir_uniform_inclusion() {
        let n = 20;
        let k = 5;
        let trials = 20_000;
        let mut counts = vec![0usize; n];
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(42);

        for _ in 0..trials {
            let mut reservoir = Reservoir::new(k);
            for i in 0..n {
                reservoir.offer(i, &mut rng);
            }
            for i in reservoir.into_items() {
                counts[i] += 1;
            }
        }

        let expected = (trials * k) as f64 / n as f64;
        let chi_square: f64 = counts
            .iter()
            .map(|&c| {
                let d = c as f64 - expected;
                d * d / expected
            })
            .sum();
        assert!(chi_square < 43.8, "chi-square {chi_square} too large: {counts:?}");
    }

    #[test]
    fn test_split_even_prefix_sums() {
        let ranges = split_even(10, 3);
        assert_eq!(ranges, vec![0..4, 4..7, 7..10]);

        let ranges = split_even(2, 5);
        assert_eq!(ranges, vec![0..1, 1..2]);

        for (total, parts) in [(1000, 7), (13, 13), (5, 1)] {
            let ranges = split_even(total, parts);
            let mut expected_start = 0;
            for r in &ranges {
                assert_eq!(r.start, expected_start);
                expected_start = r.end;
            }
            assert_eq!(expected_start, total);
        }
    }

    #[test]
    fn test_partitioned_sample_reads_correct_rows() {
        let ds = scalar_dataset(BLOCK_ROWS * 3);
        let sample = partitioned_sample(&ds, 777, 6, 9).unwrap();
        assert_eq!(sample.len(), 777);
        assert!(sample.positions.windows(2).all(|w| w[0] < w[1]));
        for (pos, v) in sample.positions.iter().zip(&sample.vectors) {
            assert_eq!(v, &vec![*pos as f32, -(*pos as f32)]);
        }
    }

    #[test]
    fn test_partitioned_sample_truncates() {
        let ds = scalar_dataset(8);
        let sample = partitioned_sample(&ds, 100, 3, 1).unwrap();
        assert_eq!(sample.positions, (0..8).collect::<Vec<_>>());
    }

    /// Both samplers target the same distribution: compare the mean and
    /// spread of sampled values against the population moments.
    #[test]
    fn test_sequential_and_partitioned_moments_match() {
        let n = 1000;
        let k = 100;
        let trials = 200;
        let ds = scalar_dataset(n);
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(3);

        let mut seq_means = Vec::with_capacity(trials);
        let mut par_means = Vec::with_capacity(trials);
        for t in 0..trials {
            let seq = reservoir_sample(ds.rows(), k, &mut rng).unwrap();
            let par = partitioned_sample(&ds, k, 4, 1000 + t as u64).unwrap();
            seq_means.push(seq.positions.iter().sum::<usize>() as f64 / k as f64);
            par_means.push(par.positions.iter().sum::<usize>() as f64 / k as f64);
        }

        let population_mean = (n - 1) as f64 / 2.0;
        let avg = |v: &[f64]| v.iter().sum::<f64>() / v.len() as f64;
        assert!((avg(&seq_means) - population_mean).abs() < 10.0);
        assert!((avg(&par_means) - population_mean).abs() < 10.0);

        // Standard deviation of a sample mean: sqrt(var / k * (n - k) / (n - 1)) ~ 27.4
        let spread = |v: &[f64]| {
            let m = avg(v);
            (v.iter().map(|x| (x - m) * (x - m)).sum::<f64>() / v.len() as f64).sqrt()
        };
        for s in [spread(&seq_means), spread(&par_means)] {
            assert!(s > 18.0 && s < 38.0, "spread {s}");
        }
    }
}
