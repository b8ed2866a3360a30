//! Vector dataset access for training, loading and benchmarking.
//!
//! Datasets follow the texmex conventions:
//! - fvecs: float32 vectors with a dimension prefix per vector
//! - ivecs: int32 vectors (used for ground-truth neighbor ids)
//!
//! Every fvecs record has the same stride, so a train file can be read by
//! row index without loading it. The trainer and loader only ever go through
//! [`VectorDataset`], which keeps their memory bounded by block size.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{BenchError, Result};

/// Rows fetched per read when a dataset is iterated sequentially
pub const BLOCK_ROWS: usize = 4096;

const MAX_DIMENSIONS: usize = 65_536;

/// Immutable ordered sequence of fixed-dimension vectors
pub trait VectorDataset: Sync {
    fn len(&self) -> usize;

    fn dims(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read a contiguous row range
    fn read_range(&self, range: Range<usize>) -> Result<Vec<Vec<f32>>>;

    fn read_row(&self, index: usize) -> Result<Vec<f32>> {
        self.read_range(index..index + 1)?
            .pop()
            .ok_or_else(|| out_of_bounds(index, self.len()))
    }

    /// Sequential iteration, reading [`BLOCK_ROWS`] rows at a time
    fn rows(&self) -> Rows<'_, Self>
    where
        Self: Sized,
    {
        Rows {
            dataset: self,
            next: 0,
            block: Vec::new().into_iter(),
        }
    }
}

fn out_of_bounds(index: usize, len: usize) -> BenchError {
    BenchError::InvalidConfig(format!("row {} out of bounds for dataset of {}", index, len))
}

/// Block-buffered row iterator over a dataset
pub struct Rows<'a, D: VectorDataset> {
    dataset: &'a D,
    next: usize,
    block: std::vec::IntoIter<Vec<f32>>,
}

impl<D: VectorDataset> Iterator for Rows<'_, D> {
    type Item = Result<Vec<f32>>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(row) = self.block.next() {
            return Some(Ok(row));
        }
        let len = self.dataset.len();
        if self.next >= len {
            return None;
        }
        let end = (self.next + BLOCK_ROWS).min(len);
        match self.dataset.read_range(self.next..end) {
            Ok(block) => {
                self.next = end;
                self.block = block.into_iter();
                self.block.next().map(Ok)
            }
            Err(e) => {
                self.next = len;
                Some(Err(e))
            }
        }
    }
}

/// Dataset held entirely in memory
#[derive(Debug, Clone)]
pub struct MemoryDataset {
    dims: usize,
    rows: Vec<Vec<f32>>,
}

impl MemoryDataset {
    pub fn new(rows: Vec<Vec<f32>>) -> Result<Self> {
        let dims = rows.first().map(|r| r.len()).unwrap_or(0);
        if let Some(bad) = rows.iter().find(|r| r.len() != dims) {
            return Err(BenchError::DimensionMismatch {
                expected: dims,
                actual: bad.len(),
            });
        }
        Ok(Self { dims, rows })
    }

    pub fn as_slice(&self) -> &[Vec<f32>] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Vec<f32>> {
        self.rows
    }
}

impl VectorDataset for MemoryDataset {
    fn len(&self) -> usize {
        self.rows.len()
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn read_range(&self, range: Range<usize>) -> Result<Vec<Vec<f32>>> {
        if range.end > self.rows.len() || range.start > range.end {
            return Err(out_of_bounds(range.end.saturating_sub(1), self.rows.len()));
        }
        Ok(self.rows[range].to_vec())
    }
}

/// Disk-backed fvecs file with random row access
#[derive(Debug, Clone)]
pub struct FvecsDataset {
    path: PathBuf,
    dims: usize,
    len: usize,
}

impl FvecsDataset {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        let file_size = file.metadata()?.len();

        let mut buf4 = [0u8; 4];
        file.read_exact(&mut buf4)?;
        let dims = i32::from_le_bytes(buf4) as usize;
        if dims == 0 || dims > MAX_DIMENSIONS {
            return Err(invalid_data(format!("Invalid dimension {} in fvecs file", dims)));
        }

        let stride = Self::stride_for(dims) as u64;
        if file_size % stride != 0 {
            return Err(invalid_data(format!(
                "fvecs file size {} is not a multiple of record size {}",
                file_size, stride
            )));
        }
        let len = (file_size / stride) as usize;
        debug!(path = %path.display(), dims, len, "opened fvecs dataset");

        Ok(Self { path, dims, len })
    }

    fn stride_for(dims: usize) -> usize {
        4 + 4 * dims
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl VectorDataset for FvecsDataset {
    fn len(&self) -> usize {
        self.len
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn read_range(&self, range: Range<usize>) -> Result<Vec<Vec<f32>>> {
        if range.end > self.len || range.start > range.end {
            return Err(out_of_bounds(range.end.saturating_sub(1), self.len));
        }
        let stride = Self::stride_for(self.dims);
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start((range.start * stride) as u64))?;

        let mut bytes = vec![0u8; range.len() * stride];
        file.read_exact(&mut bytes)?;

        bytes
            .chunks_exact(stride)
            .map(|record| {
                let dim = i32::from_le_bytes([record[0], record[1], record[2], record[3]]) as usize;
                if dim != self.dims {
                    return Err(BenchError::DimensionMismatch {
                        expected: self.dims,
                        actual: dim,
                    });
                }
                Ok(record[4..]
                    .chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect())
            })
            .collect()
    }
}

fn invalid_data(message: String) -> BenchError {
    BenchError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, message))
}

/// Read vectors from an fvecs file (float32 vectors)
/// Format: for each vector, 4 bytes dimension (int32), then dim*4 bytes of float32 values
pub fn read_fvecs<P: AsRef<Path>>(path: P) -> Result<Vec<Vec<f32>>> {
    let dataset = FvecsDataset::open(path)?;
    dataset.read_range(0..dataset.len())
}

/// Read vectors from an ivecs file (int32 vectors, used for ground truth)
/// Format: for each vector, 4 bytes dimension (int32), then dim*4 bytes of int32 values
pub fn read_ivecs<P: AsRef<Path>>(path: P) -> Result<Vec<Vec<u32>>> {
    let file = File::open(path.as_ref())?;
    let file_size = file.metadata()?.len();
    let mut reader = BufReader::new(file);

    let mut vectors = Vec::new();
    let mut buf4 = [0u8; 4];
    let mut bytes_read: u64 = 0;

    while bytes_read < file_size {
        reader.read_exact(&mut buf4)?;
        bytes_read += 4;
        let dim = i32::from_le_bytes(buf4) as usize;

        if dim == 0 || dim > MAX_DIMENSIONS {
            return Err(invalid_data(format!("Invalid dimension {} in ivecs file", dim)));
        }

        let mut vector = Vec::with_capacity(dim);
        for _ in 0..dim {
            reader.read_exact(&mut buf4)?;
            bytes_read += 4;
            vector.push(u32::from_le_bytes(buf4));
        }
        vectors.push(vector);
    }

    Ok(vectors)
}

/// Streaming fvecs writer
pub struct FvecsWriter {
    writer: BufWriter<File>,
    dims: Option<usize>,
    count: usize,
}

impl FvecsWriter {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self {
            writer: BufWriter::new(File::create(path)?),
            dims: None,
            count: 0,
        })
    }

    pub fn write(&mut self, vector: &[f32]) -> Result<()> {
        match self.dims {
            Some(dims) if dims != vector.len() => {
                return Err(BenchError::DimensionMismatch {
                    expected: dims,
                    actual: vector.len(),
                })
            }
            None => self.dims = Some(vector.len()),
            _ => {}
        }
        self.writer.write_all(&(vector.len() as i32).to_le_bytes())?;
        for &val in vector {
            self.writer.write_all(&val.to_le_bytes())?;
        }
        self.count += 1;
        Ok(())
    }

    /// Flush and return the number of vectors written
    pub fn finish(mut self) -> Result<usize> {
        self.writer.flush()?;
        Ok(self.count)
    }
}

/// Write ground-truth ids as ivecs
pub fn write_ivecs<P: AsRef<Path>>(path: P, rows: &[Vec<u32>]) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for row in rows {
        writer.write_all(&(row.len() as i32).to_le_bytes())?;
        for &id in row {
            writer.write_all(&id.to_le_bytes())?;
        }
    }
    writer.flush()?;
    Ok(())
}

/// A benchmark dataset: disk-backed train vectors, in-memory queries and ground truth
pub struct BenchDataset {
    pub name: String,
    pub train: FvecsDataset,
    pub test: Vec<Vec<f32>>,
    /// For each test query, ids of its true nearest neighbors in `train`
    pub neighbors: Vec<Vec<u32>>,
}

impl BenchDataset {
    pub fn dims(&self) -> usize {
        self.train.dims()
    }

    pub fn num_queries(&self) -> usize {
        self.test.len()
    }

    /// Number of ground-truth neighbors per query
    pub fn ground_truth_k(&self) -> usize {
        self.neighbors.first().map(|v| v.len()).unwrap_or(0)
    }
}

/// Locate the train/test/neighbors files of a dataset
///
/// Accepted layouts, flat or nested under `<name>/`:
///   train.fvecs, test.fvecs, neighbors.ivecs
///   <name>_base.fvecs, <name>_query.fvecs, <name>_groundtruth.ivecs
pub fn locate_dataset(dir: &Path, name: &str) -> Result<(PathBuf, PathBuf, PathBuf)> {
    let layouts = [
        (
            "train.fvecs".to_string(),
            "test.fvecs".to_string(),
            "neighbors.ivecs".to_string(),
        ),
        (
            format!("{}_base.fvecs", name),
            format!("{}_query.fvecs", name),
            format!("{}_groundtruth.ivecs", name),
        ),
    ];

    for root in [dir.to_path_buf(), dir.join(name)] {
        for (train, test, neighbors) in &layouts {
            if root.join(train).exists() {
                return Ok((root.join(train), root.join(test), root.join(neighbors)));
            }
        }
    }

    Err(BenchError::Io(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("no dataset files for '{}' under {}", name, dir.display()),
    )))
}

/// Open the train split only
pub fn open_train(dir: &Path, name: &str) -> Result<FvecsDataset> {
    let (train, _, _) = locate_dataset(dir, name)?;
    FvecsDataset::open(train)
}

/// Load a benchmark dataset from a directory
pub fn load_dataset(dir: &Path, name: &str) -> Result<BenchDataset> {
    let (train_path, test_path, neighbors_path) = locate_dataset(dir, name)?;
    let train = FvecsDataset::open(&train_path)?;
    let test = read_fvecs(&test_path)?;
    let neighbors = read_ivecs(&neighbors_path)?;

    if let Some(q) = test.first() {
        if q.len() != train.dims() {
            return Err(BenchError::DimensionMismatch {
                expected: train.dims(),
                actual: q.len(),
            });
        }
    }
    if neighbors.len() != test.len() {
        return Err(invalid_data(format!(
            "{} queries but {} ground-truth rows",
            test.len(),
            neighbors.len()
        )));
    }

    Ok(BenchDataset {
        name: name.to_string(),
        train,
        test,
        neighbors,
    })
}
