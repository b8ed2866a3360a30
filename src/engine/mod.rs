//! Seams to the ANN index engine.
//!
//! The loader, monitor and benchmark harness only talk to these traits. The
//! [`local`] module implements all of them in process on top of usearch.

pub mod local;

use async_trait::async_trait;

use crate::config::{effective_threads, Metric};
use crate::error::Result;

/// One row of an embeddings or centroids table
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub id: u64,
    /// Only centroid rows carry parents
    pub parent: Option<u64>,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Embeddings,
    Centroids,
}

/// Outcome of a non-blocking flush attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    /// Buffered output remains; try again after yielding
    Pending,
    Done,
}

/// An open bulk-copy stream into one table
#[async_trait]
pub trait CopySession: Send {
    async fn write_row(&mut self, row: &Row) -> Result<()>;

    /// Push buffered output without blocking
    fn try_flush(&mut self) -> Result<FlushStatus>;

    /// Close the stream, returning the number of rows it carried
    async fn finish(self) -> Result<u64>;
}

/// Table management and bulk copy
#[async_trait]
pub trait Store: Send {
    type Session: CopySession;

    /// Drop the table if it exists, then create it empty
    async fn recreate_table(&mut self, table: &str, kind: TableKind, dims: usize) -> Result<()>;

    async fn drop_table(&mut self, table: &str) -> Result<()>;

    async fn begin_copy(&mut self, table: &str) -> Result<Self::Session>;

    /// Stream every row of a table into `sink`, returning the row count
    async fn scan(
        &mut self,
        table: &str,
        sink: &mut (dyn FnMut(Row) -> Result<()> + Send),
    ) -> Result<u64>;
}

/// Build progress as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildProgress {
    pub total_units: u64,
    pub done_units: u64,
}

#[async_trait]
pub trait IndexBuilder: Send {
    async fn build_index(&mut self, spec: &IndexSpec) -> Result<()>;
}

/// Progress introspection, polled from a separate connection
#[async_trait]
pub trait ProgressSource: Send {
    /// `None` while no build is running
    async fn build_progress(&mut self) -> Result<Option<BuildProgress>>;
}

/// A single query connection
pub trait QueryEndpoint {
    /// Ids of the nearest candidates, closest first, at most `k`
    fn search(&mut self, query: &[f32], k: usize) -> Result<Vec<u64>>;
}

/// Opens one query connection per benchmark worker
pub trait Connector: Sync {
    type Endpoint: QueryEndpoint;

    fn connect(&self) -> Result<Self::Endpoint>;
}

/// Where index centroids come from
#[derive(Debug, Clone, PartialEq)]
pub enum CentroidSource {
    /// Trained by the engine: `[K]` or `[K, K2]`
    Internal { lists: Vec<usize> },
    /// Precomputed and uploaded to a centroids table
    External { table: String },
}

/// Structured configuration of an index build
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSpec {
    pub table: String,
    pub index_name: String,
    pub metric: Metric,
    pub centroids: CentroidSource,
    pub build_threads: usize,
}

/// Name of the centroids table paired with an embeddings table
pub fn centroid_table(table: &str) -> String {
    format!("{}_centroids", table)
}

pub fn index_name(table: &str) -> String {
    format!("{}_embedding_idx", table)
}

impl IndexSpec {
    pub fn new(table: &str, metric: Metric, centroids: CentroidSource) -> Self {
        Self {
            table: table.to_string(),
            index_name: index_name(table),
            metric,
            centroids,
            build_threads: effective_threads(0).saturating_sub(1).max(1),
        }
    }

    pub fn internal(table: &str, metric: Metric, lists: Vec<usize>) -> Self {
        Self::new(table, metric, CentroidSource::Internal { lists })
    }

    pub fn external(table: &str, metric: Metric) -> Self {
        Self::new(
            table,
            metric,
            CentroidSource::External {
                table: centroid_table(table),
            },
        )
    }

    pub fn with_build_threads(mut self, threads: usize) -> Self {
        self.build_threads = threads.max(1);
        self
    }

    pub fn operator_class(&self) -> &'static str {
        match self.metric {
            Metric::L2 => "vector_l2_ops",
            Metric::Cos => "vector_cosine_ops",
            Metric::Dot => "vector_ip_ops",
        }
    }

    /// Render the options document handed to the engine
    pub fn options(&self) -> String {
        let mut out = format!(
            "residual_quantization = {}\n",
            self.metric.residual_quantization()
        );
        match &self.centroids {
            CentroidSource::Internal { lists } => {
                let lists: Vec<String> = lists.iter().map(|l| l.to_string()).collect();
                out.push_str("[build.internal]\n");
                out.push_str(&format!("lists = [{}]\n", lists.join(", ")));
                out.push_str(&format!("build_threads = {}\n", self.build_threads));
                out.push_str(&format!(
                    "spherical_centroids = {}\n",
                    self.metric.spherical_centroids()
                ));
            }
            CentroidSource::External { table } => {
                out.push_str("[build.external]\n");
                out.push_str(&format!("table = '{}'\n", table));
            }
        }
        out
    }
}
