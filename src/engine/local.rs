//! In-process engine.
//!
//! Tables are flat files under a data directory. An index is a set of IVF
//! posting lists keyed by the leaf centroids, with the centroids themselves
//! held in a usearch graph used to pick lists for assignment and probing.

use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use usearch::{new_index, Index, IndexOptions, MetricKind, ScalarKind};

use super::{
    BuildProgress, CentroidSource, Connector, CopySession, FlushStatus, IndexBuilder, IndexSpec,
    ProgressSource, QueryEndpoint, Row, Store, TableKind,
};
use crate::centroids::{CentroidNode, CentroidSet};
use crate::config::{Metric, SearchParams, StopFlag, TrainConfig};
use crate::dataset::MemoryDataset;
use crate::error::{BenchError, Result};
use crate::trainer::train_centroids;

const TABLE_MAGIC: &[u8; 4] = b"IVFT";
const HEADER_LEN: u64 = 4 + 1 + 8;
const NO_PARENT: u64 = u64::MAX;

/// Bytes written per flush attempt
const FLUSH_BLOCK: usize = 64 * 1024;
/// Buffered bytes at which `write_row` flushes before accepting more
const HIGH_WATER: usize = 4 * 1024 * 1024;

const CONNECTIVITY: usize = 16;
const EXPANSION_ADD: usize = 128;
const EXPANSION_SEARCH: usize = 64;

#[derive(Default)]
struct Shared {
    building: AtomicBool,
    total_units: AtomicU64,
    done_units: AtomicU64,
    open_copies: Mutex<HashSet<String>>,
}

/// Handle to an engine rooted at a data directory.
///
/// Clones share build state, so a clone acts as a second connection for
/// progress polling while another clone runs a build.
#[derive(Clone)]
pub struct LocalEngine {
    root: PathBuf,
    shared: Arc<Shared>,
}

impl LocalEngine {
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            shared: Arc::new(Shared::default()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Another connection to the same engine
    pub fn connection(&self) -> Self {
        self.clone()
    }

    pub fn index_dir(&self, index_name: &str) -> PathBuf {
        self.root.join(index_name)
    }

    /// Open a query connector over a built index
    pub fn connector(&self, index_name: &str, params: SearchParams) -> Result<LocalConnector> {
        LocalConnector::open(self.index_dir(index_name), params)
    }

    fn table_path(&self, table: &str) -> Result<PathBuf> {
        let valid = !table.is_empty()
            && table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(BenchError::InvalidConfig(format!(
                "invalid table name {:?}",
                table
            )));
        }
        Ok(self.root.join(format!("{}.tbl", table)))
    }

    fn existing_table(&self, table: &str) -> Result<PathBuf> {
        let path = self.table_path(table)?;
        if !path.exists() {
            return Err(BenchError::TableNotFound(table.to_string()));
        }
        Ok(path)
    }

    fn build_blocking(&self, spec: &IndexSpec, stop: &StopFlag) -> Result<()> {
        if self.shared.building.swap(true, Ordering::SeqCst) {
            return Err(BenchError::Index("another build is already running".into()));
        }
        let _guard = BuildGuard(&self.shared);

        let mut ids = Vec::new();
        let mut vectors = Vec::new();
        let (_, dims, rows) = read_table(&self.existing_table(&spec.table)?, &mut |row| {
            ids.push(row.id);
            vectors.push(row.vector);
            Ok(())
        })?;
        if rows == 0 {
            return Err(BenchError::EmptyDataset);
        }
        let dataset = MemoryDataset::new(vectors)?;
        info!(index = %spec.index_name, table = %spec.table, rows, "building index");

        stop.check()?;
        let centroids = self.resolve_centroids(spec, &dataset, stop)?;
        if centroids.dims() != dims {
            return Err(BenchError::DimensionMismatch {
                expected: dims,
                actual: centroids.dims(),
            });
        }
        let leaves = centroids.leaves();
        let graph = centroid_graph(dims, spec.metric, leaves.len(), EXPANSION_SEARCH)?;
        for leaf in &leaves {
            graph.add(leaf.id as u64, leaf.vector.as_slice()).map_err(index_err)?;
        }
        debug!(lists = leaves.len(), "centroid graph ready");

        self.shared.done_units.store(0, Ordering::SeqCst);
        self.shared.total_units.store(rows, Ordering::SeqCst);

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(spec.build_threads)
            .build()
            .map_err(index_err)?;
        let done = &self.shared.done_units;
        let labels = pool.install(|| {
            dataset
                .as_slice()
                .par_iter()
                .map(|v| {
                    stop.check()?;
                    let list = nearest_list(&graph, v)?;
                    done.fetch_add(1, Ordering::Relaxed);
                    Ok(list)
                })
                .collect::<Result<Vec<u64>>>()
        })?;

        let mut postings: HashMap<u64, Vec<Posting>> = HashMap::new();
        for ((id, vector), list) in ids.into_iter().zip(dataset.into_rows()).zip(labels) {
            postings.entry(list).or_default().push(Posting { id, vector });
        }

        let index = IvfIndex {
            metadata: IndexMetadata {
                table: spec.table.clone(),
                index_name: spec.index_name.clone(),
                metric: spec.metric,
                dims,
                lists: leaves.len(),
                vectors: rows,
                options: spec.options(),
            },
            centroids: graph,
            postings,
        };
        stop.check()?;
        index.save(self.index_dir(&spec.index_name))?;
        info!(index = %spec.index_name, lists = index.metadata.lists, "index built");
        Ok(())
    }

    fn resolve_centroids(
        &self,
        spec: &IndexSpec,
        dataset: &MemoryDataset,
        stop: &StopFlag,
    ) -> Result<CentroidSet> {
        match &spec.centroids {
            CentroidSource::Internal { lists } => {
                let (&top, rest) = lists
                    .split_first()
                    .ok_or_else(|| BenchError::InvalidConfig("lists must not be empty".into()))?;
                if rest.len() > 1 {
                    return Err(BenchError::InvalidConfig(format!(
                        "at most two list levels are supported, got {}",
                        lists.len()
                    )));
                }
                let config = TrainConfig::default()
                    .with_lists(top)
                    .with_child_lists(rest.first().copied())
                    .with_metric(spec.metric)
                    .with_stop(stop.clone());
                train_centroids(dataset, &config)
            }
            CentroidSource::External { table } => {
                let mut nodes = Vec::new();
                read_table(&self.existing_table(table)?, &mut |row| {
                    nodes.push(CentroidNode {
                        id: narrow_id(row.id)?,
                        parent: row.parent.map(narrow_id).transpose()?,
                        vector: row.vector,
                    });
                    Ok(())
                })?;
                if nodes.is_empty() {
                    return Err(BenchError::EmptyDataset);
                }
                CentroidSet::from_nodes(nodes)
            }
        }
    }
}

fn narrow_id(id: u64) -> Result<u32> {
    u32::try_from(id).map_err(|_| BenchError::InvalidConfig(format!("centroid id {} out of range", id)))
}

/// Raises the stop flag of a build whose caller went away
struct StopOnDrop(StopFlag);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        self.0.stop();
    }
}

/// Clears published progress when a build ends, successfully or not
struct BuildGuard<'a>(&'a Shared);

impl Drop for BuildGuard<'_> {
    fn drop(&mut self) {
        self.0.total_units.store(0, Ordering::SeqCst);
        self.0.done_units.store(0, Ordering::SeqCst);
        self.0.building.store(false, Ordering::SeqCst);
    }
}

fn index_err<E: Display>(e: E) -> BenchError {
    BenchError::Index(e.to_string())
}

fn usearch_metric(metric: Metric) -> MetricKind {
    match metric {
        Metric::L2 => MetricKind::L2sq,
        Metric::Cos => MetricKind::Cos,
        Metric::Dot => MetricKind::IP,
    }
}

fn centroid_graph(dims: usize, metric: Metric, capacity: usize, expansion_search: usize) -> Result<Index> {
    let options = IndexOptions {
        dimensions: dims,
        metric: usearch_metric(metric),
        quantization: ScalarKind::F32,
        connectivity: CONNECTIVITY,
        expansion_add: EXPANSION_ADD,
        expansion_search,
        multi: false,
    };
    let index = new_index(&options).map_err(index_err)?;
    index.reserve(capacity).map_err(index_err)?;
    Ok(index)
}

fn nearest_list(graph: &Index, vector: &[f32]) -> Result<u64> {
    let matches = graph.search(vector, 1).map_err(index_err)?;
    matches
        .keys
        .first()
        .copied()
        .ok_or_else(|| BenchError::Index("centroid graph returned no match".into()))
}

fn write_header<W: Write>(writer: &mut W, kind: TableKind, dims: usize) -> io::Result<()> {
    writer.write_all(TABLE_MAGIC)?;
    writer.write_all(&[match kind {
        TableKind::Embeddings => 0u8,
        TableKind::Centroids => 1u8,
    }])?;
    writer.write_all(&(dims as u64).to_le_bytes())
}

fn read_header<R: Read>(reader: &mut R) -> Result<(TableKind, usize)> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != TABLE_MAGIC {
        return Err(BenchError::Index("not a table file".into()));
    }
    let mut kind = [0u8; 1];
    reader.read_exact(&mut kind)?;
    let kind = match kind[0] {
        0 => TableKind::Embeddings,
        1 => TableKind::Centroids,
        other => return Err(BenchError::Index(format!("unknown table kind {}", other))),
    };
    let mut buf8 = [0u8; 8];
    reader.read_exact(&mut buf8)?;
    Ok((kind, u64::from_le_bytes(buf8) as usize))
}

fn encode_row(out: &mut Vec<u8>, row: &Row) {
    out.extend_from_slice(&row.id.to_le_bytes());
    out.extend_from_slice(&row.parent.unwrap_or(NO_PARENT).to_le_bytes());
    for &val in &row.vector {
        out.extend_from_slice(&val.to_le_bytes());
    }
}

/// Stream the rows of a table file into `sink`
fn read_table(
    path: &Path,
    sink: &mut (dyn FnMut(Row) -> Result<()> + Send),
) -> Result<(TableKind, usize, u64)> {
    let file = File::open(path)?;
    let len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let (kind, dims) = read_header(&mut reader)?;

    let row_len = 16 + 4 * dims as u64;
    let body = len.saturating_sub(HEADER_LEN);
    if body % row_len != 0 {
        return Err(BenchError::Index(format!(
            "table {} ends in a partial row",
            path.display()
        )));
    }
    let rows = body / row_len;

    let mut buf8 = [0u8; 8];
    let mut buf4 = [0u8; 4];
    for _ in 0..rows {
        reader.read_exact(&mut buf8)?;
        let id = u64::from_le_bytes(buf8);
        reader.read_exact(&mut buf8)?;
        let parent = match u64::from_le_bytes(buf8) {
            NO_PARENT => None,
            p => Some(p),
        };
        let mut vector = Vec::with_capacity(dims);
        for _ in 0..dims {
            reader.read_exact(&mut buf4)?;
            vector.push(f32::from_le_bytes(buf4));
        }
        sink(Row { id, parent, vector })?;
    }
    Ok((kind, dims, rows))
}

#[async_trait]
impl Store for LocalEngine {
    type Session = LocalCopySession;

    async fn recreate_table(&mut self, table: &str, kind: TableKind, dims: usize) -> Result<()> {
        let path = self.table_path(table)?;
        if self.shared.open_copies.lock().contains(table) {
            return Err(BenchError::Transport(format!("table {} has an open copy session", table)));
        }
        match fs::remove_file(&path) {
            Ok(()) => debug!(table, "dropped existing table"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let mut writer = BufWriter::new(File::create(&path)?);
        write_header(&mut writer, kind, dims)?;
        writer.flush()?;
        Ok(())
    }

    async fn drop_table(&mut self, table: &str) -> Result<()> {
        match fs::remove_file(self.table_path(table)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn begin_copy(&mut self, table: &str) -> Result<LocalCopySession> {
        let path = self.existing_table(table)?;
        let (_, dims) = read_header(&mut File::open(&path)?)?;
        if !self.shared.open_copies.lock().insert(table.to_string()) {
            return Err(BenchError::Transport(format!(
                "table {} already has an open copy session",
                table
            )));
        }
        let file = match OpenOptions::new().append(true).open(&path) {
            Ok(file) => file,
            Err(e) => {
                self.shared.open_copies.lock().remove(table);
                return Err(e.into());
            }
        };
        Ok(LocalCopySession {
            table: table.to_string(),
            dims,
            file,
            pending: Vec::new(),
            rows: 0,
            shared: Arc::clone(&self.shared),
        })
    }

    async fn scan(
        &mut self,
        table: &str,
        sink: &mut (dyn FnMut(Row) -> Result<()> + Send),
    ) -> Result<u64> {
        let (_, _, rows) = read_table(&self.existing_table(table)?, sink)?;
        Ok(rows)
    }
}

/// Copy stream appending to a table file in bounded blocks
pub struct LocalCopySession {
    table: String,
    dims: usize,
    file: File,
    /// Encoded rows not yet written; never much larger than `HIGH_WATER`
    pending: Vec<u8>,
    rows: u64,
    shared: Arc<Shared>,
}

#[async_trait]
impl CopySession for LocalCopySession {
    async fn write_row(&mut self, row: &Row) -> Result<()> {
        if row.vector.len() != self.dims {
            return Err(BenchError::DimensionMismatch {
                expected: self.dims,
                actual: row.vector.len(),
            });
        }
        encode_row(&mut self.pending, row);
        self.rows += 1;
        while self.pending.len() >= HIGH_WATER {
            if self.try_flush()? == FlushStatus::Done {
                break;
            }
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    fn try_flush(&mut self) -> Result<FlushStatus> {
        let end = FLUSH_BLOCK.min(self.pending.len());
        if end > 0 {
            self.file
                .write_all(&self.pending[..end])
                .map_err(|e| BenchError::Transport(e.to_string()))?;
            self.pending.drain(..end);
        }
        if self.pending.is_empty() {
            Ok(FlushStatus::Done)
        } else {
            Ok(FlushStatus::Pending)
        }
    }

    async fn finish(mut self) -> Result<u64> {
        while self.try_flush()? == FlushStatus::Pending {
            tokio::task::yield_now().await;
        }
        self.file.sync_data()?;
        debug!(table = %self.table, rows = self.rows, "copy session finished");
        Ok(self.rows)
    }
}

impl Drop for LocalCopySession {
    fn drop(&mut self) {
        self.shared.open_copies.lock().remove(&self.table);
    }
}

#[async_trait]
impl IndexBuilder for LocalEngine {
    async fn build_index(&mut self, spec: &IndexSpec) -> Result<()> {
        let engine = self.clone();
        let spec = spec.clone();
        let stop = StopFlag::default();
        // Dropping this future before the build returns stops the build thread
        let _stop_on_drop = StopOnDrop(stop.clone());
        tokio::task::spawn_blocking(move || engine.build_blocking(&spec, &stop)).await?
    }
}

#[async_trait]
impl ProgressSource for LocalEngine {
    async fn build_progress(&mut self) -> Result<Option<BuildProgress>> {
        if !self.shared.building.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let total_units = self.shared.total_units.load(Ordering::SeqCst);
        if total_units == 0 {
            return Ok(None);
        }
        Ok(Some(BuildProgress {
            total_units,
            done_units: self.shared.done_units.load(Ordering::SeqCst),
        }))
    }
}

/// Stored alongside every index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub table: String,
    pub index_name: String,
    pub metric: Metric,
    pub dims: usize,
    pub lists: usize,
    pub vectors: u64,
    pub options: String,
}

struct Posting {
    id: u64,
    vector: Vec<f32>,
}

/// A built IVF index loaded in memory
pub struct IvfIndex {
    metadata: IndexMetadata,
    centroids: Index,
    postings: HashMap<u64, Vec<Posting>>,
}

impl IvfIndex {
    pub fn metadata(&self) -> &IndexMetadata {
        &self.metadata
    }

    /// Save to a directory: centroid graph, posting lists, metadata
    pub fn save<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        let centroid_path = dir.join("centroids.usearch");
        self.centroids
            .save(path_str(&centroid_path)?)
            .map_err(index_err)?;

        // Header: vector count, dims. Rows: list (u64), id (u64), vector (f32 * dims)
        let mut writer = BufWriter::new(File::create(dir.join("postings.bin"))?);
        writer.write_all(&self.metadata.vectors.to_le_bytes())?;
        writer.write_all(&(self.metadata.dims as u64).to_le_bytes())?;
        for (&list, postings) in &self.postings {
            for posting in postings {
                writer.write_all(&list.to_le_bytes())?;
                writer.write_all(&posting.id.to_le_bytes())?;
                for &val in &posting.vector {
                    writer.write_all(&val.to_le_bytes())?;
                }
            }
        }
        writer.flush()?;

        let metadata = BufWriter::new(File::create(dir.join("metadata.json"))?);
        serde_json::to_writer_pretty(metadata, &self.metadata)?;
        Ok(())
    }

    /// Load from a directory, widening the graph search to at least `probes`
    pub fn load<P: AsRef<Path>>(dir: P, probes: usize) -> Result<Self> {
        let dir = dir.as_ref();
        let metadata: IndexMetadata =
            serde_json::from_reader(BufReader::new(File::open(dir.join("metadata.json"))?))?;

        let centroids = centroid_graph(
            metadata.dims,
            metadata.metric,
            metadata.lists,
            probes.max(EXPANSION_SEARCH),
        )?;
        centroids
            .load(path_str(&dir.join("centroids.usearch"))?)
            .map_err(index_err)?;

        let mut reader = BufReader::new(File::open(dir.join("postings.bin"))?);
        let mut buf8 = [0u8; 8];
        let mut buf4 = [0u8; 4];
        reader.read_exact(&mut buf8)?;
        let count = u64::from_le_bytes(buf8);
        reader.read_exact(&mut buf8)?;
        let dims = u64::from_le_bytes(buf8) as usize;
        if dims != metadata.dims {
            return Err(BenchError::DimensionMismatch {
                expected: metadata.dims,
                actual: dims,
            });
        }

        let mut postings: HashMap<u64, Vec<Posting>> = HashMap::new();
        for _ in 0..count {
            reader.read_exact(&mut buf8)?;
            let list = u64::from_le_bytes(buf8);
            reader.read_exact(&mut buf8)?;
            let id = u64::from_le_bytes(buf8);
            let mut vector = Vec::with_capacity(dims);
            for _ in 0..dims {
                reader.read_exact(&mut buf4)?;
                vector.push(f32::from_le_bytes(buf4));
            }
            postings.entry(list).or_default().push(Posting { id, vector });
        }

        Ok(Self {
            metadata,
            centroids,
            postings,
        })
    }

    /// Rank the vectors of the `probes` closest lists exactly, returning
    /// at most `k` (id, distance) pairs closest first.
    pub fn search(&self, query: &[f32], k: usize, probes: usize) -> Result<Vec<(u64, f32)>> {
        if query.len() != self.metadata.dims {
            return Err(BenchError::DimensionMismatch {
                expected: self.metadata.dims,
                actual: query.len(),
            });
        }
        let metric = self.metadata.metric;
        let mut candidates: Vec<(u64, f32)> = Vec::new();
        let mut scan = |list: &[Posting]| {
            candidates.extend(list.iter().map(|p| (p.id, metric.distance(query, &p.vector))));
        };

        if probes >= self.metadata.lists {
            self.postings.values().for_each(|list| scan(list.as_slice()));
        } else {
            let probed = self
                .centroids
                .search(query, probes.max(1))
                .map_err(index_err)?;
            for list in &probed.keys {
                if let Some(postings) = self.postings.get(list) {
                    scan(postings.as_slice());
                }
            }
        }

        candidates.sort_by(|a, b| a.1.total_cmp(&b.1));
        candidates.truncate(k);
        Ok(candidates)
    }
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| BenchError::InvalidConfig(format!("non UTF-8 path {}", path.display())))
}

/// Shares one loaded index across query connections.
///
/// `epsilon` is accepted for parity with engines that use it and has no
/// effect here.
pub struct LocalConnector {
    index: Arc<IvfIndex>,
    params: SearchParams,
}

impl LocalConnector {
    pub fn open<P: AsRef<Path>>(dir: P, params: SearchParams) -> Result<Self> {
        let index = IvfIndex::load(dir, params.probes)?;
        Ok(Self {
            index: Arc::new(index),
            params,
        })
    }
}

impl Connector for LocalConnector {
    type Endpoint = LocalEndpoint;

    fn connect(&self) -> Result<LocalEndpoint> {
        Ok(LocalEndpoint {
            index: Arc::clone(&self.index),
            probes: self.params.probes,
        })
    }
}

pub struct LocalEndpoint {
    index: Arc<IvfIndex>,
    probes: usize,
}

impl QueryEndpoint for LocalEndpoint {
    fn search(&mut self, query: &[f32], k: usize) -> Result<Vec<u64>> {
        Ok(self
            .index
            .search(query, k, self.probes)?
            .into_iter()
            .map(|(id, _)| id)
            .collect())
    }
}
