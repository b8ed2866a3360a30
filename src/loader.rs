//! Chunked bulk loading into a [`Store`].
//!
//! The dataset is split into contiguous chunks and each chunk travels over
//! its own copy session. Only one session is open at a time; a failure
//! surfaces immediately and leaves earlier chunks committed.

use std::ops::Range;

use indicatif::ProgressBar;
use tracing::{info, warn};

use crate::centroids::CentroidSet;
use crate::config::LoadConfig;
use crate::dataset::{VectorDataset, BLOCK_ROWS};
use crate::engine::{CopySession, FlushStatus, Row, Store, TableKind};
use crate::error::{BenchError, Result};
use crate::progress;

/// Split `n` rows into `min(chunks, n)` contiguous ranges of `n / chunks`
/// rows; the final range takes the remainder.
pub fn chunk_ranges(n: usize, chunks: usize) -> Vec<Range<usize>> {
    if n == 0 || chunks == 0 {
        return Vec::new();
    }
    let count = chunks.min(n);
    let size = n / count;
    (0..count)
        .map(|i| {
            let start = i * size;
            let end = if i + 1 == count { n } else { start + size };
            start..end
        })
        .collect()
}

pub struct BulkLoader<S: Store> {
    store: S,
    config: LoadConfig,
}

impl<S: Store> BulkLoader<S> {
    pub fn new(store: S, config: LoadConfig) -> Self {
        Self { store, config }
    }

    /// The underlying store, for table management outside a load
    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Recreate `table` and copy every dataset row into it with ids 0..N
    pub async fn load_embeddings<D: VectorDataset>(&mut self, table: &str, dataset: &D) -> Result<u64> {
        if self.config.chunks == 0 {
            return Err(BenchError::InvalidConfig("chunks must be at least 1".into()));
        }
        self.store
            .recreate_table(table, TableKind::Embeddings, dataset.dims())
            .await?;

        let ranges = chunk_ranges(dataset.len(), self.config.chunks);
        let bar = progress::bar(dataset.len() as u64, "Loading vectors", self.config.show_progress);
        let mut written = 0;
        for (chunk, range) in ranges.into_iter().enumerate() {
            let rows = self
                .copy_chunk(table, dataset, range, &bar)
                .await
                .inspect_err(|e| {
                    if e.is_transport() {
                        warn!(chunk, error = %e, "copy failed; earlier chunks stay committed");
                    }
                })?;
            written += rows;
        }
        bar.finish_and_clear();
        info!(table, rows = written, "loaded embeddings");
        Ok(written)
    }

    async fn copy_chunk<D: VectorDataset>(
        &mut self,
        table: &str,
        dataset: &D,
        range: Range<usize>,
        bar: &ProgressBar,
    ) -> Result<u64> {
        let mut session = self.store.begin_copy(table).await?;
        let mut start = range.start;
        while start < range.end {
            let end = (start + BLOCK_ROWS).min(range.end);
            for (offset, vector) in dataset.read_range(start..end)?.into_iter().enumerate() {
                let row = Row {
                    id: (start + offset) as u64,
                    parent: None,
                    vector,
                };
                session.write_row(&row).await?;
            }
            bar.inc((end - start) as u64);
            start = end;
        }
        drain(&mut session).await?;
        session.finish().await
    }

    /// Recreate `table` and upload a codebook as a tree. A flat set gets a
    /// synthetic root at id 0 and its centroids renumbered from 1.
    pub async fn load_centroids(&mut self, table: &str, centroids: &CentroidSet) -> Result<u64> {
        if centroids.is_empty() {
            return Err(BenchError::EmptyDataset);
        }
        self.store
            .recreate_table(table, TableKind::Centroids, centroids.dims())
            .await?;

        let tree = centroids.clone().with_root();
        let mut session = self.store.begin_copy(table).await?;
        for node in tree.nodes() {
            let row = Row {
                id: u64::from(node.id),
                parent: node.parent.map(u64::from),
                vector: node.vector.clone(),
            };
            session.write_row(&row).await?;
        }
        drain(&mut session).await?;
        let rows = session.finish().await?;
        info!(table, rows, "loaded centroids");
        Ok(rows)
    }
}

/// Flush until the session reports nothing buffered, yielding between
/// attempts so other tasks keep running.
async fn drain<C: CopySession>(session: &mut C) -> Result<()> {
    while session.try_flush()? == FlushStatus::Pending {
        tokio::task::yield_now().await;
    }
    Ok(())
}
