//! Trained codebooks and their on-disk format.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::distance::mean;
use crate::error::{BenchError, Result};

/// Parent marker for nodes without a parent in the centroid file
const NO_PARENT: u64 = u64::MAX;

/// One centroid with its position in the hierarchy
#[derive(Debug, Clone, PartialEq)]
pub struct CentroidNode {
    pub id: u32,
    pub parent: Option<u32>,
    pub vector: Vec<f32>,
}

/// Ordered centroid list, flat or a depth-2 tree rooted at id 0
#[derive(Debug, Clone, PartialEq)]
pub struct CentroidSet {
    dims: usize,
    nodes: Vec<CentroidNode>,
}

impl CentroidSet {
    /// Single-level codebook: ids 0..K, no parents
    pub fn flat(centroids: Vec<Vec<f32>>) -> Result<Self> {
        let dims = check_dims(&centroids)?;
        let nodes = centroids
            .into_iter()
            .enumerate()
            .map(|(i, vector)| CentroidNode {
                id: i as u32,
                parent: None,
                vector,
            })
            .collect();
        Ok(Self { dims, nodes })
    }

    /// Two-level codebook.
    ///
    /// Node 0 is the mean of the top-level centroids, nodes 1..=K are the
    /// top-level centroids, then the children of each cluster in order with
    /// their owning top-level node as parent. A cluster may have no children.
    pub fn hierarchical(top: Vec<Vec<f32>>, children: Vec<Vec<Vec<f32>>>) -> Result<Self> {
        let dims = check_dims(&top)?;
        if children.len() != top.len() {
            return Err(BenchError::InvalidConfig(format!(
                "{} child groups for {} top-level centroids",
                children.len(),
                top.len()
            )));
        }

        let mut nodes = Vec::with_capacity(1 + top.len() + children.iter().map(Vec::len).sum::<usize>());
        nodes.push(CentroidNode {
            id: 0,
            parent: None,
            vector: mean(&top, dims),
        });
        for (i, vector) in top.into_iter().enumerate() {
            nodes.push(CentroidNode {
                id: i as u32 + 1,
                parent: Some(0),
                vector,
            });
        }
        let mut next_id = nodes.len() as u32;
        for (cluster, group) in children.into_iter().enumerate() {
            for vector in group {
                if vector.len() != dims {
                    return Err(BenchError::DimensionMismatch {
                        expected: dims,
                        actual: vector.len(),
                    });
                }
                nodes.push(CentroidNode {
                    id: next_id,
                    parent: Some(cluster as u32 + 1),
                    vector,
                });
                next_id += 1;
            }
        }
        Ok(Self { dims, nodes })
    }

    /// Assemble from raw nodes, validating ids and parent references
    pub fn from_nodes(nodes: Vec<CentroidNode>) -> Result<Self> {
        let dims = nodes.first().map(|n| n.vector.len()).unwrap_or(0);
        let mut ids = HashSet::with_capacity(nodes.len());
        for node in &nodes {
            if node.vector.len() != dims {
                return Err(BenchError::DimensionMismatch {
                    expected: dims,
                    actual: node.vector.len(),
                });
            }
            if !ids.insert(node.id) {
                return Err(BenchError::InvalidConfig(format!("duplicate centroid id {}", node.id)));
            }
        }
        if let Some(orphan) = nodes
            .iter()
            .find(|n| n.parent.is_some_and(|p| !ids.contains(&p)))
        {
            return Err(BenchError::InvalidConfig(format!(
                "centroid {} points at missing parent",
                orphan.id
            )));
        }
        Ok(Self { dims, nodes })
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[CentroidNode] {
        &self.nodes
    }

    /// Whether parent pointers are present
    pub fn is_tree(&self) -> bool {
        self.nodes.iter().any(|n| n.parent.is_some())
    }

    /// Return a tree: a flat set gains a synthetic root equal to the mean of
    /// its centroids, and every centroid is re-numbered to point at it.
    pub fn with_root(self) -> Self {
        if self.is_tree() || self.nodes.is_empty() {
            return self;
        }
        let vectors: Vec<Vec<f32>> = self.nodes.into_iter().map(|n| n.vector).collect();
        let root = mean(&vectors, self.dims);

        let mut nodes = Vec::with_capacity(vectors.len() + 1);
        nodes.push(CentroidNode {
            id: 0,
            parent: None,
            vector: root,
        });
        nodes.extend(vectors.into_iter().enumerate().map(|(i, vector)| CentroidNode {
            id: i as u32 + 1,
            parent: Some(0),
            vector,
        }));
        Self {
            dims: self.dims,
            nodes,
        }
    }

    pub fn root(&self) -> Option<&CentroidNode> {
        if self.is_tree() {
            self.nodes.iter().find(|n| n.parent.is_none())
        } else {
            None
        }
    }

    pub fn children_of(&self, id: u32) -> impl Iterator<Item = &CentroidNode> + '_ {
        self.nodes.iter().filter(move |n| n.parent == Some(id))
    }

    /// Nodes that are nobody's parent: the lists a vector is assigned to.
    /// A flat set is all leaves.
    pub fn leaves(&self) -> Vec<&CentroidNode> {
        let parents: HashSet<u32> = self.nodes.iter().filter_map(|n| n.parent).collect();
        self.nodes
            .iter()
            .filter(|n| !parents.contains(&n.id))
            .filter(|n| !(n.parent.is_none() && self.is_tree()))
            .collect()
    }

    /// Save as binary: header (count u64, dims u64), then per node
    /// id (u64), parent (u64, `u64::MAX` for none), vector (f32 * dims)
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(&(self.nodes.len() as u64).to_le_bytes())?;
        writer.write_all(&(self.dims as u64).to_le_bytes())?;
        for node in &self.nodes {
            writer.write_all(&(node.id as u64).to_le_bytes())?;
            let parent = node.parent.map(u64::from).unwrap_or(NO_PARENT);
            writer.write_all(&parent.to_le_bytes())?;
            for &val in &node.vector {
                writer.write_all(&val.to_le_bytes())?;
            }
        }
        writer.flush()?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut buf8 = [0u8; 8];
        let mut buf4 = [0u8; 4];

        reader.read_exact(&mut buf8)?;
        let count = u64::from_le_bytes(buf8) as usize;
        reader.read_exact(&mut buf8)?;
        let dims = u64::from_le_bytes(buf8) as usize;

        let mut nodes = Vec::with_capacity(count);
        for _ in 0..count {
            reader.read_exact(&mut buf8)?;
            let id = u64::from_le_bytes(buf8) as u32;
            reader.read_exact(&mut buf8)?;
            let parent = match u64::from_le_bytes(buf8) {
                NO_PARENT => None,
                p => Some(p as u32),
            };
            let mut vector = Vec::with_capacity(dims);
            for _ in 0..dims {
                reader.read_exact(&mut buf4)?;
                vector.push(f32::from_le_bytes(buf4));
            }
            nodes.push(CentroidNode { id, parent, vector });
        }

        let set = Self::from_nodes(nodes)?;
        if !set.is_empty() && set.dims != dims {
            return Err(BenchError::DimensionMismatch {
                expected: dims,
                actual: set.dims,
            });
        }
        Ok(set)
    }
}

fn check_dims(vectors: &[Vec<f32>]) -> Result<usize> {
    let dims = vectors
        .first()
        .map(|v| v.len())
        .ok_or_else(|| BenchError::InvalidConfig("centroid set is empty".into()))?;
    if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
        return Err(BenchError::DimensionMismatch {
            expected: dims,
            actual: bad.len(),
        });
    }
    Ok(dims)
}
