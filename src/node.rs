//! Nodes (axis-tuples identifying one instantiation point) and the node manager
//! that persists and yields axis chunk sets.

use crate::axis::{Axis, Chunk, ChunkSet};
use crate::error::{EngineError, EngineResult};
use crate::resource::ResourceKey;
use crate::shelf::{Shelf, SledShelf};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// An ordered `(axis, chunk)` tuple identifying one instantiation point.
/// The empty tuple is the root node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Node(pub Vec<(Axis, Chunk)>);

impl Node {
    pub fn root() -> Self {
        Node(Vec::new())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns a new node extending `self` by one more `(axis, chunk)` pair.
    /// The axis must not already appear in `self` (nodes only concatenate
    /// along disjoint axes).
    pub fn extended(&self, axis: Axis, chunk: Chunk) -> Node {
        let mut v = self.0.clone();
        v.push((axis, chunk));
        Node(v)
    }

    /// True iff `self`'s axes do not collide with `other`'s, i.e. the two can
    /// be concatenated.
    pub fn disjoint_axes(&self, other: &Node) -> bool {
        self.0.iter().all(|(a, _)| !other.0.iter().any(|(b, _)| a == b))
    }

    /// Concatenates two nodes whose axes are disjoint.
    pub fn concat(&self, other: &Node) -> Node {
        debug_assert!(self.disjoint_axes(other));
        let mut v = self.0.clone();
        v.extend(other.0.iter().cloned());
        Node(v)
    }

    /// The chunk bound to `axis` at this node, if any.
    pub fn chunk_for(&self, axis: &Axis) -> Option<&Chunk> {
        self.0.iter().find(|(a, _)| a == axis).map(|(_, c)| c)
    }

    /// Prefix of this node truncated to its first `n` components.
    pub fn prefix(&self, n: usize) -> Node {
        Node(self.0[..n.min(self.0.len())].to_vec())
    }

    /// True iff `self` is a descendant of (or equal to) `ancestor`: `ancestor`'s
    /// components are a prefix of `self`'s.
    pub fn is_descendant_of(&self, ancestor: &Node) -> bool {
        ancestor.0.len() <= self.0.len() && self.0[..ancestor.0.len()] == ancestor.0[..]
    }

    /// Directory-style path used for tmp/log subdirectories:
    /// `<axis1>/<chunk1>/<axis2>/<chunk2>/...`
    pub fn subdir(&self) -> String {
        self.0
            .iter()
            .map(|(a, c)| format!("{}/{}", a.as_str(), c))
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Human-readable display name, e.g. `/byline/3/bychar/1`.
    pub fn displayname(&self) -> String {
        if self.0.is_empty() {
            String::new()
        } else {
            format!("/{}", self.subdir())
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.displayname())
    }
}

/// Key under which a chunk set is persisted: the axis, rooted at a parent node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
struct AxisKey {
    axis: Axis,
    parent: Node,
}

/// Persists and yields the concrete chunk values an axis currently takes,
/// possibly nested under an outer node.
pub struct NodeManager {
    shelf: SledShelf<AxisKey, ChunkSet>,
    /// Which resource produced each axis's chunk set, so that jobs depending on
    /// a node's axes become out of date when that axis is reshuffled.
    producers: RwLock<HashMap<AxisKey, ResourceKey>>,
}

impl NodeManager {
    pub fn new(shelves: &crate::shelf::Shelves) -> EngineResult<Self> {
        Ok(Self {
            shelf: shelves.tree("nodes")?,
            producers: RwLock::new(HashMap::new()),
        })
    }

    fn get_chunks(&self, axis: &Axis, parent: &Node) -> EngineResult<Option<ChunkSet>> {
        self.shelf.get(&AxisKey {
            axis: axis.clone(),
            parent: parent.clone(),
        })
    }

    /// The chunk set currently stored for `axis` at `parent`, or empty if
    /// the axis has not yet been materialised there.
    pub fn retrieve_chunks(&self, axis: &Axis, parent: &Node) -> EngineResult<ChunkSet> {
        Ok(self.get_chunks(axis, parent)?.unwrap_or_default())
    }

    /// Yields one node per element of the cartesian product of the current
    /// chunk sets of `axes`, nested under `root`. If any axis in the chain is
    /// not yet materialised, yields nothing (the caller should defer).
    pub fn retrieve_nodes(&self, root: &Node, axes: &[Axis]) -> EngineResult<Vec<Node>> {
        let mut frontier = vec![root.clone()];
        for axis in axes {
            let mut next = Vec::new();
            for prefix in &frontier {
                match self.get_chunks(axis, prefix)? {
                    Some(chunks) => {
                        for chunk in chunks {
                            next.push(prefix.extended(axis.clone(), chunk));
                        }
                    }
                    None => return Ok(Vec::new()),
                }
            }
            frontier = next;
        }
        Ok(frontier)
    }

    /// Persists the chunk set for `axis` rooted at `parent`. `downstream_committed`
    /// must be true if any job consuming the previous chunk set has already
    /// completed in this run; in that case a differing overwrite is rejected.
    pub fn store_chunks(
        &self,
        axis: &Axis,
        parent: &Node,
        chunks: ChunkSet,
        producing_resource: ResourceKey,
        downstream_committed: bool,
    ) -> EngineResult<bool> {
        let key = AxisKey {
            axis: axis.clone(),
            parent: parent.clone(),
        };
        let existing = self.shelf.get(&key)?;
        let changed = existing.as_ref() != Some(&chunks);
        if changed {
            if let Some(old) = &existing {
                if downstream_committed {
                    return Err(EngineError::AxisChunksMismatch {
                        axis: axis.to_string(),
                        old: old.iter().map(|c| c.to_string()).collect(),
                        new: chunks.iter().map(|c| c.to_string()).collect(),
                    });
                }
            }
        }
        self.shelf.put(&key, &chunks)?;
        self.producers.write().insert(key, producing_resource);
        Ok(changed)
    }

    /// Chunks dropped from `axis` at `parent` when overwriting with `new_chunks`
    /// (used by the graph to clean up instances keyed on removed chunks).
    pub fn dropped_chunks(
        &self,
        axis: &Axis,
        parent: &Node,
        new_chunks: &[Chunk],
    ) -> EngineResult<Vec<Chunk>> {
        let existing = self.get_chunks(axis, parent)?.unwrap_or_default();
        Ok(existing
            .into_iter()
            .filter(|c| !new_chunks.contains(c))
            .collect())
    }

    /// Returns the resources that represent the chunk sets defining `node`'s
    /// axes, so that jobs depending on `node` become out of date when an
    /// ancestor axis is reshuffled.
    pub fn get_node_inputs(&self, node: &Node) -> Vec<ResourceKey> {
        let producers = self.producers.read();
        let mut out = Vec::new();
        for i in 0..node.len() {
            let parent = node.prefix(i);
            let axis = node.0[i].0.clone();
            if let Some(res) = producers.get(&AxisKey { axis, parent }) {
                out.push(res.clone());
            }
        }
        out
    }
}
