//! Shell-partitioned spatial index.
//!
//! Every live node sits in exactly one bucket, keyed by its shell. A bucket is
//! a static k-d tree plus a small overlay of pending inserts and tombstones,
//! re-annealed into a fresh tree once the overlay grows past the configured
//! threshold. Queries see tree ∪ pending − tombstones, so results are exact at
//! every point of the cycle.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use crate::error::{CoreError, Result};
use crate::kdtree::{KdTree, KnnHeap};
use crate::node::{MemoryNode, NodeId};
use crate::projector::shell_of;
use crate::vector::{Vec8, distance_sq, norm};

#[derive(Clone, Debug, Default)]
struct ShellBucket {
    /// Authoritative membership.
    points: BTreeMap<NodeId, Vec8>,
    tree: KdTree,
    /// In `points` but not (validly) in `tree`.
    pending: BTreeSet<NodeId>,
    /// In `tree` but stale: removed, or re-inserted and now pending.
    tombstones: BTreeSet<NodeId>,
}

impl ShellBucket {
    fn insert(&mut self, id: NodeId, coord: Vec8) {
        self.points.insert(id, coord);
        self.pending.insert(id);
    }

    fn remove(&mut self, id: NodeId) -> bool {
        if self.points.remove(&id).is_none() {
            return false;
        }
        // A pending id keeps whatever tombstone its stale tree copy already has.
        if !self.pending.remove(&id) {
            self.tombstones.insert(id);
        }
        true
    }

    fn overlay_len(&self) -> usize {
        self.pending.len() + self.tombstones.len()
    }

    fn anneal(&mut self) {
        let points: Vec<(NodeId, Vec8)> = self.points.iter().map(|(id, p)| (*id, *p)).collect();
        self.tree = KdTree::build(points);
        self.pending.clear();
        self.tombstones.clear();
    }

    fn knn_into(&self, coord: &Vec8, heap: &mut KnnHeap) {
        let tombstones = &self.tombstones;
        self.tree.nearest(coord, heap, &|id| tombstones.contains(&id));
        for id in &self.pending {
            if let Some(p) = self.points.get(id) {
                heap.offer(*id, distance_sq(coord, p));
            }
        }
    }

    fn within_into(&self, coord: &Vec8, radius_sq: f64, out: &mut Vec<(NodeId, f64)>) {
        let tombstones = &self.tombstones;
        self.tree.within(coord, radius_sq, out, &|id| tombstones.contains(&id));
        for id in &self.pending {
            if let Some(p) = self.points.get(id) {
                let d = distance_sq(coord, p);
                if d <= radius_sq {
                    out.push((*id, d));
                }
            }
        }
    }
}

/// Spatial index of live nodes, partitioned by shell.
#[derive(Clone, Debug)]
pub struct ShellIndex {
    buckets: BTreeMap<u32, ShellBucket>,
    locations: BTreeMap<NodeId, u32>,
    anneal_threshold: usize,
}

impl ShellIndex {
    pub fn new(anneal_threshold: usize) -> Self {
        Self {
            buckets: BTreeMap::new(),
            locations: BTreeMap::new(),
            anneal_threshold,
        }
    }

    /// Admit a live node. Rejects duplicates, merged nodes and nodes whose
    /// shell disagrees with their coordinate.
    pub fn insert(&mut self, node: &MemoryNode) -> Result<()> {
        if !node.is_live() {
            return Err(reject(format!("node {} is merged and cannot be indexed", node.id)));
        }
        if let Some(shell) = self.locations.get(&node.id) {
            return Err(reject(format!("node {} is already indexed in shell {shell}", node.id)));
        }
        let expected = shell_of(&node.lattice_coord);
        if expected != node.shell_index {
            return Err(reject(format!(
                "node {} claims shell {} but its coordinate lies in shell {expected}",
                node.id, node.shell_index
            )));
        }

        let threshold = self.anneal_threshold;
        let bucket = self.buckets.entry(node.shell_index).or_default();
        bucket.insert(node.id, node.lattice_coord);
        if bucket.overlay_len() > threshold {
            debug!(shell = node.shell_index, size = bucket.points.len(), "annealing shell");
            bucket.anneal();
        }
        self.locations.insert(node.id, node.shell_index);
        Ok(())
    }

    /// Remove a node. Returns false (and does nothing) if it is not indexed.
    pub fn remove(&mut self, id: NodeId) -> bool {
        let Some(shell) = self.locations.remove(&id) else {
            return false;
        };
        let threshold = self.anneal_threshold;
        if let Some(bucket) = self.buckets.get_mut(&shell) {
            bucket.remove(id);
            if bucket.points.is_empty() {
                self.buckets.remove(&shell);
            } else if bucket.overlay_len() > threshold {
                debug!(shell, size = bucket.points.len(), "annealing shell");
                bucket.anneal();
            }
        }
        true
    }

    /// Move a node whose shell or coordinate changed.
    pub fn reindex(&mut self, node: &MemoryNode) -> Result<()> {
        self.remove(node.id);
        self.insert(node)
    }

    /// Exact k nearest live nodes, ordered by (distance, id).
    ///
    /// Buckets are visited by ascending distance lower bound, which puts the
    /// query's own shell first, and the search stops widening once no further
    /// bucket can improve on the k-th result.
    pub fn query_knn(&self, coord: &Vec8, k: usize) -> Vec<(NodeId, f64)> {
        if k == 0 || self.locations.is_empty() {
            return Vec::new();
        }

        let q = norm(coord);
        let mut order: Vec<(f64, u32)> = self
            .buckets
            .keys()
            .map(|&shell| (shell_distance_bound(shell, q), shell))
            .collect();
        order.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        let mut heap = KnnHeap::new(k.min(self.locations.len()));
        for (bound, shell) in order {
            if !heap.admits(bound * bound) {
                break;
            }
            if let Some(bucket) = self.buckets.get(&shell) {
                bucket.knn_into(coord, &mut heap);
            }
        }
        heap.into_sorted()
    }

    /// Ids of every node in shells `lo..=hi`.
    pub fn query_shell_range(&self, lo: u32, hi: u32) -> BTreeSet<NodeId> {
        if lo > hi {
            return BTreeSet::new();
        }
        self.buckets
            .range(lo..=hi)
            .flat_map(|(_, bucket)| bucket.points.keys().copied())
            .collect()
    }

    /// Nodes of one shell within `radius` of `coord`, ordered by (distance, id).
    pub fn query_radius(&self, shell: u32, coord: &Vec8, radius: f64) -> Vec<(NodeId, f64)> {
        let Some(bucket) = self.buckets.get(&shell) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        bucket.within_into(coord, radius * radius, &mut out);
        out.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        out.into_iter().map(|(id, d)| (id, d.sqrt())).collect()
    }

    /// Members of one shell in id order.
    pub fn shell_members(&self, shell: u32) -> impl Iterator<Item = (NodeId, &Vec8)> {
        self.buckets
            .get(&shell)
            .into_iter()
            .flat_map(|bucket| bucket.points.iter().map(|(id, p)| (*id, p)))
    }

    pub fn shell_histogram(&self) -> BTreeMap<u32, usize> {
        self.buckets
            .iter()
            .map(|(shell, bucket)| (*shell, bucket.points.len()))
            .collect()
    }

    /// Non-empty shells in ascending order.
    pub fn shells(&self) -> impl Iterator<Item = u32> + '_ {
        self.buckets.keys().copied()
    }

    pub fn shell_for(&self, id: NodeId) -> Option<u32> {
        self.locations.get(&id).copied()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.locations.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    /// Rebuild every bucket's tree.
    pub fn anneal_all(&mut self) {
        for bucket in self.buckets.values_mut() {
            bucket.anneal();
        }
    }
}

/// Lower bound on the distance from a point of norm `q` to any point of
/// `shell`, whose squared norms lie in `[2s - 1, 2s + 1]`.
fn shell_distance_bound(shell: u32, q: f64) -> f64 {
    let s = shell as f64;
    let inner = (2.0 * s - 1.0).max(0.0).sqrt();
    let outer = (2.0 * s + 1.0).sqrt();
    (inner - q).max(q - outer).max(0.0)
}

fn reject(msg: String) -> CoreError {
    warn!(reason = %msg, "index insert rejected");
    CoreError::IndexConsistency(msg)
}
