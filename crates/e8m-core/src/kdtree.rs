//! Static balanced k-d tree over 8D points.
//!
//! The tree is implicit: `build` reorders the point array so that every
//! subrange `[lo, hi)` has its splitting point at `lo + (hi - lo) / 2`, split
//! on axis `depth % 8`. Rebuilding is the only way to change it; the shell
//! index layers pending inserts and tombstones on top.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::constants::LATTICE_DIM;
use crate::node::NodeId;
use crate::vector::{Vec8, distance_sq};

#[derive(Clone, Debug, Default)]
pub struct KdTree {
    points: Vec<(NodeId, Vec8)>,
}

impl KdTree {
    pub fn build(mut points: Vec<(NodeId, Vec8)>) -> Self {
        build_range(&mut points, 0);
        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[(NodeId, Vec8)] {
        &self.points
    }

    /// Offer every point that could enter `heap` to it. Points for which
    /// `skip` returns true are ignored.
    pub fn nearest(&self, target: &Vec8, heap: &mut KnnHeap, skip: &impl Fn(NodeId) -> bool) {
        self.nearest_range(0, self.points.len(), 0, target, heap, skip);
    }

    /// Append `(id, distance_sq)` for every point within `radius_sq` of `target`.
    pub fn within(
        &self,
        target: &Vec8,
        radius_sq: f64,
        out: &mut Vec<(NodeId, f64)>,
        skip: &impl Fn(NodeId) -> bool,
    ) {
        self.within_range(0, self.points.len(), 0, target, radius_sq, out, skip);
    }

    fn nearest_range(
        &self,
        lo: usize,
        hi: usize,
        depth: usize,
        target: &Vec8,
        heap: &mut KnnHeap,
        skip: &impl Fn(NodeId) -> bool,
    ) {
        if lo >= hi {
            return;
        }
        let mid = lo + (hi - lo) / 2;
        let axis = depth % LATTICE_DIM;
        let (id, point) = &self.points[mid];
        let diff = target[axis] - point[axis];

        let (near, far) = if diff <= 0.0 {
            ((lo, mid), (mid + 1, hi))
        } else {
            ((mid + 1, hi), (lo, mid))
        };

        self.nearest_range(near.0, near.1, depth + 1, target, heap, skip);
        if !skip(*id) {
            heap.offer(*id, distance_sq(target, point));
        }
        if heap.admits(diff * diff) {
            self.nearest_range(far.0, far.1, depth + 1, target, heap, skip);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn within_range(
        &self,
        lo: usize,
        hi: usize,
        depth: usize,
        target: &Vec8,
        radius_sq: f64,
        out: &mut Vec<(NodeId, f64)>,
        skip: &impl Fn(NodeId) -> bool,
    ) {
        if lo >= hi {
            return;
        }
        let mid = lo + (hi - lo) / 2;
        let axis = depth % LATTICE_DIM;
        let (id, point) = &self.points[mid];
        let diff = target[axis] - point[axis];

        let d = distance_sq(target, point);
        if d <= radius_sq && !skip(*id) {
            out.push((*id, d));
        }
        if diff <= 0.0 || diff * diff <= radius_sq {
            self.within_range(lo, mid, depth + 1, target, radius_sq, out, skip);
        }
        if diff >= 0.0 || diff * diff <= radius_sq {
            self.within_range(mid + 1, hi, depth + 1, target, radius_sq, out, skip);
        }
    }
}

fn build_range(points: &mut [(NodeId, Vec8)], depth: usize) {
    if points.len() <= 1 {
        return;
    }
    let axis = depth % LATTICE_DIM;
    let mid = points.len() / 2;
    points.select_nth_unstable_by(mid, |a, b| {
        a.1[axis].total_cmp(&b.1[axis]).then(a.0.cmp(&b.0))
    });
    let (left, right) = points.split_at_mut(mid);
    build_range(left, depth + 1);
    build_range(&mut right[1..], depth + 1);
}

#[derive(Clone, Copy, Debug)]
struct Candidate {
    dist_sq: f64,
    id: NodeId,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist_sq
            .total_cmp(&other.dist_sq)
            .then(self.id.cmp(&other.id))
    }
}

/// Bounded max-heap keeping the k best `(distance, id)` pairs seen so far.
#[derive(Debug)]
pub struct KnnHeap {
    k: usize,
    heap: BinaryHeap<Candidate>,
}

impl KnnHeap {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            heap: BinaryHeap::new(),
        }
    }

    pub fn offer(&mut self, id: NodeId, dist_sq: f64) {
        if self.k == 0 {
            return;
        }
        let candidate = Candidate { dist_sq, id };
        if self.heap.len() < self.k {
            self.heap.push(candidate);
        } else if self.heap.peek().is_some_and(|worst| candidate < *worst) {
            self.heap.pop();
            self.heap.push(candidate);
        }
    }

    pub fn is_full(&self) -> bool {
        self.heap.len() >= self.k
    }

    /// Squared distance of the current k-th result, once k are held.
    pub fn worst_dist_sq(&self) -> Option<f64> {
        if self.is_full() {
            self.heap.peek().map(|c| c.dist_sq)
        } else {
            None
        }
    }

    /// Could a point at squared distance `bound_sq` still enter the heap?
    /// Equal distances can win on id, so the comparison is inclusive.
    pub fn admits(&self, bound_sq: f64) -> bool {
        self.worst_dist_sq().is_none_or(|worst| bound_sq <= worst)
    }

    /// Results ordered by (distance, id), distances un-squared.
    pub fn into_sorted(self) -> Vec<(NodeId, f64)> {
        self.heap
            .into_sorted_vec()
            .into_iter()
            .map(|c| (c.id, c.dist_sq.sqrt()))
            .collect()
    }
}
