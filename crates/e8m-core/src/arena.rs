//! Flat id-keyed arena owning every node.
//!
//! Nodes never own each other: edges, merge parents and lineage all refer to
//! ids. The arena keeps the derived parent → children index that merge
//! flattening needs, and the summary → absorbed-members lineage that reseed
//! draws from.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{CoreError, Result};
use crate::node::{ConsolidationState, Edge, MemoryNode, NodeId};
use crate::rotor::Rotor;

#[derive(Clone, Debug, Default)]
pub struct NodeArena {
    nodes: BTreeMap<NodeId, MemoryNode>,
    next_id: NodeId,
    /// Merge parent → nodes currently `Merged { parent }`.
    children: BTreeMap<NodeId, BTreeSet<NodeId>>,
    /// Summary → members absorbed when it was created.
    lineage: BTreeMap<NodeId, Vec<NodeId>>,
    /// Reseed calls served per summary.
    reseeds: BTreeMap<NodeId, u32>,
}

impl NodeArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild an arena from persisted parts, checking every cross-reference.
    pub fn from_parts(
        nodes: Vec<MemoryNode>,
        next_id: NodeId,
        lineage: BTreeMap<NodeId, Vec<NodeId>>,
        reseeds: BTreeMap<NodeId, u32>,
    ) -> Result<Self> {
        let mut arena = Self {
            next_id,
            lineage,
            reseeds,
            ..Self::default()
        };
        for node in nodes {
            arena.insert(node)?;
        }

        for node in arena.nodes.values() {
            if !node.entropy().is_finite() {
                return Err(inconsistent(format!("node {} has non-finite entropy", node.id)));
            }
            if let Some(parent) = node.consolidation_state.parent() {
                match arena.nodes.get(&parent) {
                    None => {
                        return Err(inconsistent(format!(
                            "node {} is merged into missing node {parent}",
                            node.id
                        )));
                    }
                    Some(p) if !p.is_live() => {
                        return Err(inconsistent(format!(
                            "node {} is merged into merged node {parent}",
                            node.id
                        )));
                    }
                    Some(_) => {}
                }
            }
            if let Some(target) = node.edges.keys().find(|t| !arena.nodes.contains_key(t)) {
                return Err(inconsistent(format!(
                    "node {} has an edge to missing node {target}",
                    node.id
                )));
            }
        }
        for (summary, members) in &arena.lineage {
            if let Some(missing) = std::iter::once(summary)
                .chain(members)
                .find(|id| !arena.nodes.contains_key(id))
            {
                return Err(inconsistent(format!(
                    "lineage of {summary} references missing node {missing}"
                )));
            }
        }

        let mut children: BTreeMap<NodeId, BTreeSet<NodeId>> = BTreeMap::new();
        for node in arena.nodes.values() {
            if let Some(parent) = node.consolidation_state.parent() {
                children.entry(parent).or_default().insert(node.id);
            }
        }
        arena.children = children;
        Ok(arena)
    }

    /// Id the next inserted node should take.
    pub fn next_id(&self) -> NodeId {
        self.next_id
    }

    pub fn insert(&mut self, node: MemoryNode) -> Result<()> {
        if self.nodes.contains_key(&node.id) {
            return Err(inconsistent(format!("duplicate node id {}", node.id)));
        }
        self.next_id = self.next_id.max(node.id + 1);
        self.nodes.insert(node.id, node);
        Ok(())
    }

    pub fn get(&self, id: NodeId) -> Option<&MemoryNode> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut MemoryNode> {
        self.nodes.get_mut(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &MemoryNode> {
        self.nodes.values()
    }

    /// Mark `id` as absorbed into `parent`. Anything previously merged into
    /// `id` is re-parented to `parent`, so no merge chains form.
    pub fn mark_merged(&mut self, id: NodeId, parent: NodeId) -> Result<()> {
        if !self.nodes.get(&parent).is_some_and(MemoryNode::is_live) {
            return Err(inconsistent(format!("merge parent {parent} is not a live node")));
        }
        let node = self
            .nodes
            .get_mut(&id)
            .ok_or(CoreError::UnknownNode(id))?;
        node.consolidation_state = ConsolidationState::Merged { parent };
        node.edges.clear();

        let mut moved = self.children.remove(&id).unwrap_or_default();
        for child in &moved {
            if let Some(c) = self.nodes.get_mut(child) {
                c.consolidation_state = ConsolidationState::Merged { parent };
            }
        }
        moved.insert(id);
        self.children.entry(parent).or_default().extend(moved);
        Ok(())
    }

    #[cfg(test)]
    pub fn children_of(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.children.get(&id).into_iter().flatten().copied()
    }

    pub fn record_lineage(&mut self, summary: NodeId, members: Vec<NodeId>) {
        self.lineage.insert(summary, members);
    }

    pub fn lineage(&self, id: NodeId) -> Option<&[NodeId]> {
        self.lineage.get(&id).map(Vec::as_slice)
    }

    pub fn lineages(&self) -> &BTreeMap<NodeId, Vec<NodeId>> {
        &self.lineage
    }

    pub fn reseeds(&self) -> &BTreeMap<NodeId, u32> {
        &self.reseeds
    }

    pub fn reseed_count(&self, id: NodeId) -> u32 {
        self.reseeds.get(&id).copied().unwrap_or(0)
    }

    pub fn note_reseed(&mut self, id: NodeId) {
        *self.reseeds.entry(id).or_insert(0) += 1;
    }

    /// Set `from → to`, keeping the heavier weight if the edge exists.
    pub fn link(&mut self, from: NodeId, to: NodeId, weight: f64, max_weight: f64) {
        if from == to {
            return;
        }
        let Some(rotor) = self.relation(from, to) else {
            return;
        };
        if let Some(node) = self.nodes.get_mut(&from) {
            let weight = weight.clamp(0.0, max_weight);
            node.edges
                .entry(to)
                .and_modify(|e| e.weight = e.weight.max(weight))
                .or_insert(Edge { weight, rotor });
        }
    }

    /// Strengthen `from → to` by `delta`, creating the edge if absent.
    pub fn reinforce(&mut self, from: NodeId, to: NodeId, delta: f64, max_weight: f64) {
        if from == to {
            return;
        }
        let Some(rotor) = self.relation(from, to) else {
            return;
        };
        if let Some(node) = self.nodes.get_mut(&from) {
            node.edges
                .entry(to)
                .or_insert(Edge { weight: 0.0, rotor })
                .reinforce(delta, max_weight);
        }
    }

    /// Rewire every edge touching `absorbed` onto `summary`. Parallel edges
    /// collapse to the heaviest.
    pub fn redirect_edges(
        &mut self,
        absorbed: &BTreeSet<NodeId>,
        summary: NodeId,
        max_weight: f64,
    ) {
        let mut inbound: Vec<(NodeId, f64)> = Vec::new();
        let mut outbound: Vec<(NodeId, f64)> = Vec::new();

        for node in self.nodes.values_mut() {
            if absorbed.contains(&node.id) {
                for (target, edge) in &node.edges {
                    if !absorbed.contains(target) && *target != summary {
                        outbound.push((*target, edge.weight));
                    }
                }
                continue;
            }
            let stale: Vec<NodeId> = node
                .edges
                .keys()
                .filter(|t| absorbed.contains(t))
                .copied()
                .collect();
            for target in stale {
                if let Some(edge) = node.edges.remove(&target) {
                    if node.id != summary {
                        inbound.push((node.id, edge.weight));
                    }
                }
            }
        }

        for (from, weight) in inbound {
            self.link(from, summary, weight, max_weight);
        }
        for (to, weight) in outbound {
            self.link(summary, to, weight, max_weight);
        }
    }

    pub fn edge_count(&self) -> usize {
        self.nodes.values().map(|n| n.edges.len()).sum()
    }

    fn relation(&self, from: NodeId, to: NodeId) -> Option<Rotor> {
        let a = self.nodes.get(&from)?;
        let b = self.nodes.get(&to)?;
        Some(Rotor::between(&a.lattice_coord, &b.lattice_coord))
    }
}

fn inconsistent(msg: String) -> CoreError {
    CoreError::IndexConsistency(msg)
}
