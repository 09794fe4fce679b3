//! JSON serde for the persisted engine state.
//!
//! A snapshot carries everything needed to resume: the 240 roots (re-validated
//! on load), the frozen projection matrix, every node record including merged
//! ones, lineage and counters. Field names are camelCase and rotors are
//! `[w, x, y, z]` arrays.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::arena::NodeArena;
use crate::error::{CoreError, Result};
use crate::node::{ConsolidationState, Edge, EmergenceParams, MemoryNode, NodeId};
use crate::projector::{Projection, ProjectionMatrix};
use crate::rotor::Rotor;
use crate::vector::Vec8;

pub const CURRENT_VERSION: &str = "1.0.0";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub version: String,
    pub timestamp: String,
    pub roots: Vec<Vec8>,
    pub projection: WireProjection,
    pub nodes: Vec<WireNode>,
    #[serde(rename = "nextId")]
    pub next_id: NodeId,
    #[serde(default)]
    pub lineage: Vec<WireLineage>,
    #[serde(rename = "mergeCount", default)]
    pub merge_count: u64,
    #[serde(rename = "reseedCount", default)]
    pub reseed_count: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireProjection {
    #[serde(rename = "inputDim")]
    pub input_dim: usize,
    #[serde(rename = "latticeScale")]
    pub lattice_scale: f64,
    /// Row-major `inputDim × 8`.
    pub values: Vec<f64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireNode {
    pub id: NodeId,
    #[serde(rename = "rawEmbedding")]
    pub raw_embedding: Vec<f64>,
    #[serde(rename = "latticeCoord")]
    pub lattice_coord: Vec8,
    #[serde(rename = "nearestRootId")]
    pub nearest_root_id: usize,
    pub shell: u32,
    pub rotor: [f64; 4],
    pub entropy: f64,
    #[serde(rename = "createdAt")]
    pub created_at: u64,
    #[serde(rename = "qInfinity")]
    pub q_infinity: f64,
    #[serde(rename = "sQ")]
    pub s_q: f64,
    pub state: ConsolidationState,
    #[serde(default)]
    pub edges: Vec<WireEdge>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireEdge {
    pub to: NodeId,
    pub weight: f64,
    pub rotor: [f64; 4],
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireLineage {
    pub summary: NodeId,
    pub members: Vec<NodeId>,
    #[serde(default)]
    pub reseeds: u32,
}

impl WireNode {
    pub fn from_node(node: &MemoryNode) -> Self {
        Self {
            id: node.id,
            raw_embedding: node.raw_embedding().to_vec(),
            lattice_coord: node.lattice_coord,
            nearest_root_id: node.nearest_root_id,
            shell: node.shell_index,
            rotor: node.rotor.to_array(),
            entropy: node.entropy(),
            created_at: node.created_at,
            q_infinity: node.emergence.q_infinity,
            s_q: node.emergence.s_q,
            state: node.consolidation_state,
            edges: node
                .edges
                .iter()
                .map(|(to, e)| WireEdge {
                    to: *to,
                    weight: e.weight,
                    rotor: e.rotor.to_array(),
                })
                .collect(),
        }
    }

    /// Rebuild the domain node. Rejects values the live engine could never
    /// have produced.
    pub fn into_node(self) -> Result<MemoryNode> {
        if !(self.entropy.is_finite() && self.entropy >= 0.0) {
            return Err(CoreError::IndexConsistency(format!(
                "node {} has invalid entropy {}",
                self.id, self.entropy
            )));
        }
        for (field, value) in [("qInfinity", self.q_infinity), ("sQ", self.s_q)] {
            if !(value.is_finite() && value > 0.0) {
                return Err(CoreError::IndexConsistency(format!(
                    "node {} has invalid {field} {value}",
                    self.id
                )));
            }
        }
        if self.nearest_root_id >= crate::constants::ROOT_COUNT {
            return Err(CoreError::IndexConsistency(format!(
                "node {} references root {}",
                self.id, self.nearest_root_id
            )));
        }
        let projection = Projection {
            reduced: self.lattice_coord,
            lattice_coord: self.lattice_coord,
            nearest_root_id: self.nearest_root_id,
            shell: self.shell,
        };
        let mut node = MemoryNode::new(
            self.id,
            self.raw_embedding,
            &projection,
            EmergenceParams {
                q_infinity: self.q_infinity,
                s_q: self.s_q,
            },
            self.entropy,
            self.created_at,
        );
        node.rotor = Rotor::from_array(self.rotor);
        node.consolidation_state = self.state;
        node.edges = self
            .edges
            .into_iter()
            .map(|e| {
                (
                    e.to,
                    Edge {
                        weight: e.weight,
                        rotor: Rotor::from_array(e.rotor),
                    },
                )
            })
            .collect();
        Ok(node)
    }
}

impl Snapshot {
    pub fn projection_matrix(&self) -> Result<ProjectionMatrix> {
        ProjectionMatrix::from_values(self.projection.input_dim, self.projection.values.clone())
    }

    /// Nodes, lineage and reseed counts as a validated arena.
    pub fn arena(&self) -> Result<NodeArena> {
        let nodes = self
            .nodes
            .iter()
            .cloned()
            .map(WireNode::into_node)
            .collect::<Result<Vec<_>>>()?;
        let mut lineage = BTreeMap::new();
        let mut reseeds = BTreeMap::new();
        for entry in &self.lineage {
            lineage.insert(entry.summary, entry.members.clone());
            if entry.reseeds > 0 {
                reseeds.insert(entry.summary, entry.reseeds);
            }
        }
        NodeArena::from_parts(nodes, self.next_id, lineage, reseeds)
    }
}

pub fn import_json(json: &str) -> std::result::Result<Snapshot, serde_json::Error> {
    serde_json::from_str(json)
}

pub fn export_json(snapshot: &Snapshot) -> std::result::Result<String, serde_json::Error> {
    serde_json::to_string_pretty(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::memory::MemoryStore;

    fn populated() -> MemoryStore {
        let store = MemoryStore::new(EngineConfig {
            embed_dim: 8,
            ..EngineConfig::default()
        })
        .unwrap();
        for v in [
            [2.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            [2.0, 0.1, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0],
        ] {
            store.ingest_at(&v, 1_000).unwrap();
        }
        store.scan_and_merge(0.01).unwrap();
        store
    }

    #[test]
    fn test_version_field() {
        let json = export_json(&populated().snapshot()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["version"], CURRENT_VERSION);
        assert!(value["nodes"][0]["rawEmbedding"].is_array());
        assert_eq!(value["projection"]["inputDim"], 8);
    }

    #[test]
    fn test_roundtrip_preserves_nodes_and_lineage() {
        let snapshot = populated().snapshot();
        let json = export_json(&snapshot).unwrap();
        let back = import_json(&json).unwrap();
        assert_eq!(back.nodes.len(), snapshot.nodes.len());
        assert_eq!(back.lineage, snapshot.lineage);
        assert_eq!(back.merge_count, 1);

        let arena = back.arena().unwrap();
        assert_eq!(arena.len(), 4);
        let merged = arena
            .nodes()
            .filter(|n| matches!(n.consolidation_state, ConsolidationState::Merged { .. }))
            .count();
        assert_eq!(merged, 2);
    }

    #[test]
    fn test_negative_entropy_rejected() {
        let mut snapshot = populated().snapshot();
        snapshot.nodes[0].entropy = -1.0;
        assert!(matches!(snapshot.arena(), Err(CoreError::IndexConsistency(_))));
    }

    #[test]
    fn test_non_positive_emergence_rate_rejected() {
        for s_q in [-0.5, 0.0, f64::NAN, f64::INFINITY] {
            let mut snapshot = populated().snapshot();
            snapshot.nodes[0].s_q = s_q;
            assert!(matches!(snapshot.arena(), Err(CoreError::IndexConsistency(_))), "s_q={s_q}");
        }
    }

    #[test]
    fn test_non_finite_ceiling_rejected() {
        for q_infinity in [f64::NAN, f64::NEG_INFINITY, -1.0] {
            let mut snapshot = populated().snapshot();
            snapshot.nodes[1].q_infinity = q_infinity;
            assert!(matches!(snapshot.arena(), Err(CoreError::IndexConsistency(_))));
        }
    }

    #[test]
    fn test_state_tag_on_wire() {
        let node = &populated().snapshot().nodes[0];
        let json = serde_json::to_value(node).unwrap();
        assert_eq!(json["state"]["state"], "merged");
    }
}
