use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::projector::Projection;
use crate::rotor::Rotor;
use crate::vector::Vec8;

/// Arena key. Assigned monotonically, never reused.
pub type NodeId = u64;

/// Where a node sits in the merge/reseed lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConsolidationState {
    Active,
    /// Absorbed into a summary. Kept for lineage, never indexed.
    Merged { parent: NodeId },
    /// Derived from a summary's lineage. Indexed and retrievable like `Active`.
    Seed { origin: NodeId },
}

impl ConsolidationState {
    /// Live nodes are indexed and eligible for retrieval.
    pub fn is_live(&self) -> bool {
        !matches!(self, Self::Merged { .. })
    }

    pub fn parent(&self) -> Option<NodeId> {
        match self {
            Self::Merged { parent } => Some(*parent),
            _ => None,
        }
    }
}

/// Emergence parameters fixed at creation.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmergenceParams {
    pub q_infinity: f64,
    /// Rate per second.
    pub s_q: f64,
}

/// Directed edge payload.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub weight: f64,
    pub rotor: Rotor,
}

impl Edge {
    /// Add `delta` to the weight, clamped to `[0, max]`.
    pub fn reinforce(&mut self, delta: f64, max: f64) {
        self.weight = (self.weight + delta).clamp(0.0, max);
    }
}

/// One stored memory.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemoryNode {
    pub id: NodeId,
    raw_embedding: Vec<f64>,
    pub lattice_coord: Vec8,
    pub nearest_root_id: usize,
    pub shell_index: u32,
    pub rotor: Rotor,
    entropy: f64,
    /// Unix milliseconds.
    pub created_at: u64,
    pub emergence: EmergenceParams,
    pub consolidation_state: ConsolidationState,
    pub edges: BTreeMap<NodeId, Edge>,
}

impl MemoryNode {
    pub fn new(
        id: NodeId,
        raw_embedding: Vec<f64>,
        projection: &Projection,
        emergence: EmergenceParams,
        entropy: f64,
        created_at: u64,
    ) -> Self {
        Self {
            id,
            raw_embedding,
            lattice_coord: projection.lattice_coord,
            nearest_root_id: projection.nearest_root_id,
            shell_index: projection.shell,
            rotor: Rotor::identity(),
            entropy: sanitize_entropy(entropy),
            created_at,
            emergence,
            consolidation_state: ConsolidationState::Active,
            edges: BTreeMap::new(),
        }
    }

    /// Original embedding. Read-only after creation.
    pub fn raw_embedding(&self) -> &[f64] {
        &self.raw_embedding
    }

    pub fn entropy(&self) -> f64 {
        self.entropy
    }

    /// Negative and NaN values clamp to zero.
    pub fn set_entropy(&mut self, entropy: f64) {
        self.entropy = sanitize_entropy(entropy);
    }

    /// Remove `fraction` of the current entropy.
    pub fn cool(&mut self, fraction: f64) {
        self.set_entropy(self.entropy * (1.0 - fraction.clamp(0.0, 1.0)));
    }

    pub fn is_live(&self) -> bool {
        self.consolidation_state.is_live()
    }
}

fn sanitize_entropy(entropy: f64) -> f64 {
    if entropy.is_nan() { 0.0 } else { entropy.max(0.0) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_node(entropy: f64) -> MemoryNode {
        let projection = Projection {
            reduced: [2.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            lattice_coord: [2.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            nearest_root_id: 0,
            shell: 2,
        };
        MemoryNode::new(
            7,
            vec![2.0, 0.0],
            &projection,
            EmergenceParams {
                q_infinity: 1.0,
                s_q: 0.1,
            },
            entropy,
            1_000,
        )
    }

    #[test]
    fn test_new_node_is_active_with_identity_rotor() {
        let node = make_node(1.0);
        assert_eq!(node.consolidation_state, ConsolidationState::Active);
        assert_eq!(node.rotor, Rotor::identity());
        assert_eq!(node.shell_index, 2);
        assert!(node.edges.is_empty());
    }

    #[test]
    fn test_entropy_never_negative() {
        let mut node = make_node(-3.0);
        assert_eq!(node.entropy(), 0.0);
        node.set_entropy(f64::NAN);
        assert_eq!(node.entropy(), 0.0);
        node.set_entropy(2.0);
        node.cool(0.25);
        assert!((node.entropy() - 1.5).abs() < 1e-12);
        node.cool(5.0);
        assert_eq!(node.entropy(), 0.0);
    }

    #[test]
    fn test_state_liveness() {
        assert!(ConsolidationState::Active.is_live());
        assert!(ConsolidationState::Seed { origin: 1 }.is_live());
        let merged = ConsolidationState::Merged { parent: 4 };
        assert!(!merged.is_live());
        assert_eq!(merged.parent(), Some(4));
    }

    #[test]
    fn test_edge_reinforce_clamps() {
        let mut edge = Edge {
            weight: 9.95,
            rotor: Rotor::identity(),
        };
        edge.reinforce(0.1, 10.0);
        assert_eq!(edge.weight, 10.0);
        edge.reinforce(-20.0, 10.0);
        assert_eq!(edge.weight, 0.0);
    }

    #[test]
    fn test_state_serde_tagged() {
        let json = serde_json::to_string(&ConsolidationState::Merged { parent: 3 }).unwrap();
        assert_eq!(json, r#"{"state":"merged","parent":3}"#);
        let back: ConsolidationState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ConsolidationState::Merged { parent: 3 });
    }
}
