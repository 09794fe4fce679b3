//! Mutable engine state and the immutable context it is interpreted in.
//!
//! `StoreState` is everything the writer lock guards. `EngineContext` is
//! frozen at construction and shared freely between readers and the writer.

use std::sync::Arc;

use rand::SeedableRng;
use rand::rngs::SmallRng;
use tracing::debug;

use crate::arena::NodeArena;
use crate::config::EngineConfig;
use crate::emergence::EmergenceClock;
use crate::error::Result;
use crate::node::{ConsolidationState, MemoryNode, NodeId};
use crate::projector::LatticeProjector;
use crate::roots::RootSystem;
use crate::rotor::Rotor;
use crate::shell_index::ShellIndex;

/// Validated configuration plus the frozen geometry built from it.
#[derive(Clone, Debug)]
pub struct EngineContext {
    pub config: EngineConfig,
    pub roots: Arc<RootSystem>,
    pub projector: LatticeProjector,
    pub clock: EmergenceClock,
}

impl EngineContext {
    pub fn new(
        config: EngineConfig,
        roots: Arc<RootSystem>,
        projector: LatticeProjector,
    ) -> Result<Self> {
        config.validate()?;
        let clock = EmergenceClock::new(&config.emergence)?;
        Ok(Self {
            config,
            roots,
            projector,
            clock,
        })
    }
}

/// How a new node enters the arena, beyond its embedding.
#[derive(Clone, Copy, Debug)]
pub struct Admission {
    pub created_at: u64,
    pub entropy: f64,
    pub state: ConsolidationState,
    pub rotor: Rotor,
}

impl Admission {
    pub fn fresh(created_at: u64, entropy: f64) -> Self {
        Self {
            created_at,
            entropy,
            state: ConsolidationState::Active,
            rotor: Rotor::identity(),
        }
    }
}

/// Everything guarded by the store's writer lock.
#[derive(Clone, Debug)]
pub struct StoreState {
    pub arena: NodeArena,
    pub index: ShellIndex,
    pub merge_count: u64,
    pub reseed_count: u64,
    pub ingests_since_maintenance: u64,
    pub rng: SmallRng,
}

impl StoreState {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            arena: NodeArena::new(),
            index: ShellIndex::new(config.index.anneal_threshold),
            merge_count: 0,
            reseed_count: 0,
            ingests_since_maintenance: 0,
            rng: SmallRng::seed_from_u64(config.seed),
        }
    }

    /// The single ingest path: project, index, link to nearest neighbors.
    /// Nothing is mutated unless every step succeeds.
    pub fn admit(
        &mut self,
        ctx: &EngineContext,
        embedding: Vec<f64>,
        admission: Admission,
    ) -> Result<NodeId> {
        let projection = ctx.projector.project(&embedding)?;
        let params = ctx
            .clock
            .params_for_root(ctx.roots.root(projection.nearest_root_id));

        let id = self.arena.next_id();
        let mut node = MemoryNode::new(
            id,
            embedding,
            &projection,
            params,
            admission.entropy,
            admission.created_at,
        );
        node.consolidation_state = admission.state;
        node.rotor = admission.rotor;

        let graph = &ctx.config.graph;
        let neighbors = self
            .index
            .query_knn(&projection.lattice_coord, graph.link_neighbors);

        self.index.insert(&node)?;
        if let Err(err) = self.arena.insert(node) {
            self.index.remove(id);
            return Err(err);
        }

        for (neighbor, distance) in neighbors {
            let weight = 1.0 / (1.0 + distance);
            self.arena.link(id, neighbor, weight, graph.max_edge_weight);
            self.arena.link(neighbor, id, weight, graph.max_edge_weight);
        }

        debug!(id, shell = projection.shell, root = projection.nearest_root_id, "node admitted");
        Ok(id)
    }

    pub fn live_count(&self) -> usize {
        self.index.len()
    }
}
