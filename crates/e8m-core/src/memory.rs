//! `MemoryStore`: the façade owning all node state.
//!
//! State lives behind one `parking_lot::RwLock`. Ingest, consolidation and
//! retrieval-event recording take the write guard; scoring, kNN, stats and
//! snapshots take read guards and run concurrently with each other. Nothing
//! external is ever called while a guard is held.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::consolidation::{ConsolidationEngine, MergeEvent};
use crate::error::{CoreError, Result};
use crate::mood::MoodState;
use crate::node::{ConsolidationState, MemoryNode, NodeId};
use crate::policy::{ConsolidationPolicy, OutcomeScore, PolicyArm};
use crate::projector::{LatticeProjector, ProjectionMatrix};
use crate::retrieval::{RetrievalEngine, RetrievalHit};
use crate::roots::RootSystem;
use crate::shell_index::ShellIndex;
use crate::snapshot::{CURRENT_VERSION, Snapshot, WireLineage, WireNode, WireProjection};
use crate::state::{Admission, EngineContext, StoreState};
use crate::time::{millis_to_iso8601, now_unix_millis};
use crate::vector::Vec8;

/// Telemetry counters.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub node_count: usize,
    pub active_count: usize,
    pub seed_count: usize,
    pub merged_count: usize,
    pub shell_histogram: BTreeMap<u32, usize>,
    pub merge_count: u64,
    pub reseed_count: u64,
    pub edge_count: usize,
}

/// What one policy-driven consolidation cycle did.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub arm: PolicyArm,
    pub merges: Vec<MergeEvent>,
    pub reseed_parent: Option<NodeId>,
    pub seeds: Vec<NodeId>,
    pub outcome: OutcomeScore,
    pub reward: f64,
}

pub struct MemoryStore {
    ctx: EngineContext,
    state: RwLock<StoreState>,
}

impl MemoryStore {
    /// Validate the configuration and the root system, then build an empty store.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let roots = Arc::new(RootSystem::new()?);
        let projector = LatticeProjector::from_config(roots.clone(), &config);
        let ctx = EngineContext::new(config, roots, projector)?;
        let state = StoreState::new(&ctx.config);
        info!(
            embed_dim = ctx.config.embed_dim,
            seed = ctx.config.seed,
            "memory store initialized"
        );
        Ok(Self {
            ctx,
            state: RwLock::new(state),
        })
    }

    /// Resume from a snapshot. Persisted roots are re-validated before any
    /// node is trusted; the persisted projection matrix replaces the one the
    /// configuration would have generated.
    pub fn restore(mut config: EngineConfig, snapshot: &Snapshot) -> Result<Self> {
        let roots = Arc::new(RootSystem::from_roots(snapshot.roots.clone())?);
        let matrix = snapshot.projection_matrix()?;
        if matrix.input_dim() != config.embed_dim {
            warn!(
                configured = config.embed_dim,
                persisted = matrix.input_dim(),
                "embed_dim follows the persisted projection matrix"
            );
            config.embed_dim = matrix.input_dim();
        }
        config.projection.lattice_scale = snapshot.projection.lattice_scale;
        config.validate()?;

        let projector =
            LatticeProjector::new(roots.clone(), matrix, snapshot.projection.lattice_scale);
        let ctx = EngineContext::new(config, roots, projector)?;

        let arena = snapshot.arena()?;
        let input_dim = ctx.projector.input_dim();
        if let Some(node) = arena.nodes().find(|n| n.raw_embedding().len() != input_dim) {
            return Err(CoreError::IndexConsistency(format!(
                "node {} has a {}-dim embedding, projection expects {input_dim}",
                node.id,
                node.raw_embedding().len()
            )));
        }
        let mut index = ShellIndex::new(ctx.config.index.anneal_threshold);
        for node in arena.nodes().filter(|n| n.is_live()) {
            index.insert(node)?;
        }
        index.anneal_all();

        let state = StoreState {
            rng: SmallRng::seed_from_u64(ctx.config.seed ^ arena.next_id()),
            arena,
            index,
            merge_count: snapshot.merge_count,
            reseed_count: snapshot.reseed_count,
            ingests_since_maintenance: 0,
        };
        info!(nodes = state.arena.len(), live = state.index.len(), "memory store restored");
        Ok(Self {
            ctx,
            state: RwLock::new(state),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    pub fn ingest(&self, embedding: &[f64]) -> Result<NodeId> {
        self.ingest_at(embedding, now_unix_millis())
    }

    pub fn ingest_at(&self, embedding: &[f64], now: u64) -> Result<NodeId> {
        let entropy = self.ctx.config.consolidation.initial_entropy;
        let mut state = self.state.write();
        let id = state.admit(&self.ctx, embedding.to_vec(), Admission::fresh(now, entropy))?;
        state.ingests_since_maintenance += 1;
        Ok(id)
    }

    pub fn retrieve(&self, query: &[f64], mood: &MoodState, k: usize) -> Result<Vec<RetrievalHit>> {
        self.retrieve_at(query, mood, k, now_unix_millis())
    }

    pub fn retrieve_at(
        &self,
        query: &[f64],
        mood: &MoodState,
        k: usize,
        now: u64,
    ) -> Result<Vec<RetrievalHit>> {
        let hits = {
            let state = self.state.read();
            RetrievalEngine::new(&self.ctx).retrieve(&state, query, mood, k, now)?
        };
        if self.ctx.config.retrieval.record_retrievals && !hits.is_empty() {
            self.record_retrieval(&hits);
        }
        Ok(hits)
    }

    /// Cool returned nodes and strengthen edges among them. Nodes merged
    /// since scoring are skipped.
    fn record_retrieval(&self, hits: &[RetrievalHit]) {
        let cooling = self.ctx.config.retrieval.retrieval_cooling;
        let graph = &self.ctx.config.graph;
        let mut state = self.state.write();

        let live: Vec<NodeId> = hits
            .iter()
            .map(|h| h.node_id)
            .filter(|id| state.arena.get(*id).is_some_and(MemoryNode::is_live))
            .collect();
        for id in &live {
            if let Some(node) = state.arena.get_mut(*id) {
                node.cool(cooling);
            }
        }
        for a in &live {
            for b in &live {
                state.arena.reinforce(*a, *b, graph.edge_delta, graph.max_edge_weight);
            }
        }
        debug!(nodes = live.len(), "retrieval recorded");
    }

    /// Exact k nearest live nodes to a lattice-space point.
    pub fn query_knn(&self, coord: &Vec8, k: usize) -> Vec<(NodeId, f64)> {
        self.state.read().index.query_knn(coord, k)
    }

    pub fn node(&self, id: NodeId) -> Option<MemoryNode> {
        self.state.read().arena.get(id).cloned()
    }

    /// First instant at which `id` becomes retrievable.
    pub fn emergence_eta(&self, id: NodeId) -> Option<u64> {
        let state = self.state.read();
        let node = state.arena.get(id)?;
        self.ctx.clock.eta(&node.emergence, node.created_at)
    }

    pub fn live_count(&self) -> usize {
        self.state.read().live_count()
    }

    pub fn stats(&self) -> MemoryStats {
        let state = self.state.read();
        let mut stats = MemoryStats {
            node_count: state.arena.len(),
            shell_histogram: state.index.shell_histogram(),
            merge_count: state.merge_count,
            reseed_count: state.reseed_count,
            edge_count: state.arena.edge_count(),
            ..MemoryStats::default()
        };
        for node in state.arena.nodes() {
            match node.consolidation_state {
                ConsolidationState::Active => stats.active_count += 1,
                ConsolidationState::Seed { .. } => stats.seed_count += 1,
                ConsolidationState::Merged { .. } => stats.merged_count += 1,
            }
        }
        stats
    }

    /// True once `maintenance_interval` ingests have landed since the last
    /// consolidation pass. The caller decides when to act on it.
    pub fn maintenance_due(&self) -> bool {
        self.state.read().ingests_since_maintenance >= self.ctx.config.maintenance_interval
    }

    pub fn scan_and_merge(&self, pressure_threshold: f64) -> Result<Vec<MergeEvent>> {
        let mut state = self.state.write();
        ConsolidationEngine::new(&self.ctx).scan_and_merge(&mut state, pressure_threshold)
    }

    pub fn reseed(&self, parent_id: NodeId) -> Result<Vec<NodeId>> {
        self.reseed_at(parent_id, now_unix_millis())
    }

    pub fn reseed_at(&self, parent_id: NodeId, now: u64) -> Result<Vec<NodeId>> {
        let mut state = self.state.write();
        ConsolidationEngine::new(&self.ctx).reseed(&mut state, parent_id, now)
    }

    pub fn run_cycle(
        &self,
        policy: &mut ConsolidationPolicy,
        pressure_threshold: f64,
    ) -> Result<CycleReport> {
        self.run_cycle_at(policy, pressure_threshold, now_unix_millis())
    }

    /// One writer pass: the policy picks an arm, the arm runs, its outcome is
    /// scored and fed back. Reseed targets the least-reseeded lineage (newest
    /// on ties) and falls back to merge when there is none.
    pub fn run_cycle_at(
        &self,
        policy: &mut ConsolidationPolicy,
        pressure_threshold: f64,
        now: u64,
    ) -> Result<CycleReport> {
        let engine = ConsolidationEngine::new(&self.ctx);
        let mut state = self.state.write();

        let mut arm = policy.choose(&mut state.rng);
        let target = least_reseeded_lineage(&state);
        if arm == PolicyArm::Reseed && target.is_none() {
            debug!("no lineage to reseed, falling back to merge");
            arm = PolicyArm::Merge;
        }

        let mut report = CycleReport {
            arm,
            merges: Vec::new(),
            reseed_parent: None,
            seeds: Vec::new(),
            outcome: OutcomeScore::default(),
            reward: 0.0,
        };
        match (arm, target) {
            (PolicyArm::Reseed, Some(parent)) => {
                report.seeds = engine.reseed(&mut state, parent, now)?;
                report.reseed_parent = Some(parent);
                report.outcome = engine.score_reseed(&state, parent, &report.seeds);
            }
            _ => {
                report.merges = engine.scan_and_merge(&mut state, pressure_threshold)?;
                report.outcome = engine.score_merges(&state, &report.merges);
            }
        }
        drop(state);

        report.reward = policy.update(arm, report.outcome);
        info!(
            %arm,
            merges = report.merges.len(),
            seeds = report.seeds.len(),
            reward = report.reward,
            "consolidation cycle complete"
        );
        Ok(report)
    }

    pub fn snapshot(&self) -> Snapshot {
        let state = self.state.read();
        let matrix: &ProjectionMatrix = self.ctx.projector.matrix();
        Snapshot {
            version: CURRENT_VERSION.to_string(),
            timestamp: millis_to_iso8601(now_unix_millis()),
            roots: self.ctx.roots.roots().to_vec(),
            projection: WireProjection {
                input_dim: matrix.input_dim(),
                lattice_scale: self.ctx.projector.lattice_scale(),
                values: matrix.values().to_vec(),
            },
            nodes: state.arena.nodes().map(WireNode::from_node).collect(),
            next_id: state.arena.next_id(),
            lineage: state
                .arena
                .lineages()
                .iter()
                .map(|(summary, members)| WireLineage {
                    summary: *summary,
                    members: members.clone(),
                    reseeds: state.arena.reseed_count(*summary),
                })
                .collect(),
            merge_count: state.merge_count,
            reseed_count: state.reseed_count,
        }
    }
}

fn least_reseeded_lineage(state: &StoreState) -> Option<NodeId> {
    state
        .arena
        .lineages()
        .iter()
        .filter(|(_, members)| !members.is_empty())
        .map(|(summary, _)| *summary)
        .min_by_key(|summary| (state.arena.reseed_count(*summary), std::cmp::Reverse(*summary)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LATER: u64 = 3_600_000;

    fn store() -> MemoryStore {
        MemoryStore::new(EngineConfig {
            embed_dim: 8,
            ..EngineConfig::default()
        })
        .unwrap()
    }

    fn fill_cluster(store: &MemoryStore) -> Vec<NodeId> {
        [
            [2.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            [1.9, 0.1, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            [2.1, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        ]
        .iter()
        .map(|v| store.ingest_at(v, 0).unwrap())
        .collect()
    }

    #[test]
    fn test_wrong_dimension_leaves_store_unchanged() {
        let store = store();
        fill_cluster(&store);
        let before = store.stats();
        let err = store.ingest_at(&[1.0; 9], 0).unwrap_err();
        assert!(matches!(err, CoreError::ProjectionDimension { expected: 8, actual: 9 }));
        assert_eq!(store.stats(), before);
    }

    #[test]
    fn test_retrieval_cools_and_links_hits() {
        let store = store();
        let ids = fill_cluster(&store);
        let before = store.node(ids[0]).unwrap().entropy();
        let hits = store
            .retrieve_at(&[2.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0], &MoodState::neutral(), 2, LATER)
            .unwrap();
        assert_eq!(hits.len(), 2);
        let node = store.node(hits[0].node_id).unwrap();
        assert!(node.entropy() < before);
        assert!(node.edges.contains_key(&hits[1].node_id));
    }

    #[test]
    fn test_retrieval_recording_can_be_disabled() {
        let mut config = EngineConfig {
            embed_dim: 8,
            ..EngineConfig::default()
        };
        config.retrieval.record_retrievals = false;
        let store = MemoryStore::new(config).unwrap();
        let ids = fill_cluster(&store);
        store
            .retrieve_at(&[2.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0], &MoodState::neutral(), 3, LATER)
            .unwrap();
        assert_eq!(store.node(ids[0]).unwrap().entropy(), 1.0);
    }

    #[test]
    fn test_maintenance_due_after_interval() {
        let mut config = EngineConfig {
            embed_dim: 8,
            ..EngineConfig::default()
        };
        config.maintenance_interval = 3;
        let store = MemoryStore::new(config).unwrap();
        assert!(!store.maintenance_due());
        fill_cluster(&store);
        assert!(store.maintenance_due());
        store.scan_and_merge(1e9).unwrap();
        assert!(!store.maintenance_due());
    }

    #[test]
    fn test_cycle_tries_merge_then_reseed() {
        let store = store();
        fill_cluster(&store);
        let mut policy = ConsolidationPolicy::new(&store.config().policy);

        let first = store.run_cycle_at(&mut policy, 0.01, 10).unwrap();
        assert_eq!(first.arm, PolicyArm::Merge);
        assert_eq!(first.merges.len(), 1);
        let summary = first.merges[0].summary_id;

        let second = store.run_cycle_at(&mut policy, 0.01, 20).unwrap();
        assert_eq!(second.arm, PolicyArm::Reseed);
        assert_eq!(second.reseed_parent, Some(summary));
        assert_eq!(second.seeds.len(), store.config().consolidation.reseed_count);
        assert_eq!(policy.estimate(PolicyArm::Reseed).pulls, 1);
    }

    #[test]
    fn test_cycle_without_lineage_falls_back_to_merge() {
        let store = store();
        let mut policy = ConsolidationPolicy::new(&store.config().policy);
        policy.update(PolicyArm::Merge, OutcomeScore::default());
        let report = store.run_cycle_at(&mut policy, 0.01, 0).unwrap();
        assert_eq!(report.arm, PolicyArm::Merge);
        assert!(report.merges.is_empty());
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let store = store();
        fill_cluster(&store);
        store.ingest_at(&[0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0], 0).unwrap();
        store.scan_and_merge(0.01).unwrap();

        let restored = MemoryStore::restore(store.config().clone(), &store.snapshot()).unwrap();
        assert_eq!(restored.stats(), store.stats());
        let q = [2.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        assert_eq!(restored.query_knn(&q, 3), store.query_knn(&q, 3));
        // New ids continue after the restored ones.
        let next = restored.ingest_at(&q, 0).unwrap();
        assert_eq!(next, store.snapshot().next_id);
    }

    #[test]
    fn test_restore_refuses_corrupted_roots() {
        let store = store();
        let mut snapshot = store.snapshot();
        snapshot.roots[3][0] = 0.9;
        let err = MemoryStore::restore(store.config().clone(), &snapshot).err().unwrap();
        assert!(matches!(err, CoreError::Structural(_)));
    }

    #[test]
    fn test_restore_refuses_negative_emergence_rate() {
        let mut config = EngineConfig {
            embed_dim: 8,
            ..EngineConfig::default()
        };
        config.emergence.visibility_threshold = 0.0;
        let store = MemoryStore::new(config).unwrap();
        store.ingest_at(&[2.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0], 1_000).unwrap();
        let mut snapshot = store.snapshot();
        snapshot.nodes[0].s_q = -0.5;
        let err = MemoryStore::restore(store.config().clone(), &snapshot).err().unwrap();
        assert!(matches!(err, CoreError::IndexConsistency(_)));
    }

    #[test]
    fn test_restore_refuses_mismatched_embedding() {
        let store = store();
        fill_cluster(&store);
        let mut snapshot = store.snapshot();
        snapshot.nodes[1].raw_embedding.push(0.0);
        let err = MemoryStore::restore(store.config().clone(), &snapshot).err().unwrap();
        assert!(matches!(err, CoreError::IndexConsistency(msg) if msg.contains("node 1")));
    }

    #[test]
    fn test_query_knn_with_unbounded_k() {
        let store = store();
        store.ingest_at(&[2.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0], 0).unwrap();
        assert_eq!(store.query_knn(&[0.0; 8], usize::MAX).len(), 1);
        assert_eq!(store.query_knn(&[0.0; 8], 1 << 40).len(), 1);
    }

    #[test]
    fn test_restore_keeps_persisted_matrix() {
        let store = MemoryStore::new(EngineConfig {
            embed_dim: 16,
            seed: 3,
            ..EngineConfig::default()
        })
        .unwrap();
        let snapshot = store.snapshot();
        let other = EngineConfig {
            embed_dim: 32,
            seed: 99,
            ..EngineConfig::default()
        };
        let restored = MemoryStore::restore(other, &snapshot).unwrap();
        assert_eq!(restored.config().embed_dim, 16);
        assert_eq!(restored.context().projector.matrix(), store.context().projector.matrix());
    }

    #[test]
    fn test_emergence_eta_for_node() {
        let store = store();
        let id = store.ingest_at(&[2.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0], 1_000).unwrap();
        let eta = store.emergence_eta(id).unwrap();
        assert!(eta > 1_000);
        assert!(store.emergence_eta(42).is_none());
    }

    #[test]
    fn test_store_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<MemoryStore>();
    }
}
