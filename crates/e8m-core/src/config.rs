//! Engine tunables. Every section has defaults so a partial TOML file or an
//! empty one deserializes into a working configuration.

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_EMBED_DIM, DEFAULT_SEED, LATTICE_DIM};
use crate::error::{CoreError, Result};
use crate::vector::{Vec8, is_zero};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Input embedding dimension. Fixes the projection matrix shape.
    pub embed_dim: usize,
    /// Seed for the projection matrix and the writer-side rng.
    pub seed: u64,
    /// Ingests between consolidation passes before `maintenance_due` fires.
    pub maintenance_interval: u64,
    pub projection: ProjectionConfig,
    pub emergence: EmergenceConfig,
    pub retrieval: RetrievalConfig,
    pub consolidation: ConsolidationConfig,
    pub index: IndexConfig,
    pub graph: GraphConfig,
    pub policy: PolicyConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            embed_dim: DEFAULT_EMBED_DIM,
            seed: DEFAULT_SEED,
            maintenance_interval: 500,
            projection: ProjectionConfig::default(),
            emergence: EmergenceConfig::default(),
            retrieval: RetrievalConfig::default(),
            consolidation: ConsolidationConfig::default(),
            index: IndexConfig::default(),
            graph: GraphConfig::default(),
            policy: PolicyConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProjectionConfig {
    /// Multiplier applied to the reduced vector before lattice snapping.
    pub lattice_scale: f64,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self { lattice_scale: 1.0 }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmergenceConfig {
    /// Asymptote Q∞ assigned to new nodes.
    pub q_infinity: f64,
    /// Q(t) at or above this makes a node visible.
    pub visibility_threshold: f64,
    /// s_Q for a root orthogonal to the decoding axis, per second.
    pub base_rate: f64,
    /// Exponential gain of s_Q in the root's projection onto the axis.
    pub rate_gain: f64,
    /// Decoding axis; normalized once when the clock is built.
    pub decoding_axis: Vec8,
}

impl Default for EmergenceConfig {
    fn default() -> Self {
        Self {
            q_infinity: 1.0,
            visibility_threshold: 0.5,
            base_rate: 0.05,
            rate_gain: 1.0,
            decoding_axis: [1.0; LATTICE_DIM],
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Light-cone radius (in shells) at zero attention breadth.
    pub light_cone_base: u32,
    /// Extra shells at full attention breadth.
    pub light_cone_gain: f64,
    pub max_light_cone: u32,
    /// Widen the cone shell by shell while fewer than k nodes are eligible.
    pub widen_when_sparse: bool,
    pub distance_weight: f64,
    pub orientation_weight: f64,
    pub symmetry_weight: f64,
    pub novelty_weight: f64,
    /// Norm at which the curvature field reaches half strength.
    pub curvature_scale: f64,
    /// Cool entropy and reinforce edges of returned nodes.
    pub record_retrievals: bool,
    /// Fraction of entropy removed from each returned node.
    pub retrieval_cooling: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            light_cone_base: 1,
            light_cone_gain: 4.0,
            max_light_cone: 16,
            widen_when_sparse: true,
            distance_weight: 1.0,
            orientation_weight: 0.5,
            symmetry_weight: 0.25,
            novelty_weight: 0.25,
            curvature_scale: 4.0,
            record_retrievals: true,
            retrieval_cooling: 0.1,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConsolidationConfig {
    /// Default pressure threshold for scheduled passes (nodes per unit volume).
    pub pressure_threshold: f64,
    /// Radius of the ball used for local density.
    pub density_radius: f64,
    pub min_cluster_size: usize,
    /// Entropy assigned to freshly ingested nodes and seeds.
    pub initial_entropy: f64,
    /// Seeds created per reseed call.
    pub reseed_count: usize,
    /// Noise scale relative to the member-parent spread.
    pub reseed_noise: f64,
    pub interp_min: f64,
    pub interp_max: f64,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            pressure_threshold: 0.05,
            density_radius: 1.5,
            min_cluster_size: 2,
            initial_entropy: 1.0,
            reseed_count: 3,
            reseed_noise: 0.05,
            interp_min: 0.25,
            interp_max: 0.75,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IndexConfig {
    /// Pending inserts plus tombstones a shell tolerates before its tree is rebuilt.
    pub anneal_threshold: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self { anneal_threshold: 64 }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GraphConfig {
    /// Nearest live nodes linked to each new node.
    pub link_neighbors: usize,
    pub edge_delta: f64,
    pub max_edge_weight: f64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            link_neighbors: 3,
            edge_delta: 0.1,
            max_edge_weight: 10.0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PolicyConfig {
    pub epsilon: f64,
    /// Share of the reward taken from novelty; the rest comes from coherence.
    pub novelty_weight: f64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            epsilon: 0.15,
            novelty_weight: 0.5,
        }
    }
}

impl EngineConfig {
    /// Reject configurations that would break projection, emergence
    /// monotonicity or consolidation bookkeeping.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> Result<()> { Err(CoreError::InvalidConfig(msg)) };

        if self.embed_dim == 0 {
            return invalid("embed_dim must be at least 1".into());
        }
        let p = &self.projection;
        if !(p.lattice_scale.is_finite() && p.lattice_scale > 0.0) {
            return invalid(format!("lattice_scale must be positive, got {}", p.lattice_scale));
        }

        let e = &self.emergence;
        if !(e.q_infinity.is_finite() && e.q_infinity > 0.0) {
            return invalid(format!("q_infinity must be positive, got {}", e.q_infinity));
        }
        if !e.visibility_threshold.is_finite() {
            return invalid("visibility_threshold must be finite".into());
        }
        if !(e.base_rate.is_finite() && e.base_rate > 0.0) {
            return invalid(format!("base_rate must be positive, got {}", e.base_rate));
        }
        if !e.rate_gain.is_finite() {
            return invalid("rate_gain must be finite".into());
        }
        if e.decoding_axis.iter().any(|c| !c.is_finite()) || is_zero(&e.decoding_axis) {
            return invalid("decoding_axis must be a finite non-zero vector".into());
        }

        let r = &self.retrieval;
        if r.max_light_cone < r.light_cone_base {
            return invalid("max_light_cone must be at least light_cone_base".into());
        }
        for (name, v) in [
            ("light_cone_gain", r.light_cone_gain),
            ("distance_weight", r.distance_weight),
            ("orientation_weight", r.orientation_weight),
            ("symmetry_weight", r.symmetry_weight),
            ("novelty_weight", r.novelty_weight),
        ] {
            if !(v.is_finite() && v >= 0.0) {
                return invalid(format!("{name} must be non-negative, got {v}"));
            }
        }
        if !(r.curvature_scale.is_finite() && r.curvature_scale > 0.0) {
            return invalid("curvature_scale must be positive".into());
        }
        if !(0.0..=1.0).contains(&r.retrieval_cooling) {
            return invalid("retrieval_cooling must lie in [0, 1]".into());
        }

        let c = &self.consolidation;
        if !(c.density_radius.is_finite() && c.density_radius > 0.0) {
            return invalid("density_radius must be positive".into());
        }
        if c.min_cluster_size < 2 {
            return invalid("min_cluster_size must be at least 2".into());
        }
        if !(c.initial_entropy.is_finite() && c.initial_entropy >= 0.0) {
            return invalid("initial_entropy must be non-negative".into());
        }
        if !(c.reseed_noise.is_finite() && c.reseed_noise >= 0.0) {
            return invalid("reseed_noise must be non-negative".into());
        }
        if !(0.0 <= c.interp_min && c.interp_min <= c.interp_max && c.interp_max <= 1.0) {
            return invalid("interp range must satisfy 0 <= min <= max <= 1".into());
        }

        let g = &self.graph;
        if !(g.max_edge_weight.is_finite() && g.max_edge_weight > 0.0) {
            return invalid("max_edge_weight must be positive".into());
        }
        if !(g.edge_delta.is_finite() && g.edge_delta >= 0.0) {
            return invalid("edge_delta must be non-negative".into());
        }

        let pol = &self.policy;
        if !(0.0..=1.0).contains(&pol.epsilon) || !(0.0..=1.0).contains(&pol.novelty_weight) {
            return invalid("policy epsilon and novelty_weight must lie in [0, 1]".into());
        }

        Ok(())
    }
}
