//! Geometry-weighted retrieval.
//!
//! The query is projected, candidates are gathered from the shells inside the
//! mood's light cone, filtered to live and visible nodes, then scored on
//! curvature-bent distance, direction, root-symmetry fit and (optionally)
//! entropy-driven novelty.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::mood::MoodState;
use crate::node::{MemoryNode, NodeId};
use crate::roots::RootSystem;
use crate::state::{EngineContext, StoreState};
use crate::vector::{Vec8, cosine, distance, is_zero, norm_sq};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetrievalHit {
    pub node_id: NodeId,
    pub score: f64,
    /// Lattice distance to the query, before curvature.
    pub distance: f64,
    pub shell: u32,
}

/// Read-only scorer over a borrowed engine context.
pub struct RetrievalEngine<'a> {
    ctx: &'a EngineContext,
}

impl<'a> RetrievalEngine<'a> {
    pub fn new(ctx: &'a EngineContext) -> Self {
        Self { ctx }
    }

    /// Shells searched on each side of the query's shell.
    pub fn light_cone_radius(&self, mood: &MoodState) -> u32 {
        let r = &self.ctx.config.retrieval;
        let extra = (mood.attention_breadth() * r.light_cone_gain).round() as u32;
        r.light_cone_base.saturating_add(extra).min(r.max_light_cone)
    }

    pub fn retrieve(
        &self,
        state: &StoreState,
        query: &[f64],
        mood: &MoodState,
        k: usize,
        now: u64,
    ) -> Result<Vec<RetrievalHit>> {
        if k == 0 {
            return Err(CoreError::InvalidK);
        }
        let projection = self.ctx.projector.project(query)?;
        let config = &self.ctx.config.retrieval;

        let center = projection.shell;
        let mut radius = self.light_cone_radius(mood);
        let mut eligible: Vec<&MemoryNode> = Vec::new();
        self.gather(
            state,
            center.saturating_sub(radius),
            center.saturating_add(radius),
            now,
            &mut eligible,
        );

        if config.widen_when_sparse {
            let outermost = state.index.shells().last().unwrap_or(0);
            while eligible.len() < k && radius < config.max_light_cone {
                let lo = center.saturating_sub(radius);
                let hi = center.saturating_add(radius);
                if lo == 0 && hi >= outermost {
                    break;
                }
                radius += 1;
                let new_lo = center.saturating_sub(radius);
                let new_hi = center.saturating_add(radius);
                if new_lo < lo {
                    self.gather(state, new_lo, new_lo, now, &mut eligible);
                }
                if new_hi > hi {
                    self.gather(state, new_hi, new_hi, now, &mut eligible);
                }
            }
        }

        let query_coord = projection.lattice_coord;
        let query_dir = if is_zero(&query_coord) {
            projection.reduced
        } else {
            query_coord
        };

        let mut hits: Vec<RetrievalHit> = eligible
            .into_iter()
            .map(|node| {
                let d = distance(&query_coord, &node.lattice_coord);
                let field = curvature_field(&node.lattice_coord, config.curvature_scale);
                let bend = (-mood.curvature_bias() * field).exp();
                let orientation = cosine(&query_dir, &node.lattice_coord);
                let fit = symmetry_fit(
                    &self.ctx.roots,
                    projection.nearest_root_id,
                    node.nearest_root_id,
                );
                let entropy = node.entropy();
                let novelty = mood.novelty_drive() * entropy / (1.0 + entropy);

                let score = config.distance_weight * -(d * bend)
                    + config.orientation_weight * orientation
                    + config.symmetry_weight * fit
                    + config.novelty_weight * novelty;

                RetrievalHit {
                    node_id: node.id,
                    score,
                    distance: d,
                    shell: node.shell_index,
                }
            })
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.node_id.cmp(&b.node_id)));
        hits.truncate(k);

        debug!(
            shell = center,
            radius,
            returned = hits.len(),
            "retrieval scored"
        );
        Ok(hits)
    }

    fn gather<'s>(
        &self,
        state: &'s StoreState,
        lo: u32,
        hi: u32,
        now: u64,
        out: &mut Vec<&'s MemoryNode>,
    ) {
        for id in state.index.query_shell_range(lo, hi) {
            if let Some(node) = state.arena.get(id) {
                if node.is_live() && self.ctx.clock.visible(node, now) {
                    out.push(node);
                }
            }
        }
    }
}

/// Scalar field in [0, 1) growing with distance from the origin; half
/// strength at norm `scale`.
pub fn curvature_field(coord: &Vec8, scale: f64) -> f64 {
    let n2 = norm_sq(coord);
    n2 / (n2 + scale * scale)
}

/// 1 for the same root, 0.5 for roots at 60°, otherwise 0.
pub fn symmetry_fit(roots: &RootSystem, a: usize, b: usize) -> f64 {
    match roots.root_inner(a, b) {
        2 => 1.0,
        1 => 0.5,
        _ => 0.0,
    }
}
