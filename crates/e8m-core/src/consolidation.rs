//! Dense-cluster merge and lineage reseed.
//!
//! A merge pass plans every shell against the pre-merge state and computes
//! every summary before mutating anything. Only a pass with work to apply
//! takes a checkpoint; any failure while applying restores the state as it
//! was and the pass is deferred to the next cycle. Reseed works the same way.

use std::collections::BTreeSet;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::constants::{ENTROPY_FLOOR, UNIT_BALL_VOLUME_8D};
use crate::error::{CoreError, Result};
use crate::node::{ConsolidationState, MemoryNode, NodeId};
use crate::policy::OutcomeScore;
use crate::rotor::Rotor;
use crate::state::{Admission, EngineContext, StoreState};
use crate::vector::{cosine_slice, distance, gauss_random};

/// Record of one cluster collapsing into a summary node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MergeEvent {
    pub event_id: Uuid,
    pub summary_id: NodeId,
    /// Shell the cluster was found in.
    pub shell: u32,
    pub absorbed_ids: Vec<NodeId>,
    /// Local density that triggered the merge.
    pub density: f64,
    /// Total inverse-entropy weight of the absorbed members.
    pub mass: f64,
}

#[derive(Clone, Debug)]
struct MergePlan {
    shell: u32,
    center: NodeId,
    members: Vec<NodeId>,
    density: f64,
}

/// A plan with its summary computed, ready to apply.
#[derive(Debug)]
struct PreparedMerge {
    plan: MergePlan,
    raw: Vec<f64>,
    mass: f64,
    admission: Admission,
    summary_shell: u32,
}

pub struct ConsolidationEngine<'a> {
    ctx: &'a EngineContext,
}

impl<'a> ConsolidationEngine<'a> {
    pub fn new(ctx: &'a EngineContext) -> Self {
        Self { ctx }
    }

    /// Volume of the density ball: π⁴ r⁸ / 24.
    pub fn density_volume(&self) -> f64 {
        UNIT_BALL_VOLUME_8D * self.ctx.config.consolidation.density_radius.powi(8)
    }

    /// Shell-mates within the density radius of `id` (itself included) and
    /// the resulting density. `None` when `id` is not indexed.
    pub fn local_density(&self, state: &StoreState, id: NodeId) -> Option<(Vec<NodeId>, f64)> {
        let shell = state.index.shell_for(id)?;
        let node = state.arena.get(id)?;
        let radius = self.ctx.config.consolidation.density_radius;
        let neighbors: Vec<NodeId> = state
            .index
            .query_radius(shell, &node.lattice_coord, radius)
            .into_iter()
            .map(|(nid, _)| nid)
            .collect();
        let density = neighbors.len() as f64 / self.density_volume();
        Some((neighbors, density))
    }

    /// Merge the densest cluster of every shell whose density exceeds
    /// `pressure_threshold`. Returns one event per merge performed.
    pub fn scan_and_merge(
        &self,
        state: &mut StoreState,
        pressure_threshold: f64,
    ) -> Result<Vec<MergeEvent>> {
        let prepared = self
            .plan(state, pressure_threshold)
            .into_iter()
            .map(|plan| self.prepare(state, plan))
            .collect::<Result<Vec<_>>>()
            .inspect_err(|err| error!(error = %err, "merge pass failed, nothing applied"))?;
        if prepared.is_empty() {
            state.ingests_since_maintenance = 0;
            return Ok(Vec::new());
        }

        let checkpoint = state.clone();
        match self.commit(state, prepared) {
            Ok(events) => {
                state.ingests_since_maintenance = 0;
                Ok(events)
            }
            Err(err) => {
                error!(error = %err, "merge pass failed, state rolled back");
                *state = checkpoint;
                Err(err)
            }
        }
    }

    fn commit(
        &self,
        state: &mut StoreState,
        prepared: Vec<PreparedMerge>,
    ) -> Result<Vec<MergeEvent>> {
        let mut events = Vec::with_capacity(prepared.len());
        for merge in prepared {
            if let Some(event) = self.apply(state, merge)? {
                events.push(event);
            }
        }
        if !events.is_empty() {
            info!(
                merges = events.len(),
                absorbed = events.iter().map(|e| e.absorbed_ids.len()).sum::<usize>(),
                "merge pass complete"
            );
        }
        Ok(events)
    }

    fn plan(&self, state: &StoreState, pressure_threshold: f64) -> Vec<MergePlan> {
        let min_cluster = self.ctx.config.consolidation.min_cluster_size;
        let mut plans = Vec::new();

        for shell in state.index.shells() {
            let mut best: Option<MergePlan> = None;
            for (id, _) in state.index.shell_members(shell) {
                let Some((members, density)) = self.local_density(state, id) else {
                    continue;
                };
                // Members arrive in id order, so strict > keeps the lowest id on ties.
                if best.as_ref().is_none_or(|b| density > b.density) {
                    best = Some(MergePlan {
                        shell,
                        center: id,
                        members,
                        density,
                    });
                }
            }

            if let Some(mut plan) = best {
                if plan.density > pressure_threshold && plan.members.len() >= min_cluster {
                    plan.members.sort_unstable();
                    debug!(
                        shell,
                        center = plan.center,
                        size = plan.members.len(),
                        density = plan.density,
                        "merge planned"
                    );
                    plans.push(plan);
                }
            }
        }
        plans
    }

    /// Summary embedding, weights and target shell for one plan. Reads only.
    fn prepare(&self, state: &StoreState, plan: MergePlan) -> Result<PreparedMerge> {
        let members: Vec<&MemoryNode> = plan
            .members
            .iter()
            .map(|id| state.arena.get(*id).ok_or(CoreError::UnknownNode(*id)))
            .collect::<Result<_>>()?;

        let dim = self.ctx.projector.input_dim();
        let mut raw = vec![0.0; dim];
        let mut mass = 0.0;
        let mut entropy = 0.0;
        for node in &members {
            let w = 1.0 / (node.entropy() + ENTROPY_FLOOR);
            for (acc, x) in raw.iter_mut().zip(node.raw_embedding()) {
                *acc += w * x;
            }
            entropy += w * node.entropy();
            mass += w;
        }
        raw.iter_mut().for_each(|x| *x /= mass);
        entropy /= mass;

        let created_at = members.iter().map(|n| n.created_at).min().unwrap_or(0);
        let rotor = Rotor::mean(members.iter().map(|n| n.rotor));
        let summary_shell = self.ctx.projector.project(&raw)?.shell;

        Ok(PreparedMerge {
            plan,
            raw,
            mass,
            admission: Admission {
                created_at,
                entropy,
                state: ConsolidationState::Active,
                rotor,
            },
            summary_shell,
        })
    }

    fn apply(&self, state: &mut StoreState, merge: PreparedMerge) -> Result<Option<MergeEvent>> {
        let PreparedMerge {
            plan,
            raw,
            mass,
            admission,
            summary_shell,
        } = merge;

        let population = state.index.shell_histogram().get(&plan.shell).copied().unwrap_or(0);
        if plan.members.len() >= population && summary_shell != plan.shell {
            debug!(
                shell = plan.shell,
                summary_shell,
                "merge skipped: it would empty the shell"
            );
            return Ok(None);
        }

        for id in &plan.members {
            state.index.remove(*id);
        }
        let summary_id = state.admit(self.ctx, raw, admission)?;

        let absorbed: BTreeSet<NodeId> = plan.members.iter().copied().collect();
        let max_weight = self.ctx.config.graph.max_edge_weight;
        state.arena.redirect_edges(&absorbed, summary_id, max_weight);
        for id in &plan.members {
            state.arena.mark_merged(*id, summary_id)?;
        }
        state.arena.record_lineage(summary_id, plan.members.clone());
        state.merge_count += 1;

        Ok(Some(MergeEvent {
            event_id: Uuid::new_v4(),
            summary_id,
            shell: plan.shell,
            absorbed_ids: plan.members,
            density: plan.density,
            mass,
        }))
    }

    /// Grow new seed nodes from the lineage of summary `parent_id`.
    ///
    /// Unknown ids are an error. A node without lineage yields no seeds.
    pub fn reseed(
        &self,
        state: &mut StoreState,
        parent_id: NodeId,
        now: u64,
    ) -> Result<Vec<NodeId>> {
        let rng = state.rng.clone();
        let planned = match self.plan_seeds(state, parent_id) {
            Ok(Some(planned)) => planned,
            Ok(None) => return Ok(Vec::new()),
            Err(err) => {
                error!(error = %err, parent_id, "reseed failed, nothing applied");
                state.rng = rng;
                return Err(err);
            }
        };

        let checkpoint = state.clone();
        match self.commit_seeds(state, parent_id, planned, now) {
            Ok(seeds) => Ok(seeds),
            Err(err) => {
                error!(error = %err, parent_id, "reseed failed, state rolled back");
                *state = checkpoint;
                Err(err)
            }
        }
    }

    /// Seed embeddings and rotors. Touches nothing but the rng; `None` when
    /// the parent has no lineage.
    fn plan_seeds(
        &self,
        state: &mut StoreState,
        parent_id: NodeId,
    ) -> Result<Option<Vec<(Vec<f64>, Rotor)>>> {
        let parent = state
            .arena
            .get(parent_id)
            .ok_or(CoreError::UnknownNode(parent_id))?;
        let lineage = match state.arena.lineage(parent_id) {
            Some(l) if !l.is_empty() => l.to_vec(),
            _ => {
                debug!(parent_id, "reseed skipped: no lineage");
                return Ok(None);
            }
        };

        let cfg = &self.ctx.config.consolidation;
        let parent_raw = parent.raw_embedding().to_vec();
        let parent_coord = parent.lattice_coord;
        let parent_rotor = parent.rotor;

        let mut planned = Vec::with_capacity(cfg.reseed_count);
        for i in 0..cfg.reseed_count {
            let member_id = lineage[i % lineage.len()];
            let member = state
                .arena
                .get(member_id)
                .ok_or(CoreError::UnknownNode(member_id))?;
            let member_raw = member.raw_embedding();

            let spread = rms_difference(&parent_raw, member_raw);
            let t = state.rng.random_range(cfg.interp_min..=cfg.interp_max);
            let embedding: Vec<f64> = parent_raw
                .iter()
                .zip(member_raw)
                .map(|(p, m)| {
                    let noise = cfg.reseed_noise * spread * gauss_random(&mut state.rng);
                    (1.0 - t) * p + t * m + noise
                })
                .collect();
            let coord = self.ctx.projector.project(&embedding)?.lattice_coord;
            let rotor = Rotor::between(&parent_coord, &coord) * parent_rotor;
            planned.push((embedding, rotor));
        }
        Ok(Some(planned))
    }

    fn commit_seeds(
        &self,
        state: &mut StoreState,
        parent_id: NodeId,
        planned: Vec<(Vec<f64>, Rotor)>,
        now: u64,
    ) -> Result<Vec<NodeId>> {
        let entropy = self.ctx.config.consolidation.initial_entropy;
        let mut seeds = Vec::with_capacity(planned.len());
        for (embedding, rotor) in planned {
            let id = state.admit(
                self.ctx,
                embedding,
                Admission {
                    created_at: now,
                    entropy,
                    state: ConsolidationState::Seed { origin: parent_id },
                    rotor,
                },
            )?;
            seeds.push(id);
        }

        state.arena.note_reseed(parent_id);
        state.reseed_count += 1;
        info!(parent_id, seeds = seeds.len(), "lineage reseeded");
        Ok(seeds)
    }

    /// Coherence of merged clusters with their summaries. Merges add no novelty.
    pub fn score_merges(&self, state: &StoreState, events: &[MergeEvent]) -> OutcomeScore {
        let mut total = 0.0;
        let mut count = 0usize;
        for event in events {
            let Some(summary) = state.arena.get(event.summary_id) else {
                continue;
            };
            for id in &event.absorbed_ids {
                if let Some(member) = state.arena.get(*id) {
                    let agreement = cosine_slice(member.raw_embedding(), summary.raw_embedding());
                    total += (1.0 + agreement) / 2.0;
                    count += 1;
                }
            }
        }
        if count == 0 {
            return OutcomeScore::default();
        }
        OutcomeScore {
            novelty: 0.0,
            coherence: total / count as f64,
        }
    }

    /// Novelty is lattice displacement from the parent (saturating at twice the
    /// density radius); coherence is embedding agreement with the parent.
    pub fn score_reseed(
        &self,
        state: &StoreState,
        parent_id: NodeId,
        seeds: &[NodeId],
    ) -> OutcomeScore {
        let Some(parent) = state.arena.get(parent_id) else {
            return OutcomeScore::default();
        };
        let reach = 2.0 * self.ctx.config.consolidation.density_radius;
        let (mut novelty, mut coherence, mut count) = (0.0, 0.0, 0usize);
        for id in seeds {
            if let Some(seed) = state.arena.get(*id) {
                novelty += (distance(&seed.lattice_coord, &parent.lattice_coord) / reach).min(1.0);
                let agreement = cosine_slice(seed.raw_embedding(), parent.raw_embedding());
                coherence += (1.0 + agreement) / 2.0;
                count += 1;
            }
        }
        if count == 0 {
            return OutcomeScore::default();
        }
        OutcomeScore {
            novelty: novelty / count as f64,
            coherence: coherence / count as f64,
        }
    }
}

fn rms_difference(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() {
        return 0.0;
    }
    let sum: f64 = a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum();
    (sum / a.len() as f64).sqrt()
}
