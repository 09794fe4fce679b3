//! Epsilon-greedy bandit choosing between consolidation arms.
//!
//! Merge favors stability, reseed favors novelty. The policy is an explicit
//! value handed to each cycle, never ambient state, and round-trips through
//! `save`/`restore`.

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::PolicyConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyArm {
    Merge,
    Reseed,
}

impl std::fmt::Display for PolicyArm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Merge => write!(f, "merge"),
            Self::Reseed => write!(f, "reseed"),
        }
    }
}

/// Running mean reward of one arm.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ArmEstimate {
    pub pulls: u64,
    pub value: f64,
}

/// Downstream judgement of one consolidation outcome, both in [0, 1].
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OutcomeScore {
    pub novelty: f64,
    pub coherence: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicySnapshot {
    pub epsilon: f64,
    pub novelty_weight: f64,
    pub merge: ArmEstimate,
    pub reseed: ArmEstimate,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConsolidationPolicy {
    epsilon: f64,
    novelty_weight: f64,
    merge: ArmEstimate,
    reseed: ArmEstimate,
}

impl ConsolidationPolicy {
    pub fn new(config: &PolicyConfig) -> Self {
        Self {
            epsilon: config.epsilon,
            novelty_weight: config.novelty_weight,
            merge: ArmEstimate::default(),
            reseed: ArmEstimate::default(),
        }
    }

    pub fn estimate(&self, arm: PolicyArm) -> ArmEstimate {
        match arm {
            PolicyArm::Merge => self.merge,
            PolicyArm::Reseed => self.reseed,
        }
    }

    /// Arm with the higher estimate; ties go to merge.
    pub fn greedy(&self) -> PolicyArm {
        if self.reseed.value > self.merge.value {
            PolicyArm::Reseed
        } else {
            PolicyArm::Merge
        }
    }

    /// Untried arms first (merge, then reseed), then epsilon-greedy.
    pub fn choose(&self, rng: &mut impl Rng) -> PolicyArm {
        if self.merge.pulls == 0 {
            return PolicyArm::Merge;
        }
        if self.reseed.pulls == 0 {
            return PolicyArm::Reseed;
        }
        if rng.random::<f64>() < self.epsilon {
            if rng.random_bool(0.5) {
                PolicyArm::Merge
            } else {
                PolicyArm::Reseed
            }
        } else {
            self.greedy()
        }
    }

    pub fn reward(&self, outcome: &OutcomeScore) -> f64 {
        self.novelty_weight * outcome.novelty + (1.0 - self.novelty_weight) * outcome.coherence
    }

    /// Fold an outcome into the arm's running mean. Returns the reward.
    pub fn update(&mut self, arm: PolicyArm, outcome: OutcomeScore) -> f64 {
        let reward = self.reward(&outcome);
        let estimate = match arm {
            PolicyArm::Merge => &mut self.merge,
            PolicyArm::Reseed => &mut self.reseed,
        };
        estimate.pulls += 1;
        estimate.value += (reward - estimate.value) / estimate.pulls as f64;
        debug!(%arm, reward, value = estimate.value, pulls = estimate.pulls, "policy updated");
        reward
    }

    pub fn save(&self) -> PolicySnapshot {
        PolicySnapshot {
            epsilon: self.epsilon,
            novelty_weight: self.novelty_weight,
            merge: self.merge,
            reseed: self.reseed,
        }
    }

    pub fn restore(snapshot: PolicySnapshot) -> Self {
        Self {
            epsilon: snapshot.epsilon.clamp(0.0, 1.0),
            novelty_weight: snapshot.novelty_weight.clamp(0.0, 1.0),
            merge: snapshot.merge,
            reseed: snapshot.reseed,
        }
    }
}
