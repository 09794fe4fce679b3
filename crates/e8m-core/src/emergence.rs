//! Time-gated visibility.
//!
//! A node's charge follows `Q(t) = Q∞ · (1 − e^{−s_Q·t})` from its creation,
//! and the node becomes retrievable once `Q(t)` reaches the visibility
//! threshold. `s_Q` grows with the nearest root's alignment to a fixed
//! decoding axis, so well-aligned memories surface first. `Q` is monotone in
//! `t`, so visibility never flaps.

use crate::config::EmergenceConfig;
use crate::error::{CoreError, Result};
use crate::node::{EmergenceParams, MemoryNode};
use crate::time::elapsed_secs;
use crate::vector::{Vec8, dot, is_zero, norm, scale};

/// Upper bound on the millisecond nudges `eta` makes around the analytic answer.
const ETA_REFINE_STEPS: usize = 64;

#[derive(Clone, Debug)]
pub struct EmergenceClock {
    q_infinity: f64,
    threshold: f64,
    base_rate: f64,
    rate_gain: f64,
    axis: Vec8,
}

impl EmergenceClock {
    pub fn new(config: &EmergenceConfig) -> Result<Self> {
        if is_zero(&config.decoding_axis) {
            return Err(CoreError::InvalidConfig(
                "decoding_axis must be non-zero".into(),
            ));
        }
        let axis = scale(&config.decoding_axis, 1.0 / norm(&config.decoding_axis));
        Ok(Self {
            q_infinity: config.q_infinity,
            threshold: config.visibility_threshold,
            base_rate: config.base_rate,
            rate_gain: config.rate_gain,
            axis,
        })
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Parameters for a node whose nearest root is `root`.
    pub fn params_for_root(&self, root: &Vec8) -> EmergenceParams {
        let n = norm(root);
        let projection = if n > 0.0 { dot(root, &self.axis) / n } else { 0.0 };
        EmergenceParams {
            q_infinity: self.q_infinity,
            s_q: self.base_rate * (self.rate_gain * projection).exp(),
        }
    }

    /// Charge at `now`; zero until the creation instant has passed.
    pub fn q_at(params: &EmergenceParams, created_at: u64, now: u64) -> f64 {
        let t = elapsed_secs(created_at, now);
        // 1 − e^{−x} without cancellation for small x.
        params.q_infinity * -(-params.s_q * t).exp_m1()
    }

    pub fn is_visible(&self, params: &EmergenceParams, created_at: u64, now: u64) -> bool {
        Self::q_at(params, created_at, now) >= self.threshold
    }

    pub fn visible(&self, node: &MemoryNode, now: u64) -> bool {
        self.is_visible(&node.emergence, node.created_at, now)
    }

    /// First millisecond at which the node is visible, or `None` if its
    /// asymptote never reaches the threshold.
    pub fn eta(&self, params: &EmergenceParams, created_at: u64) -> Option<u64> {
        if self.is_visible(params, created_at, created_at) {
            return Some(created_at);
        }
        let ratio = self.threshold / params.q_infinity;
        if ratio.is_nan() || ratio >= 1.0 || params.s_q <= 0.0 {
            return None;
        }
        let secs = -(1.0 - ratio).ln() / params.s_q;
        if !secs.is_finite() {
            return None;
        }

        let mut at = created_at.saturating_add((secs * 1000.0).ceil() as u64);
        for _ in 0..ETA_REFINE_STEPS {
            if self.is_visible(params, created_at, at) {
                break;
            }
            at = at.saturating_add(1);
        }
        for _ in 0..ETA_REFINE_STEPS {
            if at > created_at && self.is_visible(params, created_at, at - 1) {
                at -= 1;
            } else {
                break;
            }
        }
        self.is_visible(params, created_at, at).then_some(at)
    }
}
