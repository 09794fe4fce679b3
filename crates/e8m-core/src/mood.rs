use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Numeric mood inputs that steer retrieval. Validated on construction and
/// on deserialization, so a `MoodState` in hand is always in range.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawMood")]
pub struct MoodState {
    attention_breadth: f64,
    curvature_bias: f64,
    novelty_drive: f64,
}

impl MoodState {
    /// - `attention_breadth` ∈ [0, 1]: widens the light cone.
    /// - `curvature_bias` ∈ [-1, 1]: positive pulls distant shells closer.
    /// - `novelty_drive` ∈ [0, 1]: rewards high-entropy candidates.
    pub fn new(attention_breadth: f64, curvature_bias: f64, novelty_drive: f64) -> Result<Self> {
        check("attention_breadth", attention_breadth, 0.0, 1.0)?;
        check("curvature_bias", curvature_bias, -1.0, 1.0)?;
        check("novelty_drive", novelty_drive, 0.0, 1.0)?;
        Ok(Self {
            attention_breadth,
            curvature_bias,
            novelty_drive,
        })
    }

    pub fn neutral() -> Self {
        Self {
            attention_breadth: 0.5,
            curvature_bias: 0.0,
            novelty_drive: 0.0,
        }
    }

    pub fn attention_breadth(&self) -> f64 {
        self.attention_breadth
    }

    pub fn curvature_bias(&self) -> f64 {
        self.curvature_bias
    }

    pub fn novelty_drive(&self) -> f64 {
        self.novelty_drive
    }
}

impl Default for MoodState {
    fn default() -> Self {
        Self::neutral()
    }
}

fn check(name: &str, value: f64, lo: f64, hi: f64) -> Result<()> {
    if value.is_finite() && (lo..=hi).contains(&value) {
        Ok(())
    } else {
        Err(CoreError::InvalidMood(format!(
            "{name} must lie in [{lo}, {hi}], got {value}"
        )))
    }
}

#[derive(Deserialize)]
struct RawMood {
    #[serde(default = "default_breadth")]
    attention_breadth: f64,
    #[serde(default)]
    curvature_bias: f64,
    #[serde(default)]
    novelty_drive: f64,
}

fn default_breadth() -> f64 {
    MoodState::neutral().attention_breadth
}

impl TryFrom<RawMood> for MoodState {
    type Error = CoreError;

    fn try_from(raw: RawMood) -> Result<Self> {
        Self::new(raw.attention_breadth, raw.curvature_bias, raw.novelty_drive)
    }
}
