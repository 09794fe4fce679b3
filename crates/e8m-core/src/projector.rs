//! Embedding → E8 lattice projection.
//!
//! A frozen D×8 reduction matrix maps the embedding into ℝ⁸, then the reduced
//! vector is snapped to the nearest E8 lattice point. E8 = D8 ∪ (D8 + ½·𝟙),
//! so the nearest point is the closer of the nearest D8 point and the nearest
//! point of the shifted coset (Conway & Sloane, "Fast quantizing and decoding
//! algorithms for lattice quantizers and codes").

use std::sync::Arc;

use rand::SeedableRng;
use rand::rngs::SmallRng;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::constants::LATTICE_DIM;
use crate::error::{CoreError, Result};
use crate::roots::RootSystem;
use crate::vector::{Vec8, distance_sq, gauss_random, norm_sq};

/// Frozen reduction matrix, row-major `input_dim × 8`.
///
/// Changing it invalidates every stored lattice coordinate, so snapshots
/// persist the values verbatim instead of the seed.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProjectionMatrix {
    input_dim: usize,
    values: Vec<f64>,
}

impl ProjectionMatrix {
    pub fn identity() -> Self {
        let mut values = vec![0.0; LATTICE_DIM * LATTICE_DIM];
        for i in 0..LATTICE_DIM {
            values[i * LATTICE_DIM + i] = 1.0;
        }
        Self {
            input_dim: LATTICE_DIM,
            values,
        }
    }

    /// Gaussian matrix with unit-norm columns; identity when `input_dim == 8`.
    pub fn seeded(input_dim: usize, seed: u64) -> Self {
        if input_dim == LATTICE_DIM {
            return Self::identity();
        }

        let mut rng = SmallRng::seed_from_u64(seed);
        let mut values: Vec<f64> = (0..input_dim * LATTICE_DIM)
            .map(|_| gauss_random(&mut rng))
            .collect();

        for col in 0..LATTICE_DIM {
            let norm = (0..input_dim)
                .map(|row| values[row * LATTICE_DIM + col].powi(2))
                .sum::<f64>()
                .sqrt();
            if norm > 0.0 {
                for row in 0..input_dim {
                    values[row * LATTICE_DIM + col] /= norm;
                }
            }
        }

        Self { input_dim, values }
    }

    pub fn from_values(input_dim: usize, values: Vec<f64>) -> Result<Self> {
        if input_dim == 0 || values.len() != input_dim * LATTICE_DIM {
            return Err(CoreError::InvalidConfig(format!(
                "projection matrix needs {input_dim}×{LATTICE_DIM} values, got {}",
                values.len()
            )));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(CoreError::InvalidConfig(
                "projection matrix has non-finite values".into(),
            ));
        }
        Ok(Self { input_dim, values })
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// `eᵀW`. The caller guarantees `e.len() == input_dim`.
    fn reduce(&self, e: &[f64]) -> Vec8 {
        let mut out = [0.0; LATTICE_DIM];
        for (row, x) in e.iter().enumerate() {
            let base = row * LATTICE_DIM;
            for (col, o) in out.iter_mut().enumerate() {
                *o += x * self.values[base + col];
            }
        }
        out
    }
}

/// Result of projecting one embedding.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Projection {
    /// Scaled reduced vector before snapping.
    pub reduced: Vec8,
    pub lattice_coord: Vec8,
    pub nearest_root_id: usize,
    pub shell: u32,
}

/// Pure projection from embeddings to lattice coordinates.
#[derive(Clone, Debug)]
pub struct LatticeProjector {
    roots: Arc<RootSystem>,
    matrix: ProjectionMatrix,
    lattice_scale: f64,
}

impl LatticeProjector {
    pub fn new(roots: Arc<RootSystem>, matrix: ProjectionMatrix, lattice_scale: f64) -> Self {
        Self {
            roots,
            matrix,
            lattice_scale,
        }
    }

    pub fn from_config(roots: Arc<RootSystem>, config: &EngineConfig) -> Self {
        Self::new(
            roots,
            ProjectionMatrix::seeded(config.embed_dim, config.seed),
            config.projection.lattice_scale,
        )
    }

    pub fn input_dim(&self) -> usize {
        self.matrix.input_dim()
    }

    pub fn matrix(&self) -> &ProjectionMatrix {
        &self.matrix
    }

    pub fn lattice_scale(&self) -> f64 {
        self.lattice_scale
    }

    pub fn roots(&self) -> &RootSystem {
        &self.roots
    }

    pub fn project(&self, embedding: &[f64]) -> Result<Projection> {
        if embedding.len() != self.matrix.input_dim() {
            return Err(CoreError::ProjectionDimension {
                expected: self.matrix.input_dim(),
                actual: embedding.len(),
            });
        }
        if let Some(index) = embedding.iter().position(|v| !v.is_finite()) {
            return Err(CoreError::NonFiniteEmbedding { index });
        }

        let reduced = self.matrix.reduce(embedding).map(|v| v * self.lattice_scale);
        let lattice_coord = snap_to_e8(&reduced);
        let nearest_root_id = self.roots.nearest_root(&reduced);

        Ok(Projection {
            reduced,
            lattice_coord,
            nearest_root_id,
            shell: shell_of(&lattice_coord),
        })
    }
}

/// Shell number `round(‖x‖² / 2)`. Exact for lattice points, whose squared
/// norms are even integers.
pub fn shell_of(coord: &Vec8) -> u32 {
    (norm_sq(coord) / 2.0).round().min(u32::MAX as f64) as u32
}

/// Nearest E8 lattice point. Ties between the two cosets go to the integer one.
pub fn snap_to_e8(x: &Vec8) -> Vec8 {
    let integer = nearest_d8(x);
    let shifted: Vec8 = std::array::from_fn(|i| x[i] - 0.5);
    let half = nearest_d8(&shifted).map(|v| v + 0.5);
    if distance_sq(x, &half) < distance_sq(x, &integer) {
        half
    } else {
        integer
    }
}

/// Nearest point of D8 (integer vectors with even coordinate sum): round
/// everything, and on odd parity re-round the worst coordinate the other way.
fn nearest_d8(x: &Vec8) -> Vec8 {
    let mut f: Vec8 = std::array::from_fn(|i| x[i].round());
    let sum: f64 = f.iter().sum();
    if (sum as i64).rem_euclid(2) != 0 {
        let mut k = 0;
        let mut worst = -1.0;
        for i in 0..LATTICE_DIM {
            let d = (x[i] - f[i]).abs();
            if d > worst {
                worst = d;
                k = i;
            }
        }
        f[k] += if x[k] >= f[k] { 1.0 } else { -1.0 };
    }
    f
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn projector_8d() -> LatticeProjector {
        LatticeProjector::new(
            Arc::new(RootSystem::new().unwrap()),
            ProjectionMatrix::identity(),
            1.0,
        )
    }

    fn is_e8_point(p: &Vec8) -> bool {
        let all_int = p.iter().all(|c| (c - c.round()).abs() < 1e-12);
        let all_half = p.iter().all(|c| ((c - 0.5) - (c - 0.5).round()).abs() < 1e-12);
        let sum: f64 = p.iter().sum();
        (all_int || all_half) && (sum.round() as i64).rem_euclid(2) == 0
    }

    #[test]
    fn test_lattice_point_maps_to_itself() {
        let projector = projector_8d();
        let p = projector.project(&[2.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]).unwrap();
        assert_eq!(p.lattice_coord, [2.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(p.shell, 2);

        let half = [0.5, 0.5, 0.5, 0.5, 0.5, 0.5, 0.5, 0.5];
        let p = projector.project(&half).unwrap();
        assert_eq!(p.lattice_coord, half);
        assert_eq!(p.shell, 1);
        assert_eq!(p.nearest_root_id, 112);
    }

    #[test]
    fn test_near_point_snaps() {
        let projector = projector_8d();
        let p = projector
            .project(&[1.9, 0.1, -0.05, 0.0, 0.02, 0.0, 0.0, -0.1])
            .unwrap();
        assert_eq!(p.lattice_coord, [2.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_odd_parity_is_corrected() {
        // Rounds to (1,0,...) whose sum is odd; nearest D8 point flips the
        // worst-rounded coordinate instead.
        let snapped = snap_to_e8(&[0.9, 0.4, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(snapped, [1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_dimension_mismatch() {
        let projector = projector_8d();
        let err = projector.project(&[1.0; 7]).unwrap_err();
        assert!(matches!(
            err,
            CoreError::ProjectionDimension {
                expected: 8,
                actual: 7
            }
        ));
    }

    #[test]
    fn test_non_finite_rejected() {
        let projector = projector_8d();
        let mut e = [0.0; 8];
        e[3] = f64::NAN;
        assert!(matches!(
            projector.project(&e),
            Err(CoreError::NonFiniteEmbedding { index: 3 })
        ));
    }

    #[test]
    fn test_seeded_matrix_columns_unit() {
        let m = ProjectionMatrix::seeded(32, 7);
        for col in 0..LATTICE_DIM {
            let n: f64 = (0..32).map(|row| m.values()[row * LATTICE_DIM + col].powi(2)).sum();
            assert!((n - 1.0).abs() < 1e-9);
        }
        assert_eq!(m, ProjectionMatrix::seeded(32, 7));
        assert_ne!(m, ProjectionMatrix::seeded(32, 8));
    }

    #[test]
    fn test_eight_dim_is_identity() {
        assert_eq!(ProjectionMatrix::seeded(8, 99), ProjectionMatrix::identity());
    }

    #[test]
    fn test_lattice_scale_applied() {
        let projector = LatticeProjector::new(
            Arc::new(RootSystem::new().unwrap()),
            ProjectionMatrix::identity(),
            2.0,
        );
        let p = projector.project(&[1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]).unwrap();
        assert_eq!(p.reduced[0], 2.0);
        assert_eq!(p.shell, 2);
    }

    #[test]
    fn test_from_values_checks_shape() {
        assert!(ProjectionMatrix::from_values(3, vec![0.0; 23]).is_err());
        assert!(ProjectionMatrix::from_values(3, vec![0.0; 24]).is_ok());
    }

    #[test]
    fn test_shell_of() {
        assert_eq!(shell_of(&[0.0; 8]), 0);
        assert_eq!(shell_of(&[1.0, -1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]), 1);
        assert_eq!(shell_of(&[1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0]), 2);
        assert_eq!(shell_of(&[2.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0]), 3);
    }

    proptest! {
        #[test]
        fn prop_project_deterministic(v in proptest::collection::vec(-3.0f64..3.0, 24)) {
            let projector = LatticeProjector::new(
                Arc::new(RootSystem::new().unwrap()),
                ProjectionMatrix::seeded(24, 42),
                3.0,
            );
            let a = projector.project(&v).unwrap();
            let b = projector.project(&v).unwrap();
            prop_assert_eq!(a, b);
        }

        #[test]
        fn prop_snap_is_lattice_point_and_idempotent(v in proptest::array::uniform8(-4.0f64..4.0)) {
            let p = snap_to_e8(&v);
            prop_assert!(is_e8_point(&p), "{:?} is not in E8", p);
            prop_assert_eq!(snap_to_e8(&p), p);
        }

        #[test]
        fn prop_snap_is_locally_nearest(v in proptest::array::uniform8(-4.0f64..4.0)) {
            // The Voronoi-relevant vectors of E8 are its roots, so beating every
            // root-neighbor of the snapped point means it is the global nearest.
            let roots = RootSystem::generate();
            let p = snap_to_e8(&v);
            let d = distance_sq(&v, &p);
            for r in &roots {
                let q: Vec8 = std::array::from_fn(|i| p[i] + r[i]);
                prop_assert!(d <= distance_sq(&v, &q) + 1e-12);
            }
        }
    }
}
