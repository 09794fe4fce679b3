//! The E8 root system: 240 vectors of squared norm 2 whose integer span is
//! the E8 lattice.
//!
//! Roots come in two families:
//! - 112 integer roots `(±1, ±1, 0, 0, 0, 0, 0, 0)` over all position pairs,
//! - 128 half-integer roots `(±½)⁸` with an even number of minus signs.
//!
//! Validation is load-bearing for everything downstream, so the store refuses
//! to start (or to reload) on any failure.

use crate::constants::{LATTICE_DIM, ROOT_COUNT, ROOT_NORM_SQ, ROOT_TOLERANCE};
use crate::error::{CoreError, Result};
use crate::vector::{Vec8, dot, norm_sq};

/// Validated, immutable set of the 240 E8 roots plus their integer Gram table.
#[derive(Clone, Debug)]
pub struct RootSystem {
    roots: Vec<Vec8>,
    gram: Vec<i8>,
}

impl RootSystem {
    /// Generate and validate the canonical root set.
    pub fn new() -> Result<Self> {
        Self::from_roots(Self::generate())
    }

    /// Validate an externally supplied root set (e.g. loaded from disk).
    pub fn from_roots(roots: Vec<Vec8>) -> Result<Self> {
        let gram = validate_with_gram(&roots)?;
        Ok(Self { roots, gram })
    }

    /// The 240 roots in canonical order: integer family first, then the
    /// half-integer family in binary-counting sign order.
    pub fn generate() -> Vec<Vec8> {
        let mut roots = Vec::with_capacity(ROOT_COUNT);

        for i in 0..LATTICE_DIM {
            for j in (i + 1)..LATTICE_DIM {
                for si in [1.0, -1.0] {
                    for sj in [1.0, -1.0] {
                        let mut v = [0.0; LATTICE_DIM];
                        v[i] = si;
                        v[j] = sj;
                        roots.push(v);
                    }
                }
            }
        }

        for mask in 0u32..(1 << LATTICE_DIM) {
            if mask.count_ones() % 2 != 0 {
                continue;
            }
            let v: Vec8 =
                std::array::from_fn(|k| if mask & (1 << k) != 0 { -0.5 } else { 0.5 });
            roots.push(v);
        }

        roots
    }

    /// Check every norm and every pairwise inner product.
    pub fn validate(roots: &[Vec8]) -> Result<()> {
        validate_with_gram(roots).map(|_| ())
    }

    pub fn is_valid(roots: &[Vec8]) -> bool {
        Self::validate(roots).is_ok()
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn roots(&self) -> &[Vec8] {
        &self.roots
    }

    /// Root by id. Panics on an out-of-range id; ids come from `nearest_root`.
    pub fn root(&self, id: usize) -> &Vec8 {
        &self.roots[id]
    }

    /// Integer inner product of two roots: 2 on the diagonal, -2 for
    /// antipodes, otherwise -1, 0 or 1.
    pub fn root_inner(&self, a: usize, b: usize) -> i8 {
        self.gram[a * self.roots.len() + b]
    }

    /// Root with the greatest cosine to `v`. All roots share one norm, so this
    /// is the largest inner product. Ties resolve to the lowest id.
    pub fn nearest_root(&self, v: &Vec8) -> usize {
        let mut best = 0;
        let mut best_ip = f64::NEG_INFINITY;
        for (id, root) in self.roots.iter().enumerate() {
            let ip = dot(v, root);
            if ip > best_ip {
                best_ip = ip;
                best = id;
            }
        }
        best
    }
}

fn validate_with_gram(roots: &[Vec8]) -> Result<Vec<i8>> {
    if roots.len() != ROOT_COUNT {
        return Err(CoreError::Structural(format!(
            "expected {ROOT_COUNT} roots, got {}",
            roots.len()
        )));
    }

    for (i, r) in roots.iter().enumerate() {
        if r.iter().any(|c| !c.is_finite()) {
            return Err(CoreError::Structural(format!("root {i} has a non-finite component")));
        }
        let n = norm_sq(r);
        if (n - ROOT_NORM_SQ).abs() > ROOT_TOLERANCE {
            return Err(CoreError::Structural(format!(
                "root {i} has squared norm {n}, expected {ROOT_NORM_SQ}"
            )));
        }
    }

    let n = roots.len();
    let mut gram = vec![0i8; n * n];
    let mut antipodal_pairs = 0usize;

    for i in 0..n {
        gram[i * n + i] = 2;
        for j in (i + 1)..n {
            let ip = dot(&roots[i], &roots[j]);
            let rounded = ip.round();
            if (ip - rounded).abs() > ROOT_TOLERANCE {
                return Err(CoreError::Structural(format!(
                    "roots {i} and {j} have non-integer inner product {ip}"
                )));
            }
            let value = match rounded as i64 {
                v @ -1..=1 => v as i8,
                // Equal norms and <r, s> = -2 force s = -r.
                -2 => {
                    antipodal_pairs += 1;
                    -2
                }
                other => {
                    return Err(CoreError::Structural(format!(
                        "roots {i} and {j} have inner product {other}"
                    )));
                }
            };
            gram[i * n + j] = value;
            gram[j * n + i] = value;
        }
    }

    if antipodal_pairs != ROOT_COUNT / 2 {
        return Err(CoreError::Structural(format!(
            "root set is not closed under negation: {antipodal_pairs} antipodal pairs"
        )));
    }

    Ok(gram)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_count_and_norms() {
        let roots = RootSystem::generate();
        assert_eq!(roots.len(), 240);
        for r in &roots {
            assert!((norm_sq(r) - 2.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_pairwise_inner_products() {
        let roots = RootSystem::generate();
        for i in 0..roots.len() {
            for j in (i + 1)..roots.len() {
                let ip = dot(&roots[i], &roots[j]);
                let antipodal = roots[i].iter().zip(&roots[j]).all(|(a, b)| (a + b).abs() < 1e-12);
                if antipodal {
                    assert!((ip + 2.0).abs() < 1e-9);
                } else {
                    assert!(
                        [-1.0, 0.0, 1.0].iter().any(|v| (ip - v).abs() < 1e-9),
                        "roots {i},{j}: inner product {ip}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_validate_canonical() {
        let system = RootSystem::new().unwrap();
        assert_eq!(system.len(), 240);
        assert!(RootSystem::is_valid(system.roots()));
    }

    #[test]
    fn test_generation_order_stable() {
        let roots = RootSystem::generate();
        assert_eq!(roots[0], [1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(roots[1], [1.0, -1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(roots[112], [0.5; 8]);
        assert_eq!(roots, RootSystem::generate());
    }

    #[test]
    fn test_validate_rejects_wrong_count() {
        let mut roots = RootSystem::generate();
        roots.pop();
        assert!(matches!(RootSystem::validate(&roots), Err(CoreError::Structural(_))));
    }

    #[test]
    fn test_validate_rejects_bad_norm() {
        let mut roots = RootSystem::generate();
        roots[17][0] *= 1.01;
        assert!(matches!(RootSystem::validate(&roots), Err(CoreError::Structural(_))));
    }

    #[test]
    fn test_validate_rejects_duplicate() {
        let mut roots = RootSystem::generate();
        roots[5] = roots[4];
        let err = RootSystem::validate(&roots).unwrap_err();
        assert!(err.to_string().contains("inner product 2"), "{err}");
    }

    #[test]
    fn test_validate_rejects_non_lattice_vector() {
        let mut roots = RootSystem::generate();
        // Norm 2 but not in E8: inner products with other roots go irrational.
        let s = 2f64.sqrt();
        roots[0] = [s, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        assert!(!RootSystem::is_valid(&roots));
    }

    #[test]
    fn test_root_inner_table() {
        let system = RootSystem::new().unwrap();
        assert_eq!(system.root_inner(0, 0), 2);
        // (1,1,0..) vs (-1,-1,0..) are antipodes
        let neg = system
            .roots()
            .iter()
            .position(|r| *r == [-1.0, -1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0])
            .unwrap();
        assert_eq!(system.root_inner(0, neg), -2);
        assert_eq!(system.root_inner(0, 112), 1);
    }

    #[test]
    fn test_nearest_root_ties_lowest_id() {
        let system = RootSystem::new().unwrap();
        assert_eq!(system.nearest_root(&[0.0; 8]), 0);
        // Along e0 the roots (1,±1,0..) and every (1,0,..,±1,..) tie; id 0 wins.
        assert_eq!(system.nearest_root(&[1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]), 0);
    }

    #[test]
    fn test_nearest_root_exact_match() {
        let system = RootSystem::new().unwrap();
        for (id, r) in system.roots().iter().enumerate() {
            assert_eq!(system.nearest_root(r), id);
        }
    }
}
