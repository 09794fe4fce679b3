use std::ops::Mul;

use serde::{Deserialize, Serialize};

use crate::constants::{EPSILON, SLERP_THRESHOLD};
use crate::vector::Vec8;

/// Relation transform carried by nodes and edges: a unit quaternion, i.e. an
/// element of the even subalgebra of Cl(3).
///
/// Composition is the Hamilton product, which is associative, so rotors
/// along a path of edges compose in any grouping.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Rotor {
    pub w: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl PartialEq for Rotor {
    fn eq(&self, other: &Self) -> bool {
        (self.w - other.w).abs() < EPSILON
            && (self.x - other.x).abs() < EPSILON
            && (self.y - other.y).abs() < EPSILON
            && (self.z - other.z).abs() < EPSILON
    }
}

impl Default for Rotor {
    fn default() -> Self {
        Self::identity()
    }
}

impl Rotor {
    /// Create a new rotor, automatically normalized.
    pub fn new(w: f64, x: f64, y: f64, z: f64) -> Self {
        Self { w, x, y, z }.normalize()
    }

    pub fn identity() -> Self {
        Self {
            w: 1.0,
            x: 0.0,
            y: 0.0,
            z: 0.0,
        }
    }

    /// Normalize to unit length. Returns identity if near-zero magnitude.
    pub fn normalize(self) -> Self {
        let norm = (self.w * self.w + self.x * self.x + self.y * self.y + self.z * self.z).sqrt();
        if norm < EPSILON {
            return Self::identity();
        }
        Self {
            w: self.w / norm,
            x: self.x / norm,
            y: self.y / norm,
            z: self.z / norm,
        }
    }

    /// Inverse of a unit rotor.
    pub fn conjugate(self) -> Self {
        Self {
            w: self.w,
            x: -self.x,
            y: -self.y,
            z: -self.z,
        }
    }

    pub fn dot(self, other: Self) -> f64 {
        self.w * other.w + self.x * other.x + self.y * other.y + self.z * other.z
    }

    /// Fold an 8D lattice direction into a unit quaternion by pairing the
    /// two 4D halves. Directions in the fold's kernel map to identity.
    pub fn from_lattice(v: &Vec8) -> Self {
        Self::new(v[0] + v[4], v[1] + v[5], v[2] + v[6], v[3] + v[7])
    }

    /// Relation taking `from` to `to`: `q(to) · q(from)⁻¹`.
    /// `between(b, c) * between(a, b) == between(a, c)`.
    pub fn between(from: &Vec8, to: &Vec8) -> Self {
        (Self::from_lattice(to) * Self::from_lattice(from).conjugate()).normalize()
    }

    /// Spherical linear interpolation with antipodal flip and NLERP fallback.
    pub fn slerp(self, other: Self, t: f64) -> Self {
        if t <= 0.0 {
            return self;
        }
        if t >= 1.0 {
            return other;
        }

        let mut dot = self.dot(other);
        let o;

        // Take shorter arc
        if dot < 0.0 {
            o = -other;
            dot = -dot;
        } else {
            o = other;
        }

        if dot > SLERP_THRESHOLD {
            return Self {
                w: self.w + t * (o.w - self.w),
                x: self.x + t * (o.x - self.x),
                y: self.y + t * (o.y - self.y),
                z: self.z + t * (o.z - self.z),
            }
            .normalize();
        }

        let theta = dot.clamp(-1.0, 1.0).acos();
        let sin_theta = theta.sin();

        let s0 = ((1.0 - t) * theta).sin() / sin_theta;
        let s1 = (t * theta).sin() / sin_theta;

        Self {
            w: s0 * self.w + s1 * o.w,
            x: s0 * self.x + s1 * o.x,
            y: s0 * self.y + s1 * o.y,
            z: s0 * self.z + s1 * o.z,
        }
        .normalize()
    }

    /// Running slerp mean of a sequence of rotors. Identity for an empty input.
    pub fn mean<I: IntoIterator<Item = Self>>(rotors: I) -> Self {
        let mut acc = Self::identity();
        for (i, r) in rotors.into_iter().enumerate() {
            acc = if i == 0 { r } else { acc.slerp(r, 1.0 / (i as f64 + 1.0)) };
        }
        acc
    }

    pub fn to_array(self) -> [f64; 4] {
        [self.w, self.x, self.y, self.z]
    }

    pub fn from_array(arr: [f64; 4]) -> Self {
        Self::new(arr[0], arr[1], arr[2], arr[3])
    }
}

impl std::ops::Neg for Rotor {
    type Output = Self;

    fn neg(self) -> Self {
        Self {
            w: -self.w,
            x: -self.x,
            y: -self.y,
            z: -self.z,
        }
    }
}

/// Hamilton product (rotor composition).
impl Mul for Rotor {
    type Output = Self;

    fn mul(self, rhs: Self) -> Self {
        Self {
            w: self.w * rhs.w - self.x * rhs.x - self.y * rhs.y - self.z * rhs.z,
            x: self.w * rhs.x + self.x * rhs.w + self.y * rhs.z - self.z * rhs.y,
            y: self.w * rhs.y - self.x * rhs.z + self.y * rhs.w + self.z * rhs.x,
            z: self.w * rhs.z + self.x * rhs.y - self.y * rhs.x + self.z * rhs.w,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_unit(q: Rotor) {
        let norm = (q.w * q.w + q.x * q.x + q.y * q.y + q.z * q.z).sqrt();
        assert!((norm - 1.0).abs() < 1e-10, "rotor not unit: norm = {norm}");
    }

    /// Geodesic distance on S³, treating q and -q as the same rotation.
    fn angular_distance(a: Rotor, b: Rotor) -> f64 {
        2.0 * a.dot(b).abs().clamp(-1.0, 1.0).acos()
    }

    fn assert_approx_eq(a: Rotor, b: Rotor, tol: f64) {
        // q and -q are the same rotation
        let direct = (a.w - b.w)
            .abs()
            .max((a.x - b.x).abs())
            .max((a.y - b.y).abs())
            .max((a.z - b.z).abs());
        let antipodal = (a.w + b.w)
            .abs()
            .max((a.x + b.x).abs())
            .max((a.y + b.y).abs())
            .max((a.z + b.z).abs());
        let min_diff = direct.min(antipodal);
        assert!(min_diff < tol, "rotors not approx equal: {a:?} vs {b:?} (min_diff = {min_diff})");
    }

    fn sample() -> [Rotor; 3] {
        [
            Rotor::new(0.3, 0.1, -0.7, 0.2),
            Rotor::new(-0.5, 0.4, 0.4, 0.1),
            Rotor::new(0.9, -0.2, 0.05, 0.3),
        ]
    }

    #[test]
    fn test_normalize_near_zero() {
        assert_eq!(Rotor::new(0.0, 0.0, 0.0, 0.0), Rotor::identity());
    }

    #[test]
    fn test_composition_associative() {
        let [a, b, c] = sample();
        assert_approx_eq((a * b) * c, a * (b * c), 1e-10);
    }

    #[test]
    fn test_identity_is_neutral() {
        let [a, _, _] = sample();
        assert_approx_eq(a * Rotor::identity(), a, 1e-12);
        assert_approx_eq(Rotor::identity() * a, a, 1e-12);
    }

    #[test]
    fn test_conjugate_inverts() {
        let [a, _, _] = sample();
        assert_approx_eq(a * a.conjugate(), Rotor::identity(), 1e-10);
    }

    #[test]
    fn test_between_composes_along_path() {
        let p = [1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let q = [0.0, 0.0, 1.0, 0.0, 0.0, -1.0, 0.0, 0.0];
        let r = [0.5, -0.5, 0.5, 0.5, 0.5, 0.5, -0.5, 0.5];
        let via = Rotor::between(&q, &r) * Rotor::between(&p, &q);
        assert_approx_eq(via, Rotor::between(&p, &r), 1e-10);
    }

    #[test]
    fn test_between_reverse_is_conjugate() {
        let p = [1.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let q = [0.0, 0.0, 1.0, 0.0, 0.0, -1.0, 0.0, 0.0];
        assert_approx_eq(Rotor::between(&q, &p), Rotor::between(&p, &q).conjugate(), 1e-10);
    }

    #[test]
    fn test_slerp_endpoints_and_midpoint() {
        let [a, b, _] = sample();
        assert_approx_eq(a.slerp(b, 0.0), a, 1e-12);
        assert_approx_eq(a.slerp(b, 1.0), b, 1e-12);
        let mid = a.slerp(b, 0.5);
        assert_unit(mid);
        let da = angular_distance(a, mid);
        let db = angular_distance(mid, b);
        assert!((da - db).abs() < 0.01, "midpoint not equidistant: {da} vs {db}");
    }

    #[test]
    fn test_mean_of_identical() {
        let [a, _, _] = sample();
        assert_approx_eq(Rotor::mean([a, a, a]), a, 1e-10);
        assert_eq!(Rotor::mean(std::iter::empty()), Rotor::identity());
    }

    #[test]
    fn test_to_from_array_roundtrip() {
        let [a, _, _] = sample();
        assert_approx_eq(Rotor::from_array(a.to_array()), a, 1e-12);
    }
}
