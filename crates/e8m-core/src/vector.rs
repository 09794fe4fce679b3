//! Small fixed-size vector helpers for the 8D lattice space.

use rand::Rng;

use crate::constants::{EPSILON, LATTICE_DIM};

/// A point or direction in the 8D lattice space.
pub type Vec8 = [f64; LATTICE_DIM];

pub const ZERO: Vec8 = [0.0; LATTICE_DIM];

pub fn dot(a: &Vec8, b: &Vec8) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub fn norm_sq(a: &Vec8) -> f64 {
    dot(a, a)
}

pub fn norm(a: &Vec8) -> f64 {
    norm_sq(a).sqrt()
}

pub fn scale(a: &Vec8, s: f64) -> Vec8 {
    std::array::from_fn(|i| a[i] * s)
}

pub fn distance_sq(a: &Vec8, b: &Vec8) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

pub fn distance(a: &Vec8, b: &Vec8) -> f64 {
    distance_sq(a, b).sqrt()
}

/// Cosine of the angle between two vectors; 0 when either is near zero.
pub fn cosine(a: &Vec8, b: &Vec8) -> f64 {
    let na = norm(a);
    let nb = norm(b);
    if na < EPSILON || nb < EPSILON {
        return 0.0;
    }
    (dot(a, b) / (na * nb)).clamp(-1.0, 1.0)
}

pub fn is_zero(a: &Vec8) -> bool {
    norm_sq(a) < EPSILON * EPSILON
}

/// Cosine similarity for arbitrary-length slices; 0 on length mismatch or zero norm.
pub fn cosine_slice(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }
    let (mut ab, mut aa, mut bb) = (0.0, 0.0, 0.0);
    for (x, y) in a.iter().zip(b) {
        ab += x * y;
        aa += x * x;
        bb += y * y;
    }
    let denom = (aa * bb).sqrt();
    if denom < EPSILON {
        return 0.0;
    }
    (ab / denom).clamp(-1.0, 1.0)
}

/// Box-Muller transform for generating Gaussian-distributed random numbers.
pub fn gauss_random(rng: &mut impl Rng) -> f64 {
    // Clamp u1 away from 0 to avoid ln(0) = -inf
    let u1: f64 = rng.random::<f64>().max(f64::MIN_POSITIVE);
    let u2: f64 = rng.random();
    (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}
