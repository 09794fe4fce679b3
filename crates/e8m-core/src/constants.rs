/// Dimension of the lattice space.
pub const LATTICE_DIM: usize = 8;

/// Number of E8 root vectors.
pub const ROOT_COUNT: usize = 240;

/// Squared norm of every E8 root.
pub const ROOT_NORM_SQ: f64 = 2.0;

/// Tolerance for root-system validation (norms and inner products).
pub const ROOT_TOLERANCE: f64 = 1e-9;

/// Numerical epsilon for near-zero comparisons
pub const EPSILON: f64 = 1e-10;

/// SLERP near-parallel threshold
pub const SLERP_THRESHOLD: f64 = 0.9995;

/// Added to entropy before inversion so zero-entropy nodes get a finite weight.
pub const ENTROPY_FLOOR: f64 = 1e-6;

/// Volume coefficient of the unit 8-ball: π⁴ / 24.
pub const UNIT_BALL_VOLUME_8D: f64 = 4.058_712_126_416_768;

/// Embedding dimension used when nothing is configured.
pub const DEFAULT_EMBED_DIM: usize = 1536;

/// Seed used for the frozen projection matrix when nothing is configured.
pub const DEFAULT_SEED: u64 = 42;
