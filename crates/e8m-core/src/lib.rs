//! E8 lattice cognitive-memory engine.
//!
//! Concept embeddings are projected onto the E8 lattice, bucketed into
//! concentric shells by norm, surfaced through a time-gated emergence model
//! and retrieved by a geometry-weighted score. Dense clusters consolidate into
//! summary nodes whose lineage can later be reseeded.
//!
//! Zero I/O: persistence and transport live in other crates.

pub mod arena;
pub mod config;
pub mod consolidation;
pub mod constants;
pub mod emergence;
pub mod error;
pub mod kdtree;
pub mod memory;
pub mod mood;
pub mod node;
pub mod policy;
pub mod projector;
pub mod retrieval;
pub mod roots;
pub mod rotor;
pub mod shell_index;
pub mod snapshot;
pub mod state;
pub mod time;
pub mod vector;

pub use arena::NodeArena;
pub use config::{
    ConsolidationConfig, EmergenceConfig, EngineConfig, GraphConfig, IndexConfig, PolicyConfig,
    ProjectionConfig, RetrievalConfig,
};
pub use consolidation::{ConsolidationEngine, MergeEvent};
pub use constants::{DEFAULT_EMBED_DIM, DEFAULT_SEED, LATTICE_DIM, ROOT_COUNT};
pub use emergence::EmergenceClock;
pub use error::{CoreError, Result};
pub use memory::{CycleReport, MemoryStats, MemoryStore};
pub use mood::MoodState;
pub use node::{ConsolidationState, Edge, EmergenceParams, MemoryNode, NodeId};
pub use policy::{ArmEstimate, ConsolidationPolicy, OutcomeScore, PolicyArm, PolicySnapshot};
pub use projector::{LatticeProjector, Projection, ProjectionMatrix, shell_of, snap_to_e8};
pub use retrieval::{RetrievalEngine, RetrievalHit};
pub use roots::RootSystem;
pub use rotor::Rotor;
pub use shell_index::ShellIndex;
pub use snapshot::{CURRENT_VERSION, Snapshot, export_json, import_json};
pub use state::{Admission, EngineContext, StoreState};
pub use vector::Vec8;
