//! SetuRBA - Incremental relative bundle adjustment for online robot mapping
//!
//! The engine maintains a growing graph of keyframes connected by
//! relative-pose edges and landmark observations, and re-optimizes a local
//! neighborhood of that graph as new keyframes arrive — never the whole
//! history — keeping the per-step cost bounded for online use.
//!
//! # Architecture
//!
//! The crate is organized into 4 logical layers:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    engine                           │  ← Orchestration
//! │        (ingestion, local-area optimization)         │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │                   optimizer/                        │  ← Numerics
//! │      (jacobians, Schur normal equations, LM)        │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │                     graph/                          │  ← Problem state
//! │       (state, spanning-tree cache, BFS visitor)     │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │                      core/                          │  ← Foundation
//! │          (ids, pose algebra, sensor models)         │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! # Coordinates
//!
//! Keyframes never hold absolute poses: the only pose unknowns are the
//! relative poses on k2k edges, and landmark positions are relative to a
//! base keyframe. Usable local frames come from per-root, depth-bounded
//! spanning trees that compose edge poses on demand and invalidate lazily
//! when the solver moves an edge.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use setu_rba::{Cartesian2D, NewObservation, RbaEngine, RbaParams};
//! use nalgebra::DVector;
//!
//! let mut engine: RbaEngine<Cartesian2D> =
//!     RbaEngine::new(Cartesian2D, RbaParams::default());
//!
//! let obs = vec![NewObservation::with_initial_position(
//!     7,
//!     DVector::from_vec(vec![1.0, 0.5]),
//!     DVector::from_vec(vec![1.0, 0.5]),
//! )];
//! let info = engine.define_new_keyframe(&obs, true)?;
//! println!("keyframe {} with {} edges", info.kf_id, info.created_edge_ids.len());
//! # Ok::<(), setu_rba::RbaError>(())
//! ```

#![warn(missing_docs)]

// ============================================================================
// Layer 1: Core foundation (no internal deps)
// ============================================================================
pub mod core;

// ============================================================================
// Layer 2: Graph state and traversal (depends on core)
// ============================================================================
pub mod graph;

// ============================================================================
// Layer 3: Numerical optimization (depends on core, graph)
// ============================================================================
pub mod optimizer;

// ============================================================================
// Layer 4: Engine orchestration (depends on all layers)
// ============================================================================
mod engine;

pub mod config;
pub mod error;
pub mod policy;

// ============================================================================
// Convenience re-exports (flat namespace for common use)
// ============================================================================

pub use config::{OptimizeLocalAreaParams, RbaParams};
pub use crate::core::{
    Cartesian2D, EdgeId, KeyframeId, LandmarkId, NewObservation, Pose2D, RangeBearing2D,
    RelativePose, SensorModel, TopoDist,
};
pub use engine::{NewKeyframeInfo, RbaEngine};
pub use error::{RbaError, Result};
pub use graph::{
    bfs_visit, create_complete_spanning_tree, find_path_bfs, BfsVisitor, GraphState, Kf2KfEdge,
    LandmarkEntry, Observation, SpanTreeNode, SpanningTreeCache, TreeEntry,
};
pub use optimizer::{
    IterationObserver, NullObserver, OptimizationResult, RobustKernel, SparsityStats,
    TerminationReason,
};
pub use policy::{EdgeCreationPolicy, LocalAreasFixedSize, ProposedEdge};
