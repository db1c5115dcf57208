//! Engine and optimization parameters.

use serde::{Deserialize, Serialize};

use crate::core::types::{KeyframeId, TopoDist};

/// Parameters of the RBA engine and its solver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RbaParams {
    /// Maximum depth of the incrementally maintained spanning trees.
    pub max_tree_depth: TopoDist,

    /// Topological window around a new keyframe for automatic local
    /// optimization.
    pub max_optimize_depth: TopoDist,

    /// Before the full local-area solve, optimize the newly created edges
    /// alone for a better starting point.
    pub optimize_new_edges_alone: bool,

    /// Weight residuals with the pseudo-Huber kernel during the local-area
    /// solve.
    pub use_robust_kernel: bool,

    /// Weight residuals with the pseudo-Huber kernel during the
    /// new-edges-alone pass.
    pub use_robust_kernel_stage1: bool,

    /// Pseudo-Huber kernel width.
    pub kernel_param: f64,

    /// Maximum LM iterations per optimization call.
    pub max_iters: usize,

    /// Stop when the per-observation error improvement drops below this.
    pub max_error_per_obs_to_stop: f64,

    /// Gain-ratio clamp used in the damping decrease schedule.
    pub max_rho: f64,

    /// Damping ceiling; exceeding it reports divergence.
    pub max_lambda: f64,

    /// Minimum relative error reduction before Jacobians are recomputed
    /// (smaller improvements reuse the current linearization).
    pub min_error_reduction_ratio_to_relinearize: f64,

    /// Use central-difference Jacobians instead of the analytical forms
    /// (slow; for validation or models without analytical derivatives).
    pub numeric_jacobians: bool,

    /// Compute the reduced Hessian condition number (costs an SVD).
    pub compute_condition_number: bool,

    /// Collect sparsity statistics of the problem matrices.
    pub compute_sparsity_stats: bool,
}

impl Default for RbaParams {
    fn default() -> Self {
        Self {
            max_tree_depth: 4,
            max_optimize_depth: 4,
            optimize_new_edges_alone: true,
            use_robust_kernel: false,
            use_robust_kernel_stage1: false,
            kernel_param: 3.0,
            max_iters: 20,
            max_error_per_obs_to_stop: 1e-9,
            max_rho: 1.0,
            max_lambda: 1e20,
            min_error_reduction_ratio_to_relinearize: 0.01,
            numeric_jacobians: false,
            compute_condition_number: false,
            compute_sparsity_stats: false,
        }
    }
}

/// Parameters for [`crate::RbaEngine::optimize_local_area`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizeLocalAreaParams {
    /// Treat the k2k edges in the window as unknowns.
    pub optimize_k2k_edges: bool,

    /// Treat unknown landmarks in the window as unknowns.
    pub optimize_landmarks: bool,

    /// While exploring around the root, ignore keyframes with an id above
    /// this bound.
    pub max_visitable_kf_id: KeyframeId,

    /// A landmark is only optimized once it has been observed at least this
    /// many times within the window. Set to 1 to optimize single-observation
    /// landmarks (sensible for some sensors).
    pub dont_optimize_landmarks_seen_less_than_n_times: usize,
}

impl Default for OptimizeLocalAreaParams {
    fn default() -> Self {
        Self {
            optimize_k2k_edges: true,
            optimize_landmarks: true,
            max_visitable_kf_id: KeyframeId::MAX,
            dont_optimize_landmarks_seen_less_than_n_times: 2,
        }
    }
}
