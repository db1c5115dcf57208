//! Damped Schur-complement Levenberg-Marquardt solver.
//!
//! One call optimizes a selected set of k2k edges and unknown landmarks
//! against the observations that touch them:
//!
//! ```text
//! initialize → residuals/Jacobians → normal equations (Schur)
//!   → pose step → landmark back-substitution → gain ratio
//!   → accept (decrease λ, maybe relinearize) | reject (restore, increase λ)
//!   → converged | iteration limit | diverged | solve failed
//! ```
//!
//! A rejected step leaves every unknown at its last-accepted value: the
//! candidate update is applied, evaluated, and rolled back atomically. The
//! robust kernel weights the normal equations only; all reported errors use
//! the raw residuals.

use std::collections::BTreeSet;

use log::{debug, trace};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::config::RbaParams;
use crate::core::pose::RelativePose;
use crate::core::sensor::SensorModel;
use crate::core::types::{EdgeId, KeyframeId, LandmarkId};
use crate::error::{RbaError, Result};
use crate::graph::bfs::find_path_bfs;
use crate::graph::spanning_tree::SpanningTreeCache;
use crate::graph::state::GraphState;

use super::hessian::{NormalEquations, SparsityStats};
use super::jacobians::{self, ActiveObs, ObsLinearization, PathStep};
use super::robust::RobustKernel;

/// Lower bound on the damping factor.
const MIN_LAMBDA: f64 = 1e-12;

/// Reason an optimization run terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationReason {
    /// Per-observation error improvement fell below the threshold.
    Converged,

    /// Maximum iteration count reached.
    MaxIterations,

    /// Damping factor exceeded its ceiling (divergence).
    Diverged,

    /// The damped normal equations could not be factorized.
    SolveFailed,

    /// No unknowns or no observations were selected.
    NothingToOptimize,
}

/// Statistics and outputs of one optimization run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationResult {
    /// Number of LM iterations performed (accepted and rejected).
    pub iterations: u32,

    /// Why the run stopped.
    pub termination: TerminationReason,

    /// Observations taken into account.
    pub num_observations: usize,

    /// Jacobian blocks evaluated over all relinearization steps.
    pub num_jacobians: usize,

    /// Solved unknowns of type "kf-to-kf edge".
    pub num_kf2kf_edges_optimized: usize,

    /// Solved unknowns of type "landmark relative position".
    pub num_lm_optimized: usize,

    /// Distinct keyframes touched by the optimized edges.
    pub num_kf_optimized: usize,

    /// Total scalar dimensions over all optimized unknowns.
    pub num_total_scalars_optimized: usize,

    /// Poses recomposed in the spanning-tree numeric layer during the run.
    pub num_span_tree_numeric_updates: u64,

    /// Total squared error (raw residuals) before optimization.
    pub total_sqr_error_init: f64,

    /// Total squared error (raw residuals) after optimization.
    pub total_sqr_error_final: f64,

    /// Final root-mean-square error per residual scalar, un-kerneled.
    pub obs_rmse: f64,

    /// Condition number of the reduced pose Hessian; only computed when
    /// enabled in parameters.
    pub hap_condition_number: Option<f64>,

    /// Sparsity statistics; only computed when enabled in parameters.
    pub sparsity: Option<SparsityStats>,

    /// Edge ids whose relative poses were treated as unknowns.
    pub optimized_k2k_edges: Vec<EdgeId>,

    /// Landmark ids whose relative positions were treated as unknowns.
    pub optimized_landmarks: Vec<LandmarkId>,
}

impl OptimizationResult {
    fn empty(termination: TerminationReason) -> Self {
        Self {
            iterations: 0,
            termination,
            num_observations: 0,
            num_jacobians: 0,
            num_kf2kf_edges_optimized: 0,
            num_lm_optimized: 0,
            num_kf_optimized: 0,
            num_total_scalars_optimized: 0,
            num_span_tree_numeric_updates: 0,
            total_sqr_error_init: 0.0,
            total_sqr_error_final: 0.0,
            obs_rmse: 0.0,
            hap_condition_number: None,
            sparsity: None,
            optimized_k2k_edges: Vec::new(),
            optimized_landmarks: Vec::new(),
        }
    }
}

/// Injected observer invoked once per LM iteration, accepted or rejected.
pub trait IterationObserver {
    /// `total_sq_error` and `rmse` are computed from raw residuals.
    fn on_iteration(&mut self, iteration: u32, total_sq_error: f64, rmse: f64, accepted: bool);
}

/// Observer that ignores every iteration.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullObserver;

impl IterationObserver for NullObserver {
    fn on_iteration(&mut self, _iteration: u32, _total_sq_error: f64, _rmse: f64, _accepted: bool) {}
}

/// Raw and kernel-weighted residuals at the current unknowns.
struct ResidualSet {
    raw_sq: f64,
    weighted_sq: f64,
    per_obs: Vec<(DVector<f64>, f64)>,
}

/// Snapshot of the selected unknowns, for rejected-step rollback.
struct Snapshot<P> {
    edge_poses: Vec<P>,
    lm_positions: Vec<DVector<f64>>,
}

/// Optimize the selected unknowns. See module docs for the state machine.
///
/// `candidate_obs` are the observation indices considered; observations with
/// no selected unknown on their path are dropped. Contract violations
/// (unknown edge/landmark ids, known-position landmarks) are errors.
#[allow(clippy::too_many_arguments)]
pub(crate) fn optimize_edges<M: SensorModel>(
    state: &mut GraphState<M::Pose>,
    cache: &mut SpanningTreeCache<M::Pose>,
    model: &M,
    params: &RbaParams,
    edge_ids: &[EdgeId],
    landmark_ids: &[LandmarkId],
    candidate_obs: &[usize],
    use_robust_kernel: bool,
    observer: &mut dyn IterationObserver,
) -> Result<OptimizationResult> {
    // Validate and order the unknowns deterministically.
    let edge_set: BTreeSet<EdgeId> = edge_ids.iter().copied().collect();
    for &edge in &edge_set {
        if state.edge(edge).is_none() {
            return Err(RbaError::UnknownEdge(edge));
        }
    }
    let lm_set: BTreeSet<LandmarkId> = landmark_ids.iter().copied().collect();
    for &lm in &lm_set {
        match state.landmark(lm) {
            None => return Err(RbaError::UnknownLandmark(lm)),
            Some((_, true)) => return Err(RbaError::LandmarkNotOptimizable(lm)),
            Some((_, false)) => {}
        }
    }

    let edge_list: Vec<EdgeId> = edge_set.iter().copied().collect();
    let lm_list: Vec<LandmarkId> = lm_set.iter().copied().collect();

    let mut result = OptimizationResult::empty(TerminationReason::NothingToOptimize);
    result.optimized_k2k_edges = edge_list.clone();
    result.optimized_landmarks = lm_list.clone();
    result.num_kf2kf_edges_optimized = edge_list.len();
    result.num_lm_optimized = lm_list.len();
    result.num_kf_optimized = {
        let mut kfs: BTreeSet<KeyframeId> = BTreeSet::new();
        for &edge in &edge_list {
            let edge = state.edge(edge).expect("validated above");
            kfs.insert(edge.from);
            kfs.insert(edge.to);
        }
        kfs.len()
    };
    result.num_total_scalars_optimized =
        edge_list.len() * M::Pose::dof() + lm_list.len() * model.landmark_dims();

    if edge_list.is_empty() && lm_list.is_empty() {
        return Ok(result);
    }

    let active = build_active_observations(state, cache, &edge_list, &lm_list, candidate_obs);
    result.num_observations = active.len();
    if active.is_empty() {
        return Ok(result);
    }

    let kernel = if use_robust_kernel {
        RobustKernel::PseudoHuber
    } else {
        RobustKernel::None
    };
    let obs_scalars = (active.len() * model.obs_dims()) as f64;
    let rmse_of = |raw_sq: f64| (raw_sq / obs_scalars).sqrt();
    let tree_updates_before = cache.numeric_updates();

    let mut res = compute_residuals(state, cache, model, &active, kernel, params.kernel_param);
    result.total_sqr_error_init = res.raw_sq;
    result.total_sqr_error_final = res.raw_sq;
    result.obs_rmse = rmse_of(res.raw_sq);
    result.termination = TerminationReason::MaxIterations;

    let mut lins = linearize_all(state, model, &active, params.numeric_jacobians);
    result.num_jacobians += lins.iter().map(ObsLinearization::num_blocks).sum::<usize>();
    let mut eq = build_normal_equations(model, &edge_list, &lm_list, &active, &lins, &res);

    let mut lambda = (1e-3 * eq.diagonal_scale()).max(MIN_LAMBDA);
    let mut nu = 2.0;

    debug!(
        "optimize_edges: {} edges, {} landmarks, {} observations, initial error {:.6e}",
        edge_list.len(),
        lm_list.len(),
        active.len(),
        res.raw_sq
    );

    for iter in 0..params.max_iters {
        result.iterations = iter as u32 + 1;

        let solution = match eq.solve_damped(lambda) {
            Some(solution) => solution,
            None => {
                observer.on_iteration(result.iterations, res.raw_sq, rmse_of(res.raw_sq), false);
                lambda *= nu;
                nu *= 2.0;
                if lambda > params.max_lambda {
                    result.termination = TerminationReason::SolveFailed;
                    break;
                }
                continue;
            }
        };

        let predicted = eq.predicted_decrease(&solution, lambda);
        let snapshot = take_snapshot(state, &edge_list, &lm_list);
        apply_step(state, cache, &edge_list, &lm_list, &solution);
        let candidate = compute_residuals(state, cache, model, &active, kernel, params.kernel_param);

        let decrease = res.weighted_sq - candidate.weighted_sq;
        let rho = decrease / predicted.max(f64::MIN_POSITIVE);
        trace!(
            "iter {}: lambda {:.3e}, rho {:.3}, error {:.6e} -> {:.6e}",
            result.iterations,
            lambda,
            rho,
            res.weighted_sq,
            candidate.weighted_sq
        );

        if rho.is_finite() && rho > 0.0 {
            let previous_weighted = res.weighted_sq;
            res = candidate;
            observer.on_iteration(result.iterations, res.raw_sq, rmse_of(res.raw_sq), true);

            let rho_eff = rho.min(params.max_rho);
            let factor = (1.0 - (2.0 * rho_eff - 1.0).powi(3)).max(1.0 / 3.0);
            lambda = (lambda * factor).max(MIN_LAMBDA);
            nu = 2.0;

            if decrease / (active.len() as f64) < params.max_error_per_obs_to_stop {
                result.termination = TerminationReason::Converged;
                break;
            }

            if decrease / previous_weighted.max(f64::MIN_POSITIVE)
                >= params.min_error_reduction_ratio_to_relinearize
            {
                lins = linearize_all(state, model, &active, params.numeric_jacobians);
                result.num_jacobians +=
                    lins.iter().map(ObsLinearization::num_blocks).sum::<usize>();
            }
            eq = build_normal_equations(model, &edge_list, &lm_list, &active, &lins, &res);
        } else {
            restore_snapshot(state, cache, &edge_list, &lm_list, snapshot);
            observer.on_iteration(result.iterations, res.raw_sq, rmse_of(res.raw_sq), false);

            // The linear model already promises less than the stop
            // threshold, and raising λ only shrinks the step further.
            if predicted / (active.len() as f64) < params.max_error_per_obs_to_stop {
                result.termination = TerminationReason::Converged;
                break;
            }

            lambda *= nu;
            nu *= 2.0;
            if lambda > params.max_lambda {
                result.termination = TerminationReason::Diverged;
                break;
            }
        }
    }

    result.total_sqr_error_final = res.raw_sq;
    result.obs_rmse = rmse_of(res.raw_sq);
    result.num_span_tree_numeric_updates = cache.numeric_updates() - tree_updates_before;
    if params.compute_condition_number {
        result.hap_condition_number = eq.condition_number();
    }
    if params.compute_sparsity_stats {
        result.sparsity = Some(eq.sparsity_stats(&lins));
    }

    debug!(
        "optimize_edges: {:?} after {} iterations, error {:.6e} -> {:.6e}",
        result.termination, result.iterations, result.total_sqr_error_init, result.total_sqr_error_final
    );
    Ok(result)
}

/// Resolve candidate observations into active rows with paths and columns.
///
/// An observation is active iff at least one unknown on its path (an edge
/// column or its landmark) is selected.
fn build_active_observations<P: RelativePose>(
    state: &GraphState<P>,
    cache: &SpanningTreeCache<P>,
    edge_list: &[EdgeId],
    lm_list: &[LandmarkId],
    candidate_obs: &[usize],
) -> Vec<ActiveObs> {
    let edge_cols: std::collections::BTreeMap<EdgeId, usize> = edge_list
        .iter()
        .enumerate()
        .map(|(col, &edge)| (edge, col))
        .collect();
    let lm_cols: std::collections::BTreeMap<LandmarkId, usize> = lm_list
        .iter()
        .enumerate()
        .map(|(col, &lm)| (lm, col))
        .collect();

    let candidates: BTreeSet<usize> = candidate_obs.iter().copied().collect();
    let mut active = Vec::new();

    for obs_idx in candidates {
        let obs = match state.observations().get(obs_idx) {
            Some(obs) => obs,
            None => continue,
        };
        let (entry, known) = match state.landmark(obs.landmark_id) {
            Some(found) => found,
            None => continue,
        };
        let base = entry.base_kf;
        let lm_col = if known {
            None
        } else {
            lm_cols.get(&obs.landmark_id).copied()
        };

        let steps = match resolve_path(state, cache, obs.observer, base, &edge_cols) {
            Some(steps) => steps,
            None => continue,
        };

        let touches_unknown = lm_col.is_some() || steps.iter().any(|step| step.col.is_some());
        if !touches_unknown {
            continue;
        }

        active.push(ActiveObs {
            obs_idx,
            observer: obs.observer,
            base,
            landmark_id: obs.landmark_id,
            lm_col,
            steps,
        });
    }

    active
}

/// Path from observer to base: the spanning-tree path when the base is
/// within tree depth, otherwise a full BFS (uncached fallback).
fn resolve_path<P: RelativePose>(
    state: &GraphState<P>,
    cache: &SpanningTreeCache<P>,
    observer: KeyframeId,
    base: KeyframeId,
    edge_cols: &std::collections::BTreeMap<EdgeId, usize>,
) -> Option<Vec<PathStep>> {
    let mut steps = Vec::new();
    if let Some(chain) = cache.tree_path(observer, base) {
        let mut prev = observer;
        for (edge_id, node) in chain {
            let edge = state.edge(edge_id)?;
            steps.push(PathStep {
                edge: edge_id,
                forward: edge.from == prev,
                col: edge_cols.get(&edge_id).copied(),
            });
            prev = node;
        }
        return Some(steps);
    }

    let nodes = find_path_bfs(state, observer, base)?;
    let mut prev = observer;
    for node in nodes {
        let edge_id = state
            .edges_of(prev)
            .iter()
            .copied()
            .find(|&edge_id| {
                let edge = &state.k2k_edges()[edge_id];
                edge.from == node || edge.to == node
            })?;
        let edge = &state.k2k_edges()[edge_id];
        steps.push(PathStep {
            edge: edge_id,
            forward: edge.from == prev,
            col: edge_cols.get(&edge_id).copied(),
        });
        prev = node;
    }
    Some(steps)
}

fn landmark_position<'a, P: RelativePose>(
    state: &'a GraphState<P>,
    landmark_id: LandmarkId,
) -> &'a DVector<f64> {
    &state
        .landmark(landmark_id)
        .expect("active observation of missing landmark")
        .0
        .position
}

fn compute_residuals<M: SensorModel>(
    state: &GraphState<M::Pose>,
    cache: &mut SpanningTreeCache<M::Pose>,
    model: &M,
    active: &[ActiveObs],
    kernel: RobustKernel,
    kernel_width: f64,
) -> ResidualSet {
    let mut raw_sq = 0.0;
    let mut weighted_sq = 0.0;
    let mut per_obs = Vec::with_capacity(active.len());

    for obs in active {
        // The cache serves the composed pose when the base is within tree
        // depth; distant bases recompose along the resolved path.
        let base_wrt_obs = cache
            .relative_pose(state, obs.observer, obs.base)
            .unwrap_or_else(|| jacobians::compose_along(state, &obs.steps));
        let position = landmark_position(state, obs.landmark_id);
        let point = base_wrt_obs.transform_point(position);
        let predicted = model.predict(&point);
        let measured = &state.observations()[obs.obs_idx].measurement;
        let residual = model.residual(measured, &predicted);

        let r_sq = residual.norm_squared();
        let weight = kernel.weight(r_sq, kernel_width);
        raw_sq += r_sq;
        weighted_sq += weight * r_sq;
        per_obs.push((residual, weight));
    }

    ResidualSet {
        raw_sq,
        weighted_sq,
        per_obs,
    }
}

fn linearize_all<M: SensorModel>(
    state: &GraphState<M::Pose>,
    model: &M,
    active: &[ActiveObs],
    numeric: bool,
) -> Vec<ObsLinearization> {
    active
        .iter()
        .map(|obs| {
            let position = landmark_position(state, obs.landmark_id).clone();
            if numeric {
                jacobians::linearize_numeric(model, state, obs, &position)
            } else {
                jacobians::linearize(model, state, obs, &position)
            }
        })
        .collect()
}

fn build_normal_equations<M: SensorModel>(
    model: &M,
    edge_list: &[EdgeId],
    lm_list: &[LandmarkId],
    active: &[ActiveObs],
    lins: &[ObsLinearization],
    res: &ResidualSet,
) -> NormalEquations {
    let mut eq = NormalEquations::new(
        edge_list.len(),
        lm_list.len(),
        M::Pose::dof(),
        model.landmark_dims(),
    );
    for ((obs, lin), (residual, weight)) in active.iter().zip(lins).zip(&res.per_obs) {
        eq.accumulate(lin, obs.lm_col, residual, *weight);
    }
    eq
}

fn take_snapshot<P: RelativePose>(
    state: &GraphState<P>,
    edge_list: &[EdgeId],
    lm_list: &[LandmarkId],
) -> Snapshot<P> {
    Snapshot {
        edge_poses: edge_list
            .iter()
            .map(|&edge| state.edge(edge).expect("validated edge").relative_pose)
            .collect(),
        lm_positions: lm_list
            .iter()
            .map(|&lm| {
                state
                    .landmark(lm)
                    .expect("validated landmark")
                    .0
                    .position
                    .clone()
            })
            .collect(),
    }
}

fn apply_step<P: RelativePose>(
    state: &mut GraphState<P>,
    cache: &mut SpanningTreeCache<P>,
    edge_list: &[EdgeId],
    lm_list: &[LandmarkId],
    solution: &super::hessian::StepSolution,
) {
    for (col, &edge_id) in edge_list.iter().enumerate() {
        let step = &solution.pose_steps[col];
        let edge = state.edge_mut(edge_id).expect("validated edge");
        edge.relative_pose = edge.relative_pose.retract(step.as_slice());
        cache.touch_edge(edge_id);
    }
    for (col, &lm) in lm_list.iter().enumerate() {
        let entry = state.unknown_landmark_mut(lm).expect("validated landmark");
        entry.position += &solution.lm_steps[col];
    }
}

fn restore_snapshot<P: RelativePose>(
    state: &mut GraphState<P>,
    cache: &mut SpanningTreeCache<P>,
    edge_list: &[EdgeId],
    lm_list: &[LandmarkId],
    snapshot: Snapshot<P>,
) {
    for (col, &edge_id) in edge_list.iter().enumerate() {
        let edge = state.edge_mut(edge_id).expect("validated edge");
        edge.relative_pose = snapshot.edge_poses[col];
        cache.touch_edge(edge_id);
    }
    for (col, &lm) in lm_list.iter().enumerate() {
        let entry = state.unknown_landmark_mut(lm).expect("validated landmark");
        entry.position = snapshot.lm_positions[col].clone();
    }
}
