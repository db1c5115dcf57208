//! Per-observation linearization.
//!
//! An observation of landmark `f` (anchored at base keyframe `b`) from
//! observer keyframe `o` predicts
//!
//! ```text
//! h = sensor( T_o←b · f ),    T_o←b = Π edge poses along the tree path o → b
//! ```
//!
//! Its derivative splits into one small dense block per k2k edge actually on
//! that path (`dh/dAp`, chain rule through the composed transform; every
//! other edge's block is exactly zero, which is what keeps the Jacobian
//! sparse) and one block for the landmark's relative position (`dh/df`,
//! absent for known-position landmarks).
//!
//! Both an analytical closed form and a central-difference numerical
//! fallback are provided; the choice is a solver parameter.

use nalgebra::{DMatrix, DVector};

use crate::core::pose::RelativePose;
use crate::core::sensor::SensorModel;
use crate::core::types::{EdgeId, KeyframeId, LandmarkId};
use crate::graph::state::GraphState;

/// Central-difference step for numerical Jacobians.
const NUMERIC_STEP: f64 = 1e-6;

/// One edge on the observer → base path of an observation.
#[derive(Debug, Clone)]
pub(crate) struct PathStep {
    /// Edge arena index.
    pub edge: EdgeId,
    /// True when the path traverses the edge from `from` to `to`.
    pub forward: bool,
    /// Column of this edge in the pose-unknown ordering; `None` when the
    /// edge is held fixed in the current solve.
    pub col: Option<usize>,
}

/// An observation selected into the optimization window, with its resolved
/// path and unknown columns.
#[derive(Debug, Clone)]
pub(crate) struct ActiveObs {
    /// Index into [`GraphState::observations`].
    pub obs_idx: usize,
    /// Observing keyframe.
    pub observer: KeyframeId,
    /// The landmark's base keyframe.
    pub base: KeyframeId,
    /// The observed landmark.
    pub landmark_id: LandmarkId,
    /// Column in the landmark-unknown ordering; `None` for known-position
    /// landmarks or landmarks held fixed in this solve.
    pub lm_col: Option<usize>,
    /// Edge path from observer to base. Empty when the observer is the base.
    pub steps: Vec<PathStep>,
}

/// Jacobian blocks of one observation: sparse row of `(column, block)`.
#[derive(Debug, Clone)]
pub(crate) struct ObsLinearization {
    /// `dh/dAp` blocks, keyed by pose-unknown column. `obs_dims × dof`.
    pub j_pose: Vec<(usize, DMatrix<f64>)>,
    /// `dh/df` block, `obs_dims × lm_dims`, when the landmark is unknown.
    pub j_lm: Option<DMatrix<f64>>,
}

impl ObsLinearization {
    /// Number of dense blocks in this row.
    pub fn num_blocks(&self) -> usize {
        self.j_pose.len() + usize::from(self.j_lm.is_some())
    }
}

/// The step transform `T_near←far` of one path step.
fn step_pose<P: RelativePose>(state: &GraphState<P>, step: &PathStep) -> P {
    let edge = &state.k2k_edges()[step.edge];
    if step.forward {
        edge.relative_pose
    } else {
        edge.relative_pose.inverse()
    }
}

/// Compose `T_observer←base` along a resolved path.
pub(crate) fn compose_along<P: RelativePose>(state: &GraphState<P>, steps: &[PathStep]) -> P {
    let mut pose = P::identity();
    for step in steps {
        pose = pose.compose(&step_pose(state, step));
    }
    pose
}

/// Predict the measurement of `position` (in the base frame) through a path,
/// optionally substituting one edge pose (used by the numerical fallback).
fn predict_through<M: SensorModel>(
    model: &M,
    state: &GraphState<M::Pose>,
    steps: &[PathStep],
    position: &DVector<f64>,
    substitute: Option<(usize, M::Pose)>,
) -> DVector<f64> {
    let mut point = position.clone();
    for (idx, step) in steps.iter().enumerate().rev() {
        let edge_pose = match substitute {
            Some((sub_idx, pose)) if sub_idx == idx => pose,
            _ => state.k2k_edges()[step.edge].relative_pose,
        };
        let t = if step.forward {
            edge_pose
        } else {
            edge_pose.inverse()
        };
        point = t.transform_point(&point);
    }
    model.predict(&point)
}

/// Analytical Jacobian blocks of one observation at the current unknowns.
pub(crate) fn linearize<M: SensorModel>(
    model: &M,
    state: &GraphState<M::Pose>,
    active: &ActiveObs,
    position: &DVector<f64>,
) -> ObsLinearization {
    let k = active.steps.len();

    // Landmark point expressed in every frame along the path:
    // points[i] = position in the frame of path node i (node 0 = observer).
    let mut points: Vec<DVector<f64>> = vec![DVector::zeros(0); k + 1];
    points[k] = position.clone();
    for i in (0..k).rev() {
        let t = step_pose(state, &active.steps[i]);
        points[i] = t.transform_point(&points[i + 1]);
    }

    // Prefix transforms: prefix[i] = T_observer←node_i.
    let mut prefix: Vec<M::Pose> = vec![M::Pose::identity(); k + 1];
    for i in 0..k {
        let t = step_pose(state, &active.steps[i]);
        prefix[i + 1] = prefix[i].compose(&t);
    }

    let j_sensor = model.jacobian_wrt_point(&points[0]);

    let mut j_pose = Vec::new();
    for (i, step) in active.steps.iter().enumerate() {
        let col = match step.col {
            Some(col) => col,
            None => continue,
        };
        // Right-perturbation of the edge pose. For a forward traversal the
        // increment acts on the point in the far frame; for a reverse
        // traversal it acts negated on the point in the near frame.
        let j_geo = if step.forward {
            prefix[i + 1].linear_part() * M::Pose::increment_jacobian(&points[i + 1])
        } else {
            -(prefix[i].linear_part() * M::Pose::increment_jacobian(&points[i]))
        };
        j_pose.push((col, &j_sensor * j_geo));
    }

    let j_lm = active
        .lm_col
        .map(|_| &j_sensor * prefix[k].linear_part());

    ObsLinearization { j_pose, j_lm }
}

/// Central-difference Jacobian blocks, used for validation or when an
/// analytical form is unavailable.
pub(crate) fn linearize_numeric<M: SensorModel>(
    model: &M,
    state: &GraphState<M::Pose>,
    active: &ActiveObs,
    position: &DVector<f64>,
) -> ObsLinearization {
    let obs_dims = model.obs_dims();
    let dof = M::Pose::dof();

    let mut j_pose = Vec::new();
    for (i, step) in active.steps.iter().enumerate() {
        let col = match step.col {
            Some(col) => col,
            None => continue,
        };
        let edge_pose = state.k2k_edges()[step.edge].relative_pose;
        let mut block = DMatrix::zeros(obs_dims, dof);
        for d in 0..dof {
            let mut delta = vec![0.0; dof];
            delta[d] = NUMERIC_STEP;
            let plus = predict_through(model, state, &active.steps, position, Some((i, edge_pose.retract(&delta))));
            delta[d] = -NUMERIC_STEP;
            let minus = predict_through(model, state, &active.steps, position, Some((i, edge_pose.retract(&delta))));
            for r in 0..obs_dims {
                block[(r, d)] = (plus[r] - minus[r]) / (2.0 * NUMERIC_STEP);
            }
        }
        j_pose.push((col, block));
    }

    let j_lm = active.lm_col.map(|_| {
        let lm_dims = position.len();
        let mut block = DMatrix::zeros(obs_dims, lm_dims);
        for d in 0..lm_dims {
            let mut plus_pos = position.clone();
            let mut minus_pos = position.clone();
            plus_pos[d] += NUMERIC_STEP;
            minus_pos[d] -= NUMERIC_STEP;
            let plus = predict_through(model, state, &active.steps, &plus_pos, None);
            let minus = predict_through(model, state, &active.steps, &minus_pos, None);
            for r in 0..obs_dims {
                block[(r, d)] = (plus[r] - minus[r]) / (2.0 * NUMERIC_STEP);
            }
        }
        block
    });

    ObsLinearization { j_pose, j_lm }
}
