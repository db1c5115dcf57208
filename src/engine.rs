//! The RBA engine: ingestion and local-area optimization orchestration.
//!
//! [`RbaEngine`] owns the graph state and the spanning-tree cache and drives
//! the flow for each new keyframe:
//!
//! ```text
//! define_new_keyframe(observations)
//!   → allocate keyframe
//!   → edge-creation policy proposes k2k edges → create, symbolic tree update
//!   → record observations (landmark classification)
//!   → optional: optimize new edges alone (stage 1)
//!   → optional: optimize local area around the new keyframe
//! ```
//!
//! One engine instance is single-threaded: all mutation and optimization
//! calls must be externally serialized. The read-only diagnostics
//! ([`eval_overall_squared_error`](RbaEngine::eval_overall_squared_error),
//! [`create_complete_spanning_tree`](RbaEngine::create_complete_spanning_tree),
//! [`find_path_bfs`](RbaEngine::find_path_bfs)) take `&self`, never touch the
//! incremental caches, and accept caller-owned scratch where one is needed,
//! so concurrent diagnostic readers are safe as long as nothing mutates.

use std::collections::BTreeMap;

use log::{debug, warn};

use crate::config::{OptimizeLocalAreaParams, RbaParams};
use crate::core::pose::RelativePose;
use crate::core::sensor::SensorModel;
use crate::core::types::{EdgeId, KeyframeId, LandmarkId, NewObservation, TopoDist};
use crate::error::{RbaError, Result};
use crate::graph::bfs::{bfs_visit, find_path_bfs, BfsVisitor};
use crate::graph::spanning_tree::{
    create_complete_spanning_tree, SpanTreeNode, SpanningTreeCache,
};
use crate::graph::state::{GraphState, Kf2KfEdge, Observation};
use crate::optimizer::solver::{self, IterationObserver, NullObserver, OptimizationResult};
use crate::policy::{EdgeCreationPolicy, LocalAreasFixedSize};

/// Information returned by [`RbaEngine::define_new_keyframe`].
#[derive(Debug, Clone)]
pub struct NewKeyframeInfo {
    /// Id of the newly created keyframe.
    pub kf_id: KeyframeId,
    /// Ids of the k2k edges created for it.
    pub created_edge_ids: Vec<EdgeId>,
    /// Results of the local-area optimization, when it ran.
    pub optimize_results: Option<OptimizationResult>,
    /// Results of the new-edges-alone pass, when it ran.
    pub optimize_results_stage1: Option<OptimizationResult>,
}

/// Incremental relative-bundle-adjustment engine.
///
/// Generic over the sensor model capability `M` (which fixes the pose
/// algebra through `M::Pose`) and the edge-creation policy `C`.
pub struct RbaEngine<M: SensorModel, C = LocalAreasFixedSize>
where
    C: EdgeCreationPolicy<M::Pose>,
{
    params: RbaParams,
    model: M,
    policy: C,
    state: GraphState<M::Pose>,
    tree: SpanningTreeCache<M::Pose>,
    observer: Box<dyn IterationObserver>,
}

impl<M: SensorModel, C: EdgeCreationPolicy<M::Pose> + Default> RbaEngine<M, C> {
    /// Create an engine with a default-constructed edge-creation policy.
    pub fn new(model: M, params: RbaParams) -> Self {
        Self::with_policy(model, params, C::default())
    }
}

impl<M: SensorModel, C: EdgeCreationPolicy<M::Pose>> RbaEngine<M, C> {
    /// Create an engine with an explicit edge-creation policy.
    pub fn with_policy(model: M, params: RbaParams, policy: C) -> Self {
        let tree = SpanningTreeCache::new(params.max_tree_depth);
        Self {
            params,
            model,
            policy,
            state: GraphState::new(),
            tree,
            observer: Box::new(NullObserver),
        }
    }

    /// Install an observer invoked once per LM iteration.
    pub fn set_iteration_observer(&mut self, observer: Box<dyn IterationObserver>) {
        self.observer = observer;
    }

    /// Engine parameters.
    pub fn params(&self) -> &RbaParams {
        &self.params
    }

    /// Mutable engine parameters. The spanning-tree depth is fixed at
    /// construction; changing `max_tree_depth` here has no effect.
    pub fn params_mut(&mut self) -> &mut RbaParams {
        &mut self.params
    }

    /// The sensor model.
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Read-only access to the graph (keyframes, edges, landmarks,
    /// observations), sufficient for external renderers and exporters.
    pub fn graph(&self) -> &GraphState<M::Pose> {
        &self.state
    }

    /// Read-only access to the incremental spanning-tree cache.
    pub fn tree_cache(&self) -> &SpanningTreeCache<M::Pose> {
        &self.tree
    }

    /// Append a new keyframe: create its edges per the policy, record its
    /// observations, and (unless suppressed) optimize the local area.
    ///
    /// The very first keyframe creates no edges and skips optimization:
    /// with a single node there is nothing to solve.
    pub fn define_new_keyframe(
        &mut self,
        observations: &[NewObservation],
        run_local_optimization: bool,
    ) -> Result<NewKeyframeInfo> {
        // Validate the batch before mutating anything.
        for obs in observations {
            self.check_observation_dims(obs)?;
        }

        let kf_id = self.state.alloc_keyframe();
        let mut created_edge_ids = Vec::new();

        if kf_id > 0 {
            let proposals = self
                .policy
                .propose_edges(kf_id, observations, &self.state, &self.tree);
            if proposals.is_empty() {
                warn!("keyframe {} created without any k2k edge", kf_id);
            }
            for proposal in proposals {
                let pose = proposal
                    .initial_pose
                    .unwrap_or_else(<M::Pose as RelativePose>::identity);
                let edge_id = self
                    .state
                    .create_k2k_edge(proposal.from, proposal.to, pose)?;
                self.tree.update_symbolic_new_edge(&self.state, edge_id);
                created_edge_ids.push(edge_id);
            }
        }

        for obs in observations {
            self.state.add_observation(
                kf_id,
                obs.landmark_id,
                obs.measurement.clone(),
                obs.fixed_position.clone(),
                obs.initial_position.clone(),
            )?;
        }
        debug!(
            "keyframe {}: {} edges, {} observations",
            kf_id,
            created_edge_ids.len(),
            observations.len()
        );

        let mut info = NewKeyframeInfo {
            kf_id,
            created_edge_ids,
            optimize_results: None,
            optimize_results_stage1: None,
        };

        if run_local_optimization && !info.created_edge_ids.is_empty() {
            if self.params.optimize_new_edges_alone {
                info.optimize_results_stage1 = Some(self.optimize_new_edges_alone(&info)?);
            }
            let depth = self.params.max_optimize_depth;
            info.optimize_results = Some(self.optimize_local_area(
                kf_id,
                depth,
                &OptimizeLocalAreaParams::default(),
            )?);
        }

        Ok(info)
    }

    /// Cheap first pass: solve only the newly created edges against the
    /// observations of the keyframes they touch.
    fn optimize_new_edges_alone(&mut self, info: &NewKeyframeInfo) -> Result<OptimizationResult> {
        let mut candidate_obs: Vec<usize> = Vec::new();
        let mut kfs: Vec<KeyframeId> = vec![info.kf_id];
        for &edge_id in &info.created_edge_ids {
            let edge = self.state.edge(edge_id).expect("edge just created");
            for endpoint in [edge.from, edge.to] {
                if !kfs.contains(&endpoint) {
                    kfs.push(endpoint);
                }
            }
        }
        for kf in kfs {
            candidate_obs.extend_from_slice(self.state.observations_of(kf));
        }

        solver::optimize_edges(
            &mut self.state,
            &mut self.tree,
            &self.model,
            &self.params,
            &info.created_edge_ids,
            &[],
            &candidate_obs,
            self.params.use_robust_kernel_stage1,
            &mut *self.observer,
        )
    }

    /// Record an observation from an existing keyframe without triggering
    /// any optimization.
    pub fn add_observation(
        &mut self,
        observer_kf: KeyframeId,
        obs: &NewObservation,
    ) -> Result<usize> {
        self.check_observation_dims(obs)?;
        self.state.add_observation(
            observer_kf,
            obs.landmark_id,
            obs.measurement.clone(),
            obs.fixed_position.clone(),
            obs.initial_position.clone(),
        )
    }

    fn check_observation_dims(&self, obs: &NewObservation) -> Result<()> {
        if obs.measurement.len() != self.model.obs_dims() {
            return Err(RbaError::DimensionMismatch {
                expected: self.model.obs_dims(),
                got: obs.measurement.len(),
            });
        }
        for position in obs.fixed_position.iter().chain(obs.initial_position.iter()) {
            if position.len() != self.model.landmark_dims() {
                return Err(RbaError::DimensionMismatch {
                    expected: self.model.landmark_dims(),
                    got: position.len(),
                });
            }
        }
        Ok(())
    }

    /// Optimize all unknowns within `win_size` k2k hops of `root`.
    pub fn optimize_local_area(
        &mut self,
        root: KeyframeId,
        win_size: TopoDist,
        area_params: &OptimizeLocalAreaParams,
    ) -> Result<OptimizationResult> {
        if !self.state.has_keyframe(root) {
            return Err(RbaError::UnknownKeyframe(root));
        }

        let mut visitor = LocalAreaVisitor {
            params: area_params,
            k2k_edges: Vec::new(),
            obs_indices: Vec::new(),
            lm_ids: Vec::new(),
            lm_seen: BTreeMap::new(),
        };
        bfs_visit(&self.state, root, win_size, &mut visitor);

        solver::optimize_edges(
            &mut self.state,
            &mut self.tree,
            &self.model,
            &self.params,
            &visitor.k2k_edges,
            &visitor.lm_ids,
            &visitor.obs_indices,
            self.params.use_robust_kernel,
            &mut *self.observer,
        )
    }

    /// Optimize an explicit set of edge and landmark unknowns against the
    /// given observations (all observations touching the unknowns' keyframes
    /// when `candidate_obs` is empty). Every id must exist.
    pub fn optimize_edges(
        &mut self,
        edge_ids: &[EdgeId],
        landmark_ids: &[LandmarkId],
        candidate_obs: &[usize],
    ) -> Result<OptimizationResult> {
        let candidates: Vec<usize> = if candidate_obs.is_empty() {
            let mut kfs: Vec<KeyframeId> = Vec::new();
            for &edge_id in edge_ids {
                let edge = self
                    .state
                    .edge(edge_id)
                    .ok_or(RbaError::UnknownEdge(edge_id))?;
                for endpoint in [edge.from, edge.to] {
                    if !kfs.contains(&endpoint) {
                        kfs.push(endpoint);
                    }
                }
            }
            for &lm in landmark_ids {
                for &observer in self.state.observers_of(lm) {
                    if !kfs.contains(&observer) {
                        kfs.push(observer);
                    }
                }
            }
            kfs.iter()
                .flat_map(|&kf| self.state.observations_of(kf).iter().copied())
                .collect()
        } else {
            candidate_obs.to_vec()
        };

        solver::optimize_edges(
            &mut self.state,
            &mut self.tree,
            &self.model,
            &self.params,
            edge_ids,
            landmark_ids,
            &candidates,
            self.params.use_robust_kernel,
            &mut *self.observer,
        )
    }

    /// Sum of squared raw residuals over all observations.
    ///
    /// Builds complete (uncached) spanning trees to resolve every
    /// observer/base pose, which may be very long paths in graphs without
    /// loop closures: worst case O(M·log N + N² + N·E).
    pub fn eval_overall_squared_error(&self) -> f64 {
        let mut trees: BTreeMap<KeyframeId, BTreeMap<KeyframeId, SpanTreeNode<M::Pose>>> =
            BTreeMap::new();
        let mut workspace: Vec<bool> = Vec::new();
        let mut total = 0.0;

        for obs in self.state.observations() {
            let (entry, _) = match self.state.landmark(obs.landmark_id) {
                Some(found) => found,
                None => continue,
            };
            let tree = trees.entry(obs.observer).or_insert_with(|| {
                create_complete_spanning_tree(
                    &self.state,
                    obs.observer,
                    TopoDist::MAX,
                    Some(&mut workspace),
                )
            });
            let base_wrt_obs = match tree.get(&entry.base_kf) {
                Some(node) => node.pose,
                None => continue,
            };
            let point = base_wrt_obs.transform_point(&entry.position);
            let predicted = self.model.predict(&point);
            let residual = self.model.residual(&obs.measurement, &predicted);
            total += residual.norm_squared();
        }

        total
    }

    /// Build a spanning tree rooted at `root` from scratch, bypassing the
    /// incremental cache. `workspace` is an optional caller-owned scratch
    /// buffer for concurrent diagnostic callers.
    pub fn create_complete_spanning_tree(
        &self,
        root: KeyframeId,
        max_depth: TopoDist,
        workspace: Option<&mut Vec<bool>>,
    ) -> BTreeMap<KeyframeId, SpanTreeNode<M::Pose>> {
        create_complete_spanning_tree(&self.state, root, max_depth, workspace)
    }

    /// Unconstrained, direction-ignoring shortest path between keyframes.
    /// `None` only when the two lie in different connected components.
    pub fn find_path_bfs(&self, src: KeyframeId, dst: KeyframeId) -> Option<Vec<KeyframeId>> {
        find_path_bfs(&self.state, src, dst)
    }
}

/// BFS visitor selecting the unknowns of a local-area optimization:
/// every k2k edge in the window, and every unknown landmark whose in-window
/// observation count reaches the threshold.
struct LocalAreaVisitor<'a> {
    params: &'a OptimizeLocalAreaParams,
    k2k_edges: Vec<EdgeId>,
    obs_indices: Vec<usize>,
    lm_ids: Vec<LandmarkId>,
    lm_seen: BTreeMap<LandmarkId, usize>,
}

impl<'a, P: RelativePose> BfsVisitor<P> for LocalAreaVisitor<'a> {
    fn filter_keyframe(&mut self, kf: KeyframeId, _dist: TopoDist) -> bool {
        kf <= self.params.max_visitable_kf_id
    }

    fn visit_k2k_edge(&mut self, edge: &Kf2KfEdge<P>, _dist: TopoDist) {
        if self.params.optimize_k2k_edges {
            self.k2k_edges.push(edge.id);
        }
    }

    fn filter_k2f_edge(&mut self, _obs_idx: usize, _obs: &Observation, _dist: TopoDist) -> bool {
        true
    }

    fn visit_k2f_edge(&mut self, obs_idx: usize, obs: &Observation, _dist: TopoDist) {
        self.obs_indices.push(obs_idx);
        if self.params.optimize_landmarks && !obs.known_position {
            let count = self.lm_seen.entry(obs.landmark_id).or_insert(0);
            *count += 1;
            // `==` adds each landmark exactly once, at the observation that
            // reaches the threshold.
            if *count == self.params.dont_optimize_landmarks_seen_less_than_n_times {
                self.lm_ids.push(obs.landmark_id);
            }
        }
    }
}
