//! Bounded breadth-first traversal over the k2k graph.
//!
//! One traversal primitive serves local-area selection, global error
//! evaluation, and map export: a FIFO BFS from a root keyframe, limited to a
//! maximum topological distance, with pluggable filter/visit hooks for
//! keyframes, landmarks, k2k edges, and k2f edges. Only k2k edges are
//! expanded through; k2f edges are leaf visits.
//!
//! Determinism: for a fixed graph and root, visiting order is fully
//! determined by edge creation order (the adjacency index preserves it).

use std::collections::VecDeque;

use crate::core::pose::RelativePose;
use crate::core::types::{KeyframeId, LandmarkId, TopoDist};
use crate::graph::state::{GraphState, Kf2KfEdge, Observation};

/// Filter/visit hooks for [`bfs_visit`].
///
/// `filter_*` decides whether the node/edge is entered; `visit_*` performs
/// the caller's side effect. Defaults: expand all keyframes and k2k edges,
/// skip landmark and k2f visits.
pub trait BfsVisitor<P: RelativePose> {
    /// Should traversal expand through this keyframe?
    fn filter_keyframe(&mut self, _kf: KeyframeId, _dist: TopoDist) -> bool {
        true
    }

    /// Called once per reached keyframe.
    fn visit_keyframe(&mut self, _kf: KeyframeId, _dist: TopoDist) {}

    /// Should this landmark be visited?
    fn filter_landmark(&mut self, _lm: LandmarkId, _dist: TopoDist) -> bool {
        false
    }

    /// Called for each landmark passing [`filter_landmark`](Self::filter_landmark).
    fn visit_landmark(&mut self, _lm: LandmarkId, _dist: TopoDist) {}

    /// Should this k2k edge be visited?
    fn filter_k2k_edge(&mut self, _edge: &Kf2KfEdge<P>, _dist: TopoDist) -> bool {
        true
    }

    /// Called for each k2k edge passing the filter, once.
    fn visit_k2k_edge(&mut self, _edge: &Kf2KfEdge<P>, _dist: TopoDist) {}

    /// Should this observation (k2f edge) be visited?
    fn filter_k2f_edge(&mut self, _obs_idx: usize, _obs: &Observation, _dist: TopoDist) -> bool {
        false
    }

    /// Called for each observation passing the filter.
    fn visit_k2f_edge(&mut self, _obs_idx: usize, _obs: &Observation, _dist: TopoDist) {}
}

/// Breadth-first visit of all keyframes within `max_depth` of `root`.
///
/// Keyframes are visited in FIFO order. At each keyframe its k2f edges are
/// offered as leaves, then its k2k edges are offered and expanded. An edge
/// is visited at most once, at the distance of the first keyframe that
/// reaches it.
pub fn bfs_visit<P: RelativePose, V: BfsVisitor<P>>(
    state: &GraphState<P>,
    root: KeyframeId,
    max_depth: TopoDist,
    visitor: &mut V,
) {
    if !state.has_keyframe(root) {
        return;
    }

    let num_kfs = state.num_keyframes() as usize;
    let mut kf_seen = vec![false; num_kfs];
    let mut edge_seen = vec![false; state.k2k_edges().len()];
    let mut queue: VecDeque<(KeyframeId, TopoDist)> = VecDeque::new();

    kf_seen[root as usize] = true;
    queue.push_back((root, 0));

    while let Some((kf, dist)) = queue.pop_front() {
        visitor.visit_keyframe(kf, dist);

        // k2f edges are leaves: offered, never expanded through.
        for &obs_idx in state.observations_of(kf) {
            let obs = &state.observations()[obs_idx];
            if visitor.filter_k2f_edge(obs_idx, obs, dist) {
                visitor.visit_k2f_edge(obs_idx, obs, dist);
            }
            if visitor.filter_landmark(obs.landmark_id, dist) {
                visitor.visit_landmark(obs.landmark_id, dist);
            }
        }

        for &edge_id in state.edges_of(kf) {
            let edge = &state.k2k_edges()[edge_id];
            if !edge_seen[edge_id] {
                edge_seen[edge_id] = true;
                if visitor.filter_k2k_edge(edge, dist) {
                    visitor.visit_k2k_edge(edge, dist);
                }
            }

            if dist + 1 > max_depth {
                continue;
            }
            let neighbor = if edge.from == kf { edge.to } else { edge.from };
            if !kf_seen[neighbor as usize] && visitor.filter_keyframe(neighbor, dist + 1) {
                kf_seen[neighbor as usize] = true;
                queue.push_back((neighbor, dist + 1));
            }
        }
    }
}

/// Unconstrained BFS shortest path between two keyframes.
///
/// Edge direction is ignored. Returns the keyframe sequence after `src` up
/// to and including `dst`; an empty path when `src == dst`; `None` only when
/// the two keyframes lie in different connected components. O(V+E).
pub fn find_path_bfs<P: RelativePose>(
    state: &GraphState<P>,
    src: KeyframeId,
    dst: KeyframeId,
) -> Option<Vec<KeyframeId>> {
    if !state.has_keyframe(src) || !state.has_keyframe(dst) {
        return None;
    }
    if src == dst {
        return Some(Vec::new());
    }

    let num_kfs = state.num_keyframes() as usize;
    let mut predecessor: Vec<Option<KeyframeId>> = vec![None; num_kfs];
    let mut seen = vec![false; num_kfs];
    let mut queue: VecDeque<KeyframeId> = VecDeque::new();

    seen[src as usize] = true;
    queue.push_back(src);

    while let Some(kf) = queue.pop_front() {
        for &edge_id in state.edges_of(kf) {
            let edge = &state.k2k_edges()[edge_id];
            let neighbor = if edge.from == kf { edge.to } else { edge.from };
            if seen[neighbor as usize] {
                continue;
            }
            seen[neighbor as usize] = true;
            predecessor[neighbor as usize] = Some(kf);
            if neighbor == dst {
                let mut path = vec![dst];
                let mut cursor = kf;
                while cursor != src {
                    path.push(cursor);
                    cursor = predecessor[cursor as usize].expect("predecessor chain broken");
                }
                path.reverse();
                return Some(path);
            }
            queue.push_back(neighbor);
        }
    }

    None
}
