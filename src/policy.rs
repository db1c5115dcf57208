//! Edge-creation policy: which k2k edges a new keyframe needs.
//!
//! The engine treats this as an injected strategy with a narrow contract:
//! given the new keyframe and its observations, return the edges to create
//! with optional initial pose estimates. [`LocalAreasFixedSize`] implements
//! the fixed-size submap scheme: every keyframe links to its local area
//! center, and areas sharing enough observations with distant areas get a
//! loop-closure edge between their centers.

use std::collections::BTreeMap;

use log::debug;

use crate::core::pose::RelativePose;
use crate::core::types::{KeyframeId, NewObservation, TopoDist};
use crate::graph::spanning_tree::SpanningTreeCache;
use crate::graph::state::GraphState;

/// One edge a policy wants created for a new keyframe.
#[derive(Debug, Clone)]
pub struct ProposedEdge<P> {
    /// Source keyframe (must exist).
    pub from: KeyframeId,
    /// Target keyframe.
    pub to: KeyframeId,
    /// Initial estimate of the pose of `to` in `from`; identity when absent.
    pub initial_pose: Option<P>,
}

/// Strategy deciding the k2k edges for each new keyframe.
pub trait EdgeCreationPolicy<P: RelativePose> {
    /// Called once per new keyframe, before its observations are recorded.
    /// Never called for the very first keyframe (there is nothing to link).
    fn propose_edges(
        &mut self,
        new_kf: KeyframeId,
        observations: &[NewObservation],
        state: &GraphState<P>,
        tree: &SpanningTreeCache<P>,
    ) -> Vec<ProposedEdge<P>>;
}

/// Fixed-size submap policy.
///
/// Keyframes partition into areas of `submap_size` consecutive ids; the area
/// center is the lowest id in the area. Every non-center keyframe links to
/// its center. When the new keyframe's observations share at least
/// `min_obs_to_loop_closure` landmarks with a remote area that is
/// topologically distant, an edge between the two centers closes the loop.
#[derive(Debug, Clone)]
pub struct LocalAreasFixedSize {
    /// Number of keyframes per local area.
    pub submap_size: u64,
    /// Minimum shared observations before a loop-closure edge is created.
    pub min_obs_to_loop_closure: usize,
}

impl Default for LocalAreasFixedSize {
    fn default() -> Self {
        Self {
            submap_size: 15,
            min_obs_to_loop_closure: 4,
        }
    }
}

impl LocalAreasFixedSize {
    fn area_center(&self, kf: KeyframeId) -> KeyframeId {
        self.submap_size * (kf / self.submap_size)
    }
}

impl<P: RelativePose> EdgeCreationPolicy<P> for LocalAreasFixedSize {
    fn propose_edges(
        &mut self,
        new_kf: KeyframeId,
        observations: &[NewObservation],
        state: &GraphState<P>,
        tree: &SpanningTreeCache<P>,
    ) -> Vec<ProposedEdge<P>> {
        let current_center = self.area_center(new_kf);
        let mut proposals = Vec::new();

        // Regular keyframes always link to their area center. A keyframe
        // that *is* a center links through loop-closure edges below.
        if current_center != new_kf {
            proposals.push(ProposedEdge {
                from: current_center,
                to: new_kf,
                initial_pose: None,
            });
        }

        // Shared observations per base keyframe, then per area center.
        let mut obs_per_base: BTreeMap<KeyframeId, usize> = BTreeMap::new();
        for obs in observations {
            if let Some((entry, _)) = state.landmark(obs.landmark_id) {
                *obs_per_base.entry(entry.base_kf).or_default() += 1;
            }
        }
        let mut obs_per_area: BTreeMap<KeyframeId, usize> = BTreeMap::new();
        for (base, count) in obs_per_base {
            *obs_per_area.entry(self.area_center(base)).or_default() += count;
        }

        // Candidate areas by descending vote count, id as tie-break.
        let mut areas: Vec<(KeyframeId, usize)> = obs_per_area.into_iter().collect();
        areas.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        // An area counts as distant when even the spanning trees cannot see
        // it from here (beyond maintained depth minus the two center hops).
        let min_dist_for_loop_closure: TopoDist = tree.max_depth() + 1;

        for (remote_center, votes) in areas {
            if remote_center == current_center {
                continue;
            }
            let distance = tree
                .topological_distance(current_center, remote_center)
                .unwrap_or(TopoDist::MAX);
            if distance < min_dist_for_loop_closure.saturating_sub(2) {
                continue;
            }
            if votes < self.min_obs_to_loop_closure {
                debug!(
                    "skipping loop closure {} -> {} with only {} shared obs",
                    remote_center, current_center, votes
                );
                continue;
            }
            // Fresh cached tree pose as initial guess when available.
            let initial_pose = tree.cached_pose(remote_center, current_center);
            debug!(
                "loop closure edge {} -> {} ({} shared obs)",
                remote_center, current_center, votes
            );
            proposals.push(ProposedEdge {
                from: remote_center,
                to: current_center,
                initial_pose,
            });
        }

        proposals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pose::Pose2D;
    use nalgebra::DVector;

    fn obs(id: u64) -> NewObservation {
        NewObservation::new(id, DVector::from_vec(vec![1.0, 0.0]))
    }

    #[test]
    fn test_second_keyframe_links_to_center() {
        let mut policy = LocalAreasFixedSize::default();
        let mut state: GraphState<Pose2D> = GraphState::new();
        let tree: SpanningTreeCache<Pose2D> = SpanningTreeCache::new(4);
        state.alloc_keyframe();
        state.alloc_keyframe();

        let proposals = policy.propose_edges(1, &[obs(0)], &state, &tree);
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].from, 0);
        assert_eq!(proposals[0].to, 1);
    }

    #[test]
    fn test_area_center_gets_no_self_link() {
        let mut policy = LocalAreasFixedSize {
            submap_size: 2,
            min_obs_to_loop_closure: 4,
        };
        let mut state: GraphState<Pose2D> = GraphState::new();
        let tree: SpanningTreeCache<Pose2D> = SpanningTreeCache::new(4);
        for _ in 0..3 {
            state.alloc_keyframe();
        }

        // Keyframe 2 starts a new area (center = 2): no center link, and no
        // loop closure without enough shared observations.
        let proposals = policy.propose_edges(2, &[], &state, &tree);
        assert!(proposals.is_empty());
    }

    #[test]
    fn test_loop_closure_on_shared_observations() {
        let mut policy = LocalAreasFixedSize {
            submap_size: 2,
            min_obs_to_loop_closure: 2,
        };
        let mut state: GraphState<Pose2D> = GraphState::new();
        let tree: SpanningTreeCache<Pose2D> = SpanningTreeCache::new(2);
        for _ in 0..5 {
            state.alloc_keyframe();
        }
        // Landmarks based in area 0 (keyframe 0).
        state
            .add_observation(0, 10, DVector::from_vec(vec![1.0, 0.0]), None, None)
            .unwrap();
        state
            .add_observation(0, 11, DVector::from_vec(vec![0.0, 1.0]), None, None)
            .unwrap();

        // Keyframe 4 (center of area 2, disconnected from area 0 in the
        // tree) re-observes both: loop closure to center 0.
        let proposals = policy.propose_edges(4, &[obs(10), obs(11)], &state, &tree);
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].from, 0);
        assert_eq!(proposals[0].to, 4);
    }
}
