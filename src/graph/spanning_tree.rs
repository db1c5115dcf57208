//! Depth-bounded spanning-tree cache.
//!
//! For every keyframe that has ever been reached, the cache maintains a tree
//! of the keyframes within `max_depth` k2k hops, split into two layers:
//!
//! - **symbolic**: topology only — which keyframe is reachable, through which
//!   predecessor/edge, at what distance. Updated incrementally whenever an
//!   edge is added (frontier relaxation, never a full rebuild).
//! - **numeric**: the composed relative pose along the tree path. Filled
//!   lazily on first access and invalidated in O(1) when an edge value
//!   changes (stale entries are recomputed on the next read, not eagerly).
//!
//! The cache is derived state: everything here is recomputable from
//! [`GraphState`] alone, and [`create_complete_spanning_tree`] does exactly
//! that for diagnostics that must not trust the incremental layers.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::core::pose::RelativePose;
use crate::core::types::{EdgeId, KeyframeId, TopoDist};
use crate::graph::state::GraphState;

/// Symbolic tree entry: how `target` is reached from the tree's root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    /// Previous keyframe on the path back to the root.
    pub predecessor: KeyframeId,
    /// The edge connecting `predecessor` to the target.
    pub edge: EdgeId,
    /// Topological distance from the root.
    pub distance: TopoDist,
}

/// One node of a fully materialized spanning tree.
#[derive(Debug, Clone)]
pub struct SpanTreeNode<P> {
    /// Pose of this keyframe expressed in the root's frame.
    pub pose: P,
    /// Topological distance from the root.
    pub distance: TopoDist,
    /// Previous keyframe on the path back to the root (`None` for the root).
    pub predecessor: Option<KeyframeId>,
}

#[derive(Debug, Clone)]
struct NumericEntry<P> {
    pose: P,
    path_edges: Vec<EdgeId>,
    stamp: u64,
}

/// Incremental cache of depth-bounded spanning trees, one per root keyframe.
#[derive(Debug)]
pub struct SpanningTreeCache<P> {
    max_depth: TopoDist,
    sym: BTreeMap<KeyframeId, BTreeMap<KeyframeId, TreeEntry>>,
    num: BTreeMap<KeyframeId, BTreeMap<KeyframeId, NumericEntry<P>>>,
    /// Last write stamp per edge; a cached pose is fresh iff its own stamp
    /// is at least as new as every edge on its path.
    edge_stamps: Vec<u64>,
    clock: u64,
    numeric_updates: u64,
}

impl<P: RelativePose> SpanningTreeCache<P> {
    /// Create an empty cache with the given maximum tree depth.
    pub fn new(max_depth: TopoDist) -> Self {
        Self {
            max_depth,
            sym: BTreeMap::new(),
            num: BTreeMap::new(),
            edge_stamps: Vec::new(),
            clock: 0,
            numeric_updates: 0,
        }
    }

    /// Maximum maintained tree depth.
    pub fn max_depth(&self) -> TopoDist {
        self.max_depth
    }

    /// Total number of numeric (pose composition) updates performed so far.
    pub fn numeric_updates(&self) -> u64 {
        self.numeric_updates
    }

    /// Symbolic tree rooted at `root`, if any edge ever reached it.
    pub fn tree(&self, root: KeyframeId) -> Option<&BTreeMap<KeyframeId, TreeEntry>> {
        self.sym.get(&root)
    }

    /// Topological distance between two keyframes, if within tree depth.
    pub fn topological_distance(&self, root: KeyframeId, target: KeyframeId) -> Option<TopoDist> {
        if root == target {
            return Some(0);
        }
        self.sym
            .get(&root)?
            .get(&target)
            .map(|entry| entry.distance)
    }

    /// Mark an edge value as changed. O(1): all cached poses whose path runs
    /// through the edge become stale and will be recomposed on next access.
    pub fn touch_edge(&mut self, edge: EdgeId) {
        self.clock += 1;
        if edge < self.edge_stamps.len() {
            self.edge_stamps[edge] = self.clock;
        }
    }

    /// Symbolic update for a newly created edge.
    ///
    /// Extends every tree whose root can now reach more keyframes within
    /// `max_depth` through the new edge. A frontier relaxation bounded by
    /// depth × edges touched, not a rebuild.
    pub fn update_symbolic_new_edge(&mut self, state: &GraphState<P>, edge_id: EdgeId) {
        if edge_id >= self.edge_stamps.len() {
            self.edge_stamps.resize(edge_id + 1, 0);
        }
        let edge = match state.edge(edge_id) {
            Some(edge) => edge,
            None => return,
        };
        let (a, b) = (edge.from, edge.to);

        // Every root already reaching either endpoint may be extendable,
        // plus the endpoints themselves (their own trees).
        let mut roots: Vec<KeyframeId> = self
            .sym
            .iter()
            .filter(|(root, tree)| {
                tree.contains_key(&a) || tree.contains_key(&b) || **root == a || **root == b
            })
            .map(|(root, _)| *root)
            .collect();
        for endpoint in [a, b] {
            if !roots.contains(&endpoint) {
                roots.push(endpoint);
            }
        }

        for root in roots {
            self.relax_root(state, root);
        }
    }

    /// Label-correcting relaxation of one root's tree through the current
    /// adjacency, bounded by `max_depth`. Existing entries only improve;
    /// an entry with an unchanged distance keeps its predecessor.
    fn relax_root(&mut self, state: &GraphState<P>, root: KeyframeId) {
        let tree = self.sym.entry(root).or_default();
        let num_tree = self.num.entry(root).or_default();

        let dist_of = |tree: &BTreeMap<KeyframeId, TreeEntry>, kf: KeyframeId| -> TopoDist {
            if kf == root {
                0
            } else {
                tree.get(&kf).map_or(TopoDist::MAX, |entry| entry.distance)
            }
        };

        // FIFO order makes first discovery the shortest: by the time a node
        // is popped, its entry already holds the final distance.
        let mut seen = vec![false; state.num_keyframes() as usize];
        let mut queue: VecDeque<KeyframeId> = VecDeque::new();
        seen[root as usize] = true;
        queue.push_back(root);

        while let Some(kf) = queue.pop_front() {
            let dist = dist_of(tree, kf);
            if dist >= self.max_depth {
                continue;
            }
            for &edge_id in state.edges_of(kf) {
                let edge = &state.k2k_edges()[edge_id];
                let neighbor = if edge.from == kf { edge.to } else { edge.from };
                if neighbor == root {
                    continue;
                }
                let candidate = dist + 1;
                if candidate < dist_of(tree, neighbor) {
                    tree.insert(
                        neighbor,
                        TreeEntry {
                            predecessor: kf,
                            edge: edge_id,
                            distance: candidate,
                        },
                    );
                    // The tree path changed; a cached pose along the old
                    // path is no longer the tree pose.
                    num_tree.remove(&neighbor);
                }
                if !seen[neighbor as usize] {
                    seen[neighbor as usize] = true;
                    queue.push_back(neighbor);
                }
            }
        }
    }

    /// Pose of `target` expressed in `root`'s frame, via the cached tree.
    ///
    /// Lazily composes (and caches) the pose along the symbolic tree path.
    /// Returns `None` when `target` is beyond `max_depth` of `root`.
    pub fn relative_pose(
        &mut self,
        state: &GraphState<P>,
        root: KeyframeId,
        target: KeyframeId,
    ) -> Option<P> {
        if root == target {
            return Some(P::identity());
        }

        if let Some(entry) = self.num.get(&root).and_then(|tree| tree.get(&target)) {
            let fresh = entry
                .path_edges
                .iter()
                .all(|&edge| self.edge_stamps[edge] <= entry.stamp);
            if fresh {
                return Some(entry.pose);
            }
        }

        // Recompose along the symbolic path.
        let sym_tree = self.sym.get(&root)?;
        let mut chain: Vec<(EdgeId, KeyframeId)> = Vec::new();
        let mut cursor = target;
        while cursor != root {
            let entry = sym_tree.get(&cursor)?;
            chain.push((entry.edge, cursor));
            cursor = entry.predecessor;
        }

        let mut pose = P::identity();
        let mut path_edges = Vec::with_capacity(chain.len());
        for &(edge_id, node) in chain.iter().rev() {
            let edge = state.edge(edge_id)?;
            let step = if edge.to == node {
                edge.relative_pose
            } else {
                edge.relative_pose.inverse()
            };
            pose = pose.compose(&step);
            path_edges.push(edge_id);
        }

        self.numeric_updates += 1;
        self.num.entry(root).or_default().insert(
            target,
            NumericEntry {
                pose,
                path_edges,
                stamp: self.clock,
            },
        );
        Some(pose)
    }

    /// Cached pose of `target` in `root`'s frame, only if numerically fresh.
    ///
    /// Never composes; intended for callers (like edge-creation policies)
    /// that want a cheap initial guess or nothing.
    pub fn cached_pose(&self, root: KeyframeId, target: KeyframeId) -> Option<P> {
        if root == target {
            return Some(P::identity());
        }
        let entry = self.num.get(&root)?.get(&target)?;
        let fresh = entry
            .path_edges
            .iter()
            .all(|&edge| self.edge_stamps[edge] <= entry.stamp);
        if fresh {
            Some(entry.pose)
        } else {
            None
        }
    }

    /// Edge path from `root` to `target` along the symbolic tree, ordered
    /// from the root side. Empty when `root == target`.
    pub fn tree_path(
        &self,
        root: KeyframeId,
        target: KeyframeId,
    ) -> Option<Vec<(EdgeId, KeyframeId)>> {
        if root == target {
            return Some(Vec::new());
        }
        let sym_tree = self.sym.get(&root)?;
        let mut chain: Vec<(EdgeId, KeyframeId)> = Vec::new();
        let mut cursor = target;
        while cursor != root {
            let entry = sym_tree.get(&cursor)?;
            chain.push((entry.edge, cursor));
            cursor = entry.predecessor;
        }
        chain.reverse();
        Some(chain)
    }
}

/// Build a spanning tree from scratch, bypassing the incremental cache.
///
/// Full BFS from `root` with on-the-fly pose composition, bounded by
/// `max_depth` (pass [`TopoDist::MAX`] for no bound). Used by diagnostics
/// (global error evaluation, export) where correctness matters more than
/// amortized cost. The root itself is included at distance 0.
///
/// `workspace` is an optional caller-owned scratch buffer so concurrent
/// read-only callers don't share internal state; when `None`, a private
/// buffer is allocated.
pub fn create_complete_spanning_tree<P: RelativePose>(
    state: &GraphState<P>,
    root: KeyframeId,
    max_depth: TopoDist,
    workspace: Option<&mut Vec<bool>>,
) -> BTreeMap<KeyframeId, SpanTreeNode<P>> {
    let mut tree = BTreeMap::new();
    if !state.has_keyframe(root) {
        return tree;
    }

    let num_kfs = state.num_keyframes() as usize;
    let mut local_ws;
    let seen: &mut Vec<bool> = match workspace {
        Some(ws) => {
            ws.clear();
            ws.resize(num_kfs, false);
            ws
        }
        None => {
            local_ws = vec![false; num_kfs];
            &mut local_ws
        }
    };

    let mut queue: VecDeque<KeyframeId> = VecDeque::new();
    seen[root as usize] = true;
    tree.insert(
        root,
        SpanTreeNode {
            pose: P::identity(),
            distance: 0,
            predecessor: None,
        },
    );
    queue.push_back(root);

    while let Some(kf) = queue.pop_front() {
        let (pose, dist) = {
            let node = &tree[&kf];
            (node.pose, node.distance)
        };
        if dist >= max_depth {
            continue;
        }
        for &edge_id in state.edges_of(kf) {
            let edge = &state.k2k_edges()[edge_id];
            let neighbor = if edge.from == kf { edge.to } else { edge.from };
            if seen[neighbor as usize] {
                continue;
            }
            seen[neighbor as usize] = true;
            let step = if edge.to == neighbor {
                edge.relative_pose
            } else {
                edge.relative_pose.inverse()
            };
            tree.insert(
                neighbor,
                SpanTreeNode {
                    pose: pose.compose(&step),
                    distance: dist + 1,
                    predecessor: Some(kf),
                },
            );
            queue.push_back(neighbor);
        }
    }

    tree
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pose::Pose2D;
    use approx::assert_relative_eq;

    /// Chain 0 - 1 - 2 - 3 with unit x steps.
    fn chain(n: u64, cache: &mut SpanningTreeCache<Pose2D>) -> GraphState<Pose2D> {
        let mut graph = GraphState::new();
        for _ in 0..n {
            graph.alloc_keyframe();
        }
        for i in 1..n {
            let id = graph
                .create_k2k_edge(i - 1, i, Pose2D::new(1.0, 0.0, 0.0))
                .unwrap();
            cache.update_symbolic_new_edge(&graph, id);
        }
        graph
    }

    #[test]
    fn test_symbolic_distances_match_full_bfs() {
        let mut cache = SpanningTreeCache::new(3);
        let mut graph = chain(5, &mut cache);

        // Add a loop closure 4 -> 0.
        let id = graph
            .create_k2k_edge(4, 0, Pose2D::new(-4.0, 0.0, 0.0))
            .unwrap();
        cache.update_symbolic_new_edge(&graph, id);

        for root in 0..5u64 {
            let full = create_complete_spanning_tree(&graph, root, 3, None);
            for target in 0..5u64 {
                let cached = cache.topological_distance(root, target);
                let reference = full.get(&target).map(|node| node.distance);
                assert_eq!(cached, reference, "root {} target {}", root, target);
            }
        }
    }

    #[test]
    fn test_depth_bound_excludes_far_nodes() {
        let mut cache = SpanningTreeCache::new(2);
        let graph = chain(5, &mut cache);
        assert_eq!(cache.topological_distance(0, 2), Some(2));
        assert_eq!(cache.topological_distance(0, 3), None);
        assert!(cache.relative_pose(&graph, 0, 3).is_none());
    }

    #[test]
    fn test_numeric_composition() {
        let mut cache = SpanningTreeCache::new(4);
        let graph = chain(4, &mut cache);

        let pose = cache.relative_pose(&graph, 0, 3).unwrap();
        assert_relative_eq!(pose.x, 3.0, epsilon = 1e-12);
        assert_relative_eq!(pose.y, 0.0, epsilon = 1e-12);

        // Reverse direction composes inverses.
        let back = cache.relative_pose(&graph, 3, 0).unwrap();
        assert_relative_eq!(back.x, -3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_lazy_invalidation_on_edge_touch() {
        let mut cache = SpanningTreeCache::new(4);
        let mut graph = chain(3, &mut cache);

        let before = cache.relative_pose(&graph, 0, 2).unwrap();
        assert_relative_eq!(before.x, 2.0, epsilon = 1e-12);
        let updates_before = cache.numeric_updates();

        // Cached read does not recompose.
        cache.relative_pose(&graph, 0, 2).unwrap();
        assert_eq!(cache.numeric_updates(), updates_before);

        // Change edge 1 (between kf 1 and 2) and mark it.
        graph.edge_mut(1).unwrap().relative_pose = Pose2D::new(2.0, 0.0, 0.0);
        cache.touch_edge(1);
        assert!(cache.cached_pose(0, 2).is_none());

        let after = cache.relative_pose(&graph, 0, 2).unwrap();
        assert_relative_eq!(after.x, 3.0, epsilon = 1e-12);
        assert_eq!(cache.numeric_updates(), updates_before + 1);

        // A path not through edge 1 stays fresh.
        assert!(cache.cached_pose(0, 1).is_some() || cache.relative_pose(&graph, 0, 1).is_some());
    }

    #[test]
    fn test_complete_tree_includes_poses() {
        let mut cache = SpanningTreeCache::new(4);
        let graph = chain(4, &mut cache);

        let mut ws = Vec::new();
        let tree = create_complete_spanning_tree(&graph, 1, TopoDist::MAX, Some(&mut ws));
        assert_eq!(tree.len(), 4);
        assert_eq!(tree[&1].distance, 0);
        assert_eq!(tree[&3].distance, 2);
        assert_relative_eq!(tree[&3].pose.x, 2.0, epsilon = 1e-12);
        assert_relative_eq!(tree[&0].pose.x, -1.0, epsilon = 1e-12);
    }
}
