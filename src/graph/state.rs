//! Authoritative problem state.
//!
//! The graph only grows: keyframes are sequential ids, k2k edges live in an
//! arena indexed by [`EdgeId`], and landmarks sit in exactly one of two
//! tables (known / unknown relative position). Adjacency is a derived index
//! from keyframe id to the edge ids that touch it, maintained in edge
//! creation order so every traversal over it is repeatable.

use std::collections::BTreeMap;

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::core::pose::RelativePose;
use crate::core::types::{EdgeId, KeyframeId, LandmarkId};
use crate::error::{RbaError, Result};

/// A keyframe-to-keyframe edge: the only kind of pose unknown.
///
/// `relative_pose` is the pose of `to` expressed in the frame of `from`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kf2KfEdge<P> {
    /// Arena index of this edge.
    pub id: EdgeId,
    /// Source keyframe.
    pub from: KeyframeId,
    /// Target keyframe.
    pub to: KeyframeId,
    /// Current estimate of the relative pose (optimizable unknown).
    pub relative_pose: P,
}

/// A landmark's relative position, anchored to its base keyframe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LandmarkEntry {
    /// The keyframe whose frame the position is expressed in.
    pub base_kf: KeyframeId,
    /// Relative position. Fixed forever for known landmarks, current
    /// estimate for unknown ones.
    pub position: DVector<f64>,
}

/// A keyframe-to-landmark edge: one raw sensor observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    /// The keyframe the measurement was taken from.
    pub observer: KeyframeId,
    /// The observed landmark.
    pub landmark_id: LandmarkId,
    /// Raw measurement vector.
    pub measurement: DVector<f64>,
    /// Whether the landmark's relative position is known (fixed).
    pub known_position: bool,
}

/// The growing estimation graph: keyframes, edges, landmarks, observations.
#[derive(Debug, Default)]
pub struct GraphState<P> {
    /// Number of allocated keyframes; ids are `0..num_keyframes`.
    num_keyframes: u64,

    /// Edge arena, indexed by [`EdgeId`].
    k2k_edges: Vec<Kf2KfEdge<P>>,

    /// Derived adjacency: keyframe id -> touching edge ids, creation order.
    adjacency: Vec<Vec<EdgeId>>,

    /// Landmarks with fixed relative positions. Never optimized.
    known_landmarks: BTreeMap<LandmarkId, LandmarkEntry>,

    /// Landmarks whose relative positions are unknowns.
    unknown_landmarks: BTreeMap<LandmarkId, LandmarkEntry>,

    /// All observations, in insertion order.
    observations: Vec<Observation>,

    /// Derived: keyframe id -> indices into `observations`.
    obs_by_keyframe: Vec<Vec<usize>>,

    /// Derived: landmark id -> observing keyframes, in observation order.
    observers_of: BTreeMap<LandmarkId, Vec<KeyframeId>>,
}

impl<P: RelativePose> GraphState<P> {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self {
            num_keyframes: 0,
            k2k_edges: Vec::new(),
            adjacency: Vec::new(),
            known_landmarks: BTreeMap::new(),
            unknown_landmarks: BTreeMap::new(),
            observations: Vec::new(),
            obs_by_keyframe: Vec::new(),
            observers_of: BTreeMap::new(),
        }
    }

    /// Append a new keyframe and return its id. O(1).
    pub fn alloc_keyframe(&mut self) -> KeyframeId {
        let id = self.num_keyframes;
        self.num_keyframes += 1;
        self.adjacency.push(Vec::new());
        self.obs_by_keyframe.push(Vec::new());
        id
    }

    /// Create a k2k edge carrying `initial_pose` (pose of `to` in `from`).
    ///
    /// Both endpoints must already exist and must differ. O(1) amortized.
    pub fn create_k2k_edge(
        &mut self,
        from: KeyframeId,
        to: KeyframeId,
        initial_pose: P,
    ) -> Result<EdgeId> {
        self.check_keyframe(from)?;
        self.check_keyframe(to)?;
        if from == to {
            return Err(RbaError::SelfEdge(from));
        }

        let id = self.k2k_edges.len();
        self.k2k_edges.push(Kf2KfEdge {
            id,
            from,
            to,
            relative_pose: initial_pose,
        });
        self.adjacency[from as usize].push(id);
        self.adjacency[to as usize].push(id);
        Ok(id)
    }

    /// Record an observation of `landmark_id` from `observer`.
    ///
    /// Exactly one of `fixed_position` / `initial_position` may be supplied,
    /// and only on the landmark's first observation: the first sight decides
    /// which table the landmark lives in (known vs unknown, anchored at the
    /// observer). Later observations must supply neither. A first sight with
    /// neither creates an unknown landmark seeded at the frame origin.
    ///
    /// Returns the index of the new observation. O(P + log C).
    pub fn add_observation(
        &mut self,
        observer: KeyframeId,
        landmark_id: LandmarkId,
        measurement: DVector<f64>,
        fixed_position: Option<DVector<f64>>,
        initial_position: Option<DVector<f64>>,
    ) -> Result<usize> {
        self.check_keyframe(observer)?;
        if fixed_position.is_some() && initial_position.is_some() {
            return Err(RbaError::ConflictingLandmarkInit(landmark_id));
        }

        let already_known = self.known_landmarks.contains_key(&landmark_id);
        let already_unknown = self.unknown_landmarks.contains_key(&landmark_id);

        let known_position = if already_known || already_unknown {
            if fixed_position.is_some() || initial_position.is_some() {
                return Err(RbaError::LandmarkAlreadyInitialized(landmark_id));
            }
            already_known
        } else if let Some(position) = fixed_position {
            self.known_landmarks.insert(
                landmark_id,
                LandmarkEntry {
                    base_kf: observer,
                    position,
                },
            );
            true
        } else {
            let position = initial_position
                .unwrap_or_else(|| DVector::zeros(P::point_dims()));
            self.unknown_landmarks.insert(
                landmark_id,
                LandmarkEntry {
                    base_kf: observer,
                    position,
                },
            );
            false
        };

        let obs_idx = self.observations.len();
        self.observations.push(Observation {
            observer,
            landmark_id,
            measurement,
            known_position,
        });
        self.obs_by_keyframe[observer as usize].push(obs_idx);
        self.observers_of
            .entry(landmark_id)
            .or_default()
            .push(observer);
        Ok(obs_idx)
    }

    /// Number of allocated keyframes.
    pub fn num_keyframes(&self) -> u64 {
        self.num_keyframes
    }

    /// Does this keyframe exist?
    pub fn has_keyframe(&self, kf: KeyframeId) -> bool {
        kf < self.num_keyframes
    }

    fn check_keyframe(&self, kf: KeyframeId) -> Result<()> {
        if self.has_keyframe(kf) {
            Ok(())
        } else {
            Err(RbaError::UnknownKeyframe(kf))
        }
    }

    /// All k2k edges, indexed by [`EdgeId`].
    pub fn k2k_edges(&self) -> &[Kf2KfEdge<P>] {
        &self.k2k_edges
    }

    /// Look up one edge.
    pub fn edge(&self, id: EdgeId) -> Option<&Kf2KfEdge<P>> {
        self.k2k_edges.get(id)
    }

    pub(crate) fn edge_mut(&mut self, id: EdgeId) -> Option<&mut Kf2KfEdge<P>> {
        self.k2k_edges.get_mut(id)
    }

    /// Edge ids touching `kf`, in creation order.
    pub fn edges_of(&self, kf: KeyframeId) -> &[EdgeId] {
        &self.adjacency[kf as usize]
    }

    /// The known-position landmark table.
    pub fn known_landmarks(&self) -> &BTreeMap<LandmarkId, LandmarkEntry> {
        &self.known_landmarks
    }

    /// The unknown-position landmark table.
    pub fn unknown_landmarks(&self) -> &BTreeMap<LandmarkId, LandmarkEntry> {
        &self.unknown_landmarks
    }

    pub(crate) fn unknown_landmark_mut(&mut self, id: LandmarkId) -> Option<&mut LandmarkEntry> {
        self.unknown_landmarks.get_mut(&id)
    }

    /// Look up a landmark in either table. Returns `(entry, known)`.
    pub fn landmark(&self, id: LandmarkId) -> Option<(&LandmarkEntry, bool)> {
        if let Some(entry) = self.known_landmarks.get(&id) {
            Some((entry, true))
        } else {
            self.unknown_landmarks.get(&id).map(|entry| (entry, false))
        }
    }

    /// All observations, in insertion order.
    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    /// Indices of the observations taken from `kf`.
    pub fn observations_of(&self, kf: KeyframeId) -> &[usize] {
        &self.obs_by_keyframe[kf as usize]
    }

    /// How many times `landmark_id` has been observed.
    pub fn times_seen(&self, landmark_id: LandmarkId) -> usize {
        self.observers_of
            .get(&landmark_id)
            .map_or(0, |observers| observers.len())
    }

    /// Keyframes observing `landmark_id`, in observation order.
    pub fn observers_of(&self, landmark_id: LandmarkId) -> &[KeyframeId] {
        self.observers_of
            .get(&landmark_id)
            .map_or(&[], |observers| observers.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pose::Pose2D;

    fn vec2(x: f64, y: f64) -> DVector<f64> {
        DVector::from_vec(vec![x, y])
    }

    #[test]
    fn test_alloc_keyframe_sequential() {
        let mut graph: GraphState<Pose2D> = GraphState::new();
        assert_eq!(graph.alloc_keyframe(), 0);
        assert_eq!(graph.alloc_keyframe(), 1);
        assert_eq!(graph.alloc_keyframe(), 2);
        assert_eq!(graph.num_keyframes(), 3);
    }

    #[test]
    fn test_create_edge_validates_endpoints() {
        let mut graph: GraphState<Pose2D> = GraphState::new();
        graph.alloc_keyframe();
        graph.alloc_keyframe();

        let id = graph
            .create_k2k_edge(0, 1, Pose2D::new(1.0, 0.0, 0.0))
            .unwrap();
        assert_eq!(id, 0);
        assert_eq!(graph.edges_of(0), &[0]);
        assert_eq!(graph.edges_of(1), &[0]);

        assert_eq!(
            graph.create_k2k_edge(0, 5, Pose2D::identity()),
            Err(RbaError::UnknownKeyframe(5))
        );
        assert_eq!(
            graph.create_k2k_edge(1, 1, Pose2D::identity()),
            Err(RbaError::SelfEdge(1))
        );
    }

    #[test]
    fn test_first_observation_classifies_landmark() {
        let mut graph: GraphState<Pose2D> = GraphState::new();
        graph.alloc_keyframe();

        graph
            .add_observation(0, 7, vec2(1.0, 0.0), Some(vec2(1.0, 0.0)), None)
            .unwrap();
        graph
            .add_observation(0, 8, vec2(0.0, 1.0), None, Some(vec2(0.0, 1.0)))
            .unwrap();
        graph
            .add_observation(0, 9, vec2(2.0, 2.0), None, None)
            .unwrap();

        assert!(graph.known_landmarks().contains_key(&7));
        assert!(graph.unknown_landmarks().contains_key(&8));
        assert!(graph.unknown_landmarks().contains_key(&9));
        assert!(!graph.unknown_landmarks().contains_key(&7));
        assert_eq!(graph.landmark(9).unwrap().0.base_kf, 0);
    }

    #[test]
    fn test_conflicting_init_rejected() {
        let mut graph: GraphState<Pose2D> = GraphState::new();
        graph.alloc_keyframe();

        let err = graph
            .add_observation(0, 1, vec2(1.0, 0.0), Some(vec2(1.0, 0.0)), Some(vec2(1.0, 0.0)))
            .unwrap_err();
        assert_eq!(err, RbaError::ConflictingLandmarkInit(1));
    }

    #[test]
    fn test_reinitialization_rejected() {
        let mut graph: GraphState<Pose2D> = GraphState::new();
        graph.alloc_keyframe();
        graph.alloc_keyframe();

        graph
            .add_observation(0, 1, vec2(1.0, 0.0), None, Some(vec2(1.0, 0.0)))
            .unwrap();
        let err = graph
            .add_observation(1, 1, vec2(0.5, 0.0), None, Some(vec2(0.5, 0.0)))
            .unwrap_err();
        assert_eq!(err, RbaError::LandmarkAlreadyInitialized(1));

        let err = graph
            .add_observation(1, 1, vec2(0.5, 0.0), Some(vec2(0.5, 0.0)), None)
            .unwrap_err();
        assert_eq!(err, RbaError::LandmarkAlreadyInitialized(1));
    }

    #[test]
    fn test_times_seen_counts_observations() {
        let mut graph: GraphState<Pose2D> = GraphState::new();
        graph.alloc_keyframe();
        graph.alloc_keyframe();

        graph
            .add_observation(0, 3, vec2(1.0, 0.0), None, None)
            .unwrap();
        graph
            .add_observation(1, 3, vec2(0.5, 0.0), None, None)
            .unwrap();

        assert_eq!(graph.times_seen(3), 2);
        assert_eq!(graph.observers_of(3), &[0, 1]);
        assert_eq!(graph.times_seen(99), 0);
    }
}
