//! Graph layer: authoritative problem state, bounded traversal, and the
//! spanning-tree cache that turns relative coordinates into usable local
//! frames.

pub mod bfs;
pub mod spanning_tree;
pub mod state;

pub use bfs::{bfs_visit, find_path_bfs, BfsVisitor};
pub use spanning_tree::{
    create_complete_spanning_tree, SpanTreeNode, SpanningTreeCache, TreeEntry,
};
pub use state::{GraphState, Kf2KfEdge, LandmarkEntry, Observation};
