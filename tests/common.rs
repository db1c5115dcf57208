//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::collections::BTreeSet;

use nalgebra::DVector;
use setu_rba::{LandmarkId, NewObservation};

/// Shorthand for a 2-component measurement/position vector.
pub fn vec2(x: f64, y: f64) -> DVector<f64> {
    DVector::from_vec(vec![x, y])
}

/// A corridor of landmark pairs flanking the x axis.
///
/// Column `j` holds landmark `2j` at `(j + 0.5, 1.0)` and landmark `2j + 1`
/// at `(j + 0.5, -1.0)`. Keyframes drive along the axis with zero heading,
/// so a keyframe at `(x, 0)` measures each visible landmark at its exact
/// relative position.
pub struct Corridor {
    columns: usize,
    sensor_range: f64,
    seen: BTreeSet<LandmarkId>,
}

impl Corridor {
    pub fn new(columns: usize) -> Self {
        Self {
            columns,
            sensor_range: 1.6,
            seen: BTreeSet::new(),
        }
    }

    /// Observations of every landmark within sensor range of a keyframe at
    /// `(x, 0)`. The first sighting of a landmark carries its exact relative
    /// position as the initial estimate.
    pub fn observations_at(&mut self, x: f64) -> Vec<NewObservation> {
        let mut observations = Vec::new();
        for j in 0..self.columns {
            let lx = j as f64 + 0.5;
            if (lx - x).abs() > self.sensor_range {
                continue;
            }
            for (id, ly) in [(2 * j as u64, 1.0), (2 * j as u64 + 1, -1.0)] {
                let z = vec2(lx - x, ly);
                let obs = if self.seen.insert(id) {
                    NewObservation::with_initial_position(id, z.clone(), z)
                } else {
                    NewObservation::new(id, z)
                };
                observations.push(obs);
            }
        }
        observations
    }
}
