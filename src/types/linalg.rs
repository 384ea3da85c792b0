//! Vector aliases and axis selection for acceleration samples.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

pub type AccelVec = Vector3<f64>;

/// Device axis used as "vertical" by the classifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }

    /// The two axes orthogonal to `self`, in x/y/z order.
    pub fn others(self) -> [Axis; 2] {
        match self {
            Axis::X => [Axis::Y, Axis::Z],
            Axis::Y => [Axis::X, Axis::Z],
            Axis::Z => [Axis::X, Axis::Y],
        }
    }

    pub fn component(self, v: &AccelVec) -> f64 {
        v[self.index()]
    }
}

impl Default for Axis {
    fn default() -> Self {
        Axis::Z
    }
}

/// Sum of absolute components, the form used by most field builds.
pub fn manhattan_norm(v: &AccelVec) -> f64 {
    v.x.abs() + v.y.abs() + v.z.abs()
}
