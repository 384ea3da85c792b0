use crate::config::MagnitudeMode;
use crate::types::{manhattan_norm, AccelVec};

/// Result of folding one vector into the sampler.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Observation {
    pub magnitude: f64,
    pub diff: f64,
    /// True for the first vector since construction or `reset()`.
    pub first: bool,
}

/// Turns raw acceleration vectors into a scalar change signal.
///
/// The only state is the previous magnitude, which belongs to the
/// owning session.
pub struct SignalSampler {
    mode: MagnitudeMode,
    previous: Option<f64>,
}

impl SignalSampler {
    pub fn new(mode: MagnitudeMode) -> Self {
        Self {
            mode,
            previous: None,
        }
    }

    pub fn magnitude(&self, v: &AccelVec) -> f64 {
        match self.mode {
            MagnitudeMode::Manhattan => manhattan_norm(v),
            MagnitudeMode::Euclidean => v.norm(),
        }
    }

    pub fn observe(&mut self, v: &AccelVec) -> Observation {
        let magnitude = self.magnitude(v);
        let observation = match self.previous {
            Some(prev) => Observation {
                magnitude,
                diff: (magnitude - prev).abs(),
                first: false,
            },
            None => Observation {
                magnitude,
                diff: 0.0,
                first: true,
            },
        };
        self.previous = Some(magnitude);
        observation
    }

    pub fn previous(&self) -> Option<f64> {
        self.previous
    }

    pub fn reset(&mut self) {
        self.previous = None;
    }
}
