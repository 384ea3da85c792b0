use crate::types::Coordinate;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance in meters.
pub fn haversine_distance(a: Coordinate, b: Coordinate) -> f64 {
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lon = (b.lng - a.lng).to_radians();
    let h = (d_lat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).max(0.0).sqrt());
    EARTH_RADIUS_M * c
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum GateDecision {
    Admitted,
    Cooldown { elapsed_ms: f64 },
    TooClose { distance_m: f64 },
}

impl GateDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, GateDecision::Admitted)
    }
}

/// Suppresses detections that repeat an accepted one in time or space.
pub struct EventGate {
    cooldown_secs: f64,
    min_distance_m: f64,
    last_accepted: Option<f64>,
    accepted_locations: Vec<Coordinate>,
}

impl EventGate {
    pub fn new(cooldown_secs: f64, min_distance_m: f64) -> Self {
        Self {
            cooldown_secs,
            min_distance_m,
            last_accepted: None,
            accepted_locations: Vec::new(),
        }
    }

    /// Candidates without a coordinate are judged on the cooldown alone.
    pub fn admit(&mut self, timestamp: f64, coordinate: Option<Coordinate>) -> GateDecision {
        if let Some(last) = self.last_accepted {
            let elapsed = timestamp - last;
            if elapsed < self.cooldown_secs {
                return GateDecision::Cooldown {
                    elapsed_ms: elapsed * 1000.0,
                };
            }
        }

        if let Some(candidate) = coordinate {
            let nearest = self
                .accepted_locations
                .iter()
                .map(|prev| haversine_distance(*prev, candidate))
                .fold(f64::INFINITY, f64::min);
            if nearest < self.min_distance_m {
                return GateDecision::TooClose {
                    distance_m: nearest,
                };
            }
        }

        self.last_accepted = Some(timestamp);
        if let Some(candidate) = coordinate {
            self.accepted_locations.push(candidate);
        }
        GateDecision::Admitted
    }

    pub fn accepted_count(&self) -> usize {
        self.accepted_locations.len()
    }

    pub fn last_accepted(&self) -> Option<f64> {
        self.last_accepted
    }
}
