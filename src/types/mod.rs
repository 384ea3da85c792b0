pub mod linalg;

pub use linalg::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Raw accelerometer push. Browsers and some Android builds report
/// `null` components while the sensor warms up, hence the options.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MotionReading {
    pub timestamp: f64,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
}

impl MotionReading {
    pub fn new(x: f64, y: f64, z: f64, timestamp: f64) -> Self {
        Self {
            timestamp,
            x: Some(x),
            y: Some(y),
            z: Some(z),
        }
    }

    /// `None` when any component is missing or not finite, or when the
    /// timestamp is not finite.
    pub fn vector(&self) -> Option<AccelVec> {
        if !self.timestamp.is_finite() {
            return None;
        }
        match (self.x, self.y, self.z) {
            (Some(x), Some(y), Some(z)) if x.is_finite() && y.is_finite() && z.is_finite() => {
                Some(AccelVec::new(x, y, z))
            }
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LocationFix {
    pub timestamp: f64,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub accuracy: Option<f64>,
}

impl LocationFix {
    pub fn new(latitude: f64, longitude: f64, timestamp: f64) -> Self {
        Self {
            timestamp,
            latitude,
            longitude,
            accuracy: None,
        }
    }

    pub fn coordinate(&self) -> Coordinate {
        Coordinate {
            lat: self.latitude,
            lng: self.longitude,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Normal,
    Context,
    Event,
    AfterContext,
}

impl EventKind {
    /// Kinds that survive every end-of-session sweep policy.
    pub fn is_retained(self) -> bool {
        !matches!(self, EventKind::Normal)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Label {
    Step,
    Curve,
    RoughSurface,
    Flat,
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Label::Step => "step",
            Label::Curve => "curve",
            Label::RoughSurface => "rough_surface",
            Label::Flat => "flat",
        };
        f.write_str(name)
    }
}

/// One processed accelerometer tick. Immutable after construction; its
/// classification lives in the [`SampleRecord`] it is packaged into.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    pub id: u64,
    pub timestamp: f64,
    pub vector: AccelVec,
    pub magnitude: f64,
    pub diff: f64,
    pub coordinate: Option<Coordinate>,
}

impl Sample {
    pub fn tagged(&self, kind: EventKind) -> SampleRecord {
        SampleRecord {
            id: self.id,
            timestamp: self.timestamp,
            x: self.vector.x,
            y: self.vector.y,
            z: self.vector.z,
            magnitude: self.magnitude,
            diff: self.diff,
            lat: self.coordinate.map(|c| c.lat),
            lng: self.coordinate.map(|c| c.lng),
            kind,
            span_id: None,
            label: None,
        }
    }
}

/// Persisted form of a sample. `kind` is fixed when the record is built.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub id: u64,
    pub timestamp: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub magnitude: f64,
    pub diff: f64,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<Label>,
}

impl SampleRecord {
    pub fn coordinate(&self) -> Option<Coordinate> {
        match (self.lat, self.lng) {
            (Some(lat), Some(lng)) => Some(Coordinate { lat, lng }),
            _ => None,
        }
    }

    pub fn set_coordinate(&mut self, coordinate: Coordinate) {
        self.lat = Some(coordinate.lat);
        self.lng = Some(coordinate.lng);
    }

    pub fn vector(&self) -> AccelVec {
        AccelVec::new(self.x, self.y, self.z)
    }
}

/// Map pin for a classified event. Write-once.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MarkerRecord {
    pub coordinate: Coordinate,
    pub label: Label,
    pub magnitude: f64,
    pub timestamp: f64,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Derive the id from the session's start instant.
    pub fn from_start(start: DateTime<Utc>) -> Self {
        SessionId(format!("sess_{}", start.timestamp_millis()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        SessionId(value.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
