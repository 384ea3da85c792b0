use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{TrackerError, TrackerResult};
use crate::types::Axis;

// ===== Option enums =====

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MagnitudeMode {
    /// |x| + |y| + |z|
    Manhattan,
    /// sqrt(x² + y² + z²)
    Euclidean,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentMode {
    /// Adaptive spans closed after a quiet run.
    Span,
    /// Every admitted crossing is a one-sample span with fixed pre/post windows.
    Point,
}

/// What the end-of-session sweep does with Normal records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy")]
pub enum SweepPolicy {
    Off,
    DropNormal,
    Decimate { every: usize },
}

// ===== Classifier =====

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub vertical_axis: Axis,
    pub step_min_peak: f64,
    pub step_min_vertical_ratio: f64,
    pub curve_min_peak: f64,
    pub curve_max_vertical_ratio: f64,
    pub rough_min_samples: usize,
    pub rough_max_sign_consistency: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            vertical_axis: Axis::Z,
            step_min_peak: 6.0,
            step_min_vertical_ratio: 1.5,
            curve_min_peak: 3.0,
            curve_max_vertical_ratio: 0.6,
            rough_min_samples: 4,
            rough_max_sign_consistency: 0.6,
        }
    }
}

// ===== Detector =====

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    // Segmentation
    pub threshold: f64,
    pub quiet_count: usize,
    pub segment_mode: SegmentMode,
    pub magnitude_mode: MagnitudeMode,

    // Gate
    pub cooldown_ms: u64,
    pub min_distance_m: f64,

    // Retention
    pub pre_context_n: usize,
    pub post_context_n: usize,
    pub buffer_capacity: usize,

    // Persistence
    pub periodic_flush_ms: u64,
    pub sweep: SweepPolicy,
    pub jit_fix_timeout_ms: Option<u64>,

    /// Drop samples taken before the first location fix.
    pub require_location: bool,

    pub classifier: ClassifierConfig,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            threshold: 3.0,
            quiet_count: 3,
            segment_mode: SegmentMode::Span,
            magnitude_mode: MagnitudeMode::Manhattan,
            cooldown_ms: 1000,
            min_distance_m: 5.0,
            pre_context_n: 5,
            post_context_n: 5,
            buffer_capacity: 50,
            periodic_flush_ms: 1000,
            sweep: SweepPolicy::Decimate { every: 8 },
            jit_fix_timeout_ms: None,
            require_location: false,
            classifier: ClassifierConfig::default(),
        }
    }
}

impl DetectorConfig {
    pub fn from_json_str(json: &str) -> TrackerResult<Self> {
        let config: DetectorConfig = serde_json::from_str(json)
            .map_err(|e| TrackerError::InvalidConfig(format!("parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> TrackerResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            TrackerError::InvalidConfig(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> TrackerResult<()> {
        if !(self.threshold.is_finite() && self.threshold > 0.0) {
            return Err(TrackerError::InvalidConfig(format!(
                "threshold must be positive, got {}",
                self.threshold
            )));
        }
        if self.quiet_count == 0 {
            return Err(TrackerError::InvalidConfig(
                "quiet_count must be at least 1".to_string(),
            ));
        }
        if self.buffer_capacity == 0 {
            return Err(TrackerError::InvalidConfig(
                "buffer_capacity must be at least 1".to_string(),
            ));
        }
        if self.pre_context_n >= self.buffer_capacity {
            return Err(TrackerError::InvalidConfig(format!(
                "pre_context_n ({}) must be smaller than buffer_capacity ({})",
                self.pre_context_n, self.buffer_capacity
            )));
        }
        if self.periodic_flush_ms == 0 {
            return Err(TrackerError::InvalidConfig(
                "periodic_flush_ms must be non-zero".to_string(),
            ));
        }
        if self.min_distance_m < 0.0 || !self.min_distance_m.is_finite() {
            return Err(TrackerError::InvalidConfig(format!(
                "min_distance_m must be a non-negative number, got {}",
                self.min_distance_m
            )));
        }
        if let SweepPolicy::Decimate { every: 0 } = self.sweep {
            return Err(TrackerError::InvalidConfig(
                "decimation interval must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn cooldown_secs(&self) -> f64 {
        self.cooldown_ms as f64 / 1000.0
    }
}
