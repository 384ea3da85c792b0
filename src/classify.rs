use crate::config::ClassifierConfig;
use crate::types::{EventKind, Label, SampleRecord};

/// Shape features of one event unit.
#[derive(Clone, Debug, PartialEq)]
pub struct EventFeatures {
    pub peak_diff: f64,
    /// Accumulated |Δ| per axis over consecutive records.
    pub axis_deltas: [f64; 3],
    /// Vertical delta over the sum of both horizontal deltas.
    pub vertical_ratio: f64,
    /// Share of non-zero vertical deltas that agree with the dominant sign.
    pub vertical_sign_consistency: f64,
    pub event_samples: usize,
}

pub fn extract_features(records: &[SampleRecord], config: &ClassifierConfig) -> EventFeatures {
    let mut ordered: Vec<&SampleRecord> = records.iter().collect();
    ordered.sort_by_key(|r| r.id);

    let peak_diff = ordered.iter().map(|r| r.diff).fold(0.0, f64::max);
    let event_samples = ordered
        .iter()
        .filter(|r| r.kind == EventKind::Event)
        .count();

    let mut axis_deltas = [0.0; 3];
    let mut rising = 0usize;
    let mut falling = 0usize;
    let vertical = config.vertical_axis;

    for pair in ordered.windows(2) {
        let delta = pair[1].vector() - pair[0].vector();
        for (i, acc) in axis_deltas.iter_mut().enumerate() {
            *acc += delta[i].abs();
        }
        let dv = vertical.component(&delta);
        if dv > 0.0 {
            rising += 1;
        } else if dv < 0.0 {
            falling += 1;
        }
    }

    let [h1, h2] = vertical.others();
    let horizontal = axis_deltas[h1.index()] + axis_deltas[h2.index()];
    let vertical_delta = axis_deltas[vertical.index()];
    let vertical_ratio = if horizontal > 0.0 {
        vertical_delta / horizontal
    } else if vertical_delta > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };

    let signed = rising + falling;
    let vertical_sign_consistency = if signed == 0 {
        1.0
    } else {
        rising.max(falling) as f64 / signed as f64
    };

    EventFeatures {
        peak_diff,
        axis_deltas,
        vertical_ratio,
        vertical_sign_consistency,
        event_samples,
    }
}

/// Ordered rules, first match wins.
pub fn classify(features: &EventFeatures, config: &ClassifierConfig) -> Label {
    // Step: vertical-dominant with a hard peak
    if features.peak_diff >= config.step_min_peak
        && features.vertical_ratio >= config.step_min_vertical_ratio
    {
        return Label::Step;
    }

    // Curve: horizontal-dominant, moderate peak
    if features.peak_diff >= config.curve_min_peak
        && features.vertical_ratio <= config.curve_max_vertical_ratio
    {
        return Label::Curve;
    }

    // Rough surface: sustained vertical chatter without a consistent direction
    if features.event_samples >= config.rough_min_samples
        && features.vertical_sign_consistency <= config.rough_max_sign_consistency
    {
        return Label::RoughSurface;
    }

    Label::Flat
}

pub fn classify_records(records: &[SampleRecord], config: &ClassifierConfig) -> Label {
    classify(&extract_features(records, config), config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AccelVec, Sample};

    fn record(id: u64, v: (f64, f64, f64), diff: f64, kind: EventKind) -> SampleRecord {
        Sample {
            id,
            timestamp: id as f64 * 0.02,
            vector: AccelVec::new(v.0, v.1, v.2),
            magnitude: v.0.abs() + v.1.abs() + v.2.abs(),
            diff,
            coordinate: None,
        }
        .tagged(kind)
    }

    #[test]
    fn test_vertical_spike_is_step() {
        let config = ClassifierConfig::default();
        let records = vec![
            record(1, (0.1, 0.1, 9.8), 0.1, EventKind::Context),
            record(2, (0.2, 0.1, 17.0), 7.3, EventKind::Event),
            record(3, (0.1, 0.2, 9.9), 7.1, EventKind::Context),
        ];
        let features = extract_features(&records, &config);
        assert!(features.vertical_ratio > 10.0);
        assert_eq!(features.event_samples, 1);
        assert_eq!(classify(&features, &config), Label::Step);
    }

    #[test]
    fn test_lateral_swing_is_curve() {
        let config = ClassifierConfig::default();
        let records = vec![
            record(1, (0.0, 0.0, 9.8), 0.0, EventKind::Context),
            record(2, (3.5, 0.5, 9.8), 4.0, EventKind::Event),
            record(3, (4.0, 1.0, 9.9), 1.1, EventKind::Event),
        ];
        assert_eq!(classify_records(&records, &config), Label::Curve);
    }

    #[test]
    fn test_chatter_is_rough_surface() {
        let config = ClassifierConfig::default();
        // Vertical deltas alternate sign, peak below the step/curve gates
        let records = vec![
            record(1, (0.0, 0.0, 9.8), 0.0, EventKind::Event),
            record(2, (0.0, 0.0, 11.5), 1.7, EventKind::Event),
            record(3, (0.0, 0.0, 9.0), 2.5, EventKind::Event),
            record(4, (0.0, 0.0, 11.0), 2.0, EventKind::Event),
            record(5, (0.0, 0.0, 9.2), 1.8, EventKind::Event),
        ];
        let features = extract_features(&records, &config);
        assert!((features.vertical_sign_consistency - 0.5).abs() < 1e-9);
        assert_eq!(classify(&features, &config), Label::RoughSurface);
    }

    #[test]
    fn test_default_is_flat() {
        let config = ClassifierConfig::default();
        let records = vec![record(1, (0.0, 0.0, 9.8), 1.0, EventKind::Event)];
        let features = extract_features(&records, &config);
        assert_eq!(features.vertical_ratio, 0.0);
        assert_eq!(classify(&features, &config), Label::Flat);
    }

    #[test]
    fn test_rule_order_prefers_step() {
        let config = ClassifierConfig::default();
        // Meets both step and rough-surface criteria
        let features = EventFeatures {
            peak_diff: 10.0,
            axis_deltas: [0.0, 0.0, 5.0],
            vertical_ratio: f64::INFINITY,
            vertical_sign_consistency: 0.5,
            event_samples: 8,
        };
        assert_eq!(classify(&features, &config), Label::Step);
    }
}
