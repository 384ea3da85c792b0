// engine.rs - Pure per-session detection pipeline
//
// Independent of tokio, the record store and the map. Readings go in;
// flush units and lifecycle events come out. The session actor owns one
// engine and performs all I/O on its behalf.

use serde::Serialize;

use crate::classify::classify_records;
use crate::config::{DetectorConfig, SegmentMode};
use crate::gate::{EventGate, GateDecision};
use crate::retention::{AfterCollector, FlushUnit, RetentionBuffer};
use crate::sampler::SignalSampler;
use crate::segmenter::{EventSegmenter, EventSpan, Transition};
use crate::types::{EventKind, Label, LocationFix, MotionReading, Sample, SampleRecord};

// ===== Events =====

#[derive(Clone, Debug)]
pub enum EngineEvent {
    MalformedDropped,
    NoFixDropped,
    GateRejected { timestamp: f64, decision: GateDecision },
    SpanOpened { span_id: u64, timestamp: f64, diff: f64 },
    SpanClosed { span_id: u64, samples: usize },
    /// A complete unit ready to persist, in sampling order.
    UnitReady(FlushUnit),
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct EngineStats {
    pub samples: u64,
    pub malformed: u64,
    pub dropped_without_fix: u64,
    pub gate_rejections: u64,
    pub spans_opened: u64,
    pub units_ready: u64,
}

// ===== The engine =====

pub struct DetectionEngine {
    config: DetectorConfig,
    sampler: SignalSampler,
    buffer: RetentionBuffer,
    gate: EventGate,
    segmenter: EventSegmenter,
    after: Option<AfterCollector>,

    // Pre-context captured when the current span opened
    pending_pre: Vec<Sample>,

    // Every id at or below this has been packaged into a record
    claimed_through: Option<u64>,

    last_fix: Option<LocationFix>,
    next_id: u64,
    stats: EngineStats,
}

impl DetectionEngine {
    pub fn new(config: DetectorConfig) -> Self {
        let sampler = SignalSampler::new(config.magnitude_mode);
        let buffer = RetentionBuffer::new(config.buffer_capacity);
        let gate = EventGate::new(config.cooldown_secs(), config.min_distance_m);
        let segmenter =
            EventSegmenter::new(config.segment_mode, config.threshold, config.quiet_count);
        Self {
            config,
            sampler,
            buffer,
            gate,
            segmenter,
            after: None,
            pending_pre: Vec::new(),
            claimed_through: None,
            last_fix: None,
            next_id: 0,
            stats: EngineStats::default(),
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn last_fix(&self) -> Option<&LocationFix> {
        self.last_fix.as_ref()
    }

    pub fn buffer(&self) -> &RetentionBuffer {
        &self.buffer
    }

    pub fn segmenter(&self) -> &EventSegmenter {
        &self.segmenter
    }

    /// True while a span is open or trailing context is being gathered.
    pub fn is_busy(&self) -> bool {
        self.segmenter.is_open() || self.after.is_some()
    }

    pub fn feed_location(&mut self, fix: LocationFix) {
        self.last_fix = Some(fix);
    }

    pub fn feed_motion(&mut self, reading: &MotionReading) -> Vec<EngineEvent> {
        let mut events = Vec::new();

        // Malformed readings do not touch the previous-vector state
        let Some(vector) = reading.vector() else {
            self.stats.malformed += 1;
            events.push(EngineEvent::MalformedDropped);
            return events;
        };

        // Nor do readings dropped for want of a fix
        let coordinate = self.last_fix.as_ref().map(LocationFix::coordinate);
        if self.config.require_location && coordinate.is_none() {
            self.stats.dropped_without_fix += 1;
            events.push(EngineEvent::NoFixDropped);
            return events;
        }

        let observation = self.sampler.observe(&vector);

        let sample = Sample {
            id: self.next_id,
            timestamp: reading.timestamp,
            vector,
            magnitude: observation.magnitude,
            diff: observation.diff,
            coordinate,
        };
        self.next_id += 1;
        self.stats.samples += 1;
        self.buffer.push(sample.clone());

        if let Some(collector) = self.after.as_mut() {
            let crossing = !observation.first && self.segmenter.is_crossing(sample.diff);
            if !crossing {
                if collector.push(&sample) {
                    if let Some(done) = self.after.take() {
                        events.push(self.finalize(done.finish()));
                    }
                }
                return events;
            }
            // A new crossing cuts the trailing window short
            if let Some(done) = self.after.take() {
                events.push(self.finalize(done.finish()));
            }
        }

        match self
            .segmenter
            .observe(&sample, observation.first, &mut self.gate)
        {
            Transition::Ignored | Transition::Extended | Transition::Quiet { .. } => {}
            Transition::Resumed => {
                log::debug!("span resumed at sample {}", sample.id);
            }
            Transition::Rejected(decision) => {
                self.stats.gate_rejections += 1;
                events.push(EngineEvent::GateRejected {
                    timestamp: sample.timestamp,
                    decision,
                });
            }
            Transition::Opened { span_id } => {
                self.stats.spans_opened += 1;
                self.pending_pre = self.take_pre_context(sample.id);
                events.push(EngineEvent::SpanOpened {
                    span_id,
                    timestamp: sample.timestamp,
                    diff: sample.diff,
                });
            }
            Transition::Closed(span) => {
                if self.config.segment_mode == SegmentMode::Point {
                    // The span opened and closed on this sample
                    self.stats.spans_opened += 1;
                    self.pending_pre = self.take_pre_context(sample.id);
                    events.push(EngineEvent::SpanOpened {
                        span_id: span.span_id,
                        timestamp: sample.timestamp,
                        diff: sample.diff,
                    });
                }
                events.push(EngineEvent::SpanClosed {
                    span_id: span.span_id,
                    samples: span.samples.len(),
                });
                let unit = self.assemble(span);
                if self.config.post_context_n > 0 {
                    self.after = Some(AfterCollector::new(unit, self.config.post_context_n));
                } else {
                    events.push(self.finalize(unit));
                }
            }
        }

        events
    }

    /// Latest buffered sample tagged Normal, for the periodic writer.
    /// `None` while busy or when the latest sample is already claimed.
    pub fn periodic_candidate(&mut self) -> Option<SampleRecord> {
        if self.is_busy() {
            return None;
        }
        let latest = self.buffer.latest()?;
        if self.is_claimed(latest.id) {
            return None;
        }
        let record = latest.tagged(EventKind::Normal);
        self.claimed_through = Some(record.id);
        Some(record)
    }

    /// Flush everything still in flight. Called once when the session stops.
    pub fn finish(&mut self) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        if let Some(collector) = self.after.take() {
            events.push(self.finalize(collector.finish()));
        }
        let now = self
            .buffer
            .latest()
            .map(|s| s.timestamp)
            .unwrap_or_default();
        if let Some(span) = self.segmenter.force_close(now) {
            events.push(EngineEvent::SpanClosed {
                span_id: span.span_id,
                samples: span.samples.len(),
            });
            let unit = self.assemble(span);
            events.push(self.finalize(unit));
        }
        events
    }

    fn is_claimed(&self, id: u64) -> bool {
        self.claimed_through.map(|c| id <= c).unwrap_or(false)
    }

    /// Unclaimed pre-context before `trigger_id`; claims through the trigger.
    fn take_pre_context(&mut self, trigger_id: u64) -> Vec<Sample> {
        let claimed = self.claimed_through;
        let pre: Vec<Sample> = self
            .buffer
            .last_n(self.config.pre_context_n, Some(trigger_id))
            .into_iter()
            .filter(|s| s.id < trigger_id && claimed.map(|c| s.id > c).unwrap_or(true))
            .collect();
        self.claimed_through = Some(trigger_id);
        pre
    }

    fn assemble(&mut self, span: EventSpan) -> FlushUnit {
        let span_id = span.span_id;
        let mut records: Vec<SampleRecord> = std::mem::take(&mut self.pending_pre)
            .iter()
            .map(|s| {
                let mut r = s.tagged(EventKind::Context);
                r.span_id = Some(span_id);
                r
            })
            .collect();
        records.extend(span.samples);
        if let Some(last) = records.last() {
            self.claimed_through = Some(self.claimed_through.map_or(last.id, |c| c.max(last.id)));
        }
        FlushUnit::new(span_id, records)
    }

    fn finalize(&mut self, mut unit: FlushUnit) -> EngineEvent {
        let label: Label = classify_records(&unit.records, &self.config.classifier);
        for record in unit.records.iter_mut() {
            record.label = Some(label);
        }
        unit.label = Some(label);
        if let Some(last) = unit.last_id() {
            self.claimed_through = Some(self.claimed_through.map_or(last, |c| c.max(last)));
        }
        self.stats.units_ready += 1;
        EngineEvent::UnitReady(unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Readings whose Manhattan magnitudes produce exactly `diffs`.
    fn readings_for_diffs(diffs: &[f64]) -> Vec<MotionReading> {
        let mut z = 10.0;
        let mut up = true;
        diffs
            .iter()
            .enumerate()
            .map(|(i, d)| {
                if i > 0 {
                    z = if up { z + d } else { z - d };
                    up = !up;
                }
                MotionReading::new(0.0, 0.0, z, i as f64 * 0.02)
            })
            .collect()
    }

    fn units(events: &[EngineEvent]) -> Vec<FlushUnit> {
        events
            .iter()
            .filter_map(|e| match e {
                EngineEvent::UnitReady(u) => Some(u.clone()),
                _ => None,
            })
            .collect()
    }

    fn config() -> DetectorConfig {
        DetectorConfig {
            threshold: 2.5,
            quiet_count: 3,
            cooldown_ms: 0,
            min_distance_m: 0.0,
            pre_context_n: 2,
            post_context_n: 0,
            ..DetectorConfig::default()
        }
    }

    #[test]
    fn test_reference_sequence_unit() {
        let mut engine = DetectionEngine::new(config());
        let mut all = Vec::new();
        for r in readings_for_diffs(&[0.0, 1.0, 3.0, 3.2, 0.5, 0.4, 0.9, 0.3]) {
            all.extend(engine.feed_motion(&r));
        }
        let units = units(&all);
        assert_eq!(units.len(), 1);
        let ids: Vec<u64> = units[0].records.iter().map(|r| r.id).collect();
        // two pre-context samples, then the span 2..=6
        assert_eq!(ids, vec![0, 1, 2, 3, 4, 5, 6]);
        assert_eq!(units[0].records[0].kind, EventKind::Context);
        assert_eq!(units[0].records[2].kind, EventKind::Event);
        assert!(units[0].label.is_some());
        assert!(units[0].records.iter().all(|r| r.span_id == Some(1)));
    }

    #[test]
    fn test_first_sample_diff_is_zero_and_quiet() {
        let mut engine = DetectionEngine::new(config());
        let events = engine.feed_motion(&MotionReading::new(50.0, 50.0, 50.0, 0.0));
        assert!(events.is_empty());
        assert_eq!(engine.buffer().latest().map(|s| s.diff), Some(0.0));
        assert!(!engine.is_busy());
    }

    #[test]
    fn test_malformed_does_not_advance_previous() {
        let mut engine = DetectionEngine::new(config());
        engine.feed_motion(&MotionReading::new(0.0, 0.0, 10.0, 0.0));
        let bad = MotionReading {
            timestamp: 0.02,
            x: None,
            y: Some(0.0),
            z: Some(40.0),
        };
        let events = engine.feed_motion(&bad);
        assert!(matches!(events.as_slice(), [EngineEvent::MalformedDropped]));
        // diff measured against the last good reading
        engine.feed_motion(&MotionReading::new(0.0, 0.0, 11.0, 0.04));
        assert_eq!(engine.buffer().latest().map(|s| s.diff), Some(1.0));
        assert_eq!(engine.stats().malformed, 1);
        assert_eq!(engine.stats().samples, 2);
    }

    #[test]
    fn test_require_location_drops_until_fix() {
        let mut cfg = config();
        cfg.require_location = true;
        let mut engine = DetectionEngine::new(cfg);
        let events = engine.feed_motion(&MotionReading::new(0.0, 0.0, 10.0, 0.0));
        assert!(matches!(events.as_slice(), [EngineEvent::NoFixDropped]));
        engine.feed_location(LocationFix::new(35.0, 139.0, 0.01));
        engine.feed_motion(&MotionReading::new(0.0, 0.0, 10.0, 0.02));
        let latest = engine.buffer().latest().unwrap();
        assert!(latest.coordinate.is_some());
        assert_eq!(engine.stats().dropped_without_fix, 1);
    }

    #[test]
    fn test_readings_without_fix_leave_no_previous_magnitude() {
        let mut cfg = config();
        cfg.require_location = true;
        let mut engine = DetectionEngine::new(cfg);
        engine.feed_motion(&MotionReading::new(0.0, 0.0, 10.0, 0.0));
        engine.feed_location(LocationFix::new(35.0, 139.0, 0.01));
        let events = engine.feed_motion(&MotionReading::new(0.0, 0.0, 30.0, 0.02));

        let first = engine.buffer().latest().unwrap();
        assert_eq!(first.id, 0);
        assert_eq!(first.diff, 0.0);
        assert!(!engine.is_busy());
        assert!(!events.iter().any(|e| matches!(e, EngineEvent::SpanOpened { .. })));
        assert_eq!(engine.stats().spans_opened, 0);
    }

    #[test]
    fn test_non_finite_timestamp_is_malformed() {
        let mut engine = DetectionEngine::new(config());
        let events = engine.feed_motion(&MotionReading::new(0.0, 0.0, 10.0, f64::INFINITY));
        assert!(matches!(events.as_slice(), [EngineEvent::MalformedDropped]));
        assert_eq!(engine.stats().samples, 0);
        assert_eq!(engine.stats().malformed, 1);
    }

    #[test]
    fn test_point_mode_with_post_context() {
        let cfg = DetectorConfig {
            segment_mode: SegmentMode::Point,
            post_context_n: 2,
            ..config()
        };
        let mut engine = DetectionEngine::new(cfg);
        let mut all = Vec::new();
        for r in readings_for_diffs(&[0.0, 0.1, 0.1, 5.0, 0.2, 0.2, 0.1]) {
            all.extend(engine.feed_motion(&r));
        }
        let units = units(&all);
        assert_eq!(units.len(), 1);
        let kinds: Vec<(u64, EventKind)> =
            units[0].records.iter().map(|r| (r.id, r.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                (1, EventKind::Context),
                (2, EventKind::Context),
                (3, EventKind::Event),
                (4, EventKind::AfterContext),
                (5, EventKind::AfterContext),
            ]
        );
        assert!(all.iter().any(|e| matches!(e, EngineEvent::SpanOpened { span_id: 1, .. })));
        assert!(!engine.is_busy());
    }

    #[test]
    fn test_crossing_during_after_collection_flushes_early() {
        let cfg = DetectorConfig {
            segment_mode: SegmentMode::Point,
            post_context_n: 5,
            ..config()
        };
        let mut engine = DetectionEngine::new(cfg);
        let mut all = Vec::new();
        for r in readings_for_diffs(&[0.0, 4.0, 0.1, 4.0, 0.1]) {
            all.extend(engine.feed_motion(&r));
        }
        let units = units(&all);
        assert_eq!(units.len(), 1);
        let ids: Vec<u64> = units[0].records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        // second event is now collecting its own trailing context
        assert!(engine.is_busy());
        let rest = units_from(engine.finish());
        let ids: Vec<u64> = rest[0].records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![3, 4]);
    }

    fn units_from(events: Vec<EngineEvent>) -> Vec<FlushUnit> {
        units(&events)
    }

    #[test]
    fn test_finish_flushes_open_span() {
        let mut engine = DetectionEngine::new(config());
        for r in readings_for_diffs(&[0.0, 0.2, 4.0, 4.0, 0.1]) {
            engine.feed_motion(&r);
        }
        assert!(engine.segmenter().is_open());
        let units = units_from(engine.finish());
        assert_eq!(units.len(), 1);
        let ids: Vec<u64> = units[0].records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
        assert!(!engine.is_busy());
        assert!(engine.finish().is_empty());
    }

    #[test]
    fn test_periodic_candidate_suppressed_while_busy() {
        let mut engine = DetectionEngine::new(config());
        engine.feed_motion(&MotionReading::new(0.0, 0.0, 10.0, 0.0));
        let normal = engine.periodic_candidate().unwrap();
        assert_eq!(normal.kind, EventKind::Normal);
        assert_eq!(normal.id, 0);
        // Already claimed
        assert!(engine.periodic_candidate().is_none());

        engine.feed_motion(&MotionReading::new(0.0, 0.0, 15.0, 0.02));
        assert!(engine.is_busy());
        assert!(engine.periodic_candidate().is_none());
    }

    #[test]
    fn test_pre_context_excludes_claimed_samples() {
        let mut engine = DetectionEngine::new(DetectorConfig {
            pre_context_n: 5,
            ..config()
        });
        for r in readings_for_diffs(&[0.0, 0.1, 0.1]) {
            engine.feed_motion(&r);
        }
        // sample 2 written as Normal
        assert_eq!(engine.periodic_candidate().map(|r| r.id), Some(2));
        engine.feed_motion(&MotionReading::new(0.0, 0.0, 10.0, 0.06));
        engine.feed_motion(&MotionReading::new(0.0, 0.0, 20.0, 0.08));
        let units = units_from(engine.finish());
        let ids: Vec<u64> = units[0].records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![3, 4]);
    }
}
