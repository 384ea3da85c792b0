//! Event segmentation state machine.
//!
//! Watches the per-sample diff signal and groups threshold crossings into
//! event spans:
//!
//! ```text
//!   Idle ──diff > thr (gate admits)──▶ InEvent ◀──diff > thr── Draining
//!                                        │                       │  ▲
//!                                        └──────diff ≤ thr───────┘  │
//!                                                    diff ≤ thr ────┘
//!   Draining ──quiet streak reaches quiet_count──▶ Idle (span closed)
//! ```
//!
//! In point mode every admitted crossing is a one-sample span that closes
//! on the same tick; the state never leaves `Idle`.

use crate::config::SegmentMode;
use crate::gate::{EventGate, GateDecision};
use crate::types::{EventKind, Sample, SampleRecord};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmenterState {
    Idle,
    InEvent,
    Draining,
}

/// One physical occurrence. Owned by the segmenter while open.
#[derive(Clone, Debug)]
pub struct EventSpan {
    pub span_id: u64,
    pub started_at: f64,
    pub ended_at: Option<f64>,
    pub samples: Vec<SampleRecord>,
}

impl EventSpan {
    fn open(span_id: u64, trigger: &Sample) -> Self {
        let mut span = EventSpan {
            span_id,
            started_at: trigger.timestamp,
            ended_at: None,
            samples: Vec::new(),
        };
        span.append(trigger, EventKind::Event);
        span
    }

    fn append(&mut self, sample: &Sample, kind: EventKind) {
        let mut record = sample.tagged(kind);
        record.span_id = Some(self.span_id);
        self.samples.push(record);
    }

    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }

    pub fn ids(&self) -> Vec<u64> {
        self.samples.iter().map(|r| r.id).collect()
    }
}

#[derive(Debug)]
pub enum Transition {
    /// Sub-threshold while idle, or the session's first sample.
    Ignored,
    Rejected(GateDecision),
    Opened { span_id: u64 },
    Extended,
    Quiet { streak: usize },
    Resumed,
    Closed(EventSpan),
}

pub struct EventSegmenter {
    mode: SegmentMode,
    threshold: f64,
    quiet_count: usize,
    state: SegmenterState,
    quiet_streak: usize,
    current: Option<EventSpan>,
    next_span_id: u64,
}

impl EventSegmenter {
    pub fn new(mode: SegmentMode, threshold: f64, quiet_count: usize) -> Self {
        Self {
            mode,
            threshold,
            quiet_count: quiet_count.max(1),
            state: SegmenterState::Idle,
            quiet_streak: 0,
            current: None,
            next_span_id: 1,
        }
    }

    pub fn state(&self) -> SegmenterState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.current.is_some()
    }

    pub fn quiet_streak(&self) -> usize {
        self.quiet_streak
    }

    pub fn current(&self) -> Option<&EventSpan> {
        self.current.as_ref()
    }

    pub fn is_crossing(&self, diff: f64) -> bool {
        diff > self.threshold
    }

    /// Feed one sample. `first` marks the session's first sample, which can
    /// never open a span. The gate is consulted only when opening.
    pub fn observe(&mut self, sample: &Sample, first: bool, gate: &mut EventGate) -> Transition {
        let crossing = !first && self.is_crossing(sample.diff);

        match self.state {
            SegmenterState::Idle => {
                if !crossing {
                    return Transition::Ignored;
                }
                let decision = gate.admit(sample.timestamp, sample.coordinate);
                if !decision.is_admitted() {
                    return Transition::Rejected(decision);
                }
                let span_id = self.next_span_id;
                self.next_span_id += 1;
                let span = EventSpan::open(span_id, sample);

                match self.mode {
                    SegmentMode::Point => {
                        let mut span = span;
                        span.ended_at = Some(sample.timestamp);
                        Transition::Closed(span)
                    }
                    SegmentMode::Span => {
                        self.current = Some(span);
                        self.quiet_streak = 0;
                        self.state = SegmenterState::InEvent;
                        Transition::Opened { span_id }
                    }
                }
            }
            SegmenterState::InEvent | SegmenterState::Draining => {
                let Some(span) = self.current.as_mut() else {
                    // Unreachable while the invariants hold; recover to Idle.
                    self.state = SegmenterState::Idle;
                    self.quiet_streak = 0;
                    return Transition::Ignored;
                };

                if crossing {
                    span.append(sample, EventKind::Event);
                    self.quiet_streak = 0;
                    let resumed = self.state == SegmenterState::Draining;
                    self.state = SegmenterState::InEvent;
                    return if resumed {
                        Transition::Resumed
                    } else {
                        Transition::Extended
                    };
                }

                span.append(sample, EventKind::Context);
                self.quiet_streak += 1;
                if self.quiet_streak >= self.quiet_count {
                    self.close(sample.timestamp)
                        .map(Transition::Closed)
                        .unwrap_or(Transition::Ignored)
                } else {
                    self.state = SegmenterState::Draining;
                    Transition::Quiet {
                        streak: self.quiet_streak,
                    }
                }
            }
        }
    }

    /// Close whatever is open, e.g. on session stop.
    pub fn force_close(&mut self, timestamp: f64) -> Option<EventSpan> {
        self.close(timestamp)
    }

    fn close(&mut self, timestamp: f64) -> Option<EventSpan> {
        self.state = SegmenterState::Idle;
        self.quiet_streak = 0;
        let mut span = self.current.take()?;
        span.ended_at = Some(timestamp);
        Some(span)
    }
}
