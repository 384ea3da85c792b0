use std::collections::VecDeque;

use crate::types::{EventKind, Label, Sample, SampleRecord};

/// Fixed-capacity FIFO of the most recent samples.
///
/// Read-only context for the segmenter and reconciler; it never writes
/// anything itself.
pub struct RetentionBuffer {
    window: VecDeque<Sample>,
    capacity: usize,
}

impl RetentionBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        RetentionBuffer {
            window: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, sample: Sample) {
        self.window.push_back(sample);
        while self.window.len() > self.capacity {
            self.window.pop_front();
        }
    }

    /// Most recent `n` samples, oldest first, optionally skipping one id.
    pub fn last_n(&self, n: usize, exclude: Option<u64>) -> Vec<Sample> {
        let mut picked: Vec<Sample> = self
            .window
            .iter()
            .rev()
            .filter(|s| Some(s.id) != exclude)
            .take(n)
            .cloned()
            .collect();
        picked.reverse();
        picked
    }

    pub fn latest(&self) -> Option<&Sample> {
        self.window.back()
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.window.clear();
    }
}

/// A closed span (or point event) waiting for its trailing context.
#[derive(Clone, Debug)]
pub struct FlushUnit {
    pub span_id: u64,
    pub records: Vec<SampleRecord>,
    pub label: Option<Label>,
}

impl FlushUnit {
    pub fn new(span_id: u64, records: Vec<SampleRecord>) -> Self {
        FlushUnit {
            span_id,
            records,
            label: None,
        }
    }

    /// The first Event-tagged record.
    pub fn trigger(&self) -> Option<&SampleRecord> {
        self.records.iter().find(|r| r.kind == EventKind::Event)
    }

    pub fn peak_magnitude(&self) -> f64 {
        self.records
            .iter()
            .filter(|r| r.kind == EventKind::Event)
            .map(|r| r.magnitude)
            .fold(0.0, f64::max)
    }

    pub fn last_id(&self) -> Option<u64> {
        self.records.iter().map(|r| r.id).max()
    }
}

/// Gathers the K samples that follow an event before releasing the unit.
pub struct AfterCollector {
    unit: FlushUnit,
    remaining: usize,
}

impl AfterCollector {
    pub fn new(unit: FlushUnit, count: usize) -> Self {
        AfterCollector {
            unit,
            remaining: count,
        }
    }

    /// Appends `sample` as trailing context. Returns true once full.
    pub fn push(&mut self, sample: &Sample) -> bool {
        if self.remaining > 0 {
            let mut record = sample.tagged(EventKind::AfterContext);
            record.span_id = Some(self.unit.span_id);
            self.unit.records.push(record);
            self.remaining -= 1;
        }
        self.remaining == 0
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn span_id(&self) -> u64 {
        self.unit.span_id
    }

    pub fn finish(self) -> FlushUnit {
        self.unit
    }
}
