use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::Serialize;

use crate::config::SweepPolicy;
use crate::error::StoreError;
use crate::retention::FlushUnit;
use crate::store::{MapSink, RecordStore};
use crate::types::{EventKind, Label, MarkerRecord, SampleRecord, SessionId};

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PersistStats {
    pub written: u64,
    pub skipped_saved: u64,
    pub failed_writes: u64,
    pub retried: u64,
    pub markers_placed: u64,
    pub marker_failures: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub kept: usize,
    pub deleted: usize,
    pub failed: usize,
}

/// Keep/delete partition of a session's persisted records.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepPlan {
    pub keep: Vec<u64>,
    pub delete: Vec<u64>,
}

/// Partition persisted records by policy.
///
/// Event, Context and AfterContext records are always kept. Normal records
/// are grouped into uninterrupted runs in id order; `Decimate { every: k }`
/// keeps the k-th, 2k-th, ... record of each run (1-based), `DropNormal`
/// keeps none and `Off` keeps all.
pub fn plan_sweep(records: &[SampleRecord], policy: SweepPolicy) -> SweepPlan {
    // Collapse at-least-once duplicates; a retained kind wins over Normal
    let mut by_id: BTreeMap<u64, EventKind> = BTreeMap::new();
    for record in records {
        by_id
            .entry(record.id)
            .and_modify(|kind| {
                if record.kind.is_retained() {
                    *kind = record.kind;
                }
            })
            .or_insert(record.kind);
    }

    let mut plan = SweepPlan::default();
    let mut run_position = 0usize;

    for (id, kind) in by_id {
        if kind.is_retained() {
            run_position = 0;
            plan.keep.push(id);
            continue;
        }
        run_position += 1;
        let keep = match policy {
            SweepPolicy::Off => true,
            SweepPolicy::DropNormal => false,
            SweepPolicy::Decimate { every } => every > 0 && run_position % every == 0,
        };
        if keep {
            plan.keep.push(id);
        } else {
            plan.delete.push(id);
        }
    }

    plan
}

/// Re-read a session and delete what the policy does not keep.
pub async fn sweep_session<S: RecordStore>(
    store: &S,
    session: &SessionId,
    policy: SweepPolicy,
) -> Result<SweepReport, StoreError> {
    let records = store.read_all(session).await?;
    let plan = plan_sweep(&records, policy);

    let mut report = SweepReport {
        kept: plan.keep.len(),
        ..SweepReport::default()
    };
    for id in plan.delete {
        match store.delete_one(session, id).await {
            Ok(()) => report.deleted += 1,
            Err(e) => {
                log::warn!("sweep: delete of record {} in {} failed: {}", id, session, e);
                report.failed += 1;
            }
        }
    }
    Ok(report)
}

/// Marker for a finished unit: trigger coordinate, label, peak magnitude.
pub fn marker_for(unit: &FlushUnit) -> Option<MarkerRecord> {
    let trigger = unit.trigger()?;
    let coordinate = trigger.coordinate()?;
    Some(MarkerRecord {
        coordinate,
        label: unit.label.unwrap_or(Label::Flat),
        magnitude: unit.peak_magnitude(),
        timestamp: trigger.timestamp,
    })
}

/// Tracks what a session has written and reconciles it with the store.
///
/// The saved set makes every write path idempotent per sample id. A failed
/// write leaves its records unsaved on a retry list that is replayed once
/// at session end, before the sweep.
pub struct PersistenceReconciler<S, M> {
    store: Arc<S>,
    map: Arc<M>,
    session: SessionId,
    saved: HashSet<u64>,
    retry: BTreeMap<u64, SampleRecord>,
    stats: PersistStats,
}

impl<S: RecordStore, M: MapSink> PersistenceReconciler<S, M> {
    pub fn new(store: Arc<S>, map: Arc<M>, session: SessionId) -> Self {
        Self {
            store,
            map,
            session,
            saved: HashSet::new(),
            retry: BTreeMap::new(),
            stats: PersistStats::default(),
        }
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn stats(&self) -> &PersistStats {
        &self.stats
    }

    pub fn is_saved(&self, id: u64) -> bool {
        self.saved.contains(&id)
    }

    pub fn pending_retry(&self) -> usize {
        self.retry.len()
    }

    /// Write every unsaved record of `unit` as one batch, in unit order.
    /// Returns the number of records written.
    pub async fn flush_unit(&mut self, unit: &FlushUnit) -> usize {
        let pending: Vec<SampleRecord> = unit
            .records
            .iter()
            .filter(|r| !self.saved.contains(&r.id))
            .cloned()
            .collect();
        self.stats.skipped_saved += (unit.records.len() - pending.len()) as u64;
        if pending.is_empty() {
            return 0;
        }

        match self.store.write_batch(&self.session, &pending).await {
            Ok(()) => {
                let n = pending.len();
                self.mark_saved(&pending);
                log::debug!("span {}: wrote {} records", unit.span_id, n);
                n
            }
            Err(e) => {
                log::warn!(
                    "span {}: batch write of {} records failed: {}",
                    unit.span_id,
                    pending.len(),
                    e
                );
                self.stats.failed_writes += pending.len() as u64;
                for record in pending {
                    self.retry.insert(record.id, record);
                }
                0
            }
        }
    }

    /// Write one Normal record from the periodic timer.
    pub async fn persist_periodic(&mut self, record: SampleRecord) -> bool {
        if self.saved.contains(&record.id) {
            self.stats.skipped_saved += 1;
            return false;
        }
        match self.store.write_one(&self.session, &record).await {
            Ok(()) => {
                self.mark_saved(std::slice::from_ref(&record));
                true
            }
            Err(e) => {
                log::warn!("periodic write of record {} failed: {}", record.id, e);
                self.stats.failed_writes += 1;
                self.retry.insert(record.id, record);
                false
            }
        }
    }

    /// Place the unit's marker, if it has a located trigger.
    pub async fn place_marker(&mut self, unit: &FlushUnit) -> Option<MarkerRecord> {
        let marker = marker_for(unit)?;
        match self.map.place_marker(&marker).await {
            Ok(()) => {
                self.stats.markers_placed += 1;
                Some(marker)
            }
            Err(e) => {
                log::warn!("span {}: marker placement failed: {}", unit.span_id, e);
                self.stats.marker_failures += 1;
                None
            }
        }
    }

    /// One more attempt at every record whose write failed.
    pub async fn retry_failed(&mut self) -> usize {
        if self.retry.is_empty() {
            return 0;
        }
        let pending: Vec<SampleRecord> = std::mem::take(&mut self.retry)
            .into_values()
            .filter(|r| !self.saved.contains(&r.id))
            .collect();
        if pending.is_empty() {
            return 0;
        }

        match self.store.write_batch(&self.session, &pending).await {
            Ok(()) => {
                let n = pending.len();
                self.mark_saved(&pending);
                self.stats.retried += n as u64;
                log::info!("retried {} previously failed records", n);
                n
            }
            Err(e) => {
                log::warn!("retry of {} records failed, giving up: {}", pending.len(), e);
                self.stats.failed_writes += pending.len() as u64;
                for record in pending {
                    self.retry.insert(record.id, record);
                }
                0
            }
        }
    }

    /// End of session: retry failures, then sweep. `None` when the sweep
    /// could not read the session back.
    pub async fn finish(&mut self, policy: SweepPolicy) -> Option<SweepReport> {
        self.retry_failed().await;
        if policy == SweepPolicy::Off {
            return None;
        }
        match sweep_session(self.store.as_ref(), &self.session, policy).await {
            Ok(report) => {
                log::info!(
                    "sweep {}: kept {}, deleted {}, failed {}",
                    self.session,
                    report.kept,
                    report.deleted,
                    report.failed
                );
                Some(report)
            }
            Err(e) => {
                log::warn!("sweep {}: read back failed: {}", self.session, e);
                None
            }
        }
    }

    fn mark_saved(&mut self, records: &[SampleRecord]) {
        for record in records {
            self.saved.insert(record.id);
            self.retry.remove(&record.id);
        }
        self.stats.written += records.len() as u64;
    }
}
