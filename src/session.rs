//! Session lifecycle.
//!
//! A running session is two tokio tasks:
//!
//! * the **actor** owns the [`DetectionEngine`] and multiplexes the motion
//!   subscription, the location subscription, the periodic flush timer and
//!   the stop token. It never awaits storage.
//! * the **persistence worker** owns the [`PersistenceReconciler`] and
//!   drains an unbounded, ordered channel of flush commands, so records of
//!   one unit are written in sampling order and a stalled store never holds
//!   up sampling.
//!
//! `stop_session` cancels the actor, which drains readings already
//! delivered, releases its subscriptions, flushes whatever the engine still
//! holds and closes the channel. The worker then retries failed writes,
//! sweeps, and exits. `stop_session` returns only after both tasks have
//! finished.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::{DetectorConfig, SweepPolicy};
use crate::engine::{DetectionEngine, EngineEvent, EngineStats};
use crate::error::{TrackerError, TrackerResult};
use crate::reconciler::{PersistStats, PersistenceReconciler, SweepReport};
use crate::retention::FlushUnit;
use crate::source::{LocationSource, SensorSource, Subscription};
use crate::status::{SessionPhase, SessionStatus};
use crate::store::{MapSink, RecordStore};
use crate::types::{LocationFix, MotionReading, SampleRecord, SessionId};

#[derive(Clone, Debug, Serialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub duration_secs: f64,
    pub engine: EngineStats,
    pub persistence: PersistStats,
    pub sweep: Option<SweepReport>,
}

enum PersistCommand {
    Unit(FlushUnit),
    Periodic(SampleRecord),
}

struct ActiveSession {
    id: SessionId,
    started: Instant,
    cancel: CancellationToken,
    actor: JoinHandle<EngineStats>,
    worker: JoinHandle<(PersistStats, Option<SweepReport>)>,
}

/// Entry point for measurement sessions. At most one session runs at a
/// time; each session gets fresh engine and reconciler state.
pub struct Tracker<S, L, R, M> {
    config: DetectorConfig,
    sensor: Arc<S>,
    location: Arc<L>,
    store: Arc<R>,
    map: Arc<M>,
    status: Arc<watch::Sender<SessionStatus>>,
    active: Option<ActiveSession>,
}

impl<S, L, R, M> Tracker<S, L, R, M>
where
    S: SensorSource,
    L: LocationSource,
    R: RecordStore,
    M: MapSink,
{
    pub fn new(
        config: DetectorConfig,
        sensor: Arc<S>,
        location: Arc<L>,
        store: Arc<R>,
        map: Arc<M>,
    ) -> Self {
        let (status, _) = watch::channel(SessionStatus::new());
        Self {
            config,
            sensor,
            location,
            store,
            map,
            status: Arc::new(status),
            active: None,
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.active.as_ref().map(|a| &a.id)
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn on_status_change(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Invoke `callback` with every status change until the tracker is gone.
    pub fn on_status_change_with<F>(&self, mut callback: F) -> JoinHandle<()>
    where
        F: FnMut(&SessionStatus) + Send + 'static,
    {
        let mut rx = self.status.subscribe();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let snapshot = rx.borrow_and_update().clone();
                callback(&snapshot);
            }
        })
    }

    pub fn start_session(&mut self) -> TrackerResult<SessionId> {
        if self.active.is_some() {
            return Err(TrackerError::AlreadyRunning);
        }
        self.config.validate()?;

        let motion = match self.sensor.subscribe() {
            Ok(sub) => sub,
            Err(e) => {
                self.set_message(format!("cannot start: {e}"));
                return Err(e);
            }
        };
        let location = match self.location.subscribe() {
            Ok(sub) => Some(sub),
            Err(e) if self.config.require_location => {
                self.set_message(format!("cannot start: {e}"));
                // `motion` drops here and releases the sensor
                return Err(e);
            }
            Err(e) => {
                log::warn!("starting without location updates: {}", e);
                None
            }
        };

        let id = SessionId::from_start(Utc::now());
        let cancel = CancellationToken::new();
        let (persist_tx, persist_rx) = mpsc::unbounded_channel();

        self.status.send_replace(SessionStatus::running(id.clone()));

        let reconciler =
            PersistenceReconciler::new(Arc::clone(&self.store), Arc::clone(&self.map), id.clone());
        let worker = tokio::spawn(persistence_worker(
            reconciler,
            Arc::clone(&self.location),
            self.config.jit_fix_timeout_ms.map(Duration::from_millis),
            self.config.sweep,
            persist_rx,
            Arc::clone(&self.status),
        ));

        let actor = SessionActor {
            engine: DetectionEngine::new(self.config.clone()),
            persist_tx,
            status: Arc::clone(&self.status),
            started: Instant::now(),
        };
        let actor = tokio::spawn(actor.run(
            motion,
            location,
            Duration::from_millis(self.config.periodic_flush_ms),
            cancel.clone(),
        ));

        log::info!("session {} started", id);
        self.active = Some(ActiveSession {
            id: id.clone(),
            started: Instant::now(),
            cancel,
            actor,
            worker,
        });
        Ok(id)
    }

    /// Stop the running session. Resolves after the final flush and sweep.
    pub async fn stop_session(&mut self) -> TrackerResult<SessionSummary> {
        let active = self.active.take().ok_or(TrackerError::NotRunning)?;
        self.status.send_modify(|s| {
            s.phase = SessionPhase::Stopping;
            s.message = "finishing writes".to_string();
            s.touch();
        });

        active.cancel.cancel();
        let engine = active
            .actor
            .await
            .map_err(|e| TrackerError::Internal(format!("session actor failed: {e}")))?;
        let (persistence, sweep) = active
            .worker
            .await
            .map_err(|e| TrackerError::Internal(format!("persistence worker failed: {e}")))?;

        let duration_secs = active.started.elapsed().as_secs_f64();
        self.status.send_modify(|s| {
            s.phase = SessionPhase::Stopped;
            s.in_event = false;
            s.uptime_seconds = duration_secs;
            s.message = format!("stopped ({})", active.id);
            s.touch();
        });
        log::info!(
            "session {} stopped: {} samples, {} events, {} records written",
            active.id,
            engine.samples,
            engine.spans_opened,
            persistence.written
        );

        Ok(SessionSummary {
            session_id: active.id,
            duration_secs,
            engine,
            persistence,
            sweep,
        })
    }

    fn set_message(&self, message: String) {
        self.status.send_modify(|s| {
            s.message = message;
            s.touch();
        });
    }
}

impl<S, L, R, M> Drop for Tracker<S, L, R, M> {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.cancel.cancel();
        }
    }
}

// ===== Actor =====

struct SessionActor {
    engine: DetectionEngine,
    persist_tx: mpsc::UnboundedSender<PersistCommand>,
    status: Arc<watch::Sender<SessionStatus>>,
    started: Instant,
}

async fn next_fix(location: &mut Option<Subscription<LocationFix>>) -> Option<LocationFix> {
    match location {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

impl SessionActor {
    async fn run(
        mut self,
        mut motion: Subscription<MotionReading>,
        mut location: Option<Subscription<LocationFix>>,
        period: Duration,
        cancel: CancellationToken,
    ) -> EngineStats {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        let mut motion_open = true;
        let mut location_open = location.is_some();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                reading = motion.recv(), if motion_open => match reading {
                    Some(reading) => self.on_motion(reading),
                    None => {
                        log::info!("motion source closed");
                        motion_open = false;
                    }
                },
                fix = next_fix(&mut location), if location_open => match fix {
                    Some(fix) => self.on_fix(fix),
                    None => location_open = false,
                },
                _ = ticker.tick() => self.on_tick(),
            }
        }

        // Readings delivered before the stop still belong to the session
        if let Some(sub) = location.as_mut() {
            while let Some(fix) = sub.try_recv() {
                self.on_fix(fix);
            }
        }
        while let Some(reading) = motion.try_recv() {
            self.on_motion(reading);
        }
        drop(motion);
        drop(location);

        for event in self.engine.finish() {
            self.dispatch(event);
        }
        self.publish_stats();
        self.engine.stats().clone()
    }

    fn on_motion(&mut self, reading: MotionReading) {
        for event in self.engine.feed_motion(&reading) {
            self.dispatch(event);
        }
        self.publish_stats();
    }

    fn on_fix(&mut self, fix: LocationFix) {
        let (lat, lng) = (fix.latitude, fix.longitude);
        self.engine.feed_location(fix);
        self.status.send_modify(|s| {
            s.location_fixes += 1;
            s.last_lat = Some(lat);
            s.last_lng = Some(lng);
        });
    }

    fn on_tick(&mut self) {
        if let Some(record) = self.engine.periodic_candidate() {
            self.send(PersistCommand::Periodic(record));
        }
    }

    fn dispatch(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::MalformedDropped | EngineEvent::NoFixDropped => {}
            EngineEvent::GateRejected { timestamp, decision } => {
                log::debug!("gate rejected candidate at {:.3}: {:?}", timestamp, decision);
            }
            EngineEvent::SpanOpened {
                span_id,
                timestamp,
                diff,
            } => {
                log::debug!("span {} opened at {:.3} (diff {:.2})", span_id, timestamp, diff);
            }
            EngineEvent::SpanClosed { span_id, samples } => {
                log::debug!("span {} closed with {} samples", span_id, samples);
            }
            EngineEvent::UnitReady(unit) => {
                let label = unit.label;
                self.send(PersistCommand::Unit(unit));
                self.status.send_modify(|s| s.last_label = label);
            }
        }
    }

    fn send(&self, command: PersistCommand) {
        if self.persist_tx.send(command).is_err() {
            log::error!("persistence worker is gone; dropping flush");
        }
    }

    fn publish_stats(&self) {
        let stats = self.engine.stats();
        let in_event = self.engine.is_busy();
        let uptime = self.started.elapsed().as_secs_f64();
        self.status.send_modify(|s| {
            s.samples = stats.samples;
            s.malformed = stats.malformed;
            s.dropped_without_fix = stats.dropped_without_fix;
            s.events_detected = stats.spans_opened;
            s.gate_rejections = stats.gate_rejections;
            s.in_event = in_event;
            s.uptime_seconds = uptime;
            s.touch();
        });
    }
}

// ===== Persistence worker =====

async fn persistence_worker<R, M, L>(
    mut reconciler: PersistenceReconciler<R, M>,
    location: Arc<L>,
    jit_timeout: Option<Duration>,
    sweep: SweepPolicy,
    mut rx: mpsc::UnboundedReceiver<PersistCommand>,
    status: Arc<watch::Sender<SessionStatus>>,
) -> (PersistStats, Option<SweepReport>)
where
    R: RecordStore,
    M: MapSink,
    L: LocationSource,
{
    while let Some(command) = rx.recv().await {
        match command {
            PersistCommand::Unit(mut unit) => {
                if let Some(timeout) = jit_timeout {
                    join_fix(&mut unit, location.as_ref(), timeout).await;
                }
                reconciler.flush_unit(&unit).await;
                reconciler.place_marker(&unit).await;
                publish_persist(&status, reconciler.stats(), true);
            }
            PersistCommand::Periodic(record) => {
                reconciler.persist_periodic(record).await;
                publish_persist(&status, reconciler.stats(), false);
            }
        }
    }

    // Channel closed: the actor has flushed everything it held
    let report = reconciler.finish(sweep).await;
    publish_persist(&status, reconciler.stats(), false);
    (reconciler.stats().clone(), report)
}

/// Fill coordinate-less records of `unit` with a fresh fix, bounded by
/// `timeout`. On timeout the unit is written without location.
async fn join_fix<L: LocationSource>(unit: &mut FlushUnit, location: &L, timeout: Duration) {
    let needs_fix = unit
        .trigger()
        .map(|t| t.coordinate().is_none())
        .unwrap_or(false);
    if !needs_fix {
        return;
    }
    match tokio::time::timeout(timeout, location.current()).await {
        Ok(Some(fix)) => {
            let coordinate = fix.coordinate();
            for record in unit.records.iter_mut().filter(|r| r.coordinate().is_none()) {
                record.set_coordinate(coordinate);
            }
        }
        Ok(None) => log::debug!("span {}: no fix available", unit.span_id),
        Err(_) => log::warn!(
            "span {}: location lookup timed out after {:?}, writing without location",
            unit.span_id,
            timeout
        ),
    }
}

fn publish_persist(status: &watch::Sender<SessionStatus>, stats: &PersistStats, unit: bool) {
    let stats = stats.clone();
    status.send_modify(|s| {
        if unit {
            s.units_flushed += 1;
        }
        s.records_written = stats.written;
        s.write_failures = stats.failed_writes;
        s.markers_placed = stats.markers_placed;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SegmentMode;
    use crate::error::StoreError;
    use crate::source::{LocationFeed, MotionFeed};
    use crate::store::{MemoryMap, MemoryStore};
    use crate::types::{Coordinate, EventKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Semaphore;

    type TestTracker<L> = Tracker<MotionFeed, L, MemoryStore, MemoryMap>;

    struct Rig<L> {
        motion: MotionFeed,
        store: Arc<MemoryStore>,
        map: Arc<MemoryMap>,
        tracker: TestTracker<L>,
    }

    fn rig_with<L: LocationSource>(config: DetectorConfig, location: L) -> Rig<L> {
        let motion = MotionFeed::new();
        let store = Arc::new(MemoryStore::new());
        let map = Arc::new(MemoryMap::new());
        let tracker = Tracker::new(
            config,
            Arc::new(motion.clone()),
            Arc::new(location),
            store.clone(),
            map.clone(),
        );
        Rig {
            motion,
            store,
            map,
            tracker,
        }
    }

    fn config() -> DetectorConfig {
        DetectorConfig {
            threshold: 2.5,
            quiet_count: 3,
            cooldown_ms: 0,
            min_distance_m: 0.0,
            pre_context_n: 2,
            post_context_n: 0,
            periodic_flush_ms: 60_000,
            sweep: SweepPolicy::Off,
            ..DetectorConfig::default()
        }
    }

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

    /// Location source with no stream and a fixed one-shot answer.
    struct OneShotFix {
        fix: LocationFix,
        delay: Duration,
    }

    impl LocationSource for OneShotFix {
        fn subscribe(&self) -> TrackerResult<Subscription<LocationFix>> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(Subscription::new(rx, || {}))
        }

        async fn current(&self) -> Option<LocationFix> {
            tokio::time::sleep(self.delay).await;
            Some(self.fix.clone())
        }
    }

    /// Store whose writes wait at a gate until the test opens it.
    struct GatedStore {
        inner: MemoryStore,
        gate: Semaphore,
        waiting: AtomicUsize,
    }

    impl GatedStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                gate: Semaphore::new(0),
                waiting: AtomicUsize::new(0),
            }
        }

        fn open(&self) {
            self.gate.add_permits(1);
        }

        /// Writes currently held at the gate.
        fn waiting(&self) -> usize {
            self.waiting.load(Ordering::SeqCst)
        }

        async fn pass(&self) -> Result<(), StoreError> {
            self.waiting.fetch_add(1, Ordering::SeqCst);
            let permit = self.gate.acquire().await;
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            permit
                .map(drop)
                .map_err(|_| StoreError::Write("gate closed".to_string()))
        }
    }

    impl RecordStore for GatedStore {
        async fn write_one(
            &self,
            session: &SessionId,
            record: &SampleRecord,
        ) -> Result<(), StoreError> {
            self.pass().await?;
            self.inner.write_one(session, record).await
        }

        async fn write_batch(
            &self,
            session: &SessionId,
            records: &[SampleRecord],
        ) -> Result<(), StoreError> {
            self.pass().await?;
            self.inner.write_batch(session, records).await
        }

        async fn read_all(&self, session: &SessionId) -> Result<Vec<SampleRecord>, StoreError> {
            self.inner.read_all(session).await
        }

        async fn delete_one(&self, session: &SessionId, id: u64) -> Result<(), StoreError> {
            self.inner.delete_one(session, id).await
        }
    }

    fn gated_tracker(
        config: DetectorConfig,
    ) -> (
        MotionFeed,
        Arc<GatedStore>,
        Tracker<MotionFeed, LocationFeed, GatedStore, MemoryMap>,
    ) {
        let motion = MotionFeed::new();
        let store = Arc::new(GatedStore::new());
        let tracker = Tracker::new(
            config,
            Arc::new(motion.clone()),
            Arc::new(LocationFeed::new()),
            store.clone(),
            Arc::new(MemoryMap::new()),
        );
        (motion, store, tracker)
    }

    #[tokio::test]
    async fn test_stop_flushes_open_span() {
        let mut rig = rig_with(config(), LocationFeed::new());
        let id = rig.tracker.start_session().unwrap();
        for r in readings_for_diffs(&[0.0, 0.2, 4.0, 4.0, 0.1]) {
            rig.motion.send(r).await;
        }
        let summary = rig.tracker.stop_session().await.unwrap();

        assert_eq!(summary.session_id, id);
        assert_eq!(summary.engine.samples, 5);
        assert_eq!(summary.engine.units_ready, 1);
        let records = rig.store.records(&id);
        let ids: Vec<u64> = records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
        assert!(records.iter().all(|r| r.span_id == Some(1)));
        assert_eq!(records[2].kind, EventKind::Event);
        assert!(!rig.tracker.is_running());
        // subscription released on stop
        assert_eq!(rig.motion.feed().subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_flushes_after_context_collection() {
        let cfg = DetectorConfig {
            segment_mode: SegmentMode::Point,
            post_context_n: 10,
            ..config()
        };
        let mut rig = rig_with(cfg, LocationFeed::new());
        let id = rig.tracker.start_session().unwrap();
        for r in readings_for_diffs(&[0.0, 0.1, 5.0, 0.1, 0.1]) {
            rig.motion.send(r).await;
        }
        rig.tracker.stop_session().await.unwrap();

        let kinds: Vec<(u64, EventKind)> = rig
            .store
            .records(&id)
            .iter()
            .map(|r| (r.id, r.kind))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (0, EventKind::Context),
                (1, EventKind::Context),
                (2, EventKind::Event),
                (3, EventKind::AfterContext),
                (4, EventKind::AfterContext),
            ]
        );
    }

    #[tokio::test]
    async fn test_permission_denied_does_not_start() {
        let mut rig = rig_with(config(), LocationFeed::new());
        rig.motion.feed().set_permission(false);
        let err = rig.tracker.start_session().unwrap_err();
        assert!(matches!(err, TrackerError::SensorUnavailable(_)));
        assert!(!rig.tracker.is_running());
        assert!(rig.tracker.status().message.starts_with("cannot start"));
        assert!(matches!(
            rig.tracker.stop_session().await,
            Err(TrackerError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_required_location_denied_releases_motion() {
        let cfg = DetectorConfig {
            require_location: true,
            ..config()
        };
        let location = LocationFeed::new();
        location.feed().set_permission(false);
        let mut rig = rig_with(cfg, location);
        assert!(rig.tracker.start_session().is_err());
        assert_eq!(rig.motion.feed().subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let mut rig = rig_with(config(), LocationFeed::new());
        rig.tracker.start_session().unwrap();
        assert!(matches!(
            rig.tracker.start_session(),
            Err(TrackerError::AlreadyRunning)
        ));
        rig.tracker.stop_session().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_writes_latest_sample_once() {
        let cfg = DetectorConfig {
            periodic_flush_ms: 20,
            ..config()
        };
        let mut rig = rig_with(cfg, LocationFeed::new());
        let id = rig.tracker.start_session().unwrap();
        rig.motion.send(MotionReading::new(0.0, 0.0, 9.8, 0.0)).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        let summary = rig.tracker.stop_session().await.unwrap();

        assert_eq!(rig.store.copies_of(&id, 0), 1);
        let records = rig.store.records(&id);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, EventKind::Normal);
        assert_eq!(summary.persistence.written, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_location_joins_samples_and_places_marker() {
        let location = LocationFeed::new();
        let mut rig = rig_with(config(), location.clone());
        let id = rig.tracker.start_session().unwrap();
        location.send(LocationFix::new(35.0, 139.0, 0.0)).await;
        // Let the actor take the fix before motion arrives
        tokio::time::sleep(Duration::from_millis(20)).await;
        for r in readings_for_diffs(&[0.0, 0.1, 9.0, 0.1, 0.1, 0.1]) {
            rig.motion.send(r).await;
        }
        rig.tracker.stop_session().await.unwrap();

        let records = rig.store.records(&id);
        assert!(records
            .iter()
            .all(|r| r.coordinate() == Some(Coordinate::new(35.0, 139.0))));
        let markers = rig.map.markers();
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].coordinate, Coordinate::new(35.0, 139.0));
        assert_eq!(rig.tracker.status().location_fixes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_jit_fix_fills_unlocated_unit() {
        let cfg = DetectorConfig {
            jit_fix_timeout_ms: Some(500),
            ..config()
        };
        let source = OneShotFix {
            fix: LocationFix::new(48.85, 2.35, 0.0),
            delay: Duration::from_millis(5),
        };
        let mut rig = rig_with(cfg, source);
        let id = rig.tracker.start_session().unwrap();
        for r in readings_for_diffs(&[0.0, 0.1, 9.0, 0.1, 0.1, 0.1]) {
            rig.motion.send(r).await;
        }
        rig.tracker.stop_session().await.unwrap();

        assert!(rig
            .store
            .records(&id)
            .iter()
            .all(|r| r.coordinate() == Some(Coordinate::new(48.85, 2.35))));
        assert_eq!(rig.map.markers().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_jit_timeout_writes_without_location() {
        let cfg = DetectorConfig {
            jit_fix_timeout_ms: Some(10),
            ..config()
        };
        let source = OneShotFix {
            fix: LocationFix::new(48.85, 2.35, 0.0),
            delay: Duration::from_secs(5),
        };
        let mut rig = rig_with(cfg, source);
        let id = rig.tracker.start_session().unwrap();
        for r in readings_for_diffs(&[0.0, 0.1, 9.0, 0.1, 0.1, 0.1]) {
            rig.motion.send(r).await;
        }
        rig.tracker.stop_session().await.unwrap();

        let records = rig.store.records(&id);
        assert_eq!(records.len(), 6);
        assert!(records.iter().all(|r| r.coordinate().is_none()));
        assert!(rig.map.markers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_does_not_abort_session() {
        let mut rig = rig_with(config(), LocationFeed::new());
        rig.store.set_fail_writes(true);
        let id = rig.tracker.start_session().unwrap();
        for r in readings_for_diffs(&[0.0, 0.1, 9.0, 0.1, 0.1, 0.1]) {
            rig.motion.send(r).await;
        }
        // Store recovers before the end-of-session retry
        tokio::time::sleep(Duration::from_millis(50)).await;
        rig.store.set_fail_writes(false);
        let summary = rig.tracker.stop_session().await.unwrap();

        assert_eq!(summary.persistence.retried, 6);
        assert_eq!(rig.store.records(&id).len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_observers() {
        let mut rig = rig_with(config(), LocationFeed::new());
        let mut rx = rig.tracker.on_status_change();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _observer = rig
            .tracker
            .on_status_change_with(move |s| sink.lock().unwrap().push(s.phase));

        rig.tracker.start_session().unwrap();
        assert_eq!(rx.borrow_and_update().phase, SessionPhase::Running);
        rig.motion.send(MotionReading::new(0.0, 0.0, 9.8, 0.0)).await;
        rig.tracker.stop_session().await.unwrap();

        let last = rx.borrow_and_update().clone();
        assert_eq!(last.phase, SessionPhase::Stopped);
        assert_eq!(last.samples, 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let phases = seen.lock().unwrap().clone();
        assert_eq!(phases.last(), Some(&SessionPhase::Stopped));
    }

    #[tokio::test]
    async fn test_stalled_store_does_not_drop_readings() {
        let cfg = DetectorConfig {
            quiet_count: 1,
            ..config()
        };
        let (motion, store, mut tracker) = gated_tracker(cfg);
        let id = tracker.start_session().unwrap();

        // 1000 one-crossing spans, far more flush units than any queue bound
        let mut diffs = vec![0.0];
        for _ in 0..1000 {
            diffs.extend([5.0, 0.1]);
        }
        for chunk in readings_for_diffs(&diffs).chunks(50) {
            for reading in chunk {
                assert_eq!(motion.publish(reading.clone()), 1);
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(store.waiting(), 1);
        assert!(store.inner.records(&id).is_empty());
        assert_eq!(motion.feed().dropped(), 0);

        store.open();
        let summary = tracker.stop_session().await.unwrap();
        assert_eq!(summary.engine.samples, 2001);
        assert_eq!(summary.engine.units_ready, 1000);
        let records = store.inner.records(&id);
        assert_eq!(records.len(), 2001);
        assert!(records.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[tokio::test]
    async fn test_stop_waits_for_pending_batch() {
        let (motion, store, mut tracker) = gated_tracker(config());
        let id = tracker.start_session().unwrap();
        for r in readings_for_diffs(&[0.0, 0.1, 9.0, 0.1, 0.1, 0.1]) {
            motion.send(r).await;
        }
        while store.waiting() == 0 {
            tokio::task::yield_now().await;
        }

        let stop = tokio::spawn(async move { tracker.stop_session().await });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!stop.is_finished());
        assert!(store.inner.records(&id).is_empty());

        store.open();
        let summary = stop.await.unwrap().unwrap();
        assert_eq!(summary.persistence.written, 6);
        let ids: Vec<u64> = store.inner.records(&id).iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4, 5]);
    }
}
