//! Sensor and location capabilities consumed by a session.
//!
//! Each push source hands out a [`Subscription`]: an ordered channel of
//! readings whose release hook runs when the subscription is dropped, so a
//! session releases its sensors on every exit path.

use std::fs::File;
use std::future::Future;
use std::io::BufReader;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use flate2::read::GzDecoder;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{TrackerError, TrackerResult};
use crate::types::{LocationFix, MotionReading};

const DEFAULT_FEED_CAPACITY: usize = 1024;

// ===== Subscription =====

pub struct Subscription<T> {
    rx: mpsc::Receiver<T>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl<T> Subscription<T> {
    pub fn new(rx: mpsc::Receiver<T>, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            rx,
            release: Some(Box::new(release)),
        }
    }

    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

// ===== Capabilities =====

pub trait SensorSource: Send + Sync + 'static {
    fn subscribe(&self) -> TrackerResult<Subscription<MotionReading>>;
}

pub trait LocationSource: Send + Sync + 'static {
    fn subscribe(&self) -> TrackerResult<Subscription<LocationFix>>;

    /// One-shot request for a fresh fix.
    fn current(&self) -> impl Future<Output = Option<LocationFix>> + Send;
}

// ===== Push hub =====

struct FeedInner<T> {
    subscribers: Mutex<Vec<(u64, mpsc::Sender<T>)>>,
    next_id: AtomicU64,
    permitted: AtomicBool,
    capacity: usize,
    dropped: AtomicU64,
}

/// Fan-out hub for pushed readings. Cloning shares the hub.
pub struct Feed<T> {
    inner: Arc<FeedInner<T>>,
}

impl<T> Clone for Feed<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Feed<T> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_FEED_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(FeedInner {
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
                permitted: AtomicBool::new(true),
                capacity: capacity.max(1),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    pub fn set_permission(&self, granted: bool) {
        self.inner.permitted.store(granted, Ordering::SeqCst);
    }

    pub fn is_permitted(&self) -> bool {
        self.inner.permitted.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Readings discarded because a subscriber's queue was full.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    fn attach(&self, what: &str) -> TrackerResult<Subscription<T>> {
        if !self.is_permitted() {
            return Err(TrackerError::SensorUnavailable(format!(
                "{what} permission not granted"
            )));
        }
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .lock()
            .map_err(|_| TrackerError::Internal("feed lock poisoned".to_string()))?
            .push((id, tx));

        let inner = Arc::downgrade(&self.inner);
        Ok(Subscription::new(rx, move || {
            if let Some(inner) = inner.upgrade() {
                if let Ok(mut subs) = inner.subscribers.lock() {
                    subs.retain(|(sid, _)| *sid != id);
                }
            }
        }))
    }

    fn senders(&self) -> Vec<mpsc::Sender<T>> {
        self.inner
            .subscribers
            .lock()
            .map(|s| s.iter().map(|(_, tx)| tx.clone()).collect())
            .unwrap_or_default()
    }

    /// Non-blocking push, the way a sensor callback delivers. Full queues
    /// drop the reading. Returns the number of subscribers reached.
    pub fn publish(&self, item: T) -> usize {
        let mut reached = 0;
        for tx in self.senders() {
            match tx.try_send(item.clone()) {
                Ok(()) => reached += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        reached
    }

    /// Lossless push that waits for queue space.
    pub async fn send(&self, item: T) -> usize {
        let mut reached = 0;
        for tx in self.senders() {
            if tx.send(item.clone()).await.is_ok() {
                reached += 1;
            }
        }
        reached
    }
}

impl<T: Clone + Send + 'static> Default for Feed<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Accelerometer push source.
#[derive(Clone, Default)]
pub struct MotionFeed {
    feed: Feed<MotionReading>,
}

impl MotionFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&self) -> &Feed<MotionReading> {
        &self.feed
    }

    pub fn publish(&self, reading: MotionReading) -> usize {
        self.feed.publish(reading)
    }

    pub async fn send(&self, reading: MotionReading) -> usize {
        self.feed.send(reading).await
    }
}

impl SensorSource for MotionFeed {
    fn subscribe(&self) -> TrackerResult<Subscription<MotionReading>> {
        self.feed.attach("motion")
    }
}

/// Location push source that remembers the last fix for one-shot requests.
#[derive(Clone, Default)]
pub struct LocationFeed {
    feed: Feed<LocationFix>,
    last: Arc<Mutex<Option<LocationFix>>>,
}

impl LocationFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&self) -> &Feed<LocationFix> {
        &self.feed
    }

    fn remember(&self, fix: &LocationFix) {
        if let Ok(mut last) = self.last.lock() {
            *last = Some(fix.clone());
        }
    }

    pub fn publish(&self, fix: LocationFix) -> usize {
        self.remember(&fix);
        self.feed.publish(fix)
    }

    pub async fn send(&self, fix: LocationFix) -> usize {
        self.remember(&fix);
        self.feed.send(fix).await
    }
}

impl LocationSource for LocationFeed {
    fn subscribe(&self) -> TrackerResult<Subscription<LocationFix>> {
        self.feed.attach("location")
    }

    async fn current(&self) -> Option<LocationFix> {
        if !self.feed.is_permitted() {
            return None;
        }
        self.last.lock().ok().and_then(|last| last.clone())
    }
}

// ===== Simulation =====

#[derive(Clone, Debug)]
pub struct SimulationConfig {
    pub rate_hz: f64,
    /// Seconds between injected bumps.
    pub bump_every: f64,
    pub bump_size: f64,
    pub gps_every: f64,
    pub start_lat: f64,
    pub start_lng: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            rate_hz: 50.0,
            bump_every: 4.0,
            bump_size: 12.0,
            gps_every: 1.0,
            start_lat: 37.7749,
            start_lng: -122.4194,
        }
    }
}

/// Synthetic reading at tick `n`: gentle sway plus a vertical jolt every
/// `bump_every` seconds.
pub fn synthetic_reading(n: u64, config: &SimulationConfig, start: f64) -> MotionReading {
    use std::f64::consts::PI;
    let t = n as f64 / config.rate_hz;
    let ticks_per_bump = (config.bump_every * config.rate_hz).round().max(1.0) as u64;
    let phase = n % ticks_per_bump;
    let jolt = match phase {
        0 if n > 0 => config.bump_size,
        1 if n > 1 => -config.bump_size * 0.6,
        2 if n > 2 => config.bump_size * 0.2,
        _ => 0.0,
    };
    MotionReading::new(
        (t * 2.0 * PI).sin() * 0.5,
        (t * 2.0 * PI).cos() * 0.3,
        9.81 + (t * PI).sin() * 0.1 + jolt,
        start + t,
    )
}

/// Drive both feeds with synthetic data until cancelled.
/// Returns the number of motion readings produced.
pub fn simulate(
    motion: MotionFeed,
    location: LocationFeed,
    config: SimulationConfig,
    cancel: CancellationToken,
) -> JoinHandle<u64> {
    tokio::spawn(async move {
        let start = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
        let period = Duration::from_secs_f64(1.0 / config.rate_hz.max(1.0));
        let gps_ticks = (config.gps_every * config.rate_hz).round().max(1.0) as u64;
        let mut ticker = tokio::time::interval(period);
        let mut n = 0u64;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let reading = synthetic_reading(n, &config, start);
                    if n % gps_ticks == 0 {
                        let seq = (n / gps_ticks) as f64;
                        let mut fix = LocationFix::new(
                            config.start_lat + seq * 0.00001,
                            config.start_lng + seq * 0.00001,
                            reading.timestamp,
                        );
                        fix.accuracy = Some(5.0 + (seq * 0.1).sin() * 2.0);
                        location.publish(fix);
                    }
                    motion.publish(reading);
                    n += 1;
                }
            }
        }
        log::debug!("simulation stopped after {} readings", n);
        n
    })
}

// ===== Log replay =====

#[derive(Clone, Debug, Deserialize)]
pub struct ReplayReading {
    pub timestamp: f64,
    #[serde(default)]
    pub accel: Option<MotionReading>,
    #[serde(default)]
    pub gps: Option<LocationFix>,
}

/// Recorded sensor log: `{"readings": [{timestamp, accel?, gps?}, ...]}`,
/// plain or gzip-compressed.
#[derive(Clone, Debug, Deserialize)]
pub struct ReplayLog {
    pub readings: Vec<ReplayReading>,
}

impl ReplayLog {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let file =
            File::open(path).with_context(|| format!("opening log {}", path.display()))?;
        let parsed: Result<ReplayLog, serde_json::Error> =
            if path.extension().map(|e| e == "gz").unwrap_or(false) {
                serde_json::from_reader(BufReader::new(GzDecoder::new(file)))
            } else {
                serde_json::from_reader(BufReader::new(file))
            };
        parsed.with_context(|| format!("parsing log {}", path.display()))
    }

    pub fn duration(&self) -> f64 {
        match (self.readings.first(), self.readings.last()) {
            (Some(a), Some(b)) => (b.timestamp - a.timestamp).max(0.0),
            _ => 0.0,
        }
    }

    /// Push every reading into the feeds in log order. `speed` scales the
    /// recorded pacing; `None` replays as fast as the queues accept.
    pub fn replay(
        self,
        motion: MotionFeed,
        location: LocationFeed,
        speed: Option<f64>,
        cancel: CancellationToken,
    ) -> JoinHandle<usize> {
        tokio::spawn(async move {
            let mut pushed = 0usize;
            let mut prev_ts: Option<f64> = None;
            for reading in self.readings {
                if cancel.is_cancelled() {
                    break;
                }
                if let (Some(speed), Some(prev)) = (speed.filter(|s| *s > 0.0), prev_ts) {
                    let gap = ((reading.timestamp - prev) / speed).max(0.0);
                    if gap > 0.0 {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(Duration::from_secs_f64(gap)) => {}
                        }
                    }
                }
                prev_ts = Some(reading.timestamp);

                if let Some(fix) = reading.gps {
                    location.send(fix).await;
                }
                if let Some(accel) = reading.accel {
                    motion.send(accel).await;
                    pushed += 1;
                }
            }
            pushed
        })
    }
}
