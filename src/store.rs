use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::error::StoreError;
use crate::types::{MarkerRecord, SampleRecord, SessionId};

// ===== Capabilities =====

/// Per-session record collection. Eventually consistent, at-least-once.
pub trait RecordStore: Send + Sync + 'static {
    fn write_one(
        &self,
        session: &SessionId,
        record: &SampleRecord,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn write_batch(
        &self,
        session: &SessionId,
        records: &[SampleRecord],
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn read_all(
        &self,
        session: &SessionId,
    ) -> impl Future<Output = Result<Vec<SampleRecord>, StoreError>> + Send;

    fn delete_one(
        &self,
        session: &SessionId,
        id: u64,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Draw-only map layer.
pub trait MapSink: Send + Sync + 'static {
    fn place_marker(
        &self,
        marker: &MarkerRecord,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

// ===== In-memory store =====

/// Append-only document store kept in memory. Writing the same id twice
/// yields two documents, like an auto-id collection would.
#[derive(Default)]
pub struct MemoryStore {
    sessions: Mutex<HashMap<SessionId, Vec<SampleRecord>>>,
    fail_writes: AtomicBool,
    fail_deletes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write reject until cleared.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn records(&self, session: &SessionId) -> Vec<SampleRecord> {
        self.sessions
            .lock()
            .map(|s| s.get(session).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Number of stored documents carrying `id`.
    pub fn copies_of(&self, session: &SessionId, id: u64) -> usize {
        self.records(session).iter().filter(|r| r.id == id).count()
    }

    fn append(&self, session: &SessionId, records: &[SampleRecord]) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Write("store offline".to_string()));
        }
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| StoreError::Write("store lock poisoned".to_string()))?;
        sessions
            .entry(session.clone())
            .or_default()
            .extend_from_slice(records);
        Ok(())
    }
}

impl RecordStore for MemoryStore {
    async fn write_one(
        &self,
        session: &SessionId,
        record: &SampleRecord,
    ) -> Result<(), StoreError> {
        self.append(session, std::slice::from_ref(record))
    }

    async fn write_batch(
        &self,
        session: &SessionId,
        records: &[SampleRecord],
    ) -> Result<(), StoreError> {
        self.append(session, records)
    }

    async fn read_all(&self, session: &SessionId) -> Result<Vec<SampleRecord>, StoreError> {
        let sessions = self
            .sessions
            .lock()
            .map_err(|_| StoreError::Read("store lock poisoned".to_string()))?;
        Ok(sessions.get(session).cloned().unwrap_or_default())
    }

    async fn delete_one(&self, session: &SessionId, id: u64) -> Result<(), StoreError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StoreError::Delete("store offline".to_string()));
        }
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| StoreError::Delete("store lock poisoned".to_string()))?;
        if let Some(records) = sessions.get_mut(session) {
            records.retain(|r| r.id != id);
        }
        Ok(())
    }
}

// ===== JSON-lines store =====

/// One `<session_id>.jsonl` file per session under `dir`.
pub struct JsonlStore {
    dir: PathBuf,
    io_lock: tokio::sync::Mutex<()>,
}

impl JsonlStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            io_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn session_path(&self, session: &SessionId) -> PathBuf {
        self.dir.join(format!("{}.jsonl", session))
    }

    async fn append_lines(
        &self,
        session: &SessionId,
        records: &[SampleRecord],
    ) -> Result<(), StoreError> {
        let mut buf = Vec::with_capacity(records.len() * 160);
        for record in records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }

        let _guard = self.io_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.session_path(session))
            .await?;
        file.write_all(&buf).await?;
        file.flush().await?;
        Ok(())
    }

    async fn load(&self, session: &SessionId) -> Result<Vec<SampleRecord>, StoreError> {
        let path = self.session_path(session);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            records.push(serde_json::from_str(line)?);
        }
        Ok(records)
    }
}

impl RecordStore for JsonlStore {
    async fn write_one(
        &self,
        session: &SessionId,
        record: &SampleRecord,
    ) -> Result<(), StoreError> {
        self.append_lines(session, std::slice::from_ref(record)).await
    }

    async fn write_batch(
        &self,
        session: &SessionId,
        records: &[SampleRecord],
    ) -> Result<(), StoreError> {
        self.append_lines(session, records).await
    }

    async fn read_all(&self, session: &SessionId) -> Result<Vec<SampleRecord>, StoreError> {
        let _guard = self.io_lock.lock().await;
        self.load(session).await
    }

    async fn delete_one(&self, session: &SessionId, id: u64) -> Result<(), StoreError> {
        let _guard = self.io_lock.lock().await;
        let records = self.load(session).await?;
        let before = records.len();
        let kept: Vec<&SampleRecord> = records.iter().filter(|r| r.id != id).collect();
        if kept.len() == before {
            return Ok(());
        }

        let mut buf = Vec::new();
        for record in kept {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }
        // Rewrite through a temp file so a crash never truncates the session
        let path = self.session_path(session);
        let tmp = path.with_extension("jsonl.tmp");
        tokio::fs::write(&tmp, &buf).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

// ===== Map sinks =====

#[derive(Default)]
pub struct MemoryMap {
    markers: Mutex<Vec<MarkerRecord>>,
}

impl MemoryMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn markers(&self) -> Vec<MarkerRecord> {
        self.markers.lock().map(|m| m.clone()).unwrap_or_default()
    }
}

impl MapSink for MemoryMap {
    async fn place_marker(&self, marker: &MarkerRecord) -> Result<(), StoreError> {
        self.markers
            .lock()
            .map_err(|_| StoreError::Write("marker lock poisoned".to_string()))?
            .push(marker.clone());
        Ok(())
    }
}

/// GPX waypoint layer for mapping applications
#[derive(Debug, Serialize, Deserialize)]
pub struct GpxWaypoints {
    pub name: String,
    pub waypoints: Vec<MarkerRecord>,
}

impl GpxWaypoints {
    /// Generate GPX document XML string
    pub fn to_gpx_xml(&self) -> String {
        let mut xml = String::new();
        xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        xml.push_str("<gpx version=\"1.1\" creator=\"BumpTracker\">\n");
        xml.push_str("  <metadata>\n");
        xml.push_str(&format!("    <name>{}</name>\n", self.name));
        xml.push_str("  </metadata>\n");

        for marker in &self.waypoints {
            xml.push_str(&format!(
                "  <wpt lat=\"{}\" lon=\"{}\">\n",
                marker.coordinate.lat, marker.coordinate.lng
            ));
            if let Some(time) = waypoint_time(marker.timestamp) {
                xml.push_str(&format!("    <time>{}</time>\n", time));
            }
            xml.push_str(&format!("    <name>{}</name>\n", marker.label));
            xml.push_str(&format!("    <desc>magnitude {:.2}</desc>\n", marker.magnitude));
            xml.push_str(&format!("    <type>{}</type>\n", marker.label));
            xml.push_str("  </wpt>\n");
        }

        xml.push_str("</gpx>\n");
        xml
    }
}

/// RFC 3339 time for a timestamp in seconds, if chrono can represent it.
fn waypoint_time(timestamp: f64) -> Option<String> {
    if !timestamp.is_finite() {
        return None;
    }
    let secs = timestamp.floor();
    let nanos = ((timestamp - secs) * 1e9).min(999_999_999.0) as u32;
    chrono::DateTime::from_timestamp(secs as i64, nanos).map(|t| t.to_rfc3339())
}

/// Rewrites a GPX file with every marker placed so far.
pub struct GpxMarkerSink {
    path: PathBuf,
    layer: tokio::sync::Mutex<GpxWaypoints>,
}

impl GpxMarkerSink {
    pub fn new(path: impl Into<PathBuf>, name: &str) -> Self {
        Self {
            path: path.into(),
            layer: tokio::sync::Mutex::new(GpxWaypoints {
                name: name.to_string(),
                waypoints: Vec::new(),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MapSink for GpxMarkerSink {
    async fn place_marker(&self, marker: &MarkerRecord) -> Result<(), StoreError> {
        let mut layer = self.layer.lock().await;
        layer.waypoints.push(marker.clone());
        tokio::fs::write(&self.path, layer.to_gpx_xml()).await?;
        Ok(())
    }
}
