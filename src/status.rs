use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::types::{Label, SessionId};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// Snapshot published to UI observers on every change.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SessionStatus {
    pub timestamp: f64,
    pub session_id: Option<SessionId>,
    pub phase: SessionPhase,
    pub message: String,
    pub uptime_seconds: f64,
    // Sampling
    pub samples: u64,
    pub malformed: u64,
    pub dropped_without_fix: u64,
    pub location_fixes: u64,
    pub last_lat: Option<f64>,
    pub last_lng: Option<f64>,
    // Detection
    pub in_event: bool,
    pub events_detected: u64,
    pub gate_rejections: u64,
    pub last_label: Option<Label>,
    // Persistence
    pub units_flushed: u64,
    pub records_written: u64,
    pub write_failures: u64,
    pub markers_placed: u64,
}

impl SessionStatus {
    pub fn new() -> Self {
        Self {
            timestamp: current_timestamp(),
            session_id: None,
            phase: SessionPhase::Idle,
            message: "idle".to_string(),
            uptime_seconds: 0.0,
            samples: 0,
            malformed: 0,
            dropped_without_fix: 0,
            location_fixes: 0,
            last_lat: None,
            last_lng: None,
            in_event: false,
            events_detected: 0,
            gate_rejections: 0,
            last_label: None,
            units_flushed: 0,
            records_written: 0,
            write_failures: 0,
            markers_placed: 0,
        }
    }

    /// Fresh status for a session that just started.
    pub fn running(session_id: SessionId) -> Self {
        Self {
            message: format!("measuring ({})", session_id),
            session_id: Some(session_id),
            phase: SessionPhase::Running,
            ..Self::new()
        }
    }

    pub fn touch(&mut self) {
        self.timestamp = current_timestamp();
    }

    pub fn save(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self::new()
    }
}

pub fn current_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
