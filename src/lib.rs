//! Event segmentation and retention engine for accelerometer and GPS
//! streams: turns a raw motion signal into discrete, classified events,
//! keeps bounded context around them and reconciles what was written with
//! what a session should retain.

pub mod classify;
pub mod config;
pub mod engine;
pub mod error;
pub mod gate;
pub mod reconciler;
pub mod retention;
pub mod sampler;
pub mod segmenter;
pub mod session;
pub mod source;
pub mod status;
pub mod store;
pub mod types;

pub use config::{DetectorConfig, MagnitudeMode, SegmentMode, SweepPolicy};
pub use engine::{DetectionEngine, EngineEvent, EngineStats};
pub use error::{StoreError, TrackerError, TrackerResult};
pub use reconciler::{PersistenceReconciler, SweepReport};
pub use session::{SessionSummary, Tracker};
pub use source::{LocationFeed, LocationSource, MotionFeed, SensorSource, Subscription};
pub use status::{SessionPhase, SessionStatus};
pub use store::{GpxMarkerSink, JsonlStore, MapSink, MemoryMap, MemoryStore, RecordStore};
pub use types::{EventKind, Label, LocationFix, MotionReading, SampleRecord, SessionId};
