//! Core library for drift-sync.
//!
//! Analyses a music track, maps a declarative drift pattern onto its beat
//! grid and drives an actuation backend in lock-step with playback while a
//! safety governor gates every command. Each module owns one stage of that
//! pipeline; [`Session`] wires them together for the application.

pub mod analysis;
pub mod audio;
pub mod backend;
pub mod config;
pub mod error;
pub mod mapping;
pub mod pattern;
pub mod record;
pub mod safety;
pub mod scheduler;
pub mod session;
pub mod timeline;

pub use analysis::{
    detector_for, AudioTimeline, BeatDetector, FixedTempoDetector, Segment, SegmentLabel,
    SpectralFluxDetector,
};
pub use audio::{decode_wav, render_playback, AudioSource, PlaybackChain, SampleBuffer};
pub use backend::{
    backend_for_provider, Ack, ActuationBackend, Actuator, DispatchOutcome, EmergencyStop,
    SimulationBackend, Telemetry, TelemetrySource,
};
pub use config::{
    AnalysisConfig, AppConfig, AudioConfig, AutopilotConfig, DevelopmentConfig, LoggingConfig,
    PatternTiming, Provider, SafetyConfig, SyncConfig,
};
pub use error::{DriftError, ErrorClass, Result};
pub use mapping::{ExecutionSchedule, MapOptions, ScheduledAction};
pub use pattern::{
    Anchor, Axis, Difficulty, ManeuverKind, Pattern, PatternStep, SegmentEdge, StepDuration,
};
pub use record::{ActionSummary, DispatchRecord, RunOutcome, RunReport};
pub use safety::{
    AbortSignal, DenyReason, Governor, Mode, MonitorHandle, SafetyEnvelope, Verdict,
};
pub use scheduler::{
    Cue, CueSink, LogCueSink, RecordingCueSink, RunState, Scheduler, SchedulerSettings,
    SchedulerState,
};
pub use session::{PreparedRun, Session};
pub use timeline::{
    millis, DriftReconciler, ManualClock, MonotonicClock, PlaybackPosition, Resync,
    SchedulingClock,
};
