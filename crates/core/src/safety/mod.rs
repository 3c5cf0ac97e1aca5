//! Safety envelope and the governor that enforces it.
//!
//! The governor is the only writer of a run's abort latch. Everything else
//! (the scheduler, reports, the telemetry monitor's owner) holds an
//! [`AbortSignal`], a read-only view. Once tripped, the latch stays tripped for
//! the lifetime of the governor, and the first denial is the one reported.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{EmergencyStop, RunState, ScheduledAction, Telemetry, TelemetrySource};

/// Externally selectable operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Live actuation.
    Drift,
    /// Schedule evaluated against a recording stub.
    Simulation,
    /// Playback cues only, no actuation.
    AudioOnly,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Drift => "drift",
            Self::Simulation => "simulation",
            Self::AudioOnly => "audio-only",
        })
    }
}

/// Hard limits loaded once at startup and never mutated during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyEnvelope {
    pub absolute_max_speed: f64,
    pub allowed_modes: Vec<Mode>,
    pub require_closed_course_ack: bool,
}

/// Why the governor refused to let a run continue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DenyReason {
    SpeedCeilingExceeded { observed: f64, ceiling: f64 },
    ModeNotPermitted { mode: Mode, detail: String },
    ExternalAbortSignal,
    DriftExceeded { drift_ms: f64, tolerance_ms: f64 },
    BackendUnresponsive { timeout_ms: u64 },
    BackendRejected { detail: String },
    InternalInconsistency { detail: String },
}

impl DenyReason {
    /// Stable identifier used in reports and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SpeedCeilingExceeded { .. } => "SPEED_CEILING_EXCEEDED",
            Self::ModeNotPermitted { .. } => "MODE_NOT_PERMITTED",
            Self::ExternalAbortSignal => "EXTERNAL_ABORT_SIGNAL",
            Self::DriftExceeded { .. } => "DRIFT_EXCEEDED",
            Self::BackendUnresponsive { .. } => "BACKEND_UNRESPONSIVE",
            Self::BackendRejected { .. } => "BACKEND_REJECTED",
            Self::InternalInconsistency { .. } => "INTERNAL_INCONSISTENCY",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SpeedCeilingExceeded { observed, ceiling } => {
                write!(f, "speed {observed} exceeds ceiling {ceiling}")
            }
            Self::ModeNotPermitted { mode, detail } => write!(f, "{mode} mode not permitted: {detail}"),
            Self::ExternalAbortSignal => f.write_str("operator requested stop"),
            Self::DriftExceeded {
                drift_ms,
                tolerance_ms,
            } => write!(f, "playback drift {drift_ms:.1} ms exceeds {tolerance_ms:.1} ms"),
            Self::BackendUnresponsive { timeout_ms } => {
                write!(f, "backend did not answer within {timeout_ms} ms")
            }
            Self::BackendRejected { detail } => write!(f, "backend rejected command: {detail}"),
            Self::InternalInconsistency { detail } => write!(f, "internal inconsistency: {detail}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Allow,
    Deny(DenyReason),
}

impl Verdict {
    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

#[derive(Debug, Default)]
struct Latch {
    tripped: AtomicBool,
    reason: OnceLock<DenyReason>,
}

/// Read-only view of a governor's abort latch.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    latch: Arc<Latch>,
}

impl AbortSignal {
    pub fn is_set(&self) -> bool {
        self.latch.tripped.load(Ordering::Acquire)
    }

    /// The denial that tripped the latch.
    pub fn reason(&self) -> Option<&DenyReason> {
        if self.is_set() {
            self.latch.reason.get()
        } else {
            None
        }
    }
}

/// Standing monitor that validates actions and telemetry against the envelope.
pub struct Governor {
    envelope: SafetyEnvelope,
    closed_course_ack: bool,
    latch: Arc<Latch>,
    estop: Arc<dyn EmergencyStop>,
}

impl Governor {
    pub fn new(envelope: SafetyEnvelope, estop: Arc<dyn EmergencyStop>) -> Self {
        Self {
            envelope,
            closed_course_ack: false,
            latch: Arc::new(Latch::default()),
            estop,
        }
    }

    /// Records the operator's confirmation that the run happens on a closed course.
    pub fn with_closed_course_ack(mut self, acknowledged: bool) -> Self {
        self.closed_course_ack = acknowledged;
        self
    }

    pub fn envelope(&self) -> &SafetyEnvelope {
        &self.envelope
    }

    pub fn abort_signal(&self) -> AbortSignal {
        AbortSignal {
            latch: self.latch.clone(),
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.latch.tripped.load(Ordering::Acquire)
    }

    /// Pure mode check; does not touch the latch.
    pub fn permits_mode(&self, mode: Mode) -> std::result::Result<(), DenyReason> {
        if !self.envelope.allowed_modes.contains(&mode) {
            return Err(DenyReason::ModeNotPermitted {
                mode,
                detail: "mode is not in the allowed set".into(),
            });
        }
        if mode == Mode::Drift && self.envelope.require_closed_course_ack && !self.closed_course_ack
        {
            return Err(DenyReason::ModeNotPermitted {
                mode,
                detail: "closed-course acknowledgement missing".into(),
            });
        }
        Ok(())
    }

    /// Gate for a single dispatch.
    pub fn check(&self, action: &ScheduledAction, run: &RunState) -> Verdict {
        if let Some(verdict) = self.latched_verdict() {
            return verdict;
        }
        if let Err(reason) = self.permits_mode(run.mode()) {
            return self.deny(reason);
        }
        let ceiling = run.speed_ceiling().min(self.envelope.absolute_max_speed);
        if !action.target_speed.is_finite() || action.target_speed > ceiling {
            return self.deny(DenyReason::SpeedCeilingExceeded {
                observed: action.target_speed,
                ceiling,
            });
        }
        Verdict::Allow
    }

    /// Gate for a live telemetry sample.
    pub fn check_telemetry(&self, telemetry: &Telemetry) -> Verdict {
        if let Some(verdict) = self.latched_verdict() {
            return verdict;
        }
        if !telemetry.speed.is_finite() {
            return self.deny(DenyReason::InternalInconsistency {
                detail: "telemetry reported a non-finite speed".into(),
            });
        }
        if telemetry.speed > self.envelope.absolute_max_speed {
            return self.deny(DenyReason::SpeedCeilingExceeded {
                observed: telemetry.speed,
                ceiling: self.envelope.absolute_max_speed,
            });
        }
        Verdict::Allow
    }

    /// Operator-initiated stop. Handled exactly like a safety violation.
    pub fn request_stop(&self) -> Verdict {
        self.deny(DenyReason::ExternalAbortSignal)
    }

    /// Trips the latch. Only the first denial issues the emergency stop; later
    /// calls report the original reason.
    pub fn deny(&self, reason: DenyReason) -> Verdict {
        if self.latch.reason.set(reason.clone()).is_ok() {
            self.latch.tripped.store(true, Ordering::Release);
            tracing::error!(code = reason.code(), %reason, "safety governor denied run");
            self.estop.emergency_stop();
            return Verdict::Deny(reason);
        }
        self.latched_verdict().unwrap_or(Verdict::Deny(reason))
    }

    fn latched_verdict(&self) -> Option<Verdict> {
        if !self.is_aborted() {
            return None;
        }
        self.latch.reason.get().cloned().map(Verdict::Deny)
    }

    /// Polls `source` on its own thread until stopped or the latch trips.
    pub fn spawn_monitor(
        self: &Arc<Self>,
        source: Arc<dyn TelemetrySource>,
        interval: Duration,
    ) -> std::io::Result<MonitorHandle> {
        let governor = Arc::clone(self);
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let thread = thread::Builder::new()
            .name("telemetry-monitor".into())
            .spawn(move || {
                while !stop_flag.load(Ordering::Acquire) && !governor.is_aborted() {
                    if let Some(sample) = source.telemetry() {
                        governor.check_telemetry(&sample);
                    }
                    thread::sleep(interval);
                }
            })?;
        Ok(MonitorHandle {
            stop,
            thread: Some(thread),
        })
    }
}

impl fmt::Debug for Governor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Governor")
            .field("envelope", &self.envelope)
            .field("closed_course_ack", &self.closed_course_ack)
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

/// Stops the telemetry monitor thread when dropped.
#[derive(Debug)]
pub struct MonitorHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("telemetry monitor panicked");
            }
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
