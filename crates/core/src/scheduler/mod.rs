//! Execution scheduler: walks an [`ExecutionSchedule`] in lock-step with music
//! playback, gating every dispatch through the [`Governor`].
//!
//! State machine: `Idle -> Armed -> Running -> {Completed, Aborted}`. Terminal
//! states are final for the run; arming again builds a fresh [`RunState`].
//!
//! Zero-length actions, left behind when a later action on the same axis starts
//! at the same instant, still pass the governor and are logged and cued, but are
//! never sent to the actuator.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use serde::{Deserialize, Serialize};

use crate::{
    millis, pattern, AbortSignal, ActionSummary, Actuator, Axis, DenyReason, DispatchOutcome,
    DispatchRecord, DriftError, DriftReconciler, ExecutionSchedule, Governor, ManeuverKind, Mode,
    Pattern, PlaybackPosition, Result, Resync, RunOutcome, RunReport, ScheduledAction,
    SchedulingClock, SyncConfig, TelemetrySource, Verdict,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    Idle,
    Armed,
    Running,
    Completed,
    Aborted,
}

impl SchedulerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Armed => "armed",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        })
    }
}

/// Mutable state of one run, owned by the scheduler that armed it.
#[derive(Debug, Clone)]
pub struct RunState {
    current_time_ms: f64,
    active_actions: BTreeMap<Axis, ScheduledAction>,
    abort: AbortSignal,
    mode: Mode,
    speed_ceiling: f64,
    next_index: usize,
    last_completed: Option<ScheduledAction>,
    last_dispatched: Option<ScheduledAction>,
    dispatch_log: Vec<DispatchRecord>,
    cues: usize,
}

impl RunState {
    pub(crate) fn new(mode: Mode, speed_ceiling: f64, abort: AbortSignal) -> Self {
        Self {
            current_time_ms: 0.0,
            active_actions: BTreeMap::new(),
            abort,
            mode,
            speed_ceiling,
            next_index: 0,
            last_completed: None,
            last_dispatched: None,
            dispatch_log: Vec::new(),
            cues: 0,
        }
    }

    pub fn current_time_ms(&self) -> f64 {
        self.current_time_ms
    }

    /// In-flight action per axis.
    pub fn active_actions(&self) -> &BTreeMap<Axis, ScheduledAction> {
        &self.active_actions
    }

    /// Set only by the governor; never cleared.
    pub fn abort_requested(&self) -> bool {
        self.abort.is_set()
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Pattern ceiling capped by the envelope.
    pub fn speed_ceiling(&self) -> f64 {
        self.speed_ceiling
    }

    pub fn dispatch_log(&self) -> &[DispatchRecord] {
        &self.dispatch_log
    }

    fn retire_finished(&mut self, now_ms: f64) {
        let finished: Vec<Axis> = self
            .active_actions
            .iter()
            .filter(|(_, action)| action.end_ms() <= now_ms)
            .map(|(axis, _)| *axis)
            .collect();
        for axis in finished {
            if let Some(action) = self.active_actions.remove(&axis) {
                self.note_completed(action);
            }
        }
    }

    fn note_completed(&mut self, action: ScheduledAction) {
        let newer = match &self.last_completed {
            None => true,
            Some(previous) => {
                action.end_ms() > previous.end_ms()
                    || (action.end_ms() == previous.end_ms() && action.sequence > previous.sequence)
            }
        };
        if newer {
            self.last_completed = Some(action);
        }
    }
}

/// Timing knobs for the control loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerSettings {
    pub tick: Duration,
    pub resync_interval_ms: f64,
    pub drift_tolerance_ms: f64,
    pub backend_timeout: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

impl From<&SyncConfig> for SchedulerSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            tick: Duration::from_millis(config.tick_interval_ms),
            resync_interval_ms: config.resync_interval_ms as f64,
            drift_tolerance_ms: config.drift_tolerance_ms,
            backend_timeout: Duration::from_millis(config.backend_timeout_ms),
        }
    }
}

/// Synchronised playback cue emitted when an action starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cue {
    pub sequence: usize,
    pub label: String,
    pub maneuver: ManeuverKind,
    pub axis: Axis,
    pub at_ms: f64,
    pub target_speed: f64,
}

impl Cue {
    fn new(action: &ScheduledAction, at_ms: f64) -> Self {
        Self {
            sequence: action.sequence,
            label: action.label.clone(),
            maneuver: action.maneuver,
            axis: action.axis,
            at_ms,
            target_speed: action.target_speed,
        }
    }
}

pub trait CueSink: Send + Sync {
    fn cue(&self, cue: &Cue);
}

/// Writes cues to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogCueSink;

impl CueSink for LogCueSink {
    fn cue(&self, cue: &Cue) {
        tracing::info!(
            at_ms = cue.at_ms,
            label = %cue.label,
            maneuver = %cue.maneuver,
            axis = %cue.axis,
            target_speed = cue.target_speed,
            "cue"
        );
    }
}

/// Keeps every cue in memory.
#[derive(Debug, Default)]
pub struct RecordingCueSink {
    cues: Mutex<Vec<Cue>>,
}

impl RecordingCueSink {
    pub fn cues(&self) -> Vec<Cue> {
        match self.cues.lock() {
            Ok(cues) => cues.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl CueSink for RecordingCueSink {
    fn cue(&self, cue: &Cue) {
        match self.cues.lock() {
            Ok(mut cues) => cues.push(cue.clone()),
            Err(poisoned) => poisoned.into_inner().push(cue.clone()),
        }
    }
}

/// Runs backend dispatches on a separate thread so a blocking backend can be
/// timed out. One request is in flight at a time.
struct DispatchWorker {
    requests: Sender<ScheduledAction>,
    responses: Receiver<(usize, DispatchOutcome)>,
}

impl DispatchWorker {
    fn spawn(actuator: Arc<dyn Actuator>) -> Result<Self> {
        let (requests, request_rx) = bounded::<ScheduledAction>(1);
        let (response_tx, responses) = bounded(1);
        thread::Builder::new()
            .name("dispatch-worker".into())
            .spawn(move || {
                for action in request_rx {
                    let outcome = actuator.dispatch(&action);
                    if response_tx.send((action.sequence, outcome)).is_err() {
                        break;
                    }
                }
            })?;
        Ok(Self {
            requests,
            responses,
        })
    }

    fn dispatch(
        &self,
        action: &ScheduledAction,
        timeout: Duration,
    ) -> std::result::Result<DispatchOutcome, DenyReason> {
        let stopped = || DenyReason::BackendRejected {
            detail: "dispatch worker stopped".into(),
        };
        let unresponsive = || DenyReason::BackendUnresponsive {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        };

        let deadline = Instant::now() + timeout;
        match self.requests.send_timeout(action.clone(), timeout) {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) => return Err(unresponsive()),
            Err(SendTimeoutError::Disconnected(_)) => return Err(stopped()),
        }
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.responses.recv_timeout(remaining) {
                Ok((sequence, outcome)) if sequence == action.sequence => return Ok(outcome),
                // Late answer to an earlier request.
                Ok(_) => continue,
                Err(RecvTimeoutError::Timeout) => return Err(unresponsive()),
                Err(RecvTimeoutError::Disconnected) => return Err(stopped()),
            }
        }
    }
}

struct ActiveRun {
    pattern: String,
    schedule: ExecutionSchedule,
    governor: Arc<Governor>,
    state: RunState,
    reconciler: DriftReconciler,
    started_at: Option<Duration>,
    worker: Option<DispatchWorker>,
}

/// Drives one run at a time against an optional actuator.
pub struct Scheduler {
    actuator: Option<Arc<dyn Actuator>>,
    telemetry: Option<Arc<dyn TelemetrySource>>,
    playback: Option<Arc<dyn PlaybackPosition>>,
    cue_sink: Option<Arc<dyn CueSink>>,
    clock: Box<dyn SchedulingClock>,
    settings: SchedulerSettings,
    state: SchedulerState,
    run: Option<ActiveRun>,
}

impl Scheduler {
    pub fn new(actuator: Option<Arc<dyn Actuator>>, clock: Box<dyn SchedulingClock>) -> Self {
        Self {
            actuator,
            telemetry: None,
            playback: None,
            cue_sink: None,
            clock,
            settings: SchedulerSettings::default(),
            state: SchedulerState::Idle,
            run: None,
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySource>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Playback position used for drift reconciliation.
    pub fn with_playback(mut self, playback: Arc<dyn PlaybackPosition>) -> Self {
        self.playback = Some(playback);
        self
    }

    pub fn with_cue_sink(mut self, sink: Arc<dyn CueSink>) -> Self {
        self.cue_sink = Some(sink);
        self
    }

    pub fn with_settings(mut self, settings: SchedulerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn run_state(&self) -> Option<&RunState> {
        self.run.as_ref().map(|run| &run.state)
    }

    /// `Idle -> Armed`. Rejects the run with [`DriftError::NotArmable`] when the
    /// pattern fails validation, the mode is not permitted, or the governor has
    /// already been tripped.
    pub fn arm(
        &mut self,
        pattern: &Pattern,
        schedule: ExecutionSchedule,
        governor: Arc<Governor>,
        mode: Mode,
    ) -> Result<()> {
        if matches!(self.state, SchedulerState::Armed | SchedulerState::Running) {
            return Err(DriftError::NotArmable(format!(
                "scheduler is already {}",
                self.state
            )));
        }
        if governor.is_aborted() {
            return Err(DriftError::NotArmable(
                "safety governor has already aborted a run".into(),
            ));
        }
        pattern::validate(pattern, governor.envelope())
            .map_err(|err| DriftError::NotArmable(err.to_string()))?;
        governor
            .permits_mode(mode)
            .map_err(|reason| DriftError::NotArmable(reason.to_string()))?;
        if schedule.pattern() != pattern.name {
            return Err(DriftError::NotArmable(format!(
                "schedule was built for pattern {:?}, not {:?}",
                schedule.pattern(),
                pattern.name
            )));
        }
        schedule
            .verify()
            .map_err(|err| DriftError::NotArmable(err.to_string()))?;
        if mode != Mode::AudioOnly && self.actuator.is_none() {
            return Err(DriftError::NotArmable(format!(
                "{mode} mode needs an actuation backend"
            )));
        }

        let ceiling = pattern.effective_ceiling(governor.envelope());
        let state = RunState::new(mode, ceiling, governor.abort_signal());
        tracing::info!(
            pattern = %pattern.name,
            %mode,
            actions = schedule.len(),
            speed_ceiling = ceiling,
            "scheduler armed"
        );
        self.run = Some(ActiveRun {
            pattern: pattern.name.clone(),
            schedule,
            governor,
            state,
            reconciler: DriftReconciler::new(
                self.settings.resync_interval_ms,
                self.settings.drift_tolerance_ms,
            ),
            started_at: None,
            worker: None,
        });
        self.state = SchedulerState::Armed;
        Ok(())
    }

    /// `Armed -> Running`. The current clock reading becomes the reference for
    /// every scheduled start.
    pub fn start(&mut self) -> Result<()> {
        if self.state != SchedulerState::Armed {
            return Err(DriftError::NotArmable(format!(
                "cannot start a {} scheduler",
                self.state
            )));
        }
        let run = self
            .run
            .as_mut()
            .ok_or_else(|| DriftError::internal("armed scheduler has no run"))?;
        if run.state.mode == Mode::Drift {
            if let Some(actuator) = &self.actuator {
                run.worker = Some(DispatchWorker::spawn(actuator.clone())?);
            }
        }
        run.started_at = Some(self.clock.now());
        self.state = SchedulerState::Running;
        tracing::info!(pattern = %run.pattern, mode = %run.state.mode, "run started");
        Ok(())
    }

    /// One pass of the control loop. Returns the state after the pass.
    pub fn tick(&mut self) -> Result<SchedulerState> {
        if self.state != SchedulerState::Running {
            return Ok(self.state);
        }
        let run = self
            .run
            .as_mut()
            .ok_or_else(|| DriftError::internal("running scheduler has no run"))?;
        let started_at = run
            .started_at
            .ok_or_else(|| DriftError::internal("running scheduler has no start reference"))?;

        if run.state.abort_requested() {
            return Ok(self.finish(RunOutcome::Aborted));
        }

        let clock_ms = millis(self.clock.now().saturating_sub(started_at));
        match run.reconciler.reconcile(clock_ms, self.playback.as_deref()) {
            Resync::Skipped => {}
            Resync::Adjusted {
                position_ms,
                drift_ms,
            } => tracing::trace!(position_ms, drift_ms, "resynchronised to playback"),
            Resync::Exceeded { drift_ms } => {
                run.governor.deny(DenyReason::DriftExceeded {
                    drift_ms,
                    tolerance_ms: run.reconciler.tolerance_ms(),
                });
                return Ok(self.finish(RunOutcome::Aborted));
            }
        }
        let now_ms = run.reconciler.corrected(clock_ms);
        run.state.current_time_ms = now_ms;

        if let Some(sample) = self.telemetry.as_ref().and_then(|source| source.telemetry()) {
            if let Verdict::Deny(_) = run.governor.check_telemetry(&sample) {
                return Ok(self.finish(RunOutcome::Aborted));
            }
        }

        run.state.retire_finished(now_ms);

        while let Some(action) = run.schedule.actions().get(run.state.next_index) {
            if action.start_ms > now_ms {
                break;
            }
            if run.state.abort_requested() {
                return Ok(self.finish(RunOutcome::Aborted));
            }
            if !action.start_ms.is_finite() || !action.duration_ms.is_finite() {
                run.governor.deny(DenyReason::InternalInconsistency {
                    detail: format!("action {} has no resolved time", action.label),
                });
                return Ok(self.finish(RunOutcome::Aborted));
            }
            if let Verdict::Deny(_) = run.governor.check(action, &run.state) {
                return Ok(self.finish(RunOutcome::Aborted));
            }

            let actuated = match run.state.mode {
                Mode::AudioOnly => false,
                // Superseded in the same instant by a later action on its axis.
                _ if action.duration_ms <= 0.0 => false,
                Mode::Simulation => {
                    let outcome = match &self.actuator {
                        Some(actuator) => actuator.dispatch(action),
                        None => DispatchOutcome::Reject("no actuation backend".into()),
                    };
                    if let DispatchOutcome::Reject(detail) = outcome {
                        run.governor.deny(DenyReason::BackendRejected { detail });
                        return Ok(self.finish(RunOutcome::Aborted));
                    }
                    true
                }
                Mode::Drift => {
                    let outcome = match &run.worker {
                        Some(worker) => worker.dispatch(action, self.settings.backend_timeout),
                        None => Err(DenyReason::InternalInconsistency {
                            detail: "drift run started without a dispatch worker".into(),
                        }),
                    };
                    let reason = match outcome {
                        Ok(DispatchOutcome::Ack) => None,
                        Ok(DispatchOutcome::Reject(detail)) => {
                            Some(DenyReason::BackendRejected { detail })
                        }
                        Err(reason) => Some(reason),
                    };
                    if let Some(reason) = reason {
                        run.governor.deny(reason);
                        return Ok(self.finish(RunOutcome::Aborted));
                    }
                    true
                }
            };

            tracing::debug!(
                sequence = action.sequence,
                label = %action.label,
                axis = %action.axis,
                scheduled_ms = action.start_ms,
                at_ms = now_ms,
                actuated,
                "dispatched"
            );
            if let Some(sink) = &self.cue_sink {
                sink.cue(&Cue::new(action, now_ms));
                run.state.cues += 1;
            }
            run.state
                .dispatch_log
                .push(DispatchRecord::new(action, now_ms, actuated));
            if let Some(replaced) = run.state.active_actions.insert(action.axis, action.clone()) {
                run.state.note_completed(replaced);
            }
            run.state.last_dispatched = Some(action.clone());
            run.state.next_index += 1;
        }

        run.state.retire_finished(now_ms);
        if run.state.next_index == run.schedule.len() && run.state.active_actions.is_empty() {
            return Ok(self.finish(RunOutcome::Completed));
        }
        Ok(self.state)
    }

    /// Arms-to-terminal loop: starts the run if needed and ticks until it
    /// completes or aborts.
    pub fn run(&mut self) -> Result<RunReport> {
        if self.state == SchedulerState::Armed {
            self.start()?;
        }
        if self.state != SchedulerState::Running {
            return Err(DriftError::NotArmable(format!(
                "cannot run a {} scheduler",
                self.state
            )));
        }
        while !self.tick()?.is_terminal() {
            self.clock.advance(self.settings.tick);
        }
        self.report()
            .ok_or_else(|| DriftError::internal("finished run left no report"))
    }

    /// Report for the most recent run, once it has finished.
    pub fn report(&self) -> Option<RunReport> {
        if !self.state.is_terminal() {
            return None;
        }
        let run = self.run.as_ref()?;
        let reason = run.state.abort.reason().cloned();
        let outcome = if self.state == SchedulerState::Aborted {
            RunOutcome::Aborted
        } else {
            RunOutcome::Completed
        };
        Some(RunReport {
            pattern: run.pattern.clone(),
            mode: run.state.mode,
            outcome,
            reason_code: reason.as_ref().map(|reason| reason.code().to_string()),
            reason,
            elapsed_ms: run.state.current_time_ms,
            last_completed: run.state.last_completed.as_ref().map(ActionSummary::from),
            last_dispatched: run.state.last_dispatched.as_ref().map(ActionSummary::from),
            scheduled_actions: run.schedule.len(),
            dispatch_log: run.state.dispatch_log.clone(),
            cues: run.state.cues,
        })
    }

    fn finish(&mut self, outcome: RunOutcome) -> SchedulerState {
        self.state = match outcome {
            RunOutcome::Completed => SchedulerState::Completed,
            RunOutcome::Aborted => SchedulerState::Aborted,
        };
        if let Some(run) = self.run.as_mut() {
            // Dropping the worker closes its queue; a blocked backend call is
            // left to finish on its own thread.
            run.worker = None;
            let last_completed = run.state.last_completed.as_ref().map(|action| action.label.as_str());
            match outcome {
                RunOutcome::Completed => tracing::info!(
                    pattern = %run.pattern,
                    elapsed_ms = run.state.current_time_ms,
                    dispatched = run.state.dispatch_log.len(),
                    "run completed"
                ),
                RunOutcome::Aborted => tracing::error!(
                    pattern = %run.pattern,
                    code = run.state.abort.reason().map(DenyReason::code).unwrap_or("UNKNOWN"),
                    elapsed_ms = run.state.current_time_ms,
                    last_completed,
                    "run aborted"
                ),
            }
        }
        self.state
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("state", &self.state)
            .field("settings", &self.settings)
            .field("run", &self.run_state())
            .finish()
    }
}
