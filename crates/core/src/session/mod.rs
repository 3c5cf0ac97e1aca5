//! Wires configuration, mode and backends into one run.

use std::{sync::Arc, time::Duration};

use crate::{
    analysis::detector_for, mapping, pattern, Actuator, ActuationBackend, AppConfig, AudioSource,
    AudioTimeline, CueSink, EmergencyStop, ExecutionSchedule, Governor, LogCueSink, MapOptions,
    Mode, Pattern, PlaybackPosition, Result, RunReport, Scheduler, SchedulerSettings,
    SchedulingClock, SimulationBackend, TelemetrySource,
};

/// Per-process entry point: analysis, planning and run preparation under one
/// configuration.
#[derive(Debug, Clone)]
pub struct Session {
    config: AppConfig,
    mode: Mode,
    closed_course_ack: bool,
}

impl Session {
    /// `requested` is subject to the simulation-only lock.
    pub fn new(config: AppConfig, requested: Mode) -> Self {
        let mode = config.effective_mode(requested);
        Self {
            config,
            mode,
            closed_course_ack: false,
        }
    }

    pub fn with_closed_course_ack(mut self, acknowledged: bool) -> Self {
        self.closed_course_ack = acknowledged;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn analyze(&self, source: &AudioSource) -> Result<AudioTimeline> {
        let detector = detector_for(&self.config);
        let timeline = detector.analyze(source)?;
        tracing::info!(
            detector = detector.name(),
            tempo_bpm = timeline.tempo_bpm(),
            beats = timeline.beats().len(),
            segments = timeline.segments().len(),
            "analysis finished"
        );
        Ok(timeline)
    }

    /// Validates `pattern` against the envelope and maps it onto `timeline`.
    pub fn plan(&self, pattern: &Pattern, timeline: &AudioTimeline) -> Result<ExecutionSchedule> {
        pattern::validate(pattern, &self.config.safety_envelope())?;
        mapping::map_with(
            pattern,
            timeline,
            MapOptions {
                timing: self.config.sync.pattern_timing,
            },
        )
    }

    /// Builds the scheduler and governor for the session's mode.
    ///
    /// `live` is only ever called in drift mode. Simulation runs get a fresh
    /// [`SimulationBackend`]; audio-only runs have no actuator and route the
    /// emergency stop to a simulation backend.
    pub fn prepare<B>(&self, live: Arc<B>, clock: Box<dyn SchedulingClock>) -> PreparedRun
    where
        B: ActuationBackend + 'static,
    {
        let settings = SchedulerSettings::from(&self.config.sync);
        let envelope = self.config.safety_envelope();
        let (actuator, estop, telemetry, simulation): (
            Option<Arc<dyn Actuator>>,
            Arc<dyn EmergencyStop>,
            Option<Arc<dyn TelemetrySource>>,
            Option<Arc<SimulationBackend>>,
        ) = match self.mode {
            Mode::Drift => {
                let actuator: Arc<dyn Actuator> = live.clone();
                let telemetry: Arc<dyn TelemetrySource> = live.clone();
                (Some(actuator), live as Arc<dyn EmergencyStop>, Some(telemetry), None)
            }
            Mode::Simulation => {
                let simulation = Arc::new(SimulationBackend::new(self.config.autopilot.max_speed));
                let actuator: Arc<dyn Actuator> = simulation.clone();
                let telemetry: Arc<dyn TelemetrySource> = simulation.clone();
                let estop: Arc<dyn EmergencyStop> = simulation.clone();
                (Some(actuator), estop, Some(telemetry), Some(simulation))
            }
            Mode::AudioOnly => {
                let simulation = Arc::new(SimulationBackend::new(self.config.autopilot.max_speed));
                let estop: Arc<dyn EmergencyStop> = simulation.clone();
                (None, estop, None, Some(simulation))
            }
        };

        let governor = Arc::new(
            Governor::new(envelope, estop).with_closed_course_ack(self.closed_course_ack),
        );
        let mut scheduler = Scheduler::new(actuator, clock).with_settings(settings);
        let mut monitor_source = None;
        match (self.mode, telemetry) {
            // Live telemetry is watched from the governor's own thread.
            (Mode::Drift, Some(source)) => monitor_source = Some(source),
            (_, Some(source)) => scheduler = scheduler.with_telemetry(source),
            (_, None) => {}
        }
        if self.config.sync.visual_feedback || self.mode == Mode::AudioOnly {
            scheduler = scheduler.with_cue_sink(Arc::new(LogCueSink));
        }

        PreparedRun {
            mode: self.mode,
            scheduler,
            governor,
            simulation,
            monitor_source,
            monitor_interval: settings.tick,
        }
    }
}

/// A scheduler and governor ready to arm.
pub struct PreparedRun {
    mode: Mode,
    scheduler: Scheduler,
    governor: Arc<Governor>,
    simulation: Option<Arc<SimulationBackend>>,
    monitor_source: Option<Arc<dyn TelemetrySource>>,
    monitor_interval: Duration,
}

impl PreparedRun {
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Handle for operator stops.
    pub fn governor(&self) -> Arc<Governor> {
        self.governor.clone()
    }

    /// Recording backend used in simulation and audio-only modes.
    pub fn simulation_backend(&self) -> Option<Arc<SimulationBackend>> {
        self.simulation.clone()
    }

    pub fn with_cue_sink(mut self, sink: Arc<dyn CueSink>) -> Self {
        self.scheduler = self.scheduler.with_cue_sink(sink);
        self
    }

    pub fn with_playback(mut self, playback: Arc<dyn PlaybackPosition>) -> Self {
        self.scheduler = self.scheduler.with_playback(playback);
        self
    }

    /// Arms, starts and drives the run to a terminal state.
    pub fn execute(mut self, pattern: &Pattern, schedule: ExecutionSchedule) -> Result<RunReport> {
        self.scheduler
            .arm(pattern, schedule, self.governor.clone(), self.mode)?;
        let monitor = match &self.monitor_source {
            Some(source) => Some(
                self.governor
                    .spawn_monitor(source.clone(), self.monitor_interval)?,
            ),
            None => None,
        };
        let report = self.scheduler.run();
        drop(monitor);
        report
    }
}
