use std::{
    collections::BTreeMap,
    io::Cursor,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use drift_sync_core::{
    mapping, pattern, Ack, Actuator, Anchor, AppConfig, AudioSource, AudioTimeline, Axis,
    DispatchOutcome, DriftError, EmergencyStop, ExecutionSchedule, Governor, ManeuverKind,
    ManualClock, Mode, Pattern, PatternStep, SafetyEnvelope, ScheduledAction, Scheduler,
    SchedulerSettings, SchedulerState, SchedulingClock, Segment, SegmentEdge, SegmentLabel,
    Session, StepDuration, Telemetry, TelemetrySource,
};

/// Backend with adjustable telemetry that counts every call.
#[derive(Default)]
struct ScriptedBackend {
    speed_bits: AtomicU64,
    dispatches: AtomicUsize,
    stops: AtomicUsize,
}

impl ScriptedBackend {
    fn set_speed(&self, speed: f64) {
        self.speed_bits.store(speed.to_bits(), Ordering::SeqCst);
    }

    fn dispatches(&self) -> usize {
        self.dispatches.load(Ordering::SeqCst)
    }

    fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl Actuator for ScriptedBackend {
    fn dispatch(&self, _: &ScheduledAction) -> DispatchOutcome {
        self.dispatches.fetch_add(1, Ordering::SeqCst);
        DispatchOutcome::Ack
    }
}

impl TelemetrySource for ScriptedBackend {
    fn telemetry(&self) -> Option<Telemetry> {
        Some(Telemetry {
            speed: f64::from_bits(self.speed_bits.load(Ordering::SeqCst)),
            steering_angle: 0.0,
            timestamp_ms: 0.0,
        })
    }
}

impl EmergencyStop for ScriptedBackend {
    fn emergency_stop(&self) -> Ack {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ack
    }
}

fn envelope() -> SafetyEnvelope {
    SafetyEnvelope {
        absolute_max_speed: 25.0,
        allowed_modes: vec![Mode::Drift, Mode::Simulation, Mode::AudioOnly],
        require_closed_course_ack: true,
    }
}

fn unlocked_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.development.simulation_only = false;
    config.safety.allowed_modes = vec![Mode::Drift, Mode::Simulation, Mode::AudioOnly];
    config
}

fn short_timeline() -> AudioTimeline {
    AudioTimeline::new(
        44_100,
        4_000.0,
        120.0,
        vec![0.0, 500.0, 1000.0, 1500.0, 2000.0],
        vec![Segment {
            label: SegmentLabel::Intro,
            start_ms: 0.0,
            end_ms: 4_000.0,
            tempo_bpm: 120.0,
        }],
    )
    .unwrap()
}

fn structured_timeline() -> AudioTimeline {
    let beats = (0..40).map(|beat| beat as f64 * 500.0).collect();
    let segment = |label, start_ms, end_ms| Segment {
        label,
        start_ms,
        end_ms,
        tempo_bpm: 120.0,
    };
    AudioTimeline::new(
        44_100,
        20_000.0,
        120.0,
        beats,
        vec![
            segment(SegmentLabel::Intro, 0.0, 5_000.0),
            segment(SegmentLabel::Build, 5_000.0, 10_000.0),
            segment(SegmentLabel::Drop, 10_000.0, 15_000.0),
            segment(SegmentLabel::Outro, 15_000.0, 20_000.0),
        ],
    )
    .unwrap()
}

const SCENARIO_A: &str = r#"
name: Hold and Brake
description: Two steps on separate axes
version: "1.0"
music_file: music/a.wav
difficulty: beginner
max_speed: 25
steps:
  - label: hold
    maneuver: hold
    anchor: { offset_ms: 0 }
    target_speed: 10
    duration_ms: 2000
  - label: brake
    maneuver: brake
    anchor: { offset_ms: 2000 }
    target_speed: 0
    duration_ms: 500
"#;

#[test]
fn scenario_a_two_steps_map_to_two_actions() {
    let pattern = pattern::load(SCENARIO_A).unwrap();
    let schedule = mapping::map(&pattern, &short_timeline()).unwrap();

    let starts: Vec<f64> = schedule.actions().iter().map(|a| a.start_ms).collect();
    assert_eq!(starts, [0.0, 2000.0]);
    assert_eq!(schedule.actions()[0].target_speed, 10.0);
    assert_eq!(schedule.actions()[1].axis, Axis::Brake);
}

#[test]
fn scenario_b_overspeed_step_never_arms() {
    let source = SCENARIO_A.replace("target_speed: 10", "target_speed: 30");
    assert!(matches!(
        pattern::load(&source),
        Err(DriftError::SchemaViolation(_))
    ));

    // A pattern built in code bypasses `load`, but not `validate` or `arm`.
    let mut pattern = pattern::load(SCENARIO_A).unwrap();
    let schedule = mapping::map(&pattern, &short_timeline()).unwrap();
    pattern.steps[0].target_speed = 30.0;
    assert!(matches!(
        pattern::validate(&pattern, &envelope()),
        Err(DriftError::SafetyViolation(_))
    ));

    let backend = Arc::new(ScriptedBackend::default());
    let governor = Arc::new(Governor::new(envelope(), backend.clone()));
    let mut scheduler = Scheduler::new(Some(backend.clone()), Box::new(ManualClock::new()));
    assert!(matches!(
        scheduler.arm(&pattern, schedule, governor, Mode::Simulation),
        Err(DriftError::NotArmable(_))
    ));
    assert_eq!(scheduler.state(), SchedulerState::Idle);
    assert_eq!(backend.dispatches(), 0);
}

#[test]
fn scenario_c_telemetry_overspeed_aborts_on_next_tick() {
    let pattern = pattern::load(SCENARIO_A).unwrap();
    let schedule = mapping::map(&pattern, &short_timeline()).unwrap();
    let backend = Arc::new(ScriptedBackend::default());
    backend.set_speed(10.0);
    let governor = Arc::new(Governor::new(envelope(), backend.clone()));
    let clock = ManualClock::new();
    let mut scheduler = Scheduler::new(Some(backend.clone()), Box::new(clock.clone()))
        .with_telemetry(backend.clone());

    scheduler
        .arm(&pattern, schedule, governor, Mode::Simulation)
        .unwrap();
    scheduler.start().unwrap();
    assert_eq!(scheduler.tick().unwrap(), SchedulerState::Running);
    assert_eq!(backend.dispatches(), 1);

    backend.set_speed(26.0);
    clock.set(Duration::from_millis(2000));
    assert_eq!(scheduler.tick().unwrap(), SchedulerState::Aborted);
    assert_eq!(backend.stops(), 1);
    assert_eq!(backend.dispatches(), 1);

    let report = scheduler.report().unwrap();
    assert_eq!(report.reason_code.as_deref(), Some("SPEED_CEILING_EXCEEDED"));
    assert_eq!(report.elapsed_ms, 2000.0);
}

#[test]
fn scenario_c_monitor_thread_abort_is_seen_by_scheduler() {
    let pattern = pattern::load(SCENARIO_A).unwrap();
    let schedule = mapping::map(&pattern, &short_timeline()).unwrap();
    let backend = Arc::new(ScriptedBackend::default());
    backend.set_speed(26.0);
    let governor = Arc::new(Governor::new(envelope(), backend.clone()));
    let mut scheduler = Scheduler::new(Some(backend.clone()), Box::new(ManualClock::new()));
    scheduler
        .arm(&pattern, schedule, governor.clone(), Mode::Simulation)
        .unwrap();
    scheduler.start().unwrap();

    let monitor = governor
        .spawn_monitor(backend.clone(), Duration::from_millis(1))
        .unwrap();
    while !governor.is_aborted() {
        std::thread::sleep(Duration::from_millis(1));
    }
    monitor.stop();

    assert_eq!(scheduler.tick().unwrap(), SchedulerState::Aborted);
    assert_eq!(backend.dispatches(), 0);
    assert_eq!(backend.stops(), 1);
}

#[test]
fn scenario_d_simulation_log_matches_schedule() {
    let session = Session::new(unlocked_config(), Mode::Simulation);
    let pattern = Pattern::basic_drift();
    let schedule = session.plan(&pattern, &structured_timeline()).unwrap();
    let live = Arc::new(ScriptedBackend::default());

    let prepared = session.prepare(live.clone(), Box::new(ManualClock::new()));
    let simulation = prepared.simulation_backend().unwrap();
    let report = prepared.execute(&pattern, schedule.clone()).unwrap();

    assert!(!report.is_aborted());
    assert_eq!(simulation.dispatched(), schedule.actions());
    let logged: Vec<usize> = report.dispatch_log.iter().map(|r| r.sequence).collect();
    let planned: Vec<usize> = schedule.actions().iter().map(|a| a.sequence).collect();
    assert_eq!(logged, planned);
    assert_eq!(live.dispatches(), 0);
    assert_eq!(live.stops(), 0);
}

/// Small deterministic generator so the property checks need no extra crates.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        self.0 >> 33
    }

    fn below(&mut self, bound: u64) -> u64 {
        self.next() % bound
    }

    fn unit(&mut self) -> f64 {
        self.below(1_000) as f64 / 1_000.0
    }
}

const MANEUVERS: [ManeuverKind; 5] = [
    ManeuverKind::Hold,
    ManeuverKind::ThrottleRamp,
    ManeuverKind::SteerArc,
    ManeuverKind::Brake,
    ManeuverKind::Transition,
];

const LABELS: [SegmentLabel; 4] = [
    SegmentLabel::Intro,
    SegmentLabel::Build,
    SegmentLabel::Drop,
    SegmentLabel::Outro,
];

fn generated_pattern(seed: u64) -> Pattern {
    let mut rng = Lcg(seed);
    let max_speed = 10.0 + rng.below(16) as f64;
    let count = 1 + rng.below(8) as usize;
    let mut steps: Vec<PatternStep> = Vec::with_capacity(count);

    for index in 0..count {
        let maneuver = MANEUVERS[rng.below(5) as usize];
        let anchor = match rng.below(6) {
            0 => Anchor::Offset {
                ms: rng.below(15_000) as f64,
            },
            1 => Anchor::Beat {
                index: rng.below(30) as usize,
            },
            2 => Anchor::Segment {
                label: LABELS[rng.below(4) as usize],
                edge: if rng.below(2) == 0 {
                    SegmentEdge::Start
                } else {
                    SegmentEdge::End
                },
                occurrence: 0,
            },
            3 if steps
                .last()
                .is_some_and(|previous| previous.axis() != maneuver.axis()) =>
            {
                Anchor::WithPrevious
            }
            _ => Anchor::AfterPrevious,
        };
        let duration = if rng.below(2) == 0 {
            StepDuration::Ms(100.0 + rng.below(1_500) as f64)
        } else {
            StepDuration::Beats(0.5 + rng.below(6) as f64 * 0.5)
        };
        let mut parameters = BTreeMap::new();
        if maneuver.axis() == Axis::Steering {
            parameters.insert("steering".to_string(), rng.unit() * 2.0 - 1.0);
        }
        steps.push(PatternStep {
            label: format!("step-{index}"),
            maneuver,
            anchor,
            target_speed: (rng.unit() * max_speed).floor(),
            duration,
            parameters,
        });
    }

    Pattern {
        name: format!("generated-{seed}"),
        description: "generated".into(),
        version: "1".into(),
        music_file: "generated.wav".into(),
        difficulty: drift_sync_core::Difficulty::Advanced,
        max_speed,
        steps,
    }
}

fn assert_schedule_invariants(pattern: &Pattern, schedule: &ExecutionSchedule) {
    let actions = schedule.actions();
    assert_eq!(actions.len(), pattern.steps.len(), "nothing is dropped");
    for pair in actions.windows(2) {
        assert!(pair[0].start_ms <= pair[1].start_ms, "ordered by start");
    }
    for axis in [Axis::Throttle, Axis::Steering, Axis::Brake] {
        let on_axis: Vec<&ScheduledAction> = actions.iter().filter(|a| a.axis == axis).collect();
        for pair in on_axis.windows(2) {
            assert!(
                pair[0].end_ms() <= pair[1].start_ms + 1e-6,
                "{} overlaps {} on {axis}",
                pair[0].label,
                pair[1].label
            );
        }
    }
    let ceiling = pattern.effective_ceiling(&envelope());
    for action in actions {
        assert!(action.target_speed <= ceiling);
        assert!(action.duration_ms >= 0.0);
    }
}

#[test]
fn generated_schedules_are_ordered_exclusive_and_deterministic() {
    let timeline = structured_timeline();
    let mut mapped = 0;
    for seed in 0..200 {
        let pattern = generated_pattern(seed);
        match mapping::map(&pattern, &timeline) {
            Ok(schedule) => {
                mapped += 1;
                assert_schedule_invariants(&pattern, &schedule);
                assert_eq!(mapping::map(&pattern, &timeline).unwrap(), schedule);
            }
            Err(err) => assert!(
                matches!(err, DriftError::AnchorOutOfRange { .. }),
                "seed {seed}: {err}"
            ),
        }
    }
    assert!(mapped > 60, "only {mapped} generated patterns mapped");
}

#[test]
fn abort_is_monotonic_across_generated_runs() {
    let timeline = structured_timeline();
    let settings = SchedulerSettings {
        tick: Duration::from_millis(10),
        ..SchedulerSettings::default()
    };
    for seed in 0..40 {
        let pattern = generated_pattern(seed);
        let Ok(schedule) = mapping::map(&pattern, &timeline) else {
            continue;
        };
        let backend = Arc::new(ScriptedBackend::default());
        let governor = Arc::new(Governor::new(envelope(), backend.clone()));
        let clock = ManualClock::new();
        let mut scheduler = Scheduler::new(Some(backend.clone()), Box::new(clock.clone()))
            .with_settings(settings);
        scheduler
            .arm(&pattern, schedule, governor.clone(), Mode::Simulation)
            .unwrap();
        scheduler.start().unwrap();

        let stop_at = Duration::from_millis(Lcg(seed).below(20_000));
        let mut state = scheduler.tick().unwrap();
        while !state.is_terminal() && clock.now() < stop_at {
            clock.set(clock.now() + settings.tick);
            state = scheduler.tick().unwrap();
        }
        if state.is_terminal() {
            continue;
        }

        governor.request_stop();
        let dispatched = backend.dispatches();
        for _ in 0..100 {
            clock.set(clock.now() + Duration::from_millis(250));
            assert_eq!(scheduler.tick().unwrap(), SchedulerState::Aborted);
        }
        assert_eq!(backend.dispatches(), dispatched, "seed {seed}");
        assert_eq!(backend.stops(), 1);
    }
}

fn sine_wav(sample_rate: u32, seconds: f32, amplitude: f32) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        let total = (sample_rate as f32 * seconds) as usize;
        for n in 0..total {
            let phase = 2.0 * std::f32::consts::PI * 440.0 * n as f32 / sample_rate as f32;
            writer
                .write_sample((phase.sin() * amplitude * i16::MAX as f32) as i16)
                .unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

#[test]
fn wav_track_runs_end_to_end_on_a_fixed_grid() {
    let mut config = unlocked_config();
    config.sync.beat_detection = false;
    config.sync.fallback_bpm = 120.0;
    let session = Session::new(config, Mode::Simulation);

    let timeline = session
        .analyze(&AudioSource::Encoded(sine_wav(8_000, 4.0, 0.5)))
        .unwrap();
    assert_eq!(timeline.beats()[..3], [0.0, 500.0, 1000.0]);

    let cached = AudioTimeline::from_json(&timeline.to_json().unwrap()).unwrap();
    assert_eq!(cached, timeline);

    let pattern = pattern::load(SCENARIO_A).unwrap();
    let schedule = session.plan(&pattern, &cached).unwrap();
    let report = session
        .prepare(Arc::new(ScriptedBackend::default()), Box::new(ManualClock::new()))
        .execute(&pattern, schedule)
        .unwrap();
    assert!(!report.is_aborted());
    assert_eq!(report.dispatch_log.len(), 2);
    assert_eq!(report.last_completed.unwrap().label, "brake");
}

#[test]
fn rendered_playback_applies_volume() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("processed.wav");
    let buffer = AudioSource::Encoded(sine_wav(8_000, 1.0, 0.8)).decode().unwrap();

    let mut config = AppConfig::default();
    config.audio.volume = 0.5;
    config.audio.bass_boost = false;
    drift_sync_core::render_playback(&buffer, &config.audio, &path).unwrap();

    let rendered = AudioSource::Encoded(std::fs::read(&path).unwrap())
        .decode()
        .unwrap();
    let peak = rendered.samples.iter().fold(0.0f32, |peak, s| peak.max(s.abs()));
    assert_eq!(rendered.samples.len(), buffer.samples.len());
    assert!((peak - 0.4).abs() < 0.01, "peak {peak}");
}

#[test]
fn unsupported_container_is_an_input_error() {
    let session = Session::new(AppConfig::default(), Mode::Simulation);
    let err = session
        .analyze(&AudioSource::Encoded(b"ID3\x03\x00\x00\x00".to_vec()))
        .unwrap_err();
    assert!(matches!(err, DriftError::UnsupportedFormat(_)));
    assert_eq!(err.class(), drift_sync_core::ErrorClass::Input);
}
