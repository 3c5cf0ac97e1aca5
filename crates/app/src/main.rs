use std::{
    fs,
    io::{self, BufRead},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    thread,
};

use clap::{Args, Parser, Subcommand, ValueEnum};
use drift_sync_core::{
    backend_for_provider, pattern, render_playback, AppConfig, AudioSource, AudioTimeline,
    DriftError, Governor, LoggingConfig, ManualClock, Mode, MonotonicClock, Pattern,
    RunReport, SchedulingClock, Session,
};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "config/default.yaml";
const PATTERN_DIR: &str = "patterns";
const BUILTIN_PATTERN: &str = "basic_drift";

fn main() -> drift_sync_core::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    init_tracing(&config.logging, cli.debug)?;

    match cli.command {
        Commands::Analyze { input, output } => run_analyze(config, &input, &output),
        Commands::Plan {
            track,
            pattern,
            output,
        } => run_plan(config, &track, pattern.as_deref(), output.as_deref()),
        Commands::Run(args) => run_session(config, args),
    }
}

fn run_analyze(config: AppConfig, input: &Path, output: &Path) -> drift_sync_core::Result<()> {
    tracing::info!(?input, ?output, "analysing track");
    let session = Session::new(config, Mode::Simulation);
    let timeline = session.analyze(&AudioSource::Encoded(fs::read(input)?))?;
    write_file(output, &timeline.to_json()?)?;
    tracing::info!(
        tempo_bpm = timeline.tempo_bpm(),
        beats = timeline.beats().len(),
        "analysis cache written"
    );
    Ok(())
}

fn run_plan(
    config: AppConfig,
    track: &TrackArgs,
    pattern: Option<&str>,
    output: Option<&Path>,
) -> drift_sync_core::Result<()> {
    let session = Session::new(config, Mode::Simulation);
    let pattern = load_pattern(pattern)?;
    let timeline = load_timeline(&session, track)?;
    let schedule = session.plan(&pattern, &timeline)?;

    for action in schedule.actions() {
        tracing::info!(
            start_ms = action.start_ms,
            duration_ms = action.duration_ms,
            label = %action.label,
            maneuver = %action.maneuver,
            axis = %action.axis,
            target_speed = action.target_speed,
            truncated_by = action.truncated_by.as_deref(),
            "planned"
        );
    }
    if let Some(output) = output {
        write_file(output, &schedule.to_json()?)?;
    }
    Ok(())
}

fn run_session(config: AppConfig, args: RunArgs) -> drift_sync_core::Result<()> {
    let session =
        Session::new(config, args.mode.into()).with_closed_course_ack(args.closed_course);
    tracing::info!(mode = %session.mode(), "starting session");
    if session.mode() == Mode::Drift {
        tracing::warn!("drift mode: live actuation on a closed course only");
    }

    let pattern = load_pattern(args.pattern.as_deref())?;
    tracing::info!(pattern = %pattern.name, steps = pattern.steps.len(), "using pattern");
    let source = match &args.track.audio {
        Some(path) => Some(AudioSource::Encoded(fs::read(path)?)),
        None => None,
    };
    let timeline = match &source {
        Some(source) => session.analyze(source)?,
        None => load_timeline(&session, &args.track)?,
    };
    let schedule = session.plan(&pattern, &timeline)?;

    if let Some(path) = &args.render_audio {
        let source = source.as_ref().ok_or_else(|| {
            DriftError::Config("--render-audio needs --audio".to_string())
        })?;
        render_playback(&source.decode()?, &session.config().audio, path)?;
        tracing::info!(?path, "processed playback written");
    }

    let clock: Box<dyn SchedulingClock> = if args.realtime {
        Box::new(MonotonicClock::new())
    } else {
        Box::new(ManualClock::new())
    };
    tracing::debug!("no playback position source attached; drift resync is skipped");
    let live = backend_for_provider(&session.config().autopilot);
    let prepared = session.prepare(live, clock);
    if args.realtime {
        spawn_operator_stop(prepared.governor());
    }
    let report = prepared.execute(&pattern, schedule)?;

    if let Some(path) = &args.report {
        write_file(path, &report.to_json()?)?;
    }
    finish(report)
}

/// Maps an aborted run onto the error taxonomy so the process exits non-zero.
fn finish(report: RunReport) -> drift_sync_core::Result<()> {
    if !report.is_aborted() {
        tracing::info!(%report, "session completed");
        return Ok(());
    }
    let summary = report.to_string();
    let err = match report.reason_code.as_deref() {
        Some("BACKEND_UNRESPONSIVE" | "BACKEND_REJECTED") => DriftError::Backend(summary),
        Some("INTERNAL_INCONSISTENCY") => DriftError::InternalInconsistency(summary),
        _ => DriftError::SafetyViolation(summary),
    };
    Err(err)
}

/// Typing `q` or `stop` on stdin trips the governor.
fn spawn_operator_stop(governor: Arc<Governor>) {
    let spawned = thread::Builder::new()
        .name("operator-stop".into())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if matches!(line.trim(), "q" | "stop") {
                    tracing::warn!("operator requested stop");
                    governor.request_stop();
                    break;
                }
                if governor.is_aborted() {
                    break;
                }
            }
        });
    if let Err(err) = spawned {
        tracing::warn!(%err, "operator stop unavailable");
    }
}

fn load_config(path: Option<&Path>) -> drift_sync_core::Result<AppConfig> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None if Path::new(DEFAULT_CONFIG).exists() => PathBuf::from(DEFAULT_CONFIG),
        None => return Ok(AppConfig::default()),
    };
    AppConfig::from_yaml_str(&fs::read_to_string(&path)?)
}

/// Accepts a file path or a name under `patterns/`; no argument selects the
/// built-in pattern.
fn load_pattern(reference: Option<&str>) -> drift_sync_core::Result<Pattern> {
    let reference = reference.unwrap_or(BUILTIN_PATTERN);
    let direct = PathBuf::from(reference);
    let named = Path::new(PATTERN_DIR).join(format!("{reference}.yaml"));
    let path = if direct.is_file() {
        direct
    } else if named.is_file() {
        named
    } else if reference == BUILTIN_PATTERN {
        return Ok(Pattern::basic_drift());
    } else {
        return Err(DriftError::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("pattern file not found: {reference}"),
        )));
    };
    tracing::debug!(?path, "loading pattern");
    pattern::load(&fs::read_to_string(path)?)
}

fn load_timeline(session: &Session, track: &TrackArgs) -> drift_sync_core::Result<AudioTimeline> {
    match (&track.audio, &track.timeline) {
        (Some(audio), _) => session.analyze(&AudioSource::Encoded(fs::read(audio)?)),
        (None, Some(timeline)) => AudioTimeline::from_json(&fs::read_to_string(timeline)?),
        (None, None) => Err(DriftError::Config(
            "either --audio or --timeline is required".to_string(),
        )),
    }
}

fn write_file(path: &Path, contents: &str) -> drift_sync_core::Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, contents)?;
    Ok(())
}

/// `RUST_LOG` wins, then `--debug`, then the configured level. A configured
/// file replaces stderr as the sink.
fn init_tracing(config: &LoggingConfig, debug: bool) -> drift_sync_core::Result<()> {
    let level = if debug { "debug" } else { config.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let _ = match &config.file {
        Some(file) => {
            let path = Path::new(file);
            if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
        }
        None => builder.with_writer(io::stderr).try_init(),
    };
    Ok(())
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Drives drift patterns in sync with music", long_about = None)]
struct Cli {
    /// Configuration file (defaults to config/default.yaml when present).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Log at debug level unless RUST_LOG is set.
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Analyse an audio file ahead of time and persist the timeline.
    Analyze {
        /// WAV file to analyse.
        input: PathBuf,
        /// Output path for the timeline JSON.
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate a pattern and map it onto a track without running it.
    Plan {
        #[command(flatten)]
        track: TrackArgs,
        /// Pattern file or name under patterns/.
        #[arg(short, long)]
        pattern: Option<String>,
        /// Write the execution schedule as JSON.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Execute a pattern in sync with a track.
    Run(RunArgs),
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct TrackArgs {
    /// Audio file to analyse before planning.
    #[arg(long)]
    audio: Option<PathBuf>,
    /// Timeline JSON produced by `analyze`.
    #[arg(long)]
    timeline: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(short, long, value_enum, default_value_t = ModeArg::Simulation)]
    mode: ModeArg,
    #[command(flatten)]
    track: TrackArgs,
    /// Pattern file or name under patterns/.
    #[arg(short, long)]
    pattern: Option<String>,
    /// Confirms the vehicle is on a closed course.
    #[arg(long)]
    closed_course: bool,
    /// Schedule against the wall clock instead of simulated time. No player
    /// position is reported here, so playback drift is not reconciled.
    #[arg(long)]
    realtime: bool,
    /// Write the run report as JSON.
    #[arg(long)]
    report: Option<PathBuf>,
    /// Write the volume and bass-boost processed track as WAV.
    #[arg(long)]
    render_audio: Option<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ModeArg {
    Drift,
    Simulation,
    AudioOnly,
}

impl From<ModeArg> for Mode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Drift => Mode::Drift,
            ModeArg::Simulation => Mode::Simulation,
            ModeArg::AudioOnly => Mode::AudioOnly,
        }
    }
}
