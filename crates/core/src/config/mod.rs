use serde::{Deserialize, Serialize};

use crate::{DriftError, Mode, Result, SafetyEnvelope};

/// Top-level configuration structure for the application.
///
/// Every section rejects unknown keys so that typos surface at load time
/// instead of silently falling back to defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub autopilot: AutopilotConfig,
    pub audio: AudioConfig,
    pub analysis: AnalysisConfig,
    pub sync: SyncConfig,
    pub safety: SafetyConfig,
    pub logging: LoggingConfig,
    pub development: DevelopmentConfig,
}

impl AppConfig {
    /// Parses a YAML document. An empty document yields the defaults.
    pub fn from_yaml_str(source: &str) -> Result<Self> {
        if source.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: AppConfig = serde_yaml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let ceiling = self.safety.absolute_max_speed;
        if !(ceiling.is_finite() && ceiling > 0.0) {
            return Err(DriftError::Config(format!(
                "safety.absolute_max_speed must be positive, got {ceiling}"
            )));
        }
        let max_speed = self.autopilot.max_speed;
        if !(max_speed.is_finite() && max_speed > 0.0) || max_speed > ceiling {
            return Err(DriftError::Config(format!(
                "autopilot.max_speed must be in (0, {ceiling}], got {max_speed}"
            )));
        }
        if !(0.0..=1.0).contains(&self.audio.volume) {
            return Err(DriftError::Config(format!(
                "audio.volume must be within [0, 1], got {}",
                self.audio.volume
            )));
        }
        if self.safety.allowed_modes.is_empty() {
            return Err(DriftError::Config(
                "safety.allowed_modes must name at least one mode".into(),
            ));
        }
        self.analysis.validate()?;
        self.sync.validate()
    }

    /// Builds the read-only envelope the governor enforces during a run.
    pub fn safety_envelope(&self) -> SafetyEnvelope {
        SafetyEnvelope {
            absolute_max_speed: self.safety.absolute_max_speed,
            allowed_modes: self.safety.allowed_modes.clone(),
            require_closed_course_ack: self.safety.require_closed_course_ack,
        }
    }

    /// Resolves the mode a run should use, honouring the simulation-only lock.
    pub fn effective_mode(&self, requested: Mode) -> Mode {
        if requested != Mode::Simulation && self.development.simulation_only {
            tracing::warn!(
                requested = %requested,
                "forcing simulation mode because development.simulation_only is set"
            );
            Mode::Simulation
        } else {
            requested
        }
    }
}

/// Which autopilot integration drives the vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Simulation,
    Tesla,
    Comma,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AutopilotConfig {
    pub provider: Provider,
    pub safety_mode: bool,
    /// Speed the autopilot will clamp commands to.
    pub max_speed: f64,
}

impl Default for AutopilotConfig {
    fn default() -> Self {
        Self {
            provider: Provider::Simulation,
            safety_mode: true,
            max_speed: 25.0,
        }
    }
}

/// Configuration specific to the audio playback chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AudioConfig {
    pub output_device: String,
    pub volume: f32,
    pub bass_boost: bool,
    pub bass_frequency: f32,
    pub bass_gain_db: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            output_device: "default".to_string(),
            volume: 0.7,
            bass_boost: true,
            bass_frequency: 80.0,
            bass_gain_db: 6.0,
        }
    }
}

/// Tunables for the beat and structure detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalysisConfig {
    pub frame_size: usize,
    pub hop_size: usize,
    pub min_bpm: f64,
    pub max_bpm: f64,
    /// Shortest track (in ms) the detector will attempt to analyse.
    pub min_signal_ms: f64,
    /// Minimum normalised autocorrelation peak accepted as a tempo.
    pub min_confidence: f32,
    pub segment_window_ms: f64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            frame_size: 1024,
            hop_size: 512,
            min_bpm: 60.0,
            max_bpm: 200.0,
            min_signal_ms: 2_000.0,
            min_confidence: 0.2,
            segment_window_ms: 1_000.0,
        }
    }
}

impl AnalysisConfig {
    fn validate(&self) -> Result<()> {
        if self.frame_size < 2 || self.hop_size == 0 || self.hop_size > self.frame_size {
            return Err(DriftError::Config(format!(
                "analysis.frame_size/hop_size must satisfy 0 < hop <= frame, got {}/{}",
                self.frame_size, self.hop_size
            )));
        }
        if !(self.min_bpm > 0.0 && self.min_bpm < self.max_bpm) {
            return Err(DriftError::Config(format!(
                "analysis.min_bpm must be positive and below max_bpm, got {}..{}",
                self.min_bpm, self.max_bpm
            )));
        }
        if self.segment_window_ms <= 0.0 {
            return Err(DriftError::Config(
                "analysis.segment_window_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// How resolved step times relate to the beat grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PatternTiming {
    /// Use anchor times exactly as resolved.
    #[default]
    Auto,
    /// Snap every resolved start to the nearest beat.
    Beat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub beat_detection: bool,
    pub pattern_timing: PatternTiming,
    pub visual_feedback: bool,
    /// Tempo used for the fixed grid when beat detection is disabled.
    pub fallback_bpm: f64,
    pub tick_interval_ms: u64,
    pub resync_interval_ms: u64,
    pub drift_tolerance_ms: f64,
    pub backend_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            beat_detection: true,
            pattern_timing: PatternTiming::Auto,
            visual_feedback: true,
            fallback_bpm: 150.0,
            tick_interval_ms: 10,
            resync_interval_ms: 250,
            drift_tolerance_ms: 80.0,
            backend_timeout_ms: 50,
        }
    }
}

impl SyncConfig {
    fn validate(&self) -> Result<()> {
        if self.tick_interval_ms == 0 {
            return Err(DriftError::Config("sync.tick_interval_ms must be > 0".into()));
        }
        if self.fallback_bpm <= 0.0 {
            return Err(DriftError::Config("sync.fallback_bpm must be > 0".into()));
        }
        if self.drift_tolerance_ms <= 0.0 {
            return Err(DriftError::Config(
                "sync.drift_tolerance_ms must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SafetyConfig {
    pub absolute_max_speed: f64,
    pub allowed_modes: Vec<Mode>,
    pub require_closed_course_ack: bool,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            absolute_max_speed: 25.0,
            allowed_modes: vec![Mode::Simulation, Mode::AudioOnly],
            require_closed_course_ack: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DevelopmentConfig {
    pub simulation_only: bool,
}

impl Default for DevelopmentConfig {
    fn default() -> Self {
        Self {
            simulation_only: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = AppConfig::from_yaml_str("").unwrap();
        assert_eq!(config.autopilot.provider, Provider::Simulation);
        assert_eq!(config.safety.absolute_max_speed, 25.0);
        assert!(config.development.simulation_only);
    }

    #[test]
    fn parses_recognised_options() {
        let yaml = r#"
autopilot:
  provider: comma
  safety_mode: true
  max_speed: 20
audio:
  output_device: hw:1
  volume: 0.5
  bass_boost: false
sync:
  beat_detection: false
  pattern_timing: beat
  visual_feedback: false
safety:
  absolute_max_speed: 30
  allowed_modes: [drift, simulation, audio-only]
  require_closed_course_ack: true
development:
  simulation_only: false
"#;
        let config = AppConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.autopilot.provider, Provider::Comma);
        assert_eq!(config.audio.output_device, "hw:1");
        assert_eq!(config.sync.pattern_timing, PatternTiming::Beat);
        assert!(config.safety.allowed_modes.contains(&Mode::AudioOnly));

        let envelope = config.safety_envelope();
        assert_eq!(envelope.absolute_max_speed, 30.0);
        assert!(envelope.require_closed_course_ack);
    }

    #[test]
    fn rejects_unknown_keys() {
        let err = AppConfig::from_yaml_str("sync:\n  beat_detect: true\n").unwrap_err();
        assert!(err.to_string().contains("beat_detect"));
    }

    #[test]
    fn rejects_autopilot_speed_above_absolute_ceiling() {
        let yaml = "autopilot:\n  max_speed: 40\nsafety:\n  absolute_max_speed: 25\n";
        let err = AppConfig::from_yaml_str(yaml).unwrap_err();
        assert!(matches!(err, DriftError::Config(_)));
    }

    #[test]
    fn simulation_only_forces_simulation() {
        let config = AppConfig::default();
        assert_eq!(config.effective_mode(Mode::Drift), Mode::Simulation);

        let mut unlocked = AppConfig::default();
        unlocked.development.simulation_only = false;
        assert_eq!(unlocked.effective_mode(Mode::AudioOnly), Mode::AudioOnly);
    }
}
