//! Declarative drift patterns.
//!
//! Patterns arrive as YAML documents from the pattern source collaborator.
//! [`load`] only parses and checks the document's own invariants; the
//! envelope-dependent checks live in [`validate`] so the same pattern can be
//! re-checked against different safety envelopes.

use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{DriftError, Result, SafetyEnvelope, SegmentLabel};

/// Longest time a single step may hold its axis.
pub const MAX_STEP_DURATION_MS: f64 = 3_600_000.0;
/// Longest beat-relative step: an hour at 240 BPM.
pub const MAX_STEP_BEATS: f64 = 14_400.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Beginner,
    Intermediate,
    Advanced,
}

/// Independent control channel that carries one command at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    Throttle,
    Steering,
    Brake,
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Throttle => "throttle",
            Self::Steering => "steering",
            Self::Brake => "brake",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ManeuverKind {
    Hold,
    ThrottleRamp,
    SteerArc,
    Brake,
    Transition,
}

impl ManeuverKind {
    pub fn axis(self) -> Axis {
        match self {
            Self::Hold | Self::ThrottleRamp => Axis::Throttle,
            Self::SteerArc | Self::Transition => Axis::Steering,
            Self::Brake => Axis::Brake,
        }
    }
}

impl FromStr for ManeuverKind {
    type Err = DriftError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "hold" => Ok(Self::Hold),
            "throttle-ramp" => Ok(Self::ThrottleRamp),
            "steer-arc" => Ok(Self::SteerArc),
            "brake" => Ok(Self::Brake),
            "transition" => Ok(Self::Transition),
            _ => Err(DriftError::UnknownManeuverKind(value.to_string())),
        }
    }
}

impl fmt::Display for ManeuverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Hold => "hold",
            Self::ThrottleRamp => "throttle-ramp",
            Self::SteerArc => "steer-arc",
            Self::Brake => "brake",
            Self::Transition => "transition",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentEdge {
    #[default]
    Start,
    End,
}

/// Where a step starts on the track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Anchor {
    /// Starts when the previously declared step ends.
    AfterPrevious,
    /// Starts together with the previously declared step, on another axis.
    WithPrevious,
    Offset { ms: f64 },
    Beat { index: usize },
    Segment {
        label: SegmentLabel,
        edge: SegmentEdge,
        occurrence: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepDuration {
    Ms(f64),
    Beats(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatternStep {
    pub label: String,
    pub maneuver: ManeuverKind,
    pub anchor: Anchor,
    pub target_speed: f64,
    pub duration: StepDuration,
    /// Maneuver-specific values such as `steering` in `[-1, 1]`.
    pub parameters: BTreeMap<String, f64>,
}

impl PatternStep {
    pub fn axis(&self) -> Axis {
        self.maneuver.axis()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Pattern {
    pub name: String,
    pub description: String,
    pub version: String,
    pub music_file: String,
    pub difficulty: Difficulty,
    pub max_speed: f64,
    pub steps: Vec<PatternStep>,
}

impl Pattern {
    /// Five-step demonstration pattern used when no pattern file is supplied.
    pub fn basic_drift() -> Self {
        let step = |label: &str, maneuver, target_speed, steering: f64, duration_ms| PatternStep {
            label: label.to_string(),
            maneuver,
            anchor: Anchor::AfterPrevious,
            target_speed,
            duration: StepDuration::Ms(duration_ms),
            parameters: BTreeMap::from([("steering".to_string(), steering)]),
        };

        Self {
            name: "Basic Drift".to_string(),
            description: "Simple drift pattern for demonstration".to_string(),
            version: "1.0".to_string(),
            music_file: "music/default_phonk.wav".to_string(),
            difficulty: Difficulty::Beginner,
            max_speed: 25.0,
            steps: vec![
                step("straight", ManeuverKind::Hold, 20.0, 0.0, 3_000.0),
                step("left-drift", ManeuverKind::SteerArc, 15.0, -0.7, 2_000.0),
                step("recover-left", ManeuverKind::Transition, 18.0, 0.3, 1_500.0),
                step("right-drift", ManeuverKind::SteerArc, 15.0, 0.7, 2_000.0),
                step("recover-right", ManeuverKind::Transition, 18.0, -0.3, 1_500.0),
            ],
        }
    }

    /// The speed no step may exceed under `envelope`.
    pub fn effective_ceiling(&self, envelope: &SafetyEnvelope) -> f64 {
        self.max_speed.min(envelope.absolute_max_speed)
    }
}

/// Parses a pattern document. Performs no I/O.
pub fn load(source: &str) -> Result<Pattern> {
    let raw: RawPattern = serde_yaml::from_str(source)
        .map_err(|err| DriftError::schema(format!("malformed pattern document: {err}")))?;
    raw.into_pattern()
}

/// Checks every step against the pattern's own ceiling and the global envelope.
pub fn validate(pattern: &Pattern, envelope: &SafetyEnvelope) -> Result<()> {
    if pattern.max_speed > envelope.absolute_max_speed {
        return Err(DriftError::SafetyViolation(format!(
            "pattern `{}` declares max_speed {} above the absolute ceiling {}",
            pattern.name, pattern.max_speed, envelope.absolute_max_speed
        )));
    }
    let ceiling = pattern.effective_ceiling(envelope);
    for step in &pattern.steps {
        if step.target_speed > ceiling {
            return Err(DriftError::SafetyViolation(format!(
                "step `{}` targets {} but the ceiling is {ceiling}",
                step.label, step.target_speed
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPattern {
    name: Option<String>,
    description: Option<String>,
    version: Option<serde_yaml::Value>,
    music_file: Option<String>,
    difficulty: Option<Difficulty>,
    max_speed: Option<f64>,
    steps: Option<Vec<RawStep>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStep {
    #[serde(alias = "name")]
    label: Option<String>,
    #[serde(alias = "kind")]
    maneuver: Option<String>,
    anchor: Option<RawAnchor>,
    #[serde(alias = "speed")]
    target_speed: Option<f64>,
    duration_ms: Option<f64>,
    duration_beats: Option<f64>,
    /// Seconds, as older pattern files write it.
    duration: Option<f64>,
    steering: Option<f64>,
    #[serde(default)]
    parameters: BTreeMap<String, f64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawAnchor {
    Keyword(String),
    Offset(OffsetAnchor),
    Beat(BeatAnchor),
    Segment(SegmentAnchor),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct OffsetAnchor {
    offset_ms: f64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BeatAnchor {
    beat: usize,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SegmentAnchor {
    segment: SegmentLabel,
    #[serde(default)]
    edge: SegmentEdge,
    #[serde(default)]
    occurrence: usize,
}

fn required<T>(value: Option<T>, field: &str) -> Result<T> {
    value.ok_or_else(|| DriftError::schema(format!("missing required field `{field}`")))
}

impl RawPattern {
    fn into_pattern(self) -> Result<Pattern> {
        let name = required(self.name, "name")?;
        let description = required(self.description, "description")?;
        let version = match required(self.version, "version")? {
            serde_yaml::Value::String(text) => text,
            serde_yaml::Value::Number(number) => number.to_string(),
            other => {
                return Err(DriftError::schema(format!(
                    "`version` must be a string or number, got {other:?}"
                )))
            }
        };
        let music_file = required(self.music_file, "music_file")?;
        let difficulty = required(self.difficulty, "difficulty")?;
        let max_speed = required(self.max_speed, "max_speed")?;
        let raw_steps = required(self.steps, "steps")?;

        if !(max_speed.is_finite() && max_speed > 0.0) {
            return Err(DriftError::schema(format!(
                "`max_speed` must be positive, got {max_speed}"
            )));
        }
        if raw_steps.is_empty() {
            return Err(DriftError::schema("pattern must declare at least one step"));
        }

        let mut steps: Vec<PatternStep> = Vec::with_capacity(raw_steps.len());
        for (index, raw) in raw_steps.into_iter().enumerate() {
            let step = raw.into_step(index, max_speed)?;
            if step.anchor == Anchor::WithPrevious {
                match steps.last() {
                    None => {
                        return Err(DriftError::schema(format!(
                            "step `{}` cannot start with a previous step: it is the first step",
                            step.label
                        )))
                    }
                    Some(previous) if previous.axis() == step.axis() => {
                        return Err(DriftError::schema(format!(
                            "step `{}` overlaps `{}` on the {} axis",
                            step.label,
                            previous.label,
                            step.axis()
                        )))
                    }
                    Some(_) => {}
                }
            }
            steps.push(step);
        }

        Ok(Pattern {
            name,
            description,
            version,
            music_file,
            difficulty,
            max_speed,
            steps,
        })
    }
}

impl RawStep {
    fn into_step(self, index: usize, max_speed: f64) -> Result<PatternStep> {
        let label = self.label.unwrap_or_else(|| format!("step-{index}"));
        let maneuver: ManeuverKind = match self.maneuver {
            Some(kind) => kind.parse()?,
            // Older files give only speed and steering.
            None if self.steering.is_some_and(|steering| steering != 0.0) => {
                ManeuverKind::SteerArc
            }
            None => ManeuverKind::Hold,
        };
        let target_speed = self.target_speed.ok_or_else(|| {
            DriftError::schema(format!("step `{label}` is missing `target_speed`"))
        })?;
        if !(target_speed.is_finite() && target_speed >= 0.0) {
            return Err(DriftError::schema(format!(
                "step `{label}` has invalid target_speed {target_speed}"
            )));
        }
        if target_speed > max_speed {
            return Err(DriftError::schema(format!(
                "step `{label}` targets {target_speed}, above the pattern max_speed {max_speed}"
            )));
        }

        let duration_ms = match (self.duration_ms, self.duration) {
            (Some(_), Some(_)) => {
                return Err(DriftError::schema(format!(
                    "step `{label}` sets both duration_ms and duration"
                )))
            }
            (ms, seconds) => ms.or(seconds.map(|seconds| seconds * 1000.0)),
        };
        let duration = match (duration_ms, self.duration_beats) {
            (Some(ms), None) if ms.is_finite() && ms > 0.0 => StepDuration::Ms(ms),
            (None, Some(beats)) if beats.is_finite() && beats > 0.0 => StepDuration::Beats(beats),
            (Some(_), Some(_)) => {
                return Err(DriftError::schema(format!(
                    "step `{label}` sets both a time and a beat duration"
                )))
            }
            (None, None) => {
                return Err(DriftError::schema(format!(
                    "step `{label}` needs duration_ms, duration or duration_beats"
                )))
            }
            _ => {
                return Err(DriftError::schema(format!(
                    "step `{label}` has a non-positive duration"
                )))
            }
        };
        match duration {
            StepDuration::Ms(ms) if ms > MAX_STEP_DURATION_MS => {
                return Err(DriftError::schema(format!(
                    "step `{label}` lasts {ms} ms, longer than {MAX_STEP_DURATION_MS} ms"
                )))
            }
            StepDuration::Beats(beats) if beats > MAX_STEP_BEATS => {
                return Err(DriftError::schema(format!(
                    "step `{label}` lasts {beats} beats, longer than {MAX_STEP_BEATS}"
                )))
            }
            _ => {}
        }

        let anchor = match self.anchor {
            None => Anchor::AfterPrevious,
            Some(RawAnchor::Keyword(keyword)) => match keyword.as_str() {
                "after_previous" => Anchor::AfterPrevious,
                "with_previous" => Anchor::WithPrevious,
                other => {
                    return Err(DriftError::schema(format!(
                        "step `{label}` has unknown anchor `{other}`"
                    )))
                }
            },
            Some(RawAnchor::Offset(OffsetAnchor { offset_ms })) => {
                if !(offset_ms.is_finite() && offset_ms >= 0.0) {
                    return Err(DriftError::schema(format!(
                        "step `{label}` has negative offset {offset_ms}"
                    )));
                }
                Anchor::Offset { ms: offset_ms }
            }
            Some(RawAnchor::Beat(BeatAnchor { beat })) => Anchor::Beat { index: beat },
            Some(RawAnchor::Segment(anchor)) => Anchor::Segment {
                label: anchor.segment,
                edge: anchor.edge,
                occurrence: anchor.occurrence,
            },
        };

        let mut parameters = self.parameters;
        if let Some(steering) = self.steering {
            parameters.insert("steering".to_string(), steering);
        }
        if let Some(steering) = parameters.get("steering") {
            if !(-1.0..=1.0).contains(steering) {
                return Err(DriftError::schema(format!(
                    "step `{label}` steering {steering} is outside [-1, 1]"
                )));
            }
        }

        Ok(PatternStep {
            label,
            maneuver,
            anchor,
            target_speed,
            duration,
            parameters,
        })
    }
}
