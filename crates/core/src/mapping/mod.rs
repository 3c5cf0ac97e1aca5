//! Timeline mapping: turns a [`Pattern`] and an [`AudioTimeline`] into a
//! concrete [`ExecutionSchedule`].
//!
//! Same-axis conflicts are resolved deterministically. Actions are ordered by
//! start time, then by declaration order. Whenever an action would still be
//! running when the next action on the same axis starts, it is truncated to end
//! at that start. Two steps that start together on one axis therefore leave the
//! earlier-declared one in the schedule with zero length and `truncated_by`
//! naming the step that superseded it. Nothing is dropped silently.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::{
    pattern::MAX_STEP_DURATION_MS, Anchor, AudioTimeline, Axis, DriftError, ManeuverKind, Pattern, PatternStep, PatternTiming,
    Result, SegmentEdge, StepDuration,
};

const TIME_EPSILON_MS: f64 = 1e-6;

/// One maneuver with a resolved absolute start and duration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledAction {
    /// Position within the schedule.
    pub sequence: usize,
    /// Index of the originating step in the pattern.
    pub step_index: usize,
    pub label: String,
    pub maneuver: ManeuverKind,
    pub axis: Axis,
    /// Milliseconds after playback start.
    pub start_ms: f64,
    pub duration_ms: f64,
    pub target_speed: f64,
    pub parameters: BTreeMap<String, f64>,
    /// Label of the step that cut this action short, if any.
    pub truncated_by: Option<String>,
}

impl ScheduledAction {
    pub fn end_ms(&self) -> f64 {
        self.start_ms + self.duration_ms
    }

    pub fn steering(&self) -> Option<f64> {
        self.parameters.get("steering").copied()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSchedule {
    pattern: String,
    actions: Vec<ScheduledAction>,
}

impl ExecutionSchedule {
    /// Wraps pre-built actions, checking ordering and axis exclusivity.
    pub fn new(pattern: impl Into<String>, actions: Vec<ScheduledAction>) -> Result<Self> {
        let schedule = Self {
            pattern: pattern.into(),
            actions,
        };
        schedule.verify()?;
        Ok(schedule)
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn actions(&self) -> &[ScheduledAction] {
        &self.actions
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// When the last action finishes.
    pub fn end_ms(&self) -> f64 {
        self.actions
            .iter()
            .map(ScheduledAction::end_ms)
            .fold(0.0, f64::max)
    }

    /// Re-checks the schedule invariants.
    pub fn verify(&self) -> Result<()> {
        let mut running: HashMap<Axis, &ScheduledAction> = HashMap::new();
        for (index, action) in self.actions.iter().enumerate() {
            if !(action.start_ms.is_finite() && action.duration_ms.is_finite())
                || action.start_ms < 0.0
                || action.duration_ms < 0.0
            {
                return Err(DriftError::internal(format!(
                    "action `{}` has no valid resolved time",
                    action.label
                )));
            }
            if action.sequence != index {
                return Err(DriftError::internal(format!(
                    "action `{}` carries sequence {} at position {index}",
                    action.label, action.sequence
                )));
            }
            if index > 0 && self.actions[index - 1].start_ms > action.start_ms {
                return Err(DriftError::internal(format!(
                    "action `{}` is out of start-time order",
                    action.label
                )));
            }
            if let Some(previous) = running.insert(action.axis, action) {
                if previous.end_ms() > action.start_ms + TIME_EPSILON_MS {
                    return Err(DriftError::internal(format!(
                        "actions `{}` and `{}` overlap on the {} axis",
                        previous.label, action.label, action.axis
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MapOptions {
    pub timing: PatternTiming,
}

/// Maps with default options.
pub fn map(pattern: &Pattern, timeline: &AudioTimeline) -> Result<ExecutionSchedule> {
    map_with(pattern, timeline, MapOptions::default())
}

/// Resolves every anchor and duration, orders the result and applies the
/// same-axis truncation rule. Pure: identical inputs give identical schedules.
pub fn map_with(
    pattern: &Pattern,
    timeline: &AudioTimeline,
    options: MapOptions,
) -> Result<ExecutionSchedule> {
    let mut actions: Vec<ScheduledAction> = Vec::with_capacity(pattern.steps.len());
    let mut previous: Option<(f64, f64)> = None;

    for (step_index, step) in pattern.steps.iter().enumerate() {
        let mut start_ms = resolve_start(step, previous, timeline)?;
        if options.timing == PatternTiming::Beat {
            start_ms = timeline.nearest_beat(start_ms).unwrap_or(start_ms);
        }
        if start_ms > timeline.duration_ms() + TIME_EPSILON_MS {
            return Err(out_of_range(
                step,
                format!(
                    "starts at {start_ms:.1} ms, after the track ends at {:.1} ms",
                    timeline.duration_ms()
                ),
            ));
        }

        let duration_ms = match step.duration {
            StepDuration::Ms(ms) => ms,
            StepDuration::Beats(beats) => {
                let position = timeline.beat_position(start_ms);
                timeline.time_at_beat_position(position + beats) - start_ms
            }
        };
        if !(duration_ms.is_finite() && duration_ms > 0.0) {
            return Err(DriftError::internal(format!(
                "step `{}` resolved to a non-positive duration",
                step.label
            )));
        }
        if duration_ms > MAX_STEP_DURATION_MS {
            return Err(out_of_range(
                step,
                format!("runs for {duration_ms:.1} ms, over the {MAX_STEP_DURATION_MS} ms step limit"),
            ));
        }

        previous = Some((start_ms, duration_ms));
        actions.push(ScheduledAction {
            sequence: 0,
            step_index,
            label: step.label.clone(),
            maneuver: step.maneuver,
            axis: step.axis(),
            start_ms,
            duration_ms,
            target_speed: step.target_speed,
            parameters: step.parameters.clone(),
            truncated_by: None,
        });
    }

    actions.sort_by(|a, b| {
        a.start_ms
            .total_cmp(&b.start_ms)
            .then(a.step_index.cmp(&b.step_index))
    });

    let mut last_on_axis: HashMap<Axis, usize> = HashMap::new();
    for index in 0..actions.len() {
        let axis = actions[index].axis;
        if let Some(earlier) = last_on_axis.insert(axis, index) {
            let cut_at = actions[index].start_ms;
            if actions[earlier].end_ms() > cut_at {
                let superseded_by = actions[index].label.clone();
                let truncated = &mut actions[earlier];
                tracing::warn!(
                    step = %truncated.label,
                    by = %superseded_by,
                    axis = %axis,
                    from_ms = truncated.duration_ms,
                    to_ms = cut_at - truncated.start_ms,
                    "truncating overlapping action"
                );
                truncated.duration_ms = (cut_at - truncated.start_ms).max(0.0);
                truncated.truncated_by = Some(superseded_by);
            }
        }
    }

    for (sequence, action) in actions.iter_mut().enumerate() {
        action.sequence = sequence;
    }

    ExecutionSchedule::new(pattern.name.clone(), actions)
}

fn resolve_start(
    step: &PatternStep,
    previous: Option<(f64, f64)>,
    timeline: &AudioTimeline,
) -> Result<f64> {
    match &step.anchor {
        Anchor::AfterPrevious => Ok(previous.map_or(0.0, |(start, duration)| start + duration)),
        Anchor::WithPrevious => previous.map(|(start, _)| start).ok_or_else(|| {
            DriftError::internal(format!(
                "step `{}` starts with a previous step that does not exist",
                step.label
            ))
        }),
        Anchor::Offset { ms } => Ok(*ms),
        Anchor::Beat { index } => timeline.beat_at(*index).ok_or_else(|| {
            out_of_range(
                step,
                format!("beat {index} requested, track has {} beats", timeline.beats().len()),
            )
        }),
        Anchor::Segment {
            label,
            edge,
            occurrence,
        } => {
            let segment = timeline.segment(*label, *occurrence).ok_or_else(|| {
                out_of_range(
                    step,
                    format!("track has no {label} segment #{occurrence}"),
                )
            })?;
            Ok(match edge {
                SegmentEdge::Start => segment.start_ms,
                SegmentEdge::End => segment.end_ms,
            })
        }
    }
}

fn out_of_range(step: &PatternStep, detail: String) -> DriftError {
    DriftError::AnchorOutOfRange {
        step: step.label.clone(),
        detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Difficulty, Segment, SegmentLabel};

    fn timeline() -> AudioTimeline {
        let beats = (0..=16).map(|beat| beat as f64 * 500.0).collect();
        AudioTimeline::new(
            44_100,
            8_000.0,
            120.0,
            beats,
            vec![
                Segment {
                    label: SegmentLabel::Build,
                    start_ms: 0.0,
                    end_ms: 4_000.0,
                    tempo_bpm: 120.0,
                },
                Segment {
                    label: SegmentLabel::Drop,
                    start_ms: 4_000.0,
                    end_ms: 8_000.0,
                    tempo_bpm: 120.0,
                },
            ],
        )
        .unwrap()
    }

    fn step(label: &str, maneuver: ManeuverKind, anchor: Anchor, duration: StepDuration) -> PatternStep {
        PatternStep {
            label: label.to_string(),
            maneuver,
            anchor,
            target_speed: 10.0,
            duration,
            parameters: BTreeMap::new(),
        }
    }

    fn pattern(steps: Vec<PatternStep>) -> Pattern {
        Pattern {
            name: "test".into(),
            description: String::new(),
            version: "1".into(),
            music_file: "a.wav".into(),
            difficulty: Difficulty::Beginner,
            max_speed: 25.0,
            steps,
        }
    }

    #[test]
    fn lays_out_sequential_steps() {
        let pattern = pattern(vec![
            step("a", ManeuverKind::Hold, Anchor::AfterPrevious, StepDuration::Beats(2.0)),
            step("b", ManeuverKind::ThrottleRamp, Anchor::AfterPrevious, StepDuration::Ms(700.0)),
        ]);
        let schedule = map(&pattern, &timeline()).unwrap();
        let starts: Vec<f64> = schedule.actions().iter().map(|a| a.start_ms).collect();
        assert_eq!(starts, vec![0.0, 1_000.0]);
        assert_eq!(schedule.end_ms(), 1_700.0);
    }

    #[test]
    fn resolves_beat_and_segment_anchors() {
        let pattern = pattern(vec![
            step("on-beat", ManeuverKind::Hold, Anchor::Beat { index: 3 }, StepDuration::Ms(100.0)),
            step(
                "drop-end",
                ManeuverKind::Brake,
                Anchor::Segment {
                    label: SegmentLabel::Build,
                    edge: SegmentEdge::End,
                    occurrence: 0,
                },
                StepDuration::Beats(1.0),
            ),
        ]);
        let schedule = map(&pattern, &timeline()).unwrap();
        assert_eq!(schedule.actions()[0].start_ms, 1_500.0);
        assert_eq!(schedule.actions()[1].start_ms, 4_000.0);
        assert_eq!(schedule.actions()[1].duration_ms, 500.0);
    }

    #[test]
    fn beat_index_past_the_track_is_out_of_range() {
        let pattern = pattern(vec![step(
            "late",
            ManeuverKind::Hold,
            Anchor::Beat { index: 17 },
            StepDuration::Ms(100.0),
        )]);
        let err = map(&pattern, &timeline()).unwrap_err();
        assert!(matches!(err, DriftError::AnchorOutOfRange { ref step, .. } if step == "late"));
    }

    #[test]
    fn huge_beat_duration_is_out_of_range() {
        let pattern = pattern(vec![step(
            "endless",
            ManeuverKind::Hold,
            Anchor::Beat { index: 16 },
            StepDuration::Beats(1e20),
        )]);
        let err = map(&pattern, &timeline()).unwrap_err();
        assert!(matches!(err, DriftError::AnchorOutOfRange { ref step, .. } if step == "endless"));
    }

    #[test]
    fn missing_segment_is_out_of_range() {
        let pattern = pattern(vec![step(
            "outro",
            ManeuverKind::Brake,
            Anchor::Segment {
                label: SegmentLabel::Outro,
                edge: SegmentEdge::Start,
                occurrence: 0,
            },
            StepDuration::Ms(100.0),
        )]);
        assert!(matches!(
            map(&pattern, &timeline()),
            Err(DriftError::AnchorOutOfRange { .. })
        ));
    }

    #[test]
    fn different_axes_run_concurrently() {
        let pattern = pattern(vec![
            step("hold", ManeuverKind::Hold, Anchor::AfterPrevious, StepDuration::Ms(2_000.0)),
            step("arc", ManeuverKind::SteerArc, Anchor::WithPrevious, StepDuration::Ms(1_000.0)),
        ]);
        let schedule = map(&pattern, &timeline()).unwrap();
        assert_eq!(schedule.actions()[0].start_ms, 0.0);
        assert_eq!(schedule.actions()[1].start_ms, 0.0);
        assert!(schedule.actions().iter().all(|a| a.truncated_by.is_none()));
    }

    #[test]
    fn later_declared_step_wins_a_same_start_conflict() {
        let pattern = pattern(vec![
            step("first", ManeuverKind::Hold, Anchor::Offset { ms: 1_000.0 }, StepDuration::Ms(800.0)),
            step("second", ManeuverKind::ThrottleRamp, Anchor::Offset { ms: 1_000.0 }, StepDuration::Ms(400.0)),
        ]);
        let schedule = map(&pattern, &timeline()).unwrap();
        let first = &schedule.actions()[0];
        let second = &schedule.actions()[1];
        assert_eq!(first.label, "first");
        assert_eq!(first.duration_ms, 0.0);
        assert_eq!(first.truncated_by.as_deref(), Some("second"));
        assert_eq!(second.duration_ms, 400.0);
    }

    #[test]
    fn overlapping_same_axis_action_is_cut_at_the_conflict() {
        let pattern = pattern(vec![
            step("long", ManeuverKind::Hold, Anchor::Offset { ms: 0.0 }, StepDuration::Ms(3_000.0)),
            step("cut-in", ManeuverKind::ThrottleRamp, Anchor::Beat { index: 2 }, StepDuration::Ms(500.0)),
        ]);
        let schedule = map(&pattern, &timeline()).unwrap();
        assert_eq!(schedule.actions()[0].duration_ms, 1_000.0);
        assert!(schedule.verify().is_ok());
    }

    #[test]
    fn beat_timing_snaps_starts_to_the_grid() {
        let pattern = pattern(vec![step(
            "loose",
            ManeuverKind::Hold,
            Anchor::Offset { ms: 1_180.0 },
            StepDuration::Ms(100.0),
        )]);
        let options = MapOptions {
            timing: PatternTiming::Beat,
        };
        let schedule = map_with(&pattern, &timeline(), options).unwrap();
        assert_eq!(schedule.actions()[0].start_ms, 1_000.0);
    }

    #[test]
    fn verify_rejects_overlaps() {
        let action = |sequence, start_ms| ScheduledAction {
            sequence,
            step_index: sequence,
            label: format!("a{sequence}"),
            maneuver: ManeuverKind::Hold,
            axis: Axis::Throttle,
            start_ms,
            duration_ms: 1_000.0,
            target_speed: 5.0,
            parameters: BTreeMap::new(),
            truncated_by: None,
        };
        let result = ExecutionSchedule::new("bad", vec![action(0, 0.0), action(1, 500.0)]);
        assert!(matches!(result, Err(DriftError::InternalInconsistency(_))));
    }
}
