use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Axis, DenyReason, ManeuverKind, Mode, Result, ScheduledAction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Completed,
    Aborted,
}

/// Enough of a [`ScheduledAction`] to identify it after the fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSummary {
    pub sequence: usize,
    pub label: String,
    pub maneuver: ManeuverKind,
    pub start_ms: f64,
    pub end_ms: f64,
}

impl From<&ScheduledAction> for ActionSummary {
    fn from(action: &ScheduledAction) -> Self {
        Self {
            sequence: action.sequence,
            label: action.label.clone(),
            maneuver: action.maneuver,
            start_ms: action.start_ms,
            end_ms: action.end_ms(),
        }
    }
}

impl fmt::Display for ActionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} ({}) at {:.0} ms",
            self.sequence, self.label, self.maneuver, self.start_ms
        )
    }
}

/// One action that passed the governor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub sequence: usize,
    pub label: String,
    pub maneuver: ManeuverKind,
    pub axis: Axis,
    pub scheduled_ms: f64,
    pub dispatched_ms: f64,
    pub target_speed: f64,
    /// False when the mode suppresses actuation or the action has zero length.
    pub actuated: bool,
}

impl DispatchRecord {
    pub fn new(action: &ScheduledAction, dispatched_ms: f64, actuated: bool) -> Self {
        Self {
            sequence: action.sequence,
            label: action.label.clone(),
            maneuver: action.maneuver,
            axis: action.axis,
            scheduled_ms: action.start_ms,
            dispatched_ms,
            target_speed: action.target_speed,
            actuated,
        }
    }

    pub fn lateness_ms(&self) -> f64 {
        self.dispatched_ms - self.scheduled_ms
    }
}

/// What happened during one run, for diagnosis and reproduction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub pattern: String,
    pub mode: Mode,
    pub outcome: RunOutcome,
    pub reason_code: Option<String>,
    pub reason: Option<DenyReason>,
    pub elapsed_ms: f64,
    pub last_completed: Option<ActionSummary>,
    pub last_dispatched: Option<ActionSummary>,
    pub scheduled_actions: usize,
    pub dispatch_log: Vec<DispatchRecord>,
    pub cues: usize,
}

impl RunReport {
    pub fn is_aborted(&self) -> bool {
        self.outcome == RunOutcome::Aborted
    }

    pub fn max_lateness_ms(&self) -> f64 {
        self.dispatch_log
            .iter()
            .map(DispatchRecord::lateness_ms)
            .fold(0.0, f64::max)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.outcome {
            RunOutcome::Completed => write!(
                f,
                "{} completed in {} mode: {}/{} actions after {:.0} ms",
                self.pattern,
                self.mode,
                self.dispatch_log.len(),
                self.scheduled_actions,
                self.elapsed_ms
            ),
            RunOutcome::Aborted => {
                write!(
                    f,
                    "{} aborted in {} mode after {:.0} ms",
                    self.pattern, self.mode, self.elapsed_ms
                )?;
                if let Some(reason) = &self.reason {
                    write!(f, ": [{}] {reason}", reason.code())?;
                }
                match &self.last_completed {
                    Some(action) => write!(f, "; last completed {action}"),
                    None => f.write_str("; no action completed"),
                }
            }
        }
    }
}
