//! Actuation backend capabilities.
//!
//! The core never speaks a vendor protocol. It depends on three narrow
//! capabilities so that each component can be handed only what it needs: the
//! scheduler gets [`Actuator`] and [`TelemetrySource`], the safety governor gets
//! [`EmergencyStop`] and [`TelemetrySource`].

use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::{AutopilotConfig, Axis, Provider, ScheduledAction};

/// Live vehicle state reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    pub speed: f64,
    pub steering_angle: f64,
    pub timestamp_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Ack,
    Reject(String),
}

/// Acknowledgement of an emergency stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack;

/// Normal driving commands.
pub trait Actuator: Send + Sync {
    fn dispatch(&self, action: &ScheduledAction) -> DispatchOutcome;
}

pub trait TelemetrySource: Send + Sync {
    /// Latest reading, or `None` when the backend cannot report one.
    fn telemetry(&self) -> Option<Telemetry>;
}

/// Safety-only capability, kept apart from [`Actuator`].
pub trait EmergencyStop: Send + Sync {
    fn emergency_stop(&self) -> Ack;
}

/// Everything a complete backend provides.
pub trait ActuationBackend: Actuator + TelemetrySource + EmergencyStop {}

impl<T: Actuator + TelemetrySource + EmergencyStop> ActuationBackend for T {}

#[derive(Debug, Default)]
struct SimulatedVehicle {
    speed: f64,
    steering: f64,
    dispatched: Vec<ScheduledAction>,
    emergency_stops: usize,
}

/// Stand-in vehicle that records every command.
///
/// Commanded speed is clamped to the configured autopilot ceiling and steering to
/// `[-1, 1]`; telemetry reports the commanded state.
#[derive(Debug)]
pub struct SimulationBackend {
    max_speed: f64,
    state: Mutex<SimulatedVehicle>,
}

impl SimulationBackend {
    pub fn new(max_speed: f64) -> Self {
        Self {
            max_speed,
            state: Mutex::new(SimulatedVehicle::default()),
        }
    }

    /// Every action accepted so far, in dispatch order.
    pub fn dispatched(&self) -> Vec<ScheduledAction> {
        self.lock().dispatched.clone()
    }

    pub fn emergency_stops(&self) -> usize {
        self.lock().emergency_stops
    }

    fn lock(&self) -> MutexGuard<'_, SimulatedVehicle> {
        // Emergency stop must keep working after a panic on another thread.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Actuator for SimulationBackend {
    fn dispatch(&self, action: &ScheduledAction) -> DispatchOutcome {
        let mut vehicle = self.lock();
        if vehicle.emergency_stops > 0 {
            return DispatchOutcome::Reject("vehicle is emergency-stopped".into());
        }
        match action.axis {
            Axis::Brake => vehicle.speed = action.target_speed.min(vehicle.speed),
            Axis::Throttle | Axis::Steering => {
                vehicle.speed = action.target_speed.min(self.max_speed)
            }
        }
        if let Some(steering) = action.steering() {
            vehicle.steering = steering.clamp(-1.0, 1.0);
        }
        tracing::debug!(
            action = %action.label,
            speed = vehicle.speed,
            steering = vehicle.steering,
            "simulated dispatch"
        );
        vehicle.dispatched.push(action.clone());
        DispatchOutcome::Ack
    }
}

impl TelemetrySource for SimulationBackend {
    fn telemetry(&self) -> Option<Telemetry> {
        let vehicle = self.lock();
        Some(Telemetry {
            speed: vehicle.speed,
            steering_angle: vehicle.steering,
            timestamp_ms: 0.0,
        })
    }
}

impl EmergencyStop for SimulationBackend {
    fn emergency_stop(&self) -> Ack {
        let mut vehicle = self.lock();
        vehicle.emergency_stops += 1;
        vehicle.speed = 0.0;
        vehicle.steering = 0.0;
        tracing::warn!("simulated emergency stop");
        Ack
    }
}

/// Builds the backend for the configured provider.
///
/// Only the simulation vehicle exists today; vendor providers are recognised so
/// that configurations naming them stay valid, and fall back to simulation.
pub fn backend_for_provider(config: &AutopilotConfig) -> Arc<SimulationBackend> {
    match config.provider {
        Provider::Simulation => {}
        Provider::Tesla | Provider::Comma => tracing::warn!(
            provider = ?config.provider,
            "autopilot provider has no integration, using simulation"
        ),
    }
    if config.safety_mode {
        tracing::info!(max_speed = config.max_speed, "autopilot safety mode enabled");
    }
    Arc::new(SimulationBackend::new(config.max_speed))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::ManeuverKind;

    fn action(maneuver: ManeuverKind, target_speed: f64, steering: Option<f64>) -> ScheduledAction {
        let mut parameters = BTreeMap::new();
        if let Some(steering) = steering {
            parameters.insert("steering".to_string(), steering);
        }
        ScheduledAction {
            sequence: 0,
            step_index: 0,
            label: maneuver.to_string(),
            maneuver,
            axis: maneuver.axis(),
            start_ms: 0.0,
            duration_ms: 100.0,
            target_speed,
            parameters,
            truncated_by: None,
        }
    }

    #[test]
    fn clamps_speed_and_steering() {
        let backend = SimulationBackend::new(20.0);
        backend.dispatch(&action(ManeuverKind::SteerArc, 30.0, Some(-1.5)));

        let telemetry = backend.telemetry().unwrap();
        assert_eq!(telemetry.speed, 20.0);
        assert_eq!(telemetry.steering_angle, -1.0);
        assert_eq!(backend.dispatched().len(), 1);
    }

    #[test]
    fn brake_only_lowers_speed() {
        let backend = SimulationBackend::new(25.0);
        backend.dispatch(&action(ManeuverKind::Hold, 15.0, None));
        backend.dispatch(&action(ManeuverKind::Brake, 20.0, None));
        assert_eq!(backend.telemetry().unwrap().speed, 15.0);
        backend.dispatch(&action(ManeuverKind::Brake, 0.0, None));
        assert_eq!(backend.telemetry().unwrap().speed, 0.0);
    }

    #[test]
    fn rejects_commands_after_emergency_stop() {
        let backend = SimulationBackend::new(25.0);
        backend.dispatch(&action(ManeuverKind::Hold, 15.0, None));
        assert_eq!(backend.emergency_stop(), Ack);
        assert_eq!(backend.telemetry().unwrap().speed, 0.0);
        assert!(matches!(
            backend.dispatch(&action(ManeuverKind::Hold, 5.0, None)),
            DispatchOutcome::Reject(_)
        ));
    }

    #[test]
    fn vendor_providers_fall_back_to_simulation() {
        let config = AutopilotConfig {
            provider: Provider::Tesla,
            ..AutopilotConfig::default()
        };
        let backend = backend_for_provider(&config);
        assert_eq!(backend.emergency_stops(), 0);
    }
}
