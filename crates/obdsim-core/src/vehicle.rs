//! Vehicle state model
//!
//! A single process-wide simulation drives every sensor PID with
//! time-correlated, physically plausible values: an ignition/engine state
//! machine, first-order sensor dynamics and the readiness drive-cycle
//! model. The tick task is the sole writer; request handlers read through
//! value-type [`Snapshot`]s taken under the mutex.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info};

use crate::profile::VehicleProfile;
use crate::readiness::ReadinessMonitors;

/// Shared handle to the vehicle model. Single writer (the tick task),
/// many snapshot readers.
pub type SharedVehicle = Arc<Mutex<VehicleSim>>;

/// Ignition switch position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnitionState {
    Off,
    Accessory,
    On,
    Start,
}

/// Engine operating state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Off,
    Cranking,
    Running,
    Stalling,
}

/// Read-consistent copy of the vehicle state handed to service handlers.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub ignition: IgnitionState,
    pub engine: EngineState,
    pub rpm: f32,
    pub speed: f32,
    pub engine_load: f32,
    pub coolant_temp: f32,
    pub intake_temp: f32,
    pub maf: f32,
    pub throttle: f32,
    pub fuel_level: f32,
    pub battery_v: f32,
    pub runtime_s: f32,
    pub distance_km: f32,
    pub distance_mil_on: f32,
    pub distance_since_clear: f32,
    pub short_fuel_trim: f32,
    pub long_fuel_trim: f32,
    pub timing_advance: f32,
    pub o2_voltage: f32,
    pub fuel_pressure: f32,
    pub fuel_rate: f32,
    pub catalyst_temp: f32,
    pub barometric_kpa: f32,
    pub warmups_since_clear: u8,
    pub mil_on: bool,
    pub operation_cycle: u32,
    pub readiness: ReadinessMonitors,
}

/// Tunable simulation parameters, filled from the vehicle profile.
#[derive(Debug, Clone, Copy)]
pub struct VehicleConfig {
    pub rpm_idle: f32,
    pub rpm_max: f32,
    pub coolant_temp_normal: f32,
    pub fuel_capacity_l: f32,
    pub ambient_temp: f32,
}

impl Default for VehicleConfig {
    fn default() -> Self {
        Self {
            rpm_idle: 750.0,
            rpm_max: 6500.0,
            coolant_temp_normal: 90.0,
            fuel_capacity_l: 50.0,
            ambient_temp: 20.0,
        }
    }
}

/// Direct sensor pins used by the control surface; a pinned value wins over
/// the simulated one until unpinned.
#[derive(Debug, Clone, Copy, Default)]
pub struct SensorOverrides {
    pub rpm: Option<f32>,
    pub speed: Option<f32>,
}

/// Largest tick the integrators accept.
const MAX_TICK_S: f32 = 0.1;
/// Simplified transmission ratio tying road speed to RPM.
const GEAR_RATIO: f32 = 3.5;

pub struct VehicleSim {
    cfg: VehicleConfig,
    ignition: IgnitionState,
    engine: EngineState,
    crank_elapsed: f32,
    crank_target: f32,

    rpm: f32,
    speed: f32,
    engine_load: f32,
    coolant_temp: f32,
    intake_temp: f32,
    maf: f32,
    throttle: f32,
    fuel_level: f32,
    battery_v: f32,
    runtime_s: f32,
    distance_km: f32,
    distance_mil_on: f32,
    distance_since_clear: f32,
    short_fuel_trim: f32,
    long_fuel_trim: f32,
    timing_advance: f32,
    o2_voltage: f32,
    fuel_pressure: f32,
    fuel_rate: f32,
    catalyst_temp: f32,
    barometric_kpa: f32,
    warmups_since_clear: u8,
    mil_on: bool,
    operation_cycle: u32,

    readiness: ReadinessMonitors,
    overrides: SensorOverrides,

    // actuator state driven by UDS InputOutputControl
    throttle_override: Option<f32>,
    cooling_fan_on: bool,
    fuel_pump_enabled: bool,
}

impl VehicleSim {
    pub fn new(cfg: VehicleConfig) -> Self {
        Self {
            cfg,
            ignition: IgnitionState::Off,
            engine: EngineState::Off,
            crank_elapsed: 0.0,
            crank_target: 0.0,
            rpm: 0.0,
            speed: 0.0,
            engine_load: 0.0,
            coolant_temp: cfg.ambient_temp,
            intake_temp: cfg.ambient_temp + 5.0,
            maf: 0.0,
            throttle: 0.0,
            fuel_level: 75.0,
            battery_v: 12.6,
            runtime_s: 0.0,
            distance_km: 0.0,
            distance_mil_on: 0.0,
            distance_since_clear: 0.0,
            short_fuel_trim: 0.0,
            long_fuel_trim: 0.0,
            timing_advance: 0.0,
            o2_voltage: 0.45,
            fuel_pressure: 380.0,
            fuel_rate: 0.0,
            catalyst_temp: cfg.ambient_temp,
            barometric_kpa: 101.3,
            warmups_since_clear: 0,
            mil_on: false,
            operation_cycle: 0,
            readiness: ReadinessMonitors::new(),
            overrides: SensorOverrides::default(),
            throttle_override: None,
            cooling_fan_on: false,
            fuel_pump_enabled: true,
        }
    }

    pub fn from_profile(profile: &VehicleProfile) -> Self {
        Self::new(profile.vehicle_config())
    }

    /// Advance the simulation by `dt` seconds (clamped to 100 ms).
    pub fn tick(&mut self, dt: f32) {
        let dt = dt.clamp(0.0, MAX_TICK_S);
        match self.engine {
            EngineState::Running => self.tick_running(dt),
            EngineState::Cranking => self.tick_cranking(dt),
            EngineState::Stalling => self.tick_stalling(dt),
            EngineState::Off => self.tick_off(dt),
        }
        self.apply_overrides();
        if !matches!(self.engine, EngineState::Running | EngineState::Stalling) {
            self.rpm = 0.0;
        }
    }

    fn tick_running(&mut self, dt: f32) {
        if !self.fuel_pump_enabled || self.fuel_level <= 0.0 {
            info!("fuel starved, engine stalling");
            self.engine = EngineState::Stalling;
            return;
        }

        self.runtime_s += dt;

        let throttle = self.effective_throttle() / 100.0;
        let target_rpm = self.cfg.rpm_idle + (self.cfg.rpm_max - self.cfg.rpm_idle) * throttle;
        self.rpm += (target_rpm - self.rpm) * (dt / 0.5);
        self.rpm += rand::thread_rng().gen_range(-8.0..8.0) * dt * 10.0;
        self.rpm = self.rpm.clamp(self.cfg.rpm_idle * 0.9, self.cfg.rpm_max);

        let rpm_factor =
            (self.rpm - self.cfg.rpm_idle) / (self.cfg.rpm_max - self.cfg.rpm_idle).max(1.0);
        let speed_factor = (self.speed / 120.0).min(1.0);
        self.engine_load =
            (throttle * 100.0 * (0.5 + 0.5 * rpm_factor) * (0.7 + 0.3 * speed_factor))
                .clamp(0.0, 100.0);

        if self.rpm > self.cfg.rpm_idle {
            let target_speed = (self.rpm - self.cfg.rpm_idle) / GEAR_RATIO / 60.0 * 10.0;
            self.speed += (target_speed - self.speed) * dt;
        } else {
            self.speed = (self.speed - 5.0 * dt).max(0.0);
        }

        let travelled = self.speed * (dt / 3600.0);
        self.distance_km += travelled;
        self.distance_since_clear += travelled;
        if self.mil_on {
            self.distance_mil_on += travelled;
        }

        self.maf = compute_maf(self.rpm, self.engine_load);

        if self.coolant_temp < self.cfg.coolant_temp_normal {
            let warmup_rate = 2.0 + (self.engine_load / 100.0) * 3.0;
            self.coolant_temp += warmup_rate * dt;
        } else {
            self.coolant_temp = self.cfg.coolant_temp_normal;
        }
        if self.cooling_fan_on {
            self.coolant_temp = (self.coolant_temp - 0.5 * dt).max(self.cfg.ambient_temp);
        }

        self.intake_temp = self.cfg.ambient_temp + self.engine_load * 0.3;
        self.timing_advance = (self.rpm / self.cfg.rpm_max) * 30.0
            + (100.0 - self.engine_load) / 100.0 * 10.0;

        let consumption_lph = self.engine_load * 0.01 + (self.rpm / 1000.0) * 0.05;
        self.fuel_rate = consumption_lph;
        self.fuel_level -=
            (consumption_lph * (dt / 3600.0) / self.cfg.fuel_capacity_l) * 100.0;
        self.fuel_level = self.fuel_level.max(0.0);

        self.o2_voltage = 0.45 + (self.runtime_s * 2.0).sin() * 0.05;
        if self.o2_voltage < 0.4 {
            self.short_fuel_trim = (self.short_fuel_trim + dt * 2.0).min(25.0);
        } else if self.o2_voltage > 0.5 {
            self.short_fuel_trim = (self.short_fuel_trim - dt * 2.0).max(-25.0);
        }
        self.long_fuel_trim +=
            (self.short_fuel_trim - self.long_fuel_trim) * dt * 0.1;

        if self.coolant_temp > 70.0 {
            let target = 400.0 + self.engine_load * 2.0;
            self.catalyst_temp += (target - self.catalyst_temp) * dt * 0.1;
        }

        self.battery_v = 14.2 - (self.engine_load / 100.0) * 0.3;
        self.readiness.tick(dt);
    }

    fn tick_cranking(&mut self, dt: f32) {
        self.crank_elapsed += dt;
        // supply sags while the starter is engaged
        self.battery_v = 10.5;
        if self.crank_elapsed < self.crank_target {
            return;
        }
        if self.fuel_pump_enabled {
            info!(
                crank_s = self.crank_target,
                cycle = self.operation_cycle + 1,
                "engine started"
            );
            self.engine = EngineState::Running;
            self.rpm = self.cfg.rpm_idle;
            self.battery_v = 14.2;
            self.operation_cycle += 1;
            if self.coolant_temp < 50.0 {
                self.warmups_since_clear = self.warmups_since_clear.saturating_add(1);
            }
        } else {
            info!("crank timed out, engine off");
            self.engine = EngineState::Off;
            self.battery_v = 12.6;
        }
    }

    fn tick_stalling(&mut self, dt: f32) {
        self.rpm -= 2000.0 * dt;
        self.speed = (self.speed - 5.0 * dt).max(0.0);
        self.engine_load = 0.0;
        self.maf = 0.0;
        self.fuel_rate = 0.0;
        if self.rpm <= 0.0 {
            self.rpm = 0.0;
            self.engine = EngineState::Off;
        }
    }

    fn tick_off(&mut self, dt: f32) {
        if self.coolant_temp > self.cfg.ambient_temp {
            self.coolant_temp =
                (self.coolant_temp - 0.5 * dt).max(self.cfg.ambient_temp);
        }
        if self.catalyst_temp > self.cfg.ambient_temp {
            self.catalyst_temp =
                (self.catalyst_temp - 2.0 * dt).max(self.cfg.ambient_temp);
        }
        self.rpm = 0.0;
        self.speed = 0.0;
        self.engine_load = 0.0;
        self.maf = 0.0;
        self.fuel_rate = 0.0;
        self.battery_v = 12.6;
        self.runtime_s = 0.0;
    }

    fn apply_overrides(&mut self) {
        if self.engine == EngineState::Running {
            if let Some(rpm) = self.overrides.rpm {
                self.rpm = rpm.clamp(0.0, 16383.0);
                self.maf = compute_maf(self.rpm, self.engine_load);
            }
            if let Some(speed) = self.overrides.speed {
                self.speed = speed.clamp(0.0, 255.0);
            }
        }
    }

    // --- control inputs -------------------------------------------------

    pub fn set_ignition(&mut self, state: IgnitionState) {
        debug!(?state, "ignition");
        self.ignition = state;
        match state {
            IgnitionState::Off | IgnitionState::Accessory => {
                if self.engine != EngineState::Off {
                    info!("ignition removed, engine off");
                }
                self.engine = EngineState::Off;
                self.tick_off(0.0);
            }
            IgnitionState::Start => {
                self.begin_crank();
            }
            IgnitionState::On => {}
        }
    }

    /// Start cranking. Returns `false` when the ignition does not permit it.
    /// Starting an already-running engine is a no-op.
    pub fn start_engine(&mut self) -> bool {
        match self.engine {
            EngineState::Running | EngineState::Cranking => true,
            _ => {
                if !matches!(self.ignition, IgnitionState::On | IgnitionState::Start) {
                    return false;
                }
                self.begin_crank();
                true
            }
        }
    }

    fn begin_crank(&mut self) {
        if self.engine == EngineState::Off {
            self.engine = EngineState::Cranking;
            self.crank_elapsed = 0.0;
            self.crank_target = rand::thread_rng().gen_range(0.5..2.0);
            debug!(crank_s = self.crank_target, "cranking");
        }
    }

    pub fn stop_engine(&mut self) {
        self.engine = EngineState::Off;
        self.tick_off(0.0);
    }

    pub fn set_throttle(&mut self, percent: f32) {
        self.throttle = percent.clamp(0.0, 100.0);
    }

    pub fn pin_rpm(&mut self, rpm: Option<f32>) {
        self.overrides.rpm = rpm;
        self.apply_overrides();
    }

    pub fn pin_speed(&mut self, speed: Option<f32>) {
        self.overrides.speed = speed;
        self.apply_overrides();
    }

    pub fn set_mil(&mut self, on: bool) {
        if on != self.mil_on {
            info!(mil = on, "MIL state changed");
        }
        self.mil_on = on;
    }

    // --- actuator hooks (UDS 0x2F) --------------------------------------

    pub fn set_throttle_override(&mut self, value: Option<f32>) {
        self.throttle_override = value.map(|v| v.clamp(0.0, 100.0));
    }

    pub fn throttle_override(&self) -> Option<f32> {
        self.throttle_override
    }

    pub fn set_cooling_fan(&mut self, on: bool) {
        self.cooling_fan_on = on;
    }

    pub fn cooling_fan_on(&self) -> bool {
        self.cooling_fan_on
    }

    pub fn set_fuel_pump(&mut self, enabled: bool) {
        self.fuel_pump_enabled = enabled;
    }

    pub fn fuel_pump_enabled(&self) -> bool {
        self.fuel_pump_enabled
    }

    pub fn clear_actuator_overrides(&mut self) {
        self.throttle_override = None;
        self.cooling_fan_on = false;
        self.fuel_pump_enabled = true;
    }

    fn effective_throttle(&self) -> f32 {
        self.throttle_override.unwrap_or(self.throttle)
    }

    /// Clear-DTC side effects: readiness monitors and the since-clear
    /// counters reset.
    pub fn on_dtcs_cleared(&mut self) {
        self.readiness.reset();
        self.distance_since_clear = 0.0;
        self.distance_mil_on = 0.0;
        self.warmups_since_clear = 0;
    }

    pub fn readiness(&self) -> &ReadinessMonitors {
        &self.readiness
    }

    pub fn operation_cycle(&self) -> u32 {
        self.operation_cycle
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            ignition: self.ignition,
            engine: self.engine,
            rpm: self.rpm,
            speed: self.speed,
            engine_load: self.engine_load,
            coolant_temp: self.coolant_temp,
            intake_temp: self.intake_temp,
            maf: self.maf,
            throttle: self.effective_throttle(),
            fuel_level: self.fuel_level,
            battery_v: self.battery_v,
            runtime_s: self.runtime_s,
            distance_km: self.distance_km,
            distance_mil_on: self.distance_mil_on,
            distance_since_clear: self.distance_since_clear,
            short_fuel_trim: self.short_fuel_trim,
            long_fuel_trim: self.long_fuel_trim,
            timing_advance: self.timing_advance,
            o2_voltage: self.o2_voltage,
            fuel_pressure: self.fuel_pressure,
            fuel_rate: self.fuel_rate,
            catalyst_temp: self.catalyst_temp,
            barometric_kpa: self.barometric_kpa,
            warmups_since_clear: self.warmups_since_clear,
            mil_on: self.mil_on,
            operation_cycle: self.operation_cycle,
            readiness: self.readiness.clone(),
        }
    }
}

/// Mass air flow as a function of RPM and load, monotonic in both.
pub(crate) fn compute_maf(rpm: f32, load: f32) -> f32 {
    ((rpm / 1000.0) * (load / 100.0) * 5.0).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Run the engine from key-on to RUNNING, ticking through the crank
    /// phase.
    fn run_until_started(vehicle: &mut VehicleSim) {
        vehicle.set_ignition(IgnitionState::On);
        assert!(vehicle.start_engine());
        for _ in 0..40 {
            vehicle.tick(0.1);
            if vehicle.snapshot().engine == EngineState::Running {
                return;
            }
        }
        panic!("engine did not start within 4 s of cranking");
    }

    #[test]
    fn engine_starts_after_bounded_crank() {
        let mut vehicle = VehicleSim::new(VehicleConfig::default());
        run_until_started(&mut vehicle);
        let snap = vehicle.snapshot();
        assert_eq!(snap.engine, EngineState::Running);
        assert!(snap.rpm > 0.0);
        assert_eq!(snap.operation_cycle, 1);
    }

    #[test]
    fn start_requires_ignition_on() {
        let mut vehicle = VehicleSim::new(VehicleConfig::default());
        assert!(!vehicle.start_engine());
        vehicle.set_ignition(IgnitionState::Accessory);
        assert!(!vehicle.start_engine());
    }

    #[test]
    fn starting_a_running_engine_is_a_noop() {
        let mut vehicle = VehicleSim::new(VehicleConfig::default());
        run_until_started(&mut vehicle);
        let cycle = vehicle.snapshot().operation_cycle;
        assert!(vehicle.start_engine());
        vehicle.tick(0.1);
        assert_eq!(vehicle.snapshot().operation_cycle, cycle);
        assert_eq!(vehicle.snapshot().engine, EngineState::Running);
    }

    #[test]
    fn ignition_off_zeroes_rpm_within_one_tick() {
        let mut vehicle = VehicleSim::new(VehicleConfig::default());
        run_until_started(&mut vehicle);
        vehicle.set_ignition(IgnitionState::Off);
        vehicle.tick(0.1);
        let snap = vehicle.snapshot();
        assert_eq!(snap.engine, EngineState::Off);
        assert_eq!(snap.rpm, 0.0);
        assert_eq!(snap.maf, 0.0);
    }

    #[test]
    fn rpm_zero_iff_not_running_or_stalling() {
        let mut vehicle = VehicleSim::new(VehicleConfig::default());
        vehicle.set_ignition(IgnitionState::On);
        vehicle.start_engine();
        // during cranking the tachometer still reads zero
        vehicle.tick(0.1);
        let snap = vehicle.snapshot();
        if !matches!(snap.engine, EngineState::Running | EngineState::Stalling) {
            assert_eq!(snap.rpm, 0.0);
        }
    }

    #[test]
    fn maf_is_monotonic_in_rpm_and_load() {
        assert!(compute_maf(2000.0, 50.0) > compute_maf(1000.0, 50.0));
        assert!(compute_maf(2000.0, 80.0) > compute_maf(2000.0, 50.0));
    }

    #[test]
    fn coolant_warms_toward_normal_while_running() {
        let mut vehicle = VehicleSim::new(VehicleConfig::default());
        run_until_started(&mut vehicle);
        let before = vehicle.snapshot().coolant_temp;
        for _ in 0..100 {
            vehicle.tick(0.1);
        }
        let after = vehicle.snapshot().coolant_temp;
        assert!(after > before);
        assert!(after <= 90.0 + f32::EPSILON);
    }

    #[test]
    fn distance_with_mil_accumulates_only_while_mil_on() {
        let mut vehicle = VehicleSim::new(VehicleConfig::default());
        run_until_started(&mut vehicle);
        vehicle.set_throttle(40.0);
        for _ in 0..50 {
            vehicle.tick(0.1);
        }
        assert_eq!(vehicle.snapshot().distance_mil_on, 0.0);
        vehicle.set_mil(true);
        for _ in 0..50 {
            vehicle.tick(0.1);
        }
        let first = vehicle.snapshot().distance_mil_on;
        assert!(first > 0.0);
        for _ in 0..50 {
            vehicle.tick(0.1);
        }
        assert!(vehicle.snapshot().distance_mil_on >= first);
    }

    #[test]
    fn pinned_rpm_survives_ticks() {
        let mut vehicle = VehicleSim::new(VehicleConfig::default());
        run_until_started(&mut vehicle);
        vehicle.pin_rpm(Some(1250.0));
        for _ in 0..10 {
            vehicle.tick(0.1);
        }
        assert_eq!(vehicle.snapshot().rpm, 1250.0);
        vehicle.pin_rpm(None);
    }

    #[test]
    fn clear_dtcs_resets_monitors_and_counters() {
        let mut vehicle = VehicleSim::new(VehicleConfig::default());
        run_until_started(&mut vehicle);
        vehicle.set_mil(true);
        vehicle.set_throttle(30.0);
        for _ in 0..200 {
            vehicle.tick(0.1);
        }
        assert!(vehicle.snapshot().distance_mil_on > 0.0);
        vehicle.on_dtcs_cleared();
        let snap = vehicle.snapshot();
        assert_eq!(snap.distance_mil_on, 0.0);
        assert_eq!(snap.distance_since_clear, 0.0);
        assert_eq!(snap.warmups_since_clear, 0);
        assert!(!snap.readiness.all_supported_complete());
    }
}
