//! OBD-II readiness monitors and their drive-cycle completion model
//!
//! Each emission subsystem carries a self-test monitor that completes after
//! enough engine run time in the current drive cycle. Clearing DTCs resets
//! every supported monitor to incomplete.

use serde::Serialize;

/// The eleven standardized readiness monitors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Monitor {
    Misfire,
    FuelSystem,
    Components,
    Catalyst,
    HeatedCatalyst,
    Evap,
    SecondaryAir,
    AcRefrigerant,
    O2Sensor,
    O2Heater,
    Egr,
}

impl Monitor {
    pub const ALL: [Monitor; 11] = [
        Monitor::Misfire,
        Monitor::FuelSystem,
        Monitor::Components,
        Monitor::Catalyst,
        Monitor::HeatedCatalyst,
        Monitor::Evap,
        Monitor::SecondaryAir,
        Monitor::AcRefrigerant,
        Monitor::O2Sensor,
        Monitor::O2Heater,
        Monitor::Egr,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Monitor::Misfire => "misfire",
            Monitor::FuelSystem => "fuel_system",
            Monitor::Components => "components",
            Monitor::Catalyst => "catalyst",
            Monitor::HeatedCatalyst => "heated_catalyst",
            Monitor::Evap => "evap",
            Monitor::SecondaryAir => "secondary_air",
            Monitor::AcRefrigerant => "ac_refrigerant",
            Monitor::O2Sensor => "o2_sensor",
            Monitor::O2Heater => "o2_heater",
            Monitor::Egr => "egr",
        }
    }

    /// Seconds of engine run time needed to complete the monitor, or `None`
    /// for monitors this vehicle does not support.
    fn completion_budget(&self) -> Option<f32> {
        match self {
            Monitor::Components => Some(10.0),
            Monitor::FuelSystem => Some(30.0),
            Monitor::O2Sensor | Monitor::O2Heater => Some(45.0),
            Monitor::Misfire => Some(60.0),
            Monitor::Evap => Some(90.0),
            Monitor::Egr => Some(180.0),
            Monitor::Catalyst | Monitor::HeatedCatalyst => Some(300.0),
            Monitor::SecondaryAir | Monitor::AcRefrigerant => None,
        }
    }

    /// Continuous monitors report in byte B of Mode 01 PID 01; the rest in
    /// bytes C/D.
    fn is_continuous(&self) -> bool {
        matches!(
            self,
            Monitor::Misfire | Monitor::FuelSystem | Monitor::Components
        )
    }

    /// Bit position within the continuous or non-continuous bitmap.
    fn bit(&self) -> u8 {
        match self {
            Monitor::Misfire => 0,
            Monitor::FuelSystem => 1,
            Monitor::Components => 2,
            Monitor::Catalyst => 0,
            Monitor::HeatedCatalyst => 1,
            Monitor::Evap => 2,
            Monitor::SecondaryAir => 3,
            Monitor::AcRefrigerant => 4,
            Monitor::O2Sensor => 5,
            Monitor::O2Heater => 6,
            Monitor::Egr => 7,
        }
    }
}

/// Current state of one monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    SupportedComplete,
    SupportedIncomplete,
    Unsupported,
}

#[derive(Debug, Clone, Copy, Serialize)]
struct MonitorEntry {
    monitor: Monitor,
    state: MonitorState,
    remaining_s: f32,
}

/// The full monitor set for one vehicle.
#[derive(Debug, Clone, Serialize)]
pub struct ReadinessMonitors {
    entries: [MonitorEntry; 11],
}

impl ReadinessMonitors {
    pub fn new() -> Self {
        let entries = Monitor::ALL.map(|monitor| match monitor.completion_budget() {
            Some(budget) => MonitorEntry {
                monitor,
                state: MonitorState::SupportedIncomplete,
                remaining_s: budget,
            },
            None => MonitorEntry {
                monitor,
                state: MonitorState::Unsupported,
                remaining_s: 0.0,
            },
        });
        Self { entries }
    }

    /// Advance every incomplete monitor by `dt` seconds of engine run time.
    pub fn tick(&mut self, dt: f32) {
        for entry in &mut self.entries {
            if entry.state == MonitorState::SupportedIncomplete {
                entry.remaining_s -= dt;
                if entry.remaining_s <= 0.0 {
                    entry.remaining_s = 0.0;
                    entry.state = MonitorState::SupportedComplete;
                }
            }
        }
    }

    /// Reset all supported monitors to incomplete with fresh budgets.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn state(&self, monitor: Monitor) -> MonitorState {
        self.entries
            .iter()
            .find(|e| e.monitor == monitor)
            .map(|e| e.state)
            .expect("all monitors present")
    }

    pub fn iter(&self) -> impl Iterator<Item = (Monitor, MonitorState)> + '_ {
        self.entries.iter().map(|e| (e.monitor, e.state))
    }

    pub fn all_supported_complete(&self) -> bool {
        self.entries
            .iter()
            .all(|e| e.state != MonitorState::SupportedIncomplete)
    }

    fn bitmap(&self, continuous: bool, f: impl Fn(&MonitorEntry) -> bool) -> u8 {
        self.entries
            .iter()
            .filter(|e| e.monitor.is_continuous() == continuous && f(e))
            .fold(0u8, |acc, e| acc | (1 << e.monitor.bit()))
    }

    /// PID 01 byte B bits 0-2: continuous monitors supported.
    pub fn continuous_supported(&self) -> u8 {
        self.bitmap(true, |e| e.state != MonitorState::Unsupported)
    }

    /// PID 01 byte B bits 4-6: continuous monitors not yet complete.
    pub fn continuous_incomplete(&self) -> u8 {
        self.bitmap(true, |e| e.state == MonitorState::SupportedIncomplete)
    }

    /// PID 01 byte C: non-continuous monitors supported.
    pub fn non_continuous_supported(&self) -> u8 {
        self.bitmap(false, |e| e.state != MonitorState::Unsupported)
    }

    /// PID 01 byte D: non-continuous monitors not yet complete.
    pub fn non_continuous_incomplete(&self) -> u8 {
        self.bitmap(false, |e| e.state == MonitorState::SupportedIncomplete)
    }
}

impl Default for ReadinessMonitors {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_set_is_supported_incomplete_except_unsupported() {
        let monitors = ReadinessMonitors::new();
        assert_eq!(
            monitors.state(Monitor::Misfire),
            MonitorState::SupportedIncomplete
        );
        assert_eq!(
            monitors.state(Monitor::SecondaryAir),
            MonitorState::Unsupported
        );
        assert_eq!(
            monitors.state(Monitor::AcRefrigerant),
            MonitorState::Unsupported
        );
    }

    #[test]
    fn components_monitor_completes_first() {
        let mut monitors = ReadinessMonitors::new();
        for _ in 0..110 {
            monitors.tick(0.1);
        }
        assert_eq!(
            monitors.state(Monitor::Components),
            MonitorState::SupportedComplete
        );
        assert_eq!(
            monitors.state(Monitor::Catalyst),
            MonitorState::SupportedIncomplete
        );
    }

    #[test]
    fn reset_returns_completed_monitors_to_incomplete() {
        let mut monitors = ReadinessMonitors::new();
        monitors.tick(1000.0);
        assert!(monitors.all_supported_complete());
        monitors.reset();
        assert_eq!(
            monitors.state(Monitor::Misfire),
            MonitorState::SupportedIncomplete
        );
    }

    #[test]
    fn bitmaps_follow_standard_bit_layout() {
        let mut monitors = ReadinessMonitors::new();
        assert_eq!(monitors.continuous_supported(), 0b0000_0111);
        assert_eq!(monitors.continuous_incomplete(), 0b0000_0111);
        // secondary air (bit 3) and A/C (bit 4) unsupported
        assert_eq!(monitors.non_continuous_supported(), 0b1110_0111);
        assert_eq!(monitors.non_continuous_incomplete(), 0b1110_0111);

        monitors.tick(3000.0);
        assert_eq!(monitors.continuous_incomplete(), 0);
        assert_eq!(monitors.non_continuous_incomplete(), 0);
    }
}
