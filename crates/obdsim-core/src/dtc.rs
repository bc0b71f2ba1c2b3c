//! Diagnostic trouble code lifecycle
//!
//! A [`DtcManager`] owns the fault set of one ECU: pending/confirmed/
//! permanent promotion, freeze frames, MIL contribution and the OBD/UDS
//! wire encodings. The promotion rules live here rather than being spread
//! across the update paths.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::vehicle::{EngineState, Snapshot};

/// DTC status byte bits per ISO 14229-1.
pub mod status_bit {
    pub const TEST_FAILED: u8 = 0x01;
    pub const TEST_FAILED_THIS_OPERATION_CYCLE: u8 = 0x02;
    pub const PENDING_DTC: u8 = 0x04;
    pub const CONFIRMED_DTC: u8 = 0x08;
    pub const TEST_NOT_COMPLETED_SINCE_LAST_CLEAR: u8 = 0x10;
    pub const TEST_FAILED_SINCE_LAST_CLEAR: u8 = 0x20;
    pub const TEST_NOT_COMPLETED_THIS_OPERATION_CYCLE: u8 = 0x40;
    pub const WARNING_INDICATOR_REQUESTED: u8 = 0x80;
}

/// All-groups filter for ClearDiagnosticInformation.
pub const GROUP_ALL: u32 = 0xFF_FF_FF;

/// DTC category, the 2-bit prefix of the first code byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DtcCategory {
    Powertrain,
    Chassis,
    Body,
    Network,
}

impl DtcCategory {
    pub fn prefix(&self) -> char {
        match self {
            DtcCategory::Powertrain => 'P',
            DtcCategory::Chassis => 'C',
            DtcCategory::Body => 'B',
            DtcCategory::Network => 'U',
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => DtcCategory::Powertrain,
            1 => DtcCategory::Chassis,
            2 => DtcCategory::Body,
            _ => DtcCategory::Network,
        }
    }

    fn from_prefix(c: char) -> Option<Self> {
        match c {
            'P' => Some(DtcCategory::Powertrain),
            'C' => Some(DtcCategory::Chassis),
            'B' => Some(DtcCategory::Body),
            'U' => Some(DtcCategory::Network),
            _ => None,
        }
    }
}

/// A trouble code in its packed two-byte OBD form, e.g. `P0420` = `04 20`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DtcCode([u8; 2]);

#[derive(Debug, thiserror::Error)]
#[error("invalid DTC code `{0}`")]
pub struct InvalidDtcCode(pub String);

impl DtcCode {
    pub fn category(&self) -> DtcCategory {
        DtcCategory::from_bits(self.0[0] >> 6)
    }

    /// Two-byte OBD encoding used by Modes 03/07/0A.
    pub fn as_obd_bytes(&self) -> [u8; 2] {
        self.0
    }

    /// Three-byte UDS encoding used by service 0x19.
    pub fn as_uds_bytes(&self) -> [u8; 3] {
        [self.0[0], self.0[1], 0x00]
    }

    pub fn from_obd_bytes(bytes: [u8; 2]) -> Self {
        Self(bytes)
    }

    pub fn from_uds_bytes(bytes: [u8; 3]) -> Self {
        Self([bytes[0], bytes[1]])
    }
}

impl FromStr for DtcCode {
    type Err = InvalidDtcCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || InvalidDtcCode(s.to_string());
        let mut chars = s.chars();
        let category = chars.next().and_then(DtcCategory::from_prefix).ok_or_else(err)?;
        let digits: Vec<u8> = chars
            .map(|c| c.to_digit(16).map(|d| d as u8))
            .collect::<Option<_>>()
            .ok_or_else(err)?;
        if digits.len() != 4 || digits[0] > 3 {
            return Err(err());
        }
        let cat_bits = match category {
            DtcCategory::Powertrain => 0,
            DtcCategory::Chassis => 1,
            DtcCategory::Body => 2,
            DtcCategory::Network => 3,
        };
        Ok(Self([
            (cat_bits << 6) | (digits[0] << 4) | digits[1],
            (digits[2] << 4) | digits[3],
        ]))
    }
}

impl fmt::Display for DtcCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{:X}{:X}{:X}{:X}",
            self.category().prefix(),
            (self.0[0] >> 4) & 0x03,
            self.0[0] & 0x0F,
            self.0[1] >> 4,
            self.0[1] & 0x0F,
        )
    }
}

impl fmt::Debug for DtcCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Serialize for DtcCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// DTC lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DtcState {
    Pending,
    Confirmed,
    Permanent,
}

/// Sensor values frozen when a code first went pending.
#[derive(Debug, Clone, Serialize)]
pub struct FreezeFrame {
    pub rpm: f32,
    pub speed: f32,
    pub coolant_temp: f32,
    pub engine_load: f32,
    pub throttle: f32,
    pub maf: f32,
    pub fuel_pressure: f32,
    pub short_fuel_trim: f32,
    pub long_fuel_trim: f32,
    pub timing_advance: f32,
}

impl FreezeFrame {
    pub fn capture(snapshot: &Snapshot) -> Self {
        Self {
            rpm: snapshot.rpm,
            speed: snapshot.speed,
            coolant_temp: snapshot.coolant_temp,
            engine_load: snapshot.engine_load,
            throttle: snapshot.throttle,
            maf: snapshot.maf,
            fuel_pressure: snapshot.fuel_pressure,
            short_fuel_trim: snapshot.short_fuel_trim,
            long_fuel_trim: snapshot.long_fuel_trim,
            timing_advance: snapshot.timing_advance,
        }
    }
}

/// One stored trouble code.
#[derive(Debug, Clone, Serialize)]
pub struct DtcRecord {
    pub code: DtcCode,
    pub description: String,
    pub state: DtcState,
    pub occurrence_count: u32,
    pub freeze_frame: Option<FreezeFrame>,
    pub mil_illuminate: bool,
    pub emission_related: bool,
    pub first_seen: SystemTime,
    first_seen_cycle: u32,
    last_seen_cycle: u32,
    cycles_detected: u32,
}

impl DtcRecord {
    /// Synthesize the ISO 14229 status octet for this record.
    pub fn status_byte(&self) -> u8 {
        use status_bit::*;
        let mut status = TEST_FAILED | TEST_FAILED_SINCE_LAST_CLEAR;
        match self.state {
            DtcState::Pending => {
                status |= PENDING_DTC | TEST_FAILED_THIS_OPERATION_CYCLE;
            }
            DtcState::Confirmed | DtcState::Permanent => {
                status |= CONFIRMED_DTC;
                if self.mil_illuminate {
                    status |= WARNING_INDICATOR_REQUESTED;
                }
            }
        }
        status
    }
}

#[derive(Debug, Clone)]
struct CatalogueEntry {
    description: &'static str,
    mil_illuminate: bool,
    emission_related: bool,
}

/// Codes the simulator knows out of the box: (code, description, MIL,
/// emission-related).
const BUILTIN_CATALOGUE: &[(&str, &str, bool, bool)] = &[
    ("P0100", "Mass or Volume Air Flow Circuit Malfunction", true, false),
    ("P0101", "Mass or Volume Air Flow Circuit Range/Performance", true, false),
    ("P0102", "Mass or Volume Air Flow Circuit Low Input", true, false),
    ("P0128", "Coolant Temperature Below Thermostat Regulating Temperature", true, true),
    ("P0130", "O2 Sensor Circuit Malfunction (Bank 1, Sensor 1)", true, true),
    ("P0131", "O2 Sensor Circuit Low Voltage (Bank 1, Sensor 1)", true, true),
    ("P0133", "O2 Sensor Circuit Slow Response (Bank 1, Sensor 1)", true, true),
    ("P0171", "System Too Lean (Bank 1)", true, true),
    ("P0172", "System Too Rich (Bank 1)", true, true),
    ("P0300", "Random/Multiple Cylinder Misfire Detected", true, true),
    ("P0301", "Cylinder 1 Misfire Detected", true, true),
    ("P0302", "Cylinder 2 Misfire Detected", true, true),
    ("P0401", "Exhaust Gas Recirculation Flow Insufficient", true, true),
    ("P0420", "Catalyst System Efficiency Below Threshold (Bank 1)", true, true),
    ("P0430", "Catalyst System Efficiency Below Threshold (Bank 2)", true, true),
    ("P0440", "Evaporative Emission Control System Malfunction", true, true),
    ("P0442", "Evaporative Emission Control System Leak Detected (Small Leak)", true, true),
    ("P0562", "System Voltage Low", true, false),
    ("P0700", "Transmission Control System Malfunction", false, false),
    ("P0715", "Input/Turbine Speed Sensor Circuit Malfunction", false, false),
    ("P0720", "Output Speed Sensor Circuit Malfunction", false, false),
    ("C0035", "Left Front Wheel Speed Sensor Circuit", false, false),
    ("C0040", "Right Front Wheel Speed Sensor Circuit", false, false),
    ("U0100", "Lost Communication With ECM/PCM", false, false),
    ("P1000", "OBD System Readiness Test Not Complete", false, false),
];

/// A probabilistic fault trigger from the vehicle profile.
#[derive(Debug, Clone)]
pub struct DtcTrigger {
    pub code: DtcCode,
    /// Probability of one detection per second of engine run time.
    pub probability_per_s: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum DtcError {
    #[error("unknown DTC code {0}")]
    UnknownCode(DtcCode),
}

/// Per-ECU fault store.
pub struct DtcManager {
    catalogue: HashMap<DtcCode, CatalogueEntry>,
    extra_descriptions: HashMap<DtcCode, String>,
    records: BTreeMap<DtcCode, DtcRecord>,
    triggers: Vec<DtcTrigger>,
    storage_enabled: bool,
    confirm_cycles: u32,
}

impl DtcManager {
    pub fn new() -> Self {
        let catalogue = BUILTIN_CATALOGUE
            .iter()
            .map(|(code, description, mil, emission)| {
                let code: DtcCode = code.parse().expect("builtin catalogue codes are valid");
                (
                    code,
                    CatalogueEntry {
                        description,
                        mil_illuminate: *mil,
                        emission_related: *emission,
                    },
                )
            })
            .collect();
        Self {
            catalogue,
            extra_descriptions: HashMap::new(),
            records: BTreeMap::new(),
            triggers: Vec::new(),
            storage_enabled: true,
            confirm_cycles: 2,
        }
    }

    /// Register a profile-defined code, overriding the builtin entry when
    /// present, and arm its trigger when a probability is configured.
    pub fn define_code(
        &mut self,
        code: DtcCode,
        description: Option<String>,
        mil_illuminate: bool,
        emission_related: bool,
        probability_per_s: f64,
    ) {
        if let Some(description) = description {
            self.extra_descriptions.insert(code, description);
        }
        let description = self
            .catalogue
            .get(&code)
            .map(|e| e.description)
            .unwrap_or("");
        self.catalogue.insert(
            code,
            CatalogueEntry {
                description,
                mil_illuminate,
                emission_related,
            },
        );
        if probability_per_s > 0.0 {
            self.triggers.push(DtcTrigger {
                code,
                probability_per_s,
            });
        }
    }

    pub fn is_known(&self, code: DtcCode) -> bool {
        self.catalogue.contains_key(&code)
    }

    fn description_of(&self, code: DtcCode) -> String {
        if let Some(extra) = self.extra_descriptions.get(&code) {
            return extra.clone();
        }
        self.catalogue
            .get(&code)
            .map(|e| e.description.to_string())
            .unwrap_or_default()
    }

    /// Simulated detection path: a new code goes PENDING (capturing the
    /// freeze frame), and is promoted to CONFIRMED once seen in enough
    /// distinct operation cycles. Suppressed while DTC storage is disabled
    /// (service 0x85).
    pub fn record_fault(&mut self, code: DtcCode, snapshot: &Snapshot) -> Result<(), DtcError> {
        if !self.storage_enabled {
            debug!(%code, "DTC storage disabled, detection suppressed");
            return Ok(());
        }
        let entry = self
            .catalogue
            .get(&code)
            .ok_or(DtcError::UnknownCode(code))?
            .clone();
        let cycle = snapshot.operation_cycle;
        let confirm_cycles = self.confirm_cycles;
        let description = self.description_of(code);

        let record = self.records.entry(code).or_insert_with(|| {
            info!(%code, "fault detected, pending");
            DtcRecord {
                code,
                description,
                state: DtcState::Pending,
                occurrence_count: 0,
                freeze_frame: Some(FreezeFrame::capture(snapshot)),
                mil_illuminate: entry.mil_illuminate,
                emission_related: entry.emission_related,
                first_seen: SystemTime::now(),
                first_seen_cycle: cycle,
                last_seen_cycle: cycle,
                cycles_detected: 0,
            }
        });
        record.occurrence_count += 1;
        if record.cycles_detected == 0 || cycle != record.last_seen_cycle {
            record.cycles_detected += 1;
            record.last_seen_cycle = cycle;
        }
        if record.state == DtcState::Pending && record.cycles_detected >= confirm_cycles {
            info!(%code, cycles = record.cycles_detected, "fault confirmed");
            record.state = DtcState::Confirmed;
        }
        Ok(())
    }

    /// Control-surface injection: the code lands CONFIRMED immediately,
    /// capturing a freeze frame when asked. Bypasses the storage gate (it
    /// is test tooling, not a simulated detection).
    pub fn inject(
        &mut self,
        code: DtcCode,
        freeze: Option<FreezeFrame>,
        cycle: u32,
    ) -> Result<&DtcRecord, DtcError> {
        let entry = self
            .catalogue
            .get(&code)
            .ok_or(DtcError::UnknownCode(code))?
            .clone();
        let description = self.description_of(code);
        let record = self.records.entry(code).or_insert_with(|| DtcRecord {
            code,
            description,
            state: DtcState::Confirmed,
            occurrence_count: 0,
            freeze_frame: None,
            mil_illuminate: entry.mil_illuminate,
            emission_related: entry.emission_related,
            first_seen: SystemTime::now(),
            first_seen_cycle: cycle,
            last_seen_cycle: cycle,
            cycles_detected: 1,
        });
        record.occurrence_count += 1;
        if record.state == DtcState::Pending {
            record.state = DtcState::Confirmed;
        }
        if record.freeze_frame.is_none() {
            record.freeze_frame = freeze;
        }
        info!(%code, state = ?record.state, "DTC injected");
        Ok(record)
    }

    /// Evaluate the profile-configured probabilistic triggers for one tick.
    pub fn evaluate_triggers<R: Rng>(&mut self, snapshot: &Snapshot, dt: f32, rng: &mut R) {
        if snapshot.engine != EngineState::Running || !self.storage_enabled {
            return;
        }
        let fired: Vec<DtcCode> = self
            .triggers
            .iter()
            .filter(|t| rng.gen_bool((t.probability_per_s * dt as f64).clamp(0.0, 1.0)))
            .map(|t| t.code)
            .collect();
        for code in fired {
            if let Err(e) = self.record_fault(code, snapshot) {
                warn!(%code, error = %e, "trigger fired for unknown code");
            }
        }
    }

    /// Operation-cycle boundary: confirmed emission-related codes that
    /// still request the MIL and were stored before this cycle began
    /// become permanent.
    pub fn on_operation_cycle(&mut self, new_cycle: u32) {
        for record in self.records.values_mut() {
            if record.state == DtcState::Confirmed
                && record.emission_related
                && record.mil_illuminate
                && record.last_seen_cycle < new_cycle
            {
                info!(code = %record.code, "emission DTC promoted to permanent");
                record.state = DtcState::Permanent;
            }
        }
    }

    /// Clear stored codes matching the UDS three-byte group filter
    /// (`0xFFFFFF` = all). Permanent codes survive. Returns the number of
    /// codes removed; clearing twice equals clearing once.
    pub fn clear(&mut self, group: u32) -> usize {
        let category = group_category(group);
        let before = self.records.len();
        self.records.retain(|code, record| {
            if record.state == DtcState::Permanent {
                return true;
            }
            match category {
                Some(cat) => code.category() != cat,
                None => false,
            }
        });
        let cleared = before - self.records.len();
        if cleared > 0 {
            info!(cleared, group = format_args!("{group:#08X}"), "DTCs cleared");
        }
        cleared
    }

    pub fn set_storage_enabled(&mut self, enabled: bool) {
        info!(enabled, "DTC storage setting changed");
        self.storage_enabled = enabled;
    }

    pub fn storage_enabled(&self) -> bool {
        self.storage_enabled
    }

    /// MIL is requested iff a confirmed or permanent code carries the
    /// MIL-illuminate flag.
    pub fn mil_requested(&self) -> bool {
        self.records.values().any(|r| {
            r.mil_illuminate && matches!(r.state, DtcState::Confirmed | DtcState::Permanent)
        })
    }

    pub fn in_state(&self, state: DtcState) -> Vec<&DtcRecord> {
        self.records.values().filter(|r| r.state == state).collect()
    }

    /// Stored DTCs as reported by Mode 03: confirmed plus permanent.
    pub fn stored(&self) -> Vec<&DtcRecord> {
        self.records
            .values()
            .filter(|r| matches!(r.state, DtcState::Confirmed | DtcState::Permanent))
            .collect()
    }

    /// Count reported in Mode 01 PID 01.
    pub fn stored_count(&self) -> usize {
        self.stored().len()
    }

    pub fn all(&self) -> impl Iterator<Item = &DtcRecord> {
        self.records.values()
    }

    pub fn find(&self, code: DtcCode) -> Option<&DtcRecord> {
        self.records.get(&code)
    }

    /// Freeze frame reported by Mode 02: the first stored code that has one.
    pub fn first_stored_freeze_frame(&self) -> Option<(&DtcRecord, &FreezeFrame)> {
        self.stored()
            .into_iter()
            .find_map(|r| r.freeze_frame.as_ref().map(|f| (r, f)))
    }

    /// Every code in the catalogue, for ReadDTCInformation 0x0A.
    pub fn supported_codes(&self) -> Vec<DtcCode> {
        let mut codes: Vec<DtcCode> = self.catalogue.keys().copied().collect();
        codes.sort();
        codes
    }
}

impl Default for DtcManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Map a UDS clear-group to the category it scopes, `None` meaning all.
fn group_category(group: u32) -> Option<DtcCategory> {
    if group == GROUP_ALL {
        None
    } else {
        Some(DtcCategory::from_bits(((group >> 16) as u8) >> 6))
    }
}
