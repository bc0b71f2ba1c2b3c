//! Vehicle profile loading
//!
//! Profiles are JSON documents describing the simulated vehicle: identity,
//! sensor parameters, ECU identification strings and the fault codes it can
//! develop. Only the semantic fields the core consumes are modeled;
//! anything else in the file is ignored.

use serde::{Deserialize, Serialize};

use crate::dtc::DtcCode;
use crate::vehicle::VehicleConfig;

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("cannot read profile: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid profile JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("VIN must be 17 ASCII characters, got {0}")]
    VinLength(usize),
    #[error("`{field}` out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },
    #[error("invalid DTC code `{0}` in profile")]
    BadDtcCode(String),
}

/// Complete vehicle profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehicleProfile {
    #[serde(default)]
    pub vehicle: VehicleIdent,
    #[serde(default)]
    pub sensors: SensorParams,
    #[serde(default)]
    pub ecu: EcuStrings,
    #[serde(default)]
    pub dtcs: Vec<DtcDef>,
}

impl Default for VehicleProfile {
    fn default() -> Self {
        Self {
            vehicle: VehicleIdent::default(),
            sensors: SensorParams::default(),
            ecu: EcuStrings::default(),
            dtcs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VehicleIdent {
    #[serde(default = "default_vin")]
    pub vin: String,
    #[serde(default = "default_make")]
    pub make: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_year")]
    pub year: u16,
}

fn default_vin() -> String {
    "1HGBH41JXMN109186".to_string()
}

fn default_make() -> String {
    "Generic".to_string()
}

fn default_model() -> String {
    "Vehicle".to_string()
}

fn default_year() -> u16 {
    2020
}

impl Default for VehicleIdent {
    fn default() -> Self {
        Self {
            vin: default_vin(),
            make: default_make(),
            model: default_model(),
            year: default_year(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorParams {
    #[serde(default = "default_rpm_idle")]
    pub rpm_idle: f32,
    #[serde(default = "default_rpm_max")]
    pub rpm_max: f32,
    #[serde(default = "default_coolant_normal")]
    pub coolant_temp_normal: f32,
    #[serde(default = "default_fuel_capacity")]
    pub fuel_capacity: f32,
}

fn default_rpm_idle() -> f32 {
    750.0
}

fn default_rpm_max() -> f32 {
    6500.0
}

fn default_coolant_normal() -> f32 {
    90.0
}

fn default_fuel_capacity() -> f32 {
    50.0
}

impl Default for SensorParams {
    fn default() -> Self {
        Self {
            rpm_idle: default_rpm_idle(),
            rpm_max: default_rpm_max(),
            coolant_temp_normal: default_coolant_normal(),
            fuel_capacity: default_fuel_capacity(),
        }
    }
}

/// ECU identification strings served by Mode 09 and the 0xF1xx DIDs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcuStrings {
    #[serde(default = "default_serial")]
    pub serial_number: String,
    #[serde(default = "default_sw_version")]
    pub software_version: String,
    #[serde(default = "default_hw_version")]
    pub hardware_version: String,
    #[serde(default = "default_calibration")]
    pub calibration_id: String,
    #[serde(default = "default_part_number")]
    pub part_number: String,
    #[serde(default = "default_supplier")]
    pub supplier: String,
    #[serde(default = "default_mfg_date")]
    pub manufacturing_date: String,
}

fn default_serial() -> String {
    "SN123456789012".to_string()
}

fn default_sw_version() -> String {
    "v2.0.0".to_string()
}

fn default_hw_version() -> String {
    "HW1.0".to_string()
}

fn default_calibration() -> String {
    "CALIB12345678".to_string()
}

fn default_part_number() -> String {
    "12345678".to_string()
}

fn default_supplier() -> String {
    "SUPPLIER".to_string()
}

fn default_mfg_date() -> String {
    "20250101".to_string()
}

impl Default for EcuStrings {
    fn default() -> Self {
        Self {
            serial_number: default_serial(),
            software_version: default_sw_version(),
            hardware_version: default_hw_version(),
            calibration_id: default_calibration(),
            part_number: default_part_number(),
            supplier: default_supplier(),
            manufacturing_date: default_mfg_date(),
        }
    }
}

/// One fault code definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DtcDef {
    pub code: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub mil_illuminate: bool,
    #[serde(default = "default_true")]
    pub emission_related: bool,
    /// Probability of one simulated detection per second of engine run
    /// time; 0 keeps the code injectable but never self-triggering.
    #[serde(default)]
    pub probability: f64,
}

fn default_true() -> bool {
    true
}

impl VehicleProfile {
    /// Load and validate a profile from a JSON file.
    pub fn load(path: &str) -> Result<Self, ProfileError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Parse and validate a profile from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ProfileError> {
        let profile: Self = serde_json::from_str(json)?;
        profile.validate()?;
        Ok(profile)
    }

    pub fn validate(&self) -> Result<(), ProfileError> {
        if self.vehicle.vin.len() != 17 || !self.vehicle.vin.is_ascii() {
            return Err(ProfileError::VinLength(self.vehicle.vin.len()));
        }
        let s = &self.sensors;
        if s.rpm_max <= s.rpm_idle || s.rpm_max > 16383.0 {
            return Err(ProfileError::OutOfRange {
                field: "sensors.rpm_max",
                value: s.rpm_max as f64,
            });
        }
        if s.rpm_idle <= 0.0 {
            return Err(ProfileError::OutOfRange {
                field: "sensors.rpm_idle",
                value: s.rpm_idle as f64,
            });
        }
        if !(-40.0..=215.0).contains(&s.coolant_temp_normal) {
            return Err(ProfileError::OutOfRange {
                field: "sensors.coolant_temp_normal",
                value: s.coolant_temp_normal as f64,
            });
        }
        if s.fuel_capacity <= 0.0 {
            return Err(ProfileError::OutOfRange {
                field: "sensors.fuel_capacity",
                value: s.fuel_capacity as f64,
            });
        }
        for def in &self.dtcs {
            if def.code.parse::<DtcCode>().is_err() {
                return Err(ProfileError::BadDtcCode(def.code.clone()));
            }
            if !(0.0..=1.0).contains(&def.probability) {
                return Err(ProfileError::OutOfRange {
                    field: "dtcs.probability",
                    value: def.probability,
                });
            }
        }
        Ok(())
    }

    pub fn vehicle_config(&self) -> VehicleConfig {
        VehicleConfig {
            rpm_idle: self.sensors.rpm_idle,
            rpm_max: self.sensors.rpm_max,
            coolant_temp_normal: self.sensors.coolant_temp_normal,
            fuel_capacity_l: self.sensors.fuel_capacity,
            ambient_temp: 20.0,
        }
    }
}

/// Identification strings one ECU serves, assembled from the profile.
#[derive(Debug, Clone)]
pub struct EcuInfo {
    pub vin: String,
    pub ecu_name: String,
    pub calibration_id: String,
    pub serial_number: String,
    pub software_version: String,
    pub hardware_version: String,
    pub part_number: String,
    pub supplier: String,
    pub manufacturing_date: String,
}

impl EcuInfo {
    pub fn for_ecu(profile: &VehicleProfile, ecu_name: &str) -> Self {
        Self {
            vin: profile.vehicle.vin.clone(),
            ecu_name: format!("{}-ECU", ecu_name.to_ascii_uppercase()),
            calibration_id: profile.ecu.calibration_id.clone(),
            serial_number: profile.ecu.serial_number.clone(),
            software_version: profile.ecu.software_version.clone(),
            hardware_version: profile.ecu.hardware_version.clone(),
            part_number: profile.ecu.part_number.clone(),
            supplier: profile.ecu.supplier.clone(),
            manufacturing_date: profile.ecu.manufacturing_date.clone(),
        }
    }
}
