//! UDS (ISO 14229) protocol layer: service constants, session state and
//! the per-ECU service handlers.

pub mod handlers;
pub mod nrc;
pub mod session;

pub use handlers::{process, UdsContext};
pub use nrc::NegativeResponseCode;
pub use session::UdsSession;

/// Standard UDS service ID constants
pub mod service_id {
    pub const DIAGNOSTIC_SESSION_CONTROL: u8 = 0x10;
    pub const ECU_RESET: u8 = 0x11;
    pub const CLEAR_DIAGNOSTIC_INFO: u8 = 0x14;
    pub const READ_DTC_INFO: u8 = 0x19;
    pub const READ_DATA_BY_ID: u8 = 0x22;
    pub const SECURITY_ACCESS: u8 = 0x27;
    pub const COMMUNICATION_CONTROL: u8 = 0x28;
    pub const WRITE_DATA_BY_ID: u8 = 0x2E;
    pub const IO_CONTROL_BY_ID: u8 = 0x2F;
    pub const ROUTINE_CONTROL: u8 = 0x31;
    pub const REQUEST_DOWNLOAD: u8 = 0x34;
    pub const TRANSFER_DATA: u8 = 0x36;
    pub const REQUEST_TRANSFER_EXIT: u8 = 0x37;
    pub const TESTER_PRESENT: u8 = 0x3E;
    pub const CONTROL_DTC_SETTING: u8 = 0x85;
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;
}

/// RoutineControl (0x31) sub-functions
pub mod routine_sub_function {
    pub const START_ROUTINE: u8 = 0x01;
    pub const STOP_ROUTINE: u8 = 0x02;
    pub const REQUEST_ROUTINE_RESULTS: u8 = 0x03;
}

/// InputOutputControlById (0x2F) control options
pub mod io_control_option {
    pub const RETURN_CONTROL_TO_ECU: u8 = 0x00;
    pub const RESET_TO_DEFAULT: u8 = 0x01;
    pub const FREEZE_CURRENT_STATE: u8 = 0x02;
    pub const SHORT_TERM_ADJUSTMENT: u8 = 0x03;
}

/// ReadDTCInformation (0x19) sub-functions
pub mod dtc_sub_function {
    pub const REPORT_NUMBER_OF_DTC_BY_STATUS_MASK: u8 = 0x01;
    pub const REPORT_DTC_BY_STATUS_MASK: u8 = 0x02;
    pub const REPORT_DTC_SNAPSHOT_RECORD_BY_DTC_NUMBER: u8 = 0x04;
    pub const REPORT_SUPPORTED_DTC: u8 = 0x0A;
}

/// Standard UDS Data Identifiers served by every ECU
pub mod standard_did {
    pub const ACTIVE_DIAGNOSTIC_SESSION: u16 = 0xF186;
    pub const SPARE_PART_NUMBER: u16 = 0xF187;
    pub const SYSTEM_SUPPLIER_ID: u16 = 0xF18A;
    pub const ECU_MANUFACTURING_DATE: u16 = 0xF18B;
    pub const ECU_SERIAL_NUMBER: u16 = 0xF18C;
    pub const ECU_SOFTWARE_VERSION: u16 = 0xF18E;
    pub const VIN: u16 = 0xF190;
    pub const ECU_HARDWARE_VERSION: u16 = 0xF191;
    pub const SYSTEM_NAME: u16 = 0xF19E;
}

/// Manufacturer-reserved DIDs backed by the live vehicle snapshot
pub mod vehicle_did {
    pub const ENGINE_RPM: u16 = 0xFD10;
    pub const VEHICLE_SPEED: u16 = 0xFD11;
    pub const COOLANT_TEMP: u16 = 0xFD12;
    pub const BATTERY_VOLTAGE: u16 = 0xFD13;
    pub const THROTTLE_POSITION: u16 = 0xFD14;
    pub const FUEL_LEVEL: u16 = 0xFD15;
}

/// Actuator DIDs driven by InputOutputControl (0x2F)
pub mod actuator_did {
    /// Throttle actuator; requires KOEO
    pub const THROTTLE: u16 = 0xFD01;
    /// Radiator cooling fan
    pub const COOLING_FAN: u16 = 0xFD02;
    /// Fuel pump relay; requires KOEO
    pub const FUEL_PUMP: u16 = 0xFD03;
}

/// Diagnostic session kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DiagnosticSession {
    Default = 0x01,
    Programming = 0x02,
    Extended = 0x03,
    Safety = 0x04,
}

impl DiagnosticSession {
    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Default),
            0x02 => Some(Self::Programming),
            0x03 => Some(Self::Extended),
            0x04 => Some(Self::Safety),
            _ => None,
        }
    }
}

/// Create a positive response: service echo with `0x40` added.
pub fn positive_response(service_id: u8, data: &[u8]) -> Vec<u8> {
    let mut response = Vec::with_capacity(1 + data.len());
    response.push(service_id | 0x40);
    response.extend_from_slice(data);
    response
}

/// Create a negative response `7F <service> <NRC>`.
pub fn negative_response(service_id: u8, nrc: nrc::NegativeResponseCode) -> Vec<u8> {
    vec![service_id::NEGATIVE_RESPONSE, service_id, nrc.into()]
}
