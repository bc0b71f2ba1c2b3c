//! UDS service handlers
//!
//! Stateful per-ECU handlers dispatched by service ID. Each returns the
//! response payload, or `None` when the response is suppressed (functional
//! silence, TesterPresent 0x80).

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::nrc::NegativeResponseCode as Nrc;
use super::session::{key_mask, routine_def, RoutineRun, UdsSession};
use super::{
    actuator_did, dtc_sub_function, io_control_option, negative_response, positive_response,
    routine_sub_function, service_id, standard_did, vehicle_did, DiagnosticSession,
};
use crate::dtc::{DtcCode, DtcManager, FreezeFrame};
use crate::profile::EcuInfo;
use crate::vehicle::{EngineState, IgnitionState, SharedVehicle, Snapshot};

/// Routine status byte reported by RequestRoutineResults.
mod routine_status {
    pub const RUNNING: u8 = 0x01;
    pub const COMPLETE: u8 = 0x02;
    pub const STOPPED: u8 = 0x03;
}

/// Everything a UDS request handler may touch.
pub struct UdsContext<'a> {
    pub snapshot: &'a Snapshot,
    pub vehicle: &'a SharedVehicle,
    pub session: &'a mut UdsSession,
    pub dtc: &'a mut DtcManager,
    pub info: &'a EcuInfo,
    /// Whether this ECU also serves OBD (gates the monitor reset on 0x14).
    pub obd_capable: bool,
}

/// Dispatch one UDS request. `None` means no response is sent.
pub fn process(request: &[u8], ctx: &mut UdsContext<'_>) -> Option<Vec<u8>> {
    let sid = *request.first()?;
    let now = Instant::now();
    ctx.session.expire_if_idle(now);

    let response = match sid {
        service_id::DIAGNOSTIC_SESSION_CONTROL => Some(session_control(request, ctx, now)),
        service_id::ECU_RESET => Some(ecu_reset(request, ctx)),
        service_id::CLEAR_DIAGNOSTIC_INFO => Some(clear_diagnostic_info(request, ctx)),
        service_id::READ_DTC_INFO => Some(read_dtc_info(request, ctx)),
        service_id::READ_DATA_BY_ID => Some(read_data_by_id(request, ctx)),
        service_id::SECURITY_ACCESS => Some(security_access(request, ctx, now)),
        service_id::COMMUNICATION_CONTROL => Some(communication_control(request)),
        service_id::WRITE_DATA_BY_ID => Some(write_data_by_id(request, ctx)),
        service_id::IO_CONTROL_BY_ID => Some(io_control(request, ctx)),
        service_id::ROUTINE_CONTROL => Some(routine_control(request, ctx)),
        service_id::REQUEST_DOWNLOAD => Some(request_download(request, ctx)),
        service_id::TRANSFER_DATA => Some(transfer_data(request, ctx)),
        service_id::REQUEST_TRANSFER_EXIT => Some(transfer_exit(ctx)),
        service_id::TESTER_PRESENT => tester_present(request),
        service_id::CONTROL_DTC_SETTING => Some(control_dtc_setting(request, ctx)),
        other => {
            debug!(sid = format_args!("{other:#04X}"), "unsupported service");
            Some(negative_response(other, Nrc::ServiceNotSupported))
        }
    };
    ctx.session.touch(now);
    response
}

// --- 0x10 DiagnosticSessionControl --------------------------------------

fn session_control(request: &[u8], ctx: &mut UdsContext<'_>, now: Instant) -> Vec<u8> {
    const SID: u8 = service_id::DIAGNOSTIC_SESSION_CONTROL;
    if request.len() < 2 {
        return negative_response(SID, Nrc::IncorrectMessageLengthOrFormat);
    }
    let Some(target) = DiagnosticSession::from_byte(request[1]) else {
        return negative_response(SID, Nrc::SubFunctionNotSupported);
    };
    if target == DiagnosticSession::Safety && ctx.session.session() == DiagnosticSession::Default
    {
        return negative_response(SID, Nrc::SubFunctionNotSupportedInActiveSession);
    }
    ctx.session.enter_session(target, now);
    // P2 = 50 ms, P2* = 5000 ms (500 raw, in 10 ms resolution)
    positive_response(SID, &[request[1], 0x00, 0x32, 0x01, 0xF4])
}

// --- 0x11 ECUReset -------------------------------------------------------

fn ecu_reset(request: &[u8], ctx: &mut UdsContext<'_>) -> Vec<u8> {
    const SID: u8 = service_id::ECU_RESET;
    if request.len() < 2 {
        return negative_response(SID, Nrc::IncorrectMessageLengthOrFormat);
    }
    let reset_type = request[1];
    if !(0x01..=0x03).contains(&reset_type) {
        return negative_response(SID, Nrc::SubFunctionNotSupported);
    }
    info!(reset_type, "ECU reset");
    ctx.session.reset();
    ctx.vehicle.lock().clear_actuator_overrides();
    positive_response(SID, &[reset_type])
}

// --- 0x14 ClearDiagnosticInformation ------------------------------------

fn clear_diagnostic_info(request: &[u8], ctx: &mut UdsContext<'_>) -> Vec<u8> {
    const SID: u8 = service_id::CLEAR_DIAGNOSTIC_INFO;
    if request.len() < 4 {
        return negative_response(SID, Nrc::IncorrectMessageLengthOrFormat);
    }
    let group =
        ((request[1] as u32) << 16) | ((request[2] as u32) << 8) | request[3] as u32;
    ctx.dtc.clear(group);
    if ctx.obd_capable {
        ctx.vehicle.lock().on_dtcs_cleared();
    }
    positive_response(SID, &[])
}

// --- 0x19 ReadDTCInformation --------------------------------------------

/// Status bits this ECU can actually report.
const STATUS_AVAILABILITY_MASK: u8 = 0xFF;

fn read_dtc_info(request: &[u8], ctx: &mut UdsContext<'_>) -> Vec<u8> {
    const SID: u8 = service_id::READ_DTC_INFO;
    if request.len() < 2 {
        return negative_response(SID, Nrc::IncorrectMessageLengthOrFormat);
    }
    match request[1] {
        dtc_sub_function::REPORT_NUMBER_OF_DTC_BY_STATUS_MASK => {
            if request.len() < 3 {
                return negative_response(SID, Nrc::IncorrectMessageLengthOrFormat);
            }
            let mask = request[2];
            let count = ctx
                .dtc
                .all()
                .filter(|r| r.status_byte() & mask != 0)
                .count() as u16;
            let count = count.to_be_bytes();
            positive_response(
                SID,
                &[
                    dtc_sub_function::REPORT_NUMBER_OF_DTC_BY_STATUS_MASK,
                    STATUS_AVAILABILITY_MASK,
                    0x01, // DTC format: ISO 14229-1
                    count[0],
                    count[1],
                ],
            )
        }
        dtc_sub_function::REPORT_DTC_BY_STATUS_MASK => {
            if request.len() < 3 {
                return negative_response(SID, Nrc::IncorrectMessageLengthOrFormat);
            }
            let mask = request[2];
            let mut data = vec![
                dtc_sub_function::REPORT_DTC_BY_STATUS_MASK,
                STATUS_AVAILABILITY_MASK,
            ];
            for record in ctx.dtc.all().filter(|r| r.status_byte() & mask != 0) {
                data.extend_from_slice(&record.code.as_uds_bytes());
                data.push(record.status_byte());
            }
            positive_response(SID, &data)
        }
        dtc_sub_function::REPORT_DTC_SNAPSHOT_RECORD_BY_DTC_NUMBER => {
            if request.len() < 6 {
                return negative_response(SID, Nrc::IncorrectMessageLengthOrFormat);
            }
            let code = DtcCode::from_uds_bytes([request[2], request[3], request[4]]);
            let Some(record) = ctx.dtc.find(code) else {
                return negative_response(SID, Nrc::RequestOutOfRange);
            };
            let mut data = vec![dtc_sub_function::REPORT_DTC_SNAPSHOT_RECORD_BY_DTC_NUMBER];
            data.extend_from_slice(&record.code.as_uds_bytes());
            data.push(record.status_byte());
            if let Some(frame) = &record.freeze_frame {
                data.push(0x01); // snapshot record number
                data.extend_from_slice(&encode_snapshot_record(frame));
            }
            positive_response(SID, &data)
        }
        dtc_sub_function::REPORT_SUPPORTED_DTC => {
            let mut data = vec![
                dtc_sub_function::REPORT_SUPPORTED_DTC,
                STATUS_AVAILABILITY_MASK,
            ];
            for code in ctx.dtc.supported_codes() {
                data.extend_from_slice(&code.as_uds_bytes());
                data.push(
                    ctx.dtc
                        .find(code)
                        .map(|r| r.status_byte())
                        .unwrap_or(crate::dtc::status_bit::TEST_NOT_COMPLETED_SINCE_LAST_CLEAR),
                );
            }
            positive_response(SID, &data)
        }
        sub => {
            debug!(sub = format_args!("{sub:#04X}"), "unsupported DTC sub-function");
            negative_response(SID, Nrc::SubFunctionNotSupported)
        }
    }
}

/// Fixed snapshot-record layout: RPM x4 (2 bytes), speed, coolant +40,
/// load %, throttle %.
fn encode_snapshot_record(frame: &FreezeFrame) -> [u8; 6] {
    let rpm = ((frame.rpm * 4.0).clamp(0.0, 65535.0) as u16).to_be_bytes();
    [
        rpm[0],
        rpm[1],
        frame.speed.clamp(0.0, 255.0) as u8,
        (frame.coolant_temp + 40.0).clamp(0.0, 255.0) as u8,
        (frame.engine_load * 255.0 / 100.0).clamp(0.0, 255.0) as u8,
        (frame.throttle * 255.0 / 100.0).clamp(0.0, 255.0) as u8,
    ]
}

// --- 0x22 ReadDataByIdentifier ------------------------------------------

fn read_data_by_id(request: &[u8], ctx: &mut UdsContext<'_>) -> Vec<u8> {
    const SID: u8 = service_id::READ_DATA_BY_ID;
    if request.len() < 3 || request.len() % 2 == 0 {
        return negative_response(SID, Nrc::IncorrectMessageLengthOrFormat);
    }
    let mut data = Vec::new();
    for pair in request[1..].chunks_exact(2) {
        let did = u16::from_be_bytes([pair[0], pair[1]]);
        let Some(value) = read_did(did, ctx) else {
            debug!(did = format_args!("{did:#06X}"), "unknown DID");
            return negative_response(SID, Nrc::RequestOutOfRange);
        };
        data.extend_from_slice(&did.to_be_bytes());
        data.extend_from_slice(&value);
    }
    positive_response(SID, &data)
}

fn read_did(did: u16, ctx: &UdsContext<'_>) -> Option<Vec<u8>> {
    let snap = ctx.snapshot;
    let info = ctx.info;
    let value = match did {
        standard_did::ACTIVE_DIAGNOSTIC_SESSION => vec![ctx.session.session() as u8],
        standard_did::SPARE_PART_NUMBER => info.part_number.as_bytes().to_vec(),
        standard_did::SYSTEM_SUPPLIER_ID => info.supplier.as_bytes().to_vec(),
        standard_did::ECU_MANUFACTURING_DATE => info.manufacturing_date.as_bytes().to_vec(),
        standard_did::ECU_SERIAL_NUMBER => info.serial_number.as_bytes().to_vec(),
        standard_did::ECU_SOFTWARE_VERSION => info.software_version.as_bytes().to_vec(),
        standard_did::VIN => info.vin.as_bytes().to_vec(),
        standard_did::ECU_HARDWARE_VERSION => info.hardware_version.as_bytes().to_vec(),
        standard_did::SYSTEM_NAME => info.ecu_name.as_bytes().to_vec(),
        vehicle_did::ENGINE_RPM => {
            ((snap.rpm * 4.0).clamp(0.0, 65535.0) as u16).to_be_bytes().to_vec()
        }
        vehicle_did::VEHICLE_SPEED => vec![snap.speed.clamp(0.0, 255.0) as u8],
        vehicle_did::COOLANT_TEMP => vec![(snap.coolant_temp + 40.0).clamp(0.0, 255.0) as u8],
        vehicle_did::BATTERY_VOLTAGE => {
            ((snap.battery_v * 1000.0).clamp(0.0, 65535.0) as u16).to_be_bytes().to_vec()
        }
        vehicle_did::THROTTLE_POSITION => {
            vec![(snap.throttle * 255.0 / 100.0).clamp(0.0, 255.0) as u8]
        }
        vehicle_did::FUEL_LEVEL => {
            vec![(snap.fuel_level * 255.0 / 100.0).clamp(0.0, 255.0) as u8]
        }
        other => return ctx.session.stored_dids.get(&other).cloned(),
    };
    Some(value)
}

// --- 0x27 SecurityAccess -------------------------------------------------

fn security_access(request: &[u8], ctx: &mut UdsContext<'_>, now: Instant) -> Vec<u8> {
    const SID: u8 = service_id::SECURITY_ACCESS;
    if request.len() < 2 {
        return negative_response(SID, Nrc::IncorrectMessageLengthOrFormat);
    }
    let sub = request[1];
    if sub == 0 {
        return negative_response(SID, Nrc::SubFunctionNotSupported);
    }
    if ctx.session.locked_out(now) {
        return negative_response(SID, Nrc::ExceededNumberOfAttempts);
    }

    if sub % 2 == 1 {
        // request seed
        let level = sub.div_ceil(2);
        if ctx.session.security_level() >= level {
            // already unlocked: zero seed by convention
            return positive_response(SID, &[sub, 0, 0, 0, 0]);
        }
        let seed = ctx.session.next_seed();
        ctx.session.pending_seed = Some(super::session::PendingSeed { level, seed });
        debug!(level, "security seed issued");
        let mut data = vec![sub];
        data.extend_from_slice(&seed.to_be_bytes());
        positive_response(SID, &data)
    } else {
        // send key
        if request.len() < 6 {
            return negative_response(SID, Nrc::IncorrectMessageLengthOrFormat);
        }
        let level = sub / 2;
        let key = u32::from_be_bytes([request[2], request[3], request[4], request[5]]);
        let expected = ctx
            .session
            .pending_seed
            .filter(|p| p.level == level)
            .map(|p| p.seed ^ key_mask(level));
        if expected == Some(key) {
            ctx.session.unlock(level);
            positive_response(SID, &[sub])
        } else {
            warn!(level, "invalid security key");
            ctx.session.register_failed_key(now);
            negative_response(SID, Nrc::InvalidKey)
        }
    }
}

// --- 0x28 CommunicationControl ------------------------------------------

fn communication_control(request: &[u8]) -> Vec<u8> {
    const SID: u8 = service_id::COMMUNICATION_CONTROL;
    if request.len() < 3 {
        return negative_response(SID, Nrc::IncorrectMessageLengthOrFormat);
    }
    let control_type = request[1];
    if control_type > 0x03 {
        return negative_response(SID, Nrc::SubFunctionNotSupported);
    }
    positive_response(SID, &[control_type])
}

// --- 0x2E WriteDataByIdentifier -----------------------------------------

fn write_data_by_id(request: &[u8], ctx: &mut UdsContext<'_>) -> Vec<u8> {
    const SID: u8 = service_id::WRITE_DATA_BY_ID;
    if request.len() < 4 {
        return negative_response(SID, Nrc::IncorrectMessageLengthOrFormat);
    }
    if !matches!(
        ctx.session.session(),
        DiagnosticSession::Extended | DiagnosticSession::Programming
    ) {
        return negative_response(SID, Nrc::ServiceNotSupportedInActiveSession);
    }
    if ctx.session.security_level() == 0 {
        return negative_response(SID, Nrc::SecurityAccessDenied);
    }
    let did = u16::from_be_bytes([request[1], request[2]]);
    if !ctx.session.stored_dids.contains_key(&did) {
        // identification and snapshot DIDs are read-only
        return negative_response(SID, Nrc::RequestOutOfRange);
    }
    info!(did = format_args!("{did:#06X}"), "DID written");
    ctx.session.stored_dids.insert(did, request[3..].to_vec());
    positive_response(SID, &did.to_be_bytes())
}

// --- 0x2F InputOutputControlByIdentifier --------------------------------

fn io_control(request: &[u8], ctx: &mut UdsContext<'_>) -> Vec<u8> {
    const SID: u8 = service_id::IO_CONTROL_BY_ID;
    if request.len() < 4 {
        return negative_response(SID, Nrc::IncorrectMessageLengthOrFormat);
    }
    if ctx.session.session() != DiagnosticSession::Extended {
        return negative_response(SID, Nrc::ServiceNotSupportedInActiveSession);
    }
    let did = u16::from_be_bytes([request[1], request[2]]);
    let option = request[3];
    let value = request.get(4).copied();
    match apply_actuator(ctx.vehicle, ctx.snapshot, did, option, value) {
        Ok(state) => {
            let mut data = request[1..4].to_vec();
            data.push(state);
            positive_response(SID, &data)
        }
        Err(nrc) => negative_response(SID, nrc),
    }
}

/// Drive one actuator. Shared with the control surface's
/// `actuator_control` operation. Returns the actuator's state byte.
pub(crate) fn apply_actuator(
    vehicle: &SharedVehicle,
    snapshot: &Snapshot,
    did: u16,
    option: u8,
    value: Option<u8>,
) -> Result<u8, Nrc> {
    if option > io_control_option::SHORT_TERM_ADJUSTMENT {
        return Err(Nrc::SubFunctionNotSupported);
    }
    let koeo = snapshot.ignition == IgnitionState::On && snapshot.engine == EngineState::Off;
    let mut vehicle = vehicle.lock();
    match did {
        actuator_did::THROTTLE => {
            if !koeo {
                return Err(Nrc::ConditionsNotCorrect);
            }
            match option {
                io_control_option::RETURN_CONTROL_TO_ECU
                | io_control_option::RESET_TO_DEFAULT => vehicle.set_throttle_override(None),
                io_control_option::FREEZE_CURRENT_STATE => {
                    vehicle.set_throttle_override(Some(snapshot.throttle))
                }
                _ => {
                    let raw = value.ok_or(Nrc::IncorrectMessageLengthOrFormat)?;
                    vehicle.set_throttle_override(Some(raw as f32 * 100.0 / 255.0));
                }
            }
            let state = vehicle.throttle_override().unwrap_or(snapshot.throttle);
            Ok((state * 255.0 / 100.0).clamp(0.0, 255.0) as u8)
        }
        actuator_did::COOLING_FAN => {
            match option {
                io_control_option::RETURN_CONTROL_TO_ECU
                | io_control_option::RESET_TO_DEFAULT => vehicle.set_cooling_fan(false),
                io_control_option::FREEZE_CURRENT_STATE => {}
                _ => {
                    let raw = value.ok_or(Nrc::IncorrectMessageLengthOrFormat)?;
                    vehicle.set_cooling_fan(raw != 0);
                }
            }
            Ok(vehicle.cooling_fan_on() as u8)
        }
        actuator_did::FUEL_PUMP => {
            if !koeo {
                return Err(Nrc::ConditionsNotCorrect);
            }
            match option {
                io_control_option::RETURN_CONTROL_TO_ECU
                | io_control_option::RESET_TO_DEFAULT => vehicle.set_fuel_pump(true),
                io_control_option::FREEZE_CURRENT_STATE => {}
                _ => {
                    let raw = value.ok_or(Nrc::IncorrectMessageLengthOrFormat)?;
                    vehicle.set_fuel_pump(raw != 0);
                }
            }
            Ok(vehicle.fuel_pump_enabled() as u8)
        }
        _ => Err(Nrc::RequestOutOfRange),
    }
}

// --- 0x31 RoutineControl -------------------------------------------------

fn routine_control(request: &[u8], ctx: &mut UdsContext<'_>) -> Vec<u8> {
    const SID: u8 = service_id::ROUTINE_CONTROL;
    if request.len() < 4 {
        return negative_response(SID, Nrc::IncorrectMessageLengthOrFormat);
    }
    let sub = request[1];
    let rid = u16::from_be_bytes([request[2], request[3]]);
    let rid_bytes = rid.to_be_bytes();

    match sub {
        routine_sub_function::START_ROUTINE => {
            if ctx.session.session() == DiagnosticSession::Default {
                return negative_response(SID, Nrc::ServiceNotSupportedInActiveSession);
            }
            let Some(def) = routine_def(rid) else {
                return negative_response(SID, Nrc::RequestOutOfRange);
            };
            info!(rid = format_args!("{rid:#06X}"), name = def.name, "routine started");
            let result = Arc::new(Mutex::new(None));
            let task_result = result.clone();
            let duration = def.duration;
            let payload = def.result;
            let handle = tokio::spawn(async move {
                if !duration.is_zero() {
                    tokio::time::sleep(duration).await;
                }
                *task_result.lock() = Some(payload.to_vec());
            });
            ctx.session.routines.insert(
                rid,
                RoutineRun {
                    handle,
                    result,
                    stopped: false,
                },
            );
            positive_response(
                SID,
                &[routine_sub_function::START_ROUTINE, rid_bytes[0], rid_bytes[1], 0x00],
            )
        }
        routine_sub_function::STOP_ROUTINE => {
            let Some(run) = ctx.session.routines.get_mut(&rid) else {
                return negative_response(SID, Nrc::RequestSequenceError);
            };
            run.handle.abort();
            run.stopped = true;
            info!(rid = format_args!("{rid:#06X}"), "routine stopped");
            positive_response(
                SID,
                &[routine_sub_function::STOP_ROUTINE, rid_bytes[0], rid_bytes[1]],
            )
        }
        routine_sub_function::REQUEST_ROUTINE_RESULTS => {
            let Some(run) = ctx.session.routines.get(&rid) else {
                return negative_response(SID, Nrc::RequestSequenceError);
            };
            let mut data = vec![
                routine_sub_function::REQUEST_ROUTINE_RESULTS,
                rid_bytes[0],
                rid_bytes[1],
            ];
            let result = run.result.lock().clone();
            match result {
                _ if run.stopped => data.push(routine_status::STOPPED),
                Some(result) => {
                    data.push(routine_status::COMPLETE);
                    data.extend_from_slice(&result);
                }
                None => data.push(routine_status::RUNNING),
            }
            positive_response(SID, &data)
        }
        _ => negative_response(SID, Nrc::SubFunctionNotSupported),
    }
}

// --- 0x34/0x36/0x37 transfer stubs --------------------------------------

fn request_download(request: &[u8], ctx: &mut UdsContext<'_>) -> Vec<u8> {
    const SID: u8 = service_id::REQUEST_DOWNLOAD;
    if request.len() < 3 {
        return negative_response(SID, Nrc::IncorrectMessageLengthOrFormat);
    }
    if ctx.session.session() != DiagnosticSession::Programming {
        return negative_response(SID, Nrc::ServiceNotSupportedInActiveSession);
    }
    if ctx.session.security_level() == 0 {
        return negative_response(SID, Nrc::SecurityAccessDenied);
    }
    if ctx.session.transfer_active {
        return negative_response(SID, Nrc::ConditionsNotCorrect);
    }
    ctx.session.transfer_active = true;
    // length format 0x20: two-byte max block length of 0x1000
    positive_response(SID, &[0x20, 0x10, 0x00])
}

fn transfer_data(request: &[u8], ctx: &mut UdsContext<'_>) -> Vec<u8> {
    const SID: u8 = service_id::TRANSFER_DATA;
    if request.len() < 2 {
        return negative_response(SID, Nrc::IncorrectMessageLengthOrFormat);
    }
    if !ctx.session.transfer_active {
        return negative_response(SID, Nrc::RequestSequenceError);
    }
    positive_response(SID, &[request[1]])
}

fn transfer_exit(ctx: &mut UdsContext<'_>) -> Vec<u8> {
    const SID: u8 = service_id::REQUEST_TRANSFER_EXIT;
    if !ctx.session.transfer_active {
        return negative_response(SID, Nrc::RequestSequenceError);
    }
    ctx.session.transfer_active = false;
    positive_response(SID, &[])
}

// --- 0x3E TesterPresent --------------------------------------------------

fn tester_present(request: &[u8]) -> Option<Vec<u8>> {
    const SID: u8 = service_id::TESTER_PRESENT;
    if request.len() < 2 {
        return Some(negative_response(SID, Nrc::IncorrectMessageLengthOrFormat));
    }
    let sub = request[1];
    if sub & 0x7F != 0 {
        return Some(negative_response(SID, Nrc::SubFunctionNotSupported));
    }
    if sub & 0x80 != 0 {
        // suppressPositiveResponse: the deadline refresh in `process` is
        // the only effect
        return None;
    }
    Some(positive_response(SID, &[0x00]))
}

// --- 0x85 ControlDTCSetting ---------------------------------------------

fn control_dtc_setting(request: &[u8], ctx: &mut UdsContext<'_>) -> Vec<u8> {
    const SID: u8 = service_id::CONTROL_DTC_SETTING;
    if request.len() < 2 {
        return negative_response(SID, Nrc::IncorrectMessageLengthOrFormat);
    }
    if ctx.session.session() != DiagnosticSession::Extended {
        return negative_response(SID, Nrc::ServiceNotSupportedInActiveSession);
    }
    match request[1] {
        0x01 => ctx.dtc.set_storage_enabled(true),
        0x02 => ctx.dtc.set_storage_enabled(false),
        _ => return negative_response(SID, Nrc::SubFunctionNotSupported),
    }
    positive_response(SID, &[request[1]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::VehicleProfile;
    use crate::vehicle::{VehicleConfig, VehicleSim};
    use std::time::Duration;

    struct Fixture {
        vehicle: SharedVehicle,
        session: UdsSession,
        dtc: DtcManager,
        info: EcuInfo,
    }

    impl Fixture {
        fn new() -> Self {
            let vehicle = VehicleSim::new(VehicleConfig::default());
            Self {
                vehicle: Arc::new(Mutex::new(vehicle)),
                session: UdsSession::new(),
                dtc: DtcManager::new(),
                info: EcuInfo::for_ecu(&VehicleProfile::default(), "engine"),
            }
        }

        fn koeo(&self) {
            self.vehicle.lock().set_ignition(IgnitionState::On);
        }

        fn running(&self) {
            let mut v = self.vehicle.lock();
            v.set_ignition(IgnitionState::On);
            v.start_engine();
            for _ in 0..40 {
                v.tick(0.1);
            }
            assert_eq!(v.snapshot().engine, EngineState::Running);
        }

        fn request(&mut self, req: &[u8]) -> Option<Vec<u8>> {
            let snapshot = self.vehicle.lock().snapshot();
            let mut ctx = UdsContext {
                snapshot: &snapshot,
                vehicle: &self.vehicle,
                session: &mut self.session,
                dtc: &mut self.dtc,
                info: &self.info,
                obd_capable: true,
            };
            process(req, &mut ctx)
        }

        fn unlock_level_1(&mut self) {
            let resp = self.request(&[0x27, 0x01]).unwrap();
            assert_eq!(resp[0..2], [0x67, 0x01]);
            let seed = u32::from_be_bytes([resp[2], resp[3], resp[4], resp[5]]);
            let key = (seed ^ LEVEL1_MASK).to_be_bytes();
            let resp = self
                .request(&[0x27, 0x02, key[0], key[1], key[2], key[3]])
                .unwrap();
            assert_eq!(resp, vec![0x67, 0x02]);
        }
    }

    const LEVEL1_MASK: u32 = 0x1234_5678;

    #[tokio::test]
    async fn session_control_reports_p2_timings() {
        let mut fx = Fixture::new();
        let resp = fx.request(&[0x10, 0x03]).unwrap();
        assert_eq!(resp, vec![0x50, 0x03, 0x00, 0x32, 0x01, 0xF4]);
        assert_eq!(fx.session.session(), DiagnosticSession::Extended);
    }

    #[tokio::test]
    async fn safety_session_unreachable_from_default() {
        let mut fx = Fixture::new();
        let resp = fx.request(&[0x10, 0x04]).unwrap();
        assert_eq!(resp, vec![0x7F, 0x10, 0x7E]);
        // reachable once in extended
        fx.request(&[0x10, 0x03]).unwrap();
        let resp = fx.request(&[0x10, 0x04]).unwrap();
        assert_eq!(resp[0], 0x50);
    }

    #[tokio::test]
    async fn entering_default_locks_security() {
        let mut fx = Fixture::new();
        fx.request(&[0x10, 0x03]).unwrap();
        fx.unlock_level_1();
        assert_eq!(fx.session.security_level(), 1);
        fx.request(&[0x10, 0x01]).unwrap();
        assert_eq!(fx.session.security_level(), 0);
    }

    #[tokio::test]
    async fn security_handshake_and_lockout() {
        let mut fx = Fixture::new();
        fx.request(&[0x10, 0x03]).unwrap();
        fx.request(&[0x27, 0x01]).unwrap();
        // three wrong keys, then the counter trips
        for _ in 0..3 {
            let resp = fx.request(&[0x27, 0x02, 0, 0, 0, 0]).unwrap();
            assert_eq!(resp, vec![0x7F, 0x27, 0x35]);
        }
        let resp = fx.request(&[0x27, 0x02, 0, 0, 0, 0]).unwrap();
        assert_eq!(resp, vec![0x7F, 0x27, 0x36]);
        // seed requests are rejected during the lockout too
        let resp = fx.request(&[0x27, 0x01]).unwrap();
        assert_eq!(resp, vec![0x7F, 0x27, 0x36]);
    }

    #[tokio::test]
    async fn unlocked_level_returns_zero_seed() {
        let mut fx = Fixture::new();
        fx.request(&[0x10, 0x03]).unwrap();
        fx.unlock_level_1();
        let resp = fx.request(&[0x27, 0x01]).unwrap();
        assert_eq!(resp, vec![0x67, 0x01, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn read_did_serves_vin_and_snapshot_values() {
        let mut fx = Fixture::new();
        fx.koeo();
        let resp = fx.request(&[0x22, 0xF1, 0x90]).unwrap();
        assert_eq!(resp[0..3], [0x62, 0xF1, 0x90]);
        assert_eq!(&resp[3..], b"1HGBH41JXMN109186");

        let resp = fx.request(&[0x22, 0xFD, 0x10, 0xFD, 0x13]).unwrap();
        assert_eq!(resp[0..3], [0x62, 0xFD, 0x10]);
        // engine off: raw RPM is zero
        assert_eq!(resp[3..5], [0x00, 0x00]);
        assert_eq!(resp[5..7], [0xFD, 0x13]);
    }

    #[tokio::test]
    async fn unknown_did_is_out_of_range() {
        let mut fx = Fixture::new();
        let resp = fx.request(&[0x22, 0xDE, 0xAD]).unwrap();
        assert_eq!(resp, vec![0x7F, 0x22, 0x31]);
    }

    #[tokio::test]
    async fn write_did_requires_session_and_security() {
        let mut fx = Fixture::new();
        let resp = fx.request(&[0x2E, 0x01, 0x00, 0xAA]).unwrap();
        assert_eq!(resp, vec![0x7F, 0x2E, 0x7F]);

        fx.request(&[0x10, 0x03]).unwrap();
        let resp = fx.request(&[0x2E, 0x01, 0x00, 0xAA]).unwrap();
        assert_eq!(resp, vec![0x7F, 0x2E, 0x33]);

        fx.unlock_level_1();
        let resp = fx.request(&[0x2E, 0x01, 0x00, 0xAA, 0xBB]).unwrap();
        assert_eq!(resp, vec![0x6E, 0x01, 0x00]);
        let resp = fx.request(&[0x22, 0x01, 0x00]).unwrap();
        assert_eq!(resp, vec![0x62, 0x01, 0x00, 0xAA, 0xBB]);
    }

    #[tokio::test]
    async fn io_control_demands_koeo_for_throttle() {
        let mut fx = Fixture::new();
        fx.running();
        fx.request(&[0x10, 0x03]).unwrap();
        let resp = fx.request(&[0x2F, 0xFD, 0x01, 0x03, 0x80]).unwrap();
        assert_eq!(resp, vec![0x7F, 0x2F, 0x22]);
    }

    #[tokio::test]
    async fn io_control_adjusts_and_releases_throttle() {
        let mut fx = Fixture::new();
        fx.koeo();
        fx.request(&[0x10, 0x03]).unwrap();
        let resp = fx.request(&[0x2F, 0xFD, 0x01, 0x03, 0xFF]).unwrap();
        assert_eq!(resp[0..4], [0x6F, 0xFD, 0x01, 0x03]);
        assert!(fx.vehicle.lock().throttle_override().is_some());
        let resp = fx.request(&[0x2F, 0xFD, 0x01, 0x00]).unwrap();
        assert_eq!(resp[0..4], [0x6F, 0xFD, 0x01, 0x00]);
        assert!(fx.vehicle.lock().throttle_override().is_none());
    }

    #[tokio::test]
    async fn routine_lifecycle_with_delayed_completion() {
        let mut fx = Fixture::new();
        fx.request(&[0x10, 0x03]).unwrap();

        // result before start is a sequence error
        let resp = fx.request(&[0x31, 0x03, 0x02, 0x03]).unwrap();
        assert_eq!(resp, vec![0x7F, 0x31, 0x24]);

        let resp = fx.request(&[0x31, 0x01, 0x02, 0x03]).unwrap();
        assert_eq!(resp, vec![0x71, 0x01, 0x02, 0x03, 0x00]);

        let resp = fx.request(&[0x31, 0x03, 0x02, 0x03]).unwrap();
        assert_eq!(resp, vec![0x71, 0x03, 0x02, 0x03, 0x01], "still running");

        tokio::time::sleep(Duration::from_millis(1700)).await;
        let resp = fx.request(&[0x31, 0x03, 0x02, 0x03]).unwrap();
        assert_eq!(resp, vec![0x71, 0x03, 0x02, 0x03, 0x02, 0x00, 0x42]);
    }

    #[tokio::test]
    async fn routine_start_rejected_in_default_session() {
        let mut fx = Fixture::new();
        let resp = fx.request(&[0x31, 0x01, 0x02, 0x03]).unwrap();
        assert_eq!(resp, vec![0x7F, 0x31, 0x7F]);
    }

    #[tokio::test]
    async fn tester_present_suppression() {
        let mut fx = Fixture::new();
        assert_eq!(fx.request(&[0x3E, 0x00]).unwrap(), vec![0x7E, 0x00]);
        assert_eq!(fx.request(&[0x3E, 0x80]), None);
    }

    #[tokio::test]
    async fn control_dtc_setting_gates_storage() {
        let mut fx = Fixture::new();
        fx.request(&[0x10, 0x03]).unwrap();
        let resp = fx.request(&[0x85, 0x02]).unwrap();
        assert_eq!(resp, vec![0xC5, 0x02]);
        assert!(!fx.dtc.storage_enabled());
        let resp = fx.request(&[0x85, 0x01]).unwrap();
        assert_eq!(resp, vec![0xC5, 0x01]);
        assert!(fx.dtc.storage_enabled());
    }

    #[tokio::test]
    async fn clear_diagnostic_info_spares_permanent() {
        let mut fx = Fixture::new();
        fx.dtc.inject("P0420".parse().unwrap(), None, 1).unwrap();
        fx.dtc.on_operation_cycle(2);
        fx.dtc.inject("P0300".parse().unwrap(), None, 2).unwrap();

        let resp = fx.request(&[0x14, 0xFF, 0xFF, 0xFF]).unwrap();
        assert_eq!(resp, vec![0x54]);
        assert!(fx.dtc.find("P0300".parse().unwrap()).is_none());
        assert!(fx.dtc.find("P0420".parse().unwrap()).is_some());
    }

    #[tokio::test]
    async fn read_dtc_info_by_status_mask() {
        let mut fx = Fixture::new();
        fx.dtc.inject("P0420".parse().unwrap(), None, 1).unwrap();
        let resp = fx.request(&[0x19, 0x01, 0xFF]).unwrap();
        assert_eq!(resp[0..4], [0x59, 0x01, 0xFF, 0x01]);
        assert_eq!(u16::from_be_bytes([resp[4], resp[5]]), 1);

        let resp = fx.request(&[0x19, 0x02, 0x08]).unwrap();
        assert_eq!(resp[0..3], [0x59, 0x02, 0xFF]);
        assert_eq!(resp[3..6], [0x04, 0x20, 0x00]);
        assert_ne!(resp[6] & 0x08, 0, "confirmed bit set");
    }

    #[tokio::test]
    async fn transfer_stub_enforces_sequencing() {
        let mut fx = Fixture::new();
        let resp = fx.request(&[0x36, 0x01, 0xAA]).unwrap();
        assert_eq!(resp, vec![0x7F, 0x36, 0x24]);

        fx.request(&[0x10, 0x02]).unwrap();
        fx.unlock_level_1();
        let resp = fx.request(&[0x34, 0x00, 0x44, 0, 0, 0, 0]).unwrap();
        assert_eq!(resp, vec![0x74, 0x20, 0x10, 0x00]);
        let resp = fx.request(&[0x36, 0x01, 0xAA]).unwrap();
        assert_eq!(resp, vec![0x76, 0x01]);
        let resp = fx.request(&[0x37]).unwrap();
        assert_eq!(resp, vec![0x77]);
    }
}
