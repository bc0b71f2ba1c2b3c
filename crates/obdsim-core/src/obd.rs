//! OBD-II service handlers (Modes 01-0A)
//!
//! Stateless functions from (mode, PIDs, vehicle snapshot, DTC view) to
//! response bytes. Positive responses echo the mode with `0x40` added;
//! negative responses use the UDS format `7F <mode> <NRC>` even here.

use tracing::debug;

use crate::dtc::{DtcManager, DtcRecord, FreezeFrame, GROUP_ALL};
use crate::profile::EcuInfo;
use crate::uds::nrc::NegativeResponseCode as Nrc;
use crate::uds::{negative_response, positive_response};
use crate::vehicle::{SharedVehicle, Snapshot};

/// Mode 01 PIDs this ECU implements, including the support-bitmap PIDs.
const SUPPORTED_PIDS: &[u8] = &[
    0x01, 0x03, 0x04, 0x05, 0x06, 0x07, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F, 0x10, 0x11, 0x1C, 0x1F,
    0x20, 0x21, 0x23, 0x2F, 0x30, 0x31, 0x33, 0x40, 0x42, 0x5C,
];

/// Mode 09 info types.
const SUPPORTED_INFO_TYPES: &[u8] = &[0x02, 0x04, 0x06, 0x0A];

/// At most this many PIDs may be batched into one Mode 01 request.
const MAX_BATCHED_PIDS: usize = 6;

/// Dispatch one OBD-II request. Always produces a response.
pub fn process(
    request: &[u8],
    snapshot: &Snapshot,
    vehicle: &SharedVehicle,
    dtc: &mut DtcManager,
    info: &EcuInfo,
) -> Vec<u8> {
    let mode = request[0];
    match mode {
        0x01 => mode_01_current_data(request, snapshot, dtc),
        0x02 => mode_02_freeze_frame(request, dtc),
        0x03 => dtc_list_response(0x03, &dtc.stored()),
        0x04 => mode_04_clear(vehicle, dtc),
        0x06 => mode_06_test_results(),
        0x07 => dtc_list_response(0x07, &dtc.in_state(crate::dtc::DtcState::Pending)),
        0x08 => mode_08_control(request),
        0x09 => mode_09_vehicle_info(request, info),
        0x0A => dtc_list_response(0x0A, &dtc.in_state(crate::dtc::DtcState::Permanent)),
        _ => negative_response(mode, Nrc::ServiceNotSupported),
    }
}

fn mode_01_current_data(request: &[u8], snapshot: &Snapshot, dtc: &DtcManager) -> Vec<u8> {
    if request.len() < 2 {
        return negative_response(0x01, Nrc::IncorrectMessageLengthOrFormat);
    }
    let pids = &request[1..(1 + MAX_BATCHED_PIDS).min(request.len())];
    let mut data = Vec::new();
    for &pid in pids {
        match encode_pid(pid, snapshot, dtc) {
            Some(value) => {
                data.push(pid);
                data.extend_from_slice(&value);
            }
            None => debug!(pid = format_args!("{pid:#04X}"), "unsupported PID skipped"),
        }
    }
    if data.is_empty() {
        return negative_response(0x01, Nrc::SubFunctionNotSupported);
    }
    positive_response(0x01, &data)
}

/// Encode one Mode 01 PID from the snapshot; `None` when unsupported.
fn encode_pid(pid: u8, snap: &Snapshot, dtc: &DtcManager) -> Option<Vec<u8>> {
    let value = match pid {
        0x00 | 0x20 | 0x40 => supported_bitmap(pid).to_vec(),
        0x01 => monitor_status(snap, dtc).to_vec(),
        // fuel system status: closed loop, using oxygen sensor
        0x03 => vec![0x02, 0x00],
        0x04 => vec![percent_byte(snap.engine_load)],
        0x05 => vec![temp_byte(snap.coolant_temp)],
        0x06 => vec![trim_byte(snap.short_fuel_trim)],
        0x07 => vec![trim_byte(snap.long_fuel_trim)],
        0x0B => vec![clamp_u8(30.0 + snap.engine_load * 0.7)],
        0x0C => u16_be((snap.rpm * 4.0).clamp(0.0, 65535.0) as u16).to_vec(),
        0x0D => vec![clamp_u8(snap.speed)],
        0x0E => vec![clamp_u8((snap.timing_advance + 64.0) * 2.0)],
        0x0F => vec![temp_byte(snap.intake_temp)],
        0x10 => u16_be((snap.maf * 100.0).clamp(0.0, 65535.0) as u16).to_vec(),
        0x11 => vec![percent_byte(snap.throttle)],
        // OBD standard: OBD-II as defined by CARB
        0x1C => vec![0x07],
        0x1F => u16_be(snap.runtime_s.clamp(0.0, 65535.0) as u16).to_vec(),
        0x21 => u16_be(snap.distance_mil_on.clamp(0.0, 65535.0) as u16).to_vec(),
        0x23 => u16_be((snap.fuel_pressure * 10.0).clamp(0.0, 65535.0) as u16).to_vec(),
        0x2F => vec![percent_byte(snap.fuel_level)],
        0x30 => vec![snap.warmups_since_clear],
        0x31 => u16_be(snap.distance_since_clear.clamp(0.0, 65535.0) as u16).to_vec(),
        0x33 => vec![clamp_u8(snap.barometric_kpa)],
        0x42 => u16_be((snap.battery_v * 1000.0).clamp(0.0, 65535.0) as u16).to_vec(),
        0x5C => vec![temp_byte(snap.coolant_temp + 10.0)],
        _ => return None,
    };
    Some(value)
}

/// Bitmap of supported PIDs in the 32-PID block after `base`.
fn supported_bitmap(base: u8) -> [u8; 4] {
    let mut bits: u32 = 0;
    for &pid in SUPPORTED_PIDS {
        if pid > base && pid <= base + 0x20 {
            bits |= 1 << (0x20 - (pid - base));
        }
    }
    bits.to_be_bytes()
}

/// PID 01: MIL bit and stored-DTC count, then the standard readiness
/// monitor bitmaps.
fn monitor_status(snap: &Snapshot, dtc: &DtcManager) -> [u8; 4] {
    let count = dtc.stored_count().min(127) as u8;
    let mil = if snap.mil_on { 0x80 } else { 0x00 };
    let r = &snap.readiness;
    [
        mil | count,
        r.continuous_supported() | (r.continuous_incomplete() << 4),
        r.non_continuous_supported(),
        r.non_continuous_incomplete(),
    ]
}

fn mode_02_freeze_frame(request: &[u8], dtc: &DtcManager) -> Vec<u8> {
    if request.len() < 3 {
        return negative_response(0x02, Nrc::IncorrectMessageLengthOrFormat);
    }
    let pid = request[1];
    let frame_no = request[2];
    let Some((_, frame)) = dtc.first_stored_freeze_frame() else {
        return negative_response(0x02, Nrc::SubFunctionNotSupported);
    };
    if frame_no != 0 {
        return negative_response(0x02, Nrc::RequestOutOfRange);
    }
    let Some(data) = encode_freeze_frame_pid(pid, frame) else {
        return negative_response(0x02, Nrc::SubFunctionNotSupported);
    };
    let mut body = vec![pid, frame_no];
    body.extend_from_slice(&data);
    positive_response(0x02, &body)
}

/// Mode 02 mirrors the Mode 01 encodings, read from the freeze frame.
fn encode_freeze_frame_pid(pid: u8, frame: &FreezeFrame) -> Option<Vec<u8>> {
    let value = match pid {
        0x04 => vec![percent_byte(frame.engine_load)],
        0x05 => vec![temp_byte(frame.coolant_temp)],
        0x0C => u16_be((frame.rpm * 4.0).clamp(0.0, 65535.0) as u16).to_vec(),
        0x0D => vec![clamp_u8(frame.speed)],
        0x10 => u16_be((frame.maf * 100.0).clamp(0.0, 65535.0) as u16).to_vec(),
        0x11 => vec![percent_byte(frame.throttle)],
        _ => return None,
    };
    Some(value)
}

/// Modes 03/07/0A share one shape: count byte, then two bytes per code.
fn dtc_list_response(mode: u8, records: &[&DtcRecord]) -> Vec<u8> {
    let mut data = vec![records.len() as u8];
    for record in records {
        data.extend_from_slice(&record.code.as_obd_bytes());
    }
    positive_response(mode, &data)
}

fn mode_04_clear(vehicle: &SharedVehicle, dtc: &mut DtcManager) -> Vec<u8> {
    dtc.clear(GROUP_ALL);
    vehicle.lock().on_dtcs_cleared();
    positive_response(0x04, &[])
}

/// On-board test results, fixed O2-sensor stub.
fn mode_06_test_results() -> Vec<u8> {
    positive_response(
        0x06,
        &[0x01, 0x01, 0x00, 0x0A, 0x00, 0xFF, 0x00, 0x45, 0x00, 0xFA],
    )
}

fn mode_08_control(request: &[u8]) -> Vec<u8> {
    if request.len() < 2 {
        return negative_response(0x08, Nrc::IncorrectMessageLengthOrFormat);
    }
    positive_response(0x08, &[request[1]])
}

fn mode_09_vehicle_info(request: &[u8], info: &EcuInfo) -> Vec<u8> {
    if request.len() < 2 {
        return negative_response(0x09, Nrc::IncorrectMessageLengthOrFormat);
    }
    let data = match request[1] {
        0x00 => {
            let mut bits: u32 = 0;
            for &it in SUPPORTED_INFO_TYPES {
                bits |= 1 << (0x20 - it);
            }
            let mut data = vec![0x00];
            data.extend_from_slice(&bits.to_be_bytes());
            data
        }
        0x02 => message_count_item(0x02, info.vin.as_bytes(), 17),
        0x04 => message_count_item(0x04, info.calibration_id.as_bytes(), 16),
        0x06 => message_count_item(0x06, &[0x12, 0x34, 0x56, 0x78], 4),
        0x0A => message_count_item(0x0A, info.ecu_name.as_bytes(), 20),
        _ => return negative_response(0x09, Nrc::SubFunctionNotSupported),
    };
    positive_response(0x09, &data)
}

/// Mode 09 items carry a message-count byte, then the fixed-width ASCII
/// value padded with NULs.
fn message_count_item(info_type: u8, value: &[u8], width: usize) -> Vec<u8> {
    let mut data = vec![info_type, 0x01];
    data.extend_from_slice(&value[..value.len().min(width)]);
    data.resize(2 + width, 0x00);
    data
}

fn u16_be(value: u16) -> [u8; 2] {
    value.to_be_bytes()
}

fn clamp_u8(value: f32) -> u8 {
    value.clamp(0.0, 255.0) as u8
}

fn percent_byte(percent: f32) -> u8 {
    clamp_u8(percent * 255.0 / 100.0)
}

fn temp_byte(celsius: f32) -> u8 {
    clamp_u8(celsius + 40.0)
}

fn trim_byte(trim: f32) -> u8 {
    clamp_u8((trim + 100.0) * 128.0 / 100.0)
}
