//! Control surface
//!
//! Synchronous, lock-scoped operations exposed to adapters and test
//! harnesses: fault injection, ignition and engine control, direct sensor
//! pins and state inspection. Every operation returns a structured result
//! or a typed error carrying a machine-readable kind tag.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::dtc::{DtcCode, DtcState, FreezeFrame, GROUP_ALL};
use crate::ecu::EcuShared;
use crate::readiness::ReadinessMonitors;
use crate::uds::handlers::apply_actuator;
use crate::uds::nrc::NegativeResponseCode as Nrc;
use crate::vehicle::{IgnitionState, SharedVehicle, Snapshot};

/// Typed control-surface error.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("no ECU named `{0}`")]
    EcuNotFound(String),
    #[error("invalid DTC code `{0}`")]
    CodeInvalid(String),
    #[error("condition not met: {0}")]
    ConditionNotMet(&'static str),
}

impl ControlError {
    /// Machine-readable error kind for adapter layers.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlError::EcuNotFound(_) => "ecu-not-found",
            ControlError::CodeInvalid(_) => "code-invalid",
            ControlError::ConditionNotMet(_) => "condition-not-met",
        }
    }
}

/// One row of `list_dtcs`.
#[derive(Debug, Clone, Serialize)]
pub struct DtcSummary {
    pub ecu: String,
    pub code: DtcCode,
    pub state: DtcState,
    pub description: String,
    pub occurrence_count: u32,
    pub mil_illuminate: bool,
    pub has_freeze_frame: bool,
}

/// Direct sensor pins accepted by `set_vehicle_params`. `Some(None)` is
/// not modeled; passing `None` leaves a pin untouched, a pinned value
/// persists until the engine stops.
#[derive(Debug, Clone, Copy, Default)]
pub struct VehicleParams {
    pub rpm: Option<f32>,
    pub speed: Option<f32>,
    pub throttle: Option<f32>,
}

/// Handle over a running network: shared vehicle plus every ECU's
/// diagnostic state.
#[derive(Clone)]
pub struct ControlHandle {
    vehicle: SharedVehicle,
    ecus: Vec<Arc<EcuShared>>,
}

impl ControlHandle {
    pub(crate) fn new(vehicle: SharedVehicle, ecus: Vec<Arc<EcuShared>>) -> Self {
        Self { vehicle, ecus }
    }

    fn ecu(&self, name: &str) -> Result<&Arc<EcuShared>, ControlError> {
        self.ecus
            .iter()
            .find(|e| e.identity.name == name)
            .ok_or_else(|| ControlError::EcuNotFound(name.to_string()))
    }

    /// Inject a fault code into one ECU; it lands CONFIRMED, optionally
    /// capturing a freeze frame of the current snapshot.
    pub fn inject_dtc(&self, ecu: &str, code: &str, freeze: bool) -> Result<(), ControlError> {
        let ecu = self.ecu(ecu)?;
        let parsed: DtcCode = code
            .parse()
            .map_err(|_| ControlError::CodeInvalid(code.to_string()))?;
        if !ecu.identity.owns_code(parsed) {
            return Err(ControlError::CodeInvalid(code.to_string()));
        }
        let snapshot = self.vehicle.lock().snapshot();
        let frame = freeze.then(|| FreezeFrame::capture(&snapshot));
        ecu.dtc
            .lock()
            .inject(parsed, frame, snapshot.operation_cycle)
            .map_err(|_| ControlError::CodeInvalid(code.to_string()))?;
        info!(ecu = %ecu.identity.name, code, "DTC injected via control surface");
        Ok(())
    }

    /// Clear DTCs on one ECU, or on all when `ecu` is `None`. Returns the
    /// number of codes removed.
    pub fn clear_dtcs(&self, ecu: Option<&str>) -> Result<usize, ControlError> {
        let targets: Vec<&Arc<EcuShared>> = match ecu {
            Some(name) => vec![self.ecu(name)?],
            None => self.ecus.iter().collect(),
        };
        let mut cleared = 0;
        let mut reset_monitors = false;
        for target in targets {
            cleared += target.dtc.lock().clear(GROUP_ALL);
            reset_monitors |= target.identity.supports_obd;
        }
        if reset_monitors {
            self.vehicle.lock().on_dtcs_cleared();
        }
        Ok(cleared)
    }

    pub fn set_ignition(&self, state: IgnitionState) -> Snapshot {
        let mut vehicle = self.vehicle.lock();
        vehicle.set_ignition(state);
        vehicle.snapshot()
    }

    pub fn start_engine(&self) -> Result<Snapshot, ControlError> {
        let mut vehicle = self.vehicle.lock();
        if !vehicle.start_engine() {
            return Err(ControlError::ConditionNotMet(
                "ignition must be ON to start the engine",
            ));
        }
        Ok(vehicle.snapshot())
    }

    pub fn stop_engine(&self) -> Snapshot {
        let mut vehicle = self.vehicle.lock();
        vehicle.stop_engine();
        vehicle.snapshot()
    }

    /// Pin sensors to fixed values. RPM and speed pins require a running
    /// engine.
    pub fn set_vehicle_params(&self, params: VehicleParams) -> Result<Snapshot, ControlError> {
        let mut vehicle = self.vehicle.lock();
        let engine_running =
            vehicle.snapshot().engine == crate::vehicle::EngineState::Running;
        if (params.rpm.is_some() || params.speed.is_some()) && !engine_running {
            return Err(ControlError::ConditionNotMet(
                "engine must be running to pin rpm or speed",
            ));
        }
        if let Some(throttle) = params.throttle {
            vehicle.set_throttle(throttle);
        }
        if params.rpm.is_some() {
            vehicle.pin_rpm(params.rpm);
        }
        if params.speed.is_some() {
            vehicle.pin_speed(params.speed);
        }
        Ok(vehicle.snapshot())
    }

    pub fn get_snapshot(&self) -> Snapshot {
        self.vehicle.lock().snapshot()
    }

    pub fn list_dtcs(&self, ecu: Option<&str>) -> Result<Vec<DtcSummary>, ControlError> {
        let targets: Vec<&Arc<EcuShared>> = match ecu {
            Some(name) => vec![self.ecu(name)?],
            None => self.ecus.iter().collect(),
        };
        let mut rows = Vec::new();
        for target in targets {
            let dtc = target.dtc.lock();
            for record in dtc.all() {
                rows.push(DtcSummary {
                    ecu: target.identity.name.clone(),
                    code: record.code,
                    state: record.state,
                    description: record.description.clone(),
                    occurrence_count: record.occurrence_count,
                    mil_illuminate: record.mil_illuminate,
                    has_freeze_frame: record.freeze_frame.is_some(),
                });
            }
        }
        Ok(rows)
    }

    pub fn get_readiness(&self, ecu: &str) -> Result<ReadinessMonitors, ControlError> {
        self.ecu(ecu)?;
        Ok(self.vehicle.lock().readiness().clone())
    }

    /// Drive an actuator directly, with the same preconditions as UDS
    /// InputOutputControl.
    pub fn actuator_control(
        &self,
        ecu: &str,
        did: u16,
        option: u8,
        value: Option<u8>,
    ) -> Result<u8, ControlError> {
        self.ecu(ecu)?;
        let snapshot = self.vehicle.lock().snapshot();
        apply_actuator(&self.vehicle, &snapshot, did, option, value).map_err(|nrc| match nrc {
            Nrc::RequestOutOfRange => ControlError::ConditionNotMet("unknown actuator identifier"),
            Nrc::ConditionsNotCorrect => {
                ControlError::ConditionNotMet("requires key on, engine off")
            }
            _ => ControlError::ConditionNotMet("actuator request rejected"),
        })
    }
}
