//! obdsim-core - deterministic multi-ECU OBD-II / UDS network simulator
//!
//! The simulated network seen from the OBD connector: several ECUs on a
//! shared CAN bus, each answering legacy OBD-II modes and modern UDS
//! services over ISO-TP, backed by one process-wide vehicle model.
//!
//! # Modules
//!
//! - [`vehicle`] / [`readiness`] - the physics/state model behind the
//!   sensor PIDs and the drive-cycle monitors
//! - [`dtc`] - fault-code lifecycle, freeze frames and MIL logic
//! - [`obd`] / [`uds`] - the service handlers
//! - [`ecu`] / [`coordinator`] - actors and bus demultiplexing
//! - [`control`] - the in-process control surface
//! - [`profile`] - JSON vehicle profiles

pub mod control;
pub mod coordinator;
pub mod dtc;
pub mod ecu;
pub mod obd;
pub mod profile;
pub mod readiness;
pub mod uds;
pub mod vehicle;

pub use control::{ControlError, ControlHandle, DtcSummary, VehicleParams};
pub use coordinator::{NetworkSim, NetworkSimBuilder, FUNCTIONAL_REQUEST_ID};
pub use dtc::{DtcCode, DtcManager, DtcRecord, DtcState, FreezeFrame};
pub use ecu::{EcuHandle, EcuIdentity, EcuShared};
pub use profile::{EcuInfo, ProfileError, VehicleProfile};
pub use readiness::{Monitor, MonitorState, ReadinessMonitors};
pub use vehicle::{EngineState, IgnitionState, SharedVehicle, Snapshot, VehicleSim};
