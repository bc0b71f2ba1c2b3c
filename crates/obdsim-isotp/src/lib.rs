//! ISO 15765-2 (ISO-TP) transport over 11-bit CAN for the obdsim network
//! simulator.
//!
//! This crate provides the three layers underneath the diagnostic services:
//!
//! - [`can`] - the classic CAN frame model, a duplex [`can::CanChannel`]
//!   abstraction and an in-process [`can::VirtualCanBus`] hub
//! - [`frame`] - ISO-TP protocol control information (PCI) encoding/decoding
//! - [`IsoTpLink`] - a bidirectional transport session for one address pair:
//!   segmentation, reassembly and the flow-control handshake

pub mod can;
pub mod frame;
mod link;

pub use can::{BusEndpoint, BusSender, CanBusError, CanChannel, CanFrame, VirtualCanBus};
pub use frame::{FlowStatus, MAX_PAYLOAD};
pub use link::{IsoTpConfig, IsoTpError, IsoTpLink};
