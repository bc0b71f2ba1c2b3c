//! ECU actor: one diagnostic endpoint on the bus
//!
//! Each actor binds one ISO-TP session, one DTC manager and one UDS session
//! to a request/response address pair, and dispatches reassembled payloads
//! by service ID. Inbound physical frames arrive through a bounded queue;
//! functional broadcast frames arrive on a separate channel and never draw
//! negative responses.

use std::sync::Arc;

use obdsim_isotp::{frame, CanFrame, IsoTpConfig, IsoTpLink};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dtc::{DtcCode, DtcManager};
use crate::obd;
use crate::profile::{EcuInfo, VehicleProfile};
use crate::uds::nrc::NegativeResponseCode as Nrc;
use crate::uds::{self, negative_response, UdsContext, UdsSession};
use crate::vehicle::{IgnitionState, SharedVehicle};

/// Pending requests queued per ECU while a response transfer is running.
pub const INBOUND_QUEUE_DEPTH: usize = 4;

/// Identity and capabilities of one simulated ECU.
#[derive(Debug, Clone)]
pub struct EcuIdentity {
    pub name: String,
    pub request_id: u16,
    pub response_id: u16,
    /// Codes this ECU owns, e.g. `P0` powertrain, `C0` chassis.
    pub dtc_prefix: String,
    pub supports_obd: bool,
    pub supports_uds: bool,
}

impl EcuIdentity {
    pub fn new(name: &str, request_id: u16, response_id: u16, dtc_prefix: &str) -> Self {
        Self {
            name: name.to_string(),
            request_id,
            response_id,
            dtc_prefix: dtc_prefix.to_string(),
            supports_obd: true,
            supports_uds: true,
        }
    }

    pub fn engine() -> Self {
        Self::new("engine", 0x7E0, 0x7E8, "P0")
    }

    pub fn transmission() -> Self {
        Self {
            supports_obd: false,
            ..Self::new("transmission", 0x7E1, 0x7E9, "P07")
        }
    }

    pub fn abs() -> Self {
        Self {
            supports_obd: false,
            ..Self::new("abs", 0x7E2, 0x7EA, "C0")
        }
    }

    /// Does a code belong to this ECU's prefix range?
    pub fn owns_code(&self, code: DtcCode) -> bool {
        code.to_string().starts_with(&self.dtc_prefix)
    }
}

/// Diagnostic state shared between the actor, the tick task and the
/// control surface.
pub struct EcuShared {
    pub identity: EcuIdentity,
    pub info: EcuInfo,
    pub dtc: Mutex<DtcManager>,
    pub uds: Mutex<UdsSession>,
}

impl EcuShared {
    pub fn new(identity: EcuIdentity, profile: &VehicleProfile) -> Self {
        let mut dtc = DtcManager::new();
        for def in &profile.dtcs {
            if let Ok(code) = def.code.parse::<DtcCode>() {
                if identity.owns_code(code) {
                    dtc.define_code(
                        code,
                        def.description.clone(),
                        def.mil_illuminate,
                        def.emission_related,
                        def.probability,
                    );
                }
            }
        }
        Self {
            info: EcuInfo::for_ecu(profile, &identity.name),
            identity,
            dtc: Mutex::new(dtc),
            uds: Mutex::new(UdsSession::new()),
        }
    }
}

/// Handle to a spawned ECU actor held by the coordinator.
pub struct EcuHandle {
    pub shared: Arc<EcuShared>,
    pub(crate) frame_tx: mpsc::Sender<CanFrame>,
    pub(crate) functional_tx: mpsc::Sender<CanFrame>,
    pub(crate) task: JoinHandle<()>,
}

pub(crate) struct EcuActor {
    shared: Arc<EcuShared>,
    vehicle: SharedVehicle,
    link: IsoTpLink,
    functional_rx: mpsc::Receiver<CanFrame>,
}

impl EcuActor {
    /// Spawn the actor task. `bus_tx` is the shared writer towards the bus.
    pub(crate) fn spawn(
        shared: Arc<EcuShared>,
        vehicle: SharedVehicle,
        bus_tx: mpsc::Sender<CanFrame>,
        isotp: IsoTpConfig,
    ) -> EcuHandle {
        // sized in frames: up to INBOUND_QUEUE_DEPTH queued requests of
        // modest multi-frame size
        let (frame_tx, frame_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH * 8);
        let (functional_tx, functional_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        let link = IsoTpLink::new(
            shared.identity.response_id,
            shared.identity.request_id,
            isotp,
            bus_tx,
            frame_rx,
        );
        let actor = EcuActor {
            shared: shared.clone(),
            vehicle,
            link,
            functional_rx,
        };
        info!(
            ecu = %shared.identity.name,
            request_id = format_args!("{:#05X}", shared.identity.request_id),
            response_id = format_args!("{:#05X}", shared.identity.response_id),
            "ECU online"
        );
        let task = tokio::spawn(actor.run());
        EcuHandle {
            shared,
            frame_tx,
            functional_tx,
            task,
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                payload = self.link.recv() => match payload {
                    Ok(payload) => self.dispatch(payload, false).await,
                    Err(e) => {
                        debug!(ecu = %self.shared.identity.name, error = %e, "link closed");
                        break;
                    }
                },
                frame = self.functional_rx.recv() => match frame {
                    Some(frame) => {
                        if let Some(payload) = single_frame_payload(&frame) {
                            self.dispatch(payload, true).await;
                        }
                    }
                    None => break,
                },
            }
        }
    }

    async fn dispatch(&mut self, payload: Vec<u8>, functional: bool) {
        let Some(&sid) = payload.first() else {
            return;
        };
        let snapshot = self.vehicle.lock().snapshot();
        if snapshot.ignition == IgnitionState::Off {
            debug!(ecu = %self.shared.identity.name, "ignition off, request dropped");
            return;
        }

        let identity = &self.shared.identity;
        let response = match sid {
            0x01..=0x0A => {
                if identity.supports_obd {
                    let mut dtc = self.shared.dtc.lock();
                    Some(obd::process(
                        &payload,
                        &snapshot,
                        &self.vehicle,
                        &mut dtc,
                        &self.shared.info,
                    ))
                } else {
                    Some(negative_response(sid, Nrc::ServiceNotSupported))
                }
            }
            0x10..=0x85 => {
                if identity.supports_uds {
                    let mut session = self.shared.uds.lock();
                    let mut dtc = self.shared.dtc.lock();
                    let mut ctx = UdsContext {
                        snapshot: &snapshot,
                        vehicle: &self.vehicle,
                        session: &mut session,
                        dtc: &mut dtc,
                        info: &self.shared.info,
                        obd_capable: identity.supports_obd,
                    };
                    uds::process(&payload, &mut ctx)
                } else {
                    Some(negative_response(sid, Nrc::ServiceNotSupported))
                }
            }
            other => Some(negative_response(other, Nrc::ServiceNotSupported)),
        };

        let Some(response) = response else {
            return;
        };
        // no NRCs on the functional address
        if functional && response.first() == Some(&uds::service_id::NEGATIVE_RESPONSE) {
            debug!(
                ecu = %self.shared.identity.name,
                sid = format_args!("{sid:#04X}"),
                "negative response to functional request suppressed"
            );
            return;
        }
        if let Err(e) = self.link.send(&response).await {
            warn!(ecu = %self.shared.identity.name, error = %e, "response send failed");
        }
    }
}

/// Functional requests are single-frame only; extract the payload.
fn single_frame_payload(frame: &CanFrame) -> Option<Vec<u8>> {
    match frame::parse(frame.data()) {
        Some(frame::Pci::Single { len }) if len >= 1 && len < frame.data().len() => {
            Some(frame.data()[1..=len].to_vec())
        }
        _ => {
            debug!(?frame, "non-single-frame functional request ignored");
            None
        }
    }
}
