//! Multi-ECU bus coordinator
//!
//! Owns the CAN channel and the set of ECU actors: demultiplexes inbound
//! frames by request ID, fans the functional address out to every ECU,
//! serializes outbound writes, and runs the vehicle tick task that drives
//! sensor evolution, fault triggers and the MIL.

use std::sync::Arc;
use std::time::Duration;

use obdsim_isotp::{CanChannel, CanFrame, IsoTpConfig};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::control::ControlHandle;
use crate::ecu::{EcuActor, EcuHandle, EcuIdentity, EcuShared};
use crate::profile::VehicleProfile;
use crate::vehicle::{SharedVehicle, VehicleSim};

/// Conventional functional (broadcast) request ID.
pub const FUNCTIONAL_REQUEST_ID: u16 = 0x7DF;

/// A running simulated diagnostic network.
pub struct NetworkSim {
    vehicle: SharedVehicle,
    ecus: Vec<EcuHandle>,
    tasks: Vec<JoinHandle<()>>,
}

impl NetworkSim {
    pub fn builder(profile: VehicleProfile) -> NetworkSimBuilder {
        NetworkSimBuilder {
            profile,
            identities: Vec::new(),
            functional_id: FUNCTIONAL_REQUEST_ID,
            isotp: IsoTpConfig::default(),
            tick_interval: Duration::from_millis(100),
        }
    }

    pub fn vehicle(&self) -> SharedVehicle {
        self.vehicle.clone()
    }

    /// Control surface over the running network.
    pub fn control(&self) -> ControlHandle {
        ControlHandle::new(
            self.vehicle.clone(),
            self.ecus.iter().map(|e| e.shared.clone()).collect(),
        )
    }

    /// Tear the network down: every actor task, the bus task and the tick
    /// task are aborted, cancelling in-flight ISO-TP transfers.
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        for ecu in &self.ecus {
            ecu.task.abort();
        }
        info!("network simulation stopped");
    }
}

impl Drop for NetworkSim {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub struct NetworkSimBuilder {
    profile: VehicleProfile,
    identities: Vec<EcuIdentity>,
    functional_id: u16,
    isotp: IsoTpConfig,
    tick_interval: Duration,
}

impl NetworkSimBuilder {
    /// The conventional three-ECU network: engine (OBD+UDS), transmission
    /// and ABS (UDS only).
    pub fn with_default_network(mut self) -> Self {
        self.identities.push(EcuIdentity::engine());
        self.identities.push(EcuIdentity::transmission());
        self.identities.push(EcuIdentity::abs());
        self
    }

    pub fn add_ecu(mut self, identity: EcuIdentity) -> Self {
        self.identities.push(identity);
        self
    }

    pub fn functional_id(mut self, id: u16) -> Self {
        self.functional_id = id;
        self
    }

    pub fn isotp_config(mut self, cfg: IsoTpConfig) -> Self {
        self.isotp = cfg;
        self
    }

    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Spawn every task and attach the network to `channel`.
    pub fn start(self, channel: Box<dyn CanChannel>) -> NetworkSim {
        let vehicle: SharedVehicle =
            Arc::new(Mutex::new(VehicleSim::from_profile(&self.profile)));

        let (bus_tx, bus_rx) = mpsc::channel::<CanFrame>(64);
        let mut ecus = Vec::with_capacity(self.identities.len());
        for identity in self.identities {
            let shared = Arc::new(EcuShared::new(identity, &self.profile));
            ecus.push(EcuActor::spawn(
                shared,
                vehicle.clone(),
                bus_tx.clone(),
                self.isotp,
            ));
        }

        let bus_task = spawn_bus_task(channel, bus_rx, &ecus, self.functional_id);
        let tick_task = spawn_tick_task(vehicle.clone(), &ecus, self.tick_interval);

        info!(
            ecus = ecus.len(),
            functional_id = format_args!("{:#05X}", self.functional_id),
            "network simulation started"
        );
        NetworkSim {
            vehicle,
            ecus,
            tasks: vec![bus_task, tick_task],
        }
    }
}

/// Single task owning the channel: routes inbound frames and serializes
/// all outbound writes.
fn spawn_bus_task(
    mut channel: Box<dyn CanChannel>,
    mut bus_rx: mpsc::Receiver<CanFrame>,
    ecus: &[EcuHandle],
    functional_id: u16,
) -> JoinHandle<()> {
    struct Route {
        name: String,
        request_id: u16,
        frame_tx: mpsc::Sender<CanFrame>,
        functional_tx: mpsc::Sender<CanFrame>,
    }
    let routes: Vec<Route> = ecus
        .iter()
        .map(|e| Route {
            name: e.shared.identity.name.clone(),
            request_id: e.shared.identity.request_id,
            frame_tx: e.frame_tx.clone(),
            functional_tx: e.functional_tx.clone(),
        })
        .collect();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                inbound = channel.recv() => match inbound {
                    Ok(frame) => {
                        if frame.id() == functional_id {
                            for route in &routes {
                                if route.functional_tx.try_send(frame).is_err() {
                                    warn!(ecu = %route.name, "functional queue full, frame dropped");
                                }
                            }
                        } else if let Some(route) =
                            routes.iter().find(|r| r.request_id == frame.id())
                        {
                            if route.frame_tx.try_send(frame).is_err() {
                                warn!(ecu = %route.name, "inbound queue full, frame dropped");
                            }
                        }
                    }
                    Err(_) => break,
                },
                outbound = bus_rx.recv() => match outbound {
                    Some(frame) => {
                        if channel.send(frame).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    })
}

/// The vehicle tick task: advances the model, evaluates fault triggers,
/// promotes DTCs across operation cycles and derives the MIL from the
/// OBD-capable ECUs.
fn spawn_tick_task(
    vehicle: SharedVehicle,
    ecus: &[EcuHandle],
    interval: Duration,
) -> JoinHandle<()> {
    let shared: Vec<Arc<EcuShared>> = ecus.iter().map(|e| e.shared.clone()).collect();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last = tokio::time::Instant::now();
        let mut last_cycle = 0u32;
        loop {
            ticker.tick().await;
            let now = tokio::time::Instant::now();
            let dt = (now - last).as_secs_f32();
            last = now;

            let snapshot = {
                let mut vehicle = vehicle.lock();
                vehicle.tick(dt);
                vehicle.snapshot()
            };

            let cycle = snapshot.operation_cycle;
            let mut mil = false;
            for ecu in &shared {
                let mut dtc = ecu.dtc.lock();
                let mut rng = rand::thread_rng();
                dtc.evaluate_triggers(&snapshot, dt.min(0.1), &mut rng);
                if cycle > last_cycle {
                    dtc.on_operation_cycle(cycle);
                }
                if ecu.identity.supports_obd && dtc.mil_requested() {
                    mil = true;
                }
            }
            last_cycle = cycle;
            vehicle.lock().set_mil(mil);
        }
    })
}
