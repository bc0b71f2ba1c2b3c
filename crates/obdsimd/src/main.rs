//! obdsimd - the simulated diagnostic network on a SocketCAN interface
//!
//! Builds the default three-ECU network on an in-process bus and bridges
//! it to a (v)can interface, so any scan tool speaking ISO-TP over
//! SocketCAN sees a live vehicle.
//!
//! # Usage
//!
//! ```bash
//! ./obdsimd --interface vcan0
//! ./obdsimd --interface vcan0 --profile profiles/golf.json --verbose
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use socketcan::{CanFilter, CanSocket, EmbeddedFrame, Frame, Socket, SocketOptions, StandardId};
use tracing::{debug, error, info, warn};

use obdsim_core::{IgnitionState, NetworkSim, VehicleProfile, FUNCTIONAL_REQUEST_ID};
use obdsim_isotp::{BusSender, CanChannel, VirtualCanBus};

#[derive(Parser, Debug)]
#[command(name = "obdsimd")]
#[command(about = "Multi-ECU OBD-II/UDS vehicle network simulator")]
struct Args {
    /// CAN interface name
    #[arg(short, long, default_value = "vcan0")]
    interface: String,

    /// Vehicle profile (JSON); defaults apply when omitted
    #[arg(short, long)]
    profile: Option<String>,

    /// Key on, engine off: do not start the engine at boot
    #[arg(long)]
    koeo: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        "obdsim=debug,obdsimd=debug"
    } else {
        "obdsim=info,obdsimd=info"
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let profile = match &args.profile {
        Some(path) => {
            info!(path = %path, "loading vehicle profile");
            VehicleProfile::load(path).context("failed to load vehicle profile")?
        }
        None => VehicleProfile::default(),
    };

    info!(
        vin = %profile.vehicle.vin,
        make = %profile.vehicle.make,
        model = %profile.vehicle.model,
        year = profile.vehicle.year,
        "starting vehicle network simulation"
    );

    let bus = VirtualCanBus::new(512);
    let mut sim = NetworkSim::builder(profile)
        .with_default_network()
        .start(Box::new(bus.endpoint()));

    let control = sim.control();
    control.set_ignition(IgnitionState::On);
    if !args.koeo {
        control.start_engine().map_err(|e| anyhow::anyhow!("{e}"))?;
    }

    let running = Arc::new(AtomicBool::new(true));
    spawn_socket_reader(&args.interface, bus.sender(), running.clone())?;
    spawn_socket_writer(&args.interface, bus.endpoint(), running.clone())?;

    info!(interface = %args.interface, "simulator ready - waiting for requests");
    info!("press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    running.store(false, Ordering::SeqCst);
    sim.shutdown();
    Ok(())
}

/// Feed tester requests from the CAN interface into the virtual bus.
///
/// The socket filter admits only the physical request range and the
/// functional address, so the simulator's own responses (visible on a
/// second socket on the same interface) never loop back in.
fn spawn_socket_reader(
    interface: &str,
    bus: BusSender,
    running: Arc<AtomicBool>,
) -> Result<()> {
    let socket = CanSocket::open(interface)
        .with_context(|| format!("failed to open CAN interface {interface}"))?;
    socket
        .set_filters(&[
            CanFilter::new(0x7E0, 0x7F8),
            CanFilter::new(FUNCTIONAL_REQUEST_ID as u32, 0x7FF),
        ])
        .context("failed to set CAN filters")?;
    socket
        .set_nonblocking(true)
        .context("failed to set non-blocking")?;

    tokio::task::spawn_blocking(move || {
        while running.load(Ordering::SeqCst) {
            match socket.read_frame() {
                Ok(frame) => {
                    if frame.is_extended() {
                        continue;
                    }
                    let data = frame.data();
                    if data.len() > 8 {
                        continue;
                    }
                    let id = frame.raw_id() as u16;
                    debug!(id = format_args!("{id:#05X}"), "frame from tester");
                    bus.send(obdsim_isotp::CanFrame::new(id, data));
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => {
                    error!(?e, "socket read error");
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        }
    });
    Ok(())
}

/// Put every simulator response onto the CAN interface.
fn spawn_socket_writer(
    interface: &str,
    mut endpoint: impl CanChannel + 'static,
    running: Arc<AtomicBool>,
) -> Result<()> {
    let socket = CanSocket::open(interface)
        .with_context(|| format!("failed to open CAN interface {interface}"))?;

    tokio::spawn(async move {
        while running.load(Ordering::SeqCst) {
            let frame = match endpoint.recv().await {
                Ok(frame) => frame,
                Err(_) => break,
            };
            // only ECU responses leave the process; tester frames fed in
            // by the reader come back around on the broadcast bus
            if !(0x7E8..=0x7EF).contains(&frame.id()) {
                continue;
            }
            let Some(id) = StandardId::new(frame.id()) else {
                continue;
            };
            let Some(out) = socketcan::CanFrame::new(id, frame.data()) else {
                warn!(?frame, "frame conversion failed");
                continue;
            };
            if let Err(e) = socket.write_frame(&out) {
                warn!(?e, "socket write failed");
            }
        }
    });
    Ok(())
}
