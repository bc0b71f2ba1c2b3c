//! End-to-end scenarios over the virtual CAN bus
//!
//! Each test stands up the default three-ECU network on an in-process bus
//! and talks to it the way a scan tool would: raw CAN frames for the
//! framing-sensitive checks, a tester-side ISO-TP link for the service
//! flows. Fully in-process, no vCAN required.

use std::time::Duration;

use obdsim_core::{
    ControlHandle, EngineState, IgnitionState, NetworkSim, VehicleParams, VehicleProfile,
};
use obdsim_isotp::can::BusEndpoint;
use obdsim_isotp::{CanChannel, CanFrame, IsoTpConfig, IsoTpLink, VirtualCanBus};

const ENGINE_REQ: u16 = 0x7E0;
const ENGINE_RESP: u16 = 0x7E8;
const TRANS_REQ: u16 = 0x7E1;
const FUNCTIONAL: u16 = 0x7DF;

fn start_network() -> (VirtualCanBus, NetworkSim, ControlHandle) {
    let bus = VirtualCanBus::new(512);
    let sim = NetworkSim::builder(VehicleProfile::default())
        .with_default_network()
        .start(Box::new(bus.endpoint()));
    let control = sim.control();
    (bus, sim, control)
}

fn tester(bus: &VirtualCanBus, request_id: u16, response_id: u16) -> IsoTpLink {
    IsoTpLink::over_channel(
        Box::new(bus.endpoint()),
        request_id,
        response_id,
        IsoTpConfig::default(),
    )
}

/// Key on, crank, and wait for RUNNING plus one tick so the coordinator
/// has observed the new operation cycle.
async fn start_engine(control: &ControlHandle) {
    control.set_ignition(IgnitionState::On);
    control.start_engine().unwrap();
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if control.get_snapshot().engine == EngineState::Running {
            tokio::time::sleep(Duration::from_millis(250)).await;
            return;
        }
    }
    panic!("engine did not reach RUNNING");
}

async fn recv_from(endpoint: &mut BusEndpoint, id: u16) -> CanFrame {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), endpoint.recv())
            .await
            .expect("no frame within 2 s")
            .expect("bus closed");
        if frame.id() == id {
            return frame;
        }
    }
}

async fn request(link: &mut IsoTpLink, payload: &[u8]) -> Vec<u8> {
    link.send(payload).await.expect("request send");
    tokio::time::timeout(Duration::from_secs(2), link.recv())
        .await
        .expect("no response within 2 s")
        .expect("link closed")
}

#[tokio::test]
async fn rpm_read_matches_wire_encoding() {
    let (bus, _sim, control) = start_network();
    let mut endpoint = bus.endpoint();
    start_engine(&control).await;
    control
        .set_vehicle_params(VehicleParams {
            rpm: Some(1250.0),
            ..Default::default()
        })
        .unwrap();

    endpoint
        .send(CanFrame::new(
            ENGINE_REQ,
            &[0x02, 0x01, 0x0C, 0x00, 0x00, 0x00, 0x00, 0x00],
        ))
        .await
        .unwrap();

    let frame = recv_from(&mut endpoint, ENGINE_RESP).await;
    assert_eq!(
        frame.data(),
        &[0x04, 0x41, 0x0C, 0x13, 0x88, 0x00, 0x00, 0x00],
        "1250 rpm x 4 = 0x1388, padded single frame"
    );
}

#[tokio::test]
async fn vin_read_traverses_the_multi_frame_path() {
    let (bus, _sim, control) = start_network();
    let mut endpoint = bus.endpoint();
    control.set_ignition(IgnitionState::On);

    endpoint
        .send(CanFrame::new(
            ENGINE_REQ,
            &[0x02, 0x09, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00],
        ))
        .await
        .unwrap();

    // first frame: 20-byte response, 49 02 01 then the VIN head
    let ff = recv_from(&mut endpoint, ENGINE_RESP).await;
    assert_eq!(
        ff.data(),
        &[0x10, 0x14, 0x49, 0x02, 0x01, b'1', b'H', b'G'],
    );

    endpoint
        .send(CanFrame::new(
            ENGINE_REQ,
            &[0x30, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
        ))
        .await
        .unwrap();

    let cf1 = recv_from(&mut endpoint, ENGINE_RESP).await;
    assert_eq!(cf1.data()[0], 0x21);
    assert_eq!(&cf1.data()[1..], b"BH41JXM");
    let cf2 = recv_from(&mut endpoint, ENGINE_RESP).await;
    assert_eq!(cf2.data()[0], 0x22);
    assert_eq!(&cf2.data()[1..], b"N109186");
}

#[tokio::test]
async fn session_and_security_handshake() {
    let (bus, _sim, control) = start_network();
    let mut link = tester(&bus, ENGINE_REQ, ENGINE_RESP);
    control.set_ignition(IgnitionState::On);

    let resp = request(&mut link, &[0x10, 0x03]).await;
    assert_eq!(resp, vec![0x50, 0x03, 0x00, 0x32, 0x01, 0xF4]);

    let resp = request(&mut link, &[0x27, 0x01]).await;
    assert_eq!(resp[0..2], [0x67, 0x01]);
    let seed = u32::from_be_bytes([resp[2], resp[3], resp[4], resp[5]]);
    assert_ne!(seed, 0);

    let key = (seed ^ 0x1234_5678).to_be_bytes();
    let resp = request(&mut link, &[0x27, 0x02, key[0], key[1], key[2], key[3]]).await;
    assert_eq!(resp, vec![0x67, 0x02]);

    // three zero keys fail with InvalidKey, the fourth trips the lockout
    for _ in 0..3 {
        let resp = request(&mut link, &[0x27, 0x02, 0, 0, 0, 0]).await;
        assert_eq!(resp, vec![0x7F, 0x27, 0x35]);
    }
    let resp = request(&mut link, &[0x27, 0x02, 0, 0, 0, 0]).await;
    assert_eq!(resp, vec![0x7F, 0x27, 0x36]);
}

#[tokio::test]
async fn inject_and_report_dtc() {
    let (bus, _sim, control) = start_network();
    let mut link = tester(&bus, ENGINE_REQ, ENGINE_RESP);
    start_engine(&control).await;

    control.inject_dtc("engine", "P0420", true).unwrap();
    // let the tick task propagate the MIL
    tokio::time::sleep(Duration::from_millis(250)).await;

    let resp = request(&mut link, &[0x03]).await;
    assert_eq!(resp, vec![0x43, 0x01, 0x04, 0x20]);

    let resp = request(&mut link, &[0x01, 0x01]).await;
    assert_eq!(resp[0..2], [0x41, 0x01]);
    assert_eq!(resp[2], 0x81, "MIL on, one stored DTC");
}

#[tokio::test]
async fn clear_dtcs_resets_monitors() {
    let (bus, _sim, control) = start_network();
    let mut link = tester(&bus, ENGINE_REQ, ENGINE_RESP);
    start_engine(&control).await;
    control.inject_dtc("engine", "P0420", false).unwrap();

    let resp = request(&mut link, &[0x04]).await;
    assert_eq!(resp, vec![0x44]);
    let resp = request(&mut link, &[0x03]).await;
    assert_eq!(resp, vec![0x43, 0x00]);

    let readiness = control.get_readiness("engine").unwrap();
    assert!(!readiness.all_supported_complete());
    assert!(control.list_dtcs(Some("engine")).unwrap().is_empty());

    // MIL drops once the tick task re-derives it
    tokio::time::sleep(Duration::from_millis(250)).await;
    let resp = request(&mut link, &[0x01, 0x01]).await;
    assert_eq!(resp[2], 0x00);
}

#[tokio::test]
async fn functional_tester_present_answered_by_every_ecu() {
    let (bus, _sim, control) = start_network();
    let mut endpoint = bus.endpoint();
    control.set_ignition(IgnitionState::On);

    endpoint
        .send(CanFrame::new(
            FUNCTIONAL,
            &[0x02, 0x3E, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
        ))
        .await
        .unwrap();

    let mut responders = Vec::new();
    while responders.len() < 3 {
        let frame = tokio::time::timeout(Duration::from_secs(2), endpoint.recv())
            .await
            .expect("missing functional response")
            .unwrap();
        if (0x7E8..=0x7EA).contains(&frame.id()) {
            assert_eq!(&frame.data()[..3], &[0x02, 0x7E, 0x00]);
            responders.push(frame.id());
        }
    }
    responders.sort_unstable();
    assert_eq!(responders, vec![0x7E8, 0x7E9, 0x7EA]);
}

#[tokio::test]
async fn functional_obd_request_only_draws_capable_ecus() {
    let (bus, _sim, control) = start_network();
    let mut endpoint = bus.endpoint();
    control.set_ignition(IgnitionState::On);

    // Mode 01 PID 00 broadcast: only the engine serves OBD
    endpoint
        .send(CanFrame::new(
            FUNCTIONAL,
            &[0x02, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
        ))
        .await
        .unwrap();

    let frame = recv_from(&mut endpoint, ENGINE_RESP).await;
    assert_eq!(&frame.data()[1..3], &[0x41, 0x00]);

    // nothing (and in particular no 7F) from the UDS-only ECUs
    let extra = tokio::time::timeout(Duration::from_millis(300), async {
        loop {
            let frame = endpoint.recv().await.unwrap();
            if frame.id() == 0x7E9 || frame.id() == 0x7EA {
                return frame;
            }
        }
    })
    .await;
    assert!(extra.is_err(), "UDS-only ECUs must stay silent");
}

#[tokio::test]
async fn physical_obd_request_to_uds_only_ecu_is_rejected() {
    let (bus, _sim, control) = start_network();
    let mut link = tester(&bus, TRANS_REQ, 0x7E9);
    control.set_ignition(IgnitionState::On);

    let resp = request(&mut link, &[0x01, 0x0C]).await;
    assert_eq!(resp, vec![0x7F, 0x01, 0x11]);
}

#[tokio::test]
async fn ignition_off_silences_the_bus() {
    let (bus, _sim, control) = start_network();
    let mut link = tester(&bus, ENGINE_REQ, ENGINE_RESP);
    control.set_ignition(IgnitionState::On);

    let resp = request(&mut link, &[0x3E, 0x00]).await;
    assert_eq!(resp, vec![0x7E, 0x00]);

    control.set_ignition(IgnitionState::Off);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(control.get_snapshot().rpm, 0.0);

    link.send(&[0x3E, 0x00]).await.unwrap();
    let silent = tokio::time::timeout(Duration::from_millis(300), link.recv()).await;
    assert!(silent.is_err(), "requests after key-off draw no response");
}

#[tokio::test]
async fn dtcs_are_isolated_per_ecu() {
    let (bus, _sim, control) = start_network();
    control.set_ignition(IgnitionState::On);
    control.inject_dtc("abs", "C0035", false).unwrap();

    // engine Mode 03 does not see the chassis code
    let mut engine = tester(&bus, ENGINE_REQ, ENGINE_RESP);
    let resp = request(&mut engine, &[0x03]).await;
    assert_eq!(resp, vec![0x43, 0x00]);

    // the ABS ECU reports it over UDS 0x19
    let mut abs = tester(&bus, 0x7E2, 0x7EA);
    let resp = request(&mut abs, &[0x19, 0x02, 0xFF]).await;
    assert_eq!(resp[0..3], [0x59, 0x02, 0xFF]);
    assert_eq!(resp[3..6], [0x40, 0x35, 0x00]);
}

#[tokio::test]
async fn uds_vin_read_over_isotp() {
    let (bus, _sim, control) = start_network();
    let mut link = tester(&bus, ENGINE_REQ, ENGINE_RESP);
    control.set_ignition(IgnitionState::On);

    let resp = request(&mut link, &[0x22, 0xF1, 0x90]).await;
    assert_eq!(resp[0..3], [0x62, 0xF1, 0x90]);
    assert_eq!(&resp[3..], b"1HGBH41JXMN109186");
}

#[tokio::test]
async fn shutdown_cancels_the_network() {
    let (bus, mut sim, control) = start_network();
    let mut link = tester(&bus, ENGINE_REQ, ENGINE_RESP);
    control.set_ignition(IgnitionState::On);

    let resp = request(&mut link, &[0x3E, 0x00]).await;
    assert_eq!(resp, vec![0x7E, 0x00]);

    sim.shutdown();
    link.send(&[0x3E, 0x00]).await.unwrap();
    let silent = tokio::time::timeout(Duration::from_millis(300), link.recv()).await;
    assert!(silent.is_err(), "no responses after shutdown");
}
