//! Bidirectional ISO-TP transport session for one address pair
//!
//! An [`IsoTpLink`] owns the inbound frame stream for its pair and a sender
//! towards the bus. At most one inbound reassembly and one outbound transfer
//! are in progress at a time; frames that arrive while the link is waiting
//! for flow control are deferred (bounded) and drained by the next receive.

use std::collections::VecDeque;

use tokio::sync::mpsc;
use tokio::time::{timeout, timeout_at, Duration, Instant};
use tracing::{debug, trace, warn};

use crate::can::{CanChannel, CanFrame};
use crate::frame::{self, FlowStatus, Pci, CF_DATA_LEN, FF_DATA_LEN, MAX_PAYLOAD, SF_MAX_LEN};

/// Frames queued while an outbound transfer holds the link.
const DEFERRED_LIMIT: usize = 8;

/// ISO-TP session parameters.
#[derive(Debug, Clone, Copy)]
pub struct IsoTpConfig {
    /// Block size advertised in our flow controls (0 = send everything).
    pub block_size: u8,
    /// STmin advertised in our flow controls (raw encoding).
    pub st_min: u8,
    /// N_Bs: how long the sender waits for a flow control frame.
    pub n_bs_timeout: Duration,
    /// N_Cr: how long the receiver waits for the next consecutive frame.
    pub n_cr_timeout: Duration,
    /// Consecutive FC=WAIT frames tolerated before the transfer fails.
    pub max_wait_frames: u8,
    /// Pad transmitted frames to 8 bytes.
    pub pad_frames: bool,
}

impl Default for IsoTpConfig {
    fn default() -> Self {
        Self {
            block_size: 0,
            st_min: 0,
            n_bs_timeout: Duration::from_millis(1000),
            n_cr_timeout: Duration::from_millis(1000),
            max_wait_frames: 10,
            pad_frames: true,
        }
    }
}

/// Transport-layer failures.
///
/// Framing problems on the receive path (bad PCI, sequence mismatch, N_Cr
/// expiry) are recovered locally: the transfer is discarded with a log and
/// the link keeps listening. Only send-path failures and channel teardown
/// surface as errors.
#[derive(Debug, thiserror::Error)]
pub enum IsoTpError {
    #[error("payload length {0} outside 1..=4095")]
    PayloadLength(usize),
    #[error("timed out waiting for flow control (N_Bs)")]
    FlowControlTimeout,
    #[error("peer reported receive buffer overflow")]
    Overflow,
    #[error("peer sent {0} consecutive WAIT flow controls")]
    TooManyWaits(u8),
    #[error("CAN channel closed")]
    ChannelClosed,
}

struct Reassembly {
    total_len: usize,
    buf: Vec<u8>,
    next_sn: u8,
    frames_since_fc: u8,
    last_frame: Instant,
}

struct FlowControlInfo {
    block_size: u8,
    st_min: u8,
}

/// One ISO-TP session between a local transmit ID and a peer transmit ID.
pub struct IsoTpLink {
    tx_id: u16,
    rx_id: u16,
    cfg: IsoTpConfig,
    outbound: mpsc::Sender<CanFrame>,
    inbound: mpsc::Receiver<CanFrame>,
    deferred: VecDeque<CanFrame>,
    rx: Option<Reassembly>,
}

impl IsoTpLink {
    /// Build a link over raw frame channels. `inbound` should carry frames
    /// addressed to `rx_id`; anything else is silently discarded.
    pub fn new(
        tx_id: u16,
        rx_id: u16,
        cfg: IsoTpConfig,
        outbound: mpsc::Sender<CanFrame>,
        inbound: mpsc::Receiver<CanFrame>,
    ) -> Self {
        Self {
            tx_id,
            rx_id,
            cfg,
            outbound,
            inbound,
            deferred: VecDeque::new(),
            rx: None,
        }
    }

    /// Build a link directly over a [`CanChannel`], spawning a pump task
    /// that filters inbound frames by `rx_id`. This is the tester-side
    /// convenience used by tools and tests.
    pub fn over_channel(
        channel: Box<dyn CanChannel>,
        tx_id: u16,
        rx_id: u16,
        cfg: IsoTpConfig,
    ) -> Self {
        let (in_tx, in_rx) = mpsc::channel(64);
        let (out_tx, mut out_rx) = mpsc::channel::<CanFrame>(64);
        tokio::spawn(async move {
            let mut channel = channel;
            loop {
                tokio::select! {
                    inbound = channel.recv() => match inbound {
                        Ok(frame) => {
                            if frame.id() == rx_id && in_tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    },
                    outbound = out_rx.recv() => match outbound {
                        Some(frame) => {
                            if channel.send(frame).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });
        Self::new(tx_id, rx_id, cfg, out_tx, in_rx)
    }

    pub fn tx_id(&self) -> u16 {
        self.tx_id
    }

    pub fn rx_id(&self) -> u16 {
        self.rx_id
    }

    /// Send one payload (1..=4095 bytes) to the peer, running the
    /// flow-control handshake for multi-frame transfers.
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), IsoTpError> {
        if payload.is_empty() || payload.len() > MAX_PAYLOAD {
            return Err(IsoTpError::PayloadLength(payload.len()));
        }

        if payload.len() <= SF_MAX_LEN {
            return self
                .write(frame::single(self.tx_id, payload, self.cfg.pad_frames))
                .await;
        }

        self.write(frame::first(self.tx_id, payload)).await?;

        let mut remaining = &payload[FF_DATA_LEN..];
        let mut sn: u8 = 1;
        let mut waits: u8 = 0;
        'blocks: loop {
            let fc = self.wait_flow_control(&mut waits).await?;
            let gap = frame::st_min_delay(fc.st_min);
            let mut in_block: u8 = 0;
            loop {
                let take = remaining.len().min(CF_DATA_LEN);
                self.write(frame::consecutive(
                    self.tx_id,
                    sn,
                    &remaining[..take],
                    self.cfg.pad_frames,
                ))
                .await?;
                remaining = &remaining[take..];
                sn = (sn + 1) & 0x0F;
                in_block += 1;
                if remaining.is_empty() {
                    return Ok(());
                }
                if fc.block_size != 0 && in_block >= fc.block_size {
                    continue 'blocks;
                }
                if !gap.is_zero() {
                    tokio::time::sleep(gap).await;
                }
            }
        }
    }

    /// Receive the next complete payload, reassembling multi-frame
    /// transfers and answering flow control.
    pub async fn recv(&mut self) -> Result<Vec<u8>, IsoTpError> {
        loop {
            let frame = self.next_frame().await?;
            if let Some(payload) = self.accept(frame).await? {
                return Ok(payload);
            }
        }
    }

    async fn next_frame(&mut self) -> Result<CanFrame, IsoTpError> {
        if let Some(frame) = self.deferred.pop_front() {
            return Ok(frame);
        }
        loop {
            match &self.rx {
                Some(rx) => {
                    let deadline = rx.last_frame + self.cfg.n_cr_timeout;
                    match timeout_at(deadline, self.inbound.recv()).await {
                        Ok(Some(frame)) => return Ok(frame),
                        Ok(None) => return Err(IsoTpError::ChannelClosed),
                        Err(_) => {
                            warn!(
                                rx_id = self.rx_id,
                                "N_Cr expired waiting for consecutive frame, discarding transfer"
                            );
                            self.rx = None;
                        }
                    }
                }
                None => return self.inbound.recv().await.ok_or(IsoTpError::ChannelClosed),
            }
        }
    }

    async fn accept(&mut self, frame: CanFrame) -> Result<Option<Vec<u8>>, IsoTpError> {
        if frame.id() != self.rx_id {
            trace!(id = frame.id(), "discarding frame for foreign ID");
            return Ok(None);
        }

        let pci = match frame::parse(frame.data()) {
            Some(pci) => pci,
            None => {
                warn!(?frame, "discarding frame with malformed PCI");
                return Ok(None);
            }
        };

        match pci {
            Pci::Single { len } => {
                if len == 0 || len > SF_MAX_LEN || len > frame.data().len().saturating_sub(1) {
                    warn!(?frame, len, "discarding single frame with invalid length");
                    return Ok(None);
                }
                if self.rx.take().is_some() {
                    warn!("single frame interrupts reassembly, discarding partial transfer");
                }
                Ok(Some(frame.data()[1..=len].to_vec()))
            }
            Pci::First { total_len } => {
                if total_len <= SF_MAX_LEN || total_len > MAX_PAYLOAD {
                    warn!(?frame, total_len, "discarding first frame with invalid length");
                    return Ok(None);
                }
                if self.rx.is_some() {
                    // last-writer-wins: a new transfer replaces the old one
                    warn!(
                        rx_id = self.rx_id,
                        "new first frame replaces in-progress transfer"
                    );
                }
                let head = &frame.data()[2..];
                let take = head.len().min(FF_DATA_LEN).min(total_len);
                self.rx = Some(Reassembly {
                    total_len,
                    buf: head[..take].to_vec(),
                    next_sn: 1,
                    frames_since_fc: 0,
                    last_frame: Instant::now(),
                });
                self.send_flow_control(FlowStatus::ContinueToSend).await?;
                Ok(None)
            }
            Pci::Consecutive { sn } => {
                let Some(rx) = self.rx.as_mut() else {
                    trace!(sn, "consecutive frame without transfer in progress");
                    return Ok(None);
                };
                if sn != rx.next_sn {
                    warn!(
                        expected = rx.next_sn,
                        got = sn,
                        "sequence number mismatch, aborting transfer"
                    );
                    self.rx = None;
                    return Ok(None);
                }
                let remaining = rx.total_len - rx.buf.len();
                let body = &frame.data()[1..];
                let take = remaining.min(CF_DATA_LEN).min(body.len());
                rx.buf.extend_from_slice(&body[..take]);
                rx.next_sn = (sn + 1) & 0x0F;
                rx.frames_since_fc += 1;
                rx.last_frame = Instant::now();

                if rx.buf.len() >= rx.total_len {
                    let done = self.rx.take().expect("reassembly present");
                    debug!(len = done.total_len, "reassembly complete");
                    return Ok(Some(done.buf));
                }
                if self.cfg.block_size != 0 {
                    let due = {
                        let rx = self.rx.as_mut().expect("reassembly present");
                        if rx.frames_since_fc >= self.cfg.block_size {
                            rx.frames_since_fc = 0;
                            true
                        } else {
                            false
                        }
                    };
                    if due {
                        self.send_flow_control(FlowStatus::ContinueToSend).await?;
                    }
                }
                Ok(None)
            }
            Pci::FlowControl { .. } => {
                trace!("flow control outside an outbound transfer, discarding");
                Ok(None)
            }
        }
    }

    async fn wait_flow_control(
        &mut self,
        waits: &mut u8,
    ) -> Result<FlowControlInfo, IsoTpError> {
        loop {
            let frame = match timeout(self.cfg.n_bs_timeout, self.inbound.recv()).await {
                Ok(Some(frame)) => frame,
                Ok(None) => return Err(IsoTpError::ChannelClosed),
                Err(_) => return Err(IsoTpError::FlowControlTimeout),
            };
            if frame.id() != self.rx_id {
                trace!(id = frame.id(), "discarding frame for foreign ID");
                continue;
            }
            match frame::parse(frame.data()) {
                Some(Pci::FlowControl {
                    status,
                    block_size,
                    st_min,
                }) => match status {
                    FlowStatus::ContinueToSend => {
                        return Ok(FlowControlInfo { block_size, st_min })
                    }
                    FlowStatus::Wait => {
                        *waits += 1;
                        if *waits > self.cfg.max_wait_frames {
                            return Err(IsoTpError::TooManyWaits(*waits));
                        }
                        debug!(waits = *waits, "peer asked to wait");
                    }
                    FlowStatus::Overflow => return Err(IsoTpError::Overflow),
                },
                Some(_) => self.defer(frame),
                None => warn!(?frame, "discarding frame with malformed PCI"),
            }
        }
    }

    /// Queue a frame that arrived while an outbound transfer holds the
    /// link; the next `recv` drains the queue in order.
    fn defer(&mut self, frame: CanFrame) {
        if self.deferred.len() >= DEFERRED_LIMIT {
            warn!(?frame, "deferred queue full, dropping frame");
            return;
        }
        self.deferred.push_back(frame);
    }

    async fn send_flow_control(&mut self, status: FlowStatus) -> Result<(), IsoTpError> {
        self.write(frame::flow_control(
            self.tx_id,
            status,
            self.cfg.block_size,
            self.cfg.st_min,
            self.cfg.pad_frames,
        ))
        .await
    }

    async fn write(&mut self, frame: CanFrame) -> Result<(), IsoTpError> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| IsoTpError::ChannelClosed)
    }
}
