//! Classic CAN frame model and duplex channel abstraction
//!
//! The simulator never touches real hardware directly: everything above this
//! module talks to a [`CanChannel`], which any duplex frame sink/source can
//! implement. [`VirtualCanBus`] is the in-process implementation used by the
//! tests and by the daemon's SocketCAN bridge.

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::warn;

/// Highest valid 11-bit arbitration ID.
pub const MAX_STANDARD_ID: u16 = 0x7FF;

/// A classic CAN data frame: 11-bit arbitration ID, 0-8 data bytes.
///
/// Extended (29-bit) IDs, remote frames and CAN-FD are out of scope.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    id: u16,
    dlc: u8,
    data: [u8; 8],
}

impl CanFrame {
    /// Build a frame. Panics on an out-of-range ID or oversized payload;
    /// both are programmer errors, not runtime conditions.
    pub fn new(id: u16, data: &[u8]) -> Self {
        assert!(id <= MAX_STANDARD_ID, "arbitration ID {id:#X} exceeds 11 bits");
        assert!(data.len() <= 8, "CAN frame carries at most 8 data bytes");
        let mut buf = [0u8; 8];
        buf[..data.len()].copy_from_slice(data);
        Self {
            id,
            dlc: data.len() as u8,
            data: buf,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.dlc as usize]
    }
}

impl std::fmt::Debug for CanFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#05X} [", self.id)?;
        for (i, b) in self.data().iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{b:02X}")?;
        }
        write!(f, "]")
    }
}

/// Communication channel errors
#[derive(Debug, thiserror::Error)]
pub enum CanBusError {
    /// The channel or bus hub has shut down
    #[error("CAN channel closed")]
    Closed,
}

/// A duplex CAN frame channel.
///
/// Implementations must serialize their own writes; callers may assume that
/// two frames sent back-to-back appear on the wire in order.
#[async_trait]
pub trait CanChannel: Send {
    async fn send(&mut self, frame: CanFrame) -> Result<(), CanBusError>;
    async fn recv(&mut self) -> Result<CanFrame, CanBusError>;
}

/// In-process CAN bus: every frame sent by one endpoint is observed by all
/// endpoints (including the sender, as with a local loopback interface).
#[derive(Clone)]
pub struct VirtualCanBus {
    tx: broadcast::Sender<CanFrame>,
}

impl VirtualCanBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Attach a new duplex endpoint to the bus.
    pub fn endpoint(&self) -> BusEndpoint {
        BusEndpoint {
            tx: self.tx.clone(),
            rx: self.tx.subscribe(),
        }
    }

    /// A send-only handle, usable from blocking contexts (the SocketCAN
    /// bridge feeds frames in from a reader thread).
    pub fn sender(&self) -> BusSender {
        BusSender {
            tx: self.tx.clone(),
        }
    }
}

impl Default for VirtualCanBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Send-only handle onto a [`VirtualCanBus`].
#[derive(Clone)]
pub struct BusSender {
    tx: broadcast::Sender<CanFrame>,
}

impl BusSender {
    /// Put a frame on the bus. A bus with no listeners swallows the frame,
    /// as real CAN hardware would without an ACKing node.
    pub fn send(&self, frame: CanFrame) {
        let _ = self.tx.send(frame);
    }
}

/// Duplex endpoint on a [`VirtualCanBus`].
pub struct BusEndpoint {
    tx: broadcast::Sender<CanFrame>,
    rx: broadcast::Receiver<CanFrame>,
}

#[async_trait]
impl CanChannel for BusEndpoint {
    async fn send(&mut self, frame: CanFrame) -> Result<(), CanBusError> {
        let _ = self.tx.send(frame);
        Ok(())
    }

    async fn recv(&mut self) -> Result<CanFrame, CanBusError> {
        loop {
            match self.rx.recv().await {
                Ok(frame) => return Ok(frame),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "bus endpoint lagged, frames lost");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(CanBusError::Closed),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_truncates_debug_to_dlc() {
        let frame = CanFrame::new(0x7E0, &[0x02, 0x01, 0x0C]);
        assert_eq!(frame.data(), &[0x02, 0x01, 0x0C]);
        assert_eq!(format!("{frame:?}"), "0x7E0 [02 01 0C]");
    }

    #[test]
    #[should_panic]
    fn frame_rejects_extended_id() {
        let _ = CanFrame::new(0x800, &[]);
    }

    #[tokio::test]
    async fn all_endpoints_observe_each_frame() {
        let bus = VirtualCanBus::new(16);
        let mut a = bus.endpoint();
        let mut b = bus.endpoint();
        let mut c = bus.endpoint();

        let frame = CanFrame::new(0x123, &[1, 2, 3]);
        a.send(frame).await.unwrap();

        assert_eq!(b.recv().await.unwrap(), frame);
        assert_eq!(c.recv().await.unwrap(), frame);
        // loopback: the sender sees its own frame too
        assert_eq!(a.recv().await.unwrap(), frame);
    }

    #[tokio::test]
    async fn sender_handle_feeds_endpoints() {
        let bus = VirtualCanBus::new(16);
        let mut ep = bus.endpoint();
        bus.sender().send(CanFrame::new(0x7DF, &[0x02, 0x3E, 0x00]));
        assert_eq!(ep.recv().await.unwrap().id(), 0x7DF);
    }
}
