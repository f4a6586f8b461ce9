//! Many-to-one telemetry/result channel.
//!
//! Workers (or the gateway on their behalf) push [`DataPacket`]s through
//! cloned [`DataSender`]s; the kernel's consumer loop drains the single
//! [`DataReceiver`]. Ingress never blocks: a full queue drops the packet
//! and logs it. Malformed payloads are logged and dropped as well.

use std::time::Duration;

use ionctl_types::{DataPacket, KernelError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Default number of packets buffered before ingress starts dropping.
pub const DEFAULT_DATA_CAPACITY: usize = 1024;

/// Create a bounded data channel.
pub fn data_channel(capacity: usize) -> (DataSender, DataReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (DataSender { tx }, DataReceiver { rx })
}

/// Producer half. Clone one per worker connection.
#[derive(Clone, Debug)]
pub struct DataSender {
    tx: mpsc::Sender<DataPacket>,
}

impl DataSender {
    /// Enqueue `packet`. Returns `false` when it was dropped.
    pub fn send(&self, packet: DataPacket) -> bool {
        match self.tx.try_send(packet) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(p)) => {
                warn!(source = %p.source, category = %p.category, "data queue full; packet dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(p)) => {
                debug!(source = %p.source, "data channel closed; packet dropped");
                false
            }
        }
    }

    /// Decode a JSON packet and enqueue it. Malformed input is logged and
    /// dropped.
    pub fn send_raw(&self, raw: &str) -> bool {
        match serde_json::from_str::<DataPacket>(raw) {
            Ok(packet) => self.send(packet),
            Err(e) => {
                warn!(error = %e, "malformed data packet dropped");
                false
            }
        }
    }
}

/// Consumer half, owned by the kernel's data loop.
#[derive(Debug)]
pub struct DataReceiver {
    rx: mpsc::Receiver<DataPacket>,
}

impl DataReceiver {
    /// Wait up to `timeout` for the next packet.
    ///
    /// `Ok(None)` means nothing arrived in time. An error means every sender
    /// is gone and no packet will ever arrive again.
    pub async fn receive_data(&mut self, timeout: Duration) -> Result<Option<DataPacket>, KernelError> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(packet)) => Ok(Some(packet)),
            Ok(None) => Err(KernelError::Transport("data channel closed".into())),
            Err(_) => Ok(None),
        }
    }

    /// Take a buffered packet without waiting.
    pub fn try_receive(&mut self) -> Option<DataPacket> {
        self.rx.try_recv().ok()
    }
}
