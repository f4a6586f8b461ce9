//! Kernel observer queue.
//!
//! Background loops and the router publish [`KernelEvent`]s here; the
//! coordinator's event pump drains the queue and hands each event to every
//! fragment. Publishing never blocks and never fails.

use ionctl_types::KernelEvent;
use tokio::sync::broadcast;
use tracing::{debug, warn};

const DEFAULT_CAPACITY: usize = 256;

/// Shared event bus. Clones share one channel.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<KernelEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish `event`. Returns the number of receivers handed the event.
    pub fn publish(&self, event: KernelEvent) -> usize {
        let name = event.name();
        match self.sender.send(event) {
            Ok(n) => n,
            Err(_) => {
                debug!(event = name, "kernel event published with no observers");
                0
            }
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

pub struct EventReceiver {
    receiver: broadcast::Receiver<KernelEvent>,
}

impl EventReceiver {
    /// Next event, skipping over any that were lost to lag. `None` once
    /// every publisher is gone.
    pub async fn recv(&mut self) -> Option<KernelEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(lagged_by = n, "kernel event observer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<KernelEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(lagged_by = n, "kernel event observer lagged");
                }
                Err(_) => return None,
            }
        }
    }

    /// Drain everything currently buffered.
    pub fn drain(&mut self) -> Vec<KernelEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}
