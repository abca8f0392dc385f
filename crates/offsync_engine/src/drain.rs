//! Handshake with the host's outbound mutation queue.

use tokio::sync::oneshot;
use tracing::debug;

/// Parks an attempt after apply until the host acknowledges its queue is flushed.
///
/// There is no timeout: an attempt stays parked until the host calls
/// `notify_queue_drained` or the attempt is cancelled.
#[derive(Debug, Default)]
pub struct QueueDrainCoordinator {
    pending: Option<oneshot::Sender<()>>,
}

impl QueueDrainCoordinator {
    /// Creates an unarmed coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms the handshake and returns the receiver to await.
    ///
    /// Re-arming drops the previous receiver's sender.
    pub fn arm(&mut self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.pending = Some(tx);
        rx
    }

    /// Returns true if an acknowledgement is expected.
    pub fn is_armed(&self) -> bool {
        self.pending.is_some()
    }

    /// Delivers the host acknowledgement; returns false if nothing was armed.
    pub fn acknowledge(&mut self) -> bool {
        match self.pending.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => {
                debug!("queue drain acknowledged while no attempt is waiting; ignoring");
                false
            }
        }
    }

    /// Drops a pending handshake.
    pub fn disarm(&mut self) {
        self.pending = None;
    }
}
