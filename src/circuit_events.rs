use tokio::sync::broadcast;
use tracing::trace;

use crate::circuit::{CircuitInfo, CloseReason};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CircuitEvent {
    Opened(CircuitOpenedData),
    /// Sent once per circuit, after the circuit was removed from the end point. Nothing is
    ///  dispatched for the circuit after this event.
    Closed(CircuitClosedData),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CircuitOpenedData {
    pub circuit: CircuitInfo,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CircuitClosedData {
    pub circuit: CircuitInfo,
    pub reason: CloseReason,
}

pub struct CircuitEventNotifier {
    sender: broadcast::Sender<CircuitEvent>,
}

impl Default for CircuitEventNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitEventNotifier {
    pub fn new() -> CircuitEventNotifier {
        let (sender, _) = broadcast::channel(128);

        CircuitEventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CircuitEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: CircuitEvent) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}
