use crate::control::SessionState;
use crate::transfer::TransferState;
use crate::types::{PlayerId, RequestId, ServerStatus};
use tokio::sync::broadcast;

/// Something the bridge observed that the host application may want to surface.
#[derive(Clone, Debug, PartialEq)]
pub enum BridgeEvent {
    SessionStateChanged(SessionState),
    LocalStatusChanged(ServerStatus),
    /// Heartbeats have been failing for longer than the record TTL.
    RegistryUnavailable,
    RegistryRecovered,
    ProxyRequestedDrain { reason: String },
    TransferResolved {
        request_id: RequestId,
        player_id: PlayerId,
        state: TransferState,
    },
}

#[derive(Clone)]
pub(crate) struct EventBus {
    sender: broadcast::Sender<BridgeEvent>,
}

impl EventBus {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        EventBus { sender }
    }

    pub(crate) fn publish(&self, event: BridgeEvent) {
        // No listeners is fine.
        let _ = self.sender.send(event);
    }

    pub(crate) fn listener(&self) -> BridgeEventListener {
        BridgeEventListener {
            receiver: self.sender.subscribe(),
        }
    }
}

pub struct BridgeEventListener {
    receiver: broadcast::Receiver<BridgeEvent>,
}

impl BridgeEventListener {
    /// `next()` returns the next event observed by this bridge, or `None` once the bridge is gone.
    /// A listener that falls behind silently skips the events it missed.
    pub async fn next(&mut self) -> Option<BridgeEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lagging_listener_skips_ahead() {
        let bus = EventBus::new(2);
        let mut listener = bus.listener();

        bus.publish(BridgeEvent::RegistryUnavailable);
        bus.publish(BridgeEvent::RegistryRecovered);
        bus.publish(BridgeEvent::LocalStatusChanged(ServerStatus::Live));

        assert_eq!(listener.next().await, Some(BridgeEvent::RegistryRecovered));
        assert_eq!(listener.next().await, Some(BridgeEvent::LocalStatusChanged(ServerStatus::Live)));

        drop(bus);
        assert_eq!(listener.next().await, None);
    }
}
