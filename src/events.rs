/// Event Bus Module
///
/// Typed event stream connecting the core to out-of-scope collaborators
/// (tray, dialogs, notifications). Consumers subscribe with a receiver and
/// project their own view; the core never blocks on a slow subscriber.
use tokio::sync::{broadcast, mpsc};

use crate::activity::ActivityEntry;
use crate::conflict::{ConflictRecord, ConflictResolution};
use crate::peer::{Peer, PeerId};
use crate::state_store::TransferDirection;

/// Events emitted by the daemon core.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    PeerDiscovered(Peer),
    UntrustedPeerDiscovered(Peer),
    PeerLost(PeerId),
    TransferStarted {
        relative_path: String,
        peer_id: PeerId,
        direction: TransferDirection,
        total_bytes: u64,
    },
    TransferProgress {
        relative_path: String,
        peer_id: PeerId,
        bytes_transferred: u64,
        total_bytes: u64,
    },
    TransferCompleted {
        relative_path: String,
        peer_id: PeerId,
    },
    TransferFailed {
        relative_path: String,
        peer_id: PeerId,
        reason: String,
    },
    /// A peer offers a file outside the sync folder flow; reply `true` to
    /// accept through the responder.
    IncomingFileRequest {
        file_name: String,
        sender: PeerId,
        size: u64,
        respond: mpsc::Sender<bool>,
    },
    /// A divergent edit needs a decision; reply through the responder.
    ConflictDetected {
        record: ConflictRecord,
        respond: mpsc::Sender<ConflictResolution>,
    },
    FolderAutoLocked {
        folder: String,
    },
    ActivityAppended(ActivityEntry),
    BindingFailed {
        port: u16,
        reason: String,
    },
}

/// Broadcast fan-out for `SyncEvent`s. Cheap to clone; subscribers that lag
/// behind the buffer miss events rather than stalling the core.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Emit an event. Dropped silently when nobody is subscribed.
    pub fn emit(&self, event: SyncEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_subscribers() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(SyncEvent::PeerLost(uuid::Uuid::nil()));
        match rx.recv().await.unwrap() {
            SyncEvent::PeerLost(id) => assert!(id.is_nil()),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.emit(SyncEvent::FolderAutoLocked { folder: "secret".into() });
    }
}
