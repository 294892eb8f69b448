use bancroft_core::{MatchId, MatchStatus, TransactionId};
use serde::Serialize;
use tokio::sync::broadcast;

/// A match changed state. Emitted after the database write commits.
#[derive(Debug, Clone, Serialize)]
pub struct MatchEvent {
    pub transaction_id: TransactionId,
    pub match_id: Option<MatchId>,
    pub status: MatchStatus,
}

/// Outbound notification seam. Delivery is strictly best-effort: a slow or
/// absent subscriber must never fail or delay the state change that
/// triggered it.
pub trait Notifier: Send + Sync {
    fn match_changed(&self, event: MatchEvent);
}

/// In-process fan-out over a broadcast channel. Anything that wants to react
/// to match changes (UI push, audit tail) subscribes here.
pub struct BroadcastNotifier {
    tx: broadcast::Sender<MatchEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MatchEvent> {
        self.tx.subscribe()
    }
}

impl Notifier for BroadcastNotifier {
    fn match_changed(&self, event: MatchEvent) {
        // send() errors only when nobody is subscribed, which is fine.
        let _ = self.tx.send(event);
    }
}
