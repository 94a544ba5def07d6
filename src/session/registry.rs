//! Registry of live sessions, owned by the application state.
//!
//! Sessions register on startup and deregister in cleanup, so there is no
//! ambient global set to leak. The only cross-session operation is a
//! broadcast close, used when the process shuts down.

use dashmap::DashMap;
use tracing::info;

use crate::events::ServerEvent;

use super::OutboundItem;
use tokio::sync::mpsc;

#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, mpsc::Sender<OutboundItem>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session_id: String, emit_tx: mpsc::Sender<OutboundItem>) {
        self.sessions.insert(session_id, emit_tx);
    }

    pub fn deregister(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Ask every live session to close, with a user-visible reason.
    pub async fn broadcast_close(&self, reason: &str) {
        let targets: Vec<(String, mpsc::Sender<OutboundItem>)> = self
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        if targets.is_empty() {
            return;
        }
        info!(sessions = targets.len(), reason, "Broadcasting session close");

        for (session_id, emit_tx) in targets {
            let event = ServerEvent::fatal(format!("{reason}. Please reconnect."));
            // A session that already went away is fine to skip.
            if emit_tx.send(OutboundItem::Event(event)).await.is_err() {
                continue;
            }
            let _ = emit_tx.send(OutboundItem::Close).await;
            info!(session_id, "Close requested");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_deregister() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = mpsc::channel(4);

        registry.register("s1".to_string(), tx);
        assert_eq!(registry.len(), 1);

        registry.deregister("s1");
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_close_sends_fatal_then_close() {
        let registry = SessionRegistry::new();
        let (tx, mut rx) = mpsc::channel(4);
        registry.register("s1".to_string(), tx);

        registry.broadcast_close("Server is shutting down").await;

        match rx.recv().await {
            Some(OutboundItem::Event(ServerEvent::Error { error })) => {
                assert!(error.message.contains("shutting down"));
            }
            other => panic!("expected fatal error event, got {other:?}"),
        }
        assert!(matches!(rx.recv().await, Some(OutboundItem::Close)));
    }

    #[tokio::test]
    async fn test_broadcast_tolerates_dead_sessions() {
        let registry = SessionRegistry::new();
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        registry.register("dead".to_string(), tx);

        // Must not error or hang.
        registry.broadcast_close("bye").await;
    }
}
