use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;

use bridge_core::SessionId;

use crate::session::SessionState;

struct SessionEntry {
    state: SessionState,
    connected_at: Instant,
    last_pong: Instant,
}

/// Counts by lifecycle state, served by `/health`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub total: usize,
    pub awaiting_schema: usize,
    pub active: usize,
}

/// Live sessions of this server.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, SessionEntry>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: SessionId) {
        let now = Instant::now();
        let _ = self.sessions.insert(
            id,
            SessionEntry {
                state: SessionState::AwaitingSchema,
                connected_at: now,
                last_pong: now,
            },
        );
    }

    pub fn unregister(&self, id: &SessionId) {
        let _ = self.sessions.remove(id);
    }

    pub fn set_state(&self, id: &SessionId, state: SessionState) {
        if let Some(mut entry) = self.sessions.get_mut(id) {
            entry.state = state;
        }
    }

    pub fn state(&self, id: &SessionId) -> Option<SessionState> {
        self.sessions.get(id).map(|e| e.state)
    }

    pub fn record_pong(&self, id: &SessionId) {
        if let Some(mut entry) = self.sessions.get_mut(id) {
            entry.last_pong = Instant::now();
        }
    }

    /// False once no pong has arrived within `timeout`, or for unknown ids.
    pub fn is_alive(&self, id: &SessionId, timeout: Duration) -> bool {
        self.sessions
            .get(id)
            .is_some_and(|e| e.last_pong.elapsed() < timeout)
    }

    pub fn uptime(&self, id: &SessionId) -> Option<Duration> {
        self.sessions.get(id).map(|e| e.connected_at.elapsed())
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn summary(&self) -> SessionSummary {
        let mut summary = SessionSummary::default();
        for entry in self.sessions.iter() {
            summary.total += 1;
            match entry.state {
                SessionState::AwaitingSchema => summary.awaiting_schema += 1,
                SessionState::Active => summary.active += 1,
                SessionState::Closed => {}
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_unregister() {
        let registry = SessionRegistry::new();
        let a = SessionId::new();
        let b = SessionId::new();
        registry.register(a.clone());
        registry.register(b.clone());
        assert_eq!(registry.count(), 2);
        assert_eq!(registry.state(&a), Some(SessionState::AwaitingSchema));

        registry.unregister(&a);
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.state(&a), None);
    }

    #[test]
    fn summary_counts_states() {
        let registry = SessionRegistry::new();
        let a = SessionId::new();
        registry.register(a.clone());
        registry.register(SessionId::new());
        registry.set_state(&a, SessionState::Active);

        assert_eq!(
            registry.summary(),
            SessionSummary {
                total: 2,
                awaiting_schema: 1,
                active: 1
            }
        );
    }

    #[test]
    fn liveness_follows_pongs() {
        let registry = SessionRegistry::new();
        let id = SessionId::new();
        assert!(!registry.is_alive(&id, Duration::from_secs(60)));

        registry.register(id.clone());
        assert!(registry.is_alive(&id, Duration::from_secs(60)));
        assert!(!registry.is_alive(&id, Duration::ZERO));

        registry.record_pong(&id);
        assert!(registry.uptime(&id).is_some());
    }
}
