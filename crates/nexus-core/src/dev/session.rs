//! Per-connection live-update state.

use nexus_proto::ServerEvent;
use tracing::{debug, trace};

/// One connected client.
///
/// Generations delivered to a session only move forward: an event at or
/// below the last delivered generation is dropped. Error events are the
/// exception: they describe the generation already delivered and may repeat
/// it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevSession {
    id: u64,
    last_delivered: u64,
    last_acked: u64,
}

impl DevSession {
    /// Open a session at the generation the client is about to load.
    #[must_use]
    pub fn new(id: u64, generation: u64) -> Self {
        Self {
            id,
            last_delivered: generation,
            last_acked: 0,
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn last_delivered(&self) -> u64 {
        self.last_delivered
    }

    #[must_use]
    pub fn last_acked(&self) -> u64 {
        self.last_acked
    }

    /// First frame sent on a new connection.
    #[must_use]
    pub fn connected(&self) -> ServerEvent {
        ServerEvent::Connected {
            generation: self.last_delivered,
        }
    }

    /// Whether `event` should be sent. Advances the delivered generation.
    pub fn accept(&mut self, event: &ServerEvent) -> bool {
        let generation = event.generation();
        let deliver = match event {
            ServerEvent::Error { .. } => generation >= self.last_delivered,
            _ => generation > self.last_delivered,
        };
        if !deliver {
            trace!(
                session = self.id,
                generation,
                last_delivered = self.last_delivered,
                "Dropping stale event"
            );
            return false;
        }
        self.last_delivered = generation;
        true
    }

    /// The session missed events; it must reload at `current`.
    pub fn lagged(&mut self, current: u64, skipped: u64) -> ServerEvent {
        debug!(session = self.id, skipped, current, "Session lagged, forcing reload");
        self.last_delivered = self.last_delivered.max(current);
        ServerEvent::FullReload {
            generation: self.last_delivered,
            reason: Some(format!("missed {skipped} update(s)")),
        }
    }

    /// Record an acknowledgement. Acks never move backwards and never pass
    /// what was delivered.
    pub fn ack(&mut self, generation: u64) -> bool {
        if generation <= self.last_acked || generation > self.last_delivered {
            return false;
        }
        self.last_acked = generation;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(generation: u64) -> ServerEvent {
        ServerEvent::Update {
            changed_ids: vec!["/a.js".into()],
            generation,
        }
    }

    #[test]
    fn test_connected_reports_open_generation() {
        let session = DevSession::new(1, 4);
        assert_eq!(session.connected(), ServerEvent::Connected { generation: 4 });
    }

    #[test]
    fn test_generations_are_monotonic() {
        let mut session = DevSession::new(1, 2);
        assert!(!session.accept(&update(2)));
        assert!(session.accept(&update(3)));
        assert!(!session.accept(&update(3)));
        assert!(!session.accept(&ServerEvent::FullReload {
            generation: 1,
            reason: None
        }));
        assert!(session.accept(&update(5)));
        assert_eq!(session.last_delivered(), 5);
    }

    #[test]
    fn test_error_may_repeat_generation() {
        let mut session = DevSession::new(1, 0);
        assert!(session.accept(&update(1)));
        let error = ServerEvent::Error {
            generation: 1,
            error: nexus_proto::ErrorPayload::new("TRANSFORM_FAILED", "bad", 1),
        };
        assert!(session.accept(&error));
        assert!(!session.accept(&update(1)));
    }

    #[test]
    fn test_lag_forces_reload_at_current() {
        let mut session = DevSession::new(1, 2);
        let event = session.lagged(9, 3);
        assert_eq!(event.generation(), 9);
        assert!(matches!(event, ServerEvent::FullReload { .. }));
        assert!(!session.accept(&update(8)));
    }

    #[test]
    fn test_acks() {
        let mut session = DevSession::new(1, 0);
        session.accept(&update(3));
        assert!(!session.ack(4));
        assert!(session.ack(3));
        assert!(!session.ack(2));
        assert_eq!(session.last_acked(), 3);
    }
}
