use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

/// Opaque session identifier, derived from the peer socket address.
pub type SessionId = String;

/// Live set of connected sessions.
///
/// Each session registers the sending half of its outbound channel; the
/// receiving half lives with the connection task that owns the socket.
/// Broadcast iterates over a copy of the senders so registration changes on
/// other tasks cannot race the iteration, and a failed send means the session
/// is already gone: it is pruned silently, never reported to the broadcaster.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, mpsc::UnboundedSender<String>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, id: SessionId, outbound: mpsc::UnboundedSender<String>) {
        self.sessions
            .lock()
            .expect("session registry lock poisoned")
            .insert(id, outbound);
    }

    /// Remove a session. Returns false when it was already gone.
    pub fn remove(&self, id: &str) -> bool {
        self.sessions
            .lock()
            .expect("session registry lock poisoned")
            .remove(id)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .expect("session registry lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorted ids of every live session.
    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self
            .sessions
            .lock()
            .expect("session registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Deliver `message` to every session except `exclude`. Returns how many
    /// sessions it was actually delivered to.
    pub fn broadcast(&self, message: &str, exclude: Option<&str>) -> usize {
        let targets: Vec<(SessionId, mpsc::UnboundedSender<String>)> = {
            let sessions = self
                .sessions
                .lock()
                .expect("session registry lock poisoned");
            sessions
                .iter()
                .filter(|(id, _)| exclude != Some(id.as_str()))
                .map(|(id, tx)| (id.clone(), tx.clone()))
                .collect()
        };

        let mut delivered = 0;
        let mut dead: Vec<SessionId> = Vec::new();
        for (id, tx) in targets {
            if tx.send(message.to_string()).is_ok() {
                delivered += 1;
            } else {
                dead.push(id);
            }
        }

        if !dead.is_empty() {
            let mut sessions = self
                .sessions
                .lock()
                .expect("session registry lock poisoned");
            for id in dead {
                sessions.remove(&id);
                debug!(session = %id, "pruned dead session during broadcast");
            }
        }
        delivered
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
