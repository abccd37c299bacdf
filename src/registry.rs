// Registry of in-flight critical sessions. The single piece of state shared
// between caller threads, the renewal loop and the shutdown path.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::SessionId;

#[derive(Debug, Clone)]
pub struct SessionRecord {
    /// When the session entered the critical state.
    pub critical_since: Instant,
}

/// Tracks the set of currently active critical sessions for this process.
///
/// All mutation goes through one mutex; reads take a point-in-time snapshot.
/// The lock is never held across an await point or an external API call.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, SessionRecord>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new critical session and return its identifier.
    pub fn register(&self) -> SessionId {
        let id = SessionId::new();
        let mut sessions = self.sessions.lock();
        sessions.insert(
            id,
            SessionRecord {
                critical_since: Instant::now(),
            },
        );
        info!(session = %id, active = sessions.len(), "critical session registered");
        id
    }

    /// Remove a session. Unknown ids are a no-op so cleanup is idempotent.
    pub fn unregister(&self, id: SessionId) {
        let mut sessions = self.sessions.lock();
        if sessions.remove(&id).is_some() {
            info!(session = %id, active = sessions.len(), "critical session ended");
        } else {
            debug!(session = %id, "unregister for unknown session ignored");
        }
    }

    pub fn active_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn active_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn register_and_unregister() {
        let registry = SessionRegistry::new();
        assert_eq!(registry.active_count(), 0);

        let a = registry.register();
        let b = registry.register();
        assert_eq!(registry.active_count(), 2);
        assert!(registry.active_ids().contains(&a));
        assert!(registry.active_ids().contains(&b));

        registry.unregister(a);
        assert_eq!(registry.active_count(), 1);
        registry.unregister(b);
        assert!(registry.is_empty());
    }

    #[test]
    fn unknown_id_is_a_noop() {
        let registry = SessionRegistry::new();
        registry.unregister(SessionId::new());
        assert_eq!(registry.active_count(), 0);

        let id = registry.register();
        registry.unregister(id);
        // Double unregister must not underflow or fail.
        registry.unregister(id);
        assert_eq!(registry.active_count(), 0);
    }

    proptest! {
        /// Count always equals begins minus matched ends, never negative.
        #[test]
        fn count_matches_begin_end_sequence(ops in proptest::collection::vec(0usize..3, 0..64)) {
            let registry = SessionRegistry::new();
            let mut live: Vec<SessionId> = Vec::new();

            for op in ops {
                match op {
                    0 => live.push(registry.register()),
                    1 => {
                        if let Some(id) = live.pop() {
                            registry.unregister(id);
                        }
                    }
                    _ => registry.unregister(SessionId::new()),
                }
                prop_assert_eq!(registry.active_count(), live.len());
            }
        }
    }
}
