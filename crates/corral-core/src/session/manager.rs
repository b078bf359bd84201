//! The live session map, keyed by agent id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{info, warn};

use super::{AgentSession, CloseReason};

pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<AgentSession>>>,
    replace_wait: Duration,
}

impl SessionManager {
    pub fn new(replace_wait: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            replace_wait,
        }
    }

    /// Install `session` as the agent's current session. A previous session
    /// for the same agent is closed and given up to the replace wait to shut
    /// down before this returns, so the new session only starts draining
    /// once the old one has stopped writing.
    pub async fn attach(&self, session: Arc<AgentSession>) -> Option<Arc<AgentSession>> {
        let previous = self
            .sessions
            .write()
            .insert(session.agent_id().to_string(), Arc::clone(&session));

        if let Some(old) = &previous {
            info!(
                agent_id = %old.agent_id(),
                old_session = old.id(),
                new_session = session.id(),
                "replacing session"
            );
            old.close(CloseReason::Replaced);
            if tokio::time::timeout(self.replace_wait, old.wait_finished())
                .await
                .is_err()
            {
                warn!(agent_id = %old.agent_id(), "replaced session did not finish in time");
            }
        }
        previous
    }

    /// Remove `session` if it is still the agent's current one. Returns
    /// `false` when it has already been replaced.
    pub fn detach(&self, session: &AgentSession) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get(session.agent_id()) {
            Some(current) if current.id() == session.id() => {
                sessions.remove(session.agent_id());
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<AgentSession>> {
        self.sessions
            .read()
            .get(agent_id)
            .filter(|s| !s.is_closed())
            .cloned()
    }

    /// Open sessions of one pool.
    pub fn for_pool(&self, pool_id: &str) -> Vec<Arc<AgentSession>> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.pool_id() == pool_id && !s.is_closed())
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<Arc<AgentSession>> {
        self.sessions.read().values().cloned().collect()
    }

    pub fn agent_ids(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Close every session, e.g. on shutdown.
    pub fn close_all(&self) {
        for session in self.sessions.read().values() {
            session.close(CloseReason::Shutdown);
        }
    }
}
