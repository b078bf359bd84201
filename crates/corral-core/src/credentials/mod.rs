//! Best-effort `refresh_credentials` fan-out to a pool's sessions.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::protocol::{CoordinatorFrame, CredentialsAck, WireTime};
use crate::session::SessionManager;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    pub sent: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AckStats {
    pub acks: u64,
    pub last_agent_id: Option<String>,
    pub last_ack_at: Option<DateTime<Utc>>,
}

pub struct CredentialsBroadcaster {
    sessions: Arc<SessionManager>,
    acks: Mutex<HashMap<String, AckStats>>,
}

impl CredentialsBroadcaster {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self {
            sessions,
            acks: Mutex::new(HashMap::new()),
        }
    }

    /// Send `refresh_credentials` to every session of `pool_id`. A full
    /// write queue skips that session; nothing is retried.
    pub fn broadcast(&self, pool_id: &str) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let frame = CoordinatorFrame::refresh_credentials(pool_id);
        for session in self.sessions.for_pool(pool_id) {
            match session.try_enqueue(frame.clone()) {
                Ok(()) => report.sent += 1,
                Err(e) => {
                    warn!(pool_id, agent_id = %session.agent_id(), error = %e, "refresh_credentials not sent");
                    report.skipped += 1;
                }
            }
        }
        info!(pool_id, sent = report.sent, skipped = report.skipped, "credentials refresh broadcast");
        report
    }

    /// Count an acknowledgement from `agent_id`, a member of `pool_id`.
    pub fn record_ack(&self, agent_id: &str, pool_id: &str, ack: &CredentialsAck) {
        let at = ack.timestamp.and_then(WireTime::to_utc).unwrap_or_else(Utc::now);
        let mut acks = self.acks.lock();
        let stats = acks.entry(pool_id.to_string()).or_default();
        stats.acks += 1;
        stats.last_agent_id = Some(agent_id.to_string());
        stats.last_ack_at = Some(at);
        debug!(agent_id, pool_id, count = ack.count, total = stats.acks, "credentials refreshed");
    }

    pub fn acks(&self, pool_id: &str) -> AckStats {
        self.acks.lock().get(pool_id).cloned().unwrap_or_default()
    }
}
