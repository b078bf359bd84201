//! Agent registry: identity, registration and liveness bookkeeping.
//!
//! The registry is the only component that checks bearer credentials.
//! Everything downstream treats an agent id handed over by the registry as
//! authentic.

use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distr::Alphanumeric;
use serde::Serialize;
use sqlx::PgPool;
use tracing::{info, warn};

use corral_db::models::{Agent, AgentStatus};
use corral_db::queries::{agents as agent_db, pools as pool_db};

use crate::error::CoordinatorError;
use crate::token::{TokenConfig, hash_bearer, validate_pool_token};

const MAX_NAME_LEN: usize = 128;

/// Result of a successful registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Registration {
    pub agent_id: String,
    pub pool_id: String,
}

pub struct AgentRegistry {
    pool: PgPool,
    tokens: TokenConfig,
}

impl AgentRegistry {
    pub fn new(pool: PgPool, tokens: TokenConfig) -> Self {
        Self { pool, tokens }
    }

    /// Register an agent. Repeating the call with the same name and bearer
    /// returns the same agent id.
    pub async fn register(&self, name: &str, bearer: &str) -> Result<Registration, CoordinatorError> {
        let name = name.trim();
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(CoordinatorError::AuthFailed(format!(
                "agent name must be 1..={MAX_NAME_LEN} characters"
            )));
        }

        let claims = validate_pool_token(&self.tokens, bearer)
            .map_err(|e| CoordinatorError::AuthFailed(e.to_string()))?;

        if pool_db::get_pool(&self.pool, &claims.pool_id).await?.is_none() {
            return Err(CoordinatorError::AuthFailed(format!(
                "pool {} does not exist",
                claims.pool_id
            )));
        }

        let agent = agent_db::upsert_agent(
            &self.pool,
            &generate_agent_id(),
            name,
            &claims.pool_id,
            &hash_bearer(bearer),
        )
        .await?;

        info!(agent_id = %agent.agent_id, pool_id = %agent.pool_id, name, "agent registered");
        Ok(Registration {
            agent_id: agent.agent_id,
            pool_id: agent.pool_id,
        })
    }

    /// Check a connecting agent's bearer against its registration.
    pub async fn authenticate(&self, agent_id: &str, bearer: &str) -> Result<Agent, CoordinatorError> {
        let claims = validate_pool_token(&self.tokens, bearer)
            .map_err(|e| CoordinatorError::AuthFailed(e.to_string()))?;

        let agent = agent_db::get_agent(&self.pool, agent_id)
            .await?
            .ok_or_else(|| CoordinatorError::AuthFailed(format!("unknown agent {agent_id}")))?;

        if agent.token_hash != hash_bearer(bearer) || agent.pool_id != claims.pool_id {
            warn!(agent_id, "bearer does not match registration");
            return Err(CoordinatorError::AuthFailed(format!(
                "credentials do not match agent {agent_id}"
            )));
        }
        Ok(agent)
    }

    /// Record a heartbeat time. Older times never overwrite newer ones.
    pub async fn mark_seen(&self, agent_id: &str, at: DateTime<Utc>) -> anyhow::Result<()> {
        agent_db::mark_seen(&self.pool, agent_id, at).await?;
        Ok(())
    }

    pub async fn set_status(&self, agent_id: &str, status: AgentStatus) -> anyhow::Result<()> {
        agent_db::set_agent_status(&self.pool, agent_id, status)
            .await
            .with_context(|| format!("failed to mark agent {agent_id} {status}"))?;
        Ok(())
    }

    pub async fn get(&self, agent_id: &str) -> anyhow::Result<Option<Agent>> {
        agent_db::get_agent(&self.pool, agent_id).await
    }

    pub async fn list(&self) -> anyhow::Result<Vec<Agent>> {
        agent_db::list_agents(&self.pool).await
    }

    /// Mark `online` agents without a live session here and without a
    /// heartbeat within `stale_after` as `offline`.
    pub async fn sweep_offline(&self, live: &[String], stale_after: Duration) -> anyhow::Result<Vec<String>> {
        let stale_after = chrono::Duration::from_std(stale_after).context("stale threshold out of range")?;
        let swept = agent_db::mark_stale_offline(&self.pool, Utc::now() - stale_after, live).await?;
        for agent_id in &swept {
            info!(agent_id = %agent_id, "agent marked offline");
        }
        Ok(swept)
    }
}

/// `agent-` followed by 16 lowercase alphanumerics.
pub fn generate_agent_id() -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!("agent-{suffix}")
}
