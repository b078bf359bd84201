//! Leader gate: only the holder of a named lease schedules.
//!
//! A [`LeaderElector`] keeps trying to acquire the lease, renews it while
//! held, and hands each leadership epoch a [`CancellationToken`] that is
//! cancelled when the lease is lost.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use rand::distr::Alphanumeric;
use sqlx::PgPool;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use corral_db::queries::leases;

use crate::config::CoordinatorConfig;
use crate::error::CoordinatorError;

/// Storage for the leader lease.
#[async_trait]
pub trait LeaseBackend: Send + Sync {
    /// Acquire or renew. `true` when `holder` owns the lease afterwards.
    async fn try_acquire(&self, name: &str, holder: &str, duration: Duration) -> Result<bool>;

    async fn release(&self, name: &str, holder: &str) -> Result<()>;
}

/// Lease stored as a row in the `leases` table.
pub struct PgLease {
    pool: PgPool,
}

impl PgLease {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LeaseBackend for PgLease {
    async fn try_acquire(&self, name: &str, holder: &str, duration: Duration) -> Result<bool> {
        leases::acquire_or_renew(&self.pool, name, holder, duration).await
    }

    async fn release(&self, name: &str, holder: &str) -> Result<()> {
        leases::release(&self.pool, name, holder).await?;
        Ok(())
    }
}

/// Single-process fallback: always holds the lease.
pub struct AlwaysLeader;

#[async_trait]
impl LeaseBackend for AlwaysLeader {
    async fn try_acquire(&self, _name: &str, _holder: &str, _duration: Duration) -> Result<bool> {
        Ok(true)
    }

    async fn release(&self, _name: &str, _holder: &str) -> Result<()> {
        Ok(())
    }
}

/// Shared view of whether this process currently leads.
#[derive(Debug, Clone, Default)]
pub struct Leadership(Arc<AtomicBool>);

impl Leadership {
    pub fn is_leader(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn set(&self, leading: bool) {
        self.0.store(leading, Ordering::Release);
    }
}

#[async_trait]
pub trait LeaderCallbacks: Send + Sync {
    /// Leadership gained. `epoch` is cancelled when it is lost. Must not
    /// block for the length of the epoch.
    async fn on_started_leading(&self, epoch: CancellationToken);

    async fn on_stopped_leading(&self);
}

#[derive(Debug, Clone)]
pub struct ElectionConfig {
    pub lease_name: String,
    pub holder: String,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

impl ElectionConfig {
    pub fn from_coordinator(config: &CoordinatorConfig, holder: String) -> Self {
        Self {
            lease_name: config
                .lease_name
                .clone()
                .unwrap_or_else(|| "corral-leader".to_string()),
            holder,
            lease_duration: config.lease_duration,
            renew_deadline: config.renew_deadline,
            retry_period: config.lease_retry_period,
        }
    }
}

/// Identity of this process in the election: `POD_NAME`, else the host
/// name, else a random id.
pub fn holder_identity() -> String {
    if let Ok(name) = std::env::var("POD_NAME") {
        if !name.is_empty() {
            return name;
        }
    }
    if let Some(host) = hostname::get().ok().and_then(|h| h.into_string().ok()) {
        return host;
    }
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("corral-{}", suffix.to_lowercase())
}

pub struct LeaderElector {
    backend: Arc<dyn LeaseBackend>,
    config: ElectionConfig,
    leadership: Leadership,
}

impl LeaderElector {
    pub fn new(backend: Arc<dyn LeaseBackend>, config: ElectionConfig, leadership: Leadership) -> Self {
        Self {
            backend,
            config,
            leadership,
        }
    }

    pub fn leadership(&self) -> &Leadership {
        &self.leadership
    }

    /// Campaign until `cancel` fires. Lost leadership sends the elector
    /// back to campaigning.
    pub async fn run(&self, callbacks: Arc<dyn LeaderCallbacks>, cancel: CancellationToken) {
        let name = &self.config.lease_name;
        let holder = &self.config.holder;
        info!(lease = %name, holder = %holder, "joining leader election");

        while self.acquire(&cancel).await {
            self.leadership.set(true);
            let epoch = cancel.child_token();
            info!(lease = %name, holder = %holder, "started leading");
            callbacks.on_started_leading(epoch.clone()).await;

            self.hold(&cancel).await;

            epoch.cancel();
            self.leadership.set(false);
            callbacks.on_stopped_leading().await;

            if cancel.is_cancelled() {
                if let Err(e) = self.backend.release(name, holder).await {
                    warn!(lease = %name, error = %e, "failed to release lease");
                }
                break;
            }
            warn!(lease = %name, holder = %holder, error = %CoordinatorError::LeaderLost, "stopped leading");
        }
        info!(lease = %name, "left leader election");
    }

    /// Retry until the lease is ours. `false` when cancelled first.
    async fn acquire(&self, cancel: &CancellationToken) -> bool {
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            match self.try_acquire().await {
                Ok(true) => return true,
                Ok(false) => debug!(lease = %self.config.lease_name, "lease held elsewhere"),
                Err(e) => warn!(lease = %self.config.lease_name, error = %e, "lease acquire failed"),
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }
        }
    }

    /// Renew every retry period. Returns when the lease is taken by another
    /// holder, when renewals keep failing past the renew deadline, or on
    /// cancel.
    async fn hold(&self, cancel: &CancellationToken) {
        let mut renewed_at = Instant::now();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }
            match self.try_acquire().await {
                Ok(true) => renewed_at = Instant::now(),
                Ok(false) => {
                    warn!(lease = %self.config.lease_name, "lease taken by another holder");
                    return;
                }
                Err(e) => {
                    warn!(lease = %self.config.lease_name, error = %e, "lease renewal failed");
                    if renewed_at.elapsed() > self.config.renew_deadline {
                        return;
                    }
                }
            }
        }
    }

    async fn try_acquire(&self) -> Result<bool> {
        self.backend
            .try_acquire(&self.config.lease_name, &self.config.holder, self.config.lease_duration)
            .await
    }
}
