//! Database query functions for the `leases` table, which backs leader
//! election.

use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::Lease;

/// Acquire the named lease for `holder`, or extend it if `holder` already
/// owns it. Succeeds only when the lease is free, expired or ours.
///
/// Returns `true` when `holder` owns the lease after the call.
pub async fn acquire_or_renew(
    pool: &PgPool,
    name: &str,
    holder: &str,
    duration: Duration,
) -> Result<bool> {
    let row: Option<(String,)> = sqlx::query_as(
        "INSERT INTO leases (name, holder, expires_at, acquired_at) \
         VALUES ($1, $2, NOW() + make_interval(secs => $3), NOW()) \
         ON CONFLICT (name) DO UPDATE \
         SET holder = EXCLUDED.holder, \
             expires_at = EXCLUDED.expires_at, \
             acquired_at = CASE WHEN leases.holder = EXCLUDED.holder \
                                THEN leases.acquired_at ELSE NOW() END \
         WHERE leases.holder = EXCLUDED.holder OR leases.expires_at < NOW() \
         RETURNING holder",
    )
    .bind(name)
    .bind(holder)
    .bind(duration.as_secs_f64())
    .fetch_optional(pool)
    .await
    .with_context(|| format!("failed to acquire lease {name}"))?;

    Ok(row.is_some())
}

/// Give the lease up so another holder can take it without waiting for
/// expiry. A no-op when `holder` does not own it.
pub async fn release(pool: &PgPool, name: &str, holder: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM leases WHERE name = $1 AND holder = $2")
        .bind(name)
        .bind(holder)
        .execute(pool)
        .await
        .with_context(|| format!("failed to release lease {name}"))?;

    Ok(result.rows_affected())
}

/// Fetch the current lease row, if any.
pub async fn get_lease(pool: &PgPool, name: &str) -> Result<Option<Lease>> {
    let lease = sqlx::query_as::<_, Lease>("SELECT * FROM leases WHERE name = $1")
        .bind(name)
        .fetch_optional(pool)
        .await
        .context("failed to fetch lease")?;

    Ok(lease)
}
