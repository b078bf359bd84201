//! `corral workspace` subcommands, including drift-check settings.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::NaiveTime;
use sqlx::PgPool;

use corral_core::CoordinatorConfig;
use corral_core::drift::{DriftGuards, DriftOutcome, DriftScheduler};
use corral_core::queue::TaskQueue;
use corral_db::models::Workspace;
use corral_db::queries::workspaces::{self as workspace_db, DriftSettings};
use corral_db::queries::pools as pool_db;

use crate::WorkspaceCommands;

pub async fn run_workspace_command(
    command: WorkspaceCommands,
    pool: &PgPool,
    config: &CoordinatorConfig,
) -> Result<()> {
    match command {
        WorkspaceCommands::Add {
            workspace_id,
            pool: pool_id,
            name,
        } => {
            let ws = add_workspace(pool, &workspace_id, &pool_id, name.as_deref()).await?;
            println!("Workspace {} added to pool {pool_id}.", ws.workspace_id);
            Ok(())
        }
        WorkspaceCommands::List => cmd_list(pool).await,
        WorkspaceCommands::Drift {
            workspace_id,
            enable,
            disable,
            interval,
            window_start,
            window_end,
            clear_window,
            continue_on_success,
            continue_on_failure,
        } => {
            let change = DriftChange {
                enabled: if enable {
                    Some(true)
                } else if disable {
                    Some(false)
                } else {
                    None
                },
                interval,
                window: match (window_start, window_end) {
                    (Some(start), Some(end)) => {
                        Some(Some((parse_time_of_day(&start)?, parse_time_of_day(&end)?)))
                    }
                    _ if clear_window => Some(None),
                    _ => None,
                },
                continue_on_success,
                continue_on_failure,
            };
            let settings = update_drift(pool, &workspace_id, &change).await?;
            print_settings(&workspace_id, &settings);
            Ok(())
        }
        WorkspaceCommands::DriftNow { workspace_id } => {
            let queue = Arc::new(TaskQueue::new(pool.clone(), config.claim_lease));
            let drift = DriftScheduler::new(
                pool.clone(),
                queue,
                Arc::new(DriftGuards::default()),
                config.drift_tick,
            );
            match drift.trigger_now(&workspace_id).await? {
                DriftOutcome::Started(task) => {
                    println!("Drift check queued as task {} in pool {}.", task.id, task.pool_id);
                }
                DriftOutcome::Skipped(reason) => {
                    println!("Drift check not started: {reason}.");
                }
            }
            Ok(())
        }
    }
}

async fn add_workspace(
    pool: &PgPool,
    workspace_id: &str,
    pool_id: &str,
    name: Option<&str>,
) -> Result<Workspace> {
    pool_db::get_pool(pool, pool_id)
        .await?
        .with_context(|| format!("pool {pool_id} not found"))?;
    if workspace_db::get_workspace(pool, workspace_id).await?.is_some() {
        bail!("workspace {workspace_id} already exists");
    }
    workspace_db::insert_workspace(pool, workspace_id, name.unwrap_or(workspace_id), Some(pool_id))
        .await
}

async fn cmd_list(pool: &PgPool) -> Result<()> {
    let workspaces = workspace_db::list_workspaces(pool).await?;
    if workspaces.is_empty() {
        println!("No workspaces found. Use `corral workspace add` to create one.");
        return Ok(());
    }

    let id_w = workspaces.iter().map(|w| w.workspace_id.len()).max().unwrap_or(2).max(2);
    println!("{:<id_w$}  {:<12}  {:<6}  {:<10}  LAST CHECK", "ID", "POOL", "DRIFT", "STATUS");
    for w in &workspaces {
        let drift = if w.drift_enabled {
            format!("{}m", w.drift_interval_minutes)
        } else {
            "off".to_string()
        };
        println!(
            "{:<id_w$}  {:<12}  {:<6}  {:<10}  {}",
            w.workspace_id,
            w.pool_id.as_deref().unwrap_or("-"),
            drift,
            w.drift_status.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string()),
            w.last_drift_at
                .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
                .unwrap_or_else(|| "never".to_string()),
        );
    }
    Ok(())
}

/// A partial update of a workspace's drift settings. `None` keeps the
/// stored value; `window: Some(None)` clears the window.
#[derive(Debug, Default)]
struct DriftChange {
    enabled: Option<bool>,
    interval: Option<i32>,
    window: Option<Option<(NaiveTime, NaiveTime)>>,
    continue_on_success: Option<bool>,
    continue_on_failure: Option<bool>,
}

impl DriftChange {
    fn apply(&self, ws: &Workspace) -> DriftSettings {
        let (window_start, window_end) = match self.window {
            Some(Some((start, end))) => (Some(start), Some(end)),
            Some(None) => (None, None),
            None => (ws.drift_window_start, ws.drift_window_end),
        };
        DriftSettings {
            enabled: self.enabled.unwrap_or(ws.drift_enabled),
            interval_minutes: self.interval.unwrap_or(ws.drift_interval_minutes),
            window_start,
            window_end,
            continue_on_success: self.continue_on_success.unwrap_or(ws.continue_on_success),
            continue_on_failure: self.continue_on_failure.unwrap_or(ws.continue_on_failure),
        }
    }
}

async fn update_drift(pool: &PgPool, workspace_id: &str, change: &DriftChange) -> Result<DriftSettings> {
    if matches!(change.interval, Some(n) if n <= 0) {
        bail!("drift interval must be a positive number of minutes");
    }
    let ws = workspace_db::get_workspace(pool, workspace_id)
        .await?
        .with_context(|| format!("workspace {workspace_id} not found"))?;
    let settings = change.apply(&ws);
    workspace_db::update_drift_settings(pool, workspace_id, &settings).await?;
    Ok(settings)
}

fn parse_time_of_day(raw: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .with_context(|| format!("invalid time of day {raw:?}; expected HH:MM"))
}

fn print_settings(workspace_id: &str, s: &DriftSettings) {
    println!("Drift settings for {workspace_id}:");
    println!("  enabled:             {}", s.enabled);
    println!("  interval:            {} minutes", s.interval_minutes);
    match (s.window_start, s.window_end) {
        (Some(start), Some(end)) => {
            println!("  window (UTC):        {} - {}", start.format("%H:%M"), end.format("%H:%M"));
        }
        _ => println!("  window (UTC):        any time"),
    }
    println!("  continue_on_success: {}", s.continue_on_success);
    println!("  continue_on_failure: {}", s.continue_on_failure);
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_test_utils::{create_test_db, drop_test_db, seed_pool_and_workspace};

    #[test]
    fn parses_times_of_day() {
        assert_eq!(
            parse_time_of_day("02:30").unwrap(),
            NaiveTime::from_hms_opt(2, 30, 0).unwrap()
        );
        assert_eq!(
            parse_time_of_day("23:59:59").unwrap(),
            NaiveTime::from_hms_opt(23, 59, 59).unwrap()
        );
        assert!(parse_time_of_day("25:00").is_err());
        assert!(parse_time_of_day("noon").is_err());
    }

    #[tokio::test]
    async fn add_requires_an_existing_pool() {
        let (pool, db_name) = create_test_db().await;
        seed_pool_and_workspace(&pool, "p1", "ws1").await;

        let ws = add_workspace(&pool, "ws2", "p1", Some("Second")).await.unwrap();
        assert_eq!(ws.name, "Second");
        assert_eq!(ws.pool_id.as_deref(), Some("p1"));
        assert!(add_workspace(&pool, "ws3", "missing", None).await.is_err());
        assert!(add_workspace(&pool, "ws1", "p1", None).await.is_err());

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn drift_update_keeps_unspecified_values() {
        let (pool, db_name) = create_test_db().await;
        seed_pool_and_workspace(&pool, "p1", "ws1").await;

        let first = DriftChange {
            enabled: Some(true),
            interval: Some(60),
            window: Some(Some((
                NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(4, 0, 0).unwrap(),
            ))),
            continue_on_failure: Some(false),
            ..DriftChange::default()
        };
        update_drift(&pool, "ws1", &first).await.unwrap();

        let second = DriftChange {
            interval: Some(30),
            ..DriftChange::default()
        };
        let settings = update_drift(&pool, "ws1", &second).await.unwrap();
        assert!(settings.enabled);
        assert_eq!(settings.interval_minutes, 30);
        assert_eq!(settings.window_start, NaiveTime::from_hms_opt(22, 0, 0));
        assert!(settings.continue_on_success);
        assert!(!settings.continue_on_failure);

        let cleared = DriftChange {
            window: Some(None),
            ..DriftChange::default()
        };
        let settings = update_drift(&pool, "ws1", &cleared).await.unwrap();
        assert!(settings.window_start.is_none() && settings.window_end.is_none());

        let ws = workspace_db::get_workspace(&pool, "ws1").await.unwrap().unwrap();
        assert_eq!(ws.drift_interval_minutes, 30);
        assert!(ws.drift_window_start.is_none());

        let bad = DriftChange {
            interval: Some(0),
            ..DriftChange::default()
        };
        assert!(update_drift(&pool, "ws1", &bad).await.is_err());
        assert!(update_drift(&pool, "nope", &second).await.is_err());

        pool.close().await;
        drop_test_db(&db_name).await;
    }
}
