//! `corral task` subcommands.
//!
//! Submission writes the queued row directly; the leader's scheduler finds
//! it on its next scan of the pool.

use anyhow::{Context, Result};
use sqlx::PgPool;

use corral_core::CoordinatorConfig;
use corral_core::queue::TaskQueue;
use corral_db::models::{Task, TaskStatus, TaskType};
use corral_db::queries::tasks as task_db;

use crate::TaskCommands;

pub async fn run_task_command(
    command: TaskCommands,
    pool: &PgPool,
    config: &CoordinatorConfig,
) -> Result<()> {
    match command {
        TaskCommands::Submit {
            workspace_id,
            task_type,
        } => {
            let task_type: TaskType = task_type.parse()?;
            let queue = TaskQueue::new(pool.clone(), config.claim_lease);
            let task = queue.submit(&workspace_id, task_type, false).await?;
            println!(
                "Task {} queued ({} in pool {}).",
                task.id, task.task_type, task.pool_id
            );
            Ok(())
        }
        TaskCommands::List { status, limit } => {
            let status = status
                .as_deref()
                .map(str::parse::<TaskStatus>)
                .transpose()?;
            let tasks = task_db::list_tasks(pool, status, limit).await?;
            print_task_table(&tasks);
            Ok(())
        }
        TaskCommands::Show { task_id } => {
            let task = task_db::get_task(pool, task_id)
                .await?
                .with_context(|| format!("task {task_id} not found"))?;
            print_task(&task);
            Ok(())
        }
    }
}

fn print_task_table(tasks: &[Task]) {
    if tasks.is_empty() {
        println!("No tasks found.");
        return;
    }
    let ws_w = tasks.iter().map(|t| t.workspace_id.len()).max().unwrap_or(9).max(9);
    println!(
        "{:>8}  {:<ws_w$}  {:<14}  {:<10}  {:<22}  CREATED",
        "ID", "WORKSPACE", "TYPE", "STATUS", "AGENT"
    );
    for t in tasks {
        let kind = if t.is_drift_check {
            format!("{} (drift)", t.task_type)
        } else {
            t.task_type.to_string()
        };
        println!(
            "{:>8}  {:<ws_w$}  {:<14}  {:<10}  {:<22}  {}",
            t.id,
            t.workspace_id,
            kind,
            t.status.to_string(),
            t.assigned_agent.as_deref().unwrap_or("-"),
            t.created_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }
}

fn print_task(t: &Task) {
    println!("Task {}", t.id);
    println!("  workspace:  {}", t.workspace_id);
    println!("  pool:       {}", t.pool_id);
    println!("  type:       {} ({})", t.task_type, t.action);
    println!("  status:     {}", t.status);
    if let Some(agent) = &t.assigned_agent {
        println!("  agent:      {agent}");
    }
    if t.is_drift_check {
        println!("  drift check");
    }
    println!("  retries:    {}", t.retry_count);
    println!("  created:    {}", t.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    for (label, at) in [
        ("dispatched", t.dispatched_at),
        ("started", t.started_at),
        ("completed", t.completed_at),
    ] {
        if let Some(at) = at {
            println!("  {:<11} {}", format!("{label}:"), at.format("%Y-%m-%d %H:%M:%S UTC"));
        }
    }
    if let Some(err) = &t.error_message {
        println!("  error:      {err}");
    }
}
