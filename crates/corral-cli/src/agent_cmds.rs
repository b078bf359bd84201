//! `corral agent` subcommands.

use anyhow::{Result, bail};
use sqlx::PgPool;

use corral_db::queries::agents as agent_db;

use crate::AgentCommands;

pub async fn run_agent_command(command: AgentCommands, pool: &PgPool) -> Result<()> {
    match command {
        AgentCommands::List => cmd_list(pool).await,
        AgentCommands::Remove { agent_id } => {
            remove_agent(pool, &agent_id).await?;
            println!("Agent {agent_id} removed.");
            Ok(())
        }
    }
}

async fn cmd_list(pool: &PgPool) -> Result<()> {
    let agents = agent_db::list_agents(pool).await?;
    if agents.is_empty() {
        println!("No agents registered.");
        return Ok(());
    }

    let id_w = agents.iter().map(|a| a.agent_id.len()).max().unwrap_or(2).max(2);
    let name_w = agents.iter().map(|a| a.name.len()).max().unwrap_or(4).max(4);
    let pool_w = agents.iter().map(|a| a.pool_id.len()).max().unwrap_or(4).max(4);
    println!(
        "{:<id_w$}  {:<name_w$}  {:<pool_w$}  {:<7}  LAST SEEN",
        "ID", "NAME", "POOL", "STATUS"
    );
    for a in &agents {
        let last_seen = a
            .last_seen
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{:<id_w$}  {:<name_w$}  {:<pool_w$}  {:<7}  {}",
            a.agent_id,
            a.name,
            a.pool_id,
            a.status.to_string(),
            last_seen
        );
    }
    Ok(())
}

async fn remove_agent(pool: &PgPool, agent_id: &str) -> Result<()> {
    if agent_db::delete_agent(pool, agent_id).await? == 0 {
        bail!("agent {agent_id} not found");
    }
    Ok(())
}
