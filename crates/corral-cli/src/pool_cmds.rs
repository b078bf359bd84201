//! `corral pool` subcommands.

use anyhow::{Context, Result, bail};
use sqlx::PgPool;

use corral_core::token::{TokenConfig, generate_pool_token};
use corral_db::models::{AgentPool, PoolType};
use corral_db::queries::{agents as agent_db, pools as pool_db};

use crate::PoolCommands;

pub async fn run_pool_command(
    command: PoolCommands,
    pool: &PgPool,
    tokens: &TokenConfig,
) -> Result<()> {
    match command {
        PoolCommands::Create {
            pool_id,
            name,
            pool_type,
            desired,
        } => {
            let created = create_pool(pool, &pool_id, name.as_deref(), &pool_type, desired).await?;
            println!("Pool {} created ({}).", created.pool_id, created.pool_type);
            println!("Next: run `corral pool token {}` to issue an agent token.", created.pool_id);
            Ok(())
        }
        PoolCommands::List => cmd_list(pool).await,
        PoolCommands::Token { pool_id } => {
            let token = issue_token(pool, tokens, &pool_id).await?;
            println!("{token}");
            Ok(())
        }
        PoolCommands::Scale { pool_id, desired } => {
            scale_pool(pool, &pool_id, desired).await?;
            println!("Pool {pool_id} desired count set to {desired}.");
            Ok(())
        }
    }
}

async fn create_pool(
    pool: &PgPool,
    pool_id: &str,
    name: Option<&str>,
    pool_type: &str,
    desired: i32,
) -> Result<AgentPool> {
    if pool_id.is_empty() || pool_id.contains(char::is_whitespace) {
        bail!("pool ID must be non-empty and contain no whitespace: {pool_id:?}");
    }
    if desired < 0 {
        bail!("desired count must not be negative");
    }
    let pool_type: PoolType = pool_type.parse()?;
    if pool_db::get_pool(pool, pool_id).await?.is_some() {
        bail!("pool {pool_id} already exists");
    }
    pool_db::insert_pool(pool, pool_id, name.unwrap_or(pool_id), pool_type, desired).await
}

async fn scale_pool(pool: &PgPool, pool_id: &str, desired: i32) -> Result<()> {
    if desired < 0 {
        bail!("desired count must not be negative");
    }
    if pool_db::set_desired_count(pool, pool_id, desired).await? == 0 {
        bail!("pool {pool_id} not found");
    }
    Ok(())
}

/// Issue the bearer token for an existing pool.
async fn issue_token(pool: &PgPool, tokens: &TokenConfig, pool_id: &str) -> Result<String> {
    pool_db::get_pool(pool, pool_id)
        .await?
        .with_context(|| format!("pool {pool_id} not found"))?;
    Ok(generate_pool_token(tokens, pool_id))
}

async fn cmd_list(pool: &PgPool) -> Result<()> {
    let pools = pool_db::list_pools(pool).await?;
    if pools.is_empty() {
        println!("No pools found. Use `corral pool create` to add one.");
        return Ok(());
    }

    let id_w = pools.iter().map(|p| p.pool_id.len()).max().unwrap_or(2).max(2);
    let name_w = pools.iter().map(|p| p.name.len()).max().unwrap_or(4).max(4);
    println!(
        "{:<id_w$}  {:<name_w$}  {:<6}  {:>7}  {:>6}",
        "ID", "NAME", "TYPE", "DESIRED", "ONLINE"
    );
    for p in &pools {
        let online = agent_db::count_online_in_pool(pool, &p.pool_id).await?;
        println!(
            "{:<id_w$}  {:<name_w$}  {:<6}  {:>7}  {:>6}",
            p.pool_id,
            p.name,
            p.pool_type.to_string(),
            p.desired_count,
            online
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_core::token::validate_pool_token;
    use corral_test_utils::{create_test_db, drop_test_db};

    #[tokio::test]
    async fn create_rejects_duplicates_and_bad_input() {
        let (pool, db_name) = create_test_db().await;

        let created = create_pool(&pool, "builders", None, "k8s", 2).await.unwrap();
        assert_eq!(created.name, "builders");
        assert_eq!(created.pool_type, PoolType::K8s);
        assert_eq!(created.desired_count, 2);

        let dup = create_pool(&pool, "builders", Some("again"), "static", 0).await;
        assert!(dup.unwrap_err().to_string().contains("already exists"));
        assert!(create_pool(&pool, "p 1", None, "static", 0).await.is_err());
        assert!(create_pool(&pool, "p2", None, "vm", 0).await.is_err());
        assert!(create_pool(&pool, "p3", None, "static", -1).await.is_err());

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn scale_updates_desired_count() {
        let (pool, db_name) = create_test_db().await;

        create_pool(&pool, "p1", None, "k8s", 1).await.unwrap();
        scale_pool(&pool, "p1", 4).await.unwrap();
        let stored = pool_db::get_pool(&pool, "p1").await.unwrap().unwrap();
        assert_eq!(stored.desired_count, 4);

        assert!(scale_pool(&pool, "p1", -2).await.is_err());
        assert!(scale_pool(&pool, "nope", 1).await.is_err());

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn token_is_issued_only_for_known_pools() {
        let (pool, db_name) = create_test_db().await;
        let tokens = TokenConfig::new(b"cli-test-secret".to_vec());

        create_pool(&pool, "p1", None, "static", 0).await.unwrap();
        let token = issue_token(&pool, &tokens, "p1").await.unwrap();
        assert_eq!(validate_pool_token(&tokens, &token).unwrap().pool_id, "p1");

        let missing = issue_token(&pool, &tokens, "nope").await;
        assert!(missing.unwrap_err().to_string().contains("not found"));

        pool.close().await;
        drop_test_db(&db_name).await;
    }
}
