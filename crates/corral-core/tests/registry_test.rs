//! Integration tests for agent registration and authentication.

use std::time::Duration;

use chrono::Utc;

use corral_core::CoordinatorError;
use corral_core::registry::AgentRegistry;
use corral_core::token::{TokenConfig, generate_pool_token};
use corral_db::models::AgentStatus;
use corral_db::queries::agents as agent_db;
use corral_test_utils::{create_test_db, drop_test_db, seed_pool_and_workspace};

fn tokens() -> TokenConfig {
    TokenConfig::new(b"registry-test-secret".to_vec())
}

#[tokio::test]
async fn register_is_idempotent_per_name_and_bearer() {
    let (pool, db_name) = create_test_db().await;
    seed_pool_and_workspace(&pool, "p1", "ws1").await;
    let registry = AgentRegistry::new(pool.clone(), tokens());
    let bearer = generate_pool_token(&tokens(), "p1");

    let first = registry.register("worker-1", &bearer).await.unwrap();
    let again = registry.register("worker-1", &bearer).await.unwrap();
    let other = registry.register("worker-2", &bearer).await.unwrap();

    assert_eq!(first, again);
    assert_eq!(first.pool_id, "p1");
    assert!(first.agent_id.starts_with("agent-"));
    assert_ne!(first.agent_id, other.agent_id);
    assert_eq!(registry.list().await.unwrap().len(), 2);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn register_rejects_bad_credentials_and_names() {
    let (pool, db_name) = create_test_db().await;
    seed_pool_and_workspace(&pool, "p1", "ws1").await;
    let registry = AgentRegistry::new(pool.clone(), tokens());

    let forged = generate_pool_token(&TokenConfig::new(b"other".to_vec()), "p1");
    let err = registry.register("w", &forged).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::AuthFailed(_)));

    let unknown_pool = generate_pool_token(&tokens(), "ghost");
    let err = registry.register("w", &unknown_pool).await.unwrap_err();
    assert!(err.to_string().contains("ghost"));

    let bearer = generate_pool_token(&tokens(), "p1");
    assert!(registry.register("", &bearer).await.is_err());
    assert!(registry.register(&"x".repeat(129), &bearer).await.is_err());
    assert!(registry.register(&"x".repeat(128), &bearer).await.is_ok());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn authenticate_requires_the_registered_bearer() {
    let (pool, db_name) = create_test_db().await;
    seed_pool_and_workspace(&pool, "p1", "ws1").await;
    seed_pool_and_workspace(&pool, "p2", "ws2").await;
    let registry = AgentRegistry::new(pool.clone(), tokens());
    let bearer = generate_pool_token(&tokens(), "p1");
    let reg = registry.register("worker", &bearer).await.unwrap();

    let agent = registry.authenticate(&reg.agent_id, &bearer).await.unwrap();
    assert_eq!(agent.pool_id, "p1");

    let other_pool = generate_pool_token(&tokens(), "p2");
    assert!(registry.authenticate(&reg.agent_id, &other_pool).await.is_err());
    assert!(registry.authenticate("agent-unknown", &bearer).await.is_err());
    assert!(registry.authenticate(&reg.agent_id, "corral_pt_p1_00").await.is_err());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn sweep_marks_silent_agents_offline_but_spares_live_sessions() {
    let (pool, db_name) = create_test_db().await;
    seed_pool_and_workspace(&pool, "p1", "ws1").await;
    let registry = AgentRegistry::new(pool.clone(), tokens());
    let bearer = generate_pool_token(&tokens(), "p1");
    let silent = registry.register("silent", &bearer).await.unwrap();
    let live = registry.register("live", &bearer).await.unwrap();
    let fresh = registry.register("fresh", &bearer).await.unwrap();

    for reg in [&silent, &live, &fresh] {
        registry.set_status(&reg.agent_id, AgentStatus::Online).await.unwrap();
    }
    let old = Utc::now() - chrono::Duration::minutes(10);
    registry.mark_seen(&silent.agent_id, old).await.unwrap();
    registry.mark_seen(&live.agent_id, old).await.unwrap();
    registry.mark_seen(&fresh.agent_id, Utc::now()).await.unwrap();

    let swept = registry
        .sweep_offline(&[live.agent_id.clone()], Duration::from_secs(120))
        .await
        .unwrap();
    assert_eq!(swept, vec![silent.agent_id.clone()]);

    let row = agent_db::get_agent(&pool, &silent.agent_id).await.unwrap().unwrap();
    assert_eq!(row.status, AgentStatus::Offline);
    assert_eq!(agent_db::count_online_in_pool(&pool, "p1").await.unwrap(), 2);

    pool.close().await;
    drop_test_db(&db_name).await;
}
