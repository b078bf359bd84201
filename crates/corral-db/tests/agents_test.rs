//! Integration tests for agent and pool queries.

use chrono::{Duration, Utc};

use corral_db::models::{AgentStatus, PoolType};
use corral_db::queries::{agents, pools};
use corral_test_utils::{create_test_db, drop_test_db};

#[tokio::test]
async fn upsert_is_idempotent_on_name_and_token() {
    let (pool, db_name) = create_test_db().await;
    pools::insert_pool(&pool, "p1", "pool one", PoolType::Static, 0)
        .await
        .unwrap();

    let first = agents::upsert_agent(&pool, "agent-aaaaaaaaaaaaaaaa", "runner", "p1", "h1")
        .await
        .unwrap();
    let second = agents::upsert_agent(&pool, "agent-bbbbbbbbbbbbbbbb", "runner", "p1", "h1")
        .await
        .unwrap();
    assert_eq!(first.agent_id, second.agent_id);
    assert_eq!(second.agent_id, "agent-aaaaaaaaaaaaaaaa");

    // A different bearer is a different agent.
    let third = agents::upsert_agent(&pool, "agent-cccccccccccccccc", "runner", "p1", "h2")
        .await
        .unwrap();
    assert_eq!(third.agent_id, "agent-cccccccccccccccc");
    assert_eq!(agents::list_agents(&pool).await.unwrap().len(), 2);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn mark_seen_is_monotonic() {
    let (pool, db_name) = create_test_db().await;
    pools::insert_pool(&pool, "p1", "pool one", PoolType::Static, 0)
        .await
        .unwrap();
    agents::upsert_agent(&pool, "agent-aaaaaaaaaaaaaaaa", "runner", "p1", "h1")
        .await
        .unwrap();

    let newer = Utc::now();
    let older = newer - Duration::seconds(30);
    agents::mark_seen(&pool, "agent-aaaaaaaaaaaaaaaa", newer)
        .await
        .unwrap();
    agents::mark_seen(&pool, "agent-aaaaaaaaaaaaaaaa", older)
        .await
        .unwrap();

    let agent = agents::get_agent(&pool, "agent-aaaaaaaaaaaaaaaa")
        .await
        .unwrap()
        .unwrap();
    let seen = agent.last_seen.expect("last_seen set");
    assert!((seen - newer).num_milliseconds().abs() < 1);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn stale_online_agents_go_offline_unless_live() {
    let (pool, db_name) = create_test_db().await;
    pools::insert_pool(&pool, "p1", "pool one", PoolType::K8s, 2)
        .await
        .unwrap();
    for (id, name) in [("agent-aaaaaaaaaaaaaaaa", "a"), ("agent-bbbbbbbbbbbbbbbb", "b")] {
        agents::upsert_agent(&pool, id, name, "p1", "h").await.unwrap();
        agents::set_agent_status(&pool, id, AgentStatus::Online)
            .await
            .unwrap();
        agents::mark_seen(&pool, id, Utc::now() - Duration::minutes(10))
            .await
            .unwrap();
    }
    assert_eq!(agents::count_online_in_pool(&pool, "p1").await.unwrap(), 2);

    let live = vec!["agent-bbbbbbbbbbbbbbbb".to_string()];
    let changed = agents::mark_stale_offline(&pool, Utc::now() - Duration::minutes(2), &live)
        .await
        .unwrap();
    assert_eq!(changed, vec!["agent-aaaaaaaaaaaaaaaa".to_string()]);
    assert_eq!(agents::count_online_in_pool(&pool, "p1").await.unwrap(), 1);

    assert_eq!(
        agents::delete_agent(&pool, "agent-aaaaaaaaaaaaaaaa")
            .await
            .unwrap(),
        1
    );

    pool.close().await;
    drop_test_db(&db_name).await;
}
