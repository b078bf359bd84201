//! Integration tests for leader recovery of in-flight tasks.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

use corral_core::CoordinatorConfig;
use corral_core::dispatcher::{Dispatcher, DispatcherConfig};
use corral_core::drift::DriftGuards;
use corral_core::hub::{HubConfig, OutputHub};
use corral_core::protocol::Heartbeat;
use corral_core::queue::TaskQueue;
use corral_core::recovery::recover;
use corral_core::session::{AgentSession, SessionConfig, SessionManager};
use corral_db::models::{Task, TaskStatus, TaskType};
use corral_db::queries::tasks as task_db;
use corral_test_utils::{create_test_db, drop_test_db, seed_pool_and_workspace};

struct Parts {
    sessions: Arc<SessionManager>,
    queue: Arc<TaskQueue>,
    guards: Arc<DriftGuards>,
    dispatcher: Arc<Dispatcher>,
}

fn parts(pool: &PgPool) -> Parts {
    let config = CoordinatorConfig::default();
    let sessions = Arc::new(SessionManager::new(Duration::from_millis(100)));
    let queue = Arc::new(TaskQueue::new(pool.clone(), config.claim_lease));
    let guards = Arc::new(DriftGuards::default());
    let hub = Arc::new(OutputHub::new(HubConfig::from(&config)));
    let dispatcher = Arc::new(Dispatcher::new(
        pool.clone(),
        Arc::clone(&queue),
        Arc::clone(&sessions),
        hub,
        Arc::clone(&guards),
        DispatcherConfig::from(&config),
    ));
    Parts {
        sessions,
        queue,
        guards,
        dispatcher,
    }
}

async fn in_flight(pool: &PgPool, agent_id: &str, running: bool) -> Task {
    let task = task_db::insert_task(pool, "ws1", "p1", TaskType::Plan, false).await.unwrap();
    task_db::mark_dispatched(pool, task.id, agent_id).await.unwrap();
    if running {
        task_db::mark_running(pool, task.id, agent_id).await.unwrap();
    }
    task_db::get_task(pool, task.id).await.unwrap().unwrap()
}

fn heartbeat(current: Vec<i64>) -> Heartbeat {
    Heartbeat {
        plan_running: 1,
        plan_limit: 3,
        apply_running: false,
        current_tasks: current,
        cpu_usage: 0.0,
        mem_usage: 0.0,
        status: "ok".to_string(),
        timestamp: None,
    }
}

#[tokio::test]
async fn orphans_are_requeued_without_counting_a_retry() {
    let (pool, db_name) = create_test_db().await;
    seed_pool_and_workspace(&pool, "p1", "ws1").await;
    let p = parts(&pool);
    let dispatched = in_flight(&pool, "agent-gone", false).await;
    let running = in_flight(&pool, "agent-gone", true).await;
    let queued = task_db::insert_task(&pool, "ws1", "p1", TaskType::Plan, false).await.unwrap();

    let report = recover(&pool, &p.sessions, &p.dispatcher, &p.queue, &p.guards, Duration::from_secs(30))
        .await
        .unwrap();

    assert_eq!(report.requeued, vec![dispatched.id, running.id]);
    assert!(report.adopted.is_empty());
    assert_eq!(report.tracked, 3);
    for id in [dispatched.id, running.id] {
        let row = task_db::get_task(&pool, id).await.unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Queued);
        assert_eq!(row.retry_count, 0);
        assert!(row.assigned_agent.is_none());
    }
    assert!(p.queue.is_tracked(queued.id));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn tasks_on_live_sessions_are_adopted_or_requeued() {
    let (pool, db_name) = create_test_db().await;
    seed_pool_and_workspace(&pool, "p1", "ws1").await;
    let p = parts(&pool);

    let reported = in_flight(&pool, "agent-live", true).await;
    let forgotten = in_flight(&pool, "agent-live", false).await;
    let unverified = in_flight(&pool, "agent-quiet", false).await;

    let (live, _live_driver) = AgentSession::open("agent-live", "p1", &SessionConfig::default());
    live.apply_heartbeat(&heartbeat(vec![reported.id]), tokio::time::Instant::now());
    p.sessions.attach(Arc::clone(&live)).await;
    let (quiet, _quiet_driver) = AgentSession::open("agent-quiet", "p1", &SessionConfig::default());
    p.sessions.attach(quiet).await;

    let report = recover(&pool, &p.sessions, &p.dispatcher, &p.queue, &p.guards, Duration::from_secs(30))
        .await
        .unwrap();

    assert_eq!(report.adopted, vec![reported.id, unverified.id]);
    assert_eq!(report.requeued, vec![forgotten.id]);
    assert!(p.dispatcher.is_in_flight(reported.id));
    assert!(p.dispatcher.is_in_flight(unverified.id));

    // An adopted task finishes through the normal terminal path.
    assert!(p.dispatcher.complete("agent-live", reported.id));
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let row = task_db::get_task(&pool, reported.id).await.unwrap().unwrap();
        if row.status == TaskStatus::Succeeded {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "adopted task never finished");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // A second recovery leaves tasks already tracked alone.
    let again = recover(&pool, &p.sessions, &p.dispatcher, &p.queue, &p.guards, Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(again.kept, vec![unverified.id]);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn drift_guards_are_rebuilt_from_open_drift_tasks() {
    let (pool, db_name) = create_test_db().await;
    seed_pool_and_workspace(&pool, "p1", "ws1").await;
    corral_db::queries::workspaces::insert_workspace(&pool, "ws2", "ws2", Some("p1"))
        .await
        .unwrap();
    let drift = task_db::insert_task(&pool, "ws1", "p1", TaskType::Plan, true).await.unwrap();
    task_db::insert_task(&pool, "ws2", "p1", TaskType::Plan, false).await.unwrap();
    let p = parts(&pool);

    let report = recover(&pool, &p.sessions, &p.dispatcher, &p.queue, &p.guards, Duration::from_secs(30))
        .await
        .unwrap();

    assert_eq!(report.drift_guards, 1);
    assert_eq!(p.guards.held_task("ws1"), Some(drift.id));
    assert!(!p.guards.is_held("ws2"));

    pool.close().await;
    drop_test_db(&db_name).await;
}
