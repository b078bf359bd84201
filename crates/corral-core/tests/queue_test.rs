//! Integration tests for the per-pool task queue.

use std::time::Duration;

use tokio::time::Instant;

use corral_core::queue::TaskQueue;
use corral_db::models::{TaskStatus, TaskType};
use corral_db::queries::tasks as task_db;
use corral_test_utils::{create_test_db, drop_test_db, seed_pool_and_workspace};

#[tokio::test]
async fn submit_resolves_the_workspace_pool() {
    let (pool, db_name) = create_test_db().await;
    seed_pool_and_workspace(&pool, "p1", "ws1").await;
    let queue = TaskQueue::new(pool.clone(), Duration::from_secs(30));

    let task = queue.submit("ws1", TaskType::PlanAndApply, false).await.unwrap();
    assert_eq!(task.pool_id, "p1");
    assert_eq!(task.status, TaskStatus::Queued);
    assert!(queue.is_tracked(task.id));

    assert!(queue.submit("missing", TaskType::Plan, false).await.is_err());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn enqueue_is_idempotent() {
    let (pool, db_name) = create_test_db().await;
    seed_pool_and_workspace(&pool, "p1", "ws1").await;
    let queue = TaskQueue::new(pool.clone(), Duration::from_secs(30));

    let task = queue.submit("ws1", TaskType::Plan, false).await.unwrap();
    assert!(!queue.enqueue(&task), "already tracked");
    assert_eq!(queue.tracked_len(), 1);

    queue.mark_terminal(task.id);
    assert!(queue.enqueue(&task));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn claim_hides_the_head_until_released() {
    let (pool, db_name) = create_test_db().await;
    seed_pool_and_workspace(&pool, "p1", "ws1").await;
    let queue = TaskQueue::new(pool.clone(), Duration::from_secs(30));
    let first = queue.submit("ws1", TaskType::Plan, false).await.unwrap();
    let second = queue.submit("ws1", TaskType::Plan, false).await.unwrap();

    assert_eq!(queue.peek("p1").await.unwrap().unwrap().id, first.id);
    let claimed = queue.claim("p1").await.unwrap().unwrap();
    assert_eq!(claimed.id, first.id);
    assert!(queue.is_claimed(first.id));
    assert_eq!(queue.peek("p1").await.unwrap().unwrap().id, second.id);

    assert!(queue.release(first.id));
    assert!(!queue.release(first.id));
    assert_eq!(queue.peek("p1").await.unwrap().unwrap().id, first.id);

    // Another pool's queue is independent.
    assert!(queue.peek("p2").await.unwrap().is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn confirm_dispatches_and_rejects_canceled_rows() {
    let (pool, db_name) = create_test_db().await;
    seed_pool_and_workspace(&pool, "p1", "ws1").await;
    let queue = TaskQueue::new(pool.clone(), Duration::from_secs(30));
    let a = queue.submit("ws1", TaskType::Plan, false).await.unwrap();
    let b = queue.submit("ws1", TaskType::Plan, false).await.unwrap();

    queue.claim("p1").await.unwrap().unwrap();
    assert!(queue.confirm(a.id, "agent-x").await.unwrap());
    let row = task_db::get_task(&pool, a.id).await.unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Dispatched);
    assert_eq!(row.assigned_agent.as_deref(), Some("agent-x"));
    assert!(!queue.is_claimed(a.id));

    queue.claim("p1").await.unwrap().unwrap();
    corral_core::state::dispatch::cancel_queued_task(&pool, b.id).await.unwrap();
    assert!(!queue.confirm(b.id, "agent-x").await.unwrap());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn expired_claims_become_peekable_again() {
    let (pool, db_name) = create_test_db().await;
    seed_pool_and_workspace(&pool, "p1", "ws1").await;
    let queue = TaskQueue::new(pool.clone(), Duration::from_millis(50));
    let task = queue.submit("ws1", TaskType::Plan, false).await.unwrap();

    queue.claim("p1").await.unwrap().unwrap();
    assert!(queue.sweep_expired_claims(Instant::now()).is_empty());
    assert!(queue.peek("p1").await.unwrap().is_none());

    let expired = queue.sweep_expired_claims(Instant::now() + Duration::from_millis(100));
    assert_eq!(expired, vec![task.id]);
    assert_eq!(queue.peek("p1").await.unwrap().unwrap().id, task.id);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn requeue_counts_retries_and_wakes_the_pool() {
    let (pool, db_name) = create_test_db().await;
    seed_pool_and_workspace(&pool, "p1", "ws1").await;
    let queue = TaskQueue::new(pool.clone(), Duration::from_secs(30));
    let task = queue.submit("ws1", TaskType::Plan, false).await.unwrap();
    queue.claim("p1").await.unwrap();
    queue.confirm(task.id, "agent-x").await.unwrap();

    let waker = queue.waker("p1");
    assert!(queue.requeue(&task, true).await.unwrap());
    tokio::time::timeout(Duration::from_secs(1), waker.notified())
        .await
        .expect("pool woken by requeue");

    let row = task_db::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Queued);
    assert_eq!(row.retry_count, 1);
    assert!(row.assigned_agent.is_none());

    // Not in flight any more.
    assert!(!queue.requeue(&task, true).await.unwrap());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn rebuild_reloads_non_terminal_tasks() {
    let (pool, db_name) = create_test_db().await;
    seed_pool_and_workspace(&pool, "p1", "ws1").await;
    let a = task_db::insert_task(&pool, "ws1", "p1", TaskType::Plan, false).await.unwrap();
    let b = task_db::insert_task(&pool, "ws1", "p1", TaskType::Plan, false).await.unwrap();
    corral_core::state::dispatch::cancel_queued_task(&pool, b.id).await.unwrap();

    let queue = TaskQueue::new(pool.clone(), Duration::from_secs(30));
    assert_eq!(queue.rebuild().await.unwrap(), 1);
    assert!(queue.is_tracked(a.id));
    assert!(!queue.is_tracked(b.id));

    pool.close().await;
    drop_test_db(&db_name).await;
}
