//! Coordinator timing and limit settings.

use std::time::Duration;

/// Every timing knob of the coordinator. [`Default`] carries the production
/// values; tests shrink them.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Capacity of each session's outbound write queue.
    pub write_queue_capacity: usize,
    /// How long an enqueue may wait on a full write queue.
    pub enqueue_timeout: Duration,
    /// A session is stale once its last heartbeat is strictly older than this.
    pub heartbeat_stale_after: Duration,
    /// Deadline for the first heartbeat after a session opens.
    pub first_heartbeat_timeout: Duration,
    /// How often the heartbeat monitor checks a session.
    pub heartbeat_check_interval: Duration,
    /// How long to wait for a replaced session to finish closing.
    pub replace_close_wait: Duration,

    /// Per-subscriber buffer of an output stream.
    pub subscriber_buffer: usize,
    /// Frames kept per output stream for late subscribers.
    pub stream_history: usize,
    /// How long a finished output stream stays readable.
    pub stream_retention: Duration,
    /// Janitor period for output streams.
    pub stream_janitor_interval: Duration,

    /// How long a queue claim lives before it is returned to the queue.
    pub claim_lease: Duration,
    /// Scheduler tick when nothing wakes it earlier.
    pub schedule_tick: Duration,
    /// How long a dispatch may go unacknowledged before its reservation is
    /// released.
    pub dispatch_ack_timeout: Duration,
    /// Hard ceiling on a single task run.
    pub max_task_duration: Duration,
    /// How long after `cancel_task` the agent has to report a terminal frame.
    pub cancel_grace: Duration,
    /// Agent-caused re-queues allowed before a task fails.
    pub retry_limit: i32,
    /// Plan slots assumed for a session until its first heartbeat.
    pub default_plan_limit: u32,

    /// Drift scheduler period.
    pub drift_tick: Duration,
    /// Agents without a session and without a heartbeat for this long are
    /// marked offline by the sweeper.
    pub offline_after: Duration,
    /// Offline sweeper period.
    pub offline_sweep_interval: Duration,

    /// Leader lease name. `None` runs as the sole leader without a lease.
    pub lease_name: Option<String>,
    /// Lease validity written on every acquire or renew.
    pub lease_duration: Duration,
    /// Leadership is abandoned when renewal has failed for this long.
    pub renew_deadline: Duration,
    /// Delay between acquire or renew attempts.
    pub lease_retry_period: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            write_queue_capacity: 10,
            enqueue_timeout: Duration::from_secs(5),
            heartbeat_stale_after: Duration::from_secs(30),
            first_heartbeat_timeout: Duration::from_secs(15),
            heartbeat_check_interval: Duration::from_secs(5),
            replace_close_wait: Duration::from_secs(2),

            subscriber_buffer: 256,
            stream_history: 1000,
            stream_retention: Duration::from_secs(5 * 60),
            stream_janitor_interval: Duration::from_secs(30),

            claim_lease: Duration::from_secs(30),
            schedule_tick: Duration::from_secs(10),
            dispatch_ack_timeout: Duration::from_secs(2 * 60),
            max_task_duration: Duration::from_secs(60 * 60),
            cancel_grace: Duration::from_secs(60),
            retry_limit: 3,
            default_plan_limit: 3,

            drift_tick: Duration::from_secs(60),
            offline_after: Duration::from_secs(2 * 60),
            offline_sweep_interval: Duration::from_secs(2 * 60),

            lease_name: None,
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            lease_retry_period: Duration::from_secs(2),
        }
    }
}

impl CoordinatorConfig {
    /// Apply `CORRAL_RETRY_LIMIT` and `CORRAL_LEASE_NAME` when set.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(raw) = std::env::var("CORRAL_RETRY_LIMIT") {
            match raw.parse::<i32>() {
                Ok(n) if n >= 0 => self.retry_limit = n,
                _ => tracing::warn!(value = %raw, "ignoring invalid CORRAL_RETRY_LIMIT"),
            }
        }
        if let Ok(name) = std::env::var("CORRAL_LEASE_NAME") {
            if !name.trim().is_empty() {
                self.lease_name = Some(name.trim().to_string());
            }
        }
        self
    }
}
