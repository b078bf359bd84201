//! Two-dimensional slot model: a pool of plan slots and a single apply slot
//! per agent, with a coordinator-side reservation overlay on top of the
//! agent's own report.

use std::collections::HashMap;

use serde::Serialize;

use corral_db::models::TaskType;

use crate::TaskId;
use crate::protocol::Heartbeat;

/// Capacity as last reported by the agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapacitySnapshot {
    pub plan_running: u32,
    pub plan_limit: u32,
    pub apply_running: bool,
    pub current_tasks: Vec<TaskId>,
    pub cpu_usage: f64,
    pub mem_usage: f64,
    pub status: String,
}

impl CapacitySnapshot {
    /// The snapshot assumed before an agent's first heartbeat.
    pub fn initial(plan_limit: u32) -> Self {
        Self {
            plan_running: 0,
            plan_limit,
            apply_running: false,
            current_tasks: Vec::new(),
            cpu_usage: 0.0,
            mem_usage: 0.0,
            status: String::new(),
        }
    }

    pub fn from_heartbeat(hb: &Heartbeat) -> Self {
        Self {
            plan_running: hb.plan_running,
            plan_limit: hb.plan_limit,
            apply_running: hb.apply_running,
            current_tasks: hb.current_tasks.clone(),
            cpu_usage: hb.cpu_usage,
            mem_usage: hb.mem_usage,
            status: hb.status.clone(),
        }
    }
}

/// Slots the coordinator has promised between dispatch and the heartbeat
/// that acknowledges it.
#[derive(Debug, Clone, Default)]
pub struct Reservations {
    by_task: HashMap<TaskId, TaskType>,
}

impl Reservations {
    pub fn plan_reserved(&self) -> u32 {
        let n = self.by_task.values().filter(|t| **t == TaskType::Plan).count();
        u32::try_from(n).unwrap_or(u32::MAX)
    }

    pub fn apply_reserved(&self) -> bool {
        self.by_task.values().any(|t| *t == TaskType::PlanAndApply)
    }

    pub fn len(&self) -> usize {
        self.by_task.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_task.is_empty()
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.by_task.contains_key(&task_id)
    }

    pub fn task_ids(&self) -> Vec<TaskId> {
        self.by_task.keys().copied().collect()
    }

    pub(crate) fn insert(&mut self, task_id: TaskId, task_type: TaskType) {
        self.by_task.insert(task_id, task_type);
    }

    pub(crate) fn remove(&mut self, task_id: TaskId) -> bool {
        self.by_task.remove(&task_id).is_some()
    }
}

/// Whether an agent in this state can take one more task of `task_type`.
///
/// `plan_and_apply` only consults the apply slot: a busy plan pool never
/// blocks it, a busy apply slot always does.
pub fn can_accept(snapshot: &CapacitySnapshot, reservations: &Reservations, task_type: TaskType) -> bool {
    match task_type {
        TaskType::Plan => {
            snapshot.plan_running.saturating_add(reservations.plan_reserved()) < snapshot.plan_limit
        }
        TaskType::PlanAndApply => !snapshot.apply_running && !reservations.apply_reserved(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(plan_running: u32, plan_limit: u32, apply_running: bool) -> CapacitySnapshot {
        CapacitySnapshot {
            plan_running,
            plan_limit,
            apply_running,
            ..CapacitySnapshot::initial(plan_limit)
        }
    }

    #[test]
    fn plan_slots_count_reservations() {
        let mut r = Reservations::default();
        assert!(can_accept(&snapshot(1, 3, false), &r, TaskType::Plan));
        r.insert(1, TaskType::Plan);
        assert!(can_accept(&snapshot(1, 3, false), &r, TaskType::Plan));
        r.insert(2, TaskType::Plan);
        assert!(!can_accept(&snapshot(1, 3, false), &r, TaskType::Plan));
        assert!(r.remove(2));
        assert!(can_accept(&snapshot(1, 3, false), &r, TaskType::Plan));
    }

    #[test]
    fn full_plan_pool_rejects_plan() {
        let r = Reservations::default();
        assert!(!can_accept(&snapshot(3, 3, false), &r, TaskType::Plan));
        assert!(!can_accept(&snapshot(0, 0, false), &r, TaskType::Plan));
    }

    #[test]
    fn apply_running_blocks_plan_and_apply_regardless_of_plan_slots() {
        let r = Reservations::default();
        assert!(!can_accept(&snapshot(0, 3, true), &r, TaskType::PlanAndApply));
        assert!(can_accept(&snapshot(0, 3, true), &r, TaskType::Plan));
    }

    #[test]
    fn apply_reservation_blocks_second_apply() {
        let mut r = Reservations::default();
        r.insert(10, TaskType::PlanAndApply);
        assert!(!can_accept(&snapshot(0, 3, false), &r, TaskType::PlanAndApply));
        assert!(can_accept(&snapshot(0, 3, false), &r, TaskType::Plan));
        assert_eq!(r.plan_reserved(), 0);
    }

    #[test]
    fn busy_plan_pool_does_not_block_apply() {
        let r = Reservations::default();
        assert!(can_accept(&snapshot(3, 3, false), &r, TaskType::PlanAndApply));
    }
}
