//! Agent fleet coordination: registration, control sessions, capacity-aware
//! scheduling, dispatch, log fan-out, leader-gated recovery and drift checks.

pub mod capacity;
pub mod config;
pub mod coordinator;
pub mod credentials;
pub mod dispatcher;
pub mod drift;
pub mod error;
pub mod hub;
pub mod leader;
pub mod protocol;
pub mod queue;
pub mod recovery;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod state;
pub mod token;

pub use config::CoordinatorConfig;
pub use coordinator::Coordinator;
pub use error::CoordinatorError;

/// Task identifiers are the `tasks.id` column.
pub type TaskId = i64;
