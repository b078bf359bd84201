pub mod agents;
pub mod leases;
pub mod pools;
pub mod tasks;
pub mod workspaces;
