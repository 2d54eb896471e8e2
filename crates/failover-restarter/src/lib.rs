//! failover-restarter: rolling-restarts workloads after a Redis Sentinel failover

pub mod config;
pub mod control;
pub mod health;
pub mod leader;
pub mod resource;
pub mod restart;
pub mod selector;
pub mod sentinel;
pub mod workload;

pub use config::{DynamicSelector, RestartSpec, RestarterConfig};
pub use control::{ControlLoop, PollEvent, PrimaryState};
pub use resource::{ResourceKind, ResourceRef, RestartOutcome, RestartStatus};
