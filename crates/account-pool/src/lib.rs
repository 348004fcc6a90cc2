//! Credential pool control plane.
//!
//! The auth manager owns every [`credential::Auth`], drives upstreams through
//! registered executors, and keeps runtime health durable: selection policy
//! with session affinity, cooldown arithmetic from classified failures,
//! fatal-disable policy, egress drift tracking, drill-fault injection, and a
//! background refresh coordinator.

pub mod config;
pub mod cooldown;
pub mod drill;
pub mod egress;
pub mod manager;
pub mod refresh;
pub mod selector;
pub mod snapshot;

pub use config::{EgressConfig, ManagerConfig, RetryConfig, StreamingConfig};
pub use drill::{SCENARIO_ACCOUNT_QUOTA_EXHAUSTED, SCENARIO_PROXY_FAILURE};
pub use egress::{EgressMappingEntry, EgressMappingSnapshot, EgressMappingSnapshotRecord};
pub use manager::{ExecutionResult, Manager, ManagerBuilder};
pub use refresh::spawn_refresh_task;
pub use selector::{FillFirstSelector, RoundRobinSelector, Selector, SessionAffinity};
pub use snapshot::{AuthSnapshot, ModelStateSnapshot};
