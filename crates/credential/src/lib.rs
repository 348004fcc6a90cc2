//! Credential data model and durable runtime state.
//!
//! An [`Auth`] is one upstream credential (API key, OAuth token bundle, or
//! session token) together with its runtime health: cooldown horizons, quota
//! blocks, per-model state, and the last classified error. This crate owns
//! the pieces that must agree with the on-disk credential files: the error
//! classifier, the refresh merge rules, the `_runtime_state` metadata codec,
//! and the JSON file store.

pub mod auth;
pub mod classify;
pub mod merge;
pub mod model;
pub mod runtime_state;
pub mod store;

pub use auth::{
    update_aggregated_availability, Auth, Error, ErrorKind, ModelState, QuotaState, Status,
    DISABLED_BY_POLICY_PREFIX,
};
pub use classify::{classify, classify_at, Classification};
pub use merge::merge_runtime_failure_state;
pub use model::canonical_model;
pub use store::{AuthStore, FileAuthStore, StoreError, StoreResult};
