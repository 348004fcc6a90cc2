//! Refresh merge rules.
//!
//! Token rotation returns a "clean" auth shape from the provider. Before it
//! replaces the stored entry, any still-active cooldown or policy-disable on
//! the stored entry must carry over; a refresh must never resurrect a
//! recently frozen account.

use chrono::{DateTime, Utc};

use crate::auth::{update_aggregated_availability, Auth, ModelState, Status};

/// Carry active cooldown/disabled runtime fields from `src` into `dst`.
pub fn merge_runtime_failure_state(dst: &mut Auth, src: &Auth, now: DateTime<Utc>) {
    // Fatal/disabled state always wins.
    if src.disabled || src.status == Status::Disabled {
        dst.disabled = true;
        dst.status = Status::Disabled;
        dst.unavailable = true;
        dst.next_retry_after = None;
        dst.quota = src.quota.clone();
        if !src.status_message.trim().is_empty() {
            dst.status_message = src.status_message.clone();
        }
        dst.last_error = src.last_error.clone();
        dst.model_states = src.model_states.clone();
        return;
    }

    // Carry auth-level cooldown/blocked state only while still active.
    if src.unavailable && src.next_retry_after.map(|at| at > now).unwrap_or(false) {
        dst.unavailable = true;
        dst.next_retry_after = src.next_retry_after;
        dst.quota = src.quota.clone();
        if dst.status != Status::Disabled {
            dst.status = Status::Error;
        }
        if !src.status_message.trim().is_empty() {
            dst.status_message = src.status_message.clone();
        }
        dst.last_error = src.last_error.clone();
    }

    // Carry per-model blocked states that are still active.
    for (model, state) in &src.model_states {
        if should_carry_model_state(state, now) {
            dst.model_states.insert(model.clone(), state.clone());
        }
    }
    update_aggregated_availability(dst, now);
}

fn should_carry_model_state(state: &ModelState, now: DateTime<Utc>) -> bool {
    if state.status == Status::Disabled {
        return true;
    }
    if state.unavailable {
        match state.next_retry_after {
            None => return true,
            Some(at) if at > now => return true,
            _ => {}
        }
    }
    if state.quota.exceeded {
        match state.quota.next_recover_at {
            None => return true,
            Some(at) if at > now => return true,
            _ => {}
        }
    }
    false
}
