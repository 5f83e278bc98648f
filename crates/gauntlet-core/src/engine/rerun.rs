//! Rerun accept/reject entry points.
//!
//! A rerun that reached a terminal status can be accepted (promoted to the
//! new benchmark: its observed results replace the test case's canonical
//! step definitions, and sibling reruns are archived as outdated) or
//! rejected (archived with no promotion). The store performs each flow in
//! one transaction so the precondition checks are atomic with the writes.

use crate::storage::{Store, StoreError};
use tracing::info;

/// Promote a terminal rerun to the new benchmark for its test case.
pub fn accept(store: &Store, run_id: i64) -> Result<(), StoreError> {
    store.accept_rerun(run_id)?;
    info!(run = run_id, "rerun accepted as new benchmark");
    Ok(())
}

/// Archive a terminal rerun without touching the canonical steps.
pub fn reject(store: &Store, run_id: i64) -> Result<(), StoreError> {
    store.reject_rerun(run_id)?;
    info!(run = run_id, "rerun rejected");
    Ok(())
}
