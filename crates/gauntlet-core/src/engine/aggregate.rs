//! Batch status aggregation.
//!
//! The batch status is a pure function of its member run statuses; the
//! cached column is never the source of truth. Recomputation is idempotent
//! and safe to call redundantly from racing run completions: last writer
//! wins on a field that is always reconstructable.

use crate::model::{BatchStatus, RunStatus};
use crate::storage::{Store, StoreError};
use tracing::debug;

/// `running` if any member is running; else `success` if no member is
/// pending or running; else `pending`. Archival statuses (`benchmark`,
/// `outdated`) are terminal and never hold a batch back.
pub fn aggregate(statuses: &[RunStatus]) -> BatchStatus {
    if statuses.iter().any(|s| *s == RunStatus::Running) {
        BatchStatus::Running
    } else if statuses.iter().any(|s| *s == RunStatus::Pending) {
        BatchStatus::Pending
    } else {
        BatchStatus::Success
    }
}

/// Recompute and persist the batch status from current member statuses.
pub fn recompute_batch(store: &Store, batch_id: i64) -> Result<BatchStatus, StoreError> {
    let statuses = store.batch_member_statuses(batch_id)?;
    let status = aggregate(&statuses);
    store.set_batch_status(batch_id, status)?;
    debug!(
        batch = batch_id,
        members = statuses.len(),
        status = status.as_str(),
        "batch status recomputed"
    );
    Ok(status)
}
