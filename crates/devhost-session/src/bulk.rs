//! Concurrent per-device operations
//!
//! One tokio task per device; a failure or panic in one task never cancels
//! or hides the others.

use std::collections::HashMap;
use std::future::Future;

use tokio::task::{JoinError, JoinSet};

use devhost_core::prelude::*;
use devhost_core::BulkOperationResult;

/// Run each `(device_id, job)` on its own task and collect one result per
/// device. Results come back in completion order.
pub async fn run_concurrently<I, Fut>(jobs: I) -> Vec<BulkOperationResult>
where
    I: IntoIterator<Item = (String, Fut)>,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let mut set = JoinSet::new();
    let mut device_ids = HashMap::new();

    for (device_id, job) in jobs {
        let handle = set.spawn(job);
        device_ids.insert(handle.id(), device_id);
    }

    let mut results = Vec::with_capacity(device_ids.len());
    while let Some(joined) = set.join_next_with_id().await {
        let (task_id, outcome) = match joined {
            Ok((task_id, outcome)) => (task_id, outcome.map_err(|e| e.to_string())),
            Err(e) => (e.id(), Err(describe_join_error(&e))),
        };

        let device_id = device_ids
            .remove(&task_id)
            .unwrap_or_else(|| format!("task {task_id}"));

        results.push(match outcome {
            Ok(()) => BulkOperationResult::success(device_id),
            Err(message) => {
                error!("{}: {}", device_id, message);
                BulkOperationResult::failure(device_id, message)
            }
        });
    }

    results
}

fn describe_join_error(e: &JoinError) -> String {
    if e.is_panic() {
        format!("task panicked: {e}")
    } else {
        format!("task cancelled: {e}")
    }
}
