//! Background task that fails runs left in `processing` by a crash.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::SweeperConfig;
use crate::error::StoreError;
use crate::schema::StatusUpdate;
use crate::store::ComparisonStore;

pub const TIMEOUT_REASON: &str = "processing timed out";

/// Fail every comparison that entered `processing` more than `stale_after`
/// ago. Returns how many were failed.
pub async fn fail_stale_runs(
    store: &dyn ComparisonStore,
    stale_after: Duration,
) -> Result<usize, StoreError> {
    let max_age = chrono::Duration::from_std(stale_after)
        .map_err(|e| StoreError::Backend(format!("invalid stale threshold: {}", e)))?;
    let cutoff = Utc::now() - max_age;

    let mut failed = 0;
    for comparison in store.list_stale_processing(cutoff).await? {
        let update = StatusUpdate::Failed {
            error: TIMEOUT_REASON.to_string(),
        };
        match store.set_status(&comparison.id, update).await {
            Ok(()) => {
                warn!("Comparison {} stuck in processing, marked failed", comparison.id);
                failed += 1;
            }
            // Finished between the listing and the write.
            Err(StoreError::InvalidTransition { .. }) | Err(StoreError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(failed)
}

pub fn spawn(store: Arc<dyn ComparisonStore>, config: SweeperConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.interval);
        loop {
            ticker.tick().await;
            match fail_stale_runs(store.as_ref(), config.stale_after).await {
                Ok(0) => debug!("Sweep found no stale runs"),
                Ok(n) => warn!("Sweep failed {} stale runs", n),
                Err(e) => warn!("Sweep failed: {}", e),
            }
        }
    })
}
