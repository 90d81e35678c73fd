//! Periodic expiry of lapsed lock leases.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use flotilla_store::LockRepo;

/// Expire lapsed leases every `interval` until `cancel` fires. A failed
/// sweep is logged and retried on the next tick.
pub async fn run_lock_sweeper(locks: Arc<LockRepo>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so startup is not a sweep.
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => match locks.sweep_expired() {
                Ok(0) => {}
                Ok(expired) => info!(expired, "expired lock leases swept"),
                Err(e) => warn!(error = %e, "lock sweep failed"),
            },
        }
    }
    debug!("lock sweeper stopped");
}
