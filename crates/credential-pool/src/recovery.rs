//! Background recovery of leaked leases
//!
//! A lease is released exactly once by its guard, but a panic inside the
//! release path or an aborted task can still leave a row `in_flight`. This
//! task periodically resets rows that have been in flight for longer than
//! the store's staleness window, the same rule `CredentialStore::load`
//! applies after a crash.

use std::sync::Arc;
use std::time::Duration;

use credential_store::now_millis;
use tracing::{debug, warn};

use crate::pool::Pool;

/// Spawn the periodic stale-lease sweep.
///
/// The staleness window must exceed the longest time a request holds its
/// credential, otherwise a live request loses it to another caller. The
/// recovered lease can no longer settle the row once it is claimed again.
pub fn spawn_recovery_task(pool: Arc<Pool>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick, load() just ran the same sweep
        ticker.tick().await;

        loop {
            ticker.tick().await;
            recovery_cycle(&pool);
        }
    })
}

fn recovery_cycle(pool: &Pool) {
    match pool.recover_stale(now_millis()) {
        Ok(0) => debug!("no stale in-flight credentials"),
        Ok(recovered) => warn!(recovered, "reset credentials stuck in flight"),
        Err(e) => warn!(error = %e, "stale credential sweep failed, will retry next cycle"),
    }
}
