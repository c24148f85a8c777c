//! Job execution primitives: exclusive lock scope and wall-clock budget

use ledgerline_cache::keys::lock_key;
use ledgerline_core::{models::LockHolder, traits::LockStore, AppError, AppResult};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Wall-clock budget of one job invocation
///
/// Checked between units of work only: an exhausted budget stops new
/// chunks from starting but never interrupts one in flight.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionBudget {
    started: Instant,
    limit: Duration,
}

impl ExecutionBudget {
    pub fn start(limit: Duration) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn exhausted(&self) -> bool {
        self.elapsed() >= self.limit
    }
}

/// Run `work` while holding the job lock `job`
///
/// Fails with `LockContention` when another live holder has the lock. The
/// lock is released whatever `work` returns; a failed release is logged
/// and left to the TTL.
pub async fn with_lock<T, F, Fut>(
    locks: &dyn LockStore,
    job: &str,
    ttl: Duration,
    force: bool,
    work: F,
) -> AppResult<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let key = lock_key(job);
    let holder = LockHolder::for_command(job);

    if !locks.acquire(&key, ttl, &holder, force).await? {
        let owner = locks
            .holder(&key)
            .await
            .ok()
            .flatten()
            .map(|h| format!("pid {} on {} since {}", h.pid, h.host, h.started_at))
            .unwrap_or_else(|| "unknown holder".to_string());
        warn!("{} is already running ({})", job, owner);
        return Err(AppError::LockContention(format!("{}: {}", job, owner)));
    }

    info!("{} started (lock ttl {}s)", job, ttl.as_secs());
    let result = work().await;

    match locks.release(&key, &holder).await {
        Ok(true) => {}
        Ok(false) => warn!("{} lock expired before release", job),
        Err(e) => error!("Failed to release {} lock: {}", job, e),
    }

    result
}
