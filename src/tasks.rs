//! The database's background tasks: expiry sweeping, every-second log
//! syncing, and the auto-shrink watcher. Each takes the appropriate
//! database lock for a bounded amount of work per run and backs off
//! silently once the database closes.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::config::SyncPolicy;
use crate::db::{self, Core};
use crate::error::Result;
use crate::scheduler::BackgroundTask;

fn write_core(core: &RwLock<Core>) -> std::sync::RwLockWriteGuard<'_, Core> {
    core.write().unwrap_or_else(|e| e.into_inner())
}

/// Removes expired items in bounded batches and logs synthetic deletes so
/// durable state reflects the expiry.
pub(crate) struct SweepTask {
    core: Arc<RwLock<Core>>,
    interval: Duration,
}

impl SweepTask {
    pub fn new(core: Arc<RwLock<Core>>, interval: Duration) -> Self {
        Self { core, interval }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for SweepTask {
    fn name(&self) -> &'static str {
        "expiry-sweep"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self) -> Result<()> {
        db::sweep_expired(&self.core).map(|_| ())
    }
}

/// Fsyncs the log at a coarse interval when the policy is `EverySecond`.
pub(crate) struct SyncTask {
    core: Arc<RwLock<Core>>,
    interval: Duration,
}

impl SyncTask {
    pub fn new(core: Arc<RwLock<Core>>, interval: Duration) -> Self {
        Self { core, interval }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for SyncTask {
    fn name(&self) -> &'static str {
        "log-sync"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self) -> Result<()> {
        let mut core = write_core(&self.core);
        if core.closed || core.config.sync_policy != SyncPolicy::EverySecond {
            return Ok(());
        }
        if let Some(aof) = &mut core.persist {
            aof.sync()?;
        }
        Ok(())
    }
}

/// Triggers a shrink once the log outgrows the configured thresholds.
pub(crate) struct ShrinkTask {
    core: Arc<RwLock<Core>>,
    interval: Duration,
}

impl ShrinkTask {
    pub fn new(core: Arc<RwLock<Core>>, interval: Duration) -> Self {
        Self { core, interval }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for ShrinkTask {
    fn name(&self) -> &'static str {
        "auto-shrink"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self) -> Result<()> {
        let due = {
            let core = self.core.read().unwrap_or_else(|e| e.into_inner());
            if core.closed {
                return Ok(());
            }
            match &core.persist {
                Some(aof) => {
                    db::should_shrink(aof.disk_size(), core.last_shrink_size, &core.config)
                }
                None => false,
            }
        };
        if due {
            db::shrink_core(&self.core)?;
        }
        Ok(())
    }
}
