// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Retry Timer
//!
//! Schedules a single delayed retry of a failed connect attempt.

use std::{
    sync::{Mutex, MutexGuard},
    time::Duration,
};
use tokio::{runtime::Handle, task::AbortHandle};
use tracing::{debug, error};

/// One-shot action run when a retry timer elapses.
pub type RetryAction = Box<dyn FnOnce() + Send + 'static>;

/// Schedules delayed retries.
#[cfg_attr(test, mockall::automock)]
pub trait RetryTimer: Send + Sync {
    /// Runs `action` once after `interval()` has elapsed.
    fn retry(&self, action: RetryAction);

    /// Delay applied before each retry.
    fn interval(&self) -> Duration;

    /// Cancels every retry that has not fired yet.
    fn cancel(&self);
}

/// Retry timer backed by the tokio runtime.
pub struct ConnectionRetryTimer {
    interval: Duration,
    pending: Mutex<Vec<AbortHandle>>,
}

impl ConnectionRetryTimer {
    pub fn new(interval: Duration) -> Self {
        ConnectionRetryTimer {
            interval,
            pending: Mutex::new(vec![]),
        }
    }

    fn pending(&self) -> MutexGuard<'_, Vec<AbortHandle>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RetryTimer for ConnectionRetryTimer {
    fn retry(&self, action: RetryAction) {
        let Ok(runtime) = Handle::try_current() else {
            error!("cannot schedule a retry outside of a tokio runtime");
            return;
        };

        let interval = self.interval;
        let task = runtime.spawn(async move {
            tokio::time::sleep(interval).await;
            debug!("retry timer elapsed");
            action();
        });

        let mut pending = self.pending();
        pending.retain(|handle| !handle.is_finished());
        pending.push(task.abort_handle());
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn cancel(&self) {
        for handle in self.pending().drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    #[tokio::test(start_paused = true)]
    async fn should_retry_given_action_after_the_interval() {
        let timer = ConnectionRetryTimer::new(Duration::from_secs(1));
        let fired = Arc::new(AtomicBool::new(false));

        let flag = fired.clone();
        timer.retry(Box::new(move || flag.store(true, Ordering::SeqCst)));

        tokio::time::sleep(Duration::from_millis(900)).await;
        assert!(!fired.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn should_not_fire_after_cancel() {
        let timer = ConnectionRetryTimer::new(Duration::from_secs(1));
        let fired = Arc::new(AtomicBool::new(false));

        let flag = fired.clone();
        timer.retry(Box::new(move || flag.store(true, Ordering::SeqCst)));
        timer.cancel();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
