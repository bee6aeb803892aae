//! Fixed-interval background tasks that never overlap

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Background task running a cycle at a fixed interval.
///
/// The first cycle runs immediately. Each cycle is awaited before the next
/// tick, and ticks missed while a cycle runs are skipped, so cycles never
/// overlap.
#[derive(Debug)]
pub struct MonitorTask {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl MonitorTask {
    pub fn spawn<F, Fut>(period: Duration, cycle: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        Self::start(Instant::now(), period, cycle)
    }

    /// Like [`MonitorTask::spawn`], but the first cycle waits one period
    pub fn spawn_delayed<F, Fut>(period: Duration, cycle: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        Self::start(Instant::now() + period, period, cycle)
    }

    fn start<F, Fut>(first: Instant, period: Duration, mut cycle: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(first, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                // An in-flight cycle always completes; cancellation is only
                // observed between cycles.
                cycle().await;
            }
            debug!("Monitor task exited");
        });

        Self {
            cancel,
            handle: Some(handle),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Cancel and wait for any in-flight cycle to finish
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!("Monitor task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for MonitorTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
