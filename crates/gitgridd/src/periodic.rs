//! Fixed-interval background loops.
//!
//! Each tick runs in its own tokio task, so a panicking body is reported
//! and the loop keeps going. A loop ends on the shared shutdown signal or
//! when its handle is stopped.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

pub struct PeriodicTask {
    name: &'static str,
    interval: Duration,
}

/// Handle to a running loop.
pub struct PeriodicHandle {
    name: &'static str,
    stop: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl PeriodicTask {
    pub fn new(name: &'static str, interval: Duration) -> Self {
        Self {
            name,
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    /// Start the loop. The first tick fires immediately.
    pub fn spawn<F, Fut>(self, mut shutdown: watch::Receiver<bool>, body: F) -> PeriodicHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let (stop, mut stopped) = watch::channel(false);
        let name = self.name;
        let interval = self.interval;

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(task = name, interval_ms = interval.as_millis() as u64, "periodic task started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match tokio::spawn(body()).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => error!(task = name, error = %e, "periodic task failed"),
                            Err(e) if e.is_panic() => error!(task = name, "periodic task panicked"),
                            Err(e) => warn!(task = name, error = %e, "periodic task cancelled"),
                        }
                    }
                    _ = shutdown.changed() => break,
                    _ = stopped.changed() => break,
                }
            }
            debug!(task = name, "periodic task stopped");
        });

        PeriodicHandle { name, stop, join }
    }
}

impl PeriodicHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Stop this loop alone and wait for the current tick to finish.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        self.join().await;
    }

    /// Wait for the loop to end.
    pub async fn join(self) {
        if let Err(e) = self.join.await {
            warn!(task = self.name, error = %e, "periodic task did not exit cleanly");
        }
    }
}
