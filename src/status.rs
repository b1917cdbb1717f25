//! Background progress ticker
//!
//! Long waits get a cooperative side-channel task that periodically reports
//! the step still in flight. The one contract that matters: the ticker is
//! always stopped before the step's result is reported, so progress lines
//! never interleave with outcomes.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// A cancellable periodic progress reporter for one step
pub struct StatusTicker {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl StatusTicker {
    /// Start ticking for the given step
    pub fn start(step: impl Into<String>, period: Duration) -> Self {
        let step = step.into();
        let token = CancellationToken::new();
        let child = token.child_token();
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now();
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately; skip it
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = interval.tick() => {
                        info!(step = %step, elapsed = ?start.elapsed(), "still in progress");
                    }
                }
            }
        });
        Self { token, handle }
    }

    /// Stop the ticker and wait for it to exit.
    ///
    /// Must be called before the step's outcome is reported.
    pub async fn stop(self) {
        self.token.cancel();
        let _ = self.handle.await;
    }

    /// Cancel without waiting; used on external interrupt
    pub fn abort(&self) {
        self.token.cancel();
    }
}
