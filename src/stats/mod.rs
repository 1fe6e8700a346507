//! Process-wide transfer statistics
//!
//! Counters are plain atomics updated from relay tasks; readers see eventual
//! consistency. The statistics object is an explicitly passed collaborator
//! with its own lifecycle, not an ambient singleton: endpoints create one,
//! optionally spawn the periodic reporter, and shut it down on exit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

/// Byte counters for both tunnel directions
#[derive(Debug, Default)]
pub struct Statistics {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl Statistics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }
}

/// Handle for the periodic statistics log task
pub struct StatsReporter {
    shutdown: oneshot::Sender<()>,
}

impl StatsReporter {
    /// Log cumulative totals every `period` until shut down
    pub fn spawn(stats: Arc<Statistics>, period: Duration) -> Self {
        let (shutdown, mut closing) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await; // immediate first tick
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        debug!(
                            sent_mb = stats.sent() / (1024 * 1024),
                            received_mb = stats.received() / (1024 * 1024),
                            "transfer totals"
                        );
                    }
                    _ = &mut closing => return,
                }
            }
        });

        Self { shutdown }
    }

    /// Stop the reporter task
    pub fn shutdown(self) {
        let _ = self.shutdown.send(());
    }
}
