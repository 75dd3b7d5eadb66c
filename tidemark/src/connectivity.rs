//! Background connectivity monitor.
//!
//! A periodic task issues a HEAD request against a designated upstream and
//! folds the outcome into a single atomic flag. The flag is read by the
//! resolver without locking; a stale value only sends one request down a
//! suboptimal tier, so no stronger coordination is needed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Interval between probes.
const PROBE_INTERVAL: Duration = Duration::from_secs(10);

/// Per-probe timeout.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ConnectivityMonitor {
    online: AtomicBool,
}

impl ConnectivityMonitor {
    /// Creates a monitor that starts in the offline state.
    pub fn new() -> Self {
        Self {
            online: AtomicBool::new(false),
        }
    }

    /// Current state. Racy by design.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    /// Overrides the state. Used by tests and by hosts without a probe URL.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Relaxed);
    }

    /// Spawns the probe loop against `probe_url`.
    pub fn spawn(self: &Arc<Self>, probe_url: String) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let client = match reqwest::Client::builder().timeout(PROBE_TIMEOUT).build() {
                Ok(client) => client,
                Err(err) => {
                    debug!(error = %err, "connectivity probe disabled, HTTP client failed");
                    return;
                }
            };
            let mut interval = tokio::time::interval(PROBE_INTERVAL);
            loop {
                interval.tick().await;
                let online = match client.head(&probe_url).send().await {
                    Ok(response) => {
                        let status = response.status().as_u16();
                        (200..400).contains(&status)
                    }
                    Err(_) => false,
                };
                let was = monitor.online.swap(online, Ordering::Relaxed);
                if was != online {
                    info!(online, "connectivity changed");
                }
            }
        })
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_offline() {
        assert!(!ConnectivityMonitor::new().is_online());
    }

    #[test]
    fn set_online_flips_state() {
        let monitor = ConnectivityMonitor::new();
        monitor.set_online(true);
        assert!(monitor.is_online());
        monitor.set_online(false);
        assert!(!monitor.is_online());
    }
}
