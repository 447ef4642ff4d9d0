//! Online/offline indicator.
//!
//! Flips to offline after a run of connect failures and back to online on
//! the next success. Subscribers get changes through a `watch` channel.

use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::watch;
use tracing::{info, warn};

use snodekit_shared::constants::OFFLINE_AFTER_CONNECT_FAILURES;

pub struct Presence {
    online: watch::Sender<bool>,
    connect_failures: AtomicU32,
    threshold: u32,
}

impl Presence {
    pub fn new() -> Self {
        Self::with_threshold(OFFLINE_AFTER_CONNECT_FAILURES)
    }

    pub fn with_threshold(threshold: u32) -> Self {
        let (online, _) = watch::channel(true);
        Self {
            online,
            connect_failures: AtomicU32::new(0),
            threshold: threshold.max(1),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }

    pub fn record_success(&self) {
        self.connect_failures.store(0, Ordering::Relaxed);
        self.online.send_if_modified(|online| {
            if *online {
                return false;
            }
            info!("network reachable again, going online");
            *online = true;
            true
        });
    }

    pub fn record_connect_failure(&self) {
        let failures = self.connect_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures < self.threshold {
            return;
        }
        self.online.send_if_modified(|online| {
            if !*online {
                return false;
            }
            warn!(failures, "repeated connect failures, going offline");
            *online = false;
            true
        });
    }
}

impl Default for Presence {
    fn default() -> Self {
        Self::new()
    }
}
