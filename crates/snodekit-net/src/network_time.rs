//! Clock corrected by the offset storage nodes report.
//!
//! Signed requests are rejected by snodes when our clock drifts too far, so
//! every `t` a snode sends back updates the offset used for timestamps.

use std::sync::atomic::{AtomicI64, Ordering};

use tracing::debug;

#[derive(Debug, Default)]
pub struct NetworkTime {
    /// local - network, in millis
    offset_ms: AtomicI64,
}

impl NetworkTime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn local_now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Current time as the network sees it.
    pub fn now_ms(&self) -> i64 {
        Self::local_now_ms() - self.offset_ms()
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::Relaxed)
    }

    /// Record the server time `t` returned by `request`.
    pub fn handle_offset_from_network(&self, request: &str, server_time_ms: i64) {
        if server_time_ms <= 0 {
            return;
        }
        let offset = Self::local_now_ms() - server_time_ms;
        let previous = self.offset_ms.swap(offset, Ordering::Relaxed);
        if (previous - offset).abs() > 1_000 {
            debug!(request, offset_ms = offset, "network time offset changed");
        }
    }
}
