//! How often a tracked identity is due, from how recently it was active.

use serde::Serialize;

use snodekit_shared::constants::{
    ACTIVE_WITHIN_MS, BACKDATE_SLACK_MS, MIN_MSG_COUNT_SHOULD_RETRY, MEDIUM_ACTIVE_WITHIN_MS,
    POLL_ACTIVE_INTERVAL_MS, POLL_INACTIVE_INTERVAL_MS, POLL_MEDIUM_ACTIVE_INTERVAL_MS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollTier {
    Active,
    MediumActive,
    Inactive,
}

impl PollTier {
    /// Tier of a conversation last active at `last_active_ms`. Unknown
    /// activity counts as inactive.
    pub fn for_activity(last_active_ms: Option<i64>, now_ms: i64) -> Self {
        let Some(active_at) = last_active_ms.filter(|at| *at > 0) else {
            return PollTier::Inactive;
        };
        let idle = now_ms - active_at;
        if idle <= ACTIVE_WITHIN_MS {
            PollTier::Active
        } else if idle <= MEDIUM_ACTIVE_WITHIN_MS {
            PollTier::MediumActive
        } else {
            PollTier::Inactive
        }
    }

    pub fn interval_ms(self) -> i64 {
        match self {
            PollTier::Active => POLL_ACTIVE_INTERVAL_MS,
            PollTier::MediumActive => POLL_MEDIUM_ACTIVE_INTERVAL_MS,
            PollTier::Inactive => POLL_INACTIVE_INTERVAL_MS,
        }
    }

    pub fn is_due(self, last_polled_ms: i64, now_ms: i64) -> bool {
        now_ms - last_polled_ms >= self.interval_ms()
    }
}

/// Timestamp to record after a poll that returned `message_count`
/// messages. A nearly full page is back-dated so the next cycle polls again
/// whatever the tier.
pub fn last_poll_timestamp(now_ms: i64, message_count: usize) -> i64 {
    if message_count >= MIN_MSG_COUNT_SHOULD_RETRY {
        now_ms - POLL_INACTIVE_INTERVAL_MS - BACKDATE_SLACK_MS
    } else {
        now_ms
    }
}
