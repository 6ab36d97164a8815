use std::cell::Cell;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Milliseconds since this boot. Restarts at zero after every deep sleep.
pub trait Clock {
    fn now_ms(&self) -> u64;
}

pub trait Delay {
    fn delay_ms(&mut self, ms: u64);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPoint {
    pub remote_ms: u64,
    pub local_ms: u64,
}

/// Absolute time reconstructed from the last server timestamp.
///
/// `now` is pure: it only needs the local uptime, so the same value can be
/// carried across a deep sleep by rebasing it with [`LogicalClock::rebase_for_sleep`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalClock {
    synced_at: Option<SyncPoint>,
}

impl LogicalClock {
    pub fn unsynchronized() -> Self {
        Self { synced_at: None }
    }

    pub fn synced(remote_ms: u64, local_ms: u64) -> Self {
        Self {
            synced_at: Some(SyncPoint {
                remote_ms,
                local_ms,
            }),
        }
    }

    pub fn sync(&mut self, remote_ms: u64, local_ms: u64) {
        self.synced_at = Some(SyncPoint {
            remote_ms,
            local_ms,
        });
    }

    pub fn is_synchronized(&self) -> bool {
        self.synced_at.is_some()
    }

    pub fn sync_point(&self) -> Option<SyncPoint> {
        self.synced_at
    }

    pub fn now(&self, local_ms: u64) -> Option<u64> {
        self.synced_at.map(|sync| {
            sync.remote_ms
                .saturating_add(local_ms.saturating_sub(sync.local_ms))
        })
    }

    pub fn now_utc(&self, local_ms: u64) -> Option<DateTime<Utc>> {
        let epoch_ms = i64::try_from(self.now(local_ms)?).ok()?;
        Utc.timestamp_millis_opt(epoch_ms).single()
    }

    /// Clock to restore after waking from a sleep of `sleep_ms` that starts at
    /// `local_ms`. The returned sync point is anchored at local time zero.
    pub fn rebase_for_sleep(&self, local_ms: u64, sleep_ms: u64) -> Self {
        match self.now(local_ms) {
            Some(remote_now) => Self::synced(remote_now.saturating_add(sleep_ms), 0),
            None => Self::unsynchronized(),
        }
    }
}

/// Hand-driven clock; delaying on it advances time instead of blocking.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: Cell<u64>,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: Cell::new(start_ms),
        }
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.set(now_ms);
    }

    pub fn advance(&self, ms: u64) {
        self.now_ms.set(self.now_ms.get().saturating_add(ms));
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.get()
    }
}

impl Delay for &ManualClock {
    fn delay_ms(&mut self, ms: u64) {
        self.advance(ms);
    }
}
