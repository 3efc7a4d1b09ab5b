//! Per-API-key quota counters.
//!
//! Three dimensions are enforced atomically: a 1-second rolling throttle
//! window, a calendar-day counter and a calendar-month counter, both in the
//! instance's local timezone. `consume` is linearizable per key: the check
//! and the increment of all three dimensions happen under one per-key lock,
//! so two concurrent calls that both observe one remaining slot admit exactly
//! one caller.

use chrono::{DateTime, Datelike, Local};
use dashmap::DashMap;
use portcullis_types::error::QuotaDimension;
use portcullis_types::models::ApiKey;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Remaining allowance after a successful consume, surfaced to clients in
/// response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemainingQuotas {
    /// Calls left in the current 1-second window
    pub remaining_per_second: u64,
    /// Calls left today
    pub remaining_daily: u64,
    /// Calls left this month
    pub remaining_monthly: u64,
}

#[derive(Debug)]
struct QuotaWindows {
    /// Timestamps (ms) of calls admitted within the last second
    second: VecDeque<i64>,
    day_key: (i32, u32, u32),
    day_count: u64,
    month_key: (i32, u32),
    month_count: u64,
}

impl QuotaWindows {
    fn new(now: DateTime<Local>) -> Self {
        Self {
            second: VecDeque::new(),
            day_key: (now.year(), now.month(), now.day()),
            day_count: 0,
            month_key: (now.year(), now.month()),
            month_count: 0,
        }
    }

    fn roll(&mut self, now: DateTime<Local>) {
        let now_ms = now.timestamp_millis();
        while self.second.front().is_some_and(|t| now_ms - *t >= 1_000) {
            self.second.pop_front();
        }
        let day_key = (now.year(), now.month(), now.day());
        if day_key != self.day_key {
            self.day_key = day_key;
            self.day_count = 0;
        }
        let month_key = (now.year(), now.month());
        if month_key != self.month_key {
            self.month_key = month_key;
            self.month_count = 0;
        }
    }
}

/// Shared store of per-key quota state.
pub struct QuotaStore {
    states: DashMap<String, Arc<Mutex<QuotaWindows>>>,
}

impl QuotaStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self { states: DashMap::new() }
    }

    /// Admit or reject one call for `key` at the current instant.
    pub fn consume(&self, key: &ApiKey) -> Result<RemainingQuotas, QuotaDimension> {
        self.consume_at(key, Local::now())
    }

    /// Admit or reject one call for `key` at `now`.
    ///
    /// Rejection names the first violated dimension in check order:
    /// per-second, daily, monthly. Nothing is incremented on rejection.
    pub fn consume_at(
        &self,
        key: &ApiKey,
        now: DateTime<Local>,
    ) -> Result<RemainingQuotas, QuotaDimension> {
        let state = self
            .states
            .entry(key.client_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(QuotaWindows::new(now))))
            .clone();

        let mut windows = state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        windows.roll(now);

        if windows.second.len() as u64 >= key.throttling_quota {
            return Err(QuotaDimension::PerSecond);
        }
        if windows.day_count >= key.daily_quota {
            return Err(QuotaDimension::Daily);
        }
        if windows.month_count >= key.monthly_quota {
            return Err(QuotaDimension::Monthly);
        }

        windows.second.push_back(now.timestamp_millis());
        windows.day_count += 1;
        windows.month_count += 1;

        Ok(RemainingQuotas {
            remaining_per_second: key.throttling_quota - windows.second.len() as u64,
            remaining_daily: key.daily_quota - windows.day_count,
            remaining_monthly: key.monthly_quota - windows.month_count,
        })
    }

    /// Current usage snapshot for a key, without consuming.
    pub fn usage(&self, client_id: &str) -> Option<(u64, u64)> {
        self.states.get(client_id).map(|state| {
            let windows = state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            (windows.day_count, windows.month_count)
        })
    }
}

impl Default for QuotaStore {
    fn default() -> Self {
        Self::new()
    }
}
