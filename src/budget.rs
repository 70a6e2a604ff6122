//! Spend accounting and budget enforcement.
//!
//! Spend is tracked per caller identity and for the system as a whole. A
//! reservation is taken before dispatch using the estimated cost of the
//! request; after the call settles, the reservation is either committed
//! (trued up against the actual cost) or released. Ceilings reset on a
//! configured cadence, evaluated lazily against wall-clock time.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::GLOBAL_KEY;

/// Cadence at which spend counters reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResetPeriod {
    Never,
    Hourly,
    #[default]
    Daily,
    Monthly,
}

/// Which ceiling a denial was measured against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetScope {
    Identity,
    Global,
}

impl std::fmt::Display for BudgetScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Identity => write!(f, "identity"),
            Self::Global => write!(f, "global"),
        }
    }
}

/// A reservation refusal: the scope that denied and how much headroom it
/// has left.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetDenial {
    pub scope: BudgetScope,
    pub remaining: f64,
}

#[derive(Debug, Clone)]
struct BudgetState {
    spent: f64,
    reserved: f64,
    period_start: DateTime<Utc>,
}

impl BudgetState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            spent: 0.0,
            reserved: 0.0,
            period_start: now,
        }
    }
}

/// Tracks committed and reserved spend per key, enforcing per-identity and
/// global ceilings.
pub struct CostTracker {
    per_identity_ceiling: Option<f64>,
    global_ceiling: Option<f64>,
    reset: ResetPeriod,
    state: Mutex<HashMap<String, BudgetState>>,
}

impl CostTracker {
    pub fn new(
        per_identity_ceiling: Option<f64>,
        global_ceiling: Option<f64>,
        reset: ResetPeriod,
    ) -> Self {
        Self {
            per_identity_ceiling,
            global_ceiling,
            reset,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Place a provisional hold of `estimate` against both the identity and
    /// the global ceiling. Fails without reserving anything when either
    /// scope lacks headroom.
    pub fn reserve(&self, key: &str, estimate: f64) -> Result<(), BudgetDenial> {
        self.reserve_at(key, estimate, Utc::now())
    }

    /// Settle a reservation: drop the hold and add the actual cost. The
    /// estimate may have over- or under-counted; the committed total always
    /// reflects the actual amount.
    pub fn commit(&self, key: &str, estimate: f64, actual: f64) {
        self.commit_at(key, estimate, actual, Utc::now());
    }

    /// Drop a reservation without charging anything.
    pub fn release(&self, key: &str, estimate: f64) {
        let mut state = self.state.lock().expect("budget mutex poisoned");
        for k in [key, GLOBAL_KEY] {
            if let Some(entry) = state.get_mut(k) {
                entry.reserved = (entry.reserved - estimate).max(0.0);
            }
        }
    }

    /// Committed spend for a key in the current period. Reservations that
    /// were never committed do not appear here.
    pub fn spend(&self, key: &str) -> f64 {
        self.spend_at(key, Utc::now())
    }

    /// Committed system-wide spend in the current period.
    pub fn global_spend(&self) -> f64 {
        self.spend(GLOBAL_KEY)
    }

    fn reserve_at(
        &self,
        key: &str,
        estimate: f64,
        now: DateTime<Utc>,
    ) -> Result<(), BudgetDenial> {
        let mut state = self.state.lock().expect("budget mutex poisoned");
        let reset = self.reset;
        let identity = state
            .entry(key.to_string())
            .or_insert_with(|| BudgetState::new(now));
        maybe_reset(identity, reset, now);
        if let Some(ceiling) = self.per_identity_ceiling {
            let remaining = ceiling - identity.spent - identity.reserved;
            if estimate > remaining {
                return Err(BudgetDenial {
                    scope: BudgetScope::Identity,
                    remaining: remaining.max(0.0),
                });
            }
        }

        let global = state
            .entry(GLOBAL_KEY.to_string())
            .or_insert_with(|| BudgetState::new(now));
        maybe_reset(global, reset, now);
        if let Some(ceiling) = self.global_ceiling {
            let remaining = ceiling - global.spent - global.reserved;
            if estimate > remaining {
                return Err(BudgetDenial {
                    scope: BudgetScope::Global,
                    remaining: remaining.max(0.0),
                });
            }
        }

        // Both scopes have headroom; take the hold on each.
        for k in [key, GLOBAL_KEY] {
            if let Some(entry) = state.get_mut(k) {
                entry.reserved += estimate;
            }
        }
        Ok(())
    }

    fn commit_at(&self, key: &str, estimate: f64, actual: f64, now: DateTime<Utc>) {
        let mut state = self.state.lock().expect("budget mutex poisoned");
        for k in [key, GLOBAL_KEY] {
            let entry = state
                .entry(k.to_string())
                .or_insert_with(|| BudgetState::new(now));
            maybe_reset(entry, self.reset, now);
            entry.reserved = (entry.reserved - estimate).max(0.0);
            entry.spent += actual;
        }
        tracing::debug!(
            key = %key,
            estimate = estimate,
            actual = actual,
            "Committed spend"
        );
    }

    fn spend_at(&self, key: &str, now: DateTime<Utc>) -> f64 {
        let mut state = self.state.lock().expect("budget mutex poisoned");
        match state.get_mut(key) {
            Some(entry) => {
                maybe_reset(entry, self.reset, now);
                entry.spent
            }
            None => 0.0,
        }
    }
}

/// Zero the committed counter when the configured period has elapsed.
/// Outstanding reservations survive a reset; their requests are still in
/// flight and will settle against the new period.
fn maybe_reset(state: &mut BudgetState, reset: ResetPeriod, now: DateTime<Utc>) {
    let due = match reset {
        ResetPeriod::Never => false,
        ResetPeriod::Hourly => now >= state.period_start + chrono::Duration::hours(1),
        ResetPeriod::Daily => now.date_naive() > state.period_start.date_naive(),
        ResetPeriod::Monthly => now >= add_one_month(state.period_start),
    };
    if due {
        tracing::debug!(
            period_start = %state.period_start,
            spent = state.spent,
            "Resetting budget period"
        );
        state.spent = 0.0;
        state.period_start = now;
    }
}

/// Add one month, clamping the day to the last day of the target month.
fn add_one_month(dt: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if dt.month() == 12 {
        (dt.year() + 1, 1)
    } else {
        (dt.year(), dt.month() + 1)
    };

    let max_day = days_in_month(year, month);
    let day = dt.day().min(max_day);

    NaiveDate::from_ymd_opt(year, month, day)
        .map(|d| d.and_time(dt.time()).and_utc())
        .unwrap_or(dt)
}

/// Number of days in a given month.
fn days_in_month(year: i32, month: u32) -> u32 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 => {
            if year % 4 == 0 && (year % 100 != 0 || year % 400 == 0) {
                29
            } else {
                28
            }
        }
        _ => 30,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
