//! Request throughput limiting.
//!
//! Two windows are enforced on every acquire: the caller's own window and
//! the system-wide one. Check and consume happen in a single critical
//! section, so two concurrent callers can never both claim the last slot.
//!
//! The window algorithm is configuration-defined: `sliding` keeps the
//! timestamps of admitted requests and prunes them past the trailing
//! window; `fixed` counts against bucketed window epochs.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Window accounting algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    #[default]
    Sliding,
    Fixed,
}

/// A single rate bound: at most `limit` admissions per `window`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowLimit {
    pub limit: u32,
    pub window: Duration,
}

/// Outcome of an acquire attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Allowed,
    Denied { retry_after: Duration },
}

enum WindowState {
    Sliding(VecDeque<Instant>),
    Fixed { epoch: u64, count: u32 },
}

struct Window {
    limit: WindowLimit,
    state: WindowState,
}

impl Window {
    fn new(algorithm: Algorithm, limit: WindowLimit) -> Self {
        let state = match algorithm {
            Algorithm::Sliding => WindowState::Sliding(VecDeque::new()),
            Algorithm::Fixed => WindowState::Fixed { epoch: 0, count: 0 },
        };
        Self { limit, state }
    }

    /// Check capacity without consuming. Returns the wait until a slot
    /// frees up when the window is full.
    fn check(&mut self, now: Instant, origin: Instant) -> Result<(), Duration> {
        match &mut self.state {
            WindowState::Sliding(stamps) => {
                while let Some(front) = stamps.front() {
                    if *front + self.limit.window <= now {
                        stamps.pop_front();
                    } else {
                        break;
                    }
                }
                if (stamps.len() as u32) < self.limit.limit {
                    Ok(())
                } else {
                    // Oldest in-window admission determines when capacity returns.
                    let oldest = *stamps.front().unwrap_or(&now);
                    Err((oldest + self.limit.window).saturating_duration_since(now))
                }
            }
            WindowState::Fixed { epoch, count } => {
                let elapsed = now.saturating_duration_since(origin);
                let current = (elapsed.as_nanos() / self.limit.window.as_nanos().max(1)) as u64;
                if current != *epoch {
                    *epoch = current;
                    *count = 0;
                }
                if *count < self.limit.limit {
                    Ok(())
                } else {
                    let next = self.limit.window.saturating_mul((current + 1) as u32);
                    Err(next.saturating_sub(elapsed))
                }
            }
        }
    }

    fn consume(&mut self, now: Instant) {
        match &mut self.state {
            WindowState::Sliding(stamps) => stamps.push_back(now),
            WindowState::Fixed { count, .. } => *count += 1,
        }
    }

    /// Return the most recently consumed slot. Used when a later pipeline
    /// stage denies the request before anything was dispatched.
    fn release(&mut self) {
        match &mut self.state {
            WindowState::Sliding(stamps) => {
                stamps.pop_back();
            }
            WindowState::Fixed { count, .. } => {
                *count = count.saturating_sub(1);
            }
        }
    }
}

struct LimiterState {
    identities: HashMap<String, Window>,
    global: Option<Window>,
}

/// Sliding- or fixed-window rate limiter keyed by caller identity plus a
/// system-wide window.
pub struct RateLimiter {
    algorithm: Algorithm,
    per_identity: Option<WindowLimit>,
    origin: Instant,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(
        algorithm: Algorithm,
        per_identity: Option<WindowLimit>,
        global: Option<WindowLimit>,
    ) -> Self {
        Self {
            algorithm,
            per_identity,
            origin: Instant::now(),
            state: Mutex::new(LimiterState {
                identities: HashMap::new(),
                global: global.map(|l| Window::new(algorithm, l)),
            }),
        }
    }

    /// Attempt to reserve one request slot for `key` at time `now`.
    ///
    /// The identity window and the global window must both admit the
    /// request; consumption of both slots is atomic. When both would deny,
    /// the larger suggested wait is reported. An identity with no
    /// configured per-identity limit is bounded by the global window only.
    pub fn acquire(&self, key: &str, now: Instant) -> Acquire {
        let mut state = self.state.lock().expect("limiter mutex poisoned");
        let origin = self.origin;

        let identity_check = match self.per_identity {
            Some(limit) => state
                .identities
                .entry(key.to_string())
                .or_insert_with(|| Window::new(self.algorithm, limit))
                .check(now, origin),
            None => Ok(()),
        };
        let global_check = match &mut state.global {
            Some(window) => window.check(now, origin),
            None => Ok(()),
        };

        match (identity_check, global_check) {
            (Ok(()), Ok(())) => {
                if self.per_identity.is_some() {
                    if let Some(window) = state.identities.get_mut(key) {
                        window.consume(now);
                    }
                }
                if let Some(window) = &mut state.global {
                    window.consume(now);
                }
                Acquire::Allowed
            }
            (identity, global) => {
                let retry_after = [identity.err(), global.err()]
                    .into_iter()
                    .flatten()
                    .max()
                    .unwrap_or_default();
                tracing::debug!(
                    key = %key,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Rate limit denied"
                );
                Acquire::Denied { retry_after }
            }
        }
    }

    /// Wait for capacity, re-polling after each suggested retry interval,
    /// until `deadline`. Returns the last denial when the deadline would be
    /// exceeded before capacity frees up.
    pub async fn acquire_blocking(&self, key: &str, deadline: Instant) -> Acquire {
        loop {
            let now = Instant::now();
            match self.acquire(key, now) {
                Acquire::Allowed => return Acquire::Allowed,
                Acquire::Denied { retry_after } => {
                    // Never a zero-length sleep, or a full window at an
                    // exact epoch boundary would spin.
                    let wake = now + retry_after.max(Duration::from_millis(1));
                    if wake >= deadline {
                        return Acquire::Denied { retry_after };
                    }
                    tokio::time::sleep_until(tokio::time::Instant::from_std(wake)).await;
                }
            }
        }
    }

    /// Return the slot most recently consumed for `key` (and its global
    /// counterpart). Called when a downstream stage denies the request
    /// before dispatch, so denied requests do not burn throughput.
    pub fn release(&self, key: &str) {
        let mut state = self.state.lock().expect("limiter mutex poisoned");
        if let Some(window) = state.identities.get_mut(key) {
            window.release();
        }
        if let Some(window) = &mut state.global {
            window.release();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
