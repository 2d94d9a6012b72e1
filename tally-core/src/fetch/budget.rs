// Shared remote-API rate-limit budget, drawn on by every fetcher call.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

/// Point-in-time view of the budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BudgetSnapshot {
    /// `None` until the remote has reported a count.
    pub remaining: Option<u32>,
    pub reset_at: Option<DateTime<Utc>>,
}

/// Rate-limit state shared across all resources. The remote's headers are authoritative.
#[derive(Debug)]
pub struct RateBudget {
    /// Pause once remaining drops to this level.
    pause_threshold: u32,
    state: Mutex<BudgetSnapshot>,
}

impl RateBudget {
    pub fn new(pause_threshold: u32) -> Self {
        Self {
            pause_threshold,
            state: Mutex::new(BudgetSnapshot::default()),
        }
    }

    /// Record the remaining calls and reset time reported by the remote.
    pub fn observe(&self, remaining: u32, reset_at: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.remaining = Some(remaining);
        state.reset_at = Some(reset_at);
        if remaining < 10 {
            warn!(remaining, reset_at = %reset_at, "Remote API rate limit low");
        }
    }

    /// The remote rejected a call outright; nothing is left until `reset_at`.
    pub fn exhaust_until(&self, reset_at: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.remaining = Some(0);
        state.reset_at = Some(reset_at);
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// How long a caller must wait before spending more budget, if at all.
    pub fn pause_needed(&self, now: DateTime<Utc>) -> Option<Duration> {
        let state = self.snapshot();
        let remaining = state.remaining?;
        if remaining > self.pause_threshold {
            return None;
        }
        let reset_at = state.reset_at?;
        if reset_at <= now {
            return None;
        }
        let wait = (reset_at - now).to_std().ok()?;
        // One extra second so the first call lands after the reset.
        Some(wait + Duration::from_secs(1))
    }
}

impl Default for RateBudget {
    fn default() -> Self {
        Self::new(5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn unknown_budget_never_pauses() {
        let budget = RateBudget::new(5);
        assert_eq!(budget.snapshot(), BudgetSnapshot::default());
        assert!(budget.pause_needed(Utc::now()).is_none());
    }

    #[test]
    fn pauses_until_reset_when_low() {
        let budget = RateBudget::new(5);
        let now = at("2024-01-01T00:00:00Z");
        budget.observe(3, at("2024-01-01T00:00:30Z"));
        assert_eq!(budget.pause_needed(now), Some(Duration::from_secs(31)));
    }

    #[test]
    fn healthy_budget_does_not_pause() {
        let budget = RateBudget::new(5);
        let now = at("2024-01-01T00:00:00Z");
        budget.observe(4000, at("2024-01-01T01:00:00Z"));
        assert!(budget.pause_needed(now).is_none());
    }

    #[test]
    fn past_reset_does_not_pause() {
        let budget = RateBudget::new(5);
        budget.exhaust_until(at("2024-01-01T00:00:00Z"));
        assert!(budget.pause_needed(at("2024-01-01T00:05:00Z")).is_none());
        assert_eq!(budget.snapshot().remaining, Some(0));
    }
}
