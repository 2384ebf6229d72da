//! Credential rotation with exponential backoff.
//!
//! The policy walks the credential slots in a fixed order. Each throttled
//! response moves to the next slot; once every slot has been throttled
//! since the last success the window is exhausted and the caller sleeps:
//!
//! ```text
//! delay = min(base * 2^(round-1), max) + random_jitter(0..=max_jitter_ms)
//! ```
//!
//! After `max_backoff_attempts` rounds the policy answers
//! [`RotationDecision::Abort`]; progress is already on disk, so the operator
//! resumes the job by hand later.
//!
//! A credential whose session keeps failing (GraphQL errors, 401/403) is
//! taken out of the rotation after `max_consecutive_failures` in a row; the
//! job only stops once no credential is left.
//!
//! The [`AccountLedger`] records what happened to each credential so the
//! status survives restarts.

use crate::config::RotationConfig;
use crate::error::Result;
use crate::utils::{read_json_optional, write_json_atomic};
use chrono::{DateTime, Utc};
use rand::{Rng, rng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// What the caller should do after a rate-limit signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationDecision {
    /// Retry immediately with slot `to`.
    Rotate { to: usize },
    /// Sleep `delay`, then retry with slot `to`.
    Backoff { delay: Duration, round: u32, to: usize },
    /// Give up; `rounds` backoff rounds were already spent.
    Abort { rounds: u32 },
}

/// What the caller should do after a session failure on a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDecision {
    /// The slot stays in rotation; retry with slot `to`.
    Retry { to: usize, failures: u32 },
    /// The slot hit the failure limit and left the rotation; retry with `to`.
    Removed { to: usize },
    /// The slot left the rotation and none is left.
    Exhausted { disabled: usize },
}

/// Fixed-order rotation state.
///
/// Every change of the current slot bumps an epoch. Callers remember the
/// epoch they sent a request under and report throttling against it, so a
/// burst of concurrent failures from one slot moves the rotation only once.
#[derive(Debug, Clone)]
pub struct RotationPolicy {
    slots: usize,
    current: usize,
    epoch: u64,
    /// Slots throttled since the last success.
    tried_in_window: usize,
    backoff_round: u32,
    failures: Vec<u32>,
    disabled: Vec<bool>,
    config: RotationConfig,
}

impl RotationPolicy {
    pub fn new(slots: usize, config: RotationConfig) -> Self {
        let slots = slots.max(1);
        Self {
            slots,
            current: 0,
            epoch: 0,
            tried_in_window: 0,
            backoff_round: 0,
            failures: vec![0; slots],
            disabled: vec![false; slots],
            config,
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Slots still in rotation.
    pub fn usable(&self) -> usize {
        self.disabled.iter().filter(|d| !**d).count()
    }

    pub fn disabled(&self) -> usize {
        self.slots - self.usable()
    }

    /// The next slot after `from` that is still in rotation, wrapping around.
    fn next_usable(&self, from: usize) -> Option<usize> {
        (1..=self.slots)
            .map(|step| (from + step) % self.slots)
            .find(|&slot| !self.disabled[slot])
    }

    fn move_to(&mut self, slot: usize) {
        self.current = slot;
        self.epoch += 1;
    }

    /// A request on `slot` went through: the window, the backoff counter and
    /// the slot's failure streak start over.
    ///
    /// Returns whether the slot had a failure streak to clear.
    pub fn on_success(&mut self, slot: usize) -> bool {
        if self.tried_in_window > 0 || self.backoff_round > 0 {
            debug!(slot, "Rotation window reset after success");
        }
        self.tried_in_window = 0;
        self.backoff_round = 0;
        match self.failures.get_mut(slot) {
            Some(streak) if *streak > 0 => {
                *streak = 0;
                true
            }
            _ => false,
        }
    }

    /// Throttling seen by a request sent under `epoch`. A report from an
    /// earlier epoch is already accounted for and yields `None`.
    pub fn report_rate_limited(&mut self, epoch: u64) -> Option<RotationDecision> {
        if epoch != self.epoch {
            debug!(epoch, current = self.epoch, "Ignoring throttle report from an earlier rotation");
            return None;
        }
        Some(self.on_rate_limited())
    }

    /// The current slot was throttled.
    pub fn on_rate_limited(&mut self) -> RotationDecision {
        self.tried_in_window += 1;
        let next = self.next_usable(self.current).unwrap_or(self.current);

        if self.tried_in_window < self.usable() {
            self.move_to(next);
            return RotationDecision::Rotate { to: next };
        }

        self.backoff_round += 1;
        if self.backoff_round > self.config.max_backoff_attempts {
            warn!(
                rounds = self.config.max_backoff_attempts,
                slots = self.usable(),
                "Every credential throttled and backoff budget spent"
            );
            return RotationDecision::Abort {
                rounds: self.config.max_backoff_attempts,
            };
        }

        self.tried_in_window = 0;
        self.move_to(next);
        RotationDecision::Backoff {
            delay: self.backoff_delay(self.backoff_round),
            round: self.backoff_round,
            to: next,
        }
    }

    /// `slot` failed in a way that points at the session itself. After
    /// `max_consecutive_failures` in a row the slot leaves the rotation.
    pub fn on_session_failure(&mut self, slot: usize) -> FailureDecision {
        let Some(streak) = self.failures.get_mut(slot) else {
            return FailureDecision::Retry { to: self.current, failures: 0 };
        };
        *streak += 1;
        let failures = *streak;

        if failures >= self.config.max_consecutive_failures.max(1) {
            self.disabled[slot] = true;
            let Some(next) = self.next_usable(slot) else {
                warn!(slot, "Last usable credential removed from rotation");
                return FailureDecision::Exhausted {
                    disabled: self.disabled(),
                };
            };
            if self.current == slot || self.disabled[self.current] {
                self.tried_in_window = 0;
                self.move_to(next);
            }
            warn!(slot, failures, usable = self.usable(), "Credential removed from rotation");
            return FailureDecision::Removed { to: self.current };
        }

        if self.current == slot {
            if let Some(next) = self.next_usable(slot).filter(|&n| n != slot) {
                self.move_to(next);
            }
        }
        FailureDecision::Retry {
            to: self.current,
            failures,
        }
    }

    /// Delay for backoff round `round` (1-based), jitter included.
    pub fn backoff_delay(&self, round: u32) -> Duration {
        let base = Duration::from_secs(self.config.base_backoff_secs);
        let max = Duration::from_secs(self.config.max_backoff_secs);
        let factor = 1u32.checked_shl(round.saturating_sub(1)).unwrap_or(u32::MAX);
        let delay = base.saturating_mul(factor).min(max);
        let jitter = if self.config.max_jitter_ms == 0 {
            0
        } else {
            rng().random_range(0..=self.config.max_jitter_ms)
        };
        delay + Duration::from_millis(jitter)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountState {
    #[default]
    Available,
    Busy,
    RateLimited,
    /// Removed from rotation after repeated session failures.
    Disabled,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct AccountStatus {
    pub status: AccountState,
    #[serde(default)]
    pub last_used: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_rate_limited: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rate_limit_count: u32,
    #[serde(default)]
    pub consecutive_failures: u32,
}

/// Per-credential status persisted next to the job state.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct AccountLedger {
    pub accounts: BTreeMap<String, AccountStatus>,
}

impl AccountLedger {
    /// Load the ledger; a missing, blank or unreadable file gives an empty one.
    pub async fn load(path: &Path) -> AccountLedger {
        match read_json_optional::<AccountLedger>(path).await {
            Ok(Some(ledger)) => ledger,
            Ok(None) => AccountLedger::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unreadable account ledger; starting a new one");
                AccountLedger::default()
            }
        }
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self).await
    }

    /// The credential is now the one issuing requests.
    pub fn mark_busy(&mut self, name: &str) {
        let entry = self.accounts.entry(name.to_string()).or_default();
        entry.status = AccountState::Busy;
        entry.last_used = Some(Utc::now());
    }

    /// The credential is no longer issuing requests.
    pub fn mark_available(&mut self, name: &str) {
        let entry = self.accounts.entry(name.to_string()).or_default();
        entry.status = AccountState::Available;
    }

    pub fn mark_rate_limited(&mut self, name: &str) {
        let entry = self.accounts.entry(name.to_string()).or_default();
        entry.status = AccountState::RateLimited;
        entry.last_rate_limited = Some(Utc::now());
        entry.rate_limit_count += 1;
    }

    pub fn mark_failed(&mut self, name: &str, failures: u32) {
        self.accounts.entry(name.to_string()).or_default().consecutive_failures = failures;
    }

    pub fn mark_recovered(&mut self, name: &str) {
        self.accounts.entry(name.to_string()).or_default().consecutive_failures = 0;
    }

    pub fn mark_disabled(&mut self, name: &str) {
        let entry = self.accounts.entry(name.to_string()).or_default();
        entry.status = AccountState::Disabled;
        entry.consecutive_failures = entry.consecutive_failures.max(1);
    }
}
