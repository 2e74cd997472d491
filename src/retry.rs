//! Retry policy for one logical stage call.
//!
//! The policy never touches the network. The orchestrator classifies each
//! failure, asks [`RetryPolicy::decide`] what to do next, and acts on the
//! returned [`RetryDecision`].

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Failure families, from the orchestrator's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Timeout or connection reset.
    Transient,
    /// Backend reachable but the resource is loading.
    NotReady,
    /// Input plus requested output did not fit.
    Oversized,
    /// The previous session id was rejected.
    StaleSession,
    /// Backend failed internally; an external supervisor restores it.
    Broken,
    /// Output could not be parsed or validated.
    Malformed,
    /// Nothing to gain from retrying.
    Fatal,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::NotReady => "not_ready",
            Self::Oversized => "oversized",
            Self::StaleSession => "stale_session",
            Self::Broken => "broken",
            Self::Malformed => "malformed",
            Self::Fatal => "fatal",
        }
    }
}

/// Why a call was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GiveUpReason {
    /// The attempt ceiling was reached; carries the last failure class.
    Exhausted(ErrorClass),
    /// A fresh-context retry was already spent.
    FallbackSpent,
    Fatal,
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Repeat the same request after `delay`.
    RetrySame { delay: Duration },
    /// Repeat with a smaller output budget. Does not consume an attempt.
    ShrinkBudget,
    /// Drop the session and repeat in fresh-context mode.
    Fallback,
    GiveUp { reason: GiveUpReason },
}

/// Knobs for [`RetryPolicy::decide`]. All delays are per failed attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Counted failures allowed per item before giving up.
    pub max_attempts: u32,
    #[serde(with = "crate::config::millis")]
    pub transient_delay_min: Duration,
    #[serde(with = "crate::config::millis")]
    pub transient_delay_max: Duration,
    #[serde(with = "crate::config::millis")]
    pub not_ready_delay: Duration,
    /// Liveness wait after a backend failure.
    #[serde(with = "crate::config::millis")]
    pub broken_pause: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            transient_delay_min: Duration::from_millis(100),
            transient_delay_max: Duration::from_millis(1_000),
            not_ready_delay: Duration::from_millis(500),
            broken_pause: Duration::from_secs(5),
        }
    }
}

/// Mutable bookkeeping for one logical call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    /// Failures counted against `max_attempts`.
    pub attempts: u32,
    pub fallback_used: bool,
    /// Budget shrinks performed. Not bounded here; the budget floor bounds it.
    pub shrinks: u32,
}

impl RetryPolicy {
    /// Policy with no waits, for tests and dry runs.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            transient_delay_min: Duration::ZERO,
            transient_delay_max: Duration::ZERO,
            not_ready_delay: Duration::ZERO,
            broken_pause: Duration::ZERO,
        }
    }

    /// Decide the next step after a failure of `class`.
    ///
    /// `chained` is whether the failed request carried a previous session id.
    /// A chained request rejected as not-ready or oversized is treated as a
    /// stale session: the backend answers 400/404 for a dead session id.
    pub fn decide(&self, class: ErrorClass, chained: bool, state: &mut RetryState) -> RetryDecision {
        let class = match class {
            ErrorClass::NotReady | ErrorClass::Oversized if chained => ErrorClass::StaleSession,
            other => other,
        };

        match class {
            ErrorClass::StaleSession => {
                if state.fallback_used {
                    RetryDecision::GiveUp {
                        reason: GiveUpReason::FallbackSpent,
                    }
                } else {
                    state.fallback_used = true;
                    RetryDecision::Fallback
                }
            }
            ErrorClass::Oversized => {
                state.shrinks += 1;
                RetryDecision::ShrinkBudget
            }
            ErrorClass::Fatal => RetryDecision::GiveUp {
                reason: GiveUpReason::Fatal,
            },
            ErrorClass::Transient
            | ErrorClass::NotReady
            | ErrorClass::Broken
            | ErrorClass::Malformed => {
                state.attempts += 1;
                if state.attempts >= self.max_attempts {
                    return RetryDecision::GiveUp {
                        reason: GiveUpReason::Exhausted(class),
                    };
                }
                RetryDecision::RetrySame {
                    delay: self.delay_for(class),
                }
            }
        }
    }

    fn delay_for(&self, class: ErrorClass) -> Duration {
        match class {
            ErrorClass::NotReady => self.not_ready_delay,
            ErrorClass::Broken => self.broken_pause,
            _ => {
                let (lo, hi) = (self.transient_delay_min, self.transient_delay_max);
                if hi <= lo {
                    lo
                } else {
                    let ms = rand::thread_rng().gen_range(lo.as_millis()..=hi.as_millis());
                    Duration::from_millis(ms as u64)
                }
            }
        }
    }
}
