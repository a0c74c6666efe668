//! The admission decision.
//!
//! Decisions are made against the previous, closed window: a caller is never
//! judged on a window that is still filling up. If the previous window went
//! over the hard limit, every request in the current window is rejected. If
//! it went over the soft limit, requests are paced toward the rule's target
//! rate by an induced delay.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use super::counter::{until_window_end, WindowedCounterStore};
use super::rules::{PolicyDocument, Rule, RuleCatalog};
use crate::error::{HardLimitExceeded, Result};

/// Fraction of a request's pacing interval given back per request observed
/// in the previous window. Lets the admitted rate run slightly above the
/// soft limit so callers do not flap at window boundaries.
const SLEEP_OFFSET_NUMERATOR: f64 = 0.2;

/// Outcome of an admission decision.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Forward the request now.
    Admit,
    /// Hold the request for the given time, then forward it.
    AdmitAfterDelay(Duration),
    /// Refuse the request.
    Reject(HardLimitExceeded),
}

impl Verdict {
    /// Whether the request is eventually forwarded.
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Verdict::Reject(_))
    }

    /// The induced delay, zero unless pacing.
    pub fn delay(&self) -> Duration {
        match self {
            Verdict::AdmitAfterDelay(delay) => *delay,
            _ => Duration::ZERO,
        }
    }
}

/// Tunables that apply across all rules.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GovernorSettings {
    /// Delays shorter than this, in seconds, are batched: only every n-th
    /// request sleeps, for the combined interval of the batch.
    pub sleep_threshold: f64,
}

impl Default for GovernorSettings {
    fn default() -> Self {
        Self {
            sleep_threshold: 0.1,
        }
    }
}

/// Per-request admission governor.
///
/// Thread-safe; share it behind an `Arc`.
#[derive(Debug)]
pub struct Governor {
    catalog: RuleCatalog,
    store: WindowedCounterStore,
    settings: GovernorSettings,
}

impl Governor {
    /// Create a governor over a compiled catalog.
    pub fn new(catalog: RuleCatalog, settings: GovernorSettings) -> Self {
        Self {
            catalog,
            store: WindowedCounterStore::new(),
            settings,
        }
    }

    /// Compile a policy document and build a governor from it.
    pub fn from_policy(doc: &PolicyDocument) -> Result<Self> {
        let catalog = RuleCatalog::from_document(doc)?;
        Ok(Self::new(
            catalog,
            GovernorSettings {
                sleep_threshold: doc.sleep_threshold,
            },
        ))
    }

    /// The first rule applying to the request, if any.
    pub fn rule_for(&self, method: &str, path: &str) -> Option<&Arc<Rule>> {
        self.catalog.find(method, path)
    }

    /// Decide whether a request from `identity` proceeds.
    ///
    /// Requests no rule applies to are admitted without being counted.
    pub fn decide(&self, method: &str, path: &str, identity: &str, now: DateTime<Utc>) -> Verdict {
        match self.catalog.find(method, path) {
            Some(rule) => self.decide_for_rule(rule, identity, now),
            None => {
                debug!(method = %method, path = %path, "Requested path not recognized, not limiting");
                Verdict::Admit
            }
        }
    }

    /// Count the request against `rule` and decide.
    pub fn decide_for_rule(&self, rule: &Rule, identity: &str, now: DateTime<Utc>) -> Verdict {
        let (current, previous) = self.store.increment_and_read(identity, rule.period(), now);

        trace!(
            rule = %rule.name(),
            identity = %identity,
            current = current,
            previous = previous,
            "Checking admission"
        );

        if previous > rule.hard_limit() {
            return Verdict::Reject(HardLimitExceeded {
                rule: rule.name().to_string(),
                identity: identity.to_string(),
                observed: previous,
                limit: rule.hard_limit(),
                retry_after: until_window_end(now, rule.period()),
            });
        }

        if previous > rule.soft_limit() {
            let delay = self.pacing_delay(rule, current, previous);
            debug!(
                rule = %rule.name(),
                identity = %identity,
                previous = previous,
                delay_ms = delay.as_millis() as u64,
                "Soft limit exceeded, pacing"
            );
            return if delay.is_zero() {
                Verdict::Admit
            } else {
                Verdict::AdmitAfterDelay(delay)
            };
        }

        Verdict::Admit
    }

    /// Delay for the `current`-th request of a window following one with
    /// `previous` requests.
    ///
    /// Pacing is a fixed interval of `1 / target` seconds per request, less
    /// the anti-thrash offset. It does not scale with how far the previous
    /// window overshot.
    fn pacing_delay(&self, rule: &Rule, current: u64, previous: u64) -> Duration {
        let sleep_per_request = if rule.target() > 0.0 {
            1.0 / rule.target()
        } else {
            rule.period().as_secs_f64()
        };
        let sleep_offset = SLEEP_OFFSET_NUMERATOR / previous as f64;

        let seconds = if sleep_per_request < self.settings.sleep_threshold {
            let batch_size = (self.settings.sleep_threshold / sleep_per_request).floor() as u64;
            let batch_size = batch_size.max(1);
            if current % batch_size != 0 {
                return Duration::ZERO;
            }
            (sleep_per_request - sleep_offset) * batch_size as f64
        } else {
            sleep_per_request - sleep_offset
        };

        Duration::try_from_secs_f64(seconds.max(0.0)).unwrap_or(Duration::ZERO)
    }

    /// The rule catalog.
    pub fn catalog(&self) -> &RuleCatalog {
        &self.catalog
    }

    /// The counter store.
    pub fn store(&self) -> &WindowedCounterStore {
        &self.store
    }

    /// Global settings.
    pub fn settings(&self) -> GovernorSettings {
        self.settings
    }

    /// Reclaim counters no rule can still read.
    ///
    /// Uses the longest rule period so no live window is dropped early.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        match self.catalog.rules().iter().map(|rule| rule.period()).max() {
            Some(period) => self.store.sweep(period, now),
            None => 0,
        }
    }
}
