//! Decides whether a metered action may proceed and records the consumption.
//!
//! Per (subject, action) a counter is either Active (count < max) or Exhausted
//! (count ≥ max) within its window; a check against an expired window always
//! starts a new window with count = 1. Denials are ordinary `Decision`s, only
//! store faults surface as `QuotaError`.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::quota::clock::Clock;
use crate::quota::policy::{Allowance, PolicyTable, ResolvedPolicy};
use crate::quota::store::{CounterStore, QuotaCounter, StoreError};
use crate::quota::tier::{ActionKind, CounterKey, Subject, Tier};
use crate::quota::window;

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("quota store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),
}

/// Why a request was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Denial {
    /// The tier has no allowance at all for the action.
    TierGateRejected { required_tier: Option<Tier> },
    /// The allowance for the current window is used up.
    QuotaExhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub action: ActionKind,
    pub tier: Tier,
    pub allowed: bool,
    /// `None` for unlimited allowances.
    pub limit: Option<u64>,
    /// `None` for unlimited allowances.
    pub remaining: Option<u64>,
    /// Only set for `QuotaExhausted`.
    pub retry_after: Option<StdDuration>,
    pub resets_at: Option<DateTime<Utc>>,
    /// Time from the decision until `resets_at`.
    pub reset_after: Option<StdDuration>,
    pub denial: Option<Denial>,
}

impl Decision {
    fn unlimited(policy: &ResolvedPolicy) -> Self {
        Self {
            action: policy.action,
            tier: policy.tier,
            allowed: true,
            limit: None,
            remaining: None,
            retry_after: None,
            resets_at: None,
            reset_after: None,
            denial: None,
        }
    }

    fn tier_gated(policy: &ResolvedPolicy, required_tier: Option<Tier>) -> Self {
        Self {
            action: policy.action,
            tier: policy.tier,
            allowed: false,
            limit: Some(0),
            remaining: Some(0),
            retry_after: None,
            resets_at: None,
            reset_after: None,
            denial: Some(Denial::TierGateRejected { required_tier }),
        }
    }

    pub fn is_tier_gated(&self) -> bool {
        matches!(self.denial, Some(Denial::TierGateRejected { .. }))
    }

    /// Whole seconds, rounded up, as sent in `Retry-After`.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after
            .map(|d| d.as_secs() + u64::from(d.subsec_nanos() > 0))
    }
}

/// Handle for an admitted two-phase attempt. Hand it back to `commit` when
/// the attempt failed, or to `release` when it succeeded. Only the store knows
/// whether `id` is still outstanding, so a forged or replayed handle refunds
/// nothing.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    pub subject: Subject,
    pub action: ActionKind,
    pub tier: Tier,
}

/// Read-only view of a subject's usage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageReport {
    pub action: ActionKind,
    pub tier: Tier,
    pub used: u64,
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
    pub window_start: Option<DateTime<Utc>>,
    pub resets_at: Option<DateTime<Utc>>,
}

pub struct QuotaEvaluator {
    policies: PolicyTable,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
}

impl QuotaEvaluator {
    pub fn new(policies: PolicyTable, store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            policies,
            store,
            clock,
        }
    }

    /// Checks and, if allowed, consumes one unit of `action` for `subject`.
    pub async fn check(
        &self,
        subject: Subject,
        action: ActionKind,
        tier: Tier,
    ) -> Result<Decision, QuotaError> {
        self.check_at(subject, action, tier, self.clock.now()).await
    }

    pub async fn check_at(
        &self,
        subject: Subject,
        action: ActionKind,
        tier: Tier,
        now: DateTime<Utc>,
    ) -> Result<Decision, QuotaError> {
        let (decision, _) = self.admit(subject, action, tier, now).await?;
        Ok(decision)
    }

    /// First phase for actions that only charge failures: the attempt is
    /// counted up front and refunded by `release` if it succeeds.
    pub async fn reserve(
        &self,
        subject: Subject,
        action: ActionKind,
        tier: Tier,
    ) -> Result<(Decision, Option<Reservation>), QuotaError> {
        let now = self.clock.now();
        let (decision, counter) = self.admit(subject, action, tier, now).await?;
        if !decision.allowed {
            return Ok((decision, None));
        }
        let reservation = Reservation {
            id: Uuid::new_v4(),
            subject,
            action,
            tier,
        };
        let policy = self.policies.limit_for(action, tier);
        if let (true, Some(counter)) = (policy.count_only_failures, counter) {
            let key = CounterKey::new(subject, action);
            let held = self
                .store
                .hold(&key, counter.window_start, reservation.id)
                .await
                .map_err(|e| store_fault(&key, e))?;
            if !held {
                debug!("Window for {key} renewed before reservation was recorded");
            }
        }
        Ok((decision, Some(reservation)))
    }

    /// The attempt failed; its unit stays charged and the reservation can no
    /// longer be released.
    pub async fn commit(&self, reservation: Reservation) -> Result<(), QuotaError> {
        let policy = self.policies.limit_for(reservation.action, reservation.tier);
        if !policy.count_only_failures {
            return Ok(());
        }
        let key = CounterKey::new(reservation.subject, reservation.action);
        let settled = self
            .store
            .settle(&key, reservation.id)
            .await
            .map_err(|e| store_fault(&key, e))?;
        debug!("Committed {key} attempt {} (outstanding: {settled})", reservation.id);
        Ok(())
    }

    /// The attempt succeeded. Refunds its unit when the action only charges
    /// failures and the reservation is still outstanding in the current
    /// window. Each reservation refunds at most once. Returns whether a
    /// refund happened.
    pub async fn release(&self, reservation: Reservation) -> Result<bool, QuotaError> {
        let policy = self.policies.limit_for(reservation.action, reservation.tier);
        if !policy.count_only_failures {
            debug!(
                "{} charges every attempt, keeping reservation for {}",
                reservation.action, reservation.subject
            );
            return Ok(false);
        }
        let key = CounterKey::new(reservation.subject, reservation.action);
        let refunded = self
            .store
            .decrement(&key, reservation.id)
            .await
            .map_err(|e| store_fault(&key, e))?;
        if refunded.is_none() {
            warn!("Refused refund for {key}: reservation {} is not outstanding", reservation.id);
        }
        Ok(refunded.is_some())
    }

    /// A resource capped by `action` was destroyed, so its slot is given
    /// back regardless of window. Only actions whose policy is refundable
    /// accept this. Returns whether a unit was returned.
    pub async fn refund(
        &self,
        subject: Subject,
        action: ActionKind,
        tier: Tier,
    ) -> Result<bool, QuotaError> {
        let policy = self.policies.limit_for(action, tier);
        if !policy.refundable {
            debug!("{action} is not refundable, ignoring refund for {subject}");
            return Ok(false);
        }
        let key = CounterKey::new(subject, action);
        let counter = self
            .store
            .refund(&key)
            .await
            .map_err(|e| store_fault(&key, e))?;
        Ok(counter.is_some())
    }

    /// Current usage without consuming anything.
    pub async fn status(
        &self,
        subject: Subject,
        action: ActionKind,
        tier: Tier,
    ) -> Result<UsageReport, QuotaError> {
        let now = self.clock.now();
        let policy = self.policies.limit_for(action, tier);
        let limit = match policy.limit.allowance {
            Allowance::Limited(n) => Some(n),
            Allowance::Unlimited => None,
        };
        let window = policy.limit.window;
        let key = CounterKey::new(subject, action);
        let observed = self
            .store
            .peek(&key)
            .await
            .map_err(|e| store_fault(&key, e))?;
        let current_start = window::current_window_start(observed.as_ref(), window, now);
        let counter = observed.filter(|c| c.window_start == current_start);

        let used = counter.map_or(0, |c| c.count);
        Ok(UsageReport {
            action,
            tier,
            used,
            limit,
            remaining: limit.map(|max| max.saturating_sub(used)),
            window_start: counter.map(|c| c.window_start),
            resets_at: counter.map(|c| window::window_end(c.window_start, window)),
        })
    }

    async fn admit(
        &self,
        subject: Subject,
        action: ActionKind,
        tier: Tier,
        now: DateTime<Utc>,
    ) -> Result<(Decision, Option<QuotaCounter>), QuotaError> {
        let policy = self.policies.limit_for(action, tier);
        let max = match policy.limit.allowance {
            Allowance::Unlimited => return Ok((Decision::unlimited(&policy), None)),
            Allowance::Limited(0) => {
                let required = self.policies.required_tier(action);
                debug!("{action} is not available on the {tier} tier (requires {required:?})");
                return Ok((Decision::tier_gated(&policy, required), None));
            }
            Allowance::Limited(n) => n,
        };

        let window = policy.limit.window;
        let key = CounterKey::new(subject, action);
        let fault = |e| store_fault(&key, e);

        let observed = self.store.peek(&key).await.map_err(fault)?;
        let counter = if window::is_expired(observed.as_ref(), window, now) {
            self.store
                .reset_and_increment(
                    &key,
                    observed.map(|c| c.window_start),
                    now,
                    window::retention(window, now),
                )
                .await
                .map_err(fault)?
        } else {
            match self.store.try_increment(&key).await {
                Ok(counter) => counter,
                Err(StoreError::NotFound(_)) => {
                    debug!("Counter {key} disappeared mid-check, starting a fresh window");
                    self.store
                        .reset_and_increment(&key, None, now, window::retention(window, now))
                        .await
                        .map_err(fault)?
                }
                Err(e) => return Err(fault(e)),
            }
        };

        let window_end = window::window_end(counter.window_start, window);
        let resets_at = Some(window_end);
        let reset_after = (window_end - now).max(chrono::Duration::zero()).to_std().ok();
        let decision = if counter.count <= max {
            Decision {
                action,
                tier,
                allowed: true,
                limit: Some(max),
                remaining: Some(max - counter.count),
                retry_after: None,
                resets_at,
                reset_after,
                denial: None,
            }
        } else {
            if policy.refundable {
                // Resource caps count what exists, not what was attempted.
                self.store.refund(&key).await.map_err(fault)?;
            }
            let wait = window::retry_after(counter.window_start, window, now);
            debug!(
                "{key} exhausted ({} > {max}), retry in {}s",
                counter.count,
                wait.num_seconds()
            );
            Decision {
                action,
                tier,
                allowed: false,
                limit: Some(max),
                remaining: Some(0),
                retry_after: Some(wait.to_std().unwrap_or_default()),
                resets_at,
                reset_after,
                denial: Some(Denial::QuotaExhausted),
            }
        };

        Ok((decision, Some(counter)))
    }
}

fn store_fault(key: &CounterKey, err: StoreError) -> QuotaError {
    error!("Quota store failure for {key}: {err}");
    QuotaError::StoreUnavailable(err)
}
