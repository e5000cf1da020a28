//! Failed-attempt accounting.
//!
//! `SentinelPolicy` is a pure transition function over [`AttemptLedger`];
//! `AccountSentinel` applies it to the stored profile with compare-and-swap
//! and performs the side effects (admin alert on lockout, erasure on
//! destruction). Lockout expiry is a time predicate evaluated on every read,
//! so no timer is needed for `LockedOut -> Active`.
//!
//! Every verification reserves its attempt before hashing. The gate counts
//! reservations as if they had already failed, so concurrent guesses can
//! never hash more codes than the account has attempts left.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};
use wd_proto::{AttemptLedger, GuardState, InFlight, UserSecurityProfile};

use crate::clock::Clock;
use crate::config::{LifetimeFailurePolicy, TrustConfig};
use crate::eraser::{scrub_profile, AccountEraser};
use crate::error::Result;
use crate::notify::{AdminAlert, AdminNotifier};
use crate::profiles::Profiles;

/// Answer to "may I attempt now?".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Allow { remaining_attempts: u32 },
    LockedOut { until: DateTime<Utc> },
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Counted { remaining_attempts: u32 },
    LockedOut { until: DateTime<Utc> },
    Destroyed { at: DateTime<Utc> },
}

/// Outcome of claiming an attempt ahead of the hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// The caller may hash and must report back with a success, a failure
    /// or a release.
    Granted,
    LockedOut { until: DateTime<Utc> },
    Destroyed,
    /// Every remaining attempt is already being checked elsewhere.
    Saturated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentinelPolicy {
    pub lockout_threshold: u32,
    pub lockout_duration: Duration,
    pub destruction_threshold: u32,
    pub lifetime: LifetimeFailurePolicy,
    pub attempt_lease: Duration,
}

impl From<&TrustConfig> for SentinelPolicy {
    fn from(c: &TrustConfig) -> Self {
        Self {
            lockout_threshold: c.lockout_threshold,
            lockout_duration: c.lockout_duration(),
            destruction_threshold: c.destruction_threshold,
            lifetime: c.lifetime_failure_policy,
            attempt_lease: c.attempt_lease(),
        }
    }
}

impl Default for SentinelPolicy {
    fn default() -> Self {
        Self::from(&TrustConfig::default())
    }
}

impl SentinelPolicy {
    /// Apply lockout expiry: an elapsed lockout reads as `Active` with a
    /// cleared consecutive counter. Reservations past their lease are
    /// dropped.
    pub fn settle(&self, ledger: &AttemptLedger, now: DateTime<Utc>) -> AttemptLedger {
        let mut next = ledger.clone();
        if let GuardState::LockedOut { until } = next.state {
            if until <= now {
                next.state = GuardState::Active { failed_attempts: 0 };
            }
        }
        if next
            .in_flight
            .is_some_and(|f| f.last_reserved_at + self.attempt_lease <= now)
        {
            next.in_flight = None;
        }
        next
    }

    /// Claim one attempt. Granted only while the attempts left, minus
    /// those already in flight, are above zero.
    pub fn reserve(&self, ledger: &AttemptLedger, now: DateTime<Utc>) -> (AttemptLedger, Reservation) {
        let mut next = self.settle(ledger, now);
        match next.state {
            GuardState::LockedOut { until } => (next, Reservation::LockedOut { until }),
            GuardState::Destroyed { .. } => (next, Reservation::Destroyed),
            GuardState::Active { failed_attempts } => {
                let pending = next.in_flight_count();
                let left = self.remaining(
                    failed_attempts.saturating_add(pending),
                    next.total_failed_attempts.saturating_add(pending),
                );
                if left == 0 {
                    return (next, Reservation::Saturated);
                }
                next.in_flight = Some(InFlight {
                    count: pending + 1,
                    last_reserved_at: now,
                });
                (next, Reservation::Granted)
            }
        }
    }

    /// Give back a reservation without counting it.
    pub fn release(&self, ledger: &AttemptLedger, now: DateTime<Utc>) -> AttemptLedger {
        let mut next = self.settle(ledger, now);
        release_one(&mut next);
        next
    }

    pub fn gate(&self, ledger: &AttemptLedger, now: DateTime<Utc>) -> Gate {
        let settled = self.settle(ledger, now);
        match settled.state {
            GuardState::Active { failed_attempts } => Gate::Allow {
                remaining_attempts: self.remaining(failed_attempts, settled.total_failed_attempts),
            },
            GuardState::LockedOut { until } => Gate::LockedOut { until },
            GuardState::Destroyed { .. } => Gate::Destroyed,
        }
    }

    /// Count a wrong guess, consuming one reservation if any is held.
    pub fn on_failure(&self, ledger: &AttemptLedger, now: DateTime<Utc>) -> (AttemptLedger, FailureOutcome) {
        let mut next = self.settle(ledger, now);
        release_one(&mut next);
        let failed = match next.state {
            GuardState::Destroyed { at } => return (next, FailureOutcome::Destroyed { at }),
            // Only reachable when attempts race a lockout; the guess still counts.
            GuardState::LockedOut { .. } => None,
            GuardState::Active { failed_attempts } => Some(failed_attempts.saturating_add(1)),
        };
        next.total_failed_attempts = next.total_failed_attempts.saturating_add(1);
        next.last_failure_at = Some(now);

        if next.total_failed_attempts >= self.destruction_threshold {
            next.state = GuardState::Destroyed { at: now };
            return (next, FailureOutcome::Destroyed { at: now });
        }
        let Some(failed) = failed else {
            let until = next.lockout_until().unwrap_or(now);
            return (next, FailureOutcome::LockedOut { until });
        };
        if failed >= self.lockout_threshold {
            let until = now + self.lockout_duration;
            next.state = GuardState::LockedOut { until };
            return (next, FailureOutcome::LockedOut { until });
        }
        next.state = GuardState::Active { failed_attempts: failed };
        let remaining_attempts = self.remaining(failed, next.total_failed_attempts);
        (next, FailureOutcome::Counted { remaining_attempts })
    }

    /// Clears the consecutive counter and consumes one reservation. A
    /// success that raced a lockout or destruction clears nothing else.
    pub fn on_success(&self, ledger: &AttemptLedger, now: DateTime<Utc>) -> AttemptLedger {
        let mut next = self.settle(ledger, now);
        release_one(&mut next);
        if let GuardState::Active { .. } = next.state {
            next.state = GuardState::Active { failed_attempts: 0 };
            if self.lifetime == LifetimeFailurePolicy::ResetOnSuccess {
                next.total_failed_attempts = 0;
            }
        }
        next
    }

    fn remaining(&self, failed: u32, total: u32) -> u32 {
        let before_lockout = self.lockout_threshold.saturating_sub(failed);
        let before_destruction = self.destruction_threshold.saturating_sub(total);
        before_lockout.min(before_destruction)
    }
}

fn release_one(ledger: &mut AttemptLedger) {
    ledger.in_flight = match ledger.in_flight {
        Some(f) if f.count > 1 => Some(InFlight {
            count: f.count - 1,
            ..f
        }),
        _ => None,
    };
}

/// Store-backed sentinel shared by every verification path.
#[derive(Clone)]
pub struct AccountSentinel {
    profiles: Profiles,
    clock: Arc<dyn Clock>,
    policy: SentinelPolicy,
    notifier: Arc<dyn AdminNotifier>,
    eraser: AccountEraser,
}

impl AccountSentinel {
    pub fn new(
        profiles: Profiles,
        clock: Arc<dyn Clock>,
        policy: SentinelPolicy,
        notifier: Arc<dyn AdminNotifier>,
        eraser: AccountEraser,
    ) -> Self {
        Self {
            profiles,
            clock,
            policy,
            notifier,
            eraser,
        }
    }

    pub fn policy(&self) -> &SentinelPolicy {
        &self.policy
    }

    pub async fn record_failure(&self, user_id: &str) -> Result<FailureOutcome> {
        let now = self.clock.now();
        let policy = self.policy;
        let (profile, (outcome, newly_locked, newly_destroyed)) = self
            .profiles
            .mutate(user_id, |p| {
                let before = policy.settle(&p.attempts, now);
                let (ledger, outcome) = policy.on_failure(&p.attempts, now);
                let newly_locked = matches!(outcome, FailureOutcome::LockedOut { .. })
                    && before.lockout_until().is_none();
                let newly_destroyed = matches!(outcome, FailureOutcome::Destroyed { .. })
                    && !matches!(before.state, GuardState::Destroyed { .. });
                p.attempts = ledger;
                if newly_destroyed {
                    scrub_profile(p);
                }
                p.updated_at = now;
                Ok((outcome, newly_locked, newly_destroyed))
            })
            .await?;

        match outcome {
            FailureOutcome::Counted { remaining_attempts } => {
                info!(user_id = %user_id, remaining_attempts, "passcode failure recorded");
            }
            FailureOutcome::LockedOut { until } if newly_locked => {
                warn!(user_id = %user_id, until = %until, "account locked out");
                self.notifier
                    .notify(AdminAlert::AccountLockedOut {
                        user_id: user_id.to_owned(),
                        until,
                        total_failed_attempts: profile.attempts.total_failed_attempts,
                    })
                    .await;
            }
            FailureOutcome::LockedOut { .. } => {}
            FailureOutcome::Destroyed { at } if newly_destroyed => {
                error!(user_id = %user_id, "destruction threshold reached; erasing account data");
                self.notifier
                    .notify(AdminAlert::AccountDestroyed {
                        user_id: user_id.to_owned(),
                        at,
                    })
                    .await;
                if let Err(err) = self.eraser.erase(user_id).await {
                    // The sweep finishes message and chat removal for
                    // destroyed accounts.
                    error!(user_id = %user_id, error = %err, "account erasure incomplete");
                    return Err(err);
                }
            }
            FailureOutcome::Destroyed { .. } => {}
        }
        Ok(outcome)
    }

    /// Reserve an attempt ahead of hashing. Returns the profile as written
    /// so the caller hashes against the current credential.
    pub async fn reserve_attempt(&self, user_id: &str) -> Result<(UserSecurityProfile, Reservation)> {
        let now = self.clock.now();
        let policy = self.policy;
        let (profile, reservation) = self
            .profiles
            .mutate(user_id, |p| {
                let (next, reservation) = policy.reserve(&p.attempts, now);
                if next != p.attempts {
                    p.attempts = next;
                    p.updated_at = now;
                }
                Ok(reservation)
            })
            .await?;
        if reservation == Reservation::Saturated {
            debug!(user_id = %user_id, "all remaining attempts are in flight");
        }
        Ok((profile, reservation))
    }

    pub async fn release_attempt(&self, user_id: &str) -> Result<()> {
        let now = self.clock.now();
        let policy = self.policy;
        self.profiles
            .mutate(user_id, |p| {
                let next = policy.release(&p.attempts, now);
                if next != p.attempts {
                    p.attempts = next;
                    p.updated_at = now;
                }
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Record a matching guess. The returned gate is the state after the
    /// write; anything but `Allow` means the account was locked or
    /// destroyed while the hash ran and the success must not be honoured.
    pub async fn record_success(&self, user_id: &str) -> Result<Gate> {
        let now = self.clock.now();
        let policy = self.policy;
        let (profile, _) = self
            .profiles
            .mutate(user_id, |p| {
                let next = policy.on_success(&p.attempts, now);
                if next != p.attempts {
                    p.attempts = next;
                    p.updated_at = now;
                }
                Ok(())
            })
            .await?;
        Ok(policy.gate(&profile.attempts, now))
    }

    /// Persist `Active` for every lockout that has elapsed. Reads already
    /// treat them as expired; this keeps stored state tidy for listings.
    pub async fn release_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut released = 0;
        for profile in self.profiles.list().await? {
            let Some(until) = profile.attempts.lockout_until() else {
                continue;
            };
            if until > now {
                continue;
            }
            let policy = self.policy;
            let (_, changed) = self
                .profiles
                .mutate(&profile.user_id, |p| {
                    let next = policy.settle(&p.attempts, now);
                    let changed = next != p.attempts;
                    if changed {
                        p.attempts = next;
                        p.updated_at = now;
                    }
                    Ok(changed)
                })
                .await?;
            if changed {
                info!(user_id = %profile.user_id, "lockout expired");
                released += 1;
            }
        }
        Ok(released)
    }
}
