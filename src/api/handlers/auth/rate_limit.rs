//! Rate limiting primitives for auth flows.
//!
//! Limiters are in-memory and per process; they are not shared across replicas.

use governor::{
    Quota,
    clock::{Clock, DefaultClock},
    middleware::NoOpMiddleware,
    state::keyed::DefaultKeyedStateStore,
};
use std::{num::NonZeroU32, time::Duration};
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RateLimitAction {
    Login,
    Bootstrap,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited,
}

pub trait RateLimiter: Send + Sync {
    fn check(&self, identifier: &str, action: RateLimitAction) -> RateLimitDecision;

    /// Forget identifiers whose allowance has fully recovered.
    fn prune(&self) {}
}

#[derive(Clone, Debug)]
pub struct NoopRateLimiter;

impl RateLimiter for NoopRateLimiter {
    fn check(&self, _identifier: &str, _action: RateLimitAction) -> RateLimitDecision {
        RateLimitDecision::Allowed
    }
}

/// Capacity and refill window for one action.
#[derive(Clone, Copy, Debug)]
pub struct BucketLimit {
    pub capacity: u32,
    pub window: Duration,
}

impl BucketLimit {
    #[must_use]
    pub const fn per_minute(capacity: u32) -> Self {
        Self {
            capacity,
            window: Duration::from_secs(60),
        }
    }

    /// `capacity` cells per `window`, all available up front.
    fn quota(self) -> Option<Quota> {
        let burst = NonZeroU32::new(self.capacity)?;
        let period = self.window.checked_div(self.capacity)?;
        Quota::with_period(period).map(|quota| quota.allow_burst(burst))
    }
}

type KeyedLimiter<C> = governor::RateLimiter<
    String,
    DefaultKeyedStateStore<String>,
    C,
    NoOpMiddleware<<C as Clock>::Instant>,
>;

/// GCRA limiter per `(action, identifier)`.
///
/// An action configured with zero capacity rejects every request.
pub struct QuotaRateLimiter<C: Clock = DefaultClock> {
    login: Option<KeyedLimiter<C>>,
    bootstrap: Option<KeyedLimiter<C>>,
}

impl<C: Clock> std::fmt::Debug for QuotaRateLimiter<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaRateLimiter")
            .field("login", &self.login.is_some())
            .field("bootstrap", &self.bootstrap.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for QuotaRateLimiter {
    fn default() -> Self {
        Self::new(BucketLimit::per_minute(10), BucketLimit::per_minute(10))
    }
}

impl QuotaRateLimiter {
    #[must_use]
    pub fn new(login: BucketLimit, bootstrap: BucketLimit) -> Self {
        Self::with_clock(login, bootstrap, &DefaultClock::default())
    }
}

impl<C: Clock + Clone> QuotaRateLimiter<C> {
    #[must_use]
    pub fn with_clock(login: BucketLimit, bootstrap: BucketLimit, clock: &C) -> Self {
        let keyed = |limit: BucketLimit| {
            limit.quota().map(|quota| {
                governor::RateLimiter::new(quota, DefaultKeyedStateStore::default(), clock.clone())
            })
        };
        Self {
            login: keyed(login),
            bootstrap: keyed(bootstrap),
        }
    }

    fn limiter(&self, action: RateLimitAction) -> Option<&KeyedLimiter<C>> {
        match action {
            RateLimitAction::Login => self.login.as_ref(),
            RateLimitAction::Bootstrap => self.bootstrap.as_ref(),
        }
    }

    /// Identifiers currently holding state across both actions.
    #[must_use]
    pub fn tracked(&self) -> usize {
        [&self.login, &self.bootstrap]
            .into_iter()
            .flatten()
            .map(|limiter| limiter.len())
            .sum()
    }
}

impl<C> RateLimiter for QuotaRateLimiter<C>
where
    C: Clock + Clone + Send + Sync,
    C::Instant: Send + Sync,
{
    fn check(&self, identifier: &str, action: RateLimitAction) -> RateLimitDecision {
        let Some(limiter) = self.limiter(action) else {
            return RateLimitDecision::Limited;
        };
        if limiter.check_key(&identifier.to_string()).is_ok() {
            RateLimitDecision::Allowed
        } else {
            RateLimitDecision::Limited
        }
    }

    fn prune(&self) {
        let before = self.tracked();
        for limiter in [&self.login, &self.bootstrap].into_iter().flatten() {
            limiter.retain_recent();
            limiter.shrink_to_fit();
        }
        debug!(before, after = self.tracked(), "Pruned rate limiter state");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use governor::clock::FakeRelativeClock;

    fn fake(login: u32, bootstrap: u32) -> (QuotaRateLimiter<FakeRelativeClock>, FakeRelativeClock) {
        let clock = FakeRelativeClock::default();
        let limiter = QuotaRateLimiter::with_clock(
            BucketLimit::per_minute(login),
            BucketLimit::per_minute(bootstrap),
            &clock,
        );
        (limiter, clock)
    }

    #[test]
    fn noop_rate_limiter_allows() {
        let limiter = NoopRateLimiter;
        assert_eq!(
            limiter.check("203.0.113.1", RateLimitAction::Login),
            RateLimitDecision::Allowed
        );
    }

    #[test]
    fn login_allows_ten_per_minute() {
        let limiter = QuotaRateLimiter::default();
        for _ in 0..10 {
            assert_eq!(
                limiter.check("198.51.100.10", RateLimitAction::Login),
                RateLimitDecision::Allowed
            );
        }
        assert_eq!(
            limiter.check("198.51.100.10", RateLimitAction::Login),
            RateLimitDecision::Limited
        );
    }

    #[test]
    fn allowance_recovers_over_time() {
        let (limiter, clock) = fake(2, 2);
        let id = "10.0.0.1";
        assert_eq!(limiter.check(id, RateLimitAction::Login), RateLimitDecision::Allowed);
        assert_eq!(limiter.check(id, RateLimitAction::Login), RateLimitDecision::Allowed);
        assert_eq!(limiter.check(id, RateLimitAction::Login), RateLimitDecision::Limited);

        // One cell every 30 seconds.
        clock.advance(Duration::from_secs(31));
        assert_eq!(limiter.check(id, RateLimitAction::Login), RateLimitDecision::Allowed);
        assert_eq!(limiter.check(id, RateLimitAction::Login), RateLimitDecision::Limited);
    }

    #[test]
    fn identifiers_and_actions_are_independent() {
        let (limiter, _clock) = fake(1, 1);
        assert_eq!(limiter.check("a", RateLimitAction::Login), RateLimitDecision::Allowed);
        assert_eq!(limiter.check("a", RateLimitAction::Login), RateLimitDecision::Limited);
        assert_eq!(limiter.check("b", RateLimitAction::Login), RateLimitDecision::Allowed);
        assert_eq!(limiter.check("a", RateLimitAction::Bootstrap), RateLimitDecision::Allowed);
    }

    #[test]
    fn zero_capacity_always_limits() {
        let (limiter, _clock) = fake(0, 1);
        assert_eq!(limiter.check("a", RateLimitAction::Login), RateLimitDecision::Limited);
        assert_eq!(limiter.check("a", RateLimitAction::Bootstrap), RateLimitDecision::Allowed);
    }

    #[test]
    fn prune_drops_recovered_identifiers() {
        let (limiter, clock) = fake(10, 10);
        limiter.check("a", RateLimitAction::Login);
        clock.advance(Duration::from_secs(68));
        limiter.check("b", RateLimitAction::Login);
        assert_eq!(limiter.tracked(), 2);

        clock.advance(Duration::from_secs(2));
        limiter.prune();
        assert_eq!(limiter.tracked(), 1);
        assert_eq!(limiter.check("b", RateLimitAction::Login), RateLimitDecision::Allowed);
    }
}
