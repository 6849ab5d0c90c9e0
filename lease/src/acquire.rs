// Acquire driver: fetch, decide, conditionally commit, retry on conflict.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    allocator::{self, AcquireRequest, Allocation, DEFAULT_LEASE_DURATION},
    codec,
    slot::{Ledger, Slot, SlotId, Version},
    store::LeaseStore,
    time::{Clock, SystemClock},
    Error, Result,
};

/// Bounds the conflict-retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    #[serde(with = "millis")]
    pub initial_backoff: Duration,
    #[serde(with = "millis")]
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_backoff: Duration::from_millis(25),
            max_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Retry immediately, up to `max_attempts` attempts in total.
    pub fn no_backoff(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Upper bound of the sleep after the `attempt`-th conflict (1-based):
    /// doubles from `initial_backoff` and is capped at `max_backoff`.
    pub fn backoff_ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Full jitter: uniform in `[0, ceiling]`.
    fn backoff(&self, attempt: u32) -> Duration {
        let ceiling = self.backoff_ceiling(attempt);
        if ceiling.is_zero() {
            return ceiling;
        }
        let nanos = u64::try_from(ceiling.as_nanos()).unwrap_or(u64::MAX);
        Duration::from_nanos(rand::thread_rng().gen_range(0..=nanos))
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// A slot that has been committed to the ledger for the caller.
///
/// This is what the provisioning side consumes; it only needs the shape and
/// region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantedSlot {
    pub slot: Slot,
    /// Ledger version produced by the commit.
    pub version: Version,
    /// Set when an expired lease was taken over.
    pub evicted: Option<String>,
    /// Attempts used, including the successful one.
    pub attempts: u32,
}

impl GrantedSlot {
    pub fn id(&self) -> SlotId {
        self.slot.id()
    }

    pub fn shape(&self) -> &str {
        self.slot.shape()
    }

    pub fn region(&self) -> &str {
        self.slot.region()
    }

    /// Name for the compute instance backing this slot.
    pub fn instance_name(&self) -> String {
        format!("ephemeral-{}", self.slot.id())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Granted(GrantedSlot),
    /// No vacancy and no expired lease. Nothing was written.
    Exhausted,
}

impl AcquireOutcome {
    pub fn granted(&self) -> Option<&GrantedSlot> {
        match self {
            AcquireOutcome::Granted(granted) => Some(granted),
            AcquireOutcome::Exhausted => None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, AcquireOutcome::Exhausted)
    }
}

/// Result of one fetch-decide-commit pass.
enum Attempt {
    Committed(GrantedSlot),
    Exhausted,
    Conflicted,
}

/// Hands out slots from the shared ledger behind `store`.
///
/// Holds no ledger state of its own; every attempt decodes a fresh copy, so
/// one coordinator can serve any number of concurrent callers.
#[derive(Debug, Clone)]
pub struct LeaseCoordinator {
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    lease_duration: Duration,
}

impl LeaseCoordinator {
    pub fn new(store: Arc<dyn LeaseStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            retry: RetryPolicy::default(),
            lease_duration: DEFAULT_LEASE_DURATION,
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    /// Current ledger as stored, without changing it.
    pub async fn ledger(&self) -> Result<Ledger> {
        let fetched = self.store.get().await?;
        codec::decode(&fetched.content, fetched.version)
    }

    /// Acquire a slot for `tenant`.
    ///
    /// Conflicting commits are retried from a fresh read up to the retry
    /// budget, then fail with `ContentionFailed`. Every other error is
    /// returned as is.
    pub async fn acquire(&self, tenant: &str, build_number: u64) -> Result<AcquireOutcome> {
        let request =
            AcquireRequest::new(tenant, build_number).with_duration(self.lease_duration);
        request.validate()?;

        let max_attempts = self.retry.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            match self.attempt(&request, attempt).await? {
                Attempt::Committed(granted) => {
                    info!(
                        "slot {} ({} @ {}) leased to {} build {}",
                        granted.id(),
                        granted.shape(),
                        granted.region(),
                        request.tenant,
                        request.build_number
                    );
                    return Ok(AcquireOutcome::Granted(granted));
                }
                Attempt::Exhausted => {
                    info!("no lease available for {}", request.tenant);
                    return Ok(AcquireOutcome::Exhausted);
                }
                Attempt::Conflicted if attempt < max_attempts => {
                    let pause = self.retry.backoff(attempt);
                    debug!(
                        "attempt {}/{} conflicted, retrying in {:?}",
                        attempt, max_attempts, pause
                    );
                    if !pause.is_zero() {
                        tokio::time::sleep(pause).await;
                    }
                }
                Attempt::Conflicted => {}
            }
        }

        warn!(
            "giving up on a lease for {} after {} conflicting attempts",
            request.tenant, max_attempts
        );
        Err(Error::ContentionFailed {
            attempts: max_attempts,
        })
    }

    /// [`acquire`](Self::acquire) bounded by an overall deadline covering all
    /// retries.
    pub async fn acquire_within(
        &self,
        timeout: Duration,
        tenant: &str,
        build_number: u64,
    ) -> Result<AcquireOutcome> {
        tokio::time::timeout(timeout, self.acquire(tenant, build_number))
            .await
            .map_err(|_| Error::Timeout(timeout))?
    }

    async fn attempt(&self, request: &AcquireRequest, attempt: u32) -> Result<Attempt> {
        // Fetching
        let fetched = self.store.get().await?;
        debug!("attempt {}: fetched ledger version {}", attempt, fetched.version);
        let mut ledger = codec::decode(&fetched.content, fetched.version)?;

        // Deciding
        let now = self.clock.now();
        let allocation = allocator::allocate(&mut ledger, request, now)?;
        let (index, evicted) = match allocation {
            Allocation::Vacancy { index } => (index, None),
            Allocation::Eviction { index, evicted } => (index, Some(evicted)),
            Allocation::Exhausted => return Ok(Attempt::Exhausted),
        };

        // Committing
        let content = codec::encode(&ledger)?;
        match self.store.put(content, ledger.version()).await {
            Ok(version) => {
                debug!("attempt {}: committed as version {}", attempt, version);
                Ok(Attempt::Committed(GrantedSlot {
                    slot: ledger.slots()[index].clone(),
                    version,
                    evicted,
                    attempts: attempt,
                }))
            }
            Err(err) if err.is_conflict() => {
                warn!(
                    "attempt {}: ledger changed since version {}",
                    attempt,
                    ledger.version()
                );
                Ok(Attempt::Conflicted)
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(25),
            max_backoff: Duration::from_millis(150),
        };

        assert_eq!(policy.backoff_ceiling(1), Duration::from_millis(25));
        assert_eq!(policy.backoff_ceiling(2), Duration::from_millis(50));
        assert_eq!(policy.backoff_ceiling(3), Duration::from_millis(100));
        assert_eq!(policy.backoff_ceiling(4), Duration::from_millis(150));
        assert_eq!(policy.backoff_ceiling(40), Duration::from_millis(150));
    }

    #[test]
    fn test_jitter_stays_under_ceiling() {
        let policy = RetryPolicy::default();
        for attempt in 1..8 {
            assert!(policy.backoff(attempt) <= policy.backoff_ceiling(attempt));
        }
        assert_eq!(RetryPolicy::no_backoff(3).backoff(2), Duration::ZERO);
    }

    #[test]
    fn test_retry_policy_from_json() {
        let policy: RetryPolicy =
            serde_json::from_str(r#"{"max_attempts": 3, "max_backoff": 200}"#).unwrap();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_backoff, Duration::from_millis(25));
        assert_eq!(policy.max_backoff, Duration::from_millis(200));
    }

    #[test]
    fn test_instance_name() {
        let granted = GrantedSlot {
            slot: Slot::vacant(12, "VM.Standard2.1", "PHX-AD-1"),
            version: Version::from("v2"),
            evicted: None,
            attempts: 1,
        };
        assert_eq!(granted.instance_name(), "ephemeral-12");
        assert_eq!(granted.region(), "PHX-AD-1");
    }
}
