//! Credential pool.
//!
//! Hands out one credential per attempt and scores the outcome afterwards.
//!
//! ```text
//!            failure                     time elapses
//! AVAILABLE ─────────▶ COOLING_DOWN ──────────────────▶ AVAILABLE
//!     │                     │
//!     └──── destructive ────┴────▶ DISABLED   (terminal)
//! ```
//!
//! Leases are not exclusive: concurrent sessions may hold leases on the same
//! credential.  The pool's bookkeeping sits behind one mutex that is held only
//! for constant-size updates and never across an await point.

mod credential;

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::{EngineError, Result};

pub use credential::{CredentialState, cooldown_for};
use credential::Credential;

// ---------------------------------------------------------------------------
// Lease and outcome
// ---------------------------------------------------------------------------

/// A credential handed out by [`CredentialPool::acquire`].  Hand it back with
/// [`CredentialPool::release`].
pub struct Lease {
    secret: String,
    label: String,
}

impl Lease {
    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Masked label, safe to log.
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").field("label", &self.label).finish()
    }
}

/// How an attempt made with a lease went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The backend answered.  `safety_penalty` is the reputation cost of the
    /// safety ratings attached to the answer, usually zero.
    Success { safety_penalty: u32 },
    /// Retries on this credential ran out against throttling.
    Throttled,
    /// A safety classifier refused the request or the answer.
    SafetyBlocked { penalty: u32 },
    /// The backend rejected the credential itself.
    Invalid,
}

impl ReleaseOutcome {
    pub const SUCCESS: Self = Self::Success { safety_penalty: 0 };
}

/// Point-in-time view of one credential.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialStatus {
    pub label: String,
    pub state: CredentialState,
    pub penalty: u32,
    pub consecutive_failures: u32,
    /// Time left until the credential is eligible again.
    pub cooldown_remaining: Option<Duration>,
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct PoolState {
    credentials: Vec<Credential>,
    config: PoolConfig,
}

impl PoolState {
    /// Lowest penalty wins; ties go to the least recently used credential,
    /// then to configuration order.
    fn select(&self, now: Instant) -> Option<usize> {
        self.credentials
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_eligible(now))
            .min_by_key(|(idx, c)| (c.penalty, c.last_used, *idx))
            .map(|(idx, _)| idx)
    }

    /// Earliest moment a cooling credential becomes eligible.  `None` when
    /// every credential is disabled.
    fn next_wake(&self) -> Option<Instant> {
        self.credentials
            .iter()
            .filter(|c| !c.disabled)
            .filter_map(|c| c.cooldown_until)
            .min()
    }
}

/// Shared pool of backend credentials.
#[derive(Debug)]
pub struct CredentialPool {
    state: Mutex<PoolState>,
}

impl CredentialPool {
    /// Build a pool.  An empty credential list is a fatal misconfiguration.
    pub fn new(secrets: Vec<String>, config: PoolConfig) -> Result<Self> {
        if secrets.is_empty() {
            return Err(EngineError::NoCredentials);
        }
        let credentials: Vec<Credential> = secrets.into_iter().map(Credential::new).collect();
        info!(credentials = credentials.len(), "credential pool ready");
        Ok(Self {
            state: Mutex::new(PoolState {
                credentials,
                config,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().credentials.is_empty()
    }

    pub fn config(&self) -> PoolConfig {
        self.lock().config.clone()
    }

    /// Acquire a credential, waiting at most the configured acquire timeout.
    pub async fn acquire(&self) -> Result<Lease> {
        let timeout = self.lock().config.acquire_timeout();
        self.acquire_until(Instant::now() + timeout).await
    }

    /// Acquire a credential, suspending while every credential cools down.
    ///
    /// Fails with [`EngineError::PoolExhausted`] when the nearest cooldown
    /// ends after `deadline` or every credential is disabled.
    pub async fn acquire_until(&self, deadline: Instant) -> Result<Lease> {
        let started = Instant::now();
        loop {
            let wake_at = {
                let mut state = self.lock();
                if state.credentials.is_empty() {
                    return Err(EngineError::NoCredentials);
                }

                let now = Instant::now();
                if let Some(idx) = state.select(now) {
                    let cred = &mut state.credentials[idx];
                    cred.last_used = Some(now);
                    debug!(credential = %cred.label, penalty = cred.penalty, "credential acquired");
                    return Ok(Lease {
                        secret: cred.secret.clone(),
                        label: cred.label.clone(),
                    });
                }

                state.next_wake()
            };

            let waited_ms = millis(started.elapsed());
            let Some(wake_at) = wake_at else {
                warn!("every credential is disabled");
                return Err(EngineError::PoolExhausted { waited_ms });
            };
            if wake_at > deadline {
                warn!(waited_ms, "no credential cools down before the acquire deadline");
                return Err(EngineError::PoolExhausted { waited_ms });
            }

            debug!(
                wait_ms = millis(wake_at.saturating_duration_since(Instant::now())),
                "all credentials cooling down, waiting"
            );
            tokio::time::sleep_until(wake_at).await;
        }
    }

    /// Score the outcome of an attempt made with `lease`.
    pub fn release(&self, lease: Lease, outcome: ReleaseOutcome) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let config = &state.config;
        let Some(cred) = state
            .credentials
            .iter_mut()
            .find(|c| c.secret == lease.secret)
        else {
            debug!(credential = %lease.label, "released credential no longer in pool");
            return;
        };

        let now = Instant::now();
        match outcome {
            ReleaseOutcome::Success { safety_penalty } => {
                cred.consecutive_failures = 0;
                cred.penalty = cred.penalty.saturating_sub(config.success_decay);
                if safety_penalty > 0 {
                    cred.penalty = safety_capped(cred.penalty, safety_penalty, config);
                    warn!(
                        credential = %cred.label,
                        safety_penalty,
                        penalty = cred.penalty,
                        "safety ratings penalised credential"
                    );
                }
            }
            ReleaseOutcome::Throttled => {
                cred.consecutive_failures = cred.consecutive_failures.saturating_add(1);
                let progressive = config.base_penalty.saturating_mul(cred.consecutive_failures);
                cred.penalty = cred.penalty.max(progressive);
                cred.cool_down(cred.penalty, config, now);
                warn!(
                    credential = %cred.label,
                    consecutive_failures = cred.consecutive_failures,
                    penalty = cred.penalty,
                    cooldown_ms = millis(cooldown_for(cred.penalty, config)),
                    "credential throttled, cooling down"
                );
            }
            ReleaseOutcome::SafetyBlocked { penalty } => {
                cred.penalty = safety_capped(cred.penalty, penalty, config);
                cred.cool_down(penalty.min(config.disable_threshold), config, now);
                warn!(
                    credential = %cred.label,
                    safety_penalty = penalty,
                    penalty = cred.penalty,
                    "credential hit a safety block"
                );
            }
            ReleaseOutcome::Invalid => {
                cred.penalty = config.disable_threshold.saturating_add(1);
                cred.cool_down(cred.penalty, config, now);
            }
        }

        // Only transport failures can disable; safety scores stop at the threshold.
        let destructive = matches!(outcome, ReleaseOutcome::Throttled | ReleaseOutcome::Invalid);
        if destructive && cred.check_threshold(config) {
            warn!(credential = %cred.label, penalty = cred.penalty, "credential disabled");
        }
    }

    /// Swap in a new credential list.  Secrets already present keep their
    /// state; new ones start available; missing ones are dropped.
    pub fn replace_credentials(&self, secrets: Vec<String>) -> Result<()> {
        if secrets.is_empty() {
            return Err(EngineError::NoCredentials);
        }
        let mut state = self.lock();
        let mut previous = std::mem::take(&mut state.credentials);
        let mut kept = 0usize;
        state.credentials = secrets
            .into_iter()
            .map(|secret| match previous.iter().position(|c| c.secret == secret) {
                Some(pos) => {
                    kept += 1;
                    previous.swap_remove(pos)
                }
                None => Credential::new(secret),
            })
            .collect();
        info!(
            credentials = state.credentials.len(),
            kept,
            dropped = previous.len(),
            "credential pool replaced"
        );
        Ok(())
    }

    /// Replace the scoring constants.  Existing cooldowns are left as they are.
    pub fn set_config(&self, config: PoolConfig) {
        self.lock().config = config;
    }

    /// Status of every credential, in configuration order.
    pub fn snapshot(&self) -> Vec<CredentialStatus> {
        let state = self.lock();
        let now = Instant::now();
        state
            .credentials
            .iter()
            .map(|c| {
                let state = c.state(now);
                CredentialStatus {
                    label: c.label.clone(),
                    state,
                    penalty: c.penalty,
                    consecutive_failures: c.consecutive_failures,
                    cooldown_remaining: match state {
                        CredentialState::CoolingDown => c
                            .cooldown_until
                            .map(|until| until.saturating_duration_since(now)),
                        _ => None,
                    },
                }
            })
            .collect()
    }
}

/// Add a safety score without letting it reach the disable threshold.
fn safety_capped(penalty: u32, safety: u32, config: &PoolConfig) -> u32 {
    penalty.max(penalty.saturating_add(safety).min(config.disable_threshold))
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(keys: &[&str]) -> CredentialPool {
        CredentialPool::new(
            keys.iter().map(|k| k.to_string()).collect(),
            PoolConfig::default(),
        )
        .unwrap()
    }

    fn status<'a>(snapshot: &'a [CredentialStatus], label: &str) -> &'a CredentialStatus {
        snapshot.iter().find(|s| s.label == label).unwrap()
    }

    #[test]
    fn empty_pool_is_fatal() {
        let err = CredentialPool::new(vec![], PoolConfig::default()).unwrap_err();
        assert!(matches!(err, EngineError::NoCredentials));
    }

    #[tokio::test(start_paused = true)]
    async fn ties_rotate_least_recently_used() {
        let pool = pool(&["key-aaaa", "key-bbbb", "key-cccc"]);
        let mut seen = Vec::new();
        for _ in 0..6 {
            let lease = pool.acquire().await.unwrap();
            seen.push(lease.label().to_owned());
            pool.release(lease, ReleaseOutcome::SUCCESS);
            tokio::time::advance(Duration::from_millis(10)).await;
        }
        assert_eq!(
            seen,
            vec!["...aaaa", "...bbbb", "...cccc", "...aaaa", "...bbbb", "...cccc"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn lowest_penalty_wins() {
        let pool = pool(&["key-aaaa", "key-bbbb"]);
        let first = pool.acquire().await.unwrap();
        assert_eq!(first.label(), "...aaaa");
        pool.release(first, ReleaseOutcome::Success { safety_penalty: 15 });

        for _ in 0..3 {
            let lease = pool.acquire().await.unwrap();
            assert_eq!(lease.label(), "...bbbb");
            pool.release(lease, ReleaseOutcome::SUCCESS);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cooling_credential_is_never_returned_early() {
        let pool = pool(&["key-aaaa", "key-bbbb"]);
        let lease = pool.acquire().await.unwrap();
        assert_eq!(lease.label(), "...aaaa");
        pool.release(lease, ReleaseOutcome::Throttled);

        let cooldown = status(&pool.snapshot(), "...aaaa").cooldown_remaining.unwrap();
        assert!(cooldown > Duration::ZERO);

        // Make key-bbbb look worse than key-aaaa once it is eligible again.
        let b = pool.acquire().await.unwrap();
        pool.release(b, ReleaseOutcome::Success { safety_penalty: 50 });

        let lease = pool.acquire().await.unwrap();
        assert_eq!(lease.label(), "...bbbb");
        pool.release(lease, ReleaseOutcome::SUCCESS);

        tokio::time::advance(cooldown).await;
        let lease = pool.acquire().await.unwrap();
        assert_eq!(lease.label(), "...aaaa");
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_nearest_cooldown() {
        let pool = pool(&["key-aaaa"]);
        let lease = pool.acquire().await.unwrap();
        pool.release(lease, ReleaseOutcome::Throttled);

        let started = Instant::now();
        let lease = pool.acquire().await.unwrap();
        assert_eq!(lease.label(), "...aaaa");
        assert!(started.elapsed() >= cooldown_for(10, &PoolConfig::default()));
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_gives_up_at_deadline() {
        let pool = pool(&["key-aaaa"]);
        let lease = pool.acquire().await.unwrap();
        pool.release(lease, ReleaseOutcome::Throttled);

        let err = pool
            .acquire_until(Instant::now() + Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PoolExhausted { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_credential_is_disabled_forever() {
        let pool = pool(&["key-aaaa", "key-bbbb"]);
        let lease = pool.acquire().await.unwrap();
        pool.release(lease, ReleaseOutcome::Invalid);

        tokio::time::advance(Duration::from_secs(86_400)).await;
        for _ in 0..5 {
            let lease = pool.acquire().await.unwrap();
            assert_eq!(lease.label(), "...bbbb");
            pool.release(lease, ReleaseOutcome::SUCCESS);
        }

        let lease = pool.acquire().await.unwrap();
        pool.release(lease, ReleaseOutcome::Invalid);
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, EngineError::PoolExhausted { .. }));
        assert!(
            pool.snapshot()
                .iter()
                .all(|s| s.state == CredentialState::Disabled)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn penalty_grows_with_consecutive_failures() {
        let pool = pool(&["key-aaaa"]);
        let mut previous_penalty = 0;
        let mut previous_cooldown = Duration::ZERO;

        for k in 1..=10u32 {
            let lease = pool
                .acquire_until(Instant::now() + Duration::from_secs(3600))
                .await
                .unwrap();
            pool.release(lease, ReleaseOutcome::Throttled);

            let snap = pool.snapshot();
            let s = status(&snap, "...aaaa");
            assert_eq!(s.consecutive_failures, k);
            assert!(s.penalty >= previous_penalty);
            let cooldown = cooldown_for(s.penalty, &PoolConfig::default());
            assert!(cooldown >= previous_cooldown);
            previous_penalty = s.penalty;
            previous_cooldown = cooldown;
        }
        assert_eq!(previous_penalty, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn crossing_threshold_disables() {
        let pool = pool(&["key-aaaa"]);
        for _ in 0..11 {
            let Ok(lease) = pool
                .acquire_until(Instant::now() + Duration::from_secs(3600))
                .await
            else {
                break;
            };
            pool.release(lease, ReleaseOutcome::Throttled);
        }
        let snap = pool.snapshot();
        assert_eq!(snap[0].state, CredentialState::Disabled);
        assert_eq!(snap[0].penalty, 110);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_failures_and_never_goes_negative() {
        let pool = pool(&["key-aaaa"]);
        let lease = pool.acquire().await.unwrap();
        pool.release(lease, ReleaseOutcome::Throttled);

        let lease = pool.acquire().await.unwrap();
        pool.release(lease, ReleaseOutcome::SUCCESS);
        let s = pool.snapshot()[0].clone();
        assert_eq!(s.consecutive_failures, 0);
        assert_eq!(s.penalty, 5);

        for _ in 0..2 {
            let lease = pool.acquire().await.unwrap();
            pool.release(lease, ReleaseOutcome::SUCCESS);
        }
        let s = pool.snapshot()[0].clone();
        assert_eq!(s.penalty, 0);
        assert_eq!(s.consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn safety_block_costs_only_its_penalty() {
        let pool = pool(&["key-aaaa"]);
        let lease = pool.acquire().await.unwrap();
        pool.release(lease, ReleaseOutcome::SafetyBlocked { penalty: 5 });

        let s = pool.snapshot()[0].clone();
        assert_eq!(s.penalty, 5);
        assert_eq!(s.consecutive_failures, 0);
        assert_eq!(s.state, CredentialState::CoolingDown);
        assert!(s.cooldown_remaining.unwrap() <= cooldown_for(5, &PoolConfig::default()));

        tokio::time::advance(cooldown_for(5, &PoolConfig::default())).await;
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn severe_safety_block_only_cools_down() {
        let pool = pool(&["key-aaaa"]);
        let lease = pool.acquire().await.unwrap();
        pool.release(lease, ReleaseOutcome::SafetyBlocked { penalty: 120 });

        let s = pool.snapshot()[0].clone();
        assert_eq!(s.state, CredentialState::CoolingDown);
        assert_eq!(s.penalty, 100);
        assert_eq!(s.consecutive_failures, 0);

        tokio::time::advance(s.cooldown_remaining.unwrap()).await;
        let lease = pool.acquire().await.unwrap();
        assert_eq!(lease.label(), "...aaaa");
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_safety_scores_never_disable() {
        let pool = pool(&["key-aaaa"]);
        for _ in 0..40 {
            let lease = pool
                .acquire_until(Instant::now() + Duration::from_secs(3600))
                .await
                .unwrap();
            pool.release(lease, ReleaseOutcome::SafetyBlocked { penalty: 5 });
            let lease = pool
                .acquire_until(Instant::now() + Duration::from_secs(3600))
                .await
                .unwrap();
            pool.release(lease, ReleaseOutcome::Success { safety_penalty: 30 });
        }

        let s = pool.snapshot()[0].clone();
        assert_ne!(s.state, CredentialState::Disabled);
        assert!(s.penalty <= PoolConfig::default().disable_threshold);

        // Throttling on top of a saturated safety score still cannot disable
        // before the failures themselves cross the threshold.
        let lease = pool
            .acquire_until(Instant::now() + Duration::from_secs(3600))
            .await
            .unwrap();
        pool.release(lease, ReleaseOutcome::Throttled);
        assert_ne!(pool.snapshot()[0].state, CredentialState::Disabled);
    }

    #[tokio::test(start_paused = true)]
    async fn replace_keeps_state_of_surviving_secrets() {
        let pool = pool(&["key-aaaa", "key-bbbb"]);
        let lease = pool.acquire().await.unwrap();
        pool.release(lease, ReleaseOutcome::Invalid);

        pool.replace_credentials(vec!["key-aaaa".into(), "key-cccc".into()])
            .unwrap();
        let snap = pool.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(status(&snap, "...aaaa").state, CredentialState::Disabled);
        assert_eq!(status(&snap, "...cccc").state, CredentialState::Available);

        assert!(pool.replace_credentials(vec![]).is_err());
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn release_of_removed_secret_is_ignored() {
        let pool = pool(&["key-aaaa"]);
        let lease = pool.acquire().await.unwrap();
        pool.replace_credentials(vec!["key-bbbb".into()]).unwrap();
        pool.release(lease, ReleaseOutcome::Invalid);
        assert_eq!(pool.snapshot()[0].state, CredentialState::Available);
    }
}
