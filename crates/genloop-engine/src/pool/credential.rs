//! Per-credential health state and the penalty curve.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::config::PoolConfig;
use crate::llm::client::mask_secret;

/// Observable state of a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialState {
    Available,
    CoolingDown,
    /// Terminal.  The credential is never handed out again.
    Disabled,
}

impl std::fmt::Display for CredentialState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Available => f.write_str("available"),
            Self::CoolingDown => f.write_str("cooling_down"),
            Self::Disabled => f.write_str("disabled"),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Credential {
    pub secret: String,
    pub label: String,
    pub penalty: u32,
    pub cooldown_until: Option<Instant>,
    pub consecutive_failures: u32,
    pub last_used: Option<Instant>,
    pub disabled: bool,
}

impl Credential {
    pub fn new(secret: String) -> Self {
        Self {
            label: mask_secret(&secret),
            secret,
            penalty: 0,
            cooldown_until: None,
            consecutive_failures: 0,
            last_used: None,
            disabled: false,
        }
    }

    pub fn state(&self, now: Instant) -> CredentialState {
        if self.disabled {
            CredentialState::Disabled
        } else if self.cooldown_until.is_some_and(|until| until > now) {
            CredentialState::CoolingDown
        } else {
            CredentialState::Available
        }
    }

    pub fn is_eligible(&self, now: Instant) -> bool {
        self.state(now) == CredentialState::Available
    }

    /// Start a cooldown scaled by `penalty`.
    pub fn cool_down(&mut self, penalty: u32, config: &PoolConfig, now: Instant) {
        self.cooldown_until = Some(now + cooldown_for(penalty, config));
    }

    /// Disable the credential if its penalty crossed the threshold.  Returns
    /// whether this call disabled it.
    pub fn check_threshold(&mut self, config: &PoolConfig) -> bool {
        if !self.disabled && self.penalty > config.disable_threshold {
            self.disabled = true;
            return true;
        }
        false
    }
}

/// Cooldown produced by a penalty.
///
/// Grows super-linearly, `unit * p * (100 + p) / 100`, capped at the
/// configured maximum and never shorter than one millisecond.
pub fn cooldown_for(penalty: u32, config: &PoolConfig) -> Duration {
    let p = u128::from(penalty);
    let unit_ms = config.cooldown_unit().as_millis();
    let ms = unit_ms.saturating_mul(p).saturating_mul(100 + p) / 100;
    let capped = ms.min(config.max_cooldown().as_millis()).max(1);
    Duration::from_millis(u64::try_from(capped).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cooldown_is_monotonic_in_penalty() {
        let config = PoolConfig::default();
        let mut previous = Duration::ZERO;
        for p in 0..=300 {
            let d = cooldown_for(p, &config);
            assert!(d >= previous, "cooldown shrank at penalty {p}");
            assert!(d > Duration::ZERO);
            previous = d;
        }
    }

    #[test]
    fn cooldown_curve_and_cap() {
        let config = PoolConfig::default();
        assert_eq!(cooldown_for(10, &config), Duration::from_secs(11));
        assert_eq!(cooldown_for(30, &config), Duration::from_secs(39));
        assert_eq!(cooldown_for(10_000, &config), config.max_cooldown());
    }

    #[test]
    fn state_follows_cooldown_and_disable() {
        let now = Instant::now();
        let mut cred = Credential::new("secret-abcd".into());
        assert_eq!(cred.label, "...abcd");
        assert_eq!(cred.state(now), CredentialState::Available);

        cred.cooldown_until = Some(now + Duration::from_secs(5));
        assert_eq!(cred.state(now), CredentialState::CoolingDown);
        assert_eq!(
            cred.state(now + Duration::from_secs(5)),
            CredentialState::Available
        );

        cred.disabled = true;
        assert_eq!(
            cred.state(now + Duration::from_secs(3600)),
            CredentialState::Disabled
        );
    }

    #[test]
    fn threshold_disables_once() {
        let config = PoolConfig::default();
        let mut cred = Credential::new("k".into());
        cred.penalty = config.disable_threshold;
        assert!(!cred.check_threshold(&config));
        cred.penalty += 1;
        assert!(cred.check_threshold(&config));
        assert!(!cred.check_threshold(&config));
        assert!(cred.disabled);
    }
}
