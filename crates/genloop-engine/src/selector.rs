//! Endpoint selection and credential leasing.
//!
//! [`with_lease`] wraps any single-attempt call in acquire → call → release,
//! retrying throttled attempts on the same credential before rotating to
//! another.  [`PooledCaller`] and [`DirectCaller`] turn a backend into a
//! [`Caller`] for the generation cycle, and [`EndpointSelector`] decides per
//! request which of them drives the cycle, falling back from a custom
//! endpoint to the pooled path at most once.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{EndpointConfig, EngineConfig, RetryConfig};
use crate::error::Result;
use crate::llm::client::{Backend, Target};
use crate::llm::types::{BackendReply, BackendRequest, BackendResponse, GenerationParams};
use crate::pool::{CredentialPool, ReleaseOutcome};

// ---------------------------------------------------------------------------
// with_lease
// ---------------------------------------------------------------------------

/// Retry budget for [`with_lease`].
#[derive(Debug, Clone, Copy)]
pub struct LeasePolicy {
    /// Attempts on one credential before a throttled credential is scored.
    pub attempts_per_credential: u32,
    /// Pause between attempts on the same credential.
    pub retry_delay: Duration,
    /// No new credential is acquired after this instant.
    pub deadline: Instant,
}

impl LeasePolicy {
    pub fn new(retry: &RetryConfig, acquire_timeout: Duration) -> Self {
        Self {
            attempts_per_credential: retry.attempts_per_credential.max(1),
            retry_delay: retry.retry_delay(),
            deadline: Instant::now() + acquire_timeout,
        }
    }
}

/// Run `call` with credentials leased from `pool`.
///
/// - `Ok` releases with the outcome chosen by `score` and returns.
/// - A retryable error is retried on the same credential up to
///   `attempts_per_credential` times, then the credential is released as
///   throttled and another is acquired.
/// - An invalid-credential error disables the credential and another is
///   acquired.
/// - Any other error releases the credential unpenalised and is returned.
///
/// Acquisition failures (every credential disabled, or nothing cools down
/// before the policy deadline) are returned as they are.
pub async fn with_lease<T, S, F, Fut>(
    pool: &CredentialPool,
    policy: &LeasePolicy,
    score: S,
    mut call: F,
) -> Result<T>
where
    S: Fn(&T) -> ReleaseOutcome,
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    loop {
        let lease = pool.acquire_until(policy.deadline).await?;
        let mut attempt = 0u32;

        let outcome = loop {
            attempt += 1;
            debug!(
                credential = %lease.label(),
                attempt,
                max_attempts = policy.attempts_per_credential,
                "leased attempt"
            );

            match call(lease.secret().to_owned()).await {
                Ok(value) => {
                    let outcome = score(&value);
                    pool.release(lease, outcome);
                    return Ok(value);
                }
                Err(e) if e.is_retryable() => {
                    if attempt < policy.attempts_per_credential {
                        warn!(
                            credential = %lease.label(),
                            attempt,
                            error = %e,
                            "retryable backend error, retrying same credential"
                        );
                        tokio::time::sleep(policy.retry_delay).await;
                        continue;
                    }
                    warn!(
                        credential = %lease.label(),
                        attempts = attempt,
                        error = %e,
                        "retries exhausted, rotating credential"
                    );
                    break ReleaseOutcome::Throttled;
                }
                Err(e) if e.is_credential_invalid() => {
                    error!(credential = %lease.label(), error = %e, "credential rejected by backend");
                    break ReleaseOutcome::Invalid;
                }
                Err(e) => {
                    error!(credential = %lease.label(), error = %e, "unexpected backend failure");
                    pool.release(lease, ReleaseOutcome::SUCCESS);
                    return Err(e);
                }
            }
        };

        pool.release(lease, outcome);
    }
}

/// Pool outcome for a backend reply: safety blocks cost their severity
/// penalty, answers cost the reputation of their safety ratings.
pub fn score_reply(reply: &BackendReply, config: &EngineConfig) -> ReleaseOutcome {
    let rated = config.safety_penalty(&reply.safety_ratings);
    match reply.response {
        BackendResponse::SafetyBlocked(_) => ReleaseOutcome::SafetyBlocked {
            penalty: rated.max(config.pool.safety_block_penalty),
        },
        _ => ReleaseOutcome::Success {
            safety_penalty: rated,
        },
    }
}

/// Send `request`, calling again on the same target while the backend
/// answers with nothing, up to `attempts` calls in total.
async fn send_until_not_empty(
    backend: &dyn Backend,
    request: &BackendRequest,
    target: &Target,
    attempts: u32,
) -> Result<BackendReply> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        let reply = backend.send(request, target).await?;
        if !reply.is_empty() || attempt >= attempts {
            return Ok(reply);
        }
        debug!(attempt, model = %request.model, "empty backend reply, retrying");
        attempt += 1;
    }
}

// ---------------------------------------------------------------------------
// Callers
// ---------------------------------------------------------------------------

/// One backend round-trip as the generation cycle sees it.
#[async_trait]
pub trait Caller: Send + Sync {
    async fn call(&self, request: &BackendRequest) -> Result<BackendReply>;
}

/// Calls the official endpoint with credentials from the pool.
pub struct PooledCaller {
    backend: Arc<dyn Backend>,
    pool: Arc<CredentialPool>,
    config: Arc<EngineConfig>,
}

impl PooledCaller {
    pub fn new(
        backend: Arc<dyn Backend>,
        pool: Arc<CredentialPool>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            backend,
            pool,
            config,
        }
    }
}

#[async_trait]
impl Caller for PooledCaller {
    async fn call(&self, request: &BackendRequest) -> Result<BackendReply> {
        let config = &*self.config;
        let policy = LeasePolicy::new(&config.retry, self.pool.config().acquire_timeout());
        let backend = &*self.backend;

        with_lease(
            &self.pool,
            &policy,
            |reply: &BackendReply| score_reply(reply, config),
            |secret| {
                let target = Target::new(
                    config.official.base_url.clone(),
                    config.official.wire_format,
                    secret,
                );
                async move {
                    send_until_not_empty(
                        backend,
                        request,
                        &target,
                        config.retry.empty_response_attempts,
                    )
                    .await
                }
            },
        )
        .await
    }
}

/// Calls a custom endpoint with its own fixed key.
pub struct DirectCaller {
    backend: Arc<dyn Backend>,
    target: Target,
    empty_attempts: u32,
}

impl DirectCaller {
    pub fn new(backend: Arc<dyn Backend>, endpoint: &EndpointConfig, empty_attempts: u32) -> Self {
        Self {
            backend,
            target: Target::new(endpoint.url.clone(), endpoint.wire_format, endpoint.key.clone()),
            empty_attempts,
        }
    }
}

#[async_trait]
impl Caller for DirectCaller {
    async fn call(&self, request: &BackendRequest) -> Result<BackendReply> {
        send_until_not_empty(&*self.backend, request, &self.target, self.empty_attempts).await
    }
}

// ---------------------------------------------------------------------------
// Selector
// ---------------------------------------------------------------------------

/// Everything a generation cycle needs to talk to one route.
#[derive(Clone)]
pub struct CallPlan {
    pub caller: Arc<dyn Caller>,
    /// Model identifier sent to the backend.
    pub model: String,
    pub params: GenerationParams,
    /// Human-readable route name for logs.
    pub route: String,
}

/// Chooses between a custom endpoint and the pooled official path.
pub struct EndpointSelector {
    backend: Arc<dyn Backend>,
    pool: Arc<CredentialPool>,
    config: Arc<EngineConfig>,
}

impl EndpointSelector {
    pub fn new(
        backend: Arc<dyn Backend>,
        pool: Arc<CredentialPool>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            backend,
            pool,
            config,
        }
    }

    /// The custom endpoint a request should try first, if any.
    pub fn custom_route(&self, requested_model: Option<&str>) -> Option<(&str, &EndpointConfig)> {
        let alias = self
            .config
            .override_endpoint
            .as_deref()
            .or_else(|| requested_model.filter(|m| self.config.endpoints.contains_key(*m)))?;
        self.config
            .endpoints
            .get_key_value(alias)
            .map(|(k, v)| (k.as_str(), v))
    }

    fn custom_plan(&self, alias: &str, endpoint: &EndpointConfig) -> CallPlan {
        CallPlan {
            caller: Arc::new(DirectCaller::new(
                self.backend.clone(),
                endpoint,
                self.config.retry.empty_response_attempts,
            )),
            model: endpoint.model.clone(),
            params: self.config.generation_params(alias),
            route: format!("endpoint:{alias}"),
        }
    }

    fn pooled_plan(&self, model: &str) -> CallPlan {
        CallPlan {
            caller: Arc::new(PooledCaller::new(
                self.backend.clone(),
                self.pool.clone(),
                self.config.clone(),
            )),
            model: model.to_owned(),
            params: self.config.generation_params(model),
            route: "official".into(),
        }
    }

    /// Run `cycle` against the route chosen for `requested_model`.
    ///
    /// A custom endpoint gets `custom_endpoint_attempts` tries with a fixed
    /// delay between them; if all fail, `cycle` runs exactly once more on the
    /// pooled path with the default model and whatever that returns is final.
    pub async fn run<T, F, Fut>(&self, requested_model: Option<&str>, mut cycle: F) -> Result<T>
    where
        F: FnMut(CallPlan) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let Some((alias, endpoint)) = self.custom_route(requested_model) else {
            let model = requested_model.unwrap_or(&self.config.default_model);
            return cycle(self.pooled_plan(model)).await;
        };

        let plan = self.custom_plan(alias, endpoint);
        let attempts = self.config.retry.custom_endpoint_attempts.max(1);
        for attempt in 1..=attempts {
            match cycle(plan.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(
                        endpoint = alias,
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "custom endpoint attempt failed"
                    );
                    if attempt < attempts {
                        tokio::time::sleep(self.config.retry.custom_endpoint_delay()).await;
                    }
                }
            }
        }

        info!(
            endpoint = alias,
            fallback_model = %self.config.default_model,
            "custom endpoint exhausted, falling back to official path"
        );
        cycle(self.pooled_plan(&self.config.default_model)).await
    }
}
