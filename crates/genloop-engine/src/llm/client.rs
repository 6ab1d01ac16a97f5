//! HTTP backend speaking both wire formats.
//!
//! The [`Backend`] trait is the seam between the generation cycle and the
//! network.  A call is fully described by a [`BackendRequest`] plus a
//! [`Target`] naming where to send it and which secret to present, so the
//! same client serves the pooled official endpoint and every custom endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::llm::types::{BackendReply, BackendRequest, WireFormat};
use crate::llm::{native, openai};

// ---------------------------------------------------------------------------
// Target
// ---------------------------------------------------------------------------

/// Where a request goes and how it authenticates.
#[derive(Clone)]
pub struct Target {
    /// Base URL of the endpoint.
    pub base_url: String,
    /// Wire format the endpoint speaks.
    pub wire_format: WireFormat,
    /// Credential presented to the endpoint.
    pub secret: String,
}

impl Target {
    pub fn new(base_url: impl Into<String>, wire_format: WireFormat, secret: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            wire_format,
            secret: secret.into(),
        }
    }
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Target")
            .field("base_url", &self.base_url)
            .field("wire_format", &self.wire_format)
            .field("secret", &mask_secret(&self.secret))
            .finish()
    }
}

/// Short label for a secret that is safe to log: `...` plus the last four
/// characters.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    let tail: String = chars[chars.len().saturating_sub(4)..].iter().collect();
    format!("...{tail}")
}

// ---------------------------------------------------------------------------
// Backend trait
// ---------------------------------------------------------------------------

/// Sends one request to a generative backend.
///
/// Implementations classify failures into [`EngineError`] variants so callers
/// can tell throttling from an invalid credential from anything else.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn send(&self, request: &BackendRequest, target: &Target) -> Result<BackendReply>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// [`Backend`] over HTTPS using `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    http: reqwest::Client,
}

impl HttpBackend {
    /// Create a backend whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Request {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { http })
    }

    fn headers(target: &Target) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        match target.wire_format {
            WireFormat::Native => {
                headers.insert(
                    "x-goog-api-key",
                    HeaderValue::from_str(&target.secret).map_err(|e| EngineError::Request {
                        reason: format!("invalid API key header: {e}"),
                    })?,
                );
            }
            WireFormat::Openai => {
                headers.insert(
                    AUTHORIZATION,
                    HeaderValue::from_str(&format!("Bearer {}", target.secret)).map_err(|e| {
                        EngineError::Request {
                            reason: format!("invalid authorization header: {e}"),
                        }
                    })?,
                );
            }
        }
        Ok(headers)
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn send(&self, request: &BackendRequest, target: &Target) -> Result<BackendReply> {
        let (url, body) = match target.wire_format {
            WireFormat::Native => (
                native::endpoint_url(&target.base_url, &request.model),
                native::build_request_body(request),
            ),
            WireFormat::Openai => (
                openai::endpoint_url(&target.base_url),
                openai::build_request_body(request),
            ),
        };

        tracing::debug!(
            url = %url,
            model = %request.model,
            wire_format = ?target.wire_format,
            credential = %mask_secret(&target.secret),
            turns = request.turns.len(),
            "sending backend request"
        );

        let resp = self
            .http
            .post(&url)
            .headers(Self::headers(target)?)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| EngineError::Request {
            reason: format!("failed to read response body: {e}"),
        })?;

        if !status.is_success() {
            return Err(EngineError::from_status(status.as_u16(), &text));
        }

        let v: Value = serde_json::from_str(&text).map_err(|e| EngineError::Parse {
            reason: format!("invalid JSON response: {e}"),
        })?;

        match target.wire_format {
            WireFormat::Native => native::parse_response(&v),
            WireFormat::Openai => openai::parse_response(&v),
        }
    }
}
