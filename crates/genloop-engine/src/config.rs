//! Engine configuration and its reload lifecycle.
//!
//! [`EngineConfig`] is loaded once at start from a TOML (or JSON) file, with
//! a default for every field.  [`ConfigManager`] owns the live copy: callers
//! take cheap [`Arc`] snapshots, an explicit [`ConfigManager::reload`]
//! re-reads the file, and subscribers are told about every change over a
//! broadcast channel.  Nothing mutates the configuration behind the
//! manager's back.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::error::{EngineError, Result};
use crate::llm::types::{GenerationParams, SafetyRating, WireFormat};

/// Environment variable replacing the official credential list.
pub const ENV_API_KEYS: &str = "GENLOOP_API_KEYS";

/// Environment variable replacing the official base URL.
pub const ENV_BASE_URL: &str = "GENLOOP_BASE_URL";

// ---------------------------------------------------------------------------
// Config model
// ---------------------------------------------------------------------------

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Model used when a request names none, and on the fallback path.
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Upper bound on backend calls per generation session.
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,

    /// Sessions allowed to run at the same time.
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    /// Timeout for one backend HTTP request.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Timeout for one tool invocation.
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,

    /// Endpoint alias that every request is routed to first, whatever model
    /// it asks for.
    #[serde(default)]
    pub override_endpoint: Option<String>,

    #[serde(default)]
    pub official: OfficialConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Safety probability bucket → reputation penalty.
    #[serde(default = "default_safety_penalties")]
    pub safety_penalties: BTreeMap<String, u32>,

    /// Custom endpoints keyed by model alias.
    #[serde(default)]
    pub endpoints: BTreeMap<String, EndpointConfig>,

    /// Per-model sampling parameters; `default` applies to unlisted models.
    #[serde(default)]
    pub generation: BTreeMap<String, GenerationParams>,

    #[serde(default)]
    pub apologies: ApologyConfig,

    /// Emotion placeholder name → presentation token.
    #[serde(default)]
    pub emotions: BTreeMap<String, String>,

    #[serde(default)]
    pub tools: ToolsConfig,
}

fn default_model() -> String {
    "gemini-2.5-flash".into()
}

fn default_max_tool_rounds() -> u32 {
    5
}

fn default_max_concurrent_requests() -> usize {
    50
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_tool_timeout_secs() -> u64 {
    60
}

fn default_safety_penalties() -> BTreeMap<String, u32> {
    [("NEGLIGIBLE", 0), ("LOW", 5), ("MEDIUM", 15), ("HIGH", 30)]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v))
        .collect()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            max_tool_rounds: default_max_tool_rounds(),
            max_concurrent_requests: default_max_concurrent_requests(),
            request_timeout_secs: default_request_timeout_secs(),
            tool_timeout_secs: default_tool_timeout_secs(),
            override_endpoint: None,
            official: OfficialConfig::default(),
            pool: PoolConfig::default(),
            retry: RetryConfig::default(),
            safety_penalties: default_safety_penalties(),
            endpoints: BTreeMap::new(),
            generation: BTreeMap::new(),
            apologies: ApologyConfig::default(),
            emotions: BTreeMap::new(),
            tools: ToolsConfig::default(),
        }
    }
}

/// The official, credential-pooled endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OfficialConfig {
    pub base_url: String,
    pub wire_format: WireFormat,
    /// API credentials rotated by the pool.
    pub credentials: Vec<String>,
}

impl Default for OfficialConfig {
    fn default() -> Self {
        Self {
            base_url: "https://generativelanguage.googleapis.com".into(),
            wire_format: WireFormat::Native,
            credentials: Vec::new(),
        }
    }
}

/// Credential scoring constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Penalty per consecutive retryable failure.
    pub base_penalty: u32,
    /// Penalty removed by each successful release.
    pub success_decay: u32,
    /// Penalty applied to a safety block when its ratings carry none.
    pub safety_block_penalty: u32,
    /// Above this penalty a credential is disabled for good.
    pub disable_threshold: u32,
    /// Cooldown time unit, scaled by the penalty curve.
    pub cooldown_unit_ms: u64,
    /// Longest cooldown any penalty can produce.
    pub max_cooldown_secs: u64,
    /// Longest time `acquire` waits for a credential to cool down.
    pub acquire_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            base_penalty: 10,
            success_decay: 5,
            safety_block_penalty: 5,
            disable_threshold: 100,
            cooldown_unit_ms: 1_000,
            max_cooldown_secs: 600,
            acquire_timeout_secs: 60,
        }
    }
}

impl PoolConfig {
    pub fn cooldown_unit(&self) -> Duration {
        Duration::from_millis(self.cooldown_unit_ms)
    }

    pub fn max_cooldown(&self) -> Duration {
        Duration::from_secs(self.max_cooldown_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

/// Retry budgets and delays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts on one credential before a retryable failure is scored.
    pub attempts_per_credential: u32,
    pub retry_delay_ms: u64,
    /// Calls made when the backend keeps answering with nothing.
    pub empty_response_attempts: u32,
    /// Attempts against a custom endpoint before falling back.
    pub custom_endpoint_attempts: u32,
    pub custom_endpoint_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts_per_credential: 3,
            retry_delay_ms: 1_000,
            empty_response_attempts: 2,
            custom_endpoint_attempts: 2,
            custom_endpoint_delay_ms: 1_000,
        }
    }
}

impl RetryConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn custom_endpoint_delay(&self) -> Duration {
        Duration::from_millis(self.custom_endpoint_delay_ms)
    }
}

/// A named custom endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub url: String,
    pub key: String,
    /// Model identifier as the endpoint knows it.
    pub model: String,
    #[serde(default = "default_endpoint_wire_format")]
    pub wire_format: WireFormat,
}

fn default_endpoint_wire_format() -> WireFormat {
    WireFormat::Openai
}

/// In-character texts returned instead of raw errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApologyConfig {
    pub overloaded: String,
    pub unexpected: String,
    pub safety_blocked: String,
    pub stuck: String,
    pub not_understood: String,
}

impl Default for ApologyConfig {
    fn default() -> Self {
        Self {
            overloaded: "I'm swamped right now, come find me again in a little while!".into(),
            unexpected: "Sorry, something went sideways on my end. Please try again later.".into(),
            safety_blocked: "I'd rather not talk about that one. Let's change the subject?".into(),
            stuck: "I got stuck thinking that through. Could you ask me again?".into(),
            not_understood: "Hmm, I didn't quite catch that. Could you say it another way?".into(),
        }
    }
}

/// Global tool switches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Never declared, never run.
    pub disabled: BTreeSet<String>,
    /// Not declared to the model but still runnable when called.
    pub hidden: BTreeSet<String>,
}

impl EngineConfig {
    /// Parse a config document, choosing the format from the file extension.
    pub fn from_str_with_format(content: &str, path: &Path) -> Result<Self> {
        if path.extension().and_then(|s| s.to_str()) == Some("json") {
            serde_json::from_str(content).map_err(|e| EngineError::Config {
                reason: format!("failed to parse JSON config: {e}"),
            })
        } else {
            toml::from_str(content).map_err(|e| EngineError::Config {
                reason: format!("failed to parse TOML config: {e}"),
            })
        }
    }

    /// Read, parse, apply environment overrides and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| EngineError::Config {
            reason: format!("failed to read config file {}: {e}", path.display()),
        })?;
        let mut config = Self::from_str_with_format(&content, path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply [`ENV_API_KEYS`] and [`ENV_BASE_URL`] if set.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(keys) = std::env::var(ENV_API_KEYS) {
            self.official.credentials = parse_key_list(&keys);
        }
        if let Ok(url) = std::env::var(ENV_BASE_URL) {
            let url = url.trim();
            if !url.is_empty() {
                self.official.base_url = url.to_owned();
            }
        }
    }

    /// Normalise and check the configuration.
    ///
    /// Blank and duplicate credentials are dropped.  An empty credential list
    /// is accepted here; it only becomes fatal when the pool is built.
    pub fn validate(&mut self) -> Result<()> {
        let mut seen = BTreeSet::new();
        self.official.credentials = std::mem::take(&mut self.official.credentials)
            .into_iter()
            .map(|k| k.trim().to_owned())
            .filter(|k| !k.is_empty() && seen.insert(k.clone()))
            .collect();

        for (alias, endpoint) in &self.endpoints {
            if endpoint.url.trim().is_empty() || endpoint.key.trim().is_empty() {
                return Err(EngineError::Config {
                    reason: format!("endpoint `{alias}` needs both a url and a key"),
                });
            }
            if endpoint.model.trim().is_empty() {
                return Err(EngineError::Config {
                    reason: format!("endpoint `{alias}` needs a model"),
                });
            }
        }

        if let Some(alias) = &self.override_endpoint {
            if !self.endpoints.contains_key(alias) {
                return Err(EngineError::Config {
                    reason: format!("override_endpoint `{alias}` is not a configured endpoint"),
                });
            }
        }

        if self.max_tool_rounds == 0 {
            return Err(EngineError::Config {
                reason: "max_tool_rounds must be at least 1".into(),
            });
        }
        if self.max_concurrent_requests == 0 {
            return Err(EngineError::Config {
                reason: "max_concurrent_requests must be at least 1".into(),
            });
        }

        Ok(())
    }

    /// Sampling parameters for a model, falling back to the `default` entry.
    pub fn generation_params(&self, model: &str) -> GenerationParams {
        self.generation
            .get(model)
            .or_else(|| self.generation.get("default"))
            .cloned()
            .unwrap_or_default()
    }

    /// Reputation penalty carried by a set of safety ratings.
    pub fn safety_penalty(&self, ratings: &[SafetyRating]) -> u32 {
        ratings
            .iter()
            .map(|r| {
                self.safety_penalties
                    .get(&r.probability.to_uppercase())
                    .copied()
                    .unwrap_or(0)
            })
            .sum()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}

/// Split a comma-separated key list, stripping quotes and line breaks.
pub fn parse_key_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|k| {
            k.replace(['\r', '\n'], "")
                .trim()
                .trim_matches(|c| c == '"' || c == '\'')
                .trim()
                .to_owned()
        })
        .filter(|k| !k.is_empty())
        .collect()
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Configuration change notification.
#[derive(Debug, Clone)]
pub enum ConfigChange {
    /// The file was re-read; the new snapshot is attached.
    Reloaded(Arc<EngineConfig>),
    /// The config was replaced programmatically.
    Replaced(Arc<EngineConfig>),
}

/// Owns the live configuration.
#[derive(Debug)]
pub struct ConfigManager {
    config: RwLock<Arc<EngineConfig>>,
    config_path: Option<PathBuf>,
    change_tx: broadcast::Sender<ConfigChange>,
}

impl ConfigManager {
    /// Manage an in-memory configuration with no backing file.
    pub fn new(config: EngineConfig) -> Self {
        let (change_tx, _) = broadcast::channel(16);
        Self {
            config: RwLock::new(Arc::new(config)),
            config_path: None,
            change_tx,
        }
    }

    /// Load a configuration file and manage it.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = EngineConfig::load(&path)?;
        info!(
            path = ?path,
            credentials = config.official.credentials.len(),
            endpoints = config.endpoints.len(),
            "configuration loaded"
        );
        let mut manager = Self::new(config);
        manager.config_path = Some(path);
        Ok(manager)
    }

    /// The current configuration snapshot.
    pub fn current(&self) -> Arc<EngineConfig> {
        self.config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Re-read the backing file.  On failure the current config stays.
    pub fn reload(&self) -> Result<Arc<EngineConfig>> {
        let Some(path) = &self.config_path else {
            return Err(EngineError::Config {
                reason: "no configuration file path set".into(),
            });
        };

        let config = match EngineConfig::load(path) {
            Ok(c) => Arc::new(c),
            Err(e) => {
                warn!(path = ?path, error = %e, "configuration reload failed, keeping current");
                return Err(e);
            }
        };

        *self.config.write().unwrap_or_else(|e| e.into_inner()) = config.clone();
        let _ = self.change_tx.send(ConfigChange::Reloaded(config.clone()));
        info!(path = ?path, "configuration reloaded");
        Ok(config)
    }

    /// Replace the configuration programmatically.
    pub fn replace(&self, mut config: EngineConfig) -> Result<Arc<EngineConfig>> {
        config.validate()?;
        let config = Arc::new(config);
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = config.clone();
        let _ = self.change_tx.send(ConfigChange::Replaced(config.clone()));
        info!("configuration replaced");
        Ok(config)
    }

    /// Subscribe to configuration changes.
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.change_tx.subscribe()
    }

    pub fn path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn empty_document_gives_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.max_tool_rounds, 5);
        assert_eq!(config.max_concurrent_requests, 50);
        assert_eq!(config.retry.attempts_per_credential, 3);
        assert_eq!(config.retry.custom_endpoint_attempts, 2);
        assert_eq!(config.pool.disable_threshold, 100);
        assert_eq!(config.safety_penalties.get("HIGH"), Some(&30));
        assert_eq!(config.official.wire_format, WireFormat::Native);
    }

    #[test]
    fn full_toml_document_parses() {
        let config: EngineConfig = toml::from_str(
            r#"
default_model = "base-model"
max_tool_rounds = 4

[official]
credentials = ["k1", "k2"]

[pool]
base_penalty = 20

[endpoints.fast]
url = "https://compat.test/v1"
key = "ek"
model = "fast-v2"

[endpoints.native]
url = "https://native.test"
key = "nk"
model = "n1"
wire_format = "native"

[generation.default]
temperature = 1.0
max_output_tokens = 6000

[generation.fast]
temperature = 0.3

[generation.fast.thinking]
include_thoughts = true
budget = -1

[emotions]
happy = "<:happy:1>"

[tools]
hidden = ["secret_tool"]
"#,
        )
        .unwrap();

        assert_eq!(config.default_model, "base-model");
        assert_eq!(config.pool.base_penalty, 20);
        assert_eq!(config.pool.success_decay, 5);
        assert_eq!(config.endpoints["fast"].wire_format, WireFormat::Openai);
        assert_eq!(config.endpoints["native"].wire_format, WireFormat::Native);
        assert_eq!(config.generation_params("fast").temperature, Some(0.3));
        assert_eq!(
            config.generation_params("fast").thinking.unwrap().budget,
            Some(-1)
        );
        assert_eq!(
            config.generation_params("other").max_output_tokens,
            Some(6000)
        );
        assert!(config.tools.hidden.contains("secret_tool"));
    }

    #[test]
    fn validate_dedupes_credentials() {
        let mut config = EngineConfig::default();
        config.official.credentials = vec![" a ".into(), "".into(), "b".into(), "a".into()];
        config.validate().unwrap();
        assert_eq!(config.official.credentials, vec!["a", "b"]);
    }

    #[test]
    fn validate_rejects_incomplete_endpoint() {
        let mut config = EngineConfig::default();
        config.endpoints.insert(
            "broken".into(),
            EndpointConfig {
                url: "https://x.test".into(),
                key: "".into(),
                model: "m".into(),
                wire_format: WireFormat::Openai,
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_unknown_override() {
        let mut config = EngineConfig::default();
        config.override_endpoint = Some("nowhere".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn key_list_parsing_strips_noise() {
        assert_eq!(
            parse_key_list("\"k1\", 'k2' ,k3\r\n,,"),
            vec!["k1", "k2", "k3"]
        );
    }

    #[test]
    fn safety_penalty_sums_ratings() {
        let config = EngineConfig::default();
        let ratings = vec![
            SafetyRating {
                category: "HARASSMENT".into(),
                probability: "LOW".into(),
            },
            SafetyRating {
                category: "HATE_SPEECH".into(),
                probability: "MEDIUM".into(),
            },
            SafetyRating {
                category: "DANGEROUS_CONTENT".into(),
                probability: "NEGLIGIBLE".into(),
            },
        ];
        assert_eq!(config.safety_penalty(&ratings), 20);
        assert_eq!(config.safety_penalty(&[]), 0);
    }

    #[test]
    fn manager_loads_and_reloads_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, "max_tool_rounds = 3\n").unwrap();

        let manager = ConfigManager::load(&path).unwrap();
        assert_eq!(manager.current().max_tool_rounds, 3);

        let mut rx = manager.subscribe();
        std::fs::write(&path, "max_tool_rounds = 7\n").unwrap();
        manager.reload().unwrap();
        assert_eq!(manager.current().max_tool_rounds, 7);
        assert!(matches!(rx.try_recv(), Ok(ConfigChange::Reloaded(_))));
    }

    #[test]
    fn failed_reload_keeps_current() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, "max_tool_rounds = 3\n").unwrap();

        let manager = ConfigManager::load(&path).unwrap();
        std::fs::write(&path, "max_tool_rounds = \"many\"\n").unwrap();
        assert!(manager.reload().is_err());
        assert_eq!(manager.current().max_tool_rounds, 3);
    }

    #[test]
    fn json_config_by_extension() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{ "default_model": "json-model" }"#).unwrap();
        let manager = ConfigManager::load(&path).unwrap();
        assert_eq!(manager.current().default_model, "json-model");
    }

    #[test]
    fn in_memory_manager_cannot_reload() {
        let manager = ConfigManager::new(EngineConfig::default());
        assert!(manager.reload().is_err());
        assert!(manager.path().is_none());
    }
}
