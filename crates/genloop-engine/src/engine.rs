//! The engine facade.
//!
//! [`Engine::generate`] is the single entry point hosts call.  It loads
//! history, asks the [`PromptBuilder`] for the initial conversation, lets the
//! [`EndpointSelector`] pick a route, runs the [`GenerationCycle`], and maps
//! whatever happened onto a small fixed set of outcomes.  Errors never leave
//! `generate`; they become in-character apologies.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::config::{ApologyConfig, EngineConfig};
use crate::error::{EngineError, Result};
use crate::llm::client::{Backend, HttpBackend};
use crate::llm::types::{Turn, Usage};
use crate::pool::{CredentialPool, CredentialStatus};
use crate::postprocess::PostProcessor;
use crate::runtime::{CycleOutcome, GenerationCycle, GenerationSession};
use crate::selector::EndpointSelector;
use crate::tools::{AllowAll, HostHandle, ToolContext, ToolExecutor, ToolPolicy, ToolRegistry};

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// Conversation history store.  Called at session boundaries only.
///
/// Storage failures are reported as [`EngineError::History`]; the engine
/// logs them and carries on without history.
#[async_trait]
pub trait History: Send + Sync {
    async fn load(&self, user_id: &str, room_id: &str) -> Result<Vec<Turn>>;

    /// Append the turns of a finished exchange.
    async fn save(&self, user_id: &str, room_id: &str, turns: Vec<Turn>) -> Result<()>;
}

/// Everything a prompt builder gets to work with.
#[derive(Debug, Clone, Copy)]
pub struct PromptInput<'a> {
    pub user_turn: &'a Turn,
    pub history: &'a [Turn],
    pub knowledge: &'a Value,
    pub affection: &'a Value,
    pub profile: &'a Value,
}

/// Builds the initial ordered conversation for a session.
#[async_trait]
pub trait PromptBuilder: Send + Sync {
    async fn build(&self, input: PromptInput<'_>) -> Result<Vec<Turn>>;
}

/// Process-local history keeping the most recent turns per user and room.
#[derive(Debug)]
pub struct InMemoryHistory {
    turns: DashMap<(String, String), Vec<Turn>>,
    max_turns: usize,
}

impl InMemoryHistory {
    pub fn new(max_turns: usize) -> Self {
        Self {
            turns: DashMap::new(),
            max_turns,
        }
    }
}

impl Default for InMemoryHistory {
    fn default() -> Self {
        Self::new(40)
    }
}

#[async_trait]
impl History for InMemoryHistory {
    async fn load(&self, user_id: &str, room_id: &str) -> Result<Vec<Turn>> {
        Ok(self
            .turns
            .get(&(user_id.to_owned(), room_id.to_owned()))
            .map(|t| t.value().clone())
            .unwrap_or_default())
    }

    async fn save(&self, user_id: &str, room_id: &str, turns: Vec<Turn>) -> Result<()> {
        if user_id.is_empty() || room_id.is_empty() {
            return Err(EngineError::History {
                reason: format!(
                    "cannot store turns without an owner (user `{user_id}`, room `{room_id}`)"
                ),
            });
        }
        let mut entry = self
            .turns
            .entry((user_id.to_owned(), room_id.to_owned()))
            .or_default();
        entry.extend(turns);
        let excess = entry.len().saturating_sub(self.max_turns);
        entry.drain(..excess);
        Ok(())
    }
}

/// Persona system turn, optional context blocks, history, then the user turn.
#[derive(Debug, Clone)]
pub struct BasicPromptBuilder {
    persona: String,
}

impl BasicPromptBuilder {
    pub fn new(persona: impl Into<String>) -> Self {
        Self {
            persona: persona.into(),
        }
    }
}

impl Default for BasicPromptBuilder {
    fn default() -> Self {
        Self::new("You are a friendly assistant chatting with people in a community.")
    }
}

#[async_trait]
impl PromptBuilder for BasicPromptBuilder {
    async fn build(&self, input: PromptInput<'_>) -> Result<Vec<Turn>> {
        let mut system = self.persona.clone();
        for (title, value) in [
            ("Relevant knowledge", input.knowledge),
            ("Relationship", input.affection),
            ("About the user", input.profile),
        ] {
            if !value.is_null() {
                system.push_str(&format!("\n\n{title}:\n{}", serde_json::to_string_pretty(value)?));
            }
        }

        let mut turns = Vec::with_capacity(input.history.len() + 2);
        turns.push(Turn::system(system));
        turns.extend(input.history.iter().cloned());
        turns.push(input.user_turn.clone());
        Ok(turns)
    }
}

// ---------------------------------------------------------------------------
// Request / outcome
// ---------------------------------------------------------------------------

/// One call to [`Engine::generate`].
#[derive(Clone)]
pub struct GenerateRequest {
    pub user_id: String,
    pub room_id: String,
    pub user_turn: Turn,
    /// Restrict the declared tools to these names.
    pub available_tools: Option<Vec<String>>,
    /// Model alias; `None` uses the configured default.
    pub model: Option<String>,
    pub knowledge: Value,
    pub affection: Value,
    pub profile: Value,
    pub channel: Option<HostHandle>,
    pub bot: Option<HostHandle>,
    pub message: Option<HostHandle>,
}

impl GenerateRequest {
    pub fn new(user_id: impl Into<String>, room_id: impl Into<String>, user_turn: Turn) -> Self {
        Self {
            user_id: user_id.into(),
            room_id: room_id.into(),
            user_turn,
            available_tools: None,
            model: None,
            knowledge: Value::Null,
            affection: Value::Null,
            profile: Value::Null,
            channel: None,
            bot: None,
            message: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.available_tools = Some(tools);
        self
    }

    fn tool_context(&self) -> ToolContext {
        ToolContext {
            invoking_user_id: self.user_id.clone(),
            room_id: self.room_id.clone(),
            channel: self.channel.clone(),
            bot: self.bot.clone(),
            message: self.message.clone(),
            available_tools: self.available_tools.as_deref().map(Arc::from),
        }
    }
}

/// Which apology a failed generation answers with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApologyKind {
    /// No credential could be acquired in time.
    Overloaded,
    /// Any other failure.
    Unexpected,
    SafetyBlocked,
    /// The tool loop hit its round limit.
    Stuck,
    /// The model answered with nothing usable.
    NotUnderstood,
}

impl ApologyKind {
    pub fn text(self, apologies: &ApologyConfig) -> String {
        match self {
            Self::Overloaded => apologies.overloaded.clone(),
            Self::Unexpected => apologies.unexpected.clone(),
            Self::SafetyBlocked => apologies.safety_blocked.clone(),
            Self::Stuck => apologies.stuck.clone(),
            Self::NotUnderstood => apologies.not_understood.clone(),
        }
    }
}

/// What the host should do with a generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Send this text.
    Reply(String),
    /// A tool already sent the user-visible output; send nothing.
    AlreadyDelivered,
    /// Send this apology.
    Apology { kind: ApologyKind, text: String },
}

impl Outcome {
    /// The text to send, if any.
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Reply(t) | Self::Apology { text: t, .. } => Some(t),
            Self::AlreadyDelivered => None,
        }
    }
}

/// Result of [`Engine::generate`].
#[derive(Debug, Clone)]
pub struct Generation {
    pub outcome: Outcome,
    pub session_id: Option<Uuid>,
    pub tools_invoked: BTreeSet<String>,
    pub rounds: u32,
    pub usage: Usage,
}

impl Generation {
    fn bare(outcome: Outcome) -> Self {
        Self {
            outcome,
            session_id: None,
            tools_invoked: BTreeSet::new(),
            rounds: 0,
            usage: Usage::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Config-derived parts swapped as a unit on reload.
struct Routing {
    config: Arc<EngineConfig>,
    selector: EndpointSelector,
    post: PostProcessor,
}

/// The request-execution engine.
pub struct Engine {
    routing: RwLock<Arc<Routing>>,
    backend: Arc<dyn Backend>,
    pool: Arc<CredentialPool>,
    executor: ToolExecutor,
    history: Arc<dyn History>,
    prompts: Arc<dyn PromptBuilder>,
    permits: Semaphore,
}

/// Assembles an [`Engine`].  Every collaborator has a default.
pub struct EngineBuilder {
    config: EngineConfig,
    backend: Option<Arc<dyn Backend>>,
    registry: ToolRegistry,
    policy: Arc<dyn ToolPolicy>,
    history: Arc<dyn History>,
    prompts: Arc<dyn PromptBuilder>,
}

impl EngineBuilder {
    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn tools(mut self, registry: ToolRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn tool_policy(mut self, policy: Arc<dyn ToolPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn history(mut self, history: Arc<dyn History>) -> Self {
        self.history = history;
        self
    }

    pub fn prompt_builder(mut self, prompts: Arc<dyn PromptBuilder>) -> Self {
        self.prompts = prompts;
        self
    }

    /// Build the engine.  Fails when no credential is configured.
    pub fn build(self) -> Result<Engine> {
        let mut config = self.config;
        config.validate()?;
        let config = Arc::new(config);

        let pool = Arc::new(CredentialPool::new(
            config.official.credentials.clone(),
            config.pool.clone(),
        )?);
        let backend = match self.backend {
            Some(b) => b,
            None => Arc::new(HttpBackend::new(config.request_timeout())?),
        };

        let registry = Arc::new(self.registry.with_switches(&config.tools));
        let executor =
            ToolExecutor::new(registry, config.tool_timeout()).with_policy(self.policy);

        let routing = Routing {
            selector: EndpointSelector::new(backend.clone(), pool.clone(), config.clone()),
            post: PostProcessor::new(config.emotions.clone())?,
            config: config.clone(),
        };

        tracing::info!(
            credentials = pool.len(),
            endpoints = config.endpoints.len(),
            tools = executor.registry().len(),
            max_concurrent = config.max_concurrent_requests,
            "engine ready"
        );

        Ok(Engine {
            routing: RwLock::new(Arc::new(routing)),
            backend,
            pool,
            executor,
            history: self.history,
            prompts: self.prompts,
            permits: Semaphore::new(config.max_concurrent_requests),
        })
    }
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            backend: None,
            registry: ToolRegistry::new(),
            policy: Arc::new(AllowAll),
            history: Arc::new(InMemoryHistory::default()),
            prompts: Arc::new(BasicPromptBuilder::default()),
        }
    }

    fn routing(&self) -> Arc<Routing> {
        self.routing
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn config(&self) -> Arc<EngineConfig> {
        self.routing().config.clone()
    }

    pub fn pool_snapshot(&self) -> Vec<CredentialStatus> {
        self.pool.snapshot()
    }

    /// Apply a reloaded configuration.
    ///
    /// Credentials still present keep their health; routing, generation
    /// parameters, apologies and emotions switch over for new requests.
    /// The concurrency bound and tool switches keep their build-time values.
    pub fn apply_config(&self, config: Arc<EngineConfig>) -> Result<()> {
        let routing = Routing {
            selector: EndpointSelector::new(self.backend.clone(), self.pool.clone(), config.clone()),
            post: PostProcessor::new(config.emotions.clone())?,
            config: config.clone(),
        };
        self.pool
            .replace_credentials(config.official.credentials.clone())?;
        self.pool.set_config(config.pool.clone());
        *self.routing.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(routing);
        tracing::info!("engine configuration applied");
        Ok(())
    }

    /// Produce the reply to one user turn.
    pub async fn generate(&self, request: GenerateRequest) -> Generation {
        let routing = self.routing();
        let apologies = &routing.config.apologies;
        let apology = |kind: ApologyKind| Outcome::Apology {
            kind,
            text: kind.text(apologies),
        };

        let Ok(_permit) = self.permits.acquire().await else {
            return Generation::bare(apology(ApologyKind::Unexpected));
        };

        let history = match self.history.load(&request.user_id, &request.room_id).await {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(user = %request.user_id, error = %e, "history load failed, continuing without");
                Vec::new()
            }
        };

        let turns = match self
            .prompts
            .build(PromptInput {
                user_turn: &request.user_turn,
                history: &history,
                knowledge: &request.knowledge,
                affection: &request.affection,
                profile: &request.profile,
            })
            .await
        {
            Ok(t) => t,
            Err(e) => {
                tracing::error!(user = %request.user_id, error = %e, "prompt build failed");
                return Generation::bare(apology(ApologyKind::Unexpected));
            }
        };

        let tools = self
            .executor
            .registry()
            .declarations(request.available_tools.as_deref());
        let ctx = request.tool_context();
        let max_rounds = routing.config.max_tool_rounds;
        let executor = &self.executor;
        let ctx_ref = &ctx;

        let result = routing
            .selector
            .run(request.model.as_deref(), |plan| {
                let turns = turns.clone();
                let tools = tools.clone();
                async move {
                    let mut session = GenerationSession::new(turns);
                    let outcome = GenerationCycle::new(&plan, executor, tools, max_rounds)
                        .run(&mut session, ctx_ref)
                        .await?;
                    Ok::<_, EngineError>((outcome, session))
                }
            })
            .await;

        let (cycle_outcome, session) = match result {
            Ok(r) => r,
            Err(e) => {
                let kind = match e {
                    EngineError::PoolExhausted { .. } | EngineError::NoCredentials => {
                        ApologyKind::Overloaded
                    }
                    _ => ApologyKind::Unexpected,
                };
                tracing::error!(user = %request.user_id, error = %e, apology = ?kind, "generation failed");
                return Generation::bare(apology(kind));
            }
        };

        let outcome = match cycle_outcome {
            CycleOutcome::Text(raw) => {
                let text = routing.post.apply(&raw);
                if text.is_empty() {
                    apology(ApologyKind::NotUnderstood)
                } else {
                    let exchange = vec![request.user_turn.clone(), Turn::model(raw.trim())];
                    if let Err(e) = self
                        .history
                        .save(&request.user_id, &request.room_id, exchange)
                        .await
                    {
                        tracing::warn!(user = %request.user_id, error = %e, "history save failed");
                    }
                    Outcome::Reply(text)
                }
            }
            CycleOutcome::AlreadyDelivered => Outcome::AlreadyDelivered,
            CycleOutcome::SafetyBlocked(_) => apology(ApologyKind::SafetyBlocked),
            CycleOutcome::Stuck => apology(ApologyKind::Stuck),
        };

        Generation {
            outcome,
            session_id: Some(session.id),
            tools_invoked: session.tools_invoked,
            rounds: session.rounds,
            usage: session.usage,
        }
    }
}
