//! Request-execution engine for genloop.
//!
//! Turns one user message into one reply by driving a generative backend
//! through a bounded tool-calling loop.  Credentials are drawn from a
//! self-healing pool, custom endpoints fall back to the pooled official path,
//! and every failure ends in a fixed apology instead of an error.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐     ┌──────────────────┐     ┌──────────────────┐
//! │   Engine   │────>│ EndpointSelector │────>│ GenerationCycle  │
//! │ (generate) │     │ (route/fallback) │     │ (bounded loop)   │
//! └─────┬──────┘     └────────┬─────────┘     └────┬────────┬────┘
//!       │                     │                    │        │
//!  ┌────┴──────┐      ┌───────┴────────┐   ┌───────┴──┐  ┌──┴───────────┐
//!  │ History / │      │ CredentialPool │   │ Backend  │  │ ToolExecutor │
//!  │ Prompts   │      │ (lease/score)  │   │ (HTTP)   │  │ (isolated)   │
//!  └───────────┘      └────────────────┘   └──────────┘  └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`engine`] -- The facade hosts call, plus history and prompt seams.
//! - [`runtime`] -- The tool-calling loop.
//! - [`selector`] -- Route choice, credential leasing, and retries.
//! - [`pool`] -- Scored credential pool with cooldowns.
//! - [`tools`] -- Tool trait, registry, and isolated executor.
//! - [`llm`] -- Backend trait, HTTP client, and both wire formats.
//! - [`postprocess`] -- Final-text cleanup and emotion mapping.
//! - [`config`] -- Configuration loading, validation, and hot reload.
//! - [`error`] -- Engine error types.

pub mod config;
pub mod engine;
pub mod error;
pub mod llm;
pub mod pool;
pub mod postprocess;
pub mod runtime;
pub mod selector;
pub mod tools;

pub use config::{ConfigChange, ConfigManager, EngineConfig, EndpointConfig, PoolConfig};
pub use engine::{
    ApologyKind, BasicPromptBuilder, Engine, EngineBuilder, GenerateRequest, Generation, History,
    InMemoryHistory, Outcome, PromptBuilder, PromptInput,
};
pub use error::{EngineError, Result};
pub use llm::{
    Backend, BackendReply, BackendRequest, BackendResponse, HttpBackend, ImageData, Role, Target,
    ToolCallRequest, ToolCallResult, ToolSpec, Turn, Usage, WireFormat,
};
pub use pool::{CredentialPool, CredentialState, CredentialStatus, Lease, ReleaseOutcome};
pub use postprocess::PostProcessor;
pub use runtime::{CycleOutcome, GenerationCycle, GenerationSession};
pub use selector::{CallPlan, EndpointSelector};
pub use tools::{
    DisabledTools, HostHandle, Tool, ToolContext, ToolExecutor, ToolOutput, ToolPolicy,
    ToolRegistry, TypedTool,
};
