//! Tool registry and executor.
//!
//! Host capabilities the model may invoke are registered as [`Tool`]s.  The
//! [`ToolExecutor`] dispatches model-requested calls by name, injects the
//! per-call [`ToolContext`], and turns every failure (error, panic, timeout,
//! unknown name, owner-disabled tool) into an error payload for the model.
//! Nothing a tool does can abort the generation cycle or a sibling call.

mod executor;
mod registry;

pub use executor::ToolExecutor;
pub use registry::ToolRegistry;

use std::any::Any;
use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::llm::types::{ImageData, ToolSpec};

/// Message returned to the model for a tool the owner switched off.
pub const DISABLED_BY_OWNER: &str = "This tool has been disabled by the owner here.";

/// Message returned to the model for a tool outside the request's tool set.
pub const NOT_AVAILABLE: &str = "This tool is not available for this request.";

// ---------------------------------------------------------------------------
// Context and output
// ---------------------------------------------------------------------------

/// Opaque host object passed through to tools (a channel, the bot client,
/// the raw platform message).
pub type HostHandle = Arc<dyn Any + Send + Sync>;

/// Per-call context injected into every tool invocation.
#[derive(Clone, Default)]
pub struct ToolContext {
    pub invoking_user_id: String,
    pub room_id: String,
    pub channel: Option<HostHandle>,
    pub bot: Option<HostHandle>,
    pub message: Option<HostHandle>,
    /// Tools the request may run; `None` allows every registered tool.
    pub available_tools: Option<Arc<[String]>>,
}

impl ToolContext {
    pub fn new(invoking_user_id: impl Into<String>, room_id: impl Into<String>) -> Self {
        Self {
            invoking_user_id: invoking_user_id.into(),
            room_id: room_id.into(),
            ..Default::default()
        }
    }

    /// Whether the request's tool set includes `name`.
    pub fn allows(&self, name: &str) -> bool {
        self.available_tools
            .as_deref()
            .is_none_or(|list| list.iter().any(|a| a == name))
    }

    /// Downcast the channel handle to the host's concrete type.
    pub fn channel<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.channel.as_ref()?.downcast_ref()
    }

    pub fn bot<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.bot.as_ref()?.downcast_ref()
    }

    pub fn message<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.message.as_ref()?.downcast_ref()
    }
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("invoking_user_id", &self.invoking_user_id)
            .field("room_id", &self.room_id)
            .field("channel", &self.channel.is_some())
            .field("bot", &self.bot.is_some())
            .field("message", &self.message.is_some())
            .field("available_tools", &self.available_tools)
            .finish()
    }
}

/// What a tool hands back.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub payload: Value,
    /// Images shown to the model with the result.
    pub images: Vec<ImageData>,
    /// The tool already sent its own user-visible output.
    pub skip_remaining: bool,
}

impl ToolOutput {
    pub fn json(payload: Value) -> Self {
        Self {
            payload,
            ..Default::default()
        }
    }

    /// Output of a tool that already delivered the answer to the user.
    pub fn delivered(payload: Value) -> Self {
        Self {
            payload,
            images: Vec::new(),
            skip_remaining: true,
        }
    }

    pub fn with_image(mut self, image: ImageData) -> Self {
        self.images.push(image);
        self
    }
}

// ---------------------------------------------------------------------------
// Tool traits
// ---------------------------------------------------------------------------

/// A host capability the model can call.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    /// Declaration sent to the model.
    fn spec(&self) -> ToolSpec;

    /// Argument that must always name the invoking user.  Whatever the model
    /// put there is overwritten with the caller's id.
    fn caller_bound_argument(&self) -> Option<&str> {
        None
    }

    /// Calls are serialized per invoking user.
    fn per_user_exclusive(&self) -> bool {
        false
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput>;
}

/// A tool with a typed parameter struct whose schema is derived.
///
/// Wrap it in [`Typed`] (or use [`ToolRegistry::register_typed`]) to register.
#[async_trait]
pub trait TypedTool: Send + Sync + 'static {
    type Params: DeserializeOwned + JsonSchema + Send;

    const NAME: &'static str;
    const DESCRIPTION: &'static str;

    fn caller_bound_argument(&self) -> Option<&'static str> {
        None
    }

    fn per_user_exclusive(&self) -> bool {
        false
    }

    async fn run(&self, params: Self::Params, ctx: &ToolContext) -> Result<ToolOutput>;
}

/// Adapter from [`TypedTool`] to [`Tool`].
pub struct Typed<T>(pub T);

#[async_trait]
impl<T: TypedTool> Tool for Typed<T> {
    fn name(&self) -> &str {
        T::NAME
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: T::NAME.to_owned(),
            description: T::DESCRIPTION.to_owned(),
            parameters: parameters_schema::<T::Params>(),
        }
    }

    fn caller_bound_argument(&self) -> Option<&str> {
        self.0.caller_bound_argument()
    }

    fn per_user_exclusive(&self) -> bool {
        self.0.per_user_exclusive()
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let params: T::Params =
            serde_json::from_value(args).map_err(|e| EngineError::InvalidToolArguments {
                tool_name: T::NAME.to_owned(),
                reason: e.to_string(),
            })?;
        self.0.run(params, ctx).await
    }
}

/// JSON schema for a parameter struct, inlined and stripped of the keys
/// backends reject.
pub fn parameters_schema<P: JsonSchema>() -> Value {
    let generator = schemars::r#gen::SchemaSettings::draft07()
        .with(|s| {
            s.inline_subschemas = true;
            s.option_add_null_type = false;
        })
        .into_generator();
    let schema = generator.into_root_schema_for::<P>();
    let mut value = serde_json::to_value(schema).unwrap_or_else(|_| serde_json::json!({}));
    if let Some(obj) = value.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
        obj.remove("definitions");
        obj.entry("type").or_insert_with(|| Value::String("object".into()));
    }
    value
}

// ---------------------------------------------------------------------------
// Per-caller policy
// ---------------------------------------------------------------------------

/// Decides whether a tool is switched off for a particular caller.
pub trait ToolPolicy: Send + Sync {
    fn is_disabled_for(&self, tool: &str, ctx: &ToolContext) -> bool;
}

/// Policy that allows everything.
#[derive(Debug, Default)]
pub struct AllowAll;

impl ToolPolicy for AllowAll {
    fn is_disabled_for(&self, _tool: &str, _ctx: &ToolContext) -> bool {
        false
    }
}

/// Owner-maintained switches per room and per user.
#[derive(Debug, Default)]
pub struct DisabledTools {
    rooms: DashMap<String, HashSet<String>>,
    users: DashMap<String, HashSet<String>>,
}

impl DisabledTools {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn disable_in_room(&self, room_id: &str, tool: &str) {
        self.rooms
            .entry(room_id.to_owned())
            .or_default()
            .insert(tool.to_owned());
    }

    pub fn enable_in_room(&self, room_id: &str, tool: &str) {
        if let Some(mut set) = self.rooms.get_mut(room_id) {
            set.remove(tool);
        }
    }

    pub fn disable_for_user(&self, user_id: &str, tool: &str) {
        self.users
            .entry(user_id.to_owned())
            .or_default()
            .insert(tool.to_owned());
    }

    pub fn enable_for_user(&self, user_id: &str, tool: &str) {
        if let Some(mut set) = self.users.get_mut(user_id) {
            set.remove(tool);
        }
    }
}

impl ToolPolicy for DisabledTools {
    fn is_disabled_for(&self, tool: &str, ctx: &ToolContext) -> bool {
        let listed = |map: &DashMap<String, HashSet<String>>, key: &str| {
            map.get(key).is_some_and(|set| set.contains(tool))
        };
        listed(&self.rooms, &ctx.room_id) || listed(&self.users, &ctx.invoking_user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize, JsonSchema)]
    struct WeatherParams {
        /// City to look up.
        city: String,
        #[serde(default)]
        days: Option<u8>,
    }

    struct Weather;

    #[async_trait]
    impl TypedTool for Weather {
        type Params = WeatherParams;
        const NAME: &'static str = "weather";
        const DESCRIPTION: &'static str = "Look up the weather";

        async fn run(&self, params: WeatherParams, _ctx: &ToolContext) -> Result<ToolOutput> {
            Ok(ToolOutput::json(serde_json::json!({
                "city": params.city,
                "days": params.days.unwrap_or(1),
            })))
        }
    }

    #[test]
    fn typed_schema_is_clean_object() {
        let spec = Typed(Weather).spec();
        assert_eq!(spec.name, "weather");
        let params = &spec.parameters;
        assert_eq!(params["type"], "object");
        assert_eq!(params["properties"]["city"]["type"], "string");
        assert_eq!(params["required"], serde_json::json!(["city"]));
        assert!(params.get("$schema").is_none());
        assert!(params.get("title").is_none());
    }

    #[tokio::test]
    async fn typed_tool_validates_arguments() {
        let tool = Typed(Weather);
        let ctx = ToolContext::new("u1", "r1");

        let out = tool
            .execute(serde_json::json!({ "city": "Oslo" }), &ctx)
            .await
            .unwrap();
        assert_eq!(out.payload["days"], 1);

        let err = tool
            .execute(serde_json::json!({ "town": "Oslo" }), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidToolArguments { .. }));
    }

    #[test]
    fn context_handles_downcast() {
        let mut ctx = ToolContext::new("u1", "r1");
        ctx.channel = Some(Arc::new(42u64));
        assert_eq!(ctx.channel::<u64>(), Some(&42));
        assert!(ctx.channel::<String>().is_none());
        assert!(ctx.bot::<u64>().is_none());
    }

    #[test]
    fn disabled_tools_by_room_and_user() {
        let policy = DisabledTools::new();
        let here = ToolContext::new("alice", "room-1");
        let elsewhere = ToolContext::new("bob", "room-2");

        policy.disable_in_room("room-1", "weather");
        assert!(policy.is_disabled_for("weather", &here));
        assert!(!policy.is_disabled_for("weather", &elsewhere));

        policy.disable_for_user("bob", "dice");
        assert!(policy.is_disabled_for("dice", &elsewhere));
        assert!(!policy.is_disabled_for("dice", &here));

        policy.enable_in_room("room-1", "weather");
        policy.enable_for_user("bob", "dice");
        assert!(!policy.is_disabled_for("weather", &here));
        assert!(!policy.is_disabled_for("dice", &elsewhere));
    }
}
