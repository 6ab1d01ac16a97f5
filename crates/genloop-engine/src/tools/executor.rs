use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::join_all;
use serde_json::{Map, Value};

use crate::error::EngineError;
use crate::llm::types::{ToolCallRequest, ToolCallResult};
use crate::tools::{
    AllowAll, DISABLED_BY_OWNER, NOT_AVAILABLE, ToolContext, ToolPolicy, ToolRegistry,
};

/// Runs model-requested tool calls.
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    policy: Arc<dyn ToolPolicy>,
    timeout: Duration,
    /// One lock per user for tools flagged `per_user_exclusive`.
    user_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, timeout: Duration) -> Self {
        Self {
            registry,
            policy: Arc::new(AllowAll),
            timeout,
            user_locks: DashMap::new(),
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn ToolPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Run every call concurrently and return the results in call order.
    /// A failing call never affects its siblings.
    pub async fn execute_all(
        &self,
        calls: &[ToolCallRequest],
        ctx: &ToolContext,
    ) -> Vec<ToolCallResult> {
        join_all(calls.iter().map(|call| self.execute(call, ctx))).await
    }

    /// Run one call.  Every failure comes back as an error result.
    pub async fn execute(&self, call: &ToolCallRequest, ctx: &ToolContext) -> ToolCallResult {
        let Some(tool) = self.registry.lookup(&call.name) else {
            tracing::warn!(tool = %call.name, "model called an unknown tool");
            let err = EngineError::UnknownTool {
                tool_name: call.name.clone(),
            };
            return ToolCallResult::error(call, err.to_string());
        };

        if !ctx.allows(&call.name) && !self.registry.is_hidden(&call.name) {
            tracing::warn!(
                tool = %call.name,
                user = %ctx.invoking_user_id,
                "model called a tool outside the request's tool set"
            );
            return ToolCallResult::error(call, NOT_AVAILABLE);
        }

        if self.policy.is_disabled_for(&call.name, ctx) {
            tracing::info!(
                tool = %call.name,
                user = %ctx.invoking_user_id,
                room = %ctx.room_id,
                "tool disabled for caller"
            );
            return ToolCallResult::error(call, DISABLED_BY_OWNER);
        }

        let mut args = call.arguments.clone();
        if let Some(arg) = tool.caller_bound_argument() {
            bind_caller(&mut args, arg, &ctx.invoking_user_id, &call.name);
        }

        let lock = tool.per_user_exclusive().then(|| {
            self.user_locks
                .entry(ctx.invoking_user_id.clone())
                .or_default()
                .clone()
        });
        let guard = match &lock {
            Some(lock) => Some(lock.clone().lock_owned().await),
            None => None,
        };

        tracing::debug!(tool = %call.name, id = %call.id, "executing tool");
        let run = AssertUnwindSafe(tokio::time::timeout(self.timeout, tool.execute(args, ctx)))
            .catch_unwind()
            .await;

        drop(guard);
        if let Some(lock) = lock {
            self.release_user_lock(&ctx.invoking_user_id, lock);
        }

        match run {
            Ok(Ok(Ok(output))) => {
                let mut result = ToolCallResult::payload(call, output.payload);
                result.images = output.images;
                result.skip_remaining = output.skip_remaining;
                result
            }
            Ok(Ok(Err(e))) => {
                tracing::warn!(tool = %call.name, error = %e, "tool execution failed");
                ToolCallResult::error(call, e.to_string())
            }
            Ok(Err(_elapsed)) => {
                tracing::warn!(tool = %call.name, timeout = ?self.timeout, "tool timed out");
                let err = EngineError::ToolFailed {
                    tool_name: call.name.clone(),
                    reason: format!("timed out after {} s", self.timeout.as_secs()),
                };
                ToolCallResult::error(call, err.to_string())
            }
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_owned())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "tool panicked".into());
                tracing::error!(tool = %call.name, reason = %reason, "tool panicked");
                let err = EngineError::ToolFailed {
                    tool_name: call.name.clone(),
                    reason,
                };
                ToolCallResult::error(call, err.to_string())
            }
        }
    }
}

impl ToolExecutor {
    /// Drop the user's lock entry once no other call holds or waits on it.
    fn release_user_lock(&self, user_id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        drop(lock);
        self.user_locks
            .remove_if(user_id, |_, entry| Arc::strong_count(entry) == 1);
    }
}

/// Overwrite `arg` with the invoking user's id.
fn bind_caller(args: &mut Value, arg: &str, user_id: &str, tool: &str) {
    if !args.is_object() {
        *args = Value::Object(Map::new());
    }
    if let Some(obj) = args.as_object_mut() {
        let supplied = obj.insert(arg.to_owned(), Value::String(user_id.to_owned()));
        if let Some(previous) = supplied.filter(|v| v.as_str() != Some(user_id)) {
            tracing::warn!(
                tool = %tool,
                argument = %arg,
                supplied = %previous,
                "model targeted another user, bound to caller"
            );
        }
    }
}
