//! Generation cycle.
//!
//! Drives one bounded tool-invocation loop: call the backend, interpret the
//! reply, execute requested tools concurrently, feed their results back, and
//! repeat until the model answers, a safety filter refuses, a tool delivers
//! the answer itself, or the round limit is reached.

use std::collections::BTreeSet;

use uuid::Uuid;

use crate::error::Result;
use crate::llm::types::{BackendRequest, BackendResponse, ToolSpec, Turn, Usage};
use crate::selector::CallPlan;
use crate::tools::{ToolContext, ToolExecutor};

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Per-request state.  Owned by exactly one cycle; turns are append-only.
#[derive(Debug, Clone)]
pub struct GenerationSession {
    pub id: Uuid,
    pub turns: Vec<Turn>,
    /// Distinct tool names the model invoked.
    pub tools_invoked: BTreeSet<String>,
    /// Backend calls made so far.
    pub rounds: u32,
    pub usage: Usage,
}

impl GenerationSession {
    pub fn new(turns: Vec<Turn>) -> Self {
        Self {
            id: Uuid::now_v7(),
            turns,
            tools_invoked: BTreeSet::new(),
            rounds: 0,
            usage: Usage::default(),
        }
    }

    /// Number of tool-result turns in the conversation.
    pub fn tool_result_turns(&self) -> usize {
        self.turns
            .iter()
            .filter(|t| t.role == crate::llm::types::Role::Tool)
            .count()
    }
}

/// How a cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The model produced a final answer (possibly blank).
    Text(String),
    /// A tool already delivered the user-visible output.
    AlreadyDelivered,
    /// A safety filter refused; the reason is for logs only.
    SafetyBlocked(String),
    /// The round limit ran out while the model kept calling tools.
    Stuck,
}

// ---------------------------------------------------------------------------
// Cycle
// ---------------------------------------------------------------------------

/// One run of the tool loop over a chosen route.
pub struct GenerationCycle<'a> {
    plan: &'a CallPlan,
    executor: &'a ToolExecutor,
    tools: Vec<ToolSpec>,
    max_rounds: u32,
}

impl<'a> GenerationCycle<'a> {
    pub fn new(
        plan: &'a CallPlan,
        executor: &'a ToolExecutor,
        tools: Vec<ToolSpec>,
        max_rounds: u32,
    ) -> Self {
        Self {
            plan,
            executor,
            tools,
            max_rounds: max_rounds.max(1),
        }
    }

    /// Run the loop to a terminal outcome.
    ///
    /// Backend failures that survive the caller's own retry policy are
    /// returned as errors; everything a tool does is captured as data.
    pub async fn run(
        &self,
        session: &mut GenerationSession,
        ctx: &ToolContext,
    ) -> Result<CycleOutcome> {
        tracing::info!(
            session = %session.id,
            route = %self.plan.route,
            model = %self.plan.model,
            max_rounds = self.max_rounds,
            tool_count = self.tools.len(),
            "starting generation cycle"
        );

        let outcome = self.drive(session, ctx).await;

        match &outcome {
            Ok(o) => tracing::info!(
                session = %session.id,
                outcome = outcome_label(o),
                rounds = session.rounds,
                tools = ?session.tools_invoked,
                input_tokens = session.usage.input_tokens,
                output_tokens = session.usage.output_tokens,
                "generation cycle finished"
            ),
            Err(e) => tracing::warn!(
                session = %session.id,
                rounds = session.rounds,
                tools = ?session.tools_invoked,
                error = %e,
                "generation cycle failed"
            ),
        }
        outcome
    }

    async fn drive(&self, session: &mut GenerationSession, ctx: &ToolContext) -> Result<CycleOutcome> {
        while session.rounds < self.max_rounds {
            session.rounds += 1;
            tracing::debug!(session = %session.id, round = session.rounds, "cycle round");

            let request = BackendRequest {
                model: self.plan.model.clone(),
                turns: session.turns.clone(),
                tools: self.tools.clone(),
                params: self.plan.params.clone(),
            };

            let reply = self.plan.caller.call(&request).await?;
            if let Some(usage) = reply.usage {
                session.usage.accumulate(usage);
            }

            match reply.response {
                BackendResponse::Text(text) => {
                    session.turns.push(Turn::model(text.clone()));
                    return Ok(CycleOutcome::Text(text));
                }
                // The caller already retried on the same credential.
                BackendResponse::Empty => return Ok(CycleOutcome::Text(String::new())),
                BackendResponse::SafetyBlocked(reason) => {
                    tracing::warn!(session = %session.id, reason = %reason, "reply blocked by safety filter");
                    return Ok(CycleOutcome::SafetyBlocked(reason));
                }
                BackendResponse::ToolCalls(calls) => {
                    tracing::info!(
                        session = %session.id,
                        round = session.rounds,
                        tool_count = calls.len(),
                        tools = ?calls.iter().map(|c| &c.name).collect::<Vec<_>>(),
                        "model requested tool calls"
                    );

                    session
                        .tools_invoked
                        .extend(calls.iter().map(|c| c.name.clone()));
                    session.turns.push(Turn::model_tool_calls(calls.clone()));

                    let results = self.executor.execute_all(&calls, ctx).await;
                    let delivered = results.iter().any(|r| r.skip_remaining);
                    session
                        .turns
                        .extend(results.into_iter().map(Turn::tool_result));

                    if delivered {
                        tracing::info!(session = %session.id, "tool delivered the reply itself");
                        return Ok(CycleOutcome::AlreadyDelivered);
                    }
                }
            }
        }

        tracing::warn!(session = %session.id, max_rounds = self.max_rounds, "round limit reached");
        Ok(CycleOutcome::Stuck)
    }
}

fn outcome_label(outcome: &CycleOutcome) -> &'static str {
    match outcome {
        CycleOutcome::Text(_) => "text",
        CycleOutcome::AlreadyDelivered => "already_delivered",
        CycleOutcome::SafetyBlocked(_) => "safety_blocked",
        CycleOutcome::Stuck => "stuck",
    }
}
