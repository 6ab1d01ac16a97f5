//! Core types for backend interaction.
//!
//! These types model the data flowing between the generation cycle and a
//! backend.  They are wire-format agnostic at this layer; the
//! [`super::native`] and [`super::openai`] modules translate them into the
//! concrete request and response shapes.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// The role of a participant in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Persona and instructions supplied by the prompt builder.
    System,
    /// Input from the human user.
    User,
    /// Output from the model.
    Model,
    /// Result of a tool invocation, fed back to the model.
    Tool,
}

/// Raw image bytes attached to a turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageData {
    /// MIME type, e.g. `image/png`.
    pub mime_type: String,
    /// Undecoded image bytes.
    pub data: Vec<u8>,
}

impl ImageData {
    pub fn new(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data,
        }
    }
}

/// One ordered element of a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Part {
    Text { text: String },
    Image { image: ImageData },
    ToolCall { call: ToolCallRequest },
    ToolResult { result: ToolCallResult },
}

/// A single turn in a conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    /// Who produced this turn.
    pub role: Role,
    /// Ordered content of the turn.
    pub parts: Vec<Part>,
}

impl Turn {
    /// Create a system turn.
    pub fn system(text: impl Into<String>) -> Self {
        Self::text(Role::System, text)
    }

    /// Create a user text turn.
    pub fn user(text: impl Into<String>) -> Self {
        Self::text(Role::User, text)
    }

    /// Create a user turn with text followed by images.
    pub fn user_with_images(text: impl Into<String>, images: Vec<ImageData>) -> Self {
        let mut turn = Self::user(text);
        turn.parts
            .extend(images.into_iter().map(|image| Part::Image { image }));
        turn
    }

    /// Create a model text turn.
    pub fn model(text: impl Into<String>) -> Self {
        Self::text(Role::Model, text)
    }

    /// Create a model turn that requests tool calls.
    pub fn model_tool_calls(calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: Role::Model,
            parts: calls.into_iter().map(|call| Part::ToolCall { call }).collect(),
        }
    }

    /// Create a tool turn carrying one tool result.
    pub fn tool_result(result: ToolCallResult) -> Self {
        Self {
            role: Role::Tool,
            parts: vec![Part::ToolResult { result }],
        }
    }

    fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            parts: vec![Part::Text { text: text.into() }],
        }
    }

    /// Concatenate every text part of the turn.
    pub fn text_content(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// Iterate over the images attached to the turn.
    pub fn images(&self) -> impl Iterator<Item = &ImageData> {
        self.parts.iter().filter_map(|p| match p {
            Part::Image { image } => Some(image),
            _ => None,
        })
    }
}

// ---------------------------------------------------------------------------
// Tool calls
// ---------------------------------------------------------------------------

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Identifier correlating the call with its result.  Backends that do not
    /// assign ids get one generated during parsing.
    pub id: String,
    /// The name of the tool to invoke.
    pub name: String,
    /// Arguments as a JSON value.
    pub arguments: Value,
}

/// What a tool produced: a payload or an error message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolOutcome {
    Payload(Value),
    Error(String),
}

/// The result of executing a tool, ready to feed back to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    /// The [`ToolCallRequest::id`] this result answers.
    pub call_id: String,
    /// Name of the tool that ran.
    pub name: String,
    /// Payload or error.
    pub outcome: ToolOutcome,
    /// Images produced by the tool, shown to the model alongside the result.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageData>,
    /// The tool already delivered user-visible output; the cycle must stop.
    #[serde(default)]
    pub skip_remaining: bool,
}

impl ToolCallResult {
    /// A successful result.
    pub fn payload(call: &ToolCallRequest, payload: Value) -> Self {
        Self {
            call_id: call.id.clone(),
            name: call.name.clone(),
            outcome: ToolOutcome::Payload(payload),
            images: Vec::new(),
            skip_remaining: false,
        }
    }

    /// A failed result; the message is shown to the model.
    pub fn error(call: &ToolCallRequest, message: impl Into<String>) -> Self {
        Self {
            call_id: call.id.clone(),
            name: call.name.clone(),
            outcome: ToolOutcome::Error(message.into()),
            images: Vec::new(),
            skip_remaining: false,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Error(_))
    }

    /// The JSON object both wire formats send back to the model:
    /// `{"result": ...}` or `{"error": ...}`.
    pub fn response_json(&self) -> Value {
        match &self.outcome {
            ToolOutcome::Payload(v) => json!({ "result": v }),
            ToolOutcome::Error(e) => json!({ "error": e }),
        }
    }
}

/// A tool declaration exposed to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Unique tool name.
    pub name: String,
    /// Description the model reads to decide when to call the tool.
    pub description: String,
    /// JSON Schema describing the tool's parameters.
    pub parameters: Value,
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// Wire format spoken by an endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    /// Structured multi-turn content with inline binary parts.
    #[default]
    Native,
    /// OpenAI Chat Completions compatible.
    #[serde(alias = "openai_compatible")]
    Openai,
}

/// Sampling parameters for one model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub max_output_tokens: Option<u32>,
    pub thinking: Option<ThinkingParams>,
}

/// Extended-reasoning settings, honoured by the native format only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThinkingParams {
    pub include_thoughts: bool,
    /// Token budget; `-1` lets the backend decide.
    pub budget: Option<i32>,
}

/// A full request to send to a backend.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    /// The model identifier as the backend knows it.
    pub model: String,
    /// The conversation so far.
    pub turns: Vec<Turn>,
    /// Tool declarations the model may invoke.
    pub tools: Vec<ToolSpec>,
    /// Sampling parameters.
    pub params: GenerationParams,
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// The high-level response from a backend after one request.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendResponse {
    /// The model produced a final text answer.
    Text(String),
    /// The model wants to invoke one or more tools before continuing.
    ToolCalls(Vec<ToolCallRequest>),
    /// A content-policy classifier refused the request or the answer.
    SafetyBlocked(String),
    /// Nothing usable came back.
    Empty,
}

/// A safety rating attached to a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyRating {
    /// Harm category without the provider prefix, e.g. `HARASSMENT`.
    pub category: String,
    /// Probability bucket, e.g. `LOW` or `HIGH`.
    pub probability: String,
}

/// Token usage information returned by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Number of tokens in the input (prompt).
    pub input_tokens: u32,
    /// Number of tokens generated by the model.
    pub output_tokens: u32,
}

impl Usage {
    /// Build from the raw counts a backend reports; counts past `u32::MAX`
    /// saturate.
    pub fn from_counts(input: &Value, output: &Value) -> Self {
        let count = |v: &Value| v.as_u64().map_or(0, |n| u32::try_from(n).unwrap_or(u32::MAX));
        Self {
            input_tokens: count(input),
            output_tokens: count(output),
        }
    }

    pub fn total(&self) -> u32 {
        self.input_tokens.saturating_add(self.output_tokens)
    }

    pub fn accumulate(&mut self, other: Usage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
    }
}

/// A parsed backend response plus the metadata the pool scores on.
#[derive(Debug, Clone)]
pub struct BackendReply {
    pub response: BackendResponse,
    pub safety_ratings: Vec<SafetyRating>,
    pub usage: Option<Usage>,
}

impl BackendReply {
    /// A reply with no ratings or usage attached.
    pub fn new(response: BackendResponse) -> Self {
        Self {
            response,
            safety_ratings: Vec::new(),
            usage: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.response, BackendResponse::Empty)
    }
}
