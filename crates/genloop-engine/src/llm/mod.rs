//! Backend integration layer.
//!
//! - [`types`] -- Wire-agnostic turns, tool calls, and backend replies.
//! - [`client`] -- The [`Backend`] trait and its HTTP implementation.
//! - [`native`] -- Native structured-content wire format.
//! - [`openai`] -- OpenAI Chat Completions compatible wire format.

pub mod client;
pub mod native;
pub mod openai;
pub mod types;

pub use client::{Backend, HttpBackend, Target, mask_secret};
pub use types::{
    BackendReply, BackendRequest, BackendResponse, GenerationParams, ImageData, Part, Role,
    SafetyRating, ThinkingParams, ToolCallRequest, ToolCallResult, ToolOutcome, ToolSpec, Turn,
    Usage, WireFormat,
};
