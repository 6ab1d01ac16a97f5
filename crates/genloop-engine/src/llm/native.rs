//! Native wire format.
//!
//! Structured multi-turn `contents` with `user`/`model` roles, inline base64
//! binary parts for images, `functionCall`/`functionResponse` parts for tools,
//! and provider-side safety settings.  Tool turns travel as `user` content, so
//! consecutive turns mapping to the same role are merged to keep roles
//! alternating.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Map, Value, json};

use crate::error::{EngineError, Result};
use crate::llm::types::{
    BackendReply, BackendRequest, BackendResponse, GenerationParams, Part, Role, SafetyRating,
    ToolCallRequest, ToolSpec, Turn, Usage,
};

/// Harm categories the native format lets us configure.
const HARM_CATEGORIES: &[&str] = &[
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

/// Finish reasons that mean the answer was withheld by a classifier.
const SAFETY_FINISH_REASONS: &[&str] = &["SAFETY", "PROHIBITED_CONTENT", "BLOCKLIST", "SPII"];

/// Build the `generateContent` URL for a model.
pub fn endpoint_url(base_url: &str, model: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if base.ends_with("/v1beta") || base.ends_with("/v1") {
        format!("{base}/models/{model}:generateContent")
    } else {
        format!("{base}/v1beta/models/{model}:generateContent")
    }
}

/// Build the JSON body for a `generateContent` request.
pub fn build_request_body(request: &BackendRequest) -> Value {
    let (system, contents) = turns_to_contents(&request.turns);

    let mut body = json!({
        "contents": contents,
        "safetySettings": HARM_CATEGORIES
            .iter()
            .map(|c| json!({ "category": c, "threshold": "BLOCK_NONE" }))
            .collect::<Vec<_>>(),
    });

    if let Some(system) = system {
        body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
    }

    if !request.tools.is_empty() {
        body["tools"] = tools_to_native(&request.tools);
    }

    let generation = generation_config(&request.params);
    if !generation.is_empty() {
        body["generationConfig"] = Value::Object(generation);
    }

    body
}

/// Convert turns to native `contents`, pulling system turns out into a
/// separate instruction string.
fn turns_to_contents(turns: &[Turn]) -> (Option<String>, Vec<Value>) {
    let mut system: Option<String> = None;
    let mut contents: Vec<Value> = Vec::with_capacity(turns.len());

    for turn in turns {
        let role = match turn.role {
            Role::System => {
                let text = turn.text_content();
                match &mut system {
                    Some(existing) => {
                        existing.push('\n');
                        existing.push_str(&text);
                    }
                    None => system = Some(text),
                }
                continue;
            }
            Role::User | Role::Tool => "user",
            Role::Model => "model",
        };

        let parts: Vec<Value> = turn.parts.iter().flat_map(part_to_native).collect();
        if parts.is_empty() {
            continue;
        }

        match contents.last_mut() {
            Some(last) if last["role"] == role => {
                if let Some(existing) = last["parts"].as_array_mut() {
                    existing.extend(parts);
                }
            }
            _ => contents.push(json!({ "role": role, "parts": parts })),
        }
    }

    (system, contents)
}

fn part_to_native(part: &Part) -> Vec<Value> {
    match part {
        Part::Text { text } if text.is_empty() => Vec::new(),
        Part::Text { text } => vec![json!({ "text": text })],
        Part::Image { image } => vec![json!({
            "inlineData": {
                "mimeType": image.mime_type,
                "data": BASE64.encode(&image.data),
            }
        })],
        Part::ToolCall { call } => vec![json!({
            "functionCall": { "name": call.name, "args": call.arguments }
        })],
        Part::ToolResult { result } => {
            let mut parts = vec![json!({
                "functionResponse": {
                    "name": result.name,
                    "response": result.response_json(),
                }
            })];
            parts.extend(result.images.iter().map(|image| {
                json!({
                    "inlineData": {
                        "mimeType": image.mime_type,
                        "data": BASE64.encode(&image.data),
                    }
                })
            }));
            parts
        }
    }
}

/// Convert tool declarations into the native `functionDeclarations` block.
fn tools_to_native(tools: &[ToolSpec]) -> Value {
    let declarations: Vec<Value> = tools
        .iter()
        .map(|t| {
            json!({
                "name": t.name,
                "description": t.description,
                "parameters": t.parameters,
            })
        })
        .collect();
    json!([{ "functionDeclarations": declarations }])
}

fn generation_config(params: &GenerationParams) -> Map<String, Value> {
    let mut config = Map::new();
    if let Some(t) = params.temperature {
        config.insert("temperature".into(), json!(t));
    }
    if let Some(p) = params.top_p {
        config.insert("topP".into(), json!(p));
    }
    if let Some(k) = params.top_k {
        config.insert("topK".into(), json!(k));
    }
    if let Some(max) = params.max_output_tokens {
        config.insert("maxOutputTokens".into(), json!(max));
    }
    if let Some(thinking) = &params.thinking {
        let mut t = json!({ "includeThoughts": thinking.include_thoughts });
        if let Some(budget) = thinking.budget {
            t["thinkingBudget"] = json!(budget);
        }
        config.insert("thinkingConfig".into(), t);
    }
    config
}

/// Parse a `generateContent` response.
pub fn parse_response(v: &Value) -> Result<BackendReply> {
    if !v.is_object() {
        return Err(EngineError::Parse {
            reason: "response is not a JSON object".into(),
        });
    }

    let candidate = &v["candidates"][0];
    let empty = Vec::new();
    let parts = candidate["content"]["parts"].as_array().unwrap_or(&empty);

    let mut text = String::new();
    let mut calls: Vec<ToolCallRequest> = Vec::new();

    for part in parts {
        if let Some(call) = part.get("functionCall") {
            let name = call["name"].as_str().unwrap_or_default().to_owned();
            let id = call["id"]
                .as_str()
                .map(str::to_owned)
                .unwrap_or_else(|| format!("call_{}", uuid::Uuid::now_v7().simple()));
            let arguments = match &call["args"] {
                Value::Null => Value::Object(Map::new()),
                args => args.clone(),
            };
            calls.push(ToolCallRequest {
                id,
                name,
                arguments,
            });
        } else if part["thought"].as_bool() == Some(true) {
            continue;
        } else if let Some(t) = part["text"].as_str() {
            text.push_str(t);
        }
    }

    let mut ratings = parse_ratings(&candidate["safetyRatings"]);
    if ratings.is_empty() {
        ratings = parse_ratings(&v["promptFeedback"]["safetyRatings"]);
    }

    let usage = v
        .get("usageMetadata")
        .map(|u| Usage::from_counts(&u["promptTokenCount"], &u["candidatesTokenCount"]));

    let response = if !calls.is_empty() {
        BackendResponse::ToolCalls(calls)
    } else if !text.trim().is_empty() {
        BackendResponse::Text(text)
    } else if let Some(reason) = v["promptFeedback"]["blockReason"].as_str() {
        BackendResponse::SafetyBlocked(reason.to_owned())
    } else if let Some(reason) = candidate["finishReason"]
        .as_str()
        .filter(|r| SAFETY_FINISH_REASONS.contains(r))
    {
        BackendResponse::SafetyBlocked(reason.to_owned())
    } else {
        BackendResponse::Empty
    };

    Ok(BackendReply {
        response,
        safety_ratings: ratings,
        usage,
    })
}

fn parse_ratings(v: &Value) -> Vec<SafetyRating> {
    v.as_array()
        .map(|ratings| {
            ratings
                .iter()
                .map(|r| SafetyRating {
                    category: r["category"]
                        .as_str()
                        .unwrap_or("UNKNOWN")
                        .trim_start_matches("HARM_CATEGORY_")
                        .to_owned(),
                    probability: r["probability"].as_str().unwrap_or("UNKNOWN").to_owned(),
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::{ImageData, ThinkingParams, ToolCallResult};

    fn request(turns: Vec<Turn>) -> BackendRequest {
        BackendRequest {
            model: "native-model".into(),
            turns,
            tools: vec![],
            params: GenerationParams::default(),
        }
    }

    #[test]
    fn endpoint_url_variants() {
        assert_eq!(
            endpoint_url("https://example.test/", "m1"),
            "https://example.test/v1beta/models/m1:generateContent"
        );
        assert_eq!(
            endpoint_url("https://example.test/v1beta", "m1"),
            "https://example.test/v1beta/models/m1:generateContent"
        );
    }

    #[test]
    fn system_turns_become_instruction() {
        let body = build_request_body(&request(vec![
            Turn::system("persona"),
            Turn::user("hi"),
        ]));
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "persona");
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(body["safetySettings"].as_array().unwrap().len(), 4);
    }

    #[test]
    fn consecutive_user_turns_are_merged() {
        let body = build_request_body(&request(vec![Turn::user("one"), Turn::user("two")]));
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0]["parts"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn tool_results_merge_into_one_user_content() {
        let call_a = ToolCallRequest {
            id: "a".into(),
            name: "alpha".into(),
            arguments: json!({"x": 1}),
        };
        let call_b = ToolCallRequest {
            id: "b".into(),
            name: "beta".into(),
            arguments: json!({}),
        };
        let mut failed = ToolCallResult::error(&call_b, "nope");
        failed.images.push(ImageData::new("image/png", vec![0xAA]));

        let body = build_request_body(&request(vec![
            Turn::user("do it"),
            Turn::model_tool_calls(vec![call_a.clone(), call_b.clone()]),
            Turn::tool_result(ToolCallResult::payload(&call_a, json!(42))),
            Turn::tool_result(failed),
        ]));

        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[1]["parts"][0]["functionCall"]["name"], "alpha");
        assert_eq!(contents[2]["role"], "user");
        let parts = contents[2]["parts"].as_array().unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0]["functionResponse"]["response"]["result"], 42);
        assert_eq!(parts[1]["functionResponse"]["response"]["error"], "nope");
        assert_eq!(parts[2]["inlineData"]["mimeType"], "image/png");
    }

    #[test]
    fn generation_config_uses_native_names() {
        let mut req = request(vec![Turn::user("hi")]);
        req.params = GenerationParams {
            temperature: Some(1.0),
            top_p: Some(0.95),
            top_k: Some(40),
            max_output_tokens: Some(6000),
            thinking: Some(ThinkingParams {
                include_thoughts: true,
                budget: Some(-1),
            }),
        };
        let body = build_request_body(&req);
        let config = &body["generationConfig"];
        assert_eq!(config["topK"], 40);
        assert_eq!(config["maxOutputTokens"], 6000);
        assert_eq!(config["thinkingConfig"]["thinkingBudget"], -1);
    }

    #[test]
    fn parse_text_skips_thoughts() {
        let v = json!({
            "candidates": [{
                "content": { "role": "model", "parts": [
                    { "text": "pondering", "thought": true },
                    { "text": "Hello!" }
                ]},
                "finishReason": "STOP",
                "safetyRatings": [
                    { "category": "HARM_CATEGORY_HARASSMENT", "probability": "LOW" }
                ]
            }],
            "usageMetadata": { "promptTokenCount": 12, "candidatesTokenCount": 3 }
        });
        let reply = parse_response(&v).unwrap();
        assert_eq!(reply.response, BackendResponse::Text("Hello!".into()));
        assert_eq!(reply.safety_ratings[0].category, "HARASSMENT");
        assert_eq!(reply.usage.unwrap().total(), 15);
    }

    #[test]
    fn huge_usage_metadata_saturates() {
        let v = json!({
            "candidates": [{
                "content": { "role": "model", "parts": [{ "text": "ok" }] },
                "finishReason": "STOP"
            }],
            "usageMetadata": { "promptTokenCount": 4_294_967_296u64, "candidatesTokenCount": 1 }
        });
        let usage = parse_response(&v).unwrap().usage.unwrap();
        assert_eq!(usage.input_tokens, u32::MAX);
        assert_eq!(usage.output_tokens, 1);
    }

    #[test]
    fn parse_function_calls_assigns_ids() {
        let v = json!({
            "candidates": [{
                "content": { "role": "model", "parts": [
                    { "functionCall": { "name": "lookup", "args": { "q": "x" } } }
                ]}
            }]
        });
        match parse_response(&v).unwrap().response {
            BackendResponse::ToolCalls(calls) => {
                assert_eq!(calls.len(), 1);
                assert_eq!(calls[0].name, "lookup");
                assert!(calls[0].id.starts_with("call_"));
                assert_eq!(calls[0].arguments["q"], "x");
            }
            other => panic!("expected tool calls, got {other:?}"),
        }
    }

    #[test]
    fn parse_prompt_block() {
        let v = json!({ "promptFeedback": { "blockReason": "PROHIBITED_CONTENT" } });
        assert_eq!(
            parse_response(&v).unwrap().response,
            BackendResponse::SafetyBlocked("PROHIBITED_CONTENT".into())
        );
    }

    #[test]
    fn parse_nothing_is_empty() {
        let v = json!({ "candidates": [{ "content": { "parts": [] }, "finishReason": "STOP" }] });
        assert_eq!(parse_response(&v).unwrap().response, BackendResponse::Empty);
    }
}
