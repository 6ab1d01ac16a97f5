//! OpenAI Chat Completions compatible wire format.
//!
//! Images travel as data URIs inside multimodal user content.  Tool results
//! become `role: "tool"` messages keyed by `tool_call_id`; since tool
//! messages cannot carry images, any images produced by a batch of tool
//! results are appended as one user message after it.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Value, json};

use crate::error::{EngineError, Result};
use crate::llm::types::{
    BackendReply, BackendRequest, BackendResponse, ImageData, Part, Role, ToolCallRequest,
    ToolSpec, Turn, Usage,
};

/// Build the chat completions URL for a base URL.
pub fn endpoint_url(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if base.ends_with("/chat/completions") {
        base.to_owned()
    } else {
        format!("{base}/chat/completions")
    }
}

/// Build the JSON body for a chat completions request.
pub fn build_request_body(request: &BackendRequest) -> Value {
    let mut body = json!({
        "model": request.model,
        "messages": turns_to_messages(&request.turns),
    });

    if !request.tools.is_empty() {
        body["tools"] = Value::Array(tools_to_openai(&request.tools));
    }

    let params = &request.params;
    if let Some(t) = params.temperature {
        body["temperature"] = json!(t);
    }
    if let Some(p) = params.top_p {
        body["top_p"] = json!(p);
    }
    if let Some(max) = params.max_output_tokens {
        body["max_tokens"] = json!(max);
    }

    body
}

fn data_uri(image: &ImageData) -> String {
    format!("data:{};base64,{}", image.mime_type, BASE64.encode(&image.data))
}

fn image_part(image: &ImageData) -> Value {
    json!({ "type": "image_url", "image_url": { "url": data_uri(image) } })
}

/// Convert turns into OpenAI messages.
fn turns_to_messages(turns: &[Turn]) -> Vec<Value> {
    let mut messages = Vec::with_capacity(turns.len());
    // Images produced by the current run of tool turns.
    let mut pending_images: Vec<Value> = Vec::new();

    for turn in turns {
        if turn.role != Role::Tool && !pending_images.is_empty() {
            messages.push(pending_image_message(&mut pending_images));
        }

        match turn.role {
            Role::System => {
                messages.push(json!({ "role": "system", "content": turn.text_content() }));
            }
            Role::User => messages.push(user_message(turn)),
            Role::Model => {
                let calls: Vec<&ToolCallRequest> = turn
                    .parts
                    .iter()
                    .filter_map(|p| match p {
                        Part::ToolCall { call } => Some(call),
                        _ => None,
                    })
                    .collect();
                let text = turn.text_content();

                if calls.is_empty() {
                    messages.push(json!({ "role": "assistant", "content": text }));
                } else {
                    let tool_calls: Vec<Value> = calls
                        .iter()
                        .map(|c| {
                            json!({
                                "id": c.id,
                                "type": "function",
                                "function": {
                                    "name": c.name,
                                    "arguments": c.arguments.to_string(),
                                }
                            })
                        })
                        .collect();
                    let content = if text.is_empty() {
                        Value::Null
                    } else {
                        Value::String(text)
                    };
                    messages.push(json!({
                        "role": "assistant",
                        "content": content,
                        "tool_calls": tool_calls,
                    }));
                }
            }
            Role::Tool => {
                for part in &turn.parts {
                    if let Part::ToolResult { result } = part {
                        messages.push(json!({
                            "role": "tool",
                            "tool_call_id": result.call_id,
                            "content": result.response_json().to_string(),
                        }));
                        pending_images.extend(result.images.iter().map(image_part));
                    }
                }
            }
        }
    }

    if !pending_images.is_empty() {
        messages.push(pending_image_message(&mut pending_images));
    }

    messages
}

fn user_message(turn: &Turn) -> Value {
    let text = turn.text_content();
    let images: Vec<Value> = turn.images().map(image_part).collect();
    if images.is_empty() {
        return json!({ "role": "user", "content": text });
    }

    let mut content = vec![json!({ "type": "text", "text": text })];
    content.extend(images);
    json!({ "role": "user", "content": content })
}

fn pending_image_message(images: &mut Vec<Value>) -> Value {
    let mut content = vec![json!({ "type": "text", "text": "Images returned by the tools above." })];
    content.append(images);
    json!({ "role": "user", "content": content })
}

/// Convert tool declarations into the OpenAI `tools` array.
fn tools_to_openai(tools: &[ToolSpec]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                }
            })
        })
        .collect()
}

/// Parse a chat completions response.
pub fn parse_response(v: &Value) -> Result<BackendReply> {
    let choices = v["choices"].as_array().ok_or_else(|| EngineError::Parse {
        reason: "missing 'choices' array in response".into(),
    })?;

    let usage = v
        .get("usage")
        .map(|u| Usage::from_counts(&u["prompt_tokens"], &u["completion_tokens"]));

    let Some(choice) = choices.first() else {
        return Ok(BackendReply {
            response: BackendResponse::Empty,
            safety_ratings: Vec::new(),
            usage,
        });
    };
    let message = &choice["message"];

    let mut calls = Vec::new();
    if let Some(tool_calls) = message["tool_calls"].as_array() {
        for tc in tool_calls {
            let id = tc["id"]
                .as_str()
                .map(str::to_owned)
                .unwrap_or_else(|| format!("call_{}", uuid::Uuid::now_v7().simple()));
            let name = tc["function"]["name"].as_str().unwrap_or_default().to_owned();
            let raw = tc["function"]["arguments"].as_str().unwrap_or("{}");
            let arguments = if raw.trim().is_empty() {
                json!({})
            } else {
                serde_json::from_str(raw).map_err(|e| EngineError::Parse {
                    reason: format!("tool call arguments for `{name}` are not JSON: {e}"),
                })?
            };
            calls.push(ToolCallRequest {
                id,
                name,
                arguments,
            });
        }
    }

    let text = message["content"].as_str().unwrap_or_default();

    let response = if !calls.is_empty() {
        BackendResponse::ToolCalls(calls)
    } else if !text.trim().is_empty() {
        BackendResponse::Text(text.to_owned())
    } else if choice["finish_reason"].as_str() == Some("content_filter") {
        BackendResponse::SafetyBlocked("content_filter".into())
    } else {
        BackendResponse::Empty
    };

    Ok(BackendReply {
        response,
        safety_ratings: Vec::new(),
        usage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::{GenerationParams, ToolCallResult};

    fn request(turns: Vec<Turn>, tools: Vec<ToolSpec>) -> BackendRequest {
        BackendRequest {
            model: "compat-model".into(),
            turns,
            tools,
            params: GenerationParams {
                temperature: Some(0.7),
                max_output_tokens: Some(512),
                ..Default::default()
            },
        }
    }

    #[test]
    fn endpoint_url_appends_path_once() {
        assert_eq!(
            endpoint_url("https://compat.test/v1/"),
            "https://compat.test/v1/chat/completions"
        );
        assert_eq!(
            endpoint_url("https://compat.test/v1/chat/completions"),
            "https://compat.test/v1/chat/completions"
        );
    }

    #[test]
    fn user_images_become_data_uris() {
        let body = build_request_body(&request(
            vec![Turn::user_with_images(
                "what is this",
                vec![ImageData::new("image/png", vec![1, 2, 3])],
            )],
            vec![],
        ));
        let content = &body["messages"][0]["content"];
        assert_eq!(content[0]["type"], "text");
        assert_eq!(content[1]["type"], "image_url");
        assert_eq!(content[1]["image_url"]["url"], "data:image/png;base64,AQID");
        assert_eq!(body["max_tokens"], 512);
    }

    #[test]
    fn tool_round_trip_shape() {
        let call = ToolCallRequest {
            id: "call_1".into(),
            name: "render".into(),
            arguments: json!({"q": "cat"}),
        };
        let mut result = ToolCallResult::payload(&call, json!("done"));
        result.images.push(ImageData::new("image/jpeg", vec![9]));

        let tools = vec![ToolSpec {
            name: "render".into(),
            description: "Render an image".into(),
            parameters: json!({"type": "object"}),
        }];
        let body = build_request_body(&request(
            vec![
                Turn::system("be nice"),
                Turn::user("draw a cat"),
                Turn::model_tool_calls(vec![call]),
                Turn::tool_result(result),
            ],
            tools,
        ));

        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[2]["role"], "assistant");
        assert_eq!(messages[2]["tool_calls"][0]["function"]["arguments"], r#"{"q":"cat"}"#);
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(messages[3]["tool_call_id"], "call_1");
        assert_eq!(messages[4]["role"], "user");
        assert_eq!(messages[4]["content"][1]["type"], "image_url");
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "render");
    }

    #[test]
    fn parse_text_response() {
        let v = json!({
            "choices": [{ "message": { "role": "assistant", "content": "Hi there" },
                          "finish_reason": "stop" }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 2 }
        });
        let reply = parse_response(&v).unwrap();
        assert_eq!(reply.response, BackendResponse::Text("Hi there".into()));
        assert_eq!(reply.usage.unwrap().input_tokens, 10);
    }

    #[test]
    fn huge_usage_saturates() {
        let v = json!({
            "choices": [{ "message": { "role": "assistant", "content": "ok" } }],
            "usage": { "prompt_tokens": 3, "completion_tokens": 9_000_000_000u64 }
        });
        let usage = parse_response(&v).unwrap().usage.unwrap();
        assert_eq!(usage.input_tokens, 3);
        assert_eq!(usage.output_tokens, u32::MAX);
    }

    #[test]
    fn parse_tool_calls() {
        let v = json!({
            "choices": [{ "message": {
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": "call_abc",
                    "type": "function",
                    "function": { "name": "lookup", "arguments": "{\"q\":\"rust\"}" }
                }]
            }}]
        });
        match parse_response(&v).unwrap().response {
            BackendResponse::ToolCalls(calls) => {
                assert_eq!(calls[0].id, "call_abc");
                assert_eq!(calls[0].arguments["q"], "rust");
            }
            other => panic!("expected tool calls, got {other:?}"),
        }
    }

    #[test]
    fn parse_content_filter_and_empty() {
        let filtered = json!({
            "choices": [{ "message": { "content": "" }, "finish_reason": "content_filter" }]
        });
        assert_eq!(
            parse_response(&filtered).unwrap().response,
            BackendResponse::SafetyBlocked("content_filter".into())
        );

        let empty = json!({ "choices": [] });
        assert_eq!(parse_response(&empty).unwrap().response, BackendResponse::Empty);

        assert!(parse_response(&json!({})).is_err());
    }
}
