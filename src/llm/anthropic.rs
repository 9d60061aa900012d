//! Anthropic Claude upstream.
//!
//! Canonical messages convert to the Messages API shape (system hoisted,
//! tool_calls as tool_use blocks, tool results as tool_result blocks) and the
//! event stream is reassembled into canonical deltas, including thinking and
//! streamed tool-call arguments.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::{Value, json};

use super::universal::{self, ChunkBuilder, Content, ContentPart, Delta, FunctionCallDelta, Role,
	ToolCall, ToolCallDelta, Usage};
use super::{AIError, BuiltRequest, SseStream, check_response, post_json, send_stream, sse_events,
	upstream_model};
use crate::config::ProviderRuntime;

pub const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const DEFAULT_MAX_TOKENS: u64 = 4096;

fn messages_url(base_url: &str) -> String {
	if base_url.contains("/messages") {
		return base_url.to_string();
	}
	let base = if base_url.is_empty() {
		"https://api.anthropic.com"
	} else {
		base_url
	};
	format!("{}/v1/messages", base.trim_end_matches('/'))
}

pub fn build_request(
	req: &universal::Request,
	provider: &ProviderRuntime,
	api_key: Option<&str>,
) -> Result<BuiltRequest, AIError> {
	let model = upstream_model(provider, &req.model);
	let body = translate_request(req, &model)?;
	let mut built =
		BuiltRequest::new(messages_url(provider.base_url()), body).header("anthropic-version", ANTHROPIC_VERSION);
	if let Some(key) = api_key {
		built = built.sensitive_header("x-api-key", key);
	}
	Ok(built)
}

fn data_url_block(url: &str) -> Option<Value> {
	let rest = url.strip_prefix("data:")?;
	let (media_type, data) = rest.split_once(";base64,")?;
	Some(json!({
		"type": "image",
		"source": {"type": "base64", "media_type": media_type, "data": data}
	}))
}

fn content_blocks(content: &Content) -> Vec<Value> {
	match content {
		Content::Text(t) => vec![json!({"type": "text", "text": t})],
		Content::Parts(parts) => parts
			.iter()
			.filter_map(|p| match p {
				ContentPart::Text { text } => Some(json!({"type": "text", "text": text})),
				ContentPart::ImageUrl { image_url } => data_url_block(&image_url.url),
			})
			.collect(),
	}
}

pub(super) fn translate_request(req: &universal::Request, model: &str) -> Result<Value, AIError> {
	// All system prompts live in a single top-level field.
	let system = req
		.messages
		.iter()
		.filter(|m| m.role == Role::System)
		.filter_map(|m| m.content.as_ref().map(|c| c.text()))
		.collect::<Vec<_>>()
		.join("\n");

	let mut messages: Vec<Value> = Vec::new();
	for msg in req.messages.iter().filter(|m| m.role != Role::System) {
		match msg.role {
			Role::Assistant | Role::Model => {
				let mut blocks = Vec::new();
				if let Some(content) = &msg.content
					&& !content.is_empty()
				{
					blocks.extend(content_blocks(content));
				}
				if let Some(calls) = &msg.tool_calls {
					for call in calls {
						let input: Value =
							serde_json::from_str(&call.function.arguments).unwrap_or_else(|_| json!({}));
						blocks.push(json!({
							"type": "tool_use",
							"id": call.id,
							"name": call.function.name,
							"input": input,
						}));
					}
				}
				messages.push(json!({"role": "assistant", "content": blocks}));
			},
			Role::Tool | Role::Function => {
				messages.push(json!({
					"role": "user",
					"content": [{
						"type": "tool_result",
						"tool_use_id": msg.tool_call_id.clone().unwrap_or_default(),
						"content": msg.content.as_ref().map(|c| c.text()).unwrap_or_default(),
					}]
				}));
			},
			_ => {
				let blocks = msg
					.content
					.as_ref()
					.map(content_blocks)
					.unwrap_or_default();
				messages.push(json!({"role": "user", "content": blocks}));
			},
		}
	}

	let mut body = json!({
		"model": model,
		"messages": messages,
		"max_tokens": req.max_tokens().unwrap_or(DEFAULT_MAX_TOKENS),
	});
	let obj = body.as_object_mut().expect("literal object");
	if !system.is_empty() {
		obj.insert("system".to_string(), json!(system));
	}
	if req.stream() {
		obj.insert("stream".to_string(), json!(true));
	}
	if let Some(t) = req.temperature {
		obj.insert("temperature".to_string(), json!(t));
	}
	if let Some(p) = req.top_p {
		obj.insert("top_p".to_string(), json!(p));
	}
	if let Some(k) = req.top_k {
		obj.insert("top_k".to_string(), json!(k));
	}
	let stops = req.stop_sequences();
	if !stops.is_empty() {
		obj.insert("stop_sequences".to_string(), json!(stops));
	}
	if let Some(thinking) = &req.thinking {
		obj.insert("thinking".to_string(), thinking.clone());
	}
	if let Some(tools) = &req.tools {
		let native: Vec<Value> = tools
			.iter()
			.map(|t| {
				json!({
					"name": t.function.name,
					"description": t.function.description,
					"input_schema": t.function.parameters.clone().unwrap_or_else(|| json!({"type": "object"})),
				})
			})
			.collect();
		obj.insert("tools".to_string(), Value::Array(native));
		if let Some(choice) = translate_tool_choice(&req.tool_choice) {
			obj.insert("tool_choice".to_string(), choice);
		}
	}
	Ok(body)
}

fn translate_tool_choice(choice: &Option<Value>) -> Option<Value> {
	match choice {
		Some(Value::String(s)) => match s.as_str() {
			"required" => Some(json!({"type": "any"})),
			"none" => None,
			_ => Some(json!({"type": "auto"})),
		},
		Some(Value::Object(o)) => o["function"]["name"]
			.as_str()
			.map(|name| json!({"type": "tool", "name": name})),
		_ => None,
	}
}

fn map_stop_reason(reason: &str) -> &'static str {
	match reason {
		"max_tokens" => "length",
		"tool_use" => "tool_calls",
		_ => "stop",
	}
}

pub async fn stream_response(
	client: &reqwest::Client,
	built: BuiltRequest,
	model: &str,
	timeout: Duration,
) -> Result<SseStream, AIError> {
	let resp = send_stream(client, &built, timeout).await?;
	let events = sse_events(resp);
	let mut chunks = ChunkBuilder::new(model);
	let stream = async_stream::try_stream! {
		futures_util::pin_mut!(events);
		let mut input_tokens: i64 = 0;
		// Anthropic block index -> canonical tool_calls index
		let mut tool_indexes: HashMap<u64, u32> = HashMap::new();
		let mut next_tool_index: u32 = 0;
		while let Some(event) = events.next().await {
			let event = event?;
			let Ok(payload) = serde_json::from_str::<Value>(&event.data) else {
				continue;
			};
			match payload["type"].as_str().unwrap_or_default() {
				"message_start" => {
					if let Some(id) = payload["message"]["id"].as_str() {
						chunks = chunks.with_id(id);
					}
					input_tokens = payload["message"]["usage"]["input_tokens"].as_i64().unwrap_or(0);
					yield universal::sse_frame(&chunks.chunk(
						Delta { role: Some(Role::Assistant), ..Default::default() },
						None,
					));
				},
				"content_block_start" => {
					let block = &payload["content_block"];
					if block["type"] == "tool_use" {
						let index = payload["index"].as_u64().unwrap_or(0);
						let tool_index = next_tool_index;
						next_tool_index += 1;
						tool_indexes.insert(index, tool_index);
						yield universal::sse_frame(&chunks.chunk(
							Delta {
								tool_calls: Some(vec![ToolCallDelta {
									index: tool_index,
									id: block["id"].as_str().map(str::to_string),
									r#type: Some("function".to_string()),
									function: FunctionCallDelta {
										name: block["name"].as_str().map(str::to_string),
										arguments: Some(String::new()),
									},
								}]),
								..Default::default()
							},
							None,
						));
					}
				},
				"content_block_delta" => {
					let delta = &payload["delta"];
					match delta["type"].as_str().unwrap_or_default() {
						"text_delta" => {
							if let Some(text) = delta["text"].as_str() {
								yield universal::sse_frame(&chunks.content(text));
							}
						},
						"thinking_delta" => {
							if let Some(text) = delta["thinking"].as_str() {
								yield universal::sse_frame(&chunks.reasoning(text));
							}
						},
						"input_json_delta" => {
							let index = payload["index"].as_u64().unwrap_or(0);
							let tool_index = tool_indexes.get(&index).copied().unwrap_or(0);
							if let Some(partial) = delta["partial_json"].as_str() {
								yield universal::sse_frame(&chunks.chunk(
									Delta {
										tool_calls: Some(vec![ToolCallDelta {
											index: tool_index,
											id: None,
											r#type: None,
											function: FunctionCallDelta {
												name: None,
												arguments: Some(partial.to_string()),
											},
										}]),
										..Default::default()
									},
									None,
								));
							}
						},
						_ => {},
					}
				},
				"message_delta" => {
					let output_tokens = payload["usage"]["output_tokens"].as_i64().unwrap_or(0);
					yield universal::sse_frame(&chunks.usage(Usage {
						prompt_tokens: input_tokens,
						completion_tokens: output_tokens,
						total_tokens: input_tokens + output_tokens,
					}));
					if let Some(reason) = payload["delta"]["stop_reason"].as_str() {
						yield universal::sse_frame(&chunks.finish(map_stop_reason(reason)));
					}
				},
				"message_stop" => {
					yield universal::DONE_FRAME.to_string();
					break;
				},
				"error" => {
					let message = payload["error"]["message"]
						.as_str()
						.unwrap_or("upstream stream error")
						.to_string();
					Err::<(), AIError>(AIError::Stream(message))?;
				},
				// ping, content_block_stop
				_ => {},
			}
		}
	};
	Ok(Box::pin(stream))
}

pub async fn fetch_response(
	client: &reqwest::Client,
	built: BuiltRequest,
	model: &str,
	timeout: Duration,
) -> Result<Value, AIError> {
	let resp = post_json(client, &built, Some(timeout)).await?;
	let body = resp.json::<Value>().await?;
	let out = translate_response(&body, model)?;
	serde_json::to_value(out).map_err(AIError::RequestMarshal)
}

pub(super) fn translate_response(
	body: &Value,
	model: &str,
) -> Result<universal::Response, AIError> {
	let mut content = String::new();
	let mut reasoning = String::new();
	let mut tool_calls: Vec<ToolCall> = Vec::new();
	for block in body["content"].as_array().unwrap_or(&vec![]) {
		match block["type"].as_str().unwrap_or_default() {
			"text" => content.push_str(block["text"].as_str().unwrap_or_default()),
			"thinking" => reasoning.push_str(block["thinking"].as_str().unwrap_or_default()),
			"tool_use" => tool_calls.push(ToolCall {
				id: block["id"].as_str().unwrap_or_default().to_string(),
				r#type: "function".to_string(),
				function: universal::FunctionCall {
					name: block["name"].as_str().unwrap_or_default().to_string(),
					arguments: block["input"].to_string(),
				},
			}),
			_ => {},
		}
	}
	let input_tokens = body["usage"]["input_tokens"].as_i64().unwrap_or(0);
	let output_tokens = body["usage"]["output_tokens"].as_i64().unwrap_or(0);
	let finish = body["stop_reason"]
		.as_str()
		.map(|r| map_stop_reason(r).to_string());
	Ok(universal::build_response(
		model,
		Role::Assistant,
		Some(content),
		if reasoning.is_empty() {
			None
		} else {
			Some(reasoning)
		},
		if tool_calls.is_empty() {
			None
		} else {
			Some(tool_calls)
		},
		finish,
		Usage {
			prompt_tokens: input_tokens,
			completion_tokens: output_tokens,
			total_tokens: input_tokens + output_tokens,
		},
	))
}

pub async fn list_models(
	client: &reqwest::Client,
	provider: &ProviderRuntime,
	api_key: Option<&str>,
) -> Result<Vec<String>, AIError> {
	let base = messages_url(provider.base_url());
	let url = base.replace("/messages", "/models");
	let mut req = client.get(url).header("anthropic-version", ANTHROPIC_VERSION);
	if let Some(key) = api_key {
		req = req.header("x-api-key", key);
	}
	let resp = check_response(req.send().await?, "models").await?;
	let body = resp.json::<Value>().await?;
	Ok(
		body["data"]
			.as_array()
			.map(|items| {
				items
					.iter()
					.filter_map(|m| m["id"].as_str().map(str::to_string))
					.collect()
			})
			.unwrap_or_default(),
	)
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	fn request(v: Value) -> universal::Request {
		serde_json::from_value(v).unwrap()
	}

	#[test]
	fn system_is_hoisted_and_tools_translate() {
		let req = request(json!({
			"model": "claude-3-7-sonnet",
			"messages": [
				{"role": "system", "content": "be terse"},
				{"role": "user", "content": "hi"},
				{"role": "assistant", "tool_calls": [{
					"id": "toolu_1", "type": "function",
					"function": {"name": "get_weather", "arguments": "{\"city\":\"SF\"}"}
				}]},
				{"role": "tool", "tool_call_id": "toolu_1", "content": "sunny"}
			],
			"tools": [{"type":"function","function":{"name":"get_weather","description":"d","parameters":{"type":"object"}}}],
			"tool_choice": "required",
			"max_tokens": 100
		}));
		let body = translate_request(&req, "claude-3-7-sonnet-20250219").unwrap();
		assert_eq!(body["system"], "be terse");
		assert_eq!(body["max_tokens"], 100);
		assert_eq!(body["messages"][0]["role"], "user");
		assert_eq!(body["messages"][1]["content"][0]["type"], "tool_use");
		assert_eq!(body["messages"][1]["content"][0]["input"]["city"], "SF");
		assert_eq!(body["messages"][2]["content"][0]["type"], "tool_result");
		assert_eq!(body["messages"][2]["content"][0]["tool_use_id"], "toolu_1");
		assert_eq!(body["tools"][0]["input_schema"]["type"], "object");
		assert_eq!(body["tool_choice"]["type"], "any");
	}

	#[test]
	fn named_tool_choice_translates() {
		assert_eq!(
			translate_tool_choice(&Some(
				json!({"type": "function", "function": {"name": "f"}})
			))
			.unwrap(),
			json!({"type": "tool", "name": "f"})
		);
		assert!(translate_tool_choice(&Some(json!("none"))).is_none());
	}

	#[test]
	fn image_parts_become_base64_blocks() {
		let req = request(json!({
			"model": "claude-3-7-sonnet",
			"messages": [{"role": "user", "content": [
				{"type": "text", "text": "what is this"},
				{"type": "image_url", "image_url": {"url": "data:image/png;base64,AAAA"}}
			]}]
		}));
		let body = translate_request(&req, "claude-3-7-sonnet").unwrap();
		let blocks = body["messages"][0]["content"].as_array().unwrap();
		assert_eq!(blocks[0]["type"], "text");
		assert_eq!(blocks[1]["type"], "image");
		assert_eq!(blocks[1]["source"]["media_type"], "image/png");
		assert_eq!(blocks[1]["source"]["data"], "AAAA");
	}

	#[test]
	fn response_translates_blocks_and_usage() {
		let body = json!({
			"id": "msg_1",
			"content": [
				{"type": "thinking", "thinking": "hmm"},
				{"type": "text", "text": "answer"},
				{"type": "tool_use", "id": "toolu_9", "name": "f", "input": {"a": 1}}
			],
			"stop_reason": "tool_use",
			"usage": {"input_tokens": 10, "output_tokens": 5}
		});
		let out = translate_response(&body, "claude-3-7-sonnet").unwrap();
		let choice = &out.choices[0];
		assert_eq!(choice.message.content.as_deref(), Some("answer"));
		assert_eq!(choice.message.reasoning_content.as_deref(), Some("hmm"));
		assert_eq!(choice.finish_reason.as_deref(), Some("tool_calls"));
		let calls = choice.message.tool_calls.as_ref().unwrap();
		assert_eq!(calls[0].function.name, "f");
		let usage = out.usage.as_ref().unwrap();
		assert_eq!(usage.total_tokens, 15);
	}
}
