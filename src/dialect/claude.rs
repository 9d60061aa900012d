//! Anthropic inbound dialect.
//!
//! `system` (string or blocks) becomes a canonical system message, `tool_use`
//! blocks become canonical tool calls, `tool_result` blocks become tool-role
//! messages. The stream renderer wraps canonical deltas as
//! `content_block_delta` events with a terminal `message_stop`.

use serde_json::{Value, json};

use super::PathParams;
use crate::handler::GatewayError;
use crate::llm::universal::{Content, ContentPart, ImageUrl, Message, Request, Role, ToolCall};

fn blocks_to_parts(blocks: &[Value]) -> Vec<ContentPart> {
	let mut parts = Vec::new();
	for block in blocks {
		match block["type"].as_str() {
			Some("text") => parts.push(ContentPart::Text {
				text: block["text"].as_str().unwrap_or_default().to_string(),
			}),
			Some("image") => {
				let source = &block["source"];
				if source["type"] == "base64" {
					let media = source["media_type"].as_str().unwrap_or("image/png");
					let data = source["data"].as_str().unwrap_or_default();
					parts.push(ContentPart::ImageUrl {
						image_url: ImageUrl {
							url: format!("data:{media};base64,{data}"),
						},
					});
				}
			},
			_ => {},
		}
	}
	parts
}

fn push_parts(messages: &mut Vec<Message>, role: Role, parts: Vec<ContentPart>) {
	if parts.is_empty() {
		return;
	}
	let content = match parts.as_slice() {
		[ContentPart::Text { text }] => Content::Text(text.clone()),
		_ => Content::Parts(parts),
	};
	messages.push(Message {
		role,
		name: None,
		content: Some(content),
		tool_calls: None,
		tool_call_id: None,
		thought_signature: None,
		reasoning_content: None,
	});
}

pub fn parse_request(body: &Value, params: &PathParams) -> Result<Request, GatewayError> {
	let mut messages: Vec<Message> = Vec::new();

	match &body["system"] {
		Value::String(s) if !s.trim().is_empty() => {
			messages.push(Message::text(Role::System, s.trim()));
		},
		Value::Array(blocks) => {
			let text: String = blocks
				.iter()
				.filter_map(|b| b["text"].as_str())
				.collect();
			if !text.trim().is_empty() {
				messages.push(Message::text(Role::System, text.trim()));
			}
		},
		_ => {},
	}

	for native in body["messages"].as_array().unwrap_or(&vec![]) {
		let role = match native["role"].as_str() {
			Some("assistant") => Role::Assistant,
			_ => Role::User,
		};
		match &native["content"] {
			Value::String(text) => messages.push(Message::text(role, text.clone())),
			Value::Array(blocks) => {
				let mut tool_calls: Vec<ToolCall> = Vec::new();
				let mut tool_results: Vec<(String, String)> = Vec::new();
				let mut plain: Vec<Value> = Vec::new();
				for block in blocks {
					match block["type"].as_str() {
						Some("tool_use") => {
							let Some(name) = block["name"].as_str() else {
								continue;
							};
							tool_calls.push(ToolCall {
								id: block["id"].as_str().unwrap_or("call_0").to_string(),
								r#type: "function".to_string(),
								function: crate::llm::universal::FunctionCall {
									name: name.to_string(),
									arguments: block
										.get("input")
										.map(|i| i.to_string())
										.unwrap_or_else(|| "{}".to_string()),
								},
							});
						},
						Some("tool_result") => {
							let id = block["tool_use_id"]
								.as_str()
								.or_else(|| block["toolUseId"].as_str())
								.unwrap_or_default()
								.to_string();
							let content = match &block["content"] {
								Value::String(s) => s.clone(),
								other if !other.is_null() => other.to_string(),
								_ => String::new(),
							};
							tool_results.push((id, content));
						},
						_ => plain.push(block.clone()),
					}
				}
				if !tool_results.is_empty() {
					for (id, content) in tool_results {
						messages.push(Message {
							role: Role::Tool,
							name: None,
							content: Some(Content::Text(content)),
							tool_calls: None,
							tool_call_id: Some(id),
							thought_signature: None,
							reasoning_content: None,
						});
					}
					push_parts(&mut messages, role, blocks_to_parts(&plain));
					continue;
				}
				if !tool_calls.is_empty() {
					messages.push(Message {
						role: Role::Assistant,
						name: None,
						content: None,
						tool_calls: Some(tool_calls),
						tool_call_id: None,
						thought_signature: None,
						reasoning_content: None,
					});
					continue;
				}
				push_parts(&mut messages, role, blocks_to_parts(blocks));
			},
			_ => {},
		}
	}

	if messages.is_empty() {
		messages.push(Message::text(Role::User, ""));
	}

	let model = body["model"]
		.as_str()
		.map(str::to_string)
		.or_else(|| params.model.clone())
		.unwrap_or_default();

	let mut req = Request {
		model,
		messages,
		..Default::default()
	};
	req.temperature = body["temperature"].as_f64();
	req.top_p = body["top_p"].as_f64();
	req.top_k = body["top_k"].as_u64().map(|k| k as u32);
	req.max_tokens = body["max_tokens"].as_u64();
	req.stream = body["stream"].as_bool();
	if !body["thinking"].is_null() {
		req.thinking = Some(body["thinking"].clone());
	}
	req.tools = parse_tools(body);
	req.tool_choice = parse_tool_choice(body);
	Ok(req)
}

fn parse_tools(body: &Value) -> Option<Vec<crate::llm::universal::Tool>> {
	let tools: Vec<crate::llm::universal::Tool> = body["tools"]
		.as_array()?
		.iter()
		.filter_map(|t| {
			let name = t["name"].as_str()?;
			Some(crate::llm::universal::Tool {
				r#type: "function".to_string(),
				function: crate::llm::universal::FunctionDefinition {
					name: name.to_string(),
					description: t["description"].as_str().map(str::to_string),
					parameters: t.get("input_schema").filter(|s| s.is_object()).cloned(),
				},
			})
		})
		.collect();
	if tools.is_empty() { None } else { Some(tools) }
}

fn parse_tool_choice(body: &Value) -> Option<Value> {
	let choice = body.get("tool_choice")?;
	match choice {
		Value::String(s) => Some(json!(s)),
		Value::Object(o) => match o.get("type").and_then(|t| t.as_str()) {
			Some("auto") => Some(json!("auto")),
			Some("any") => Some(json!("required")),
			Some("tool") => o["name"]
				.as_str()
				.map(|name| json!({"type": "function", "function": {"name": name}})),
			_ => Some(choice.clone()),
		},
		_ => None,
	}
}

pub fn render_response(canonical: &Value, model: &str) -> Value {
	let message = &canonical["choices"][0]["message"];
	let mut content_text = String::new();
	match &message["content"] {
		Value::String(s) => content_text.push_str(s),
		Value::Array(parts) => {
			for part in parts {
				if let Some(t) = part["text"].as_str() {
					content_text.push_str(t);
				}
			}
		},
		_ => {},
	}
	let usage = &canonical["usage"];
	let mut content = vec![json!({"type": "text", "text": content_text})];
	if let Some(calls) = message["tool_calls"].as_array() {
		for call in calls {
			let input: Value = call["function"]["arguments"]
				.as_str()
				.and_then(|a| serde_json::from_str(a).ok())
				.unwrap_or_else(|| json!({}));
			content.push(json!({
				"type": "tool_use",
				"id": call["id"],
				"name": call["function"]["name"],
				"input": input,
			}));
		}
	}
	json!({
		"type": "message",
		"role": "assistant",
		"model": model,
		"content": content,
		"stop_reason": "end_turn",
		"usage": {
			"input_tokens": usage["prompt_tokens"].as_i64().unwrap_or(0),
			"output_tokens": usage["completion_tokens"].as_i64().unwrap_or(0),
		}
	})
}

pub fn render_stream(chunk: &str) -> String {
	let Some(data) = chunk.strip_prefix("data: ") else {
		return chunk.to_string();
	};
	let data = data.trim();
	if data == "[DONE]" {
		return "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n".to_string();
	}
	let Ok(canonical) = serde_json::from_str::<Value>(data) else {
		return chunk.to_string();
	};
	let Some(delta) = canonical["choices"][0].get("delta") else {
		return String::new();
	};
	let text = delta["reasoning_content"]
		.as_str()
		.filter(|s| !s.is_empty())
		.or_else(|| delta["content"].as_str().filter(|s| !s.is_empty()));
	let Some(text) = text else {
		return String::new();
	};
	let event = json!({
		"type": "content_block_delta",
		"index": 0,
		"delta": {"type": "text_delta", "text": text},
	});
	format!("event: content_block_delta\ndata: {event}\n\n")
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn system_and_blocks_parse() {
		let req = parse_request(
			&json!({
				"model": "claude-3-7-sonnet",
				"system": [{"type": "text", "text": "be terse"}],
				"messages": [
					{"role": "user", "content": "hi"},
					{"role": "assistant", "content": [
						{"type": "tool_use", "id": "toolu_1", "name": "f", "input": {"a": 1}}
					]},
					{"role": "user", "content": [
						{"type": "tool_result", "tool_use_id": "toolu_1", "content": "42"}
					]}
				],
				"max_tokens": 64,
				"stream": true
			}),
			&PathParams::default(),
		)
		.unwrap();
		assert_eq!(req.messages[0].role, Role::System);
		assert_eq!(req.messages[1].role, Role::User);
		let assistant = &req.messages[2];
		assert_eq!(assistant.role, Role::Assistant);
		assert_eq!(assistant.tool_calls.as_ref().unwrap()[0].function.name, "f");
		let tool = &req.messages[3];
		assert_eq!(tool.role, Role::Tool);
		assert_eq!(tool.tool_call_id.as_deref(), Some("toolu_1"));
		assert_eq!(req.max_tokens, Some(64));
		assert!(req.stream());
	}

	#[test]
	fn tool_choice_any_is_required() {
		let body = json!({"tool_choice": {"type": "any"}});
		assert_eq!(parse_tool_choice(&body), Some(json!("required")));
		let body = json!({"tool_choice": {"type": "tool", "name": "f"}});
		assert_eq!(
			parse_tool_choice(&body),
			Some(json!({"type": "function", "function": {"name": "f"}}))
		);
	}

	#[test]
	fn stream_rendering_wraps_text_deltas() {
		let out = render_stream("data: {\"choices\":[{\"delta\":{\"content\":\"hel\"}}]}\n\n");
		assert!(out.starts_with("event: content_block_delta\n"));
		assert!(out.contains("\"text\":\"hel\""));
		assert_eq!(
			render_stream("data: [DONE]\n\n"),
			"event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n"
		);
		// usage-only chunks are dropped
		assert_eq!(render_stream("data: {\"choices\":[],\"usage\":{}}\n\n"), "");
	}

	#[test]
	fn response_rendering_produces_message_shape() {
		let canonical = json!({
			"choices": [{"message": {"role": "assistant", "content": "hi", "tool_calls": [
				{"id": "call_1", "type": "function", "function": {"name": "f", "arguments": "{\"a\":1}"}}
			]}}],
			"usage": {"prompt_tokens": 3, "completion_tokens": 5}
		});
		let out = render_response(&canonical, "claude-3-7-sonnet");
		assert_eq!(out["type"], "message");
		assert_eq!(out["content"][0]["text"], "hi");
		assert_eq!(out["content"][1]["type"], "tool_use");
		assert_eq!(out["content"][1]["input"]["a"], 1);
		assert_eq!(out["usage"]["input_tokens"], 3);
	}
}
