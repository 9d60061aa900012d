//! Google Gemini upstream (generativelanguage API).
//!
//! Header auth only (`x-goog-api-key`), v1beta surface. Request conversion
//! covers systemInstruction hoisting, inline images, function calls with
//! thought signatures, tool-schema sanitization, safety settings, and the
//! thinking-budget model-suffix convention. Stream parsing walks candidate
//! parts and fails fast on blocked prompts.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value, json};
use tracing::error;

use super::universal::{self, ChunkBuilder, Content, ContentPart, FunctionCallDelta, Role, ToolCall,
	ToolCallDelta, Usage};
use super::{AIError, BuiltRequest, SseStream, check_response, post_json, send_stream, sse_events,
	upstream_model};
use crate::config::ProviderRuntime;

pub const DEFAULT_BASE: &str = "https://generativelanguage.googleapis.com";
pub const API_VERSION: &str = "v1beta";
pub const MAX_OUTPUT_TOKENS: u64 = 65_536;

static THINK_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r".*-think-(-?\d+)$").expect("valid regex"));

/// The model segment used in the URL: upstream name minus the gateway-local
/// `-think-N` / `-search` suffixes.
pub fn url_model(upstream: &str) -> String {
	let model = THINK_SUFFIX
		.captures(upstream)
		.and_then(|c| c.get(1))
		.map(|m| {
			let suffix_len = "-think-".len() + m.as_str().len();
			upstream[..upstream.len() - suffix_len].to_string()
		})
		.unwrap_or_else(|| upstream.to_string());
	model.trim_end_matches("-search").to_string()
}

fn origin(provider: &ProviderRuntime) -> String {
	let base = provider.base_url();
	if base.is_empty() {
		return DEFAULT_BASE.to_string();
	}
	url::Url::parse(base)
		.ok()
		.and_then(|u| {
			u.host_str().map(|h| match u.port() {
				Some(port) => format!("{}://{h}:{port}", u.scheme()),
				None => format!("{}://{h}", u.scheme()),
			})
		})
		.unwrap_or_else(|| DEFAULT_BASE.to_string())
}

pub fn build_request(
	req: &universal::Request,
	provider: &ProviderRuntime,
	api_key: Option<&str>,
) -> Result<BuiltRequest, AIError> {
	let upstream = upstream_model(provider, &req.model);
	let model = url_model(&upstream);
	let action = if req.stream() {
		"streamGenerateContent?alt=sse"
	} else {
		"generateContent"
	};
	let url = format!("{}/{API_VERSION}/models/{model}:{action}", origin(provider));
	let body = translate_request(req, &req.model, &upstream)?;
	let mut built = BuiltRequest::new(url, body);
	if let Some(key) = api_key {
		built = built.sensitive_header("x-goog-api-key", key);
	}
	Ok(built)
}

fn inline_data_part(url: &str) -> Option<Value> {
	let rest = url.strip_prefix("data:")?;
	let (mime_type, data) = rest.split_once(";base64,")?;
	Some(json!({"inlineData": {"mimeType": mime_type, "data": data}}))
}

/// Resolve the function name for a tool-result message by scanning earlier
/// assistant tool calls for the matching id.
fn tool_name_for(req: &universal::Request, tool_call_id: &str) -> String {
	for msg in &req.messages {
		if let Some(calls) = &msg.tool_calls {
			for call in calls {
				if call.id == tool_call_id {
					return call.function.name.clone();
				}
			}
		}
	}
	"function".to_string()
}

pub(super) fn translate_request(
	req: &universal::Request,
	alias: &str,
	upstream: &str,
) -> Result<Value, AIError> {
	let mut contents: Vec<Value> = Vec::new();
	let mut system_text = String::new();

	for msg in &req.messages {
		match msg.role {
			Role::System => {
				if let Some(content) = &msg.content {
					if !system_text.is_empty() {
						system_text.push('\n');
					}
					system_text.push_str(&content.text());
				}
			},
			Role::Tool | Role::Function => {
				let name = msg
					.name
					.clone()
					.unwrap_or_else(|| tool_name_for(req, msg.tool_call_id.as_deref().unwrap_or_default()));
				contents.push(json!({
					"role": "function",
					"parts": [{
						"functionResponse": {
							"name": name,
							"response": {"result": msg.content.as_ref().map(|c| c.text()).unwrap_or_default()},
						}
					}]
				}));
			},
			_ => {
				let role = match msg.role {
					Role::Assistant | Role::Model => "model",
					_ => "user",
				};
				let mut parts: Vec<Value> = Vec::new();
				match &msg.content {
					Some(Content::Text(t)) => parts.push(json!({"text": t})),
					Some(Content::Parts(items)) => {
						for item in items {
							match item {
								ContentPart::Text { text } => parts.push(json!({"text": text})),
								ContentPart::ImageUrl { image_url } => {
									if let Some(part) = inline_data_part(&image_url.url) {
										parts.push(part);
									}
								},
							}
						}
					},
					None => {},
				}
				if let Some(calls) = &msg.tool_calls {
					for (i, call) in calls.iter().enumerate() {
						let args: Value =
							serde_json::from_str(&call.function.arguments).unwrap_or_else(|_| json!({}));
						let mut part = json!({
							"functionCall": {"name": call.function.name, "args": args}
						});
						// Only the first call of a model turn may carry the signature.
						if i == 0 && let Some(sig) = &msg.thought_signature {
							part["thoughtSignature"] = json!(sig);
						}
						parts.push(part);
					}
				}
				if !parts.is_empty() {
					contents.push(json!({"role": role, "parts": parts}));
				}
			},
		}
	}

	let mut body = Map::new();
	body.insert("contents".to_string(), Value::Array(contents));
	if !system_text.is_empty() {
		body.insert(
			"systemInstruction".to_string(),
			json!({"parts": [{"text": system_text}]}),
		);
	}
	body.insert(
		"safetySettings".to_string(),
		safety_settings(upstream),
	);

	let mut generation = Map::new();
	if let Some(t) = req.temperature {
		generation.insert("temperature".to_string(), json!(t));
	}
	if let Some(p) = req.top_p {
		generation.insert("topP".to_string(), json!(p));
	}
	if let Some(k) = req.top_k {
		generation.insert("topK".to_string(), json!(k));
	}
	if let Some(max) = req.max_tokens() {
		generation.insert(
			"maxOutputTokens".to_string(),
			json!(max.min(MAX_OUTPUT_TOKENS)),
		);
	}
	let stops = req.stop_sequences();
	if !stops.is_empty() {
		generation.insert("stopSequences".to_string(), json!(stops));
	}
	if upstream.contains("-image") {
		generation.insert("responseModalities".to_string(), json!(["Text", "Image"]));
	}
	if let Some(thinking) = thinking_config(alias, upstream) {
		generation.insert("thinkingConfig".to_string(), thinking);
	}
	if !generation.is_empty() {
		body.insert("generationConfig".to_string(), Value::Object(generation));
	}

	let mut tool_groups: Vec<Value> = Vec::new();
	if alias.ends_with("-search") || upstream.ends_with("-search") {
		tool_groups.push(json!({"googleSearch": {}}));
	}
	if let Some(tools) = &req.tools {
		let declarations: Vec<Value> = tools
			.iter()
			.map(|t| {
				json!({
					"name": t.function.name,
					"description": t.function.description,
					"parameters": t
						.function
						.parameters
						.as_ref()
						.map(sanitize_tool_schema)
						.unwrap_or_else(|| json!({"type": "object"})),
				})
			})
			.collect();
		tool_groups.push(json!({"function_declarations": declarations}));
		body.insert(
			"tool_config".to_string(),
			json!({"function_calling_config": tool_config(&req.tool_choice)}),
		);
	}
	if !tool_groups.is_empty() {
		body.insert("tools".to_string(), Value::Array(tool_groups));
	}

	Ok(Value::Object(body))
}

fn tool_config(choice: &Option<Value>) -> Value {
	match choice {
		Some(Value::String(s)) => match s.as_str() {
			"required" => json!({"mode": "ANY"}),
			"none" => json!({"mode": "NONE"}),
			_ => json!({"mode": "AUTO"}),
		},
		Some(Value::Object(o)) => match o["function"]["name"].as_str() {
			Some(name) => json!({"mode": "ANY", "allowed_function_names": [name]}),
			None => json!({"mode": "AUTO"}),
		},
		_ => json!({"mode": "AUTO"}),
	}
}

const HARM_CATEGORIES: &[&str] = &[
	"HARM_CATEGORY_HARASSMENT",
	"HARM_CATEGORY_HATE_SPEECH",
	"HARM_CATEGORY_SEXUALLY_EXPLICIT",
	"HARM_CATEGORY_DANGEROUS_CONTENT",
];

fn safety_settings(upstream: &str) -> Value {
	// Flagship 2.x models accept the OFF threshold; older ones only BLOCK_NONE.
	let threshold = if upstream.contains("gemini-2.0") || upstream.contains("gemini-2.5") {
		"OFF"
	} else {
		"BLOCK_NONE"
	};
	let mut settings: Vec<Value> = HARM_CATEGORIES
		.iter()
		.map(|c| json!({"category": c, "threshold": threshold}))
		.collect();
	settings.push(json!({
		"category": "HARM_CATEGORY_CIVIC_INTEGRITY",
		"threshold": "BLOCK_NONE"
	}));
	Value::Array(settings)
}

/// `alias` ends with `-think-<budget>`: clamp the budget by model family and
/// emit a thinkingConfig. Without the suffix, 2.5 non-image models default to
/// `includeThoughts: true`.
pub(super) fn thinking_config(alias: &str, upstream: &str) -> Option<Value> {
	if let Some(caps) = THINK_SUFFIX.captures(alias) {
		let requested: i64 = caps[1].parse().unwrap_or(0);
		let budget = clamp_thinking_budget(requested, upstream);
		return Some(json!({
			"includeThoughts": budget != 0,
			"thinkingBudget": budget,
		}));
	}
	if upstream.contains("2.5") && !upstream.contains("-image") {
		return Some(json!({"includeThoughts": true}));
	}
	None
}

fn clamp_thinking_budget(requested: i64, upstream: &str) -> i64 {
	if upstream.contains("pro") {
		requested.clamp(128, 32_768)
	} else if upstream.contains("flash-lite") {
		if requested == 0 {
			0
		} else {
			requested.clamp(512, 24_576)
		}
	} else {
		requested.clamp(0, 24_576)
	}
}

const REMOVED_SCHEMA_KEYS: &[&str] = &[
	"additionalProperties",
	"exclusiveMinimum",
	"exclusiveMaximum",
	"minLength",
	"maxLength",
	"pattern",
	"$schema",
	"dependencies",
	"dependentRequired",
	"dependentSchemas",
	"unevaluatedProperties",
	"unevaluatedItems",
];

/// Strip JSON-Schema features the API rejects. `default` folds into the
/// description, `required` is intersected with the declared properties, and
/// the cleanup recurses into `properties.*` and `items`. Idempotent.
pub fn sanitize_tool_schema(schema: &Value) -> Value {
	let Value::Object(map) = schema else {
		return schema.clone();
	};
	let mut out = Map::new();
	for (k, v) in map {
		if REMOVED_SCHEMA_KEYS.contains(&k.as_str()) || k == "default" {
			continue;
		}
		out.insert(k.clone(), v.clone());
	}
	if let Some(default) = map.get("default") {
		let existing = out
			.get("description")
			.and_then(|d| d.as_str())
			.unwrap_or("")
			.to_string();
		let rendered = match default {
			Value::String(s) => s.clone(),
			other => other.to_string(),
		};
		out.insert(
			"description".to_string(),
			Value::String(format!("{existing}\nDefault: {rendered}")),
		);
	}
	if let Some(Value::Object(props)) = map.get("properties") {
		let cleaned: Map<String, Value> = props
			.iter()
			.map(|(k, v)| (k.clone(), sanitize_tool_schema(v)))
			.collect();
		if let Some(Value::Array(required)) = map.get("required") {
			let kept: Vec<Value> = required
				.iter()
				.filter(|r| r.as_str().map(|s| cleaned.contains_key(s)).unwrap_or(false))
				.cloned()
				.collect();
			out.insert("required".to_string(), Value::Array(kept));
		}
		out.insert("properties".to_string(), Value::Object(cleaned));
	} else {
		out.remove("required");
	}
	if let Some(items) = map.get("items") {
		out.insert("items".to_string(), sanitize_tool_schema(items));
	}
	Value::Object(out)
}

struct PartSink<'a> {
	chunks: &'a ChunkBuilder,
	tool_index: &'a AtomicU32,
	frames: Vec<String>,
}

impl PartSink<'_> {
	fn take(&mut self) -> Vec<String> {
		std::mem::take(&mut self.frames)
	}

	fn part(&mut self, part: &Value) {
		if let Some(text) = part["text"].as_str() {
			if part["thought"].as_bool().unwrap_or(false) {
				self.frames.push(universal::sse_frame(&self.chunks.reasoning(text)));
			} else {
				self.frames.push(universal::sse_frame(&self.chunks.content(text)));
			}
		}
		if let Some(inline) = part.get("inlineData").filter(|v| v.is_object()) {
			let mime = inline["mimeType"].as_str().unwrap_or("image/png");
			let data = inline["data"].as_str().unwrap_or_default();
			self.frames.push(universal::sse_frame(
				&self.chunks.content(format!("![image](data:{mime};base64,{data})")),
			));
		}
		if let Some(call) = part.get("functionCall").filter(|v| v.is_object()) {
			let index = self.tool_index.fetch_add(1, Ordering::Relaxed);
			let delta = universal::Delta {
				tool_calls: Some(vec![ToolCallDelta {
					index,
					id: Some(format!("call_{}", uuid::Uuid::new_v4().simple())),
					r#type: Some("function".to_string()),
					function: FunctionCallDelta {
						name: call["name"].as_str().map(str::to_string),
						arguments: Some(call["args"].to_string()),
					},
				}]),
				..Default::default()
			};
			self.frames.push(universal::sse_frame(&self.chunks.chunk(delta, None)));
		}
	}
}

fn usage_from(metadata: &Value) -> Usage {
	Usage {
		prompt_tokens: metadata["promptTokenCount"].as_i64().unwrap_or(0),
		completion_tokens: metadata["candidatesTokenCount"].as_i64().unwrap_or(0),
		total_tokens: metadata["totalTokenCount"].as_i64().unwrap_or(0),
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
	let chunks = ChunkBuilder::new(model);
	let stream = async_stream::try_stream! {
		futures_util::pin_mut!(events);
		let tool_index = AtomicU32::new(0);
		let mut last_usage: Option<Usage> = None;
		let mut finished = false;
		while let Some(event) = events.next().await {
			let event = event?;
			let Ok(payload) = serde_json::from_str::<Value>(&event.data) else {
				continue;
			};
			if let Some(reason) = payload["promptFeedback"]["blockReason"].as_str() {
				Err::<(), AIError>(AIError::ContentBlocked(reason.to_string()))?;
			}
			let candidate = &payload["candidates"][0];
			{
				let mut sink = PartSink { chunks: &chunks, tool_index: &tool_index, frames: vec![] };
				for part in candidate["content"]["parts"].as_array().unwrap_or(&vec![]) {
					sink.part(part);
				}
				for frame in sink.take() {
					yield frame;
				}
			}
			if payload["usageMetadata"].is_object() {
				last_usage = Some(usage_from(&payload["usageMetadata"]));
			}
			if let Some(reason) = candidate["finishReason"].as_str() {
				if reason != "STOP" {
					Err::<(), AIError>(AIError::Stream(
						json!({"error": {"message": format!("finishReason: {reason}"), "finishReason": reason}})
							.to_string(),
					))?;
				}
				if let Some(usage) = last_usage.take() {
					yield universal::sse_frame(&chunks.usage(usage));
				}
				yield universal::sse_frame(&chunks.finish("stop"));
				finished = true;
			}
		}
		if !finished && let Some(usage) = last_usage.take() {
			yield universal::sse_frame(&chunks.usage(usage));
		}
		yield universal::DONE_FRAME.to_string();
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

/// The non-stream body is a single object or a list of chunks; parts from
/// every element are merged.
pub(super) fn translate_response(body: &Value, model: &str) -> Result<universal::Response, AIError> {
	let elements: Vec<&Value> = match body {
		Value::Array(items) => items.iter().collect(),
		other => vec![other],
	};
	if elements.is_empty() {
		return Err(AIError::MissingField("candidates"));
	}
	let mut content = String::new();
	let mut reasoning = String::new();
	let mut tool_calls: Vec<ToolCall> = Vec::new();
	let mut usage = Usage::default();
	let mut role = None;
	for element in &elements {
		if let Some(reason) = element["promptFeedback"]["blockReason"].as_str() {
			return Err(AIError::ContentBlocked(reason.to_string()));
		}
		let candidate = &element["candidates"][0];
		for part in candidate["content"]["parts"].as_array().unwrap_or(&vec![]) {
			if let Some(text) = part["text"].as_str() {
				if part["thought"].as_bool().unwrap_or(false) {
					reasoning.push_str(text);
				} else {
					content.push_str(text);
				}
			}
			if let Some(inline) = part.get("inlineData").filter(|v| v.is_object()) {
				let mime = inline["mimeType"].as_str().unwrap_or("image/png");
				let data = inline["data"].as_str().unwrap_or_default();
				content.push_str(&format!("![image](data:{mime};base64,{data})"));
			}
			if let Some(call) = part.get("functionCall").filter(|v| v.is_object()) {
				tool_calls.push(ToolCall {
					id: format!("call_{}", uuid::Uuid::new_v4().simple()),
					r#type: "function".to_string(),
					function: universal::FunctionCall {
						name: call["name"].as_str().unwrap_or_default().to_string(),
						arguments: call["args"].to_string(),
					},
				});
			}
		}
		if element["usageMetadata"].is_object() {
			usage = usage_from(&element["usageMetadata"]);
		}
		if let Some(r) = candidate["content"]["role"].as_str() {
			role = Some(r.to_string());
		}
	}
	match role.as_deref() {
		Some("model") => {},
		other => error!(role = ?other, "unexpected candidate role, defaulting to assistant"),
	}
	let finish = if tool_calls.is_empty() {
		"stop"
	} else {
		"tool_calls"
	};
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
		Some(finish.to_string()),
		usage,
	))
}

pub async fn list_models(
	client: &reqwest::Client,
	provider: &ProviderRuntime,
	api_key: Option<&str>,
) -> Result<Vec<String>, AIError> {
	let url = format!("{}/{API_VERSION}/models", origin(provider));
	let mut req = client.get(url);
	if let Some(key) = api_key {
		req = req.header("x-goog-api-key", key);
	}
	let resp = check_response(req.send().await?, "models").await?;
	let body = resp.json::<Value>().await?;
	Ok(
		body["models"]
			.as_array()
			.map(|items| {
				items
					.iter()
					.filter_map(|m| m["name"].as_str())
					.map(|name| name.trim_start_matches("models/").to_string())
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
	fn thinking_budget_clamps_by_family() {
		let cfg = thinking_config("gemini-2.5-pro-think-50", "gemini-2.5-pro").unwrap();
		assert_eq!(cfg["thinkingBudget"], 128);
		assert_eq!(cfg["includeThoughts"], true);

		let cfg =
			thinking_config("gemini-2.5-flash-lite-think-100", "gemini-2.5-flash-lite").unwrap();
		assert_eq!(cfg["thinkingBudget"], 512);
		assert_eq!(cfg["includeThoughts"], true);

		let cfg = thinking_config("gemini-2.5-flash-think-0", "gemini-2.5-flash").unwrap();
		assert_eq!(cfg["thinkingBudget"], 0);
		assert_eq!(cfg["includeThoughts"], false);

		let cfg = thinking_config("gemini-2.5-pro-think--5", "gemini-2.5-pro").unwrap();
		assert_eq!(cfg["thinkingBudget"], 128);
	}

	#[test]
	fn default_thinking_on_25_models_only() {
		let cfg = thinking_config("gemini-2.5-flash", "gemini-2.5-flash").unwrap();
		assert_eq!(cfg, json!({"includeThoughts": true}));
		assert!(thinking_config("gemini-2.0-flash", "gemini-2.0-flash").is_none());
		assert!(thinking_config("gemini-2.5-flash-image", "gemini-2.5-flash-image").is_none());
	}

	#[test]
	fn schema_sanitization_matches_contract() {
		let input = json!({
			"type": "object",
			"properties": {"x": {"type": "integer", "default": 1, "exclusiveMinimum": 0}},
			"required": ["x", "y"],
			"additionalProperties": false
		});
		let expected = json!({
			"type": "object",
			"properties": {"x": {"type": "integer", "description": "\nDefault: 1"}},
			"required": ["x"]
		});
		assert_eq!(sanitize_tool_schema(&input), expected);
	}

	#[test]
	fn schema_sanitization_is_idempotent() {
		let input = json!({
			"$schema": "http://json-schema.org/draft-07/schema#",
			"type": "object",
			"properties": {
				"a": {"type": "string", "pattern": "^x", "minLength": 2, "default": "q"},
				"b": {"type": "array", "items": {"type": "integer", "exclusiveMaximum": 5}}
			},
			"required": ["a", "b", "ghost"],
			"dependentRequired": {"a": ["b"]}
		});
		let once = sanitize_tool_schema(&input);
		let twice = sanitize_tool_schema(&once);
		assert_eq!(once, twice);
		assert_eq!(once["required"], json!(["a", "b"]));
		assert!(once["properties"]["a"]["description"].as_str().unwrap().contains("Default: q"));
		assert!(once["properties"]["b"]["items"].get("exclusiveMaximum").is_none());
	}

	#[test]
	fn url_model_strips_local_suffixes() {
		assert_eq!(url_model("gemini-2.5-pro-think-128"), "gemini-2.5-pro");
		assert_eq!(url_model("gemini-2.5-flash-search"), "gemini-2.5-flash");
		assert_eq!(url_model("gemini-2.0-flash"), "gemini-2.0-flash");
	}

	#[test]
	fn request_translation_hoists_system_and_maps_roles() {
		let req = request(json!({
			"model": "gemini-2.5-pro",
			"messages": [
				{"role": "system", "content": "be terse"},
				{"role": "user", "content": "hi"},
				{"role": "assistant", "content": "hello", "thoughtSignature": "sig", "tool_calls": [
					{"id": "call_1", "type": "function", "function": {"name": "f", "arguments": "{\"a\":1}"}}
				]},
				{"role": "tool", "tool_call_id": "call_1", "content": "42"}
			],
			"max_tokens": 1000000,
			"top_p": 0.9
		}));
		let body = translate_request(&req, "gemini-2.5-pro", "gemini-2.5-pro").unwrap();
		assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be terse");
		assert_eq!(body["contents"][0]["role"], "user");
		assert_eq!(body["contents"][1]["role"], "model");
		let model_parts = body["contents"][1]["parts"].as_array().unwrap();
		assert_eq!(model_parts[0]["text"], "hello");
		assert_eq!(model_parts[1]["functionCall"]["name"], "f");
		assert_eq!(model_parts[1]["thoughtSignature"], "sig");
		assert_eq!(body["contents"][2]["role"], "function");
		assert_eq!(
			body["contents"][2]["parts"][0]["functionResponse"]["name"],
			"f"
		);
		assert_eq!(
			body["generationConfig"]["maxOutputTokens"],
			MAX_OUTPUT_TOKENS
		);
		assert_eq!(body["generationConfig"]["topP"], 0.9);
		assert_eq!(
			body["generationConfig"]["thinkingConfig"],
			json!({"includeThoughts": true})
		);
	}

	#[test]
	fn safety_thresholds_by_model_generation() {
		let settings = safety_settings("gemini-2.5-pro");
		let arr = settings.as_array().unwrap();
		assert_eq!(arr.len(), 5);
		assert_eq!(arr[0]["threshold"], "OFF");
		assert_eq!(arr[4]["category"], "HARM_CATEGORY_CIVIC_INTEGRITY");
		assert_eq!(arr[4]["threshold"], "BLOCK_NONE");

		let settings = safety_settings("gemini-1.5-pro");
		assert_eq!(settings[0]["threshold"], "BLOCK_NONE");
	}

	#[test]
	fn tool_choice_modes() {
		assert_eq!(tool_config(&Some(json!("required")))["mode"], "ANY");
		assert_eq!(tool_config(&Some(json!("none")))["mode"], "NONE");
		assert_eq!(tool_config(&None)["mode"], "AUTO");
		let named = tool_config(&Some(json!({"type": "function", "function": {"name": "f"}})));
		assert_eq!(named["mode"], "ANY");
		assert_eq!(named["allowed_function_names"], json!(["f"]));
	}

	#[test]
	fn non_stream_response_merges_multi_part() {
		let body = json!([
			{"candidates": [{"content": {"role": "model", "parts": [
				{"thought": true, "text": "thinking..."},
				{"text": "part one "}
			]}}]},
			{"candidates": [{"content": {"role": "model", "parts": [{"text": "part two"}]},
				"finishReason": "STOP"}],
			 "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 7, "totalTokenCount": 10}}
		]);
		let out = translate_response(&body, "gemini-2.5-pro").unwrap();
		let choice = &out.choices[0];
		assert_eq!(choice.message.content.as_deref(), Some("part one part two"));
		assert_eq!(choice.message.reasoning_content.as_deref(), Some("thinking..."));
		assert_eq!(out.usage.as_ref().unwrap().total_tokens, 10);
	}

	#[test]
	fn blocked_prompt_is_an_error() {
		let body = json!({"promptFeedback": {"blockReason": "PROHIBITED_CONTENT"}});
		let err = translate_response(&body, "gemini-2.5-pro").unwrap_err();
		assert!(err.to_string().contains("Gemini Blocked"));
		assert!(err.to_string().contains("PROHIBITED_CONTENT"));
	}
}
