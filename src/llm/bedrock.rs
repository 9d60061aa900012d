//! AWS Bedrock upstream (Converse API).
//!
//! The provider `api` value is `ACCESS_KEY:SECRET_KEY`; requests are SigV4
//! signed against the `bedrock` service. Streaming responses arrive as an AWS
//! event stream, decoded with the event-stream codec and translated into
//! canonical chunks, including toolUse blocks streamed as tool-call deltas.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use aws_credential_types::Credentials;
use aws_event_stream_parser::{EventStreamCodec, Message};
use aws_sigv4::http_request::{SignableBody, SignableRequest, SigningSettings, sign};
use aws_sigv4::sign::v4::SigningParams;
use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;
use url::Url;

use super::universal::{self, ChunkBuilder, FunctionCallDelta, Role, ToolCall, ToolCallDelta,
	Usage};
use super::{AIError, BuiltRequest, SseStream, post_json, send_stream, upstream_model};
use crate::config::ProviderRuntime;

pub const DEFAULT_REGION: &str = "us-east-1";

fn region_from_base(base_url: &str) -> String {
	Url::parse(base_url)
		.ok()
		.and_then(|u| u.host_str().map(str::to_string))
		.and_then(|host| {
			// bedrock-runtime.<region>.amazonaws.com
			host.split('.').nth(1).map(str::to_string)
		})
		.filter(|r| r.contains('-'))
		.unwrap_or_else(|| DEFAULT_REGION.to_string())
}

fn credentials(api_key: Option<&str>) -> Result<(String, String), AIError> {
	let key = api_key.ok_or(AIError::MissingField("api"))?;
	let (access, secret) = key
		.split_once(':')
		.ok_or(AIError::MissingField("api (ACCESS_KEY:SECRET_KEY)"))?;
	Ok((access.to_string(), secret.to_string()))
}

pub fn build_request(
	req: &universal::Request,
	provider: &ProviderRuntime,
	api_key: Option<&str>,
) -> Result<BuiltRequest, AIError> {
	let model = upstream_model(provider, &req.model);
	let region = region_from_base(provider.base_url());
	let action = if req.stream() {
		"converse-stream"
	} else {
		"converse"
	};
	let url = format!("https://bedrock-runtime.{region}.amazonaws.com/model/{model}/{action}");
	let body = translate_request(req)?;

	let (access, secret) = credentials(api_key)?;
	let mut built = BuiltRequest::new(url, body);
	sign_request(&mut built, &access, &secret, &region)?;
	Ok(built)
}

pub(super) fn translate_request(req: &universal::Request) -> Result<Value, AIError> {
	let system: Vec<Value> = req
		.messages
		.iter()
		.filter(|m| m.role == Role::System)
		.filter_map(|m| m.content.as_ref())
		.map(|c| json!({"text": c.text()}))
		.collect();

	let mut messages: Vec<Value> = Vec::new();
	for msg in req.messages.iter().filter(|m| m.role != Role::System) {
		match msg.role {
			Role::Tool | Role::Function => {
				messages.push(json!({
					"role": "user",
					"content": [{
						"toolResult": {
							"toolUseId": msg.tool_call_id.clone().unwrap_or_default(),
							"content": [{"text": msg.content.as_ref().map(|c| c.text()).unwrap_or_default()}],
						}
					}]
				}));
			},
			Role::Assistant | Role::Model => {
				let mut blocks: Vec<Value> = Vec::new();
				if let Some(content) = &msg.content
					&& !content.is_empty()
				{
					blocks.push(json!({"text": content.text()}));
				}
				if let Some(calls) = &msg.tool_calls {
					for call in calls {
						let input: Value =
							serde_json::from_str(&call.function.arguments).unwrap_or_else(|_| json!({}));
						blocks.push(json!({
							"toolUse": {
								"toolUseId": call.id,
								"name": call.function.name,
								"input": input,
							}
						}));
					}
				}
				if !blocks.is_empty() {
					messages.push(json!({"role": "assistant", "content": blocks}));
				}
			},
			_ => {
				let Some(content) = &msg.content else { continue };
				messages.push(json!({"role": "user", "content": [{"text": content.text()}]}));
			},
		}
	}

	let mut inference = serde_json::Map::new();
	if let Some(max) = req.max_tokens() {
		inference.insert("maxTokens".to_string(), json!(max));
	}
	if let Some(t) = req.temperature {
		inference.insert("temperature".to_string(), json!(t));
	}
	if let Some(p) = req.top_p {
		inference.insert("topP".to_string(), json!(p));
	}
	let stops = req.stop_sequences();
	if !stops.is_empty() {
		inference.insert("stopSequences".to_string(), json!(stops));
	}

	let mut body = json!({"messages": messages});
	let obj = body.as_object_mut().expect("literal object");
	if !system.is_empty() {
		obj.insert("system".to_string(), Value::Array(system));
	}
	if !inference.is_empty() {
		obj.insert("inferenceConfig".to_string(), Value::Object(inference));
	}
	if let Some(tools) = &req.tools {
		let specs: Vec<Value> = tools
			.iter()
			.map(|t| {
				json!({
					"toolSpec": {
						"name": t.function.name,
						"description": t.function.description,
						"inputSchema": {
							"json": t
								.function
								.parameters
								.clone()
								.unwrap_or_else(|| json!({"type": "object"})),
						},
					}
				})
			})
			.collect();
		let mut tool_config = json!({"tools": specs});
		if let Some(choice) = translate_tool_choice(&req.tool_choice) {
			tool_config["toolChoice"] = choice;
		}
		obj.insert("toolConfig".to_string(), tool_config);
	}
	Ok(body)
}

fn translate_tool_choice(choice: &Option<Value>) -> Option<Value> {
	match choice {
		Some(Value::String(s)) => match s.as_str() {
			"required" => Some(json!({"any": {}})),
			"none" => None,
			_ => Some(json!({"auto": {}})),
		},
		Some(Value::Object(o)) => o["function"]["name"]
			.as_str()
			.map(|name| json!({"tool": {"name": name}})),
		_ => None,
	}
}

fn sign_request(
	built: &mut BuiltRequest,
	access_key: &str,
	secret_key: &str,
	region: &str,
) -> Result<(), AIError> {
	let body = serde_json::to_vec(&built.body).map_err(AIError::RequestMarshal)?;
	let creds = Credentials::new(access_key, secret_key, None, None, "config");
	let identity = creds.into();
	let params = SigningParams::builder()
		.identity(&identity)
		.region(region)
		.name("bedrock")
		.time(SystemTime::now())
		.settings(SigningSettings::default())
		.build()
		.map_err(|e| AIError::Auth(e.to_string()))?
		.into();

	let headers: Vec<(String, String)> = built
		.headers
		.iter()
		.filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
		.collect();
	let signable = SignableRequest::new(
		"POST",
		built.url.clone(),
		headers.iter().map(|(k, v)| (k.as_str(), v.as_str())),
		SignableBody::Bytes(&body),
	)
	.map_err(|e| AIError::Auth(e.to_string()))?;

	let (instructions, _signature) = sign(signable, &params)
		.map_err(|e| AIError::Auth(e.to_string()))?
		.into_parts();
	let mut signed = http::Request::builder()
		.method("POST")
		.uri(&built.url)
		.body(())
		.map_err(|e| AIError::Auth(e.to_string()))?;
	*signed.headers_mut() = built.headers.clone();
	instructions.apply_to_request_http1x(&mut signed);
	built.headers = signed.headers().clone();
	Ok(())
}

fn event_type(message: &Message) -> Option<String> {
	message
		.headers
		.headers
		.iter()
		.find(|h| h.key.as_str() == ":event-type")
		.and_then(|h| match &h.value {
			aws_event_stream_parser::HeaderValue::String(s) => Some(s.to_string()),
			_ => None,
		})
}

fn map_stop_reason(reason: Option<&str>) -> &'static str {
	match reason {
		Some("max_tokens") => "length",
		Some("tool_use") => "tool_calls",
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
	let bytes = resp
		.bytes_stream()
		.map(|r| r.map_err(|e| std::io::Error::other(e.to_string())));
	let reader = StreamReader::new(bytes);
	let mut frames = FramedRead::new(reader, EventStreamCodec);
	let chunks = ChunkBuilder::new(model);
	let stream = async_stream::try_stream! {
		let mut input_tokens: i64 = 0;
		// Bedrock content-block index -> canonical tool_calls index
		let mut tool_indexes: HashMap<u64, u32> = HashMap::new();
		let mut next_tool_index: u32 = 0;
		while let Some(message) = frames.next().await {
			let message = message.map_err(|e| AIError::Stream(e.to_string()))?;
			let Some(kind) = event_type(&message) else {
				continue;
			};
			let Ok(payload) = serde_json::from_slice::<Value>(&message.body) else {
				continue;
			};
			match kind.as_str() {
				"messageStart" => {
					yield universal::sse_frame(&chunks.chunk(
						universal::Delta { role: Some(Role::Assistant), ..Default::default() },
						None,
					));
				},
				"contentBlockStart" => {
					let tool_use = &payload["start"]["toolUse"];
					if tool_use.is_object() {
						let index = payload["contentBlockIndex"].as_u64().unwrap_or(0);
						let tool_index = next_tool_index;
						next_tool_index += 1;
						tool_indexes.insert(index, tool_index);
						yield universal::sse_frame(&chunks.chunk(
							universal::Delta {
								tool_calls: Some(vec![ToolCallDelta {
									index: tool_index,
									id: tool_use["toolUseId"].as_str().map(str::to_string),
									r#type: Some("function".to_string()),
									function: FunctionCallDelta {
										name: tool_use["name"].as_str().map(str::to_string),
										arguments: Some(String::new()),
									},
								}]),
								..Default::default()
							},
							None,
						));
					}
				},
				"contentBlockDelta" => {
					if let Some(text) = payload["delta"]["text"].as_str() {
						yield universal::sse_frame(&chunks.content(text));
					}
					if let Some(partial) = payload["delta"]["toolUse"]["input"].as_str() {
						let index = payload["contentBlockIndex"].as_u64().unwrap_or(0);
						let tool_index = tool_indexes.get(&index).copied().unwrap_or(0);
						yield universal::sse_frame(&chunks.chunk(
							universal::Delta {
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
				"messageStop" => {
					yield universal::sse_frame(&chunks.finish(map_stop_reason(payload["stopReason"].as_str())));
				},
				"metadata" => {
					let usage = &payload["usage"];
					if usage.is_object() {
						input_tokens = usage["inputTokens"].as_i64().unwrap_or(input_tokens);
						yield universal::sse_frame(&chunks.usage(Usage {
							prompt_tokens: input_tokens,
							completion_tokens: usage["outputTokens"].as_i64().unwrap_or(0),
							total_tokens: usage["totalTokens"].as_i64().unwrap_or(0),
						}));
					}
				},
				_ => {},
			}
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

pub(super) fn translate_response(body: &Value, model: &str) -> Result<universal::Response, AIError> {
	let mut content = String::new();
	let mut tool_calls: Vec<ToolCall> = Vec::new();
	for block in body["output"]["message"]["content"]
		.as_array()
		.unwrap_or(&vec![])
	{
		if let Some(text) = block["text"].as_str() {
			content.push_str(text);
		}
		if let Some(tool_use) = block.get("toolUse").filter(|v| v.is_object()) {
			tool_calls.push(ToolCall {
				id: tool_use["toolUseId"].as_str().unwrap_or_default().to_string(),
				r#type: "function".to_string(),
				function: universal::FunctionCall {
					name: tool_use["name"].as_str().unwrap_or_default().to_string(),
					arguments: tool_use["input"].to_string(),
				},
			});
		}
	}
	let usage = Usage {
		prompt_tokens: body["usage"]["inputTokens"].as_i64().unwrap_or(0),
		completion_tokens: body["usage"]["outputTokens"].as_i64().unwrap_or(0),
		total_tokens: body["usage"]["totalTokens"].as_i64().unwrap_or(0),
	};
	let finish = map_stop_reason(body["stopReason"].as_str());
	Ok(universal::build_response(
		model,
		Role::Assistant,
		Some(content),
		None,
		if tool_calls.is_empty() {
			None
		} else {
			Some(tool_calls)
		},
		Some(finish.to_string()),
		usage,
	))
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn region_parses_from_base_url() {
		assert_eq!(
			region_from_base("https://bedrock-runtime.eu-west-1.amazonaws.com"),
			"eu-west-1"
		);
		assert_eq!(region_from_base("https://example.com"), DEFAULT_REGION);
		assert_eq!(region_from_base(""), DEFAULT_REGION);
	}

	#[test]
	fn converse_payload_shape() {
		let req: universal::Request = serde_json::from_value(json!({
			"model": "anthropic.claude-3-5-sonnet-20241022-v2:0",
			"messages": [
				{"role": "system", "content": "be terse"},
				{"role": "user", "content": "hi"}
			],
			"max_tokens": 256,
			"temperature": 0.1
		}))
		.unwrap();
		let body = translate_request(&req).unwrap();
		assert_eq!(body["system"][0]["text"], "be terse");
		assert_eq!(body["messages"][0]["content"][0]["text"], "hi");
		assert_eq!(body["inferenceConfig"]["maxTokens"], 256);
		assert!(body.get("toolConfig").is_none());
	}

	#[test]
	fn tools_translate_to_tool_config_and_blocks() {
		let req: universal::Request = serde_json::from_value(json!({
			"model": "anthropic.claude-3-5-sonnet-20241022-v2:0",
			"messages": [
				{"role": "user", "content": "weather?"},
				{"role": "assistant", "tool_calls": [{
					"id": "tooluse_1", "type": "function",
					"function": {"name": "get_weather", "arguments": "{\"city\":\"SF\"}"}
				}]},
				{"role": "tool", "tool_call_id": "tooluse_1", "content": "sunny"}
			],
			"tools": [{"type": "function", "function": {
				"name": "get_weather", "description": "d", "parameters": {"type": "object"}
			}}],
			"tool_choice": "required"
		}))
		.unwrap();
		let body = translate_request(&req).unwrap();
		let spec = &body["toolConfig"]["tools"][0]["toolSpec"];
		assert_eq!(spec["name"], "get_weather");
		assert_eq!(spec["inputSchema"]["json"]["type"], "object");
		assert_eq!(body["toolConfig"]["toolChoice"], json!({"any": {}}));

		let tool_use = &body["messages"][1]["content"][0]["toolUse"];
		assert_eq!(tool_use["toolUseId"], "tooluse_1");
		assert_eq!(tool_use["input"]["city"], "SF");
		let tool_result = &body["messages"][2]["content"][0]["toolResult"];
		assert_eq!(tool_result["toolUseId"], "tooluse_1");
		assert_eq!(tool_result["content"][0]["text"], "sunny");
	}

	#[test]
	fn named_tool_choice_translates() {
		assert_eq!(
			translate_tool_choice(&Some(json!({"type": "function", "function": {"name": "f"}}))),
			Some(json!({"tool": {"name": "f"}}))
		);
		assert_eq!(
			translate_tool_choice(&Some(json!("auto"))),
			Some(json!({"auto": {}}))
		);
		assert!(translate_tool_choice(&Some(json!("none"))).is_none());
	}

	#[test]
	fn response_extracts_tool_use_blocks() {
		let body = json!({
			"output": {"message": {"role": "assistant", "content": [
				{"text": "checking"},
				{"toolUse": {"toolUseId": "tooluse_9", "name": "get_weather", "input": {"city": "SF"}}}
			]}},
			"stopReason": "tool_use",
			"usage": {"inputTokens": 10, "outputTokens": 5, "totalTokens": 15}
		});
		let out = translate_response(&body, "claude-on-bedrock").unwrap();
		let choice = &out.choices[0];
		assert_eq!(choice.message.content.as_deref(), Some("checking"));
		assert_eq!(choice.finish_reason.as_deref(), Some("tool_calls"));
		let calls = choice.message.tool_calls.as_ref().unwrap();
		assert_eq!(calls[0].function.name, "get_weather");
		assert_eq!(calls[0].id, "tooluse_9");
		let args: Value = serde_json::from_str(&calls[0].function.arguments).unwrap();
		assert_eq!(args["city"], "SF");
		assert_eq!(out.usage.as_ref().unwrap().total_tokens, 15);
	}

	#[test]
	fn credentials_split_on_colon() {
		let (ak, sk) = credentials(Some("AKIA123:secret/abc")).unwrap();
		assert_eq!(ak, "AKIA123");
		assert_eq!(sk, "secret/abc");
		assert!(credentials(Some("no-colon")).is_err());
		assert!(credentials(None).is_err());
	}
}
