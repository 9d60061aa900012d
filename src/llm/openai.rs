//! OpenAI and OpenAI-compatible upstreams.
//!
//! Chat completions are nearly identity on the canonical request; the
//! Responses variant gets its own payload shape and stream translation.

use std::time::Duration;

use futures_util::StreamExt;
use serde_json::{Value, json};

use super::universal::{self, ChunkBuilder, Usage};
use super::{AIError, BaseApi, BuiltRequest, Engine, SseStream, check_response, post_json,
	send_stream, sse_events, upstream_model};
use crate::config::ProviderRuntime;

/// Fields OpenAI chat completions rejects.
const UNSUPPORTED_FIELDS: &[&str] = &["top_k", "thinking"];

pub fn build_request(
	engine: Engine,
	req: &universal::Request,
	provider: &ProviderRuntime,
	api_key: Option<&str>,
) -> Result<BuiltRequest, AIError> {
	let api = BaseApi::parse(provider.base_url())?;
	let model = upstream_model(provider, &req.model);
	let url = match engine {
		Engine::Embedding => api.embeddings(),
		Engine::Dalle => api.images(),
		Engine::Tts => api.audio_speech(),
		Engine::Whisper => api.audio_transcriptions(),
		Engine::Moderation => api.moderations(),
		_ => api.chat(),
	};
	let body = match engine {
		Engine::Embedding | Engine::Dalle | Engine::Tts | Engine::Whisper | Engine::Moderation => {
			// These payloads are native already; only the model is rewritten.
			let mut body = serde_json::Map::new();
			body.insert("model".to_string(), Value::String(model));
			for (k, v) in &req.extra_body {
				body.insert(k.clone(), v.clone());
			}
			Value::Object(body)
		},
		_ => chat_payload(req, &model)?,
	};
	let mut built = BuiltRequest::new(url, body);
	if let Some(key) = api_key {
		built = built.sensitive_header("authorization", &format!("Bearer {key}"));
	}
	Ok(built)
}

pub(super) fn chat_payload(req: &universal::Request, model: &str) -> Result<Value, AIError> {
	let mut value = serde_json::to_value(req).map_err(AIError::RequestMarshal)?;
	let body = value
		.as_object_mut()
		.ok_or(AIError::MissingField("request body"))?;
	body.insert("model".to_string(), Value::String(model.to_string()));
	for field in UNSUPPORTED_FIELDS {
		body.remove(*field);
	}
	// Usage arrives on the final SSE event; without it the stats row has no
	// token counts.
	if req.stream() && !body.contains_key("stream_options") {
		body.insert("stream_options".to_string(), json!({"include_usage": true}));
	}
	Ok(value)
}

pub async fn stream_response(
	client: &reqwest::Client,
	built: BuiltRequest,
	_model: &str,
	timeout: Duration,
) -> Result<SseStream, AIError> {
	let resp = send_stream(client, &built, timeout).await?;
	let events = sse_events(resp);
	let stream = async_stream::try_stream! {
		futures_util::pin_mut!(events);
		while let Some(event) = events.next().await {
			let event = event?;
			if event.data == "[DONE]" {
				yield universal::DONE_FRAME.to_string();
				break;
			}
			yield format!("data: {}\n\n", event.data);
		}
	};
	Ok(Box::pin(stream))
}

pub async fn fetch_response(
	client: &reqwest::Client,
	built: BuiltRequest,
	_model: &str,
	timeout: Duration,
) -> Result<Value, AIError> {
	let resp = post_json(client, &built, Some(timeout)).await?;
	let body = resp.json::<Value>().await?;
	Ok(body)
}

pub async fn list_models(
	client: &reqwest::Client,
	provider: &ProviderRuntime,
	api_key: Option<&str>,
) -> Result<Vec<String>, AIError> {
	let api = BaseApi::parse(provider.base_url())?;
	let mut req = client.get(api.models());
	if let Some(key) = api_key {
		req = req.bearer_auth(key);
	}
	let resp = check_response(req.send().await?, "models").await?;
	let body = resp.json::<Value>().await?;
	let models = body["data"]
		.as_array()
		.map(|items| {
			items
				.iter()
				.filter_map(|m| m["id"].as_str().map(str::to_string))
				.collect()
		})
		.unwrap_or_default();
	Ok(models)
}

// --- Responses API variant -------------------------------------------------

/// Chat request -> Responses payload. Unsupported knobs (`temperature`,
/// `stream_options`) are dropped, `max_tokens` becomes `max_output_tokens`,
/// tools flatten to `{type, name, description, parameters}`.
pub fn build_responses_request(
	req: &universal::Request,
	provider: &ProviderRuntime,
	api_key: Option<&str>,
) -> Result<BuiltRequest, AIError> {
	let api = BaseApi::parse(provider.base_url())?;
	let model = upstream_model(provider, &req.model);

	let input: Vec<Value> = req
		.messages
		.iter()
		.map(|m| {
			let role = match m.role {
				universal::Role::System => "developer",
				other => other.as_str(),
			};
			json!({
				"role": role,
				"content": m.content.as_ref().map(|c| c.text()).unwrap_or_default(),
			})
		})
		.collect();

	let mut body = json!({
		"model": model,
		"input": input,
	});
	let obj = body.as_object_mut().expect("literal object");
	if let Some(max) = req.max_tokens() {
		obj.insert("max_output_tokens".to_string(), json!(max));
	}
	if req.stream() {
		obj.insert("stream".to_string(), json!(true));
	}
	if let Some(tools) = &req.tools {
		let flat: Vec<Value> = tools
			.iter()
			.map(|t| {
				json!({
					"type": "function",
					"name": t.function.name,
					"description": t.function.description,
					"parameters": t.function.parameters,
				})
			})
			.collect();
		obj.insert("tools".to_string(), Value::Array(flat));
	}
	if let Some(reasoning) = &req.reasoning {
		obj.insert("reasoning".to_string(), reasoning.clone());
	}

	let mut built = BuiltRequest::new(api.responses(), body);
	if let Some(key) = api_key {
		built = built.sensitive_header("authorization", &format!("Bearer {key}"));
	}
	Ok(built)
}

pub async fn stream_responses_api(
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
		while let Some(event) = events.next().await {
			let event = event?;
			let Ok(payload) = serde_json::from_str::<Value>(&event.data) else {
				continue;
			};
			let kind = payload["type"].as_str().unwrap_or(event.event.as_str());
			match kind {
				"response.output_text.delta" => {
					if let Some(delta) = payload["delta"].as_str() {
						yield universal::sse_frame(&chunks.content(delta));
					}
				},
				"response.reasoning_summary_text.delta" | "response.reasoning_text.delta" => {
					if let Some(delta) = payload["delta"].as_str() {
						yield universal::sse_frame(&chunks.reasoning(delta));
					}
				},
				"response.completed" => {
					let usage = &payload["response"]["usage"];
					if usage.is_object() {
						yield universal::sse_frame(&chunks.usage(Usage {
							prompt_tokens: usage["input_tokens"].as_i64().unwrap_or(0),
							completion_tokens: usage["output_tokens"].as_i64().unwrap_or(0),
							total_tokens: usage["total_tokens"].as_i64().unwrap_or(0),
						}));
					}
					yield universal::sse_frame(&chunks.finish("stop"));
					yield universal::DONE_FRAME.to_string();
				},
				"response.failed" | "error" => {
					Err::<(), AIError>(AIError::Stream(payload.to_string()))?;
				},
				_ => {},
			}
		}
	};
	Ok(Box::pin(stream))
}

pub async fn fetch_responses_api(
	client: &reqwest::Client,
	built: BuiltRequest,
	model: &str,
	timeout: Duration,
) -> Result<Value, AIError> {
	let resp = post_json(client, &built, Some(timeout)).await?;
	let body = resp.json::<Value>().await?;
	let mut content = String::new();
	let mut reasoning = String::new();
	for item in body["output"].as_array().unwrap_or(&vec![]) {
		match item["type"].as_str() {
			Some("message") => {
				for part in item["content"].as_array().unwrap_or(&vec![]) {
					if let Some(text) = part["text"].as_str() {
						content.push_str(text);
					}
				}
			},
			Some("reasoning") => {
				for part in item["summary"].as_array().unwrap_or(&vec![]) {
					if let Some(text) = part["text"].as_str() {
						reasoning.push_str(text);
					}
				}
			},
			_ => {},
		}
	}
	let usage = Usage {
		prompt_tokens: body["usage"]["input_tokens"].as_i64().unwrap_or(0),
		completion_tokens: body["usage"]["output_tokens"].as_i64().unwrap_or(0),
		total_tokens: body["usage"]["total_tokens"].as_i64().unwrap_or(0),
	};
	let out = universal::build_response(
		model,
		universal::Role::Assistant,
		Some(content),
		if reasoning.is_empty() {
			None
		} else {
			Some(reasoning)
		},
		None,
		Some("stop".to_string()),
		usage,
	);
	serde_json::to_value(out).map_err(AIError::RequestMarshal)
}
