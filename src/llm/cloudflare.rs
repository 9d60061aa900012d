//! Cloudflare Workers AI upstream.
//!
//! Account-scoped `ai/run` URLs; the native stream emits `{"response": "…"}`
//! chunks which map onto canonical content deltas.

use std::time::Duration;

use futures_util::StreamExt;
use serde_json::{Value, json};

use super::universal::{self, ChunkBuilder, Role, Usage};
use super::{AIError, BuiltRequest, SseStream, post_json, send_stream, sse_events, upstream_model};
use crate::config::ProviderRuntime;

pub fn build_request(
	req: &universal::Request,
	provider: &ProviderRuntime,
	api_key: Option<&str>,
) -> Result<BuiltRequest, AIError> {
	let account = provider
		.config
		.cf_account_id
		.as_deref()
		.ok_or(AIError::MissingField("cf_account_id"))?;
	let model = upstream_model(provider, &req.model);
	let url = format!("https://api.cloudflare.com/client/v4/accounts/{account}/ai/run/{model}");

	let messages: Vec<Value> = req
		.messages
		.iter()
		.filter_map(|m| {
			m.content.as_ref().map(|c| {
				json!({
					"role": m.role.as_str(),
					"content": c.text(),
				})
			})
		})
		.collect();
	let mut body = json!({"messages": messages});
	let obj = body.as_object_mut().expect("literal object");
	if req.stream() {
		obj.insert("stream".to_string(), json!(true));
	}
	if let Some(max) = req.max_tokens() {
		obj.insert("max_tokens".to_string(), json!(max));
	}
	if let Some(t) = req.temperature {
		obj.insert("temperature".to_string(), json!(t));
	}

	let mut built = BuiltRequest::new(url, body);
	if let Some(key) = api_key {
		built = built.sensitive_header("authorization", &format!("Bearer {key}"));
	}
	Ok(built)
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
		while let Some(event) = events.next().await {
			let event = event?;
			if event.data == "[DONE]" {
				yield universal::sse_frame(&chunks.finish("stop"));
				yield universal::DONE_FRAME.to_string();
				break;
			}
			let Ok(payload) = serde_json::from_str::<Value>(&event.data) else {
				continue;
			};
			if let Some(text) = payload["response"].as_str()
				&& !text.is_empty()
			{
				yield universal::sse_frame(&chunks.content(text));
			}
			let usage = &payload["usage"];
			if usage.is_object() {
				yield universal::sse_frame(&chunks.usage(Usage {
					prompt_tokens: usage["prompt_tokens"].as_i64().unwrap_or(0),
					completion_tokens: usage["completion_tokens"].as_i64().unwrap_or(0),
					total_tokens: usage["total_tokens"].as_i64().unwrap_or(0),
				}));
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
	let content = body["result"]["response"]
		.as_str()
		.unwrap_or_default()
		.to_string();
	let out = universal::build_response(
		model,
		Role::Assistant,
		Some(content),
		None,
		None,
		Some("stop".to_string()),
		Usage::default(),
	);
	serde_json::to_value(out).map_err(AIError::RequestMarshal)
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn account_scoped_url_and_payload() {
		let cfg: crate::config::ProviderConfig = serde_json::from_value(json!({
			"provider": "cf",
			"cf_account_id": "abc123",
			"model": ["@cf/meta/llama-3.1-8b-instruct"],
		}))
		.unwrap();
		let rc = crate::config::RuntimeConfig::build(crate::config::Config {
			providers: vec![cfg],
			..Default::default()
		});
		let req: universal::Request = serde_json::from_value(json!({
			"model": "@cf/meta/llama-3.1-8b-instruct",
			"messages": [{"role": "user", "content": "hi"}],
			"stream": true
		}))
		.unwrap();
		let built = build_request(&req, &rc.providers[0], Some("cf-token")).unwrap();
		assert_eq!(
			built.url,
			"https://api.cloudflare.com/client/v4/accounts/abc123/ai/run/@cf/meta/llama-3.1-8b-instruct"
		);
		assert_eq!(built.body["stream"], true);
		assert_eq!(built.body["messages"][0]["content"], "hi");
	}
}
