//! Azure OpenAI upstream.
//!
//! Deployment-scoped URLs with `api-key` auth; responses are OpenAI-shaped
//! but carry content-filter annotations that are stripped before the body
//! goes back to the client.

use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use url::Url;

use super::universal;
use super::{AIError, BuiltRequest, SseStream, openai, post_json, send_stream, sse_events,
	upstream_model};
use crate::config::ProviderRuntime;

pub const API_VERSION: &str = "2024-10-21";

pub fn build_request(
	req: &universal::Request,
	provider: &ProviderRuntime,
	api_key: Option<&str>,
) -> Result<BuiltRequest, AIError> {
	let model = upstream_model(provider, &req.model);
	let base = Url::parse(provider.base_url()).map_err(|_| AIError::MissingField("base_url"))?;
	let host = base.host_str().ok_or(AIError::MissingField("base_url host"))?;
	let url = format!(
		"{}://{host}/openai/deployments/{model}/chat/completions?api-version={API_VERSION}",
		base.scheme(),
	);
	let body = openai::chat_payload(req, &model)?;
	let mut built = BuiltRequest::new(url, body);
	if let Some(key) = api_key {
		built = built.sensitive_header("api-key", key);
	}
	Ok(built)
}

pub(super) fn strip_filter_results(body: &mut Value) {
	if let Some(choices) = body.get_mut("choices").and_then(|c| c.as_array_mut()) {
		for choice in choices {
			if let Some(obj) = choice.as_object_mut() {
				obj.remove("content_filter_results");
			}
		}
	}
	if let Some(obj) = body.as_object_mut() {
		obj.remove("prompt_filter_results");
	}
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
			match serde_json::from_str::<Value>(&event.data) {
				Ok(mut chunk) => {
					strip_filter_results(&mut chunk);
					yield format!("data: {chunk}\n\n");
				},
				Err(_) => yield format!("data: {}\n\n", event.data),
			}
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
	let mut body = resp.json::<Value>().await?;
	strip_filter_results(&mut body);
	Ok(body)
}
