//! OpenRouter upstream. OpenAI-compatible wire format; `reasoning` and
//! provider-prefixed model names pass straight through.

use serde_json::Value;

use super::universal;
use super::{AIError, BaseApi, BuiltRequest, upstream_model};
use crate::config::ProviderRuntime;

pub const DEFAULT_BASE: &str = "https://openrouter.ai/api/v1/chat/completions";

pub fn build_request(
	req: &universal::Request,
	provider: &ProviderRuntime,
	api_key: Option<&str>,
) -> Result<BuiltRequest, AIError> {
	let base = if provider.base_url().is_empty() {
		DEFAULT_BASE
	} else {
		provider.base_url()
	};
	let api = BaseApi::parse(base)?;
	let model = upstream_model(provider, &req.model);

	let mut value = serde_json::to_value(req).map_err(AIError::RequestMarshal)?;
	let body = value
		.as_object_mut()
		.ok_or(AIError::MissingField("request body"))?;
	body.insert("model".to_string(), Value::String(model));
	// OpenRouter understands reasoning/top_k natively; only thinking is local.
	body.remove("thinking");
	if req.stream() && !body.contains_key("stream_options") {
		body.insert(
			"stream_options".to_string(),
			serde_json::json!({"include_usage": true}),
		);
	}

	let mut built = BuiltRequest::new(api.chat(), value);
	if let Some(key) = api_key {
		built = built.sensitive_header("authorization", &format!("Bearer {key}"));
	}
	Ok(built)
}
