//! The request handler: provider selection, dispatch, error classification,
//! retry, cooldown, and final response assembly.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http::{HeaderMap, StatusCode, header};
use serde_json::{Value, json};
use tracing::{error, info as log_info};

use crate::app::AppState;
use crate::config::{DEFAULT_TIMEOUT, KEEPALIVE_DISABLED, ProviderRuntime, RuntimeConfig};
use crate::dialect::passthrough::{self, PassthroughContext};
use crate::dialect::{DialectId, PathParams};
use crate::llm::{self, AIError, Engine, universal};
use crate::stats::SharedRequestInfo;
use crate::streaming::{self, StatGuard};

/// An error carrying the HTTP status it should surface with.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct GatewayError {
	pub status: u16,
	pub message: String,
}

impl GatewayError {
	pub fn new(status: u16, message: impl Into<String>) -> Self {
		GatewayError {
			status,
			message: message.into(),
		}
	}

	pub fn into_response(self) -> Response {
		error_response(self.status, &self.message)
	}
}

pub fn error_response(status: u16, message: &str) -> Response {
	let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
	(status, axum::Json(json!({"error": message}))).into_response()
}

/// Exception type -> status, before the payload-substring pass.
pub fn classify_error(e: &AIError) -> GatewayError {
	match e {
		AIError::Timeout { seconds } => GatewayError::new(
			504,
			format!("Request timed out after {seconds} seconds"),
		),
		AIError::Http(e) => {
			if e.is_timeout() {
				GatewayError::new(504, format!("Request timed out: {e}"))
			} else if e.is_connect() {
				GatewayError::new(503, "Unable to connect to service".to_string())
			} else if e.is_body() || e.is_decode() {
				GatewayError::new(502, format!("Network read error: {e}"))
			} else {
				GatewayError::new(500, e.to_string())
			}
		},
		AIError::Upstream { status, details } => GatewayError::new(*status, details.clone()),
		AIError::ContentBlocked(_) => GatewayError::new(403, e.to_string()),
		AIError::Stream(msg) => GatewayError::new(502, msg.clone()),
		other => GatewayError::new(500, other.to_string()),
	}
}

/// Payload substrings that force a better status than the transport gave us.
pub fn adjust_status_code(status: u16, message: &str) -> u16 {
	const TOO_LONG: &[&str] = &[
		"string_above_max_length",
		"must be less than max_seq_len",
		"Please reduce the length of the messages or completion",
		"Request contains text fields that are too large.",
		"Please reduce the length of either one, or use the",
		"exceeds the maximum number of tokens allowed",
	];
	if TOO_LONG.iter().any(|s| message.contains(s)) {
		return 413;
	}
	if message.contains("'reason': 'API_KEY_INVALID'")
		|| message.contains("API key not valid")
		|| message.contains("API key expired")
	{
		return 401;
	}
	if message.contains("User location is not supported for the API use.") {
		return 403;
	}
	if message.contains(
		"The response was filtered due to the prompt triggering Azure OpenAI's content management policy.",
	) {
		return 403;
	}
	if message.contains("<center><h1>400 Bad Request</h1></center>") {
		return 502;
	}
	if message.contains("<head><title>413 Request Entity Too Large</title></head>") {
		return 429;
	}
	status
}

/// Failures that do not indicate a bad upstream key: no cooldown, and the
/// request-log slot is refunded because the request never really ran.
const COOLDOWN_EXEMPT: &[&str] = &[
	"BrokenResourceError",
	"Proxy connection timed out",
	"Unknown error: EndOfStream",
	"'status': 'INVALID_ARGUMENT'",
	"Unable to connect to service",
	"Connection closed unexpectedly",
	"Invalid JSON payload received. Unknown name ",
	"User location is not supported for the API use",
	"The model is overloaded. Please try again later.",
	"sslv3 alert handshake failure",
	"<title>Worker exceeded resource limits",
];

pub fn is_cooldown_exempt(message: &str) -> bool {
	COOLDOWN_EXEMPT.iter().any(|s| message.contains(s))
}

enum AttemptOutput {
	Stream(llm::SseStream),
	Json { body: Value, passthrough: bool },
	Binary { bytes: Bytes, content_type: &'static str },
}

struct AttemptContext {
	api_key: Option<String>,
	enabled_plugins: Option<Vec<String>>,
}

/// One dispatch to one provider. On success the channel stat is recorded and
/// `info` carries provider/key/timing fields.
#[allow(clippy::too_many_arguments)]
async fn process_attempt(
	state: &Arc<AppState>,
	config: &Arc<RuntimeConfig>,
	provider: &Arc<ProviderRuntime>,
	request_data: &universal::Request,
	endpoint: Option<&str>,
	passthrough_ctx: Option<&PassthroughContext>,
	timeout_secs: u64,
	keepalive: Option<u64>,
	info: &SharedRequestInfo,
) -> Result<(AttemptOutput, AttemptContext), GatewayError> {
	let upstream = llm::upstream_model(provider, &request_data.model);
	let key_list = config.key_lists.get(provider.name());
	let api_key = match key_list {
		Some(list) => Some(
			list
				.next(&upstream)
				.await
				.map_err(|e| GatewayError::new(429, e.to_string()))?,
		),
		None => None,
	};

	let (engine, stream_mode) = llm::resolve_engine(provider, endpoint, &upstream);
	let mut req = request_data.clone();
	if let Some(stream) = stream_mode {
		req.stream = Some(stream);
	}
	let stream = req.stream();

	log_info!(
		provider = %provider.name(),
		model = %req.model,
		engine = %engine.as_str(),
		"dispatching"
	);

	let proxy = provider
		.config
		.preferences
		.proxy
		.clone()
		.or_else(|| config.proxy.clone());
	let enabled_plugins = provider.config.preferences.enabled_plugins.clone();
	let last_message_role = req.last_message_role();

	// Build the native request (passthrough reuses the adapter for URL and
	// headers only).
	let probe_client = state.clients.get_client(
		provider.base_url(),
		proxy.as_deref(),
	);
	let mut built = llm::build_request(engine, &req, provider, api_key.as_deref(), &probe_client)
		.await
		.map_err(|e| classify_error(&e))?;
	if let Some(custom) = &provider.config.preferences.headers {
		for (k, v) in custom {
			if let (Ok(name), Ok(value)) = (
				http::HeaderName::try_from(k.as_str()),
				http::HeaderValue::try_from(v.as_str()),
			) {
				built.headers.insert(name, value);
			}
		}
	}

	if let Some(ctx) = passthrough_ctx.filter(|c| c.enabled) {
		let mut headers = built.headers.clone();
		for (name, value) in passthrough::filter_passthrough_headers(&ctx.original_headers) {
			if let Some(name) = name {
				headers.insert(name, value);
			}
		}
		built.headers = headers;
		built.body = passthrough::apply_passthrough_modifications(
			&ctx.original_payload,
			&ctx.modifications,
			ctx.dialect,
			&req.model,
			&upstream,
		);
	} else {
		// Canonical path: overrides merge into the adapter payload. `all`
		// fills absent keys only; the exact alias always wins.
		if let Some(overrides) = &provider.config.preferences.post_body_parameter_overrides {
			if let Some(Value::Object(all)) = overrides.get("all") {
				if let Some(body) = built.body.as_object_mut() {
					for (k, v) in all {
						if !body.contains_key(k) {
							body.insert(k.clone(), v.clone());
						}
					}
				}
			}
			if let Some(Value::Object(per_model)) = overrides.get(&req.model) {
				if let Some(body) = built.body.as_object_mut() {
					for (k, v) in per_model {
						body.insert(k.clone(), v.clone());
					}
				}
			}
		}
	}

	state.plugins.apply_request(
		enabled_plugins.as_deref(),
		&request_data.model,
		&mut built.url,
		&mut built.headers,
		&mut built.body,
	);

	{
		let mut i = info.lock();
		i.model = request_data.model.clone();
		i.provider_id = Some(provider.name().to_string());
		if let (Some(list), Some(key)) = (key_list, api_key.as_deref()) {
			i.provider_key_index = list.index_of(key).map(|x| x as i64);
		}
		if i.raw_data_expires_at.is_some() {
			i.upstream_request_body = Some(crate::truncate::truncate_value(&built.body, 0).to_string());
		}
	}

	let client = state.clients.get_client(&built.url, proxy.as_deref());
	let timeout = Duration::from_secs(timeout_secs);
	let output = if stream {
		let upstream_stream = if passthrough_ctx.map(|c| c.enabled).unwrap_or(false) {
			streaming::passthrough_stream(
				llm::send_stream(&client, &built, timeout)
					.await
					.map_err(|e| classify_error(&e))?,
			)
		} else {
			llm::stream_upstream(&client, built, engine, &upstream, timeout)
				.await
				.map_err(|e| classify_error(&e))?
		};
		let (wrapped, first_response_time) = streaming::error_handling_wrapper(
			upstream_stream,
			provider.name(),
			engine,
			true,
			config.error_triggers.clone(),
			keepalive.map(Duration::from_secs),
			last_message_role,
			Duration::from_secs(timeout_secs),
		)
		.await?;
		info.lock().first_response_time = first_response_time;
		AttemptOutput::Stream(wrapped)
	} else if engine == Engine::Tts {
		let resp = llm::fetch_bytes(&client, &built, timeout)
			.await
			.map_err(|e| classify_error(&e))?;
		info.lock().first_response_time = 0.0;
		AttemptOutput::Binary {
			bytes: resp,
			content_type: "audio/mpeg",
		}
	} else {
		let is_passthrough = passthrough_ctx.map(|c| c.enabled).unwrap_or(false);
		let started = std::time::Instant::now();
		let body = if is_passthrough {
			// Native bytes stay native: no canonical round trip on the way out.
			llm::fetch_json(&client, &built, timeout)
				.await
				.map_err(|e| classify_error(&e))?
		} else {
			llm::fetch_upstream(&client, built, engine, &upstream, timeout)
				.await
				.map_err(|e| classify_error(&e))?
		};
		streaming::validate_response_value(
			&body,
			engine,
			&config.error_triggers,
			last_message_role,
		)?;
		info.lock().first_response_time = started.elapsed().as_secs_f64();
		AttemptOutput::Json {
			body,
			passthrough: is_passthrough,
		}
	};

	Ok((
		output,
		AttemptContext {
			api_key,
			enabled_plugins,
		},
	))
}

/// The attempt loop: walk eligible providers, classify failures, cool keys,
/// blacklist channels, and retry within the budget.
#[allow(clippy::too_many_arguments)]
pub async fn request_model(
	state: Arc<AppState>,
	request_data: universal::Request,
	api_index: usize,
	endpoint: Option<String>,
	dialect: DialectId,
	original_payload: Option<Value>,
	original_headers: HeaderMap,
	info: SharedRequestInfo,
	mut guard: StatGuard,
) -> Response {
	let config = state.config.load_full();
	let request_model_name = request_data.model.clone();

	let Some(api_key_entry) = config.api_keys.get(api_index) else {
		let e = GatewayError::new(404, format!("No matching model found: {request_model_name}"));
		finalize_failure(&info, &mut guard, &e);
		return e.into_response();
	};
	let algorithm = api_key_entry.scheduling_algorithm();
	let auto_retry = api_key_entry.auto_retry();
	{
		let mut i = info.lock();
		i.api_key = api_key_entry.config.api.clone();
		i.api_key_name = api_key_entry.config.name.clone();
		i.api_key_group = Some(api_key_entry.groups.join(","));
		i.model = request_model_name.clone();
		let (pp, cp) = config.price_for(&request_model_name);
		i.prompt_price = pp;
		i.completion_price = cp;
	}

	let mut matching =
		crate::routing::matching_providers(&config, &state.channels, &request_model_name, api_index, algorithm)
			.await;
	let mut num_matching = matching.len();
	if num_matching == 0 {
		let e = GatewayError::new(404, format!("No matching model found: {request_model_name}"));
		finalize_failure(&info, &mut guard, &e);
		return e.into_response();
	}

	let mut start_index = 0usize;
	if algorithm != crate::config::ScheduleAlgorithm::FixedPriority {
		let mut rotation = state.rotation.lock().await;
		let cursor = rotation.entry(request_model_name.clone()).or_insert(0);
		*cursor = (*cursor + 1) % num_matching;
		start_index = *cursor;
	}

	let key_count = |p: &Arc<ProviderRuntime>| {
		config
			.key_lists
			.get(p.name())
			.map(|l| l.get_items_count())
			.unwrap_or(1)
	};
	let retry_budget = if num_matching == 1 {
		key_count(&matching[0]).max(1)
	} else {
		let total: usize = matching.iter().map(key_count).sum::<usize>() * 2;
		total.min(config.max_retry_count as usize)
	};

	let mut status_code: u16 = 500;
	let mut error_message = String::new();
	let mut retry_path: Vec<Value> = Vec::new();
	let mut retry_count: i64 = 0;
	let mut index = 0usize;

	loop {
		if index > num_matching + retry_budget {
			break;
		}
		let current = (start_index + index) % num_matching;
		index += 1;
		let provider = matching[current].clone();
		let provider_name = provider.name().to_string();

		let upstream = llm::upstream_model(&provider, &request_model_name);
		if let Some(list) = config.key_lists.get(&provider_name)
			&& list.is_all_rate_limited(&upstream).await
		{
			error_message = "All API keys are rate limited and stop auto retry!".to_string();
			status_code = 429;
			if num_matching == 1 {
				break;
			}
			continue;
		}

		let timeout_secs = config.timeouts.get(
			&provider_name,
			&upstream,
			&request_model_name,
			state.env.timeout.max(1),
		);
		let timeout_secs = if timeout_secs == 0 {
			DEFAULT_TIMEOUT
		} else {
			timeout_secs
		};
		let keepalive_secs = config.keepalive.get(
			&provider_name,
			&upstream,
			&request_model_name,
			KEEPALIVE_DISABLED,
		);
		let keepalive = (keepalive_secs <= timeout_secs).then_some(keepalive_secs);

		let passthrough_ctx = original_payload.as_ref().map(|payload| {
			passthrough::evaluate_passthrough(
				dialect,
				payload,
				&original_headers,
				&provider,
				&request_model_name,
			)
		});

		match process_attempt(
			&state,
			&config,
			&provider,
			&request_data,
			endpoint.as_deref(),
			passthrough_ctx.as_ref(),
			timeout_secs,
			keepalive,
			&info,
		)
		.await
		{
			Ok((output, ctx)) => {
				{
					let mut i = info.lock();
					if !retry_path.is_empty() {
						i.retry_path = serde_json::to_string(&retry_path).ok();
					}
					i.retry_count = retry_count;
					i.success = true;
					i.status_code = 200;
					i.provider = Some(provider_name.clone());
				}
				spawn_channel_stat(&state, &info, &provider_name, &request_model_name, &ctx, true);
				let is_passthrough = passthrough_ctx.map(|c| c.enabled).unwrap_or(false);
				return respond(&state, dialect, is_passthrough, output, &ctx, &info, guard);
			},
			Err(e) => {
				retry_count += 1;
				status_code = e.status;
				error_message = e.message.clone();
				retry_path.push(json!({
					"provider": provider_name,
					"error": truncate_chars(&error_message, 2000),
					"status_code": Value::Null,
				}));

				let current_key = match config.key_lists.get(&provider_name) {
					Some(list) => list.after_next_current().await,
					None => None,
				};
				let ctx = AttemptContext {
					api_key: current_key.clone(),
					enabled_plugins: None,
				};
				spawn_channel_stat(&state, &info, &provider_name, &request_model_name, &ctx, false);

				let exempt = is_cooldown_exempt(&error_message);

				if state.channels.cooldown_period > 0 && num_matching > 1 && !exempt {
					state
						.channels
						.exclude_model(&provider_name, &request_model_name)
						.await;
					let refreshed = crate::routing::matching_providers(
						&config,
						&state.channels,
						&request_model_name,
						api_index,
						algorithm,
					)
					.await;
					if refreshed.len() != num_matching && !refreshed.is_empty() {
						matching = refreshed;
						num_matching = matching.len();
						index = 0;
						start_index = 0;
					}
				}

				if let Some(list) = config.key_lists.get(&provider_name) {
					let cooling = provider
						.config
						.preferences
						.api_key_cooldown_period
						.unwrap_or(0);
					if cooling > 0
						&& list.get_items_count() > 1
						&& !exempt && let Some(key) = &current_key
					{
						list.set_cooling(key, cooling).await;
					}
					// The request never really happened upstream: refund the slot.
					if exempt && let Some(key) = &current_key {
						list.pop_last_request_log(key, &upstream).await;
					}
				}

				status_code = adjust_status_code(status_code, &error_message);
				if let Some(last) = retry_path.last_mut() {
					last["status_code"] = json!(status_code);
				}
				error!(
					provider = %provider_name,
					status = status_code,
					error = %truncate_chars(&error_message, 500),
					"attempt failed"
				);

				if auto_retry && !matches!(status_code, 400 | 413) {
					continue;
				}
				{
					let mut i = info.lock();
					if !retry_path.is_empty() {
						i.retry_path = serde_json::to_string(&retry_path).ok();
					}
					i.retry_count = retry_count;
					i.success = false;
					i.status_code = status_code as i64;
				}
				guard.complete();
				return error_response(
					status_code,
					&format!("Error: Current provider response failed: {error_message}"),
				);
			},
		}
	}

	{
		let mut i = info.lock();
		i.first_response_time = -1.0;
		i.success = false;
		i.status_code = status_code as i64;
		i.provider = None;
		if !retry_path.is_empty() {
			i.retry_path = serde_json::to_string(&retry_path).ok();
		}
		i.retry_count = retry_count;
	}
	guard.complete();
	error_response(
		status_code,
		&format!("All {request_model_name} error: {error_message}"),
	)
}

fn finalize_failure(info: &SharedRequestInfo, guard: &mut StatGuard, e: &GatewayError) {
	{
		let mut i = info.lock();
		i.success = false;
		i.status_code = e.status as i64;
	}
	guard.complete();
}

fn spawn_channel_stat(
	state: &Arc<AppState>,
	info: &SharedRequestInfo,
	provider: &str,
	model: &str,
	ctx: &AttemptContext,
	success: bool,
) {
	let sink = state.sink.clone();
	let (request_id, api_key) = {
		let i = info.lock();
		(i.request_id.clone(), i.api_key.clone())
	};
	let provider = provider.to_string();
	let model = model.to_string();
	let provider_api_key = ctx.api_key.clone();
	tokio::spawn(async move {
		sink
			.write_channel_stat(
				&request_id,
				&provider,
				&model,
				&api_key,
				provider_api_key.as_deref(),
				success,
			)
			.await;
	});
}

fn respond(
	state: &Arc<AppState>,
	dialect: DialectId,
	is_passthrough: bool,
	output: AttemptOutput,
	ctx: &AttemptContext,
	info: &SharedRequestInfo,
	mut guard: StatGuard,
) -> Response {
	match output {
		AttemptOutput::Stream(stream) => {
			let transformers = state
				.plugins
				.stream_transformers(ctx.enabled_plugins.as_deref(), &info.lock().model);
			let render_dialect = (!is_passthrough).then_some(dialect);
			let body_stream = streaming::logging_stream(
				stream,
				info.clone(),
				transformers,
				render_dialect,
				guard,
			);
			let mut resp = Response::new(Body::from_stream(body_stream));
			resp.headers_mut().insert(
				header::CONTENT_TYPE,
				http::HeaderValue::from_static("text/event-stream"),
			);
			if is_passthrough {
				resp
					.headers_mut()
					.insert("x-gateway-passthrough", http::HeaderValue::from_static("request"));
			}
			resp
		},
		AttemptOutput::Json { body, passthrough } => {
			// Pull usage counters into the stat row.
			{
				let mut i = info.lock();
				let usage = &body["usage"];
				if usage.is_object() {
					i.prompt_tokens = usage["prompt_tokens"]
						.as_i64()
						.or_else(|| body["usage"]["input_tokens"].as_i64())
						.unwrap_or(0);
					i.completion_tokens = usage["completion_tokens"]
						.as_i64()
						.or_else(|| body["usage"]["output_tokens"].as_i64())
						.unwrap_or(0);
					i.total_tokens = i.prompt_tokens + i.completion_tokens;
				}
				if i.raw_data_expires_at.is_some() {
					i.response_body = Some(crate::truncate::truncate_value(&body, 0).to_string());
				}
			}
			let rendered = if passthrough {
				body
			} else {
				let model = info.lock().model.clone();
				dialect.render_response(&body, &model)
			};
			guard.complete();
			let mut resp = axum::Json(rendered).into_response();
			if passthrough {
				resp
					.headers_mut()
					.insert("x-gateway-passthrough", http::HeaderValue::from_static("request"));
			}
			resp
		},
		AttemptOutput::Binary { bytes, content_type } => {
			guard.complete();
			let mut resp = Response::new(Body::from(bytes));
			resp.headers_mut().insert(
				header::CONTENT_TYPE,
				http::HeaderValue::from_static(content_type),
			);
			resp
		},
	}
}

pub fn truncate_chars(s: &str, max: usize) -> String {
	if s.chars().count() <= max {
		s.to_string()
	} else {
		s.chars().take(max).collect()
	}
}

/// Convenience used by the server layer: parse path params for dialect
/// routes like `models/{model}:{action}`.
pub fn split_model_action(segment: &str) -> PathParams {
	match segment.split_once(':') {
		Some((model, action)) => PathParams {
			model: Some(model.to_string()),
			action: Some(action.to_string()),
		},
		None => PathParams {
			model: Some(segment.to_string()),
			action: None,
		},
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn status_adjustment_table() {
		assert_eq!(adjust_status_code(500, "string_above_max_length"), 413);
		assert_eq!(
			adjust_status_code(500, "input must be less than max_seq_len tokens"),
			413
		);
		assert_eq!(adjust_status_code(400, "API key not valid. Please pass a valid key."), 401);
		assert_eq!(
			adjust_status_code(500, "User location is not supported for the API use."),
			403
		);
		assert_eq!(
			adjust_status_code(500, "<html><center><h1>400 Bad Request</h1></center></html>"),
			502
		);
		assert_eq!(
			adjust_status_code(
				500,
				"<html><head><title>413 Request Entity Too Large</title></head></html>"
			),
			429
		);
		assert_eq!(adjust_status_code(502, "some other error"), 502);
	}

	#[test]
	fn cooldown_exemptions() {
		assert!(is_cooldown_exempt("The model is overloaded. Please try again later."));
		assert!(is_cooldown_exempt("error: Unable to connect to service"));
		assert!(is_cooldown_exempt("ssl error: sslv3 alert handshake failure occurred"));
		assert!(!is_cooldown_exempt("invalid api key"));
	}

	#[test]
	fn classification_of_adapter_errors() {
		let e = classify_error(&AIError::Timeout { seconds: 42 });
		assert_eq!(e.status, 504);
		assert!(e.message.contains("42 seconds"));

		let e = classify_error(&AIError::Upstream {
			status: 418,
			details: "teapot".to_string(),
		});
		assert_eq!(e.status, 418);

		let e = classify_error(&AIError::ContentBlocked("PROHIBITED_CONTENT".to_string()));
		assert_eq!(e.status, 403);
		assert!(e.message.starts_with("Gemini Blocked: "));
	}

	#[test]
	fn model_action_splitting() {
		let p = split_model_action("gemini-2.5-pro:streamGenerateContent");
		assert_eq!(p.model.as_deref(), Some("gemini-2.5-pro"));
		assert_eq!(p.action.as_deref(), Some("streamGenerateContent"));
		let p = split_model_action("gemini-2.5-pro");
		assert!(p.action.is_none());
	}
}
