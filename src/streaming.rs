//! Streaming response wrapper: first-chunk validation, keepalive comments,
//! tee-and-parse usage extraction, raw-body capture, and finalization of the
//! request stat on every exit path (completion, error, client disconnect).

use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::Value;
use tracing::{debug, error};

use crate::dialect::DialectId;
use crate::handler::{GatewayError, classify_error};
use crate::llm::universal::Role;
use crate::llm::{AIError, Engine, SseStream};
use crate::plugins::StreamTransform;
use crate::stats::{SharedRequestInfo, StatsSink};
use crate::truncate::truncate_for_logging;

pub const KEEPALIVE_COMMENT: &str = ": keepalive\n\n";
const MAX_SAVED_RESPONSE: usize = 100 * 1024;
const MAX_UTF8_CARRY: usize = 10 * 1024;

/// Writes the request stat exactly once. Explicit completion keeps the row as
/// the handler filled it; a drop without completion means the client went
/// away, which records a failure.
pub struct StatGuard {
	info: SharedRequestInfo,
	sink: StatsSink,
	armed: bool,
}

impl StatGuard {
	pub fn new(info: SharedRequestInfo, sink: StatsSink) -> Self {
		StatGuard {
			info,
			sink,
			armed: true,
		}
	}

	pub fn complete(&mut self) {
		self.write(false);
	}

	fn write(&mut self, cancelled: bool) {
		if !self.armed {
			return;
		}
		self.armed = false;
		let snapshot = {
			let mut info = self.info.lock();
			if info.finalized {
				return;
			}
			info.finalized = true;
			if cancelled {
				info.success = false;
				info.status_code = 499;
			}
			info.process_time = info.start_time.elapsed().as_secs_f64();
			info.clone()
		};
		let sink = self.sink.clone();
		if let Ok(handle) = tokio::runtime::Handle::try_current() {
			handle.spawn(async move {
				sink.write_request_stat(&snapshot).await;
			});
		}
	}
}

impl Drop for StatGuard {
	fn drop(&mut self) {
		self.write(true);
	}
}

/// Echo upstream bytes as text, decoding UTF-8 with replacement but holding
/// back an incomplete trailing sequence (capped at 10 KB) so a multibyte
/// character split across reads survives.
pub fn passthrough_stream(resp: reqwest::Response) -> SseStream {
	let mut bytes = resp.bytes_stream();
	Box::pin(async_stream::try_stream! {
		let mut carry: Vec<u8> = Vec::new();
		while let Some(chunk) = bytes.next().await {
			let chunk = chunk.map_err(AIError::Http)?;
			carry.extend_from_slice(&chunk);
			let split_at = match std::str::from_utf8(&carry) {
				Ok(_) => None,
				Err(e) if e.error_len().is_none() && carry.len() - e.valid_up_to() <= MAX_UTF8_CARRY => {
					Some(e.valid_up_to())
				},
				Err(_) => None,
			};
			let keep = match split_at {
				Some(at) => carry.split_off(at),
				None => Vec::new(),
			};
			let out = String::from_utf8_lossy(&carry).into_owned();
			carry = keep;
			if !out.is_empty() {
				yield out;
			}
		}
		if !carry.is_empty() {
			yield String::from_utf8_lossy(&carry).into_owned();
		}
	})
}

/// Pull a `json.loads`-able candidate out of the first chunk, whatever the
/// native framing: `data: {...}`, `event: …\ndata: {...}`, or bare JSON.
pub fn extract_first_json_candidate(text: &str) -> Option<String> {
	let stripped = text.trim();
	if stripped.is_empty() {
		return None;
	}
	for raw_line in stripped.lines() {
		let line = raw_line.trim();
		if line.is_empty() || line.starts_with(':') || line.starts_with("event:") {
			continue;
		}
		if let Some(payload) = line.strip_prefix("data:") {
			let payload = payload.trim();
			if !payload.is_empty() {
				return Some(payload.to_string());
			}
			continue;
		}
		if line.starts_with('{') || line.starts_with('[') {
			return Some(line.to_string());
		}
	}
	None
}

fn non_empty_str(v: &Value) -> bool {
	v.as_str().map(|s| !s.is_empty()).unwrap_or(!v.is_null())
}

/// Shared first-chunk / sole-response checks. `stream` selects which empty
/// shapes count as failures.
pub fn validate_value(
	value: &Value,
	engine: Engine,
	stream: bool,
	error_triggers: &[String],
	last_message_role: Option<Role>,
) -> Result<(), GatewayError> {
	// minimax wraps errors in base_resp
	if let Some(code) = value["base_resp"]["status_code"].as_i64()
		&& code != 200
	{
		let status = match code {
			2013 => 400,
			1008 => 429,
			_ => u16::try_from(code).unwrap_or(500),
		};
		let detail = value["base_resp"]["status_msg"]
			.as_str()
			.unwrap_or("no error returned");
		return Err(GatewayError::new(status, crate::handler::truncate_chars(detail, 1000)));
	}

	if let Some(reason) = value["promptFeedback"]["blockReason"].as_str() {
		return Err(GatewayError::new(403, format!("Gemini Blocked: {reason}")));
	}

	let err = &value["error"];
	if !err.is_null() {
		let empty_shape = err["message"] == "" && err["type"] == "" && err["code"].is_null();
		if !empty_shape {
			let status = value["status_code"]
				.as_u64()
				.and_then(|s| u16::try_from(s).ok())
				.unwrap_or(500);
			let detail = if value["details"].is_null() {
				value.to_string()
			} else {
				value["details"].to_string()
			};
			return Err(GatewayError::new(
				status,
				crate::handler::truncate_chars(&detail, 5000),
			));
		}
	}

	let choice_err = &value["choices"][0]["error"];
	if choice_err.is_object() {
		let status = choice_err["code"]
			.as_u64()
			.and_then(|s| u16::try_from(s).ok())
			.unwrap_or(500);
		let detail = choice_err["message"].as_str().unwrap_or_default();
		return Err(GatewayError::new(
			status,
			crate::handler::truncate_chars(detail, 1000),
		));
	}

	let finish = value["choices"][0]["finish_reason"].as_str();
	if finish == Some("PROHIBITED_CONTENT") {
		return Err(GatewayError::new(400, "PROHIBITED_CONTENT"));
	}

	if finish == Some("stop")
		&& !non_empty_str(&value["choices"][0]["message"]["content"])
		&& !non_empty_str(&value["choices"][0]["delta"]["content"])
		&& last_message_role != Some(Role::Assistant)
	{
		return Err(GatewayError::new(
			502,
			"Upstream server returned an empty response.",
		));
	}

	let binary_engine = matches!(
		engine,
		Engine::Tts | Engine::Embedding | Engine::Dalle | Engine::Moderation | Engine::Whisper
	);
	if !stream && !binary_engine && value["choices"].is_array() {
		let rendered = value.to_string();
		if error_triggers.iter().any(|t| rendered.contains(t)) {
			return Err(GatewayError::new(
				502,
				"Upstream server returned an empty response.",
			));
		}
		let msg = &value["choices"][0]["message"];
		let has_image = value["data"][0]["b64_json"].is_string();
		if !non_empty_str(&msg["content"])
			&& !non_empty_str(&msg["reasoning_content"])
			&& msg["tool_calls"].as_array().map(|c| c.is_empty()).unwrap_or(true)
			&& !has_image
		{
			return Err(GatewayError::new(
				502,
				"Upstream server returned an empty response.",
			));
		}
	}

	Ok(())
}

/// Non-stream validation entry used by the handler.
pub fn validate_response_value(
	value: &Value,
	engine: Engine,
	error_triggers: &[String],
	last_message_role: Option<Role>,
) -> Result<(), GatewayError> {
	validate_value(value, engine, false, error_triggers, last_message_role)
}

fn validate_first_chunk(
	text: &str,
	engine: Engine,
	stream: bool,
	error_triggers: &[String],
	last_message_role: Option<Role>,
) -> Result<(), GatewayError> {
	let candidate = extract_first_json_candidate(text);
	let target = candidate.as_deref().unwrap_or(text).trim().to_string();
	if target.starts_with("[DONE]") {
		return Err(GatewayError::new(
			502,
			"Upstream server returned an empty response.",
		));
	}
	if error_triggers.iter().any(|t| target.contains(t)) {
		return Err(GatewayError::new(
			502,
			format!("error const string: {}", crate::handler::truncate_chars(&target, 1000)),
		));
	}
	if let Some(candidate) = candidate {
		let Ok(value) = serde_json::from_str::<Value>(&candidate) else {
			return Err(GatewayError::new(
				502,
				"Upstream server returned an empty response.",
			));
		};
		validate_value(&value, engine, stream, error_triggers, last_message_role)?;
	}
	Ok(())
}

/// Read the first chunk before handing the response to the client; fail fast
/// when it is an error or a known-empty shape. With a keepalive interval set,
/// upstream silence turns into `: keepalive` comments instead of a stall.
#[allow(clippy::too_many_arguments)]
pub async fn error_handling_wrapper(
	mut stream: SseStream,
	channel_id: &str,
	engine: Engine,
	stream_mode: bool,
	error_triggers: Vec<String>,
	keepalive_interval: Option<Duration>,
	last_message_role: Option<Role>,
	idle_timeout: Duration,
) -> Result<(SseStream, f64), GatewayError> {
	let start = Instant::now();
	let channel = channel_id.to_string();

	let mut first = if let Some(ka) = keepalive_interval.filter(|_| stream_mode) {
		match tokio::time::timeout(ka, stream.next()).await {
			Ok(item) => item,
			Err(_) => {
				// Upstream is slow: start emitting keepalives immediately and
				// validate nothing.
				let first_response_time = start.elapsed().as_secs_f64();
				let out = continue_stream(None, stream, Some(ka), stream_mode, channel);
				return Ok((out, first_response_time));
			},
		}
	} else {
		match tokio::time::timeout(idle_timeout, stream.next()).await {
			Ok(item) => item,
			Err(_) => {
				return Err(GatewayError::new(
					504,
					format!("Request timed out after {} seconds", idle_timeout.as_secs()),
				));
			},
		}
	};

	// Skip blank lines and keepalive comments to reach the first real chunk.
	loop {
		match &first {
			Some(Ok(text)) if text.trim().is_empty() || text.starts_with(KEEPALIVE_COMMENT.trim_end()) => {
				first = stream.next().await;
			},
			_ => break,
		}
	}

	match first {
		None => Err(GatewayError::new(
			502,
			"Upstream server returned an empty response.",
		)),
		Some(Err(e)) => Err(classify_error(&e)),
		Some(Ok(text)) => {
			validate_first_chunk(&text, engine, stream_mode, &error_triggers, last_message_role)?;
			let first_response_time = start.elapsed().as_secs_f64();
			let out = continue_stream(
				Some(text),
				stream,
				keepalive_interval.filter(|_| stream_mode),
				stream_mode,
				channel,
			);
			Ok((out, first_response_time))
		},
	}
}

fn continue_stream(
	first: Option<String>,
	mut stream: SseStream,
	keepalive: Option<Duration>,
	stream_mode: bool,
	channel_id: String,
) -> SseStream {
	Box::pin(async_stream::try_stream! {
		if let Some(first) = first {
			yield first;
		} else {
			yield KEEPALIVE_COMMENT.to_string();
		}
		loop {
			let item = match keepalive {
				Some(ka) => match tokio::time::timeout(ka, stream.next()).await {
					Ok(item) => item,
					Err(_) => {
						yield KEEPALIVE_COMMENT.to_string();
						continue;
					},
				},
				None => stream.next().await,
			};
			match item {
				Some(Ok(chunk)) => yield chunk,
				Some(Err(e)) => {
					error!(provider = %channel_id, error = %e, "network error in stream");
					if stream_mode {
						yield "data: [DONE]\n\n".to_string();
					}
					break;
				},
				None => break,
			}
		}
	})
}

fn apply_transformers(transformers: &mut [Box<dyn StreamTransform>], chunk: String) -> Vec<String> {
	let mut pieces = vec![chunk];
	for t in transformers.iter_mut() {
		let mut next = Vec::new();
		for piece in pieces {
			next.extend(t.transform(&piece));
		}
		pieces = next;
	}
	pieces
}

fn parse_usage_lines(chunk: &str, info: &SharedRequestInfo) {
	for line in chunk.split('\n') {
		let mut line = line.trim();
		if line.is_empty() || line.starts_with(':') || line.starts_with("event:") {
			continue;
		}
		if let Some(rest) = line.strip_prefix("data:") {
			line = rest.trim();
		}
		if line.is_empty() || line.starts_with("[DONE]") || line.starts_with("OK") {
			continue;
		}
		let Ok(value) = serde_json::from_str::<Value>(line) else {
			debug!(line, "unparsed stream line");
			continue;
		};
		let mut input_tokens = value["message"]["usage"]["input_tokens"].as_i64().unwrap_or(0);
		if input_tokens == 0 {
			input_tokens = value["usage"]["prompt_tokens"].as_i64().unwrap_or(0);
		}
		let mut output_tokens = value["usage"]["completion_tokens"].as_i64().unwrap_or(0);
		if output_tokens == 0 {
			output_tokens = value["usage"]["output_tokens"].as_i64().unwrap_or(0);
		}
		let mut info = info.lock();
		if input_tokens + output_tokens > 0 {
			info.prompt_tokens = input_tokens;
			info.completion_tokens = output_tokens;
			info.total_tokens = input_tokens + output_tokens;
		}
		if info.content_start_time.is_none()
			&& value["choices"][0]["delta"]["content"]
				.as_str()
				.map(|s| !s.is_empty())
				.unwrap_or(false)
		{
			info.content_start_time = Some(info.start_time.elapsed().as_secs_f64());
		}
	}
}

/// Tee chunks to the client, run the plugin stream hooks, render the inbound
/// dialect framing, extract usage counters, capture up to 100 KB for raw-data
/// retention, and finalize the stat row when the stream ends for any reason.
pub fn logging_stream(
	inner: SseStream,
	info: SharedRequestInfo,
	transformers: Vec<Box<dyn StreamTransform>>,
	dialect: Option<DialectId>,
	mut guard: StatGuard,
) -> impl futures::Stream<Item = Result<Bytes, std::io::Error>> + Send {
	async_stream::stream! {
		let mut inner = inner;
		let mut transformers = transformers;
		let should_save = info.lock().raw_data_expires_at.is_some();
		let mut saved: Vec<u8> = Vec::new();
		while let Some(item) = inner.next().await {
			match item {
				Ok(chunk) => {
					for piece in apply_transformers(&mut transformers, chunk) {
						parse_usage_lines(&piece, &info);
						let rendered = match dialect {
							Some(d) => d.render_stream(&piece),
							None => piece,
						};
						if rendered.is_empty() {
							continue;
						}
						if should_save && saved.len() < MAX_SAVED_RESPONSE {
							saved.extend_from_slice(rendered.as_bytes());
						}
						yield Ok(Bytes::from(rendered));
					}
				},
				Err(e) => {
					error!(error = %e, "error while relaying stream");
					let done = match dialect {
						Some(d) => d.render_stream("data: [DONE]\n\n"),
						None => "data: [DONE]\n\n".to_string(),
					};
					if !done.is_empty() {
						yield Ok(Bytes::from(done));
					}
					break;
				},
			}
		}
		for t in transformers.iter_mut() {
			for piece in t.flush() {
				parse_usage_lines(&piece, &info);
				let rendered = match dialect {
					Some(d) => d.render_stream(&piece),
					None => piece,
				};
				if !rendered.is_empty() {
					yield Ok(Bytes::from(rendered));
				}
			}
		}
		if should_save && !saved.is_empty() {
			info.lock().response_body = Some(truncate_for_logging(&saved));
		}
		guard.complete();
	}
}
