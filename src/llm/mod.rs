//! Outbound engines: per-provider request construction and stream parsing.
//!
//! Every engine implements the same four callbacks (build request, parse
//! stream, parse response, list models) and emits the canonical OpenAI-style
//! event stream regardless of the upstream wire format.

use std::pin::Pin;
use std::time::Duration;

use futures::Stream;
use http::{HeaderMap, HeaderValue};
use serde_json::Value;
use url::Url;

use crate::config::ProviderRuntime;

pub mod anthropic;
pub mod azure;
pub mod bedrock;
pub mod cloudflare;
pub mod gemini;
pub mod openai;
pub mod openrouter;
pub mod universal;
pub mod vertex;

/// Canonical SSE frames ready for the client, e.g. `data: {...}\n\n`.
pub type SseStream = Pin<Box<dyn Stream<Item = Result<String, AIError>> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum AIError {
	/// Upstream returned a non-2xx; `details` carries the body.
	#[error("{details}")]
	Upstream { status: u16, details: String },
	#[error("failed to parse response: {0}")]
	ResponseParsing(serde_json::Error),
	#[error("failed to marshal request: {0}")]
	RequestMarshal(serde_json::Error),
	#[error("{0}")]
	Http(#[from] reqwest::Error),
	#[error("missing field: {0}")]
	MissingField(&'static str),
	#[error("unknown engine: {0}")]
	UnknownEngine(String),
	#[error("Gemini Blocked: {0}")]
	ContentBlocked(String),
	#[error("failed to mint access token: {0}")]
	Auth(String),
	#[error("Request timed out after {seconds} seconds")]
	Timeout { seconds: u64 },
	#[error("{0}")]
	Stream(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Engine {
	OpenAI,
	OpenAIResponses,
	Claude,
	Gemini,
	VertexGemini,
	VertexClaude,
	Azure,
	Bedrock,
	Cloudflare,
	OpenRouter,
	Embedding,
	Dalle,
	Tts,
	Whisper,
	Moderation,
}

impl Engine {
	pub fn as_str(&self) -> &'static str {
		match self {
			Engine::OpenAI => "openai",
			Engine::OpenAIResponses => "openai-responses",
			Engine::Claude => "claude",
			Engine::Gemini => "gemini",
			Engine::VertexGemini => "vertex-gemini",
			Engine::VertexClaude => "vertex-claude",
			Engine::Azure => "azure",
			Engine::Bedrock => "aws",
			Engine::Cloudflare => "cloudflare",
			Engine::OpenRouter => "openrouter",
			Engine::Embedding => "embedding",
			Engine::Dalle => "dalle",
			Engine::Tts => "tts",
			Engine::Whisper => "whisper",
			Engine::Moderation => "moderation",
		}
	}

	/// The inbound dialect this engine speaks natively, if any. Passthrough is
	/// only possible when the inbound dialect matches.
	pub fn native_dialect(&self) -> Option<&'static str> {
		match self {
			Engine::OpenAI => Some("openai"),
			Engine::Claude => Some("claude"),
			Engine::Gemini => Some("gemini"),
			_ => None,
		}
	}
}

fn parse_engine_tag(tag: &str) -> Option<Engine> {
	match tag {
		"openai" => Some(Engine::OpenAI),
		"openai-response" | "openai-responses" => Some(Engine::OpenAIResponses),
		"claude" | "anthropic" => Some(Engine::Claude),
		"gemini" => Some(Engine::Gemini),
		"vertex" | "vertex-gemini" => Some(Engine::VertexGemini),
		"vertex-claude" => Some(Engine::VertexClaude),
		"azure" => Some(Engine::Azure),
		"aws" | "bedrock" => Some(Engine::Bedrock),
		"cloudflare" => Some(Engine::Cloudflare),
		"openrouter" => Some(Engine::OpenRouter),
		_ => None,
	}
}

/// Determine the engine for one attempt and an optional stream-mode override
/// (binary endpoints are never SSE).
pub fn resolve_engine(
	provider: &ProviderRuntime,
	endpoint: Option<&str>,
	upstream_model: &str,
) -> (Engine, Option<bool>) {
	let base = provider.base_url();
	let mut engine = provider
		.config
		.engine
		.as_deref()
		.and_then(parse_engine_tag)
		.unwrap_or_else(|| infer_engine(provider, base, upstream_model));

	let model = upstream_model.to_lowercase();
	let mut stream_mode = None;
	if model.contains("text-embedding") || endpoint == Some("/v1/embeddings") {
		engine = Engine::Embedding;
		stream_mode = Some(false);
	} else if model.contains("dall-e") || endpoint == Some("/v1/images/generations") {
		engine = Engine::Dalle;
		stream_mode = Some(false);
	} else if model.contains("tts") || endpoint == Some("/v1/audio/speech") {
		engine = Engine::Tts;
		stream_mode = Some(false);
	} else if model.contains("whisper") || endpoint == Some("/v1/audio/transcriptions") {
		engine = Engine::Whisper;
		stream_mode = Some(false);
	} else if model.contains("moderation") || endpoint == Some("/v1/moderations") {
		engine = Engine::Moderation;
		stream_mode = Some(false);
	}
	(engine, stream_mode)
}

fn infer_engine(provider: &ProviderRuntime, base: &str, upstream_model: &str) -> Engine {
	if provider.config.project_id.is_some() {
		if upstream_model.contains("claude") {
			return Engine::VertexClaude;
		}
		return Engine::VertexGemini;
	}
	if provider.config.cf_account_id.is_some() {
		return Engine::Cloudflare;
	}
	if base.contains("generativelanguage") {
		return Engine::Gemini;
	}
	if base.contains("anthropic") {
		return Engine::Claude;
	}
	if base.contains("openrouter.ai") {
		return Engine::OpenRouter;
	}
	if base.contains("amazonaws.com") {
		return Engine::Bedrock;
	}
	if base.contains(".openai.azure.com") {
		return Engine::Azure;
	}
	Engine::OpenAI
}

/// A fully-built upstream request.
#[derive(Debug, Clone)]
pub struct BuiltRequest {
	pub url: String,
	pub headers: HeaderMap,
	pub body: Value,
}

impl BuiltRequest {
	pub fn new(url: String, body: Value) -> Self {
		let mut headers = HeaderMap::new();
		headers.insert(
			http::header::CONTENT_TYPE,
			HeaderValue::from_static("application/json"),
		);
		BuiltRequest { url, headers, body }
	}

	pub fn header(mut self, name: &'static str, value: &str) -> Self {
		if let Ok(v) = HeaderValue::from_str(value) {
			self.headers.insert(name, v);
		}
		self
	}

	pub fn sensitive_header(mut self, name: &'static str, value: &str) -> Self {
		if let Ok(mut v) = HeaderValue::from_str(value) {
			v.set_sensitive(true);
			self.headers.insert(name, v);
		}
		self
	}
}

/// OpenAI-style base URLs in config point at the chat-completions endpoint
/// (or a bare host); every sibling endpoint derives from the same prefix.
#[derive(Debug, Clone)]
pub struct BaseApi {
	pub prefix: String,
}

impl BaseApi {
	pub fn parse(base_url: &str) -> Result<Self, AIError> {
		let url = Url::parse(base_url).map_err(|_| AIError::MissingField("base_url"))?;
		let host = url
			.host_str()
			.ok_or(AIError::MissingField("base_url host"))?;
		let origin = match url.port() {
			Some(port) => format!("{}://{host}:{port}", url.scheme()),
			None => format!("{}://{host}", url.scheme()),
		};
		let path = url.path().trim_end_matches('/');
		let prefix_path = if let Some(idx) = path.find("/chat/completions") {
			&path[..idx]
		} else if path.is_empty() {
			"/v1"
		} else {
			path
		};
		Ok(BaseApi {
			prefix: format!("{origin}{prefix_path}"),
		})
	}

	pub fn chat(&self) -> String {
		format!("{}/chat/completions", self.prefix)
	}
	pub fn responses(&self) -> String {
		format!("{}/responses", self.prefix)
	}
	pub fn models(&self) -> String {
		format!("{}/models", self.prefix)
	}
	pub fn embeddings(&self) -> String {
		format!("{}/embeddings", self.prefix)
	}
	pub fn images(&self) -> String {
		format!("{}/images/generations", self.prefix)
	}
	pub fn audio_speech(&self) -> String {
		format!("{}/audio/speech", self.prefix)
	}
	pub fn audio_transcriptions(&self) -> String {
		format!("{}/audio/transcriptions", self.prefix)
	}
	pub fn moderations(&self) -> String {
		format!("{}/moderations", self.prefix)
	}
}

/// POST and fail on non-2xx, surfacing the body as the error detail.
pub(crate) async fn post_json(
	client: &reqwest::Client,
	built: &BuiltRequest,
	timeout: Option<Duration>,
) -> Result<reqwest::Response, AIError> {
	let mut req = client
		.post(&built.url)
		.headers(built.headers.clone())
		.json(&built.body);
	if let Some(t) = timeout {
		req = req.timeout(t);
	}
	let resp = req.send().await?;
	check_response(resp, "fetch_response").await
}

/// POST and return the body as raw JSON, no engine translation. Used by the
/// passthrough path where the native shape must reach the client unchanged.
pub async fn fetch_json(
	client: &reqwest::Client,
	built: &BuiltRequest,
	timeout: Duration,
) -> Result<Value, AIError> {
	let resp = post_json(client, built, Some(timeout)).await?;
	Ok(resp.json::<Value>().await?)
}

/// POST and return the raw body bytes (binary endpoints such as speech).
pub async fn fetch_bytes(
	client: &reqwest::Client,
	built: &BuiltRequest,
	timeout: Duration,
) -> Result<bytes::Bytes, AIError> {
	let resp = post_json(client, built, Some(timeout)).await?;
	Ok(resp.bytes().await?)
}

/// POST for a streaming call: the timeout bounds connection + response
/// headers only, never the body.
pub(crate) async fn send_stream(
	client: &reqwest::Client,
	built: &BuiltRequest,
	timeout: Duration,
) -> Result<reqwest::Response, AIError> {
	let fut = client
		.post(&built.url)
		.headers(built.headers.clone())
		.json(&built.body)
		.send();
	let resp = tokio::time::timeout(timeout, fut)
		.await
		.map_err(|_| AIError::Timeout {
			seconds: timeout.as_secs(),
		})??;
	check_response(resp, "fetch_response_stream").await
}

/// Upstream SSE events. eventsource-stream buffers partial frames, so a chunk
/// split across TCP reads still parses.
pub(crate) fn sse_events(
	resp: reqwest::Response,
) -> impl Stream<Item = Result<eventsource_stream::Event, AIError>> + Send {
	use eventsource_stream::Eventsource;
	use futures_util::StreamExt;
	resp
		.bytes_stream()
		.eventsource()
		.map(|r| r.map_err(|e| AIError::Stream(e.to_string())))
}

/// The upstream model for a request alias (identity when unmapped).
pub fn upstream_model(provider: &ProviderRuntime, alias: &str) -> String {
	provider
		.model_map
		.get(alias)
		.cloned()
		.unwrap_or_else(|| alias.to_string())
}

pub(crate) async fn check_response(
	resp: reqwest::Response,
	error_log: &str,
) -> Result<reqwest::Response, AIError> {
	let status = resp.status();
	if status.is_success() {
		return Ok(resp);
	}
	let body = resp.text().await.unwrap_or_default();
	Err(AIError::Upstream {
		status: status.as_u16(),
		details: format!("{error_log} HTTP Error {}: {body}", status.as_u16()),
	})
}

/// Dispatch: canonical request -> native URL/headers/payload.
pub async fn build_request(
	engine: Engine,
	req: &universal::Request,
	provider: &ProviderRuntime,
	api_key: Option<&str>,
	client: &reqwest::Client,
) -> Result<BuiltRequest, AIError> {
	match engine {
		Engine::OpenAI | Engine::Embedding | Engine::Dalle | Engine::Tts | Engine::Whisper
		| Engine::Moderation => openai::build_request(engine, req, provider, api_key),
		Engine::OpenAIResponses => openai::build_responses_request(req, provider, api_key),
		Engine::Claude => anthropic::build_request(req, provider, api_key),
		Engine::Gemini => gemini::build_request(req, provider, api_key),
		Engine::VertexGemini | Engine::VertexClaude => {
			vertex::build_request(engine, req, provider, client).await
		},
		Engine::Azure => azure::build_request(req, provider, api_key),
		Engine::Bedrock => bedrock::build_request(req, provider, api_key),
		Engine::Cloudflare => cloudflare::build_request(req, provider, api_key),
		Engine::OpenRouter => openrouter::build_request(req, provider, api_key),
	}
}

/// Dispatch: run the upstream call and adapt the native SSE stream into the
/// canonical event stream.
pub async fn stream_upstream(
	client: &reqwest::Client,
	built: BuiltRequest,
	engine: Engine,
	model: &str,
	timeout: Duration,
) -> Result<SseStream, AIError> {
	match engine {
		Engine::Claude | Engine::VertexClaude => {
			anthropic::stream_response(client, built, model, timeout).await
		},
		Engine::Gemini | Engine::VertexGemini => {
			gemini::stream_response(client, built, model, timeout).await
		},
		Engine::Bedrock => bedrock::stream_response(client, built, model, timeout).await,
		Engine::Cloudflare => cloudflare::stream_response(client, built, model, timeout).await,
		Engine::OpenAIResponses => openai::stream_responses_api(client, built, model, timeout).await,
		Engine::Azure => azure::stream_response(client, built, model, timeout).await,
		_ => openai::stream_response(client, built, model, timeout).await,
	}
}

/// Dispatch: run the upstream call and adapt the native response body into
/// exactly one canonical JSON value.
pub async fn fetch_upstream(
	client: &reqwest::Client,
	built: BuiltRequest,
	engine: Engine,
	model: &str,
	timeout: Duration,
) -> Result<Value, AIError> {
	match engine {
		Engine::Claude | Engine::VertexClaude => {
			anthropic::fetch_response(client, built, model, timeout).await
		},
		Engine::Gemini | Engine::VertexGemini => {
			gemini::fetch_response(client, built, model, timeout).await
		},
		Engine::Bedrock => bedrock::fetch_response(client, built, model, timeout).await,
		Engine::Cloudflare => cloudflare::fetch_response(client, built, model, timeout).await,
		Engine::OpenAIResponses => openai::fetch_responses_api(client, built, model, timeout).await,
		Engine::Azure => azure::fetch_response(client, built, model, timeout).await,
		_ => openai::fetch_response(client, built, model, timeout).await,
	}
}

/// Dispatch: upstream model listing for the list-models endpoint. Engines
/// without a listing API fall back to the configured aliases.
pub async fn list_models(
	client: &reqwest::Client,
	provider: &ProviderRuntime,
	api_key: Option<&str>,
) -> Result<Vec<String>, AIError> {
	let (engine, _) = resolve_engine(provider, None, "");
	match engine {
		Engine::OpenAI | Engine::OpenRouter | Engine::Azure => {
			openai::list_models(client, provider, api_key).await
		},
		Engine::Claude => anthropic::list_models(client, provider, api_key).await,
		Engine::Gemini => gemini::list_models(client, provider, api_key).await,
		_ => Ok(provider.model_aliases.clone()),
	}
}
