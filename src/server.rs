//! Inbound HTTP surface: dialect endpoints, the models listing, and API-key
//! authentication with per-key rate limits.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use http::HeaderMap;
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;

use crate::app::AppState;
use crate::config::RuntimeConfig;
use crate::dialect::{DialectId, PathParams};
use crate::handler::{self, GatewayError, split_model_action};
use crate::stats::RequestInfo;
use crate::streaming::StatGuard;

pub fn router(state: Arc<AppState>) -> Router {
	Router::new()
		.route("/v1/chat/completions", post(chat_completions))
		.route("/v1/models", get(list_models))
		.route("/v1/embeddings", post(embeddings))
		.route("/v1/images/generations", post(images_generations))
		.route("/v1/audio/speech", post(audio_speech))
		.route("/v1/audio/transcriptions", post(audio_transcriptions))
		.route("/v1/moderations", post(moderations))
		.route("/v1/messages", post(claude_messages))
		.route("/v1beta/models", get(gemini_list_models))
		.route("/v1beta/models/{model_action}", post(gemini_generate))
		.layer(CorsLayer::permissive())
		.with_state(state)
}

fn default_token(headers: &HeaderMap) -> Option<String> {
	if let Some(v) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
		return Some(v.to_string());
	}
	let auth = headers.get(http::header::AUTHORIZATION)?.to_str().ok()?;
	auth.split_whitespace().nth(1).map(str::to_string)
}

async fn authorize(
	config: &RuntimeConfig,
	dialect: DialectId,
	headers: &HeaderMap,
	query: &HashMap<String, String>,
	model_hint: &str,
) -> Result<(usize, String), GatewayError> {
	let token = dialect
		.extract_token(headers, query)
		.or_else(|| default_token(headers))
		.ok_or_else(|| GatewayError::new(403, "Invalid or missing API Key"))?;
	let api_index = config
		.api_index(&token)
		.ok_or_else(|| GatewayError::new(403, "Invalid or missing API Key"))?;
	if config.global_rate_limit.next("global").await.is_err() {
		return Err(GatewayError::new(429, "Too many requests"));
	}
	if let Some(list) = config.user_rate_limits.get(&token)
		&& list.next(model_hint).await.is_err()
	{
		return Err(GatewayError::new(429, "Too many requests"));
	}
	Ok((api_index, token))
}

fn client_ip(headers: &HeaderMap) -> String {
	headers
		.get("x-forwarded-for")
		.and_then(|v| v.to_str().ok())
		.map(|v| v.split(',').next().unwrap_or("").trim().to_string())
		.unwrap_or_default()
}

fn sanitized_inbound_headers(headers: &HeaderMap) -> String {
	let safe: HashMap<String, String> = headers
		.iter()
		.filter(|(k, _)| !matches!(k.as_str(), "authorization" | "x-api-key" | "api-key"))
		.filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
		.collect();
	serde_json::to_string(&safe).unwrap_or_default()
}

#[allow(clippy::too_many_arguments)]
async fn handle_dialect_request(
	state: Arc<AppState>,
	dialect: DialectId,
	endpoint: &str,
	params: PathParams,
	headers: HeaderMap,
	query: HashMap<String, String>,
	body: Value,
	allow_passthrough: bool,
) -> Response {
	let config = state.snapshot();
	let (api_index, token) = match authorize(
		&config,
		dialect,
		&headers,
		&query,
		body["model"].as_str().unwrap_or("default"),
	)
	.await
	{
		Ok(auth) => auth,
		Err(e) => return e.into_response(),
	};

	let canonical = match dialect.parse_request(&body, &params) {
		Ok(req) => req,
		Err(e) => return e.into_response(),
	};

	let info = Arc::new(parking_lot::Mutex::new(RequestInfo::new(
		endpoint,
		&client_ip(&headers),
	)));
	{
		let mut i = info.lock();
		i.api_key = token;
		i.model = canonical.model.clone();
		if let Some(hours) = config.raw.preferences.raw_data_retention_hours {
			i.raw_data_expires_at = Some(chrono::Utc::now().timestamp() + (hours as i64) * 3600);
			i.request_headers = Some(sanitized_inbound_headers(&headers));
			i.request_body = Some(crate::truncate::truncate_value(&body, 0).to_string());
		}
	}
	let guard = StatGuard::new(info.clone(), state.sink.clone());

	handler::request_model(
		state,
		canonical,
		api_index,
		Some(endpoint.to_string()),
		dialect,
		allow_passthrough.then(|| body.clone()),
		headers,
		info,
		guard,
	)
	.await
}

async fn chat_completions(
	State(state): State<Arc<AppState>>,
	headers: HeaderMap,
	Query(query): Query<HashMap<String, String>>,
	Json(body): Json<Value>,
) -> Response {
	handle_dialect_request(
		state,
		DialectId::OpenAI,
		"/v1/chat/completions",
		PathParams::default(),
		headers,
		query,
		body,
		true,
	)
	.await
}

macro_rules! openai_endpoint {
	($name:ident, $path:literal) => {
		async fn $name(
			State(state): State<Arc<AppState>>,
			headers: HeaderMap,
			Query(query): Query<HashMap<String, String>>,
			Json(body): Json<Value>,
		) -> Response {
			handle_dialect_request(
				state,
				DialectId::OpenAI,
				$path,
				PathParams::default(),
				headers,
				query,
				body,
				false,
			)
			.await
		}
	};
}

openai_endpoint!(embeddings, "/v1/embeddings");
openai_endpoint!(images_generations, "/v1/images/generations");
openai_endpoint!(audio_speech, "/v1/audio/speech");
openai_endpoint!(audio_transcriptions, "/v1/audio/transcriptions");
openai_endpoint!(moderations, "/v1/moderations");

async fn claude_messages(
	State(state): State<Arc<AppState>>,
	headers: HeaderMap,
	Query(query): Query<HashMap<String, String>>,
	Json(body): Json<Value>,
) -> Response {
	handle_dialect_request(
		state,
		DialectId::Claude,
		"/v1/messages",
		PathParams::default(),
		headers,
		query,
		body,
		true,
	)
	.await
}

async fn gemini_generate(
	State(state): State<Arc<AppState>>,
	Path(model_action): Path<String>,
	headers: HeaderMap,
	Query(query): Query<HashMap<String, String>>,
	Json(body): Json<Value>,
) -> Response {
	let params = split_model_action(&model_action);
	let endpoint = if params
		.action
		.as_deref()
		.map(|a| a.contains("streamGenerateContent"))
		.unwrap_or(false)
	{
		"/v1beta/models/streamGenerateContent"
	} else {
		"/v1beta/models/generateContent"
	};
	handle_dialect_request(
		state,
		DialectId::Gemini,
		endpoint,
		params,
		headers,
		query,
		body,
		true,
	)
	.await
}

async fn list_models(
	State(state): State<Arc<AppState>>,
	headers: HeaderMap,
	Query(query): Query<HashMap<String, String>>,
) -> Response {
	let config = state.snapshot();
	let api_index = match authorize(&config, DialectId::OpenAI, &headers, &query, "default").await {
		Ok((idx, _)) => idx,
		Err(e) => return e.into_response(),
	};
	let models = crate::routing::available_models(&config, api_index);
	Json(json!({"object": "list", "data": models})).into_response()
}

async fn gemini_list_models(
	State(state): State<Arc<AppState>>,
	headers: HeaderMap,
	Query(query): Query<HashMap<String, String>>,
) -> Response {
	let config = state.snapshot();
	let api_index = match authorize(&config, DialectId::Gemini, &headers, &query, "default").await {
		Ok((idx, _)) => idx,
		Err(e) => return e.into_response(),
	};
	let models: Vec<Value> = crate::routing::available_models(&config, api_index)
		.into_iter()
		.filter_map(|m| m["id"].as_str().map(str::to_string))
		.map(|id| {
			json!({
				"name": format!("models/{id}"),
				"supportedGenerationMethods": ["generateContent", "streamGenerateContent"],
			})
		})
		.collect();
	Json(json!({"models": models})).into_response()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn bearer_and_x_api_key_extraction() {
		let mut headers = HeaderMap::new();
		headers.insert(
			http::header::AUTHORIZATION,
			"Bearer sk-test".parse().unwrap(),
		);
		assert_eq!(default_token(&headers).as_deref(), Some("sk-test"));

		let mut headers = HeaderMap::new();
		headers.insert("x-api-key", "sk-direct".parse().unwrap());
		assert_eq!(default_token(&headers).as_deref(), Some("sk-direct"));

		assert!(default_token(&HeaderMap::new()).is_none());
	}

	#[test]
	fn forwarded_ip_takes_first_hop() {
		let mut headers = HeaderMap::new();
		headers.insert("x-forwarded-for", "10.1.2.3, 172.16.0.1".parse().unwrap());
		assert_eq!(client_ip(&headers), "10.1.2.3");
		assert_eq!(client_ip(&HeaderMap::new()), "");
	}

	#[test]
	fn inbound_header_capture_drops_credentials() {
		let mut headers = HeaderMap::new();
		headers.insert("authorization", "Bearer sk-secret".parse().unwrap());
		headers.insert("user-agent", "test".parse().unwrap());
		let captured = sanitized_inbound_headers(&headers);
		assert!(!captured.contains("sk-secret"));
		assert!(captured.contains("user-agent"));
	}
}
