//! Inbound dialects: parse a native wire format into the canonical request
//! and render canonical responses / SSE chunks back out.
//!
//! A dialect also declares its HTTP endpoints (mounted by the server at
//! startup) and how to pull the API token out of a nonstandard location.

use std::collections::HashMap;

use http::HeaderMap;
use serde_json::Value;

use crate::handler::GatewayError;
use crate::llm::universal;

pub mod claude;
pub mod gemini;
pub mod openai;
pub mod passthrough;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialectId {
	OpenAI,
	Claude,
	Gemini,
}

/// Path parameters captured by a dialect route, e.g. the Gemini
/// `models/{model}:{action}` segment.
#[derive(Debug, Clone, Default)]
pub struct PathParams {
	pub model: Option<String>,
	pub action: Option<String>,
}

pub struct EndpointDef {
	pub method: &'static str,
	pub path: &'static str,
}

pub const DIALECTS: &[DialectId] = &[DialectId::OpenAI, DialectId::Claude, DialectId::Gemini];

impl DialectId {
	pub fn id(&self) -> &'static str {
		match self {
			DialectId::OpenAI => "openai",
			DialectId::Claude => "claude",
			DialectId::Gemini => "gemini",
		}
	}

	/// The outbound engine this dialect speaks natively; a provider with the
	/// same engine is eligible for passthrough.
	pub fn target_engine(&self) -> &'static str {
		self.id()
	}

	pub fn endpoints(&self) -> &'static [EndpointDef] {
		match self {
			DialectId::OpenAI => &[EndpointDef {
				method: "POST",
				path: "/v1/chat/completions",
			}],
			DialectId::Claude => &[EndpointDef {
				method: "POST",
				path: "/v1/messages",
			}],
			DialectId::Gemini => &[
				EndpointDef {
					method: "POST",
					path: "/v1beta/models/{model_action}",
				},
				EndpointDef {
					method: "GET",
					path: "/v1beta/models",
				},
			],
		}
	}

	pub fn parse_request(
		&self,
		body: &Value,
		params: &PathParams,
	) -> Result<universal::Request, GatewayError> {
		match self {
			DialectId::OpenAI => openai::parse_request(body),
			DialectId::Claude => claude::parse_request(body, params),
			DialectId::Gemini => gemini::parse_request(body, params),
		}
	}

	pub fn render_response(&self, canonical: &Value, model: &str) -> Value {
		match self {
			DialectId::OpenAI => canonical.clone(),
			DialectId::Claude => claude::render_response(canonical, model),
			DialectId::Gemini => gemini::render_response(canonical),
		}
	}

	/// Render one canonical SSE chunk into this dialect's framing. An empty
	/// string drops the chunk.
	pub fn render_stream(&self, chunk: &str) -> String {
		match self {
			DialectId::OpenAI => chunk.to_string(),
			DialectId::Claude => claude::render_stream(chunk),
			DialectId::Gemini => gemini::render_stream(chunk),
		}
	}

	/// Pull the caller's token from a dialect-specific location; the server
	/// falls back to `Authorization: Bearer`.
	pub fn extract_token(
		&self,
		headers: &HeaderMap,
		query: &HashMap<String, String>,
	) -> Option<String> {
		let header_token = |name: &str| {
			headers
				.get(name)
				.and_then(|v| v.to_str().ok())
				.map(str::to_string)
		};
		match self {
			DialectId::OpenAI => None,
			DialectId::Claude => header_token("x-api-key"),
			DialectId::Gemini => header_token("x-goog-api-key").or_else(|| query.get("key").cloned()),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn token_extraction_locations() {
		let mut headers = HeaderMap::new();
		headers.insert("x-api-key", "sk-claude".parse().unwrap());
		headers.insert("x-goog-api-key", "sk-goog".parse().unwrap());
		let query = HashMap::from([("key".to_string(), "sk-query".to_string())]);

		assert_eq!(DialectId::OpenAI.extract_token(&headers, &query), None);
		assert_eq!(
			DialectId::Claude.extract_token(&headers, &query).as_deref(),
			Some("sk-claude")
		);
		assert_eq!(
			DialectId::Gemini.extract_token(&headers, &query).as_deref(),
			Some("sk-goog")
		);
		assert_eq!(
			DialectId::Gemini
				.extract_token(&HeaderMap::new(), &query)
				.as_deref(),
			Some("sk-query")
		);
	}
}
