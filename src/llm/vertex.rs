//! Google Vertex AI upstream, for both Gemini and Anthropic publisher models.
//!
//! Auth is a short-lived access token minted from the service-account
//! credential: RS256 JWT -> oauth2 token exchange, cached until expiry.
//! Regions rotate round-robin per model family.

use std::collections::HashMap;

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Mutex;

use super::universal;
use super::{AIError, BuiltRequest, Engine, anthropic, gemini, upstream_model};
use crate::config::ProviderRuntime;

pub const OAUTH_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
pub const VERTEX_ANTHROPIC_VERSION: &str = "vertex-2023-10-16";

const CLAUDE_SONNET_REGIONS: &[&str] = &["us-east5", "europe-west1"];
const CLAUDE_DEFAULT_REGIONS: &[&str] = &["us-east5"];
const GEMINI_PRO_REGIONS: &[&str] = &[
	"us-central1",
	"us-east1",
	"us-east4",
	"us-east5",
	"us-south1",
	"us-west1",
	"us-west4",
	"europe-west1",
	"europe-west4",
	"europe-north1",
	"europe-southwest1",
	"asia-east1",
	"asia-southeast1",
	"global",
];
const GEMINI_DEFAULT_REGIONS: &[&str] = &["us-central1", "us-east4", "europe-west4"];

static REGION_CURSORS: Lazy<parking_lot::Mutex<HashMap<&'static str, usize>>> =
	Lazy::new(|| parking_lot::Mutex::new(HashMap::new()));

fn next_region(family: &'static str, ring: &'static [&'static str]) -> &'static str {
	let mut cursors = REGION_CURSORS.lock();
	let cursor = cursors.entry(family).or_insert(0);
	let region = ring[*cursor % ring.len()];
	*cursor = cursor.wrapping_add(1);
	region
}

pub(super) fn pick_region(model: &str) -> &'static str {
	if model.contains("claude") {
		if model.contains("3-5-sonnet") || model.contains("3.5-sonnet") {
			next_region("claude-3-5-sonnet", CLAUDE_SONNET_REGIONS)
		} else {
			next_region("claude", CLAUDE_DEFAULT_REGIONS)
		}
	} else if model.contains("2.5-pro") || model.contains("2-5-pro") {
		next_region("gemini-2.5-pro", GEMINI_PRO_REGIONS)
	} else {
		next_region("gemini", GEMINI_DEFAULT_REGIONS)
	}
}

#[derive(Serialize)]
struct Claims {
	iss: String,
	scope: String,
	aud: String,
	exp: i64,
	iat: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
	access_token: String,
	#[serde(default)]
	expires_in: i64,
}

static TOKEN_CACHE: Lazy<Mutex<HashMap<String, (String, i64)>>> =
	Lazy::new(|| Mutex::new(HashMap::new()));

/// Mint (or reuse) an access token for the service account.
pub async fn access_token(
	client: &reqwest::Client,
	client_email: &str,
	private_key: &str,
) -> Result<String, AIError> {
	let now = chrono::Utc::now().timestamp();
	{
		let cache = TOKEN_CACHE.lock().await;
		if let Some((token, exp)) = cache.get(client_email)
			&& now < exp - 60
		{
			return Ok(token.clone());
		}
	}

	let claims = Claims {
		iss: client_email.to_string(),
		scope: CLOUD_PLATFORM_SCOPE.to_string(),
		aud: OAUTH_TOKEN_URL.to_string(),
		exp: now + 3600,
		iat: now,
	};
	// Keys pasted into YAML usually carry literal \n escapes.
	let pem = private_key.replace("\\n", "\n");
	let key = EncodingKey::from_rsa_pem(pem.as_bytes()).map_err(|e| AIError::Auth(e.to_string()))?;
	let jwt = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
		.map_err(|e| AIError::Auth(e.to_string()))?;

	let resp = client
		.post(OAUTH_TOKEN_URL)
		.form(&[
			("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
			("assertion", jwt.as_str()),
		])
		.send()
		.await?;
	if !resp.status().is_success() {
		let body = resp.text().await.unwrap_or_default();
		return Err(AIError::Auth(body));
	}
	let token: TokenResponse = resp
		.json()
		.await
		.map_err(|e| AIError::Auth(e.to_string()))?;

	let expires_at = now + token.expires_in.max(600);
	TOKEN_CACHE
		.lock()
		.await
		.insert(client_email.to_string(), (token.access_token.clone(), expires_at));
	Ok(token.access_token)
}

fn host(region: &str) -> String {
	if region == "global" {
		"aiplatform.googleapis.com".to_string()
	} else {
		format!("{region}-aiplatform.googleapis.com")
	}
}

pub async fn build_request(
	engine: Engine,
	req: &universal::Request,
	provider: &ProviderRuntime,
	client: &reqwest::Client,
) -> Result<BuiltRequest, AIError> {
	let project = provider
		.config
		.project_id
		.as_deref()
		.ok_or(AIError::MissingField("project_id"))?;
	let client_email = provider
		.config
		.client_email
		.as_deref()
		.ok_or(AIError::MissingField("client_email"))?;
	let private_key = provider
		.config
		.private_key
		.as_deref()
		.ok_or(AIError::MissingField("private_key"))?;
	let token = access_token(client, client_email, private_key).await?;

	let upstream = upstream_model(provider, &req.model);
	let region = pick_region(&upstream);

	let (publisher, model, action, body) = match engine {
		Engine::VertexClaude => {
			let mut body = anthropic::translate_request(req, &upstream)?;
			if let Some(obj) = body.as_object_mut() {
				// The model rides in the URL; the version marker replaces it.
				obj.remove("model");
				obj.insert(
					"anthropic_version".to_string(),
					json!(VERTEX_ANTHROPIC_VERSION),
				);
			}
			let action = if req.stream() {
				"streamRawPredict"
			} else {
				"rawPredict"
			};
			("anthropic", upstream.clone(), action, body)
		},
		_ => {
			let body = gemini::translate_request(req, &req.model, &upstream)?;
			let action = if req.stream() {
				"streamGenerateContent?alt=sse"
			} else {
				"generateContent"
			};
			("google", gemini::url_model(&upstream), action, body)
		},
	};

	let url = format!(
		"https://{}/v1/projects/{project}/locations/{region}/publishers/{publisher}/models/{model}:{action}",
		host(region),
	);
	Ok(
		BuiltRequest::new(url, body)
			.sensitive_header("authorization", &format!("Bearer {token}")),
	)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn claude_sonnet_regions_rotate() {
		let first = pick_region("claude-3-5-sonnet-v2@20241022");
		let second = pick_region("claude-3-5-sonnet-v2@20241022");
		assert_ne!(first, second);
		assert!(CLAUDE_SONNET_REGIONS.contains(&first));
		assert!(CLAUDE_SONNET_REGIONS.contains(&second));
	}

	#[test]
	fn gemini_pro_ring_has_fourteen_regions() {
		assert_eq!(GEMINI_PRO_REGIONS.len(), 14);
		let region = pick_region("gemini-2.5-pro");
		assert!(GEMINI_PRO_REGIONS.contains(&region));
	}

	#[test]
	fn global_region_host_has_no_prefix() {
		assert_eq!(host("global"), "aiplatform.googleapis.com");
		assert_eq!(host("us-east5"), "us-east5-aiplatform.googleapis.com");
	}
}
