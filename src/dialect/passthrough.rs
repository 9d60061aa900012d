//! Passthrough detection and lightweight payload rewriting.
//!
//! When the inbound dialect matches the target provider's engine, the
//! original native payload goes upstream with three edits at most: a model
//! rename, a channel system prompt, and parameter overrides. No canonical
//! round trip, and stream bytes come back untouched.

use http::HeaderMap;
use serde_json::{Map, Value};

use super::DialectId;
use crate::config::ProviderRuntime;
use crate::llm::resolve_engine;

const DROPPED_HEADERS: &[&str] = &[
	"authorization",
	"x-api-key",
	"api-key",
	"x-goog-api-key",
	"host",
	"content-length",
	"accept-encoding",
];

#[derive(Debug, Clone, Default)]
pub struct Modifications {
	pub model_rename: Option<String>,
	pub system_prompt: Option<String>,
	pub overrides: Option<Map<String, Value>>,
}

#[derive(Debug, Clone)]
pub struct PassthroughContext {
	pub enabled: bool,
	pub dialect: DialectId,
	pub original_payload: Value,
	pub original_headers: HeaderMap,
	pub modifications: Modifications,
}

/// Passthrough applies when the dialect's declared target engine equals the
/// provider's engine.
pub fn detect_passthrough(dialect: DialectId, provider: &ProviderRuntime, upstream_model: &str) -> bool {
	let (engine, _) = resolve_engine(provider, None, upstream_model);
	engine.native_dialect() == Some(dialect.target_engine())
}

pub fn evaluate_passthrough(
	dialect: DialectId,
	original_payload: &Value,
	original_headers: &HeaderMap,
	provider: &ProviderRuntime,
	request_model: &str,
) -> PassthroughContext {
	let upstream = crate::llm::upstream_model(provider, request_model);
	let enabled = detect_passthrough(dialect, provider, &upstream);
	let mut modifications = Modifications::default();
	if enabled {
		if let Some(mapped) = provider.model_map.get(request_model)
			&& mapped != request_model
		{
			modifications.model_rename = Some(mapped.clone());
		}
		modifications.system_prompt = provider
			.config
			.preferences
			.system_prompt
			.clone()
			.filter(|s| !s.trim().is_empty());
		modifications.overrides = provider
			.config
			.preferences
			.post_body_parameter_overrides
			.clone()
			.filter(|o| !o.is_empty());
	}
	PassthroughContext {
		enabled,
		dialect,
		original_payload: original_payload.clone(),
		original_headers: original_headers.clone(),
		modifications,
	}
}

/// Inbound headers minus auth and transport headers the upstream must not
/// see.
pub fn filter_passthrough_headers(headers: &HeaderMap) -> HeaderMap {
	let mut out = HeaderMap::new();
	for (name, value) in headers {
		if DROPPED_HEADERS.contains(&name.as_str()) {
			continue;
		}
		out.insert(name.clone(), value.clone());
	}
	out
}

pub fn apply_passthrough_modifications(
	payload: &Value,
	modifications: &Modifications,
	dialect: DialectId,
	request_model: &str,
	original_model: &str,
) -> Value {
	let mut payload = payload.clone();
	// Gemini's model lives in the URL path, not the body.
	if let Some(rename) = &modifications.model_rename
		&& dialect != DialectId::Gemini
	{
		payload["model"] = Value::String(rename.clone());
	}
	if let Some(prompt) = &modifications.system_prompt {
		inject_system_prompt(&mut payload, prompt, dialect);
	}
	if let Some(overrides) = &modifications.overrides {
		apply_overrides(&mut payload, overrides, request_model, original_model);
	}
	payload
}

fn inject_system_prompt(payload: &mut Value, prompt: &str, dialect: DialectId) {
	let prompt = prompt.trim();
	if prompt.is_empty() {
		return;
	}
	let merge = |old: &str| {
		if old.is_empty() {
			prompt.to_string()
		} else {
			format!("{prompt}\n\n{old}")
		}
	};
	match dialect {
		DialectId::OpenAI => {
			let Some(messages) = payload
				.get_mut("messages")
				.and_then(|m| m.as_array_mut())
			else {
				return;
			};
			for msg in messages.iter_mut() {
				if msg["role"] == "system" {
					let old = msg["content"].as_str().unwrap_or_default().to_string();
					msg["content"] = Value::String(merge(&old));
					return;
				}
			}
			messages.insert(
				0,
				serde_json::json!({"role": "system", "content": prompt}),
			);
		},
		DialectId::Claude => {
			let old = payload.get("system").cloned();
			match old {
				Some(Value::String(old)) => {
					payload["system"] = Value::String(merge(&old));
				},
				None | Some(Value::Null) => {
					payload["system"] = Value::String(prompt.to_string());
				},
				_ => {},
			}
		},
		DialectId::Gemini => {
			let has_first_part = payload["systemInstruction"]["parts"]
				.as_array()
				.and_then(|p| p.first())
				.map(|f| f.is_object())
				.unwrap_or(false);
			if has_first_part {
				let old = payload["systemInstruction"]["parts"][0]["text"]
					.as_str()
					.unwrap_or_default()
					.to_string();
				payload["systemInstruction"]["parts"][0]["text"] = Value::String(merge(&old));
			} else {
				payload["systemInstruction"] = serde_json::json!({"parts": [{"text": prompt}]});
			}
		},
	}
}

fn deep_merge(target: &mut Value, overlay: &Value) {
	match (target, overlay) {
		(Value::Object(target), Value::Object(overlay)) => {
			for (k, v) in overlay {
				match target.get_mut(k) {
					Some(existing) if existing.is_object() && v.is_object() => deep_merge(existing, v),
					_ => {
						target.insert(k.clone(), v.clone());
					},
				}
			}
		},
		(target, overlay) => *target = overlay.clone(),
	}
}

/// `all`/`*` merge first (absent keys only at the top level would be the
/// canonical-path rule; in passthrough the original deep-merge semantics
/// apply), then the exact request alias and upstream name always win.
fn apply_overrides(
	payload: &mut Value,
	overrides: &Map<String, Value>,
	request_model: &str,
	original_model: &str,
) {
	for key in ["all", "*"] {
		if let Some(global) = overrides.get(key).filter(|v| v.is_object()) {
			deep_merge(payload, global);
		}
	}
	let mut model_keys = vec![request_model];
	if original_model != request_model {
		model_keys.push(original_model);
	}
	for key in model_keys {
		if let Some(model_override) = overrides.get(key).filter(|v| v.is_object()) {
			deep_merge(payload, model_override);
		}
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;
	use crate::config::{Config, ProviderConfig, RuntimeConfig};

	fn provider(v: Value) -> std::sync::Arc<ProviderRuntime> {
		let cfg: ProviderConfig = serde_json::from_value(v).unwrap();
		let rc = RuntimeConfig::build(Config {
			providers: vec![cfg],
			..Default::default()
		});
		rc.providers[0].clone()
	}

	#[test]
	fn detection_requires_matching_engine() {
		let p = provider(json!({
			"provider": "oa",
			"base_url": "https://api.openai.com/v1/chat/completions",
			"model": ["gpt-4o"],
		}));
		assert!(detect_passthrough(DialectId::OpenAI, &p, "gpt-4o"));
		assert!(!detect_passthrough(DialectId::Claude, &p, "gpt-4o"));

		let p = provider(json!({
			"provider": "cl",
			"base_url": "https://api.anthropic.com/v1/messages",
			"model": ["claude-3-7-sonnet"],
		}));
		assert!(detect_passthrough(DialectId::Claude, &p, "claude-3-7-sonnet"));
		assert!(!detect_passthrough(DialectId::OpenAI, &p, "claude-3-7-sonnet"));
	}

	#[test]
	fn system_prompt_injection_openai() {
		let mut payload = json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]});
		inject_system_prompt(&mut payload, "be terse", DialectId::OpenAI);
		assert_eq!(
			payload["messages"][0],
			json!({"role": "system", "content": "be terse"})
		);
		assert_eq!(payload["messages"][1]["content"], "hi");

		// prepends when a system message already exists
		inject_system_prompt(&mut payload, "also brief", DialectId::OpenAI);
		assert_eq!(payload["messages"][0]["content"], "also brief\n\nbe terse");
	}

	#[test]
	fn system_prompt_injection_claude_and_gemini() {
		let mut payload = json!({"model": "m", "messages": []});
		inject_system_prompt(&mut payload, "be terse", DialectId::Claude);
		assert_eq!(payload["system"], "be terse");
		inject_system_prompt(&mut payload, "more", DialectId::Claude);
		assert_eq!(payload["system"], "more\n\nbe terse");

		let mut payload = json!({"contents": []});
		inject_system_prompt(&mut payload, "be terse", DialectId::Gemini);
		assert_eq!(payload["systemInstruction"]["parts"][0]["text"], "be terse");
	}

	#[test]
	fn overrides_merge_order() {
		let overrides: Map<String, Value> = serde_json::from_value(json!({
			"all": {"temperature": 0.1, "extra": {"a": 1}},
			"my-model": {"temperature": 0.9}
		}))
		.unwrap();
		let mut payload = json!({"model": "my-model"});
		apply_overrides(&mut payload, &overrides, "my-model", "upstream-model");
		assert_eq!(payload["temperature"], 0.9);
		assert_eq!(payload["extra"]["a"], 1);
	}

	#[test]
	fn header_filter_drops_auth_and_transport() {
		let mut headers = HeaderMap::new();
		headers.insert("authorization", "Bearer sk-x".parse().unwrap());
		headers.insert("x-goog-api-key", "g".parse().unwrap());
		headers.insert("content-length", "10".parse().unwrap());
		headers.insert("x-custom", "keep".parse().unwrap());
		let out = filter_passthrough_headers(&headers);
		assert_eq!(out.len(), 1);
		assert!(out.contains_key("x-custom"));
	}

	#[test]
	fn model_rename_skipped_for_gemini() {
		let mods = Modifications {
			model_rename: Some("real-model".to_string()),
			..Default::default()
		};
		let payload = json!({"contents": []});
		let out = apply_passthrough_modifications(&payload, &mods, DialectId::Gemini, "alias", "real-model");
		assert!(out.get("model").is_none());
		let payload = json!({"model": "alias", "messages": []});
		let out = apply_passthrough_modifications(&payload, &mods, DialectId::OpenAI, "alias", "real-model");
		assert_eq!(out["model"], "real-model");
	}
}
