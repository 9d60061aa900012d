//! Interception chains: an ordered pre-dispatch hook over the outgoing
//! request and a per-chunk hook over the response stream.
//!
//! Providers opt in per channel via `preferences.enabled_plugins`; an absent
//! list enables every registered plugin.

use std::sync::Arc;

use http::HeaderMap;
use serde_json::Value;

pub mod thinking;

/// Per-request stream state. A fresh transformer is created for every
/// request so tag-matching state never leaks across requests.
pub trait StreamTransform: Send {
	/// Transform one SSE line (including its framing); the returned lines
	/// replace it. Return the input unchanged to pass through.
	fn transform(&mut self, line: &str) -> Vec<String>;
	/// Emit anything still pending once the stream ends.
	fn flush(&mut self) -> Vec<String>;
}

pub trait Plugin: Send + Sync {
	fn name(&self) -> &'static str;

	/// Pre-dispatch hook: may rewrite the upstream URL, headers, or payload.
	fn on_request(&self, model: &str, url: &mut String, headers: &mut HeaderMap, payload: &mut Value) {
		let _ = (model, url, headers, payload);
	}

	/// Optional per-request stream transformer.
	fn stream_transformer(&self, model: &str) -> Option<Box<dyn StreamTransform>> {
		let _ = model;
		None
	}
}

#[derive(Clone, Default)]
pub struct PluginRegistry {
	plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginRegistry {
	pub fn with_builtin() -> Self {
		PluginRegistry {
			plugins: vec![Arc::new(thinking::ClaudeThinking)],
		}
	}

	pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
		self.plugins.push(plugin);
	}

	fn enabled<'a>(
		&'a self,
		enabled_plugins: Option<&'a [String]>,
	) -> impl Iterator<Item = &'a Arc<dyn Plugin>> {
		self.plugins.iter().filter(move |p| match enabled_plugins {
			Some(list) => list.iter().any(|n| n == p.name()),
			None => true,
		})
	}

	pub fn apply_request(
		&self,
		enabled_plugins: Option<&[String]>,
		model: &str,
		url: &mut String,
		headers: &mut HeaderMap,
		payload: &mut Value,
	) {
		for plugin in self.enabled(enabled_plugins) {
			plugin.on_request(model, url, headers, payload);
		}
	}

	pub fn stream_transformers(
		&self,
		enabled_plugins: Option<&[String]>,
		model: &str,
	) -> Vec<Box<dyn StreamTransform>> {
		self
			.enabled(enabled_plugins)
			.filter_map(|p| p.stream_transformer(model))
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn enabled_list_filters_plugins() {
		let registry = PluginRegistry::with_builtin();
		let mut url = String::new();
		let mut headers = HeaderMap::new();
		let mut payload = json!({"model": "claude-3-7-sonnet-thinking", "messages": []});

		// disabled by an explicit empty list
		registry.apply_request(Some(&[]), "claude-3-7-sonnet-thinking", &mut url, &mut headers, &mut payload);
		assert_eq!(payload["model"], "claude-3-7-sonnet-thinking");

		// enabled by default
		registry.apply_request(None, "claude-3-7-sonnet-thinking", &mut url, &mut headers, &mut payload);
		assert_eq!(payload["model"], "claude-3-7-sonnet");
	}
}
