//! Thinking-mode plugin for `-thinking` model suffixes.
//!
//! The request hook strips the suffix, pre-fills an assistant `<thinking>`
//! turn, and widens the reasoning/completion budgets. The stream hook splits
//! generated text at `</thinking>`: everything before it becomes
//! `reasoning_content`, everything after becomes `content`. A tag can
//! straddle a chunk boundary, so a tail of `len(tag)-1` bytes stays pending.

use http::HeaderMap;
use serde_json::{Value, json};

use super::{Plugin, StreamTransform};

const THINK_OPEN: &str = "<thinking>";
const THINK_CLOSE: &str = "</thinking>";
const DEFAULT_REASONING_BUDGET: u64 = 32_768;
const MIN_ANSWER_BUDGET: u64 = 8_192;
const DEFAULT_ANSWER_BUDGET: u64 = 16_384;

pub struct ClaudeThinking;

fn is_thinking_model(model: &str) -> bool {
	let lower = model.to_lowercase();
	(lower.contains("claude") || lower.contains("codewise")) && lower.ends_with("-thinking")
}

impl Plugin for ClaudeThinking {
	fn name(&self) -> &'static str {
		"claude_thinking"
	}

	fn on_request(
		&self,
		model: &str,
		_url: &mut String,
		_headers: &mut HeaderMap,
		payload: &mut Value,
	) {
		if !is_thinking_model(model) {
			return;
		}
		let renamed = payload["model"]
			.as_str()
			.and_then(|m| m.strip_suffix("-thinking"))
			.map(str::to_string);
		if let Some(renamed) = renamed {
			payload["model"] = json!(renamed);
		}
		add_prefill(payload);
		adjust_budgets(payload);
	}

	fn stream_transformer(&self, model: &str) -> Option<Box<dyn StreamTransform>> {
		if is_thinking_model(model) {
			Some(Box::new(ThinkingStreamTransformer::new()))
		} else {
			None
		}
	}
}

fn add_prefill(payload: &mut Value) {
	let Some(messages) = payload
		.get_mut("messages")
		.and_then(|m| m.as_array_mut())
	else {
		return;
	};
	if let Some(last) = messages.last()
		&& last["role"] == "assistant"
		&& last["content"] == THINK_OPEN
	{
		return;
	}
	messages.push(json!({"role": "assistant", "content": THINK_OPEN}));
}

fn adjust_budgets(payload: &mut Value) {
	if !payload["reasoning"].is_object() {
		payload["reasoning"] = json!({});
	}
	let reasoning_max = match payload["reasoning"]["max_tokens"].as_u64() {
		Some(v) if v > 0 => v,
		_ => {
			payload["reasoning"]["max_tokens"] = json!(DEFAULT_REASONING_BUDGET);
			DEFAULT_REASONING_BUDGET
		},
	};
	let min_required = reasoning_max + MIN_ANSWER_BUDGET;
	match payload["max_completion_tokens"].as_u64() {
		Some(user_max) if user_max > reasoning_max => {
			if user_max < min_required {
				payload["max_completion_tokens"] = json!(min_required);
			}
		},
		_ => {
			payload["max_completion_tokens"] = json!(reasoning_max + DEFAULT_ANSWER_BUDGET);
		},
	}
}

pub struct ThinkingStreamTransformer {
	pending: String,
	inside_thinking: bool,
	keep_tail: usize,
}

impl Default for ThinkingStreamTransformer {
	fn default() -> Self {
		Self::new()
	}
}

impl ThinkingStreamTransformer {
	pub fn new() -> Self {
		ThinkingStreamTransformer {
			pending: String::new(),
			inside_thinking: true,
			keep_tail: THINK_CLOSE.len() - 1,
		}
	}

	fn patched(parsed: &Value, patch_key: &str, text: &str) -> Option<String> {
		if text.is_empty() {
			return None;
		}
		let mut out = parsed.clone();
		let delta = &mut out["choices"][0]["delta"];
		if let Some(obj) = delta.as_object_mut() {
			obj.remove("content");
			obj.remove("reasoning_content");
			obj.insert(patch_key.to_string(), json!(text));
		}
		Some(format!("data: {out}\n\n"))
	}

	fn handle_text(&mut self, parsed: &Value, text: &str) -> Vec<String> {
		let mut outputs = Vec::new();
		let combined = format!("{}{}", self.pending, text);
		self.pending.clear();

		if self.inside_thinking {
			if let Some(idx) = combined.to_lowercase().find(THINK_CLOSE) {
				let before = &combined[..idx];
				let after = &combined[idx + THINK_CLOSE.len()..];
				if let Some(out) = Self::patched(parsed, "reasoning_content", before) {
					outputs.push(out);
				}
				self.inside_thinking = false;
				if let Some(out) = Self::patched(parsed, "content", after) {
					outputs.push(out);
				}
			} else if combined.len() > self.keep_tail {
				let split = combined.len() - self.keep_tail;
				// Split on a char boundary so a multibyte tail survives.
				let split = (0..=split)
					.rev()
					.find(|i| combined.is_char_boundary(*i))
					.unwrap_or(0);
				let (emit, tail) = combined.split_at(split);
				if let Some(out) = Self::patched(parsed, "reasoning_content", emit) {
					outputs.push(out);
				}
				self.pending = tail.to_string();
			} else {
				self.pending = combined;
			}
		} else if let Some(out) = Self::patched(parsed, "content", &combined) {
			outputs.push(out);
		}
		outputs
	}
}

impl StreamTransform for ThinkingStreamTransformer {
	fn transform(&mut self, line: &str) -> Vec<String> {
		let trimmed = line.trim();
		if trimmed == "data: [DONE]" {
			let mut outputs = self.flush();
			outputs.push(line.to_string());
			return outputs;
		}
		let Some(data) = trimmed.strip_prefix("data: ") else {
			return vec![line.to_string()];
		};
		let Ok(parsed) = serde_json::from_str::<Value>(data) else {
			return vec![line.to_string()];
		};
		let delta = &parsed["choices"][0]["delta"];
		let reasoning = delta["reasoning_content"].as_str().map(str::to_string);
		let content = delta["content"].as_str().map(str::to_string);
		if reasoning.is_none() && content.is_none() {
			return vec![line.to_string()];
		}
		let mut outputs = Vec::new();
		if let Some(text) = reasoning {
			outputs.extend(self.handle_text(&parsed, &text));
		}
		if let Some(text) = content {
			outputs.extend(self.handle_text(&parsed, &text));
		}
		outputs
	}

	fn flush(&mut self) -> Vec<String> {
		if self.pending.is_empty() {
			return Vec::new();
		}
		let dummy = json!({"choices": [{"delta": {}}]});
		let pending = std::mem::take(&mut self.pending);
		let key = if self.inside_thinking {
			"reasoning_content"
		} else {
			"content"
		};
		Self::patched(&dummy, key, &pending).into_iter().collect()
	}
}
