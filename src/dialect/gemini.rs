//! Gemini inbound dialect.
//!
//! `contents[]` roles map user/model onto the canonical roles, the
//! systemInstruction is extracted, generationConfig fields move to the
//! canonical knobs, and `function_declarations` become canonical tools. The
//! stream renderer wraps deltas back into candidates with thought parts;
//! Gemini has no explicit stream terminator, so `[DONE]` renders to nothing.

use serde_json::{Value, json};

use super::PathParams;
use crate::handler::GatewayError;
use crate::llm::universal::{Content, ContentPart, FunctionDefinition, ImageUrl, Message, Request,
	Role, Tool};

pub fn parse_request(body: &Value, params: &PathParams) -> Result<Request, GatewayError> {
	let mut messages: Vec<Message> = Vec::new();

	if let Some(parts) = body["systemInstruction"]["parts"].as_array() {
		let text: String = parts.iter().filter_map(|p| p["text"].as_str()).collect();
		if !text.trim().is_empty() {
			messages.push(Message::text(Role::System, text.trim()));
		}
	}

	for content in body["contents"].as_array().unwrap_or(&vec![]) {
		let role = match content["role"].as_str() {
			Some("model") => Role::Assistant,
			_ => Role::User,
		};
		let Some(parts) = content["parts"].as_array() else {
			continue;
		};
		let mut items: Vec<ContentPart> = Vec::new();
		for part in parts {
			if let Some(text) = part["text"].as_str() {
				items.push(ContentPart::Text {
					text: text.to_string(),
				});
			} else if part["inlineData"].is_object() {
				let mime = part["inlineData"]["mimeType"].as_str().unwrap_or("image/png");
				let data = part["inlineData"]["data"].as_str().unwrap_or_default();
				items.push(ContentPart::ImageUrl {
					image_url: ImageUrl {
						url: format!("data:{mime};base64,{data}"),
					},
				});
			}
		}
		if items.is_empty() {
			continue;
		}
		let content = match items.as_slice() {
			[ContentPart::Text { text }] => Content::Text(text.clone()),
			_ => Content::Parts(items),
		};
		messages.push(Message {
			role,
			name: None,
			content: Some(content),
			tool_calls: None,
			tool_call_id: None,
			thought_signature: None,
			reasoning_content: None,
		});
	}

	if messages.is_empty() {
		messages.push(Message::text(Role::User, ""));
	}

	let model = params
		.model
		.clone()
		.or_else(|| body["model"].as_str().map(str::to_string))
		.unwrap_or_default();
	let action = params.action.clone().unwrap_or_default();
	let stream = action.contains("streamGenerateContent") || body["stream"].as_bool().unwrap_or(false);

	let r#gen = &body["generationConfig"];
	let mut req = Request {
		model,
		messages,
		..Default::default()
	};
	req.stream = Some(stream);
	req.temperature = r#gen["temperature"].as_f64();
	req.max_tokens = r#gen["maxOutputTokens"].as_u64();
	req.top_p = r#gen["topP"].as_f64();
	req.top_k = r#gen["topK"].as_u64().map(|k| k as u32);
	req.tools = parse_tools(body);
	Ok(req)
}

fn parse_tools(body: &Value) -> Option<Vec<Tool>> {
	let groups = body["tools"].as_array()?;
	let mut tools = Vec::new();
	for group in groups {
		let declarations = group
			.get("function_declarations")
			.or_else(|| group.get("functionDeclarations"))
			.and_then(|d| d.as_array());
		let Some(declarations) = declarations else {
			continue;
		};
		for decl in declarations {
			let Some(name) = decl["name"].as_str() else {
				continue;
			};
			tools.push(Tool {
				r#type: "function".to_string(),
				function: FunctionDefinition {
					name: name.to_string(),
					description: decl["description"].as_str().map(str::to_string),
					parameters: decl.get("parameters").filter(|p| p.is_object()).cloned(),
				},
			});
		}
	}
	if tools.is_empty() { None } else { Some(tools) }
}

pub fn render_response(canonical: &Value) -> Value {
	let message = &canonical["choices"][0]["message"];
	let mut content_text = String::new();
	match &message["content"] {
		Value::String(s) => content_text.push_str(s),
		Value::Array(parts) => {
			for part in parts {
				if let Some(t) = part["text"].as_str() {
					content_text.push_str(t);
				}
			}
		},
		_ => {},
	}
	let usage = &canonical["usage"];
	json!({
		"candidates": [{
			"content": {"role": "model", "parts": [{"text": content_text}]},
			"finishReason": "STOP",
		}],
		"usageMetadata": {
			"promptTokenCount": usage["prompt_tokens"].as_i64().unwrap_or(0),
			"candidatesTokenCount": usage["completion_tokens"].as_i64().unwrap_or(0),
			"totalTokenCount": usage["total_tokens"].as_i64().unwrap_or(0),
		}
	})
}

pub fn render_stream(chunk: &str) -> String {
	let Some(data) = chunk.strip_prefix("data: ") else {
		return chunk.to_string();
	};
	let data = data.trim();
	if data == "[DONE]" {
		// The client sees the final chunk's finishReason instead.
		return String::new();
	}
	let Ok(canonical) = serde_json::from_str::<Value>(data) else {
		return chunk.to_string();
	};
	let Some(choice) = canonical["choices"].as_array().and_then(|c| c.first()) else {
		return String::new();
	};
	let delta = &choice["delta"];
	let mut parts: Vec<Value> = Vec::new();
	if let Some(reasoning) = delta["reasoning_content"].as_str()
		&& !reasoning.is_empty()
	{
		parts.push(json!({"thought": true, "text": reasoning}));
	}
	if let Some(content) = delta["content"].as_str()
		&& !content.is_empty()
	{
		parts.push(json!({"text": content}));
	}

	let mut out = json!({
		"candidates": [{"content": {"role": "model", "parts": parts}}]
	});
	if choice["finish_reason"].as_str().is_some() {
		out["candidates"][0]["finishReason"] = json!("STOP");
	}
	if let Some(usage) = canonical.get("usage").filter(|u| u.is_object()) {
		out["usageMetadata"] = json!({
			"promptTokenCount": usage["prompt_tokens"].as_i64().unwrap_or(0),
			"candidatesTokenCount": usage["completion_tokens"].as_i64().unwrap_or(0),
			"totalTokenCount": usage["total_tokens"].as_i64().unwrap_or(0),
		});
	}
	if out["candidates"][0]["content"]["parts"]
		.as_array()
		.map(|p| p.is_empty())
		.unwrap_or(true)
		&& out.get("usageMetadata").is_none()
		&& out["candidates"][0].get("finishReason").is_none()
	{
		return String::new();
	}
	format!("data: {out}\n\n")
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn contents_and_generation_config_parse() {
		let params = PathParams {
			model: Some("gemini-2.5-pro".to_string()),
			action: Some("streamGenerateContent".to_string()),
		};
		let req = parse_request(
			&json!({
				"systemInstruction": {"parts": [{"text": "be terse"}]},
				"contents": [
					{"role": "user", "parts": [{"text": "hi"}]},
					{"role": "model", "parts": [{"text": "hello"}]},
					{"role": "user", "parts": [
						{"text": "what is this"},
						{"inlineData": {"mimeType": "image/png", "data": "AAAA"}}
					]}
				],
				"generationConfig": {"temperature": 0.5, "maxOutputTokens": 2048, "topP": 0.8},
				"tools": [{"function_declarations": [{"name": "f", "description": "d"}]}]
			}),
			&params,
		)
		.unwrap();
		assert_eq!(req.model, "gemini-2.5-pro");
		assert!(req.stream());
		assert_eq!(req.messages[0].role, Role::System);
		assert_eq!(req.messages[2].role, Role::Assistant);
		assert!(matches!(
			req.messages[3].content,
			Some(Content::Parts(ref p)) if p.len() == 2
		));
		assert_eq!(req.temperature, Some(0.5));
		assert_eq!(req.max_tokens, Some(2048));
		assert_eq!(req.tools.as_ref().unwrap()[0].function.name, "f");
	}

	#[test]
	fn stream_rendering_separates_thoughts() {
		let out = render_stream(
			"data: {\"choices\":[{\"delta\":{\"reasoning_content\":\"hmm\",\"content\":\"hi\"}}]}\n\n",
		);
		let v: Value = serde_json::from_str(out.strip_prefix("data: ").unwrap().trim()).unwrap();
		let parts = v["candidates"][0]["content"]["parts"].as_array().unwrap();
		assert_eq!(parts[0]["thought"], true);
		assert_eq!(parts[0]["text"], "hmm");
		assert_eq!(parts[1]["text"], "hi");
	}

	#[test]
	fn done_renders_to_nothing() {
		assert_eq!(render_stream("data: [DONE]\n\n"), "");
	}

	#[test]
	fn finish_and_usage_survive_rendering() {
		let out = render_stream(
			"data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}],\"usage\":{\"prompt_tokens\":1,\"completion_tokens\":2,\"total_tokens\":3}}\n\n",
		);
		let v: Value = serde_json::from_str(out.strip_prefix("data: ").unwrap().trim()).unwrap();
		assert_eq!(v["candidates"][0]["finishReason"], "STOP");
		assert_eq!(v["usageMetadata"]["totalTokenCount"], 3);
	}

	#[test]
	fn response_rendering_produces_candidates() {
		let canonical = json!({
			"choices": [{"message": {"role": "assistant", "content": "hi"}}],
			"usage": {"prompt_tokens": 1, "completion_tokens": 2, "total_tokens": 3}
		});
		let out = render_response(&canonical);
		assert_eq!(out["candidates"][0]["content"]["parts"][0]["text"], "hi");
		assert_eq!(out["usageMetadata"]["promptTokenCount"], 1);
	}
}
