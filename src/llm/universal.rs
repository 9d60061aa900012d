//! Canonical OpenAI-Chat-Completions-shaped types.
//!
//! Every dialect parses into these and every engine renders out of them.
//! Streaming uses the delta-chunk shape plus a `[DONE]` sentinel.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
	System,
	User,
	Assistant,
	Tool,
	Function,
	/// Gemini's assistant-side role; normalized to `Assistant` at the dialect
	/// boundary but kept so a native payload round-trips.
	Model,
}

impl Role {
	pub fn as_str(&self) -> &'static str {
		match self {
			Role::System => "system",
			Role::User => "user",
			Role::Assistant => "assistant",
			Role::Tool => "tool",
			Role::Function => "function",
			Role::Model => "model",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
	Text(String),
	Parts(Vec<ContentPart>),
}

impl Content {
	/// Concatenated text of the message, ignoring non-text parts.
	pub fn text(&self) -> String {
		match self {
			Content::Text(t) => t.clone(),
			Content::Parts(parts) => parts
				.iter()
				.filter_map(|p| match p {
					ContentPart::Text { text } => Some(text.as_str()),
					_ => None,
				})
				.collect::<Vec<_>>()
				.join(""),
		}
	}

	pub fn is_empty(&self) -> bool {
		match self {
			Content::Text(t) => t.is_empty(),
			Content::Parts(p) => p.is_empty(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
	Text { text: String },
	ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
	pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
	pub role: Role,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub content: Option<Content>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tool_calls: Option<Vec<ToolCall>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tool_call_id: Option<String>,
	/// Echoed Gemini function-call signature from a previous model turn.
	#[serde(
		default,
		rename = "thoughtSignature",
		skip_serializing_if = "Option::is_none"
	)]
	pub thought_signature: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub reasoning_content: Option<String>,
}

impl Message {
	pub fn text(role: Role, content: impl Into<String>) -> Self {
		Message {
			role,
			name: None,
			content: Some(Content::Text(content.into())),
			tool_calls: None,
			tool_call_id: None,
			thought_signature: None,
			reasoning_content: None,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
	pub id: String,
	#[serde(rename = "type")]
	pub r#type: String,
	pub function: FunctionCall,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
	pub name: String,
	/// JSON-encoded arguments object.
	pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
	#[serde(rename = "type")]
	pub r#type: String,
	pub function: FunctionDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
	pub name: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub description: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub parameters: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamOptions {
	pub include_usage: bool,
}

/// The canonical request. Unknown fields ride along in `extra_body` so a
/// provider-specific knob survives the round trip.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Request {
	pub model: String,
	#[serde(default)]
	pub messages: Vec<Message>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub stream: Option<bool>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub stream_options: Option<StreamOptions>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub temperature: Option<f64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub top_p: Option<f64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub top_k: Option<u32>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub max_tokens: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub max_completion_tokens: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tools: Option<Vec<Tool>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tool_choice: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub reasoning: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub thinking: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub stop: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub seed: Option<i64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub response_format: Option<Value>,
	#[serde(flatten)]
	pub extra_body: serde_json::Map<String, Value>,
}

impl Request {
	pub fn stream(&self) -> bool {
		self.stream.unwrap_or(false)
	}

	pub fn max_tokens(&self) -> Option<u64> {
		self.max_completion_tokens.or(self.max_tokens)
	}

	pub fn stop_sequences(&self) -> Vec<String> {
		match &self.stop {
			Some(Value::String(s)) => vec![s.clone()],
			Some(Value::Array(a)) => a
				.iter()
				.filter_map(|v| v.as_str().map(str::to_string))
				.collect(),
			_ => vec![],
		}
	}

	pub fn last_message_role(&self) -> Option<Role> {
		self.messages.last().map(|m| m.role)
	}
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
	#[serde(default)]
	pub prompt_tokens: i64,
	#[serde(default)]
	pub completion_tokens: i64,
	#[serde(default)]
	pub total_tokens: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
	pub role: Role,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub content: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub reasoning_content: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
	pub index: u32,
	pub message: ResponseMessage,
	pub finish_reason: Option<String>,
}

/// Canonical non-stream response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
	pub id: String,
	pub object: String,
	pub created: i64,
	pub model: String,
	pub choices: Vec<Choice>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub usage: Option<Usage>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub system_fingerprint: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Delta {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub role: Option<Role>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub content: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub reasoning_content: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallDelta {
	pub index: u32,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub id: Option<String>,
	#[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
	pub r#type: Option<String>,
	pub function: FunctionCallDelta,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionCallDelta {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub arguments: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChoice {
	pub index: u32,
	pub delta: Delta,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub finish_reason: Option<String>,
}

/// Canonical SSE chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamResponse {
	pub id: String,
	pub object: String,
	pub created: i64,
	pub model: String,
	pub choices: Vec<StreamChoice>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub usage: Option<Usage>,
}

pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// Frame a serializable payload as an SSE data line.
pub fn sse_frame<T: Serialize>(payload: &T) -> String {
	match serde_json::to_string(payload) {
		Ok(json) => format!("data: {json}\n\n"),
		Err(_) => String::new(),
	}
}

pub struct ChunkBuilder {
	id: String,
	created: i64,
	model: String,
}

impl ChunkBuilder {
	pub fn new(model: &str) -> Self {
		ChunkBuilder {
			id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
			created: chrono::Utc::now().timestamp(),
			model: model.to_string(),
		}
	}

	pub fn with_id(mut self, id: impl Into<String>) -> Self {
		self.id = id.into();
		self
	}

	pub fn chunk(&self, delta: Delta, finish_reason: Option<String>) -> StreamResponse {
		StreamResponse {
			id: self.id.clone(),
			object: "chat.completion.chunk".to_string(),
			created: self.created,
			model: self.model.clone(),
			choices: vec![StreamChoice {
				index: 0,
				delta,
				finish_reason,
			}],
			usage: None,
		}
	}

	pub fn content(&self, text: impl Into<String>) -> StreamResponse {
		self.chunk(
			Delta {
				content: Some(text.into()),
				..Default::default()
			},
			None,
		)
	}

	pub fn reasoning(&self, text: impl Into<String>) -> StreamResponse {
		self.chunk(
			Delta {
				reasoning_content: Some(text.into()),
				..Default::default()
			},
			None,
		)
	}

	pub fn usage(&self, usage: Usage) -> StreamResponse {
		StreamResponse {
			id: self.id.clone(),
			object: "chat.completion.chunk".to_string(),
			created: self.created,
			model: self.model.clone(),
			choices: vec![],
			usage: Some(usage),
		}
	}

	pub fn finish(&self, reason: impl Into<String>) -> StreamResponse {
		self.chunk(Delta::default(), Some(reason.into()))
	}
}

/// Assemble a canonical non-stream response the way the engines do when the
/// upstream wire format is not OpenAI-shaped.
#[allow(clippy::too_many_arguments)]
pub fn build_response(
	model: &str,
	role: Role,
	content: Option<String>,
	reasoning_content: Option<String>,
	tool_calls: Option<Vec<ToolCall>>,
	finish_reason: Option<String>,
	usage: Usage,
) -> Response {
	Response {
		id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
		object: "chat.completion".to_string(),
		created: chrono::Utc::now().timestamp(),
		model: model.to_string(),
		choices: vec![Choice {
			index: 0,
			message: ResponseMessage {
				role,
				content,
				reasoning_content,
				tool_calls,
			},
			finish_reason,
		}],
		usage: Some(usage),
		system_fingerprint: None,
	}
}
